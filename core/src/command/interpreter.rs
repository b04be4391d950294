//! Maps a code block's language tag to concrete interpreter candidates.

use crate::Result;
use crate::RunbookErr;
use crate::document::CodeBlock;

/// Shell languages get the inline `-c` strategy and may inherit the
/// document frontmatter's `shell`.
pub fn is_shell_language(language: &str) -> bool {
    matches!(
        language.to_lowercase().as_str(),
        // shellscripts
        "sh" | "bash" | "zsh" | "ksh" | "shell" | "shellscript"
        // dos
        | "bat" | "cmd"
        // powershell
        | "powershell" | "pwsh"
        // fish
        | "fish"
    )
}

fn builtin_interpreters(language: &str) -> &'static [&'static str] {
    match language {
        "js" | "javascript" | "jsx" | "javascriptreact" => &["node"],
        "ts" | "typescript" | "tsx" | "typescriptreact" => &["ts-node", "deno run", "bun run"],
        "sh" | "bash" => &["bash", "sh"],
        "ksh" => &["ksh"],
        "zsh" => &["zsh"],
        "fish" => &["fish"],
        "powershell" | "pwsh" => &["powershell"],
        "cmd" | "dos" => &["cmd"],
        "lua" => &["lua"],
        "perl" => &["perl"],
        "php" => &["php"],
        "python" | "py" => &["python3", "python"],
        "ruby" | "rb" => &["ruby"],
        _ => &[],
    }
}

/// Candidate interpreter command strings for a block, highest priority
/// first. A block-level override always wins; shell languages fall back
/// to the frontmatter shell before the built-in mapping.
pub fn interpreters_from_block(block: &CodeBlock) -> Result<Vec<String>> {
    let language = block.language();

    let mut interpreter = String::new();

    if is_shell_language(language) {
        if let Some(shell) = &block.frontmatter().shell {
            interpreter = shell.clone();
        }
    }

    if let Some(value) = block.interpreter() {
        if !value.is_empty() {
            interpreter = value.to_owned();
        }
    }

    if !interpreter.is_empty() {
        return Ok(vec![interpreter]);
    }

    let candidates = builtin_interpreters(language);
    if candidates.is_empty() {
        return Err(RunbookErr::UnsupportedLanguage(language.to_owned()));
    }
    Ok(candidates.iter().map(|c| (*c).to_owned()).collect())
}

/// Handles interpreters such as `"deno run"`: the first word is the
/// program, the rest are leading arguments.
pub fn parse_interpreter(interpreter: &str) -> (String, Vec<String>) {
    let mut parts = interpreter.split_whitespace();
    let program = parts.next().unwrap_or_default().to_owned();
    let args = parts.map(str::to_owned).collect();
    (program, args)
}

/// Resolves the first candidate that exists on `PATH` into an absolute
/// program path plus its leading arguments.
pub fn resolve_program(block: &CodeBlock) -> Result<(String, Vec<String>)> {
    let candidates = interpreters_from_block(block)?;

    for candidate in &candidates {
        let (program, args) = parse_interpreter(candidate);
        if let Ok(path) = which::which(&program) {
            return Ok((path.to_string_lossy().into_owned(), args));
        }
    }

    Err(RunbookErr::UnknownInterpreters(candidates))
}

/// Shell safety preamble keyed by the interpreter's basename.
pub(crate) fn shell_options_from_program(program_path: &str) -> &'static str {
    match shell_from_program_path(program_path).as_str() {
        "bash" | "zsh" | "ksh" => "set -e -o pipefail",
        "sh" => "set -e",
        _ => "",
    }
}

fn shell_from_program_path(program_path: &str) -> String {
    let file = std::path::Path::new(program_path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default();
    file.to_owned()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::document::Document;
    use pretty_assertions::assert_eq;

    fn block(source: &str) -> CodeBlock {
        Document::parse(source).code_blocks()[0].clone()
    }

    #[test]
    fn shell_languages_are_case_insensitive() {
        for lang in ["sh", "Bash", "ZSH", "shellscript", "pwsh", "fish"] {
            assert!(is_shell_language(lang), "{lang}");
        }
        assert!(!is_shell_language("python"));
    }

    #[test]
    fn block_override_wins_over_frontmatter_shell() {
        let source = "---\nshell: zsh\n---\n```sh {\"interpreter\":\"bash -x\"}\necho\n```\n";
        let interpreters = interpreters_from_block(&block(source)).unwrap();
        assert_eq!(interpreters, ["bash -x"]);
    }

    #[test]
    fn frontmatter_shell_applies_to_shell_languages_only() {
        let shell_block = block("---\nshell: zsh\n---\n```sh\necho\n```\n");
        assert_eq!(interpreters_from_block(&shell_block).unwrap(), ["zsh"]);

        let py_block = block("---\nshell: zsh\n---\n```python\nprint()\n```\n");
        assert_eq!(
            interpreters_from_block(&py_block).unwrap(),
            ["python3", "python"]
        );
    }

    #[test]
    fn unsupported_language_fails() {
        let err = interpreters_from_block(&block("```brainfuck\n+\n```\n")).unwrap_err();
        assert!(matches!(err, RunbookErr::UnsupportedLanguage(lang) if lang == "brainfuck"));
    }

    #[test]
    fn parses_interpreter_with_arguments() {
        assert_eq!(
            parse_interpreter("deno run"),
            ("deno".to_owned(), vec!["run".to_owned()])
        );
        assert_eq!(parse_interpreter("node"), ("node".to_owned(), vec![]));
    }

    #[test]
    fn resolves_an_existing_shell() {
        let (program, args) = resolve_program(&block("```sh\necho\n```\n")).unwrap();
        assert!(program.ends_with("bash") || program.ends_with("sh"));
        assert!(args.is_empty());
    }

    #[test]
    fn unknown_interpreters_carry_the_tried_list() {
        let source = "```sh {\"interpreter\":\"definitely-not-a-real-shell\"}\necho\n```\n";
        let err = resolve_program(&block(source)).unwrap_err();
        assert!(
            matches!(err, RunbookErr::UnknownInterpreters(tried) if tried == ["definitely-not-a-real-shell"])
        );
    }

    #[test]
    fn shell_preamble_by_basename() {
        assert_eq!(shell_options_from_program("/bin/bash"), "set -e -o pipefail");
        assert_eq!(shell_options_from_program("/usr/bin/zsh"), "set -e -o pipefail");
        assert_eq!(shell_options_from_program("/bin/sh"), "set -e");
        assert_eq!(shell_options_from_program("/usr/bin/python3"), "");
    }
}
