use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::Result;
use crate::document::CodeBlock;

use super::directory;
use super::interpreter;

/// Execution strategy for a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandMode {
    /// The source is a list of command lines turned into a single `-c`
    /// script at execution time. Used for shell languages.
    Inline,
    /// The source is a script written to a temporary file whose path is
    /// appended as the last argument. Used for everything else.
    File,
}

/// Source payload of a configuration. The shape is tied to the mode:
/// `Inline` carries command lines, `File` carries a full script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    Commands(Vec<String>),
    Script(String),
}

/// A serializable plan to execute a program. Built once, never mutated
/// afterwards; normalization happens at execution time without touching
/// the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramConfig {
    /// Program path; resolved against `PATH` when not absolute.
    pub program_name: String,
    /// Leading arguments (for interpreters such as `deno run`).
    pub arguments: Vec<String>,
    pub directory: Option<PathBuf>,
    /// `KEY=VALUE` entries layered over the host environment.
    pub env: Vec<String>,
    pub mode: CommandMode,
    pub source: Source,
    pub interactive: bool,
    /// Block name, used for logging.
    pub name: String,
}

/// Request-level inputs to [`ProgramConfig::from_code_block`].
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Base directory of the request; both a working-directory candidate
    /// and the base for relative candidates.
    pub directory: Option<PathBuf>,
    /// Forces the interactive flag on regardless of the block.
    pub interactive: bool,
}

impl ProgramConfig {
    /// Builds a configuration from a code block: the inline shell
    /// strategy for shell languages, the file strategy otherwise.
    pub fn from_code_block(block: &CodeBlock, options: &BuildOptions) -> Result<Self> {
        let (program_name, arguments) = interpreter::resolve_program(block)?;

        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(cwd) = block.cwd() {
            candidates.push(PathBuf::from(cwd));
        }
        if let Some(cwd) = &block.frontmatter().cwd {
            candidates.push(PathBuf::from(cwd));
        }
        if let Some(dir) = &options.directory {
            candidates.push(dir.clone());
        }
        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd);
        }
        let directory = directory::resolve_dir(options.directory.as_deref(), &candidates);

        let (mode, source) = if interpreter::is_shell_language(block.language()) {
            (CommandMode::Inline, Source::Commands(block.lines().to_vec()))
        } else {
            (CommandMode::File, Source::Script(block.content().to_owned()))
        };

        Ok(Self {
            program_name,
            arguments,
            directory,
            env: Vec::new(),
            mode,
            source,
            interactive: options.interactive || block.interactive(),
            name: block.name().to_owned(),
        })
    }
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
    fn shell_block_uses_the_inline_strategy() {
        let cfg = ProgramConfig::from_code_block(
            &block("```sh {\"name\":\"greet\"}\necho one\necho two\n```\n"),
            &BuildOptions::default(),
        )
        .unwrap();

        assert_eq!(cfg.mode, CommandMode::Inline);
        assert_eq!(
            cfg.source,
            Source::Commands(vec!["echo one".to_owned(), "echo two".to_owned()])
        );
        assert!(cfg.program_name.ends_with("bash") || cfg.program_name.ends_with("sh"));
        assert_eq!(cfg.name, "greet");
        assert!(!cfg.interactive);
    }

    #[test]
    fn non_shell_block_uses_the_file_strategy() {
        let cfg = ProgramConfig::from_code_block(
            &block("```python\nprint('x')\n```\n"),
            &BuildOptions::default(),
        );
        // python may be missing from the build environment
        let Ok(cfg) = cfg else { return };

        assert_eq!(cfg.mode, CommandMode::File);
        assert_eq!(cfg.source, Source::Script("print('x')\n".to_owned()));
    }

    #[test]
    fn block_cwd_wins_when_it_exists() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let source = format!("```sh {{\"cwd\":\"{}\"}}\necho\n```\n", sub.display());
        let cfg = ProgramConfig::from_code_block(
            &block(&source),
            &BuildOptions {
                directory: Some(dir.path().to_path_buf()),
                interactive: false,
            },
        )
        .unwrap();
        assert_eq!(cfg.directory, Some(sub));
    }

    #[test]
    fn missing_candidates_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let source = "```sh {\"cwd\":\"does-not-exist\"}\necho\n```\n";
        let cfg = ProgramConfig::from_code_block(
            &block(source),
            &BuildOptions {
                directory: Some(dir.path().to_path_buf()),
                interactive: false,
            },
        )
        .unwrap();
        assert_eq!(cfg.directory, Some(dir.path().to_path_buf()));
    }

    #[test]
    fn request_can_force_interactive() {
        let cfg = ProgramConfig::from_code_block(
            &block("```sh\necho\n```\n"),
            &BuildOptions {
                directory: None,
                interactive: true,
            },
        )
        .unwrap();
        assert!(cfg.interactive);
    }
}
