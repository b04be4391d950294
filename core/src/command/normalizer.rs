use std::collections::HashMap;
use std::io::Write;

use tempfile::TempPath;
use tracing::info;

use crate::Result;
use crate::RunbookErr;

use super::CommandMode;
use super::ProgramConfig;
use super::Source;
use super::interpreter::shell_options_from_program;

/// Expands a configuration into the final argv.
///
/// For `Inline` a single `-c` script is synthesized from the command
/// lines, prefixed with the shell safety preamble. For `File` the script
/// is written to a temporary file (0600 under the OS temp dir) whose
/// path becomes the last argument; the file is tracked and removed by
/// [`ArgsNormalizer::cleanup`] exactly once.
pub(crate) struct ArgsNormalizer {
    script_file: Option<TempPath>,
}

impl ArgsNormalizer {
    pub(crate) fn new() -> Self {
        Self { script_file: None }
    }

    pub(crate) fn normalize(&mut self, cfg: &ProgramConfig) -> Result<Vec<String>> {
        let mut args = cfg.arguments.clone();

        match (cfg.mode, &cfg.source) {
            (CommandMode::Inline, Source::Commands(lines)) => {
                let script = build_inline_script(&cfg.program_name, lines);
                if !script.is_empty() {
                    args.push("-c".to_owned());
                    args.push(script);
                }
            }
            (CommandMode::File, Source::Script(script)) => {
                let path = create_script_file(script)?;
                args.push(path.to_string_lossy().into_owned());
                self.script_file = Some(path);
            }
            (mode, source) => {
                panic!("invariant: mode {mode:?} is incompatible with source {source:?}")
            }
        }

        Ok(args)
    }

    /// Removes the temporary script, if any. Removal errors are logged
    /// and ignored.
    pub(crate) fn cleanup(&mut self) {
        if let Some(path) = self.script_file.take() {
            if let Err(err) = path.close() {
                info!("failed to remove temporary script file: {err}");
            }
        }
    }
}

impl Drop for ArgsNormalizer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn build_inline_script(program_name: &str, lines: &[String]) -> String {
    let mut script = String::new();

    let options = shell_options_from_program(program_name);
    if !options.is_empty() {
        script.push_str(options);
        script.push_str("\n\n");
    }

    for line in lines {
        script.push_str(line);
        script.push('\n');
    }

    script
}

fn create_script_file(script: &str) -> Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("runbook-script-")
        .tempfile()
        .map_err(RunbookErr::CreateScriptFile)?;
    file.write_all(script.as_bytes())
        .map_err(RunbookErr::CreateScriptFile)?;
    file.flush().map_err(RunbookErr::CreateScriptFile)?;
    Ok(file.into_temp_path())
}

/// Final child environment: host environment, then the configuration's
/// entries, then the caller's, later entries winning per key.
pub(crate) fn compose_env(cfg: &ProgramConfig, caller_env: &[String]) -> Vec<(String, String)> {
    let mut merged: HashMap<String, String> = HashMap::new();

    for (key, value) in std::env::vars() {
        merged.insert(key, value);
    }
    for entry in cfg.env.iter().chain(caller_env) {
        if let Some((key, value)) = entry.split_once('=') {
            merged.insert(key.to_owned(), value.to_owned());
        }
    }

    merged.into_iter().collect()
}
