use std::process::ExitStatus;
use std::process::Stdio;

use tokio::io::AsyncWrite;
use tokio::process::Child;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;

use crate::Result;
use crate::RunbookErr;

use super::ProgramConfig;
use super::StopSignal;
use super::normalizer::ArgsNormalizer;
use super::normalizer::compose_env;

/// I/O wiring for a [`NativeCommand`]. The child's streams go straight
/// to these; no terminal is allocated.
#[derive(Default)]
pub struct NativeCommandOptions {
    /// Caller-owned stdin. The descriptor is duplicated (close-on-exec)
    /// before being handed to the child so the child's lifecycle cannot
    /// close the caller's file.
    pub stdin: Option<std::fs::File>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Additional `KEY=VALUE` entries, applied last.
    pub env: Vec<String>,
}

/// Runs a child process without a terminal. Used for non-interactive
/// execution.
pub struct NativeCommand {
    cfg: ProgramConfig,
    opts: NativeCommandOptions,
    normalizer: ArgsNormalizer,
    child: Option<Child>,
    pid: Option<i32>,
    copiers: Vec<JoinHandle<()>>,
}

impl NativeCommand {
    pub fn new(cfg: ProgramConfig, options: NativeCommandOptions) -> Self {
        Self {
            cfg,
            opts: options,
            normalizer: ArgsNormalizer::new(),
            child: None,
            pid: None,
            copiers: Vec::new(),
        }
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Spawns the child. Non-blocking; the exit status is observed by
    /// [`NativeCommand::wait`].
    pub async fn start(&mut self) -> Result<()> {
        let args = self.normalizer.normalize(&self.cfg)?;

        let mut command = Command::new(&self.cfg.program_name);
        command.args(&args);
        if let Some(dir) = &self.cfg.directory {
            command.current_dir(dir);
        }
        command.env_clear();
        command.envs(compose_env(&self.cfg, &self.opts.env));

        match self.opts.stdin.take() {
            Some(file) => {
                // try_clone dups the descriptor with close-on-exec set on
                // the copy; the caller keeps the original.
                let dup = file.try_clone().map_err(RunbookErr::DupStdin)?;
                command.stdin(Stdio::from(dup));
            }
            None => {
                command.stdin(Stdio::null());
            }
        }
        command.stdout(stdio_for(&self.opts.stdout));
        command.stderr(stdio_for(&self.opts.stderr));

        // A dedicated process group makes stop reach the command's
        // children too. setsid is not used here: it breaks interactive
        // interpreters that expect the caller's terminal.
        #[cfg(unix)]
        command.process_group(0);

        debug!(program = %self.cfg.program_name, ?args, name = %self.cfg.name, "starting a native command");

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.normalizer.cleanup();
                return Err(RunbookErr::Start {
                    program: self.cfg.program_name.clone(),
                    source,
                });
            }
        };
        self.pid = child.id().map(|pid| pid as i32);

        if let Some(mut writer) = self.opts.stdout.take() {
            if let Some(mut stdout) = child.stdout.take() {
                self.copiers.push(tokio::spawn(async move {
                    if let Err(err) = tokio::io::copy(&mut stdout, &mut writer).await {
                        info!("failed to copy stdout: {err}");
                    }
                }));
            }
        }
        if let Some(mut writer) = self.opts.stderr.take() {
            if let Some(mut stderr) = child.stderr.take() {
                self.copiers.push(tokio::spawn(async move {
                    if let Err(err) = tokio::io::copy(&mut stderr, &mut writer).await {
                        info!("failed to copy stderr: {err}");
                    }
                }));
            }
        }

        self.child = Some(child);
        Ok(())
    }

    /// Blocks until the child exits, then joins the copy tasks. The
    /// temporary script, if any, is removed no matter the outcome.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let child = self.child.as_mut().ok_or(RunbookErr::NotStarted)?;
        let status = child.wait().await;

        self.normalizer.cleanup();
        for copier in self.copiers.drain(..) {
            let _ = copier.await;
        }

        Ok(status?)
    }

    #[cfg(unix)]
    pub fn stop_with_signal(&self, signal: StopSignal) -> Result<()> {
        let pid = self.pid.ok_or(RunbookErr::NotStarted)?;
        super::unix::stop_process(pid, signal)
    }
}

fn stdio_for(writer: &Option<Box<dyn AsyncWrite + Send + Unpin>>) -> Stdio {
    if writer.is_some() {
        Stdio::piped()
    } else {
        Stdio::inherit()
    }
}
