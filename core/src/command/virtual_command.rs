use std::io;
use std::os::fd::AsRawFd;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;

use crate::CancelReader;
use crate::Result;
use crate::RunbookErr;
use crate::cancel_reader::CancelHandle;

use super::ProgramConfig;
use super::StopSignal;
use super::normalizer::ArgsNormalizer;
use super::normalizer::compose_env;
use super::pty;
use super::pty::PtyPrimary;
use super::unix;

const COPY_BUF_SIZE: usize = 8192;

/// I/O wiring for a [`VirtualCommand`]. The child talks to a terminal;
/// these streams talk to the terminal's other end.
#[derive(Default)]
pub struct VirtualCommandOptions {
    /// Bytes fed into the terminal. The reader is wrapped so that a
    /// pending read can be released once the child is gone, without
    /// requiring the reader itself to be cancellable.
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// Receives everything the child writes, after the terminal's
    /// transformations (output CRLF, no local echo).
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Additional `KEY=VALUE` entries, applied last.
    pub env: Vec<String>,
}

/// Runs a child process attached to a freshly opened pseudo-terminal.
/// Used for interactive execution.
pub struct VirtualCommand {
    cfg: ProgramConfig,
    opts: VirtualCommandOptions,
    normalizer: ArgsNormalizer,
    child: Option<Child>,
    pid: Option<i32>,
    primary: Option<Arc<PtyPrimary>>,
    stdin_cancel: Option<CancelHandle>,
    copy_loops: Vec<JoinHandle<()>>,
    io_err: Arc<Mutex<Option<io::Error>>>,
    exited: Arc<AtomicBool>,
}

impl VirtualCommand {
    pub fn new(cfg: ProgramConfig, options: VirtualCommandOptions) -> Self {
        Self {
            cfg,
            opts: options,
            normalizer: ArgsNormalizer::new(),
            child: None,
            pid: None,
            primary: None,
            stdin_cancel: None,
            copy_loops: Vec::new(),
            io_err: Arc::new(Mutex::new(None)),
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.pid.is_some() && !self.exited.load(Ordering::SeqCst)
    }

    /// A cloneable handle for concurrent control: winsize updates and
    /// stop signals from a task other than the one calling `wait`.
    pub fn handle(&self) -> Result<CommandHandle> {
        let pid = self.pid.ok_or(RunbookErr::NotStarted)?;
        let primary = self.primary.clone().ok_or(RunbookErr::NotStarted)?;
        Ok(CommandHandle {
            pid,
            primary,
            exited: Arc::clone(&self.exited),
        })
    }

    /// Opens the terminal pair and spawns the child attached to it.
    pub async fn start(&mut self) -> Result<()> {
        let (primary, secondary) = pty::open().map_err(RunbookErr::OpenPty)?;
        let primary = Arc::new(primary);

        let args = self.normalizer.normalize(&self.cfg)?;

        let mut command = Command::new(&self.cfg.program_name);
        command.args(&args);
        if let Some(dir) = &self.cfg.directory {
            command.current_dir(dir);
        }
        command.env_clear();
        command.envs(compose_env(&self.cfg, &self.opts.env));

        let secondary_raw = secondary.as_raw_fd();
        let stdin_fd = secondary.try_clone().map_err(RunbookErr::OpenPty)?;
        let stdout_fd = secondary.try_clone().map_err(RunbookErr::OpenPty)?;
        command.stdin(Stdio::from(stdin_fd));
        command.stdout(Stdio::from(stdout_fd));
        command.stderr(Stdio::from(secondary));

        // The child starts a new session and takes the secondary as its
        // controlling terminal, so terminal-delivered signals reach its
        // whole foreground group.
        //
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            command.pre_exec(move || {
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(secondary_raw, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        debug!(
            program = %self.cfg.program_name,
            ?args,
            name = %self.cfg.name,
            "starting a virtual command"
        );

        let child = match command.spawn() {
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

        // Close the parent's copies of the secondary now that the child
        // holds its own; the primary must observe hangup when the child
        // exits.
        drop(command);

        if let Some(reader) = self.opts.stdin.take() {
            let (mut reader, cancel) = CancelReader::new(reader);
            self.stdin_cancel = Some(cancel);
            let primary = Arc::clone(&primary);
            let io_err = Arc::clone(&self.io_err);
            self.copy_loops.push(tokio::spawn(async move {
                let mut buf = [0u8; COPY_BUF_SIZE];
                loop {
                    match reader.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if let Err(err) = primary.write_all(&buf[..n]).await {
                                if !is_clean_ending(&err) {
                                    record_first(&io_err, err);
                                }
                                break;
                            }
                        }
                        Err(err) => {
                            record_first(&io_err, err);
                            break;
                        }
                    }
                }
                debug!("finished copying from stdin to the terminal");
            }));
        }

        if let Some(mut writer) = self.opts.stdout.take() {
            let primary = Arc::clone(&primary);
            let io_err = Arc::clone(&self.io_err);
            self.copy_loops.push(tokio::spawn(async move {
                let mut buf = [0u8; COPY_BUF_SIZE];
                loop {
                    match primary.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if let Err(err) = writer.write_all(&buf[..n]).await {
                                if !is_clean_ending(&err) {
                                    record_first(&io_err, err);
                                }
                                break;
                            }
                        }
                        // Linux reports EIO on the primary once no
                        // secondary descriptor remains open.
                        Err(err) if is_clean_ending(&err) => break,
                        Err(err) => {
                            record_first(&io_err, err);
                            break;
                        }
                    }
                }
                let _ = writer.shutdown().await;
                debug!("finished copying from the terminal to stdout");
            }));
        }

        self.primary = Some(primary);
        self.child = Some(child);
        Ok(())
    }

    /// Winsize updates are idempotent and order-insensitive. Without a
    /// terminal this is a no-op.
    pub fn set_winsize(&self, rows: u16, cols: u16, x: u16, y: u16) -> Result<()> {
        if let Some(primary) = &self.primary {
            primary.set_winsize(rows, cols, x, y)?;
        }
        Ok(())
    }

    pub fn stop_with_signal(&self, signal: StopSignal) -> Result<()> {
        let pid = self.pid.ok_or(RunbookErr::NotStarted)?;
        stop(pid, self.primary.as_deref(), signal)
    }

    /// Waits for the child, releases the stdin wrapper, joins both copy
    /// loops, and removes the temporary script. Copy-loop errors are
    /// surfaced only when the child itself succeeded.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let child = self.child.as_mut().ok_or(RunbookErr::NotStarted)?;
        let status = child.wait().await;
        self.exited.store(true, Ordering::SeqCst);

        if let Some(cancel) = self.stdin_cancel.take() {
            cancel.cancel();
        }
        for task in self.copy_loops.drain(..) {
            let _ = task.await;
        }
        self.normalizer.cleanup();
        self.primary = None;

        let status = status?;

        let copy_err = {
            let mut guard = match self.io_err.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(err) = copy_err {
            if status.success() {
                return Err(RunbookErr::Io(err));
            }
            info!("ignoring copy error after child failure: {err}");
        }

        Ok(status)
    }

    #[cfg(test)]
    pub(crate) fn primary_winsize(&self) -> Option<(u16, u16)> {
        self.primary
            .as_ref()
            .and_then(|primary| primary.winsize().ok())
    }
}

/// Control surface shared with tasks that do not own the command.
#[derive(Clone)]
pub struct CommandHandle {
    pid: i32,
    primary: Arc<PtyPrimary>,
    exited: Arc<AtomicBool>,
}

impl CommandHandle {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    pub fn set_winsize(&self, rows: u16, cols: u16, x: u16, y: u16) -> Result<()> {
        Ok(self.primary.set_winsize(rows, cols, x, y)?)
    }

    pub fn stop_with_signal(&self, signal: StopSignal) -> Result<()> {
        stop(self.pid, Some(&self.primary), signal)
    }
}

fn stop(pid: i32, primary: Option<&PtyPrimary>, signal: StopSignal) -> Result<()> {
    if signal == StopSignal::Interrupt {
        if let Some(primary) = primary {
            primary.inject_interrupt();
        }
    }
    unix::stop_process(pid, signal)
}

fn record_first(slot: &Mutex<Option<io::Error>>, err: io::Error) {
    let mut guard = match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if guard.is_none() {
        *guard = Some(err);
    }
}

fn is_clean_ending(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
        || matches!(
            err.kind(),
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
        )
}
