#![cfg(unix)]

use std::io;

use nix::sys::signal::Signal;
use nix::sys::signal::kill;
use nix::sys::signal::killpg;
use nix::unistd::Pid;
use tracing::info;

use crate::Result;
use crate::RunbookErr;

use super::StopSignal;

impl StopSignal {
    pub(crate) fn as_signal(self) -> Signal {
        match self {
            StopSignal::Interrupt => Signal::SIGINT,
            StopSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// Signals the process group first; stopping interpreters that spawn
/// children only works reliably at the group level. Falls back to the
/// process itself, then to a forced kill.
pub(crate) fn stop_process(pid: i32, stop: StopSignal) -> Result<()> {
    let target = Pid::from_raw(pid);
    let signal = stop.as_signal();

    if let Err(err) = killpg(target, signal) {
        info!("failed to signal process group {pid}: {err}; signaling the process");
        if let Err(err) = kill(target, signal) {
            info!("failed to signal process {pid}: {err}; killing it");
            kill(target, Signal::SIGKILL).map_err(|errno| RunbookErr::Signal {
                pid,
                source: io::Error::from(errno),
            })?;
        }
    }

    Ok(())
}
