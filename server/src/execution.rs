//! Per-call execution state: the command, its ring-buffered output, and
//! its stdin pipe.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::io::AsyncWriteExt;
use tokio::io::SimplexStream;
use tokio::io::WriteHalf;
use tokio::sync::Mutex;
use tracing::info;

use runbook_core::RingBufferReader;
use runbook_core::RunbookErr;
use runbook_core::command::BuildOptions;
use runbook_core::command::CommandHandle;
use runbook_core::command::CommandMode;
use runbook_core::command::ProgramConfig;
use runbook_core::command::Source;
use runbook_core::command::VirtualCommand;
use runbook_core::command::VirtualCommandOptions;
use runbook_core::document::CodeBlock;
use runbook_core::document::Document;
use runbook_core::project;
use runbook_core::ring_buffer;
use runbook_protocol as pb;

/// Ring buffer between the command and the handler. A full buffer
/// back-pressures the child via the terminal rather than dropping data.
pub(crate) const RING_BUFFER_SIZE: usize = 8192 << 10; // 8 MiB

/// Upper bound for a single `stdout_data` chunk. Intentionally small:
/// messages are typically short and a syscall-sized buffer avoids
/// multi-megabyte allocations per frame.
pub(crate) const MSG_BUFFER_SIZE: usize = 32 << 10; // 32 KiB

const STDIN_PIPE_SIZE: usize = 64 << 10;

pub(crate) type SharedStdin = Arc<Mutex<Option<WriteHalf<SimplexStream>>>>;

pub(crate) struct Execution {
    pub(crate) id: String,
    cmd: VirtualCommand,
    stdout: Option<RingBufferReader>,
    stdin: SharedStdin,
}

impl Execution {
    /// Builds the command for the opening request: either from the
    /// request's own `ProgramConfig` or by resolving a block from a
    /// project or document.
    pub(crate) fn new(req: &pb::ExecuteRequest) -> Result<Self, RunbookErr> {
        let cfg = config_from_request(req)?;

        let (stdout_writer, stdout_reader) = ring_buffer(RING_BUFFER_SIZE);
        let (stdin_reader, stdin_writer) = if cfg.interactive {
            let (reader, writer) = tokio::io::simplex(STDIN_PIPE_SIZE);
            (Some(reader), Some(writer))
        } else {
            (None, None)
        };

        let cmd = VirtualCommand::new(
            cfg,
            VirtualCommandOptions {
                stdin: stdin_reader
                    .map(|reader| Box::new(reader) as Box<dyn AsyncRead + Send + Unpin>),
                stdout: Some(Box::new(stdout_writer)),
                env: req.env.clone(),
            },
        );

        Ok(Self {
            id: ulid::Ulid::new().to_string(),
            cmd,
            stdout: Some(stdout_reader),
            stdin: Arc::new(Mutex::new(stdin_writer)),
        })
    }

    pub(crate) async fn start(&mut self) -> Result<(), RunbookErr> {
        self.cmd.start().await
    }

    pub(crate) fn pid(&self) -> i64 {
        i64::from(self.cmd.pid().unwrap_or_default())
    }

    pub(crate) fn handle(&self) -> Result<CommandHandle, RunbookErr> {
        self.cmd.handle()
    }

    pub(crate) fn stdin(&self) -> SharedStdin {
        Arc::clone(&self.stdin)
    }

    pub(crate) fn take_stdout(&mut self) -> Option<RingBufferReader> {
        self.stdout.take()
    }

    /// Waits for the child, then closes the stdin pipe so any copy loop
    /// blocked on it is released.
    pub(crate) async fn wait(&mut self) -> Result<ExitStatus, RunbookErr> {
        let result = self.cmd.wait().await;
        if let Some(mut writer) = self.stdin.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        result
    }
}

/// Writes stdin bytes; failures are logged and ignored because the
/// child may have legitimately closed its read end already.
pub(crate) async fn write_input(stdin: &SharedStdin, data: &[u8]) {
    let mut guard = stdin.lock().await;
    match guard.as_mut() {
        Some(writer) => {
            if let Err(err) = writer.write_all(data).await {
                info!("failed to write to stdin; ignoring: {err}");
            }
        }
        None => info!("input data provided but stdin is not available"),
    }
}

/// Exit-code taxonomy: the child's own status when it exited normally,
/// 130/137 for interrupt/kill, and `None` when the status cannot be
/// determined.
pub(crate) fn exit_code_from(result: &Result<ExitStatus, RunbookErr>) -> Option<u32> {
    let status = match result {
        Ok(status) => status,
        Err(_) => return None,
    };
    match status.code() {
        Some(code) if code >= 0 => Some(code as u32),
        _ => match status.signal() {
            Some(libc::SIGINT) => Some(130),
            Some(libc::SIGKILL) => Some(137),
            _ => None,
        },
    }
}

fn config_from_request(req: &pb::ExecuteRequest) -> Result<ProgramConfig, RunbookErr> {
    if let Some(cfg) = &req.config {
        return config_from_proto(cfg, req);
    }

    let block = resolve_block(req)?;
    let options = BuildOptions {
        directory: (!req.directory.is_empty()).then(|| PathBuf::from(&req.directory)),
        interactive: req.interactive,
    };
    ProgramConfig::from_code_block(&block, &options)
}

fn resolve_block(req: &pb::ExecuteRequest) -> Result<CodeBlock, RunbookErr> {
    let selector = req
        .block
        .as_ref()
        .ok_or_else(|| RunbookErr::InvalidConfig("no block selected".to_owned()))?;

    if let Some(project) = &req.project {
        let tasks = project::load_tasks(Path::new(&project.root))?;
        let task = match selector {
            pb::Block::BlockName(name) => {
                let file_query = (!req.document_path.is_empty()).then_some(req.document_path.as_str());
                project::lookup_task(&tasks, file_query, name)?
            }
            pb::Block::BlockId(id) => tasks
                .iter()
                .find(|task| task.block.id() == Some(id.as_str()))
                .ok_or_else(|| RunbookErr::BlockNotFound(id.clone()))?,
        };
        return Ok(task.block.clone());
    }

    if req.document_path.is_empty() {
        return Err(RunbookErr::InvalidConfig(
            "either a project, a document path, or a config is required".to_owned(),
        ));
    }

    let path = PathBuf::from(&req.document_path);
    let path = if path.is_absolute() || req.directory.is_empty() {
        path
    } else {
        Path::new(&req.directory).join(path)
    };
    let document = Document::open(&path)?;

    match selector {
        pb::Block::BlockName(name) => {
            let matches = document.lookup(name);
            match matches.as_slice() {
                [] => Err(RunbookErr::BlockNotFound(name.clone())),
                [block] => Ok((*block).clone()),
                _ => Err(RunbookErr::AmbiguousBlock {
                    name: name.clone(),
                    count: matches.len(),
                }),
            }
        }
        pb::Block::BlockId(id) => document
            .lookup_by_id(id)
            .cloned()
            .ok_or_else(|| RunbookErr::BlockNotFound(id.clone())),
    }
}

fn config_from_proto(
    cfg: &pb::ProgramConfig,
    req: &pb::ExecuteRequest,
) -> Result<ProgramConfig, RunbookErr> {
    if cfg.program_name.is_empty() {
        return Err(RunbookErr::InvalidConfig("program_name is required".to_owned()));
    }

    let source = match &cfg.source {
        Some(pb::Source::Commands(list)) => Source::Commands(list.items.clone()),
        Some(pb::Source::Script(script)) => Source::Script(script.clone()),
        None => Source::Commands(Vec::new()),
    };

    let mode = pb::CommandMode::try_from(cfg.mode)
        .unwrap_or(pb::CommandMode::Unspecified);
    let mode = match (mode, &source) {
        (pb::CommandMode::Inline | pb::CommandMode::Unspecified, Source::Commands(_)) => {
            CommandMode::Inline
        }
        (pb::CommandMode::File | pb::CommandMode::Unspecified, Source::Script(_)) => {
            CommandMode::File
        }
        (mode, _) => {
            return Err(RunbookErr::InvalidConfig(format!(
                "mode {} does not match the source shape",
                mode.as_str_name()
            )));
        }
    };

    Ok(ProgramConfig {
        program_name: cfg.program_name.clone(),
        arguments: cfg.arguments.clone(),
        directory: (!cfg.directory.is_empty())
            .then(|| PathBuf::from(&cfg.directory))
            .or_else(|| (!req.directory.is_empty()).then(|| PathBuf::from(&req.directory))),
        env: cfg.env.clone(),
        mode,
        source,
        interactive: cfg.interactive || req.interactive,
        name: String::new(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn status_from_raw(raw: i32) -> ExitStatus {
        ExitStatus::from_raw(raw)
    }

    #[test]
    fn exit_codes_follow_the_taxonomy() {
        // normal exits carry the child's status (wait status = code << 8)
        assert_eq!(exit_code_from(&Ok(status_from_raw(0))), Some(0));
        assert_eq!(exit_code_from(&Ok(status_from_raw(7 << 8))), Some(7));
        // terminations by signal (wait status = signal number)
        assert_eq!(exit_code_from(&Ok(status_from_raw(libc::SIGINT))), Some(130));
        assert_eq!(exit_code_from(&Ok(status_from_raw(libc::SIGKILL))), Some(137));
        assert_eq!(exit_code_from(&Ok(status_from_raw(libc::SIGTERM))), None);
        // undetermined
        assert_eq!(
            exit_code_from(&Err(RunbookErr::InvalidConfig("x".to_owned()))),
            None
        );
    }

    #[test]
    fn proto_config_infers_the_mode_from_the_source() {
        let req = pb::ExecuteRequest::default();
        let cfg = pb::ProgramConfig {
            program_name: "bash".to_owned(),
            source: Some(pb::Source::Commands(pb::CommandList {
                items: vec!["echo".to_owned()],
            })),
            ..Default::default()
        };
        let built = config_from_proto(&cfg, &req).unwrap();
        assert_eq!(built.mode, CommandMode::Inline);

        let cfg = pb::ProgramConfig {
            program_name: "bash".to_owned(),
            source: Some(pb::Source::Script("echo\n".to_owned())),
            ..Default::default()
        };
        let built = config_from_proto(&cfg, &req).unwrap();
        assert_eq!(built.mode, CommandMode::File);
    }

    #[test]
    fn proto_config_rejects_mismatched_mode() {
        let req = pb::ExecuteRequest::default();
        let cfg = pb::ProgramConfig {
            program_name: "bash".to_owned(),
            mode: pb::CommandMode::File.into(),
            source: Some(pb::Source::Commands(pb::CommandList { items: vec![] })),
            ..Default::default()
        };
        assert!(matches!(
            config_from_proto(&cfg, &req),
            Err(RunbookErr::InvalidConfig(_))
        ));
    }

    #[test]
    fn proto_config_requires_a_program() {
        let err = config_from_proto(
            &pb::ProgramConfig::default(),
            &pb::ExecuteRequest::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RunbookErr::InvalidConfig(_)));
    }
}
