use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tonic::Streaming;
use tracing::debug;
use tracing::info;
use tracing::warn;

use runbook_core::RunbookErr;
use runbook_core::command::CommandHandle;
use runbook_core::command::StopSignal;
use runbook_protocol as pb;
use runbook_protocol::RunnerService;

use crate::execution::Execution;
use crate::execution::MSG_BUFFER_SIZE;
use crate::execution::SharedStdin;
use crate::execution::exit_code_from;
use crate::execution::write_input;

/// The `RunnerService` implementation. Stateless: every `Execute` call
/// owns its execution and its tasks, and nothing is shared across
/// calls.
#[derive(Debug, Default)]
pub struct Runner {}

#[tonic::async_trait]
impl RunnerService for Runner {
    type ExecuteStream = ReceiverStream<Result<pb::ExecuteResponse, Status>>;

    async fn execute(
        &self,
        request: Request<Streaming<pb::ExecuteRequest>>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        let mut in_stream = request.into_inner();

        let first = match in_stream.message().await {
            Ok(Some(req)) => req,
            Ok(None) => {
                return Err(Status::invalid_argument(
                    "the stream was closed before the opening request",
                ));
            }
            Err(status) => {
                info!("failed to receive the opening request: {status}");
                return Err(status);
            }
        };

        let mut exec = Execution::new(&first).map_err(status_from_err)?;
        let id = exec.id.clone();
        debug!(%id, "opening an execution");

        exec.start().await.map_err(status_from_err)?;
        let pid = exec.pid();
        let handle = exec.handle().map_err(status_from_err)?;
        info!(%id, pid, "execution started");

        let (tx, rx) = mpsc::channel::<Result<pb::ExecuteResponse, Status>>(16);

        tokio::spawn(async move {
            // The PID frame goes out before anything else.
            let pid_frame = pb::ExecuteResponse {
                pid: Some(pb::ProcessPid { pid }),
                ..Default::default()
            };
            if tx.send(Ok(pid_frame)).await.is_err() {
                // The client is already gone; do not orphan the child.
                let _ = handle.stop_with_signal(StopSignal::Kill);
                let _ = exec.wait().await;
                return;
            }

            let stdin = exec.stdin();
            if !first.input_data.is_empty() {
                write_input(&stdin, &first.input_data).await;
            }

            let recv_task = tokio::spawn(receive_loop(in_stream, handle.clone(), stdin));

            // The send loop runs while the child does, so ring-buffer
            // back-pressure throttles the child against a slow client.
            let send_task = exec.take_stdout().map(|mut stdout| {
                let sender = tx.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; MSG_BUFFER_SIZE];
                    loop {
                        match stdout.read(&mut buf).await {
                            Ok(0) => break,
                            Ok(n) => {
                                let frame = pb::ExecuteResponse {
                                    stdout_data: buf[..n].to_vec(),
                                    ..Default::default()
                                };
                                if sender.send(Ok(frame)).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                info!("failed to read command output: {err}");
                                break;
                            }
                        }
                    }
                })
            });

            let result = exec.wait().await;
            if let Some(task) = send_task {
                let _ = task.await;
            }

            let exit_code = exit_code_from(&result);
            match &result {
                Ok(status) => info!(%id, ?exit_code, "execution finished: {status}"),
                Err(err) => warn!(%id, "execution finished with an error: {err}"),
            }

            let final_frame = pb::ExecuteResponse {
                exit_code,
                ..Default::default()
            };
            if tx.send(Ok(final_frame)).await.is_err() {
                info!(%id, "failed to send the exit code; client is gone");
            }

            // The child is gone and the terminal frame is out; whatever
            // the client still sends has no effect.
            recv_task.abort();
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Drains client frames for a running execution: stdin bytes, winsize
/// updates, and stop requests.
async fn receive_loop(
    mut stream: Streaming<pb::ExecuteRequest>,
    handle: CommandHandle,
    stdin: SharedStdin,
) {
    loop {
        match stream.message().await {
            Ok(Some(req)) => {
                if !req.input_data.is_empty() {
                    write_input(&stdin, &req.input_data).await;
                }

                if let Some(winsize) = &req.winsize {
                    let result = handle.set_winsize(
                        narrow(winsize.rows),
                        narrow(winsize.cols),
                        narrow(winsize.x),
                        narrow(winsize.y),
                    );
                    if let Err(err) = result {
                        info!("failed to set winsize; ignoring: {err}");
                    }
                }

                let stop = match pb::ExecuteStop::try_from(req.stop) {
                    Ok(pb::ExecuteStop::Unspecified) | Err(_) => None,
                    Ok(pb::ExecuteStop::Interrupt) => Some(StopSignal::Interrupt),
                    Ok(pb::ExecuteStop::Kill) => Some(StopSignal::Kill),
                };
                if let Some(signal) = stop {
                    info!("requested the program to stop: {signal:?}");
                    if let Err(err) = handle.stop_with_signal(signal) {
                        info!("failed to stop the program: {err}");
                    }
                }
            }
            Ok(None) => {
                // Half-close of the send direction means no more input.
                debug!("client closed its send direction; interrupting the program");
                if let Err(err) = handle.stop_with_signal(StopSignal::Interrupt) {
                    info!("failed to interrupt the program: {err}");
                }
                return;
            }
            Err(status) => {
                if handle.is_running() {
                    info!("stream failed while the process is running; killing it: {status}");
                    if let Err(err) = handle.stop_with_signal(StopSignal::Kill) {
                        info!("failed to kill the program: {err}");
                    }
                } else {
                    debug!("stream failed after the process finished; ignoring: {status}");
                }
                return;
            }
        }
    }
}

fn narrow(value: u32) -> u16 {
    value.min(u32::from(u16::MAX)) as u16
}

fn status_from_err(err: RunbookErr) -> Status {
    match &err {
        RunbookErr::UnsupportedLanguage(_)
        | RunbookErr::InvalidConfig(_)
        | RunbookErr::AmbiguousBlock { .. } => Status::invalid_argument(err.to_string()),
        RunbookErr::BlockNotFound(_) | RunbookErr::DocumentRead { .. } => {
            Status::not_found(err.to_string())
        }
        RunbookErr::UnknownInterpreters(_) | RunbookErr::Start { .. } => {
            Status::failed_precondition(err.to_string())
        }
        _ => Status::internal(err.to_string()),
    }
}
