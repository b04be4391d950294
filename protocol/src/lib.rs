//! Generated wire types for the `runbook.runner.v1` protocol.
//!
//! The source of truth is `proto/runbook/runner/v1/runner.proto`. The
//! `Execute` call is a bidirectional stream: the first request selects a
//! block (or carries a full `ProgramConfig`), subsequent requests carry
//! stdin bytes, window-size updates, and stop signals. Responses carry
//! the PID once, stdout chunks of at most 32 KiB, and a terminal frame
//! with the exit code.

pub mod runner {
    pub mod v1 {
        tonic::include_proto!("runbook.runner.v1");
    }
}

pub use runner::v1::CommandMode;
pub use runner::v1::ExecuteRequest;
pub use runner::v1::ExecuteResponse;
pub use runner::v1::ExecuteStop;
pub use runner::v1::ProcessPid;
pub use runner::v1::ProgramConfig;
pub use runner::v1::Project;
pub use runner::v1::Winsize;
pub use runner::v1::execute_request::Block;
pub use runner::v1::program_config::CommandList;
pub use runner::v1::program_config::Source;
pub use runner::v1::runner_service_client::RunnerServiceClient;
pub use runner::v1::runner_service_server::RunnerService;
pub use runner::v1::runner_service_server::RunnerServiceServer;
