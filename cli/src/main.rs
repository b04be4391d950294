//! Entry-point for the `runbook` binary: serve the runner over gRPC,
//! or run and list code blocks directly.

use std::net::SocketAddr;
use std::os::fd::AsFd;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use tracing_subscriber::EnvFilter;

use runbook_core::command::BuildOptions;
use runbook_core::command::NativeCommand;
use runbook_core::command::NativeCommandOptions;
use runbook_core::command::ProgramConfig;
use runbook_core::command::VirtualCommand;
use runbook_core::command::VirtualCommandOptions;
use runbook_core::document::CodeBlock;
use runbook_core::project;

#[derive(Parser, Debug)]
#[command(name = "runbook", version, about = "Run code blocks from Markdown documents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the gRPC runner service.
    Serve {
        #[arg(long, default_value = "127.0.0.1:7863")]
        addr: SocketAddr,
    },
    /// Execute a named code block.
    Run {
        /// Block name to execute.
        block: String,
        /// Document to search; defaults to every Markdown file under
        /// the project directory.
        #[arg(long)]
        filename: Option<PathBuf>,
        /// Project directory.
        #[arg(long, default_value = ".")]
        chdir: PathBuf,
    },
    /// List the code blocks of a project.
    List {
        #[arg(long)]
        filename: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        chdir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("error")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { addr } => {
            runbook_server::serve(addr).await?;
            Ok(())
        }
        Command::Run {
            block,
            filename,
            chdir,
        } => run_block(&block, filename.as_deref(), &chdir).await,
        Command::List { filename, chdir } => list_blocks(filename.as_deref(), &chdir),
    }
}

fn load_tasks(filename: Option<&Path>, chdir: &Path) -> Result<Vec<project::Task>> {
    match filename {
        Some(filename) => {
            let path = if filename.is_absolute() {
                filename.to_path_buf()
            } else {
                chdir.join(filename)
            };
            let document = runbook_core::document::Document::open(&path)?;
            Ok(document
                .code_blocks()
                .iter()
                .map(|block| project::Task {
                    filename: path.clone(),
                    block: block.clone(),
                })
                .collect())
        }
        None => Ok(project::load_tasks(chdir)?),
    }
}

async fn run_block(name: &str, filename: Option<&Path>, chdir: &Path) -> Result<()> {
    let tasks = load_tasks(filename, chdir)?;
    let task = project::lookup_task(&tasks, None, name)?;

    let options = BuildOptions {
        directory: Some(chdir.to_path_buf()),
        interactive: false,
    };
    let cfg = ProgramConfig::from_code_block(&task.block, &options)?;

    let status = if cfg.interactive {
        run_virtual(cfg).await?
    } else {
        run_native(cfg).await?
    };

    match status.code() {
        Some(0) => Ok(()),
        Some(code) => std::process::exit(code),
        None => std::process::exit(1),
    }
}

async fn run_native(cfg: ProgramConfig) -> Result<ExitStatus> {
    let stdin = std::io::stdin()
        .as_fd()
        .try_clone_to_owned()
        .context("failed to clone stdin")?;

    let mut cmd = NativeCommand::new(
        cfg,
        NativeCommandOptions {
            stdin: Some(stdin.into()),
            stdout: None,
            stderr: None,
            env: Vec::new(),
        },
    );
    cmd.start().await?;
    Ok(cmd.wait().await?)
}

async fn run_virtual(cfg: ProgramConfig) -> Result<ExitStatus> {
    let mut cmd = VirtualCommand::new(
        cfg,
        VirtualCommandOptions {
            stdin: Some(Box::new(tokio::io::stdin())),
            stdout: Some(Box::new(tokio::io::stdout())),
            env: Vec::new(),
        },
    );
    cmd.start().await?;

    let handle = cmd.handle()?;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = handle.stop_with_signal(runbook_core::command::StopSignal::Interrupt);
        }
    });

    Ok(cmd.wait().await?)
}

fn list_blocks(filename: Option<&Path>, chdir: &Path) -> Result<()> {
    let tasks = load_tasks(filename, chdir)?;

    println!("{:<24} {:<32} {}", "NAME", "FILE", "FIRST COMMAND");
    for task in tasks {
        println!(
            "{:<24} {:<32} {}",
            task.block.name(),
            task.filename.display(),
            first_command(&task.block),
        );
    }
    Ok(())
}

fn first_command(block: &CodeBlock) -> String {
    block
        .lines()
        .iter()
        .find(|line| !line.trim().is_empty())
        .cloned()
        .unwrap_or_default()
}
