use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RunbookErr>;

#[derive(Error, Debug)]
pub enum RunbookErr {
    #[error("unsupported language {0:?}")]
    UnsupportedLanguage(String),

    /// Candidates existed for the language but none could be located on
    /// `PATH`.
    #[error("unable to look up any of interpreters {0:?}")]
    UnknownInterpreters(Vec<String>),

    #[error("unable to read document {path}")]
    DocumentRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unable to find any block named {0:?}")]
    BlockNotFound(String),

    #[error("invalid program configuration: {0}")]
    InvalidConfig(String),

    #[error("block name {name:?} matches {count} blocks")]
    AmbiguousBlock { name: String, count: usize },

    #[error("failed to create a temporary script file")]
    CreateScriptFile(#[source] io::Error),

    #[error("failed to open a pseudo-terminal")]
    OpenPty(#[source] io::Error),

    #[error("failed to duplicate stdin")]
    DupStdin(#[source] io::Error),

    #[error("failed to start {program:?}")]
    Start {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal process {pid}")]
    Signal {
        pid: i32,
        #[source]
        source: io::Error,
    },

    #[error("command has not been started")]
    NotStarted,

    #[error(transparent)]
    Io(#[from] io::Error),
}
