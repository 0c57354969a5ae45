use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Error taxonomy of the disc core. Every failure surfaced by the library
/// maps onto one of these kinds; the command layer turns the kind into an
/// exit code.
#[derive(Error, Debug)]
pub enum WdError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("missing input: {0}")]
    Missing(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid binary format: {0}")]
    Format(&'static str),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("destination exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// Non-equality result of diff/verify. Not a failure of the tool.
    #[error("objects differ")]
    Differ,

    #[error("interrupted by signal")]
    Interrupted,

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("read error: {0}")]
    BinRw(#[from] binrw::Error),
}

pub type WdResult<T> = Result<T, WdError>;

impl WdError {
    /// Soft errors can be demoted to warnings by `--ignore` style options.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            WdError::Differ | WdError::Format(_) | WdError::Crypto(_) | WdError::Missing(_)
        )
    }
}
