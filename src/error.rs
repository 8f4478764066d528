use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ZedError>;

#[derive(Debug, Error)]
pub enum ZedError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("configuration error: {0}")]
    Config(String),
}

impl ZedError {
    /// Corruption error pinned to the block where it was observed.
    pub fn corrupt_at(blk: u32, msg: &str) -> Self {
        ZedError::Corruption(format!("{msg} (block {blk})"))
    }
}
