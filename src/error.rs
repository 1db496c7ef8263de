//! Error types for the page-state core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("All {0} worker slots are registered")]
    WorkersExhausted(usize),

    #[error("Page pool exhausted ({0} pages)")]
    PoolExhausted(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
