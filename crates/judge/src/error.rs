//! The top-level error a judge worker can surface for one job.

use thiserror::Error;

use crate::{crypto, sandbox, store};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] store::Error),
    #[error(transparent)]
    Sandbox(#[from] sandbox::Error),
    #[error(transparent)]
    Crypto(#[from] crypto::Error),
    #[error("writing to sandbox tree: {0}")]
    Io(#[from] std::io::Error),
}
