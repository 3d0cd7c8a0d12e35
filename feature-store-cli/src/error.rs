use sled_feature_store::StoreError;
use thiserror::Error;

/// Failures of an `fstore` command.
#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to render output: {0}")]
    Output(#[source] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
