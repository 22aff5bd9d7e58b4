use std::path::PathBuf;

use thiserror::Error;

use veil_shared::IdentityError;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Key file {path}: {source}")]
    KeyFileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Key file {path} is not valid JSON: {source}")]
    KeyFileFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Key file {path} holds an unusable key: {source}")]
    KeyFileIdentity {
        path: PathBuf,
        #[source]
        source: IdentityError,
    },
}
