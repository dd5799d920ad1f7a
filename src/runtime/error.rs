use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid container id: {0}")]
    InvalidContainerID(String),
    #[error("failed to connect to socket `{path}`: {source}")]
    SocketConnect {
        path: PathBuf,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("{call} call failed: {source}")]
    Rpc {
        call: &'static str,
        #[source]
        source: Box<tonic::Status>,
    },
    #[error("failed to encode exec process spec: {0}")]
    SpecEncode(#[source] serde_json::Error),
    #[error("namespace `{0}` is not a valid metadata value")]
    Namespace(String),
}

pub type Result<T> = std::result::Result<T, Error>;
