//! gRPC plumbing over unix domain sockets, shared by every client and
//! server in the agent.

use std::path::{Path, PathBuf};
use std::{pin, task};

use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Channel, Endpoint};

#[derive(Debug, Clone)]
struct UnixConnector {
    path: PathBuf,
}

impl tower::Service<hyper::Uri> for UnixConnector {
    type Response = TokioIo<tokio::net::UnixStream>;

    type Error = std::io::Error;

    type Future = pin::Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: hyper::Uri) -> Self::Future {
        let path = self.path.clone();
        Box::pin(async move {
            let stream = tokio::net::UnixStream::connect(path).await?;

            Ok(TokioIo::new(stream))
        })
    }
}

/// Creates a client channel to the unix socket at `path`.
///
/// The endpoint URI is a placeholder; all traffic is carried over the
/// socket.
pub async fn channel_for_unix_socket(
    path: impl AsRef<Path>,
) -> Result<Channel, tonic::transport::Error> {
    let path = path.as_ref();
    log::debug!("Connecting to {}...", path.display());
    let connector = UnixConnector {
        path: path.to_path_buf(),
    };
    let channel = Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(connector)
        .await?;
    log::debug!("Created channel for {}.", path.display());

    Ok(channel)
}

/// Error that occurs when binding a unix listener fails.
#[derive(Debug, thiserror::Error)]
#[error("failed to bind unix socket `{path}`: {source}")]
pub struct BindError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Binds a unix listener at `path`, removing a stale socket file first.
///
/// Once this returns, the socket exists and connection attempts queue until
/// a server starts accepting from the returned stream.
pub fn bind_unix_listener(path: impl AsRef<Path>) -> Result<UnixListenerStream, BindError> {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(BindError {
                path: path.to_path_buf(),
                source,
            });
        }
    }
    let listener = UnixListener::bind(path).map_err(|source| BindError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(UnixListenerStream::new(listener))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_unix_listener_creates_socket() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("test.sock");
        let _listener = bind_unix_listener(&path).expect("should bind listener");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_bind_unix_listener_replaces_stale_socket() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("test.sock");
        drop(bind_unix_listener(&path).expect("should bind listener"));
        // the stale socket file is still on disk; binding again must succeed
        let _listener = bind_unix_listener(&path).expect("should rebind over stale socket");
        assert!(path.exists());
    }
}
