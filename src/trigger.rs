//! Device-open trigger source: runs inside the privileged container,
//! watching the virtual-input control device and reporting open/close
//! activity through the mounted control socket.

use std::path::{Path, PathBuf};

use inotify::{EventMask, Inotify, WatchMask};
use tokio_stream::StreamExt;

use crate::event::TriggerScope;
use crate::inputctl::v1::input_control_client::InputControlClient;
use crate::inputctl::v1::{PluginMode, TriggerRequest};

/// Device whose open/close activity signals virtual-device creation.
const CONTROL_DEVICE: &str = "/dev/uinput";
/// Marker file selecting pod-wide injection, mounted next to the socket.
pub const POD_MODE_MARKER: &str = "uinput_type_pod";
/// Marker file selecting container-only injection.
pub const CONTAINER_MODE_MARKER: &str = "uinput_type_container";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect to control socket `{path}`: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("failed to watch `{path}`: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolves the advertised trigger scope from the marker files mounted next
/// to `socket_path`.
pub fn detect_scope(socket_path: &Path) -> TriggerScope {
    let dir = socket_path.parent().unwrap_or_else(|| Path::new("/"));
    if dir.join(POD_MODE_MARKER).exists() {
        TriggerScope::Pod
    } else {
        TriggerScope::Container
    }
}

/// Watches the control device and reports open/close activity until the
/// process exits. RPC failures are logged and the trigger dropped.
pub async fn watch(socket_path: &Path, pod_name: &str) -> Result<(), Error> {
    let scope = detect_scope(socket_path);
    log::info!("initialized trigger watch in {} scope", scope.as_str());

    let channel = crate::grpc::channel_for_unix_socket(socket_path)
        .await
        .map_err(|source| Error::Connect {
            path: socket_path.to_path_buf(),
            source,
        })?;
    let mut client = InputControlClient::new(channel);

    let watch_err = |source| Error::Watch {
        path: PathBuf::from(CONTROL_DEVICE),
        source,
    };
    let inotify = Inotify::init().map_err(watch_err)?;
    inotify
        .watches()
        .add(CONTROL_DEVICE, WatchMask::OPEN | WatchMask::CLOSE_WRITE)
        .map_err(watch_err)?;
    let mut stream = inotify.into_event_stream([0u8; 1024]).map_err(watch_err)?;

    let plugin_mode = match scope {
        TriggerScope::Pod => PluginMode::Pod,
        TriggerScope::Container => PluginMode::Container,
    };
    let request = TriggerRequest {
        pod_name: pod_name.to_owned(),
        plugin_mode: plugin_mode.into(),
    };

    while let Some(event) = stream.next().await {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                log::error!("failed to read inotify event: {err}");
                continue;
            }
        };
        if event.mask.contains(EventMask::OPEN) {
            log::info!("saw control device open, notifying host monitor");
            if let Err(err) = client.trigger_opened(request.clone()).await {
                log::error!("failed to send trigger: {err}");
            }
        } else if event.mask.contains(EventMask::CLOSE_WRITE) {
            log::info!("saw control device close, notifying host monitor");
            if let Err(err) = client.trigger_closed(request.clone()).await {
                log::error!("failed to send trigger: {err}");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_scope_defaults_to_container() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("uinputctl");
        assert_eq!(detect_scope(&socket_path), TriggerScope::Container);
    }

    #[test]
    fn test_detect_scope_pod_marker() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(POD_MODE_MARKER), "").unwrap();
        let socket_path = dir.path().join("uinputctl");
        assert_eq!(detect_scope(&socket_path), TriggerScope::Pod);
    }
}
