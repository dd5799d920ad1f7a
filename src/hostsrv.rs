//! Control-socket server pool: one small gRPC server per pre-provisioned
//! control socket.
//!
//! Each server resolves the container that has its socket mounted and
//! republishes the trigger as a typed event on the shared bus. Servers
//! share nothing but the bus sender.

use std::path::PathBuf;
use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::event::{EventKind, EventSender, MonitorEvent, TriggerScope};
use crate::inputctl::v1::input_control_server::{InputControl, InputControlServer};
use crate::inputctl::v1::{PluginMode, TriggerRequest, TriggerResponse};
use crate::runtime::ContainerRuntime;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Bind(#[from] crate::grpc::BindError),
}

/// Server for one control socket.
pub struct HostServer {
    socket_path: PathBuf,
    runtime: Arc<dyn ContainerRuntime>,
    events: EventSender,
}

impl HostServer {
    pub fn new(socket_path: PathBuf, runtime: Arc<dyn ContainerRuntime>, events: EventSender) -> Self {
        Self {
            socket_path,
            runtime,
            events,
        }
    }

    /// Resolves the calling container and publishes the trigger. Failing the
    /// call drops the trigger; the helper does not retry.
    async fn publish(&self, kind: EventKind, request: &TriggerRequest) -> Result<(), Status> {
        let container = self
            .runtime
            .find_container_with_mount(&self.socket_path)
            .await
            .map_err(|err| Status::internal(format!("failed to list containers: {err}")))?;
        let Some(container) = container else {
            return Err(Status::failed_precondition(format!(
                "no running container mounts `{}`",
                self.socket_path.display()
            )));
        };

        let scope = match request.plugin_mode() {
            PluginMode::Pod => TriggerScope::Pod,
            _ => TriggerScope::Container,
        };
        log::info!(
            "pod `{}` sent {} via `{}` (scope {})",
            request.pod_name,
            kind,
            self.socket_path.display(),
            scope.as_str()
        );
        self.events
            .send(MonitorEvent::trigger(kind, container.as_ref(), scope))
            .map_err(|_| Status::unavailable("event bus closed"))
    }
}

#[tonic::async_trait]
impl InputControl for HostServer {
    async fn trigger_opened(
        &self,
        request: Request<TriggerRequest>,
    ) -> Result<Response<TriggerResponse>, Status> {
        self.publish(EventKind::TriggerOpened, request.get_ref()).await?;
        Ok(Response::new(TriggerResponse {}))
    }

    async fn trigger_closed(
        &self,
        request: Request<TriggerRequest>,
    ) -> Result<Response<TriggerResponse>, Status> {
        self.publish(EventKind::TriggerClosed, request.get_ref()).await?;
        Ok(Response::new(TriggerResponse {}))
    }
}

/// Binds `socket_path` and serves it in a background task.
///
/// Returns once the listener is bound, so a caller that starts all sockets
/// before touching its ready marker can rely on every socket accepting
/// connections.
pub fn start(
    socket_path: PathBuf,
    runtime: Arc<dyn ContainerRuntime>,
    events: EventSender,
) -> Result<(), Error> {
    let incoming = crate::grpc::bind_unix_listener(&socket_path)?;
    let server = HostServer::new(socket_path.clone(), runtime, events);
    tokio::spawn(async move {
        let result = tonic::transport::Server::builder()
            .add_service(InputControlServer::new(server))
            .serve_with_incoming(incoming)
            .await;
        if let Err(err) = result {
            log::error!(
                "control-socket server at `{}` stopped: {}",
                socket_path.display(),
                err
            );
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ATTR_CONTAINER;
    use crate::inputctl::v1::input_control_client::InputControlClient;
    use crate::runtime::ContainerID;
    use std::path::Path;

    /// Runtime stub that "finds" a fixed container for one mount source.
    struct FixedRuntime {
        mounted_at: PathBuf,
        container: &'static str,
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for FixedRuntime {
        async fn find_container_with_mount(
            &self,
            source: &Path,
        ) -> crate::runtime::Result<Option<ContainerID>> {
            if source == self.mounted_at {
                ContainerID::new(self.container).map(Some)
            } else {
                Ok(None)
            }
        }

        async fn exec(&self, _container: &ContainerID, _argv: &[String]) -> crate::runtime::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_trigger_publishes_resolved_container() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("uinputctl0");
        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
        let runtime = Arc::new(FixedRuntime {
            mounted_at: socket_path.clone(),
            container: "cont-a",
        });

        start(socket_path.clone(), runtime, events_tx).unwrap();

        let channel = crate::grpc::channel_for_unix_socket(&socket_path)
            .await
            .unwrap();
        let mut client = InputControlClient::new(channel);
        client
            .trigger_opened(TriggerRequest {
                pod_name: "pod-1".to_owned(),
                plugin_mode: PluginMode::Pod.into(),
            })
            .await
            .unwrap();

        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::TriggerOpened);
        assert_eq!(event.attribute(ATTR_CONTAINER), Some("cont-a"));
        assert_eq!(event.attribute(crate::event::ATTR_MODE), Some("POD"));
    }

    #[tokio::test]
    async fn test_trigger_without_container_fails_and_drops() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("uinputctl0");
        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
        let runtime = Arc::new(FixedRuntime {
            mounted_at: dir.path().join("elsewhere"),
            container: "cont-a",
        });

        start(socket_path.clone(), runtime, events_tx).unwrap();

        let channel = crate::grpc::channel_for_unix_socket(&socket_path)
            .await
            .unwrap();
        let mut client = InputControlClient::new(channel);
        let status = client
            .trigger_closed(TriggerRequest {
                pod_name: "pod-1".to_owned(),
                plugin_mode: PluginMode::Container.into(),
            })
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
        assert!(events_rx.try_recv().is_err(), "trigger must not be published");
    }
}
