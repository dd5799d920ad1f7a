//! Kubernetes device-plugin server and its serving state machine.
//!
//! The lifecycle is `Registering -> Serving -> Draining -> Registering`:
//! registration binds a fresh plugin socket and announces it to the
//! kubelet; serving watches for the socket being deleted (the kubelet
//! restarting) and for inventory count changes; draining tears the server
//! down and re-runs discovery before registering again. Registration
//! failure is the one fatal exit; everything else loops.

mod service;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;

use crate::deviceplugin::v1beta1::RegisterRequest;
use crate::deviceplugin::v1beta1::device_plugin_server::DevicePluginServer;
use crate::deviceplugin::v1beta1::registration_client::RegistrationClient;
use crate::discovery::Inventory;

/// Device-plugin API version implemented by this server.
pub const API_VERSION: &str = "v1beta1";
/// Kubelet registration socket inside the plugin directory.
pub const KUBELET_SOCKET: &str = "kubelet.sock";
/// Prefix of the plugin's own socket name.
const PLUGIN_ENDPOINT_PREFIX: &str = "uinputDevice";

const PLUGIN_SOCKET_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const DEV_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const DISCOVERY_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Whether this instance advertises individual event devices or control
/// sockets granting device-creation capability. Fixed for the lifetime of
/// the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginMode {
    Devices,
    Control,
}

impl PluginMode {
    /// Derives the mode from the advertised resource name.
    pub fn from_resource_name(resource_name: &str) -> Self {
        match resource_name {
            "uinput.dev/pod" | "uinput.dev/container" => PluginMode::Control,
            _ => PluginMode::Devices,
        }
    }
}

/// A statically configured extra mount added read-only to every allocation.
#[derive(Debug, Clone)]
pub struct MountPath {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("resource name `{0}` has no `<vendor>/<resource>` form")]
    InvalidResourceName(String),
    #[error(transparent)]
    Bind(#[from] crate::grpc::BindError),
    #[error("failed to connect to kubelet socket `{path}`: {source}")]
    KubeletConnect {
        path: PathBuf,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("failed to register with the kubelet: {0}")]
    Register(#[source] Box<tonic::Status>),
    #[error("system clock is before the unix epoch: {0}")]
    Clock(#[from] std::time::SystemTimeError),
}

/// Configuration and inventory shared by the gRPC service and the state
/// machine.
#[derive(Debug)]
pub struct PluginServer {
    inventory: Arc<Inventory>,
    mode: PluginMode,
    resource_name: String,
    resource_base: String,
    dev_directory: PathBuf,
    socket_directory: PathBuf,
    mount_paths: Vec<MountPath>,
    plugin_directory: PathBuf,
}

/// Serving states; each has one transition method on [`PluginServer`].
enum ServeState {
    Registering,
    Serving(ServingHandle),
    Draining { stale_socket: PathBuf },
}

struct ServingHandle {
    endpoint_path: PathBuf,
    shutdown: oneshot::Sender<()>,
    served: tokio::task::JoinHandle<()>,
}

impl PluginServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        inventory: Arc<Inventory>,
        mode: PluginMode,
        resource_name: String,
        dev_directory: impl Into<PathBuf>,
        socket_directory: impl Into<PathBuf>,
        mount_paths: Vec<MountPath>,
        plugin_directory: impl Into<PathBuf>,
    ) -> Result<Self, Error> {
        let resource_base = resource_name
            .split('/')
            .nth(1)
            .ok_or_else(|| Error::InvalidResourceName(resource_name.clone()))?
            .to_owned();
        Ok(Self {
            inventory,
            mode,
            resource_name,
            resource_base,
            dev_directory: dev_directory.into(),
            socket_directory: socket_directory.into(),
            mount_paths,
            plugin_directory: plugin_directory.into(),
        })
    }

    /// Runs the serving state machine until a fatal error.
    pub async fn serve(&self) -> Result<(), Error> {
        let mut state = ServeState::Registering;
        loop {
            state = match state {
                ServeState::Registering => self.register().await?,
                ServeState::Serving(handle) => self.watch(handle).await,
                ServeState::Draining { stale_socket } => self.drain(&stale_socket).await,
            };
        }
    }

    /// Creates a fresh plugin socket, starts the gRPC service on it and
    /// announces the endpoint to the kubelet.
    async fn register(&self) -> Result<ServeState, Error> {
        let endpoint = format!(
            "{}-{}-{}.sock",
            PLUGIN_ENDPOINT_PREFIX,
            self.resource_base,
            unix_seconds()?
        );
        let endpoint_path = self.plugin_directory.join(&endpoint);
        log::info!(
            "starting device-plugin server at: {}",
            endpoint_path.display()
        );

        let incoming = crate::grpc::bind_unix_listener(&endpoint_path)?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let endpoint_for_log = endpoint_path.clone();
        let service = service::PluginService::new(self);
        let served = tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(incoming, async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(err) = result {
                log::error!(
                    "device-plugin server at `{}` stopped serving: {}",
                    endpoint_for_log.display(),
                    err
                );
            }
        });

        let kubelet_path = self.plugin_directory.join(KUBELET_SOCKET);
        if let Err(err) = self.register_with_kubelet(&kubelet_path, &endpoint).await {
            let _ = shutdown_tx.send(());
            let _ = served.await;
            return Err(err);
        }
        log::info!("device-plugin registered with the kubelet");

        Ok(ServeState::Serving(ServingHandle {
            endpoint_path,
            shutdown: shutdown_tx,
            served,
        }))
    }

    async fn register_with_kubelet(&self, kubelet_path: &Path, endpoint: &str) -> Result<(), Error> {
        let channel = crate::grpc::channel_for_unix_socket(kubelet_path)
            .await
            .map_err(|source| Error::KubeletConnect {
                path: kubelet_path.to_path_buf(),
                source,
            })?;
        let mut client = RegistrationClient::new(channel);
        client
            .register(RegisterRequest {
                version: API_VERSION.to_owned(),
                endpoint: endpoint.to_owned(),
                resource_name: self.resource_name.clone(),
                options: None,
            })
            .await
            .map_err(|source| Error::Register(Box::new(source)))?;
        Ok(())
    }

    /// Watches the plugin socket and the inventory while serving; stops the
    /// server when the socket disappears or the inventory count changes.
    async fn watch(&self, handle: ServingHandle) -> ServeState {
        let mut socket_check = tokio::time::interval(PLUGIN_SOCKET_CHECK_INTERVAL);
        let mut dev_check = tokio::time::interval(DEV_CHECK_INTERVAL);
        // intervals fire immediately on the first tick
        socket_check.tick().await;
        dev_check.tick().await;

        loop {
            tokio::select! {
                _ = socket_check.tick() => {
                    if let Err(err) = std::fs::symlink_metadata(&handle.endpoint_path) {
                        log::info!(
                            "stopping device-plugin server at: {}",
                            handle.endpoint_path.display()
                        );
                        log::error!("{err}");
                        break;
                    }
                }
                _ = dev_check.tick() => {
                    let changed = match self.mode {
                        PluginMode::Devices => self.inventory.has_device_count_changed(),
                        PluginMode::Control => self.inventory.has_control_count_changed(),
                    };
                    if changed {
                        break;
                    }
                }
            }
        }

        let ServingHandle {
            endpoint_path,
            shutdown,
            served,
        } = handle;
        let _ = shutdown.send(());
        if let Err(err) = served.await {
            log::error!("device-plugin server task failed: {err}");
        }
        ServeState::Draining {
            stale_socket: endpoint_path,
        }
    }

    /// Removes the stale plugin socket and re-runs discovery until it
    /// succeeds; a supported device may not be attached yet.
    async fn drain(&self, stale_socket: &Path) -> ServeState {
        if let Err(err) = crate::fsutil::remove_if_exists(stale_socket) {
            log::error!("{err}");
        }
        loop {
            match self.inventory.discover() {
                Ok(()) => return ServeState::Registering,
                Err(err) => {
                    log::error!("re-discovery failed: {err}");
                    tokio::time::sleep(DISCOVERY_RETRY_INTERVAL).await;
                }
            }
        }
    }
}

fn unix_seconds() -> Result<u64, std::time::SystemTimeError> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deviceplugin::v1beta1::registration_server::{Registration, RegistrationServer};
    use crate::deviceplugin::v1beta1::{Empty, RegisterRequest};
    use tonic::{Request, Response, Status};

    struct FakeKubelet {
        registrations: tokio::sync::mpsc::UnboundedSender<RegisterRequest>,
    }

    #[tonic::async_trait]
    impl Registration for FakeKubelet {
        async fn register(
            &self,
            request: Request<RegisterRequest>,
        ) -> Result<Response<Empty>, Status> {
            self.registrations
                .send(request.into_inner())
                .map_err(|_| Status::internal("test receiver closed"))?;
            Ok(Response::new(Empty {}))
        }
    }

    fn empty_inventory(root: &Path) -> Arc<Inventory> {
        let dev = root.join("dev");
        let sys = root.join("sys");
        let sockets = root.join("sockets");
        for dir in [&dev, &sys, &sockets] {
            std::fs::create_dir_all(dir).unwrap();
        }
        Arc::new(Inventory::new(dev, sys, sockets, "^mouse[0-9]+$").unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_socket_loss_causes_reregistration() {
        let root = tempfile::tempdir().unwrap();
        let plugin_dir = root.path().join("plugins");
        std::fs::create_dir_all(&plugin_dir).unwrap();

        let (reg_tx, mut reg_rx) = tokio::sync::mpsc::unbounded_channel();
        let kubelet_incoming =
            crate::grpc::bind_unix_listener(plugin_dir.join(KUBELET_SOCKET)).unwrap();
        tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(RegistrationServer::new(FakeKubelet {
                    registrations: reg_tx,
                }))
                .serve_with_incoming(kubelet_incoming)
                .await;
        });

        let inventory = empty_inventory(root.path());
        inventory.discover().unwrap();
        let server = Arc::new(
            PluginServer::new(
                inventory,
                PluginMode::Devices,
                "uinput.dev/mouse".to_owned(),
                "/dev/input",
                root.path().join("sockets"),
                Vec::new(),
                &plugin_dir,
            )
            .unwrap(),
        );
        let serving = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve().await }
        });

        let first = tokio::time::timeout(Duration::from_secs(5), reg_rx.recv())
            .await
            .expect("first registration")
            .unwrap();
        assert_eq!(first.version, API_VERSION);
        assert_eq!(first.resource_name, "uinput.dev/mouse");
        assert!(plugin_dir.join(&first.endpoint).exists());

        // deleting the plugin socket must drive the machine through
        // draining and back to registering
        std::fs::remove_file(plugin_dir.join(&first.endpoint)).unwrap();
        let second = tokio::time::timeout(Duration::from_secs(10), reg_rx.recv())
            .await
            .expect("re-registration after socket loss")
            .unwrap();
        assert_eq!(second.resource_name, "uinput.dev/mouse");

        serving.abort();
    }

    #[test]
    fn test_plugin_mode_from_resource_name() {
        assert_eq!(
            PluginMode::from_resource_name("uinput.dev/mouse"),
            PluginMode::Devices
        );
        assert_eq!(
            PluginMode::from_resource_name("uinput.dev/js"),
            PluginMode::Devices
        );
        assert_eq!(
            PluginMode::from_resource_name("uinput.dev/pod"),
            PluginMode::Control
        );
        assert_eq!(
            PluginMode::from_resource_name("uinput.dev/container"),
            PluginMode::Control
        );
    }

    #[test]
    fn test_resource_name_must_contain_slash() {
        let root = tempfile::tempdir().unwrap();
        let inventory = empty_inventory(root.path());
        let err = PluginServer::new(
            inventory,
            PluginMode::Devices,
            "mouse".to_owned(),
            "/dev/input",
            "/tmp/.uinput",
            Vec::new(),
            "/device-plugin",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidResourceName(_)));
    }
}
