//! The device-plugin gRPC service: inventory streaming and allocation.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::deviceplugin::v1beta1::device_plugin_server::DevicePlugin;
use crate::deviceplugin::v1beta1::{
    AllocateRequest, AllocateResponse, ContainerAllocateResponse, Device, DevicePluginOptions,
    DeviceSpec, Empty, ListAndWatchResponse, Mount, PreStartContainerRequest,
    PreStartContainerResponse,
};
use crate::discovery::{Health, Inventory};

use super::{MountPath, PluginMode};

/// Cgroup permissions granted on injected devices: mknod, read, write.
const DEVICE_PERMISSIONS: &str = "mrw";
/// Host device granting virtual-device creation capability in control mode.
const UINPUT_DEVICE: &str = "/dev/uinput";
/// Poll interval between health re-checks while streaming ListAndWatch.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Per-serving-cycle service state.
pub(super) struct PluginService {
    inventory: Arc<Inventory>,
    mode: PluginMode,
    resource_base: String,
    dev_directory: PathBuf,
    socket_directory: PathBuf,
    mount_paths: Vec<MountPath>,
}

impl PluginService {
    pub(super) fn new(server: &super::PluginServer) -> Self {
        Self {
            inventory: Arc::clone(&server.inventory),
            mode: server.mode,
            resource_base: server.resource_base.clone(),
            dev_directory: server.dev_directory.clone(),
            socket_directory: server.socket_directory.clone(),
            mount_paths: server.mount_paths.clone(),
        }
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// The device list advertised to the kubelet for the given mode.
fn advertised_devices(inventory: &Inventory, mode: PluginMode) -> Vec<Device> {
    match mode {
        PluginMode::Devices => inventory
            .event_devices()
            .into_iter()
            .map(|entry| Device {
                id: entry.id,
                health: entry.health.to_string(),
            })
            .collect(),
        PluginMode::Control => inventory
            .control_names()
            .into_iter()
            .map(|id| Device {
                id,
                health: Health::Healthy.to_string(),
            })
            .collect(),
    }
}

/// Builds the allocation response for one container request.
///
/// Requests naming an unknown or unhealthy resource are rejected with an
/// explicit error; nothing is substituted.
fn allocate_container(
    inventory: &Inventory,
    mode: PluginMode,
    resource_base: &str,
    dev_directory: &Path,
    socket_directory: &Path,
    mount_paths: &[MountPath],
    devices_ids: &[String],
) -> Result<ContainerAllocateResponse, Status> {
    let mut response = ContainerAllocateResponse::default();

    match mode {
        PluginMode::Devices => {
            for (dev_num, id) in devices_ids.iter().enumerate() {
                let Some(device) = inventory.event_device(id) else {
                    return Err(Status::not_found(format!(
                        "invalid allocation request with non-existing device {id}"
                    )));
                };
                if device.health != Health::Healthy {
                    return Err(Status::failed_precondition(format!(
                        "invalid allocation request with unhealthy device {id}"
                    )));
                }
                let event_node = dev_directory.join(id);

                // the event device under its kernel name
                response.devices.push(DeviceSpec {
                    container_path: path_string(&event_node),
                    host_path: path_string(&event_node),
                    permissions: DEVICE_PERMISSIONS.to_owned(),
                });
                // and again under a stable per-allocation alias
                response.devices.push(DeviceSpec {
                    container_path: path_string(
                        &dev_directory
                            .join("evdev")
                            .join(format!("{resource_base}{dev_num}")),
                    ),
                    host_path: path_string(&event_node),
                    permissions: DEVICE_PERMISSIONS.to_owned(),
                });
                // the paired device node under the alias name
                if let Some(input_name) = inventory.input_device_name(id) {
                    response.devices.push(DeviceSpec {
                        container_path: path_string(
                            &dev_directory.join(format!("{resource_base}{dev_num}")),
                        ),
                        host_path: path_string(&dev_directory.join(input_name)),
                        permissions: DEVICE_PERMISSIONS.to_owned(),
                    });
                }
                // the per-device control socket, the one writable mount
                response.mounts.push(Mount {
                    container_path: path_string(
                        &socket_directory.join(format!("{resource_base}{dev_num}ctl")),
                    ),
                    host_path: path_string(&socket_directory.join(id)),
                    read_only: false,
                });
            }
        }
        PluginMode::Control => {
            // only one control socket per request is honored
            if let Some(id) = devices_ids.first() {
                let Some(mount) = inventory.control_mount(id) else {
                    return Err(Status::not_found(format!(
                        "invalid allocation request with non-existing device: {id}"
                    )));
                };
                response.mounts.push(Mount {
                    container_path: path_string(&mount.container_path),
                    host_path: path_string(&mount.host_path),
                    read_only: false,
                });
            }
            // the device used to create new virtual input devices
            response.devices.push(DeviceSpec {
                container_path: UINPUT_DEVICE.to_owned(),
                host_path: UINPUT_DEVICE.to_owned(),
                permissions: DEVICE_PERMISSIONS.to_owned(),
            });
        }
    }

    for mount_path in mount_paths {
        response.mounts.push(Mount {
            container_path: path_string(&mount_path.container_path),
            host_path: path_string(&mount_path.host_path),
            read_only: true,
        });
    }

    Ok(response)
}

#[tonic::async_trait]
impl DevicePlugin for PluginService {
    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send + 'static>>;

    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(DevicePluginOptions::default()))
    }

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        log::info!("device-plugin: ListAndWatch start");
        let inventory = Arc::clone(&self.inventory);
        let mode = self.mode;
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tokio::spawn(async move {
            let mut changed = true;
            loop {
                if changed {
                    let response = ListAndWatchResponse {
                        devices: advertised_devices(&inventory, mode),
                    };
                    log::info!("ListAndWatch: send devices {response:?}");
                    if tx.send(Ok(response)).await.is_err() {
                        log::error!("device-plugin: cannot update device states: stream closed");
                        return;
                    }
                }
                tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;
                changed = match mode {
                    PluginMode::Devices => inventory.check_device_states(),
                    PluginMode::Control => inventory.check_control_states(),
                };
            }
        });
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let mut response = AllocateResponse::default();
        for container_request in &request.get_ref().container_requests {
            let container_response = allocate_container(
                &self.inventory,
                self.mode,
                &self.resource_base,
                &self.dev_directory,
                &self.socket_directory,
                &self.mount_paths,
                &container_request.devices_ids,
            )
            .inspect_err(|status| {
                log::warn!("device-plugin: rejecting allocation: {}", status.message());
            })?;
            response.container_responses.push(container_response);
        }
        Ok(Response::new(response))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        log::error!("device-plugin: PreStartContainer should not be called for this plugin");
        Ok(Response::new(PreStartContainerResponse::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices_inventory() -> (tempfile::TempDir, Inventory) {
        let root = tempfile::tempdir().unwrap();
        let sys = root.path().join("sys");
        let dev = root.path().join("dev");
        let sockets = root.path().join("sockets");
        std::fs::create_dir_all(sys.join("input3/event3")).unwrap();
        std::fs::create_dir_all(sys.join("input3/mouse0")).unwrap();
        std::fs::create_dir_all(&dev).unwrap();
        std::fs::create_dir_all(&sockets).unwrap();

        let inventory = Inventory::new(&dev, &sys, &sockets, "^mouse[0-9]+$").unwrap();
        inventory.discover().unwrap();
        (root, inventory)
    }

    fn controls_inventory() -> (tempfile::TempDir, Inventory) {
        let root = tempfile::tempdir().unwrap();
        let sockets = root.path().join("sockets");
        std::fs::create_dir_all(root.path().join("sys")).unwrap();
        std::fs::create_dir_all(root.path().join("dev")).unwrap();
        std::fs::create_dir_all(&sockets).unwrap();
        for name in ["uinputctl0", "uinputctl1"] {
            std::fs::write(sockets.join(name), "").unwrap();
        }

        let inventory = Inventory::new(
            root.path().join("dev"),
            root.path().join("sys"),
            &sockets,
            "^uinputctl[0-9]+$",
        )
        .unwrap();
        inventory.discover().unwrap();
        (root, inventory)
    }

    #[test]
    fn test_allocate_unknown_device_is_rejected() {
        let (_root, inventory) = devices_inventory();
        let err = allocate_container(
            &inventory,
            PluginMode::Devices,
            "mouse",
            Path::new("/dev/input"),
            Path::new("/tmp/.uinput"),
            &[],
            &["event99".to_owned()],
        )
        .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[test]
    fn test_allocate_devices_mode_response_shape() {
        let (_root, inventory) = devices_inventory();
        let response = allocate_container(
            &inventory,
            PluginMode::Devices,
            "mouse",
            Path::new("/dev/input"),
            Path::new("/tmp/.uinput"),
            &[],
            &["event3".to_owned()],
        )
        .unwrap();

        let paths: Vec<(String, String)> = response
            .devices
            .iter()
            .map(|spec| (spec.host_path.clone(), spec.container_path.clone()))
            .collect();
        assert_eq!(
            paths,
            vec![
                ("/dev/input/event3".to_owned(), "/dev/input/event3".to_owned()),
                ("/dev/input/event3".to_owned(), "/dev/input/evdev/mouse0".to_owned()),
                ("/dev/input/mouse0".to_owned(), "/dev/input/mouse0".to_owned()),
            ]
        );
        assert!(
            response
                .devices
                .iter()
                .all(|spec| spec.permissions == DEVICE_PERMISSIONS)
        );

        assert_eq!(response.mounts.len(), 1);
        let mount = &response.mounts[0];
        assert_eq!(mount.host_path, "/tmp/.uinput/event3");
        assert_eq!(mount.container_path, "/tmp/.uinput/mouse0ctl");
        assert!(!mount.read_only);
    }

    #[test]
    fn test_allocate_control_mode_response_shape() {
        let (root, inventory) = controls_inventory();
        let sockets = root.path().join("sockets");
        let marker = MountPath {
            host_path: sockets.join("uinput_type_pod"),
            container_path: sockets.join("uinput_type_pod"),
        };

        let response = allocate_container(
            &inventory,
            PluginMode::Control,
            "pod",
            Path::new("/dev/input"),
            &sockets,
            std::slice::from_ref(&marker),
            &["uinputctl1".to_owned(), "uinputctl0".to_owned()],
        )
        .unwrap();

        // only the first requested socket is honored
        assert_eq!(response.mounts.len(), 2);
        assert_eq!(
            response.mounts[0].host_path,
            sockets.join("uinputctl1").to_string_lossy()
        );
        assert_eq!(
            response.mounts[0].container_path,
            sockets.join("uinputctl").to_string_lossy()
        );
        assert!(!response.mounts[0].read_only);
        // the statically configured marker mount is read-only
        assert!(response.mounts[1].read_only);

        assert_eq!(response.devices.len(), 1);
        assert_eq!(response.devices[0].host_path, UINPUT_DEVICE);
        assert_eq!(response.devices[0].permissions, DEVICE_PERMISSIONS);
    }

    #[test]
    fn test_allocate_control_mode_unknown_socket_is_rejected() {
        let (_root, inventory) = controls_inventory();
        let err = allocate_container(
            &inventory,
            PluginMode::Control,
            "pod",
            Path::new("/dev/input"),
            Path::new("/tmp/.uinput"),
            &[],
            &["uinputctl9".to_owned()],
        )
        .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[test]
    fn test_advertised_devices_by_mode() {
        let (_root, inventory) = devices_inventory();
        let devices = advertised_devices(&inventory, PluginMode::Devices);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "event3");
        assert_eq!(devices[0].health, "Healthy");

        let (_root, inventory) = controls_inventory();
        let mut ids: Vec<_> = advertised_devices(&inventory, PluginMode::Control)
            .into_iter()
            .map(|device| device.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["uinputctl0", "uinputctl1"]);
    }
}
