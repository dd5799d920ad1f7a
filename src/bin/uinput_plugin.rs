//! Kubernetes device plugin advertising virtual input devices, or control
//! sockets granting the capability to create them, to the kubelet.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use uinput_agent::discovery::Inventory;
use uinput_agent::plugin::{MountPath, PluginMode, PluginServer};
use uinput_agent::trigger;

const DEV_DIRECTORY: &str = "/dev/input";
const SYS_DIRECTORY: &str = "/sys/devices/virtual/input";
const SOCKET_DIRECTORY: &str = "/tmp/.uinput";
/// The helper binary is published to control-mode containers through this
/// host path.
const HELPER_HOST_PATH: &str = "/var/lib/kubelet/device-plugins/uinput-helper";
const HELPER_CONTAINER_NAME: &str = "uinput-helper";

const START_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
struct Args {
    /// Directory the plugin socket is created in.
    #[arg(long = "plugin-directory", default_value = "/device-plugin")]
    plugin_directory: PathBuf,

    /// Name of the Kubernetes resource to register, e.g. uinput.dev/mouse,
    /// uinput.dev/js, uinput.dev/pod or uinput.dev/container.
    #[arg(long = "resource-name", default_value = "uinput.dev/mouse")]
    resource_name: String,

    /// Regular expression matching device names in /dev/input.
    #[arg(long = "device-pattern", default_value = "^mouse[0-9]+$")]
    device_pattern: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    log::info!("device-plugin started");

    let mode = PluginMode::from_resource_name(&args.resource_name);
    let socket_directory = PathBuf::from(SOCKET_DIRECTORY);

    let mut mount_paths = Vec::new();
    if mode == PluginMode::Control {
        let marker = if args.resource_name.ends_with("/pod") {
            trigger::POD_MODE_MARKER
        } else {
            trigger::CONTAINER_MODE_MARKER
        };
        let marker_path = socket_directory.join(marker);
        mount_paths.push(MountPath {
            host_path: marker_path.clone(),
            container_path: marker_path,
        });
        mount_paths.push(MountPath {
            host_path: PathBuf::from(HELPER_HOST_PATH),
            container_path: socket_directory.join(HELPER_CONTAINER_NAME),
        });
    }

    let inventory = Arc::new(Inventory::new(
        DEV_DIRECTORY,
        SYS_DIRECTORY,
        &socket_directory,
        &args.device_pattern,
    )?);

    // Keep trying until success; a supported device may not be attached
    // yet. Non-default log level to avoid spam.
    loop {
        match inventory.discover() {
            Ok(()) => break,
            Err(err) => {
                log::debug!("initial discovery failed: {err}");
                tokio::time::sleep(START_RETRY_INTERVAL).await;
            }
        }
    }

    let server = PluginServer::new(
        inventory,
        mode,
        args.resource_name,
        DEV_DIRECTORY,
        socket_directory,
        mount_paths,
        args.plugin_directory,
    )?;
    server.serve().await?;
    Ok(())
}
