//! Host-side monitor: serves the pre-provisioned control sockets, tails
//! kernel input uevents and hot-plugs the resulting device nodes into
//! running containers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use uinput_agent::correlate::Engine;
use uinput_agent::inject::Injector;
use uinput_agent::runtime::ContainerRuntime;
use uinput_agent::runtime::containerd::Containerd;
use uinput_agent::{fsutil, hostsrv, trigger, udev};

const DEV_DIRECTORY: &str = "/dev/input";
/// Name prefix of the pre-provisioned control sockets.
const CONTROL_SOCKET_PREFIX: &str = "uinputctl";

#[derive(Debug, Parser)]
struct Args {
    /// Directory to create control sockets in.
    #[arg(long = "socket-dir", default_value = "/tmp/.uinput")]
    socket_directory: PathBuf,

    /// The number of control sockets to create.
    #[arg(long = "num-sockets", default_value_t = 16)]
    num_sockets: usize,

    /// File to create once all sockets have been created.
    #[arg(long = "ready-file", default_value = "/tmp/.uinput/ctl_devices_ready")]
    ready_file: PathBuf,

    /// Prefix where the host /sys is mounted.
    #[arg(long = "sys-prefix", default_value = "/hostfs")]
    sys_prefix: PathBuf,

    /// Default mode for device files created in containers, octal.
    #[arg(long = "device-file-mode", default_value = "0666")]
    device_file_mode: String,

    /// Path of the containerd socket.
    #[arg(
        long = "containerd-socket",
        default_value = "/run/containerd/containerd.sock"
    )]
    containerd_socket: PathBuf,

    /// containerd namespace the kubelet runs pod containers in.
    #[arg(long = "containerd-namespace", default_value = "k8s.io")]
    containerd_namespace: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let device_file_mode = u32::from_str_radix(&args.device_file_mode, 8).map_err(|err| {
        format!(
            "invalid device file mode `{}`: {}",
            args.device_file_mode, err
        )
    })?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        Containerd::connect(&args.containerd_socket, &args.containerd_namespace).await?,
    );

    fsutil::remove_if_exists(&args.ready_file)?;

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();

    // Every socket is bound before the ready file appears; that is the
    // readiness contract other processes poll on.
    for i in 0..args.num_sockets {
        let socket_path = args
            .socket_directory
            .join(format!("{CONTROL_SOCKET_PREFIX}{i}"));
        hostsrv::start(socket_path, Arc::clone(&runtime), events_tx.clone())?;
    }

    udev::start(events_tx)?;

    // Static files telling the receiving containers which mode the plugin
    // is deployed in, container or whole pod.
    for marker in [trigger::CONTAINER_MODE_MARKER, trigger::POD_MODE_MARKER] {
        fsutil::touch(args.socket_directory.join(marker))?;
    }

    fsutil::touch(&args.ready_file)?;
    log::info!("initialized uinput device monitor, waiting for trigger events");

    let injector = Arc::new(Injector::new(runtime, args.sys_prefix, device_file_mode));
    Engine::new(injector, events_rx, DEV_DIRECTORY).run().await;
    Ok(())
}
