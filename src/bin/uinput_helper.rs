//! In-container helper reporting control-device open/close activity to the
//! host monitor through the mounted control socket.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
struct Args {
    /// The unix socket of the host monitor to connect to.
    #[arg(long = "server", default_value = "/tmp/.uinput/uinputctl")]
    server: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let pod_name = std::fs::read_to_string("/etc/hostname")
        .or_else(|_| std::fs::read_to_string("/proc/sys/kernel/hostname"))?
        .trim()
        .to_owned();

    uinput_agent::trigger::watch(&args.server, &pod_name).await?;
    Ok(())
}
