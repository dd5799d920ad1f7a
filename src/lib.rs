//! uinput agent: a Kubernetes device plugin and hot-plug engine for virtual
//! input devices.
//!
//! The crate ships three binaries built on this library:
//!
//! - `uinput_plugin` registers with the kubelet as a device plugin and
//!   advertises either individual input event devices or pre-provisioned
//!   control sockets, depending on the configured resource name.
//! - `uinput_monitor` runs on the host: it serves the control sockets,
//!   tails the kernel's input-subsystem uevents and correlates both streams
//!   to hot-plug freshly created device nodes into the running container
//!   (or pod) that asked for them, without a restart.
//! - `uinput_helper` runs inside the privileged container and reports
//!   open/close activity on `/dev/uinput` back through the mounted control
//!   socket.

pub mod cgroup;
pub mod correlate;
pub mod discovery;
pub mod event;
pub mod fsutil;
pub mod grpc;
pub mod hostsrv;
pub mod inject;
pub mod logext;
pub mod plugin;
pub mod runtime;
pub mod trigger;
pub mod udev;

// Kubelet device-plugin API. The proto package is plain `v1beta1` so the
// generated method paths match the kubelet's.
pub mod deviceplugin {
    pub mod v1beta1 {
        tonic::include_proto!("v1beta1");
    }
}

pub mod inputctl {
    pub mod v1 {
        tonic::include_proto!("inputctl.v1");
    }
}

pub mod containerd {
    pub mod services {
        pub mod containers {
            pub mod v1 {
                tonic::include_proto!("containerd.services.containers.v1");
            }
        }
        pub mod tasks {
            pub mod v1 {
                tonic::include_proto!("containerd.services.tasks.v1");
            }
        }
    }
}
