//! containerd-backed implementation of [`ContainerRuntime`].
//!
//! Containers are looked up through the containers service, decoding the
//! JSON-encoded OCI spec attached to each record to inspect mount sources.
//! Commands run through the tasks service as exec processes with null IO.

use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use prost_types::Any;
use serde::Deserialize;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;

use crate::containerd::services::containers::v1::ListContainersRequest;
use crate::containerd::services::containers::v1::containers_client::ContainersClient;
use crate::containerd::services::tasks::v1::tasks_client::TasksClient;
use crate::containerd::services::tasks::v1::{ExecProcessRequest, StartRequest};

use super::{ContainerID, ContainerRuntime, Error, Result};

/// Type URL containerd expects for a JSON-encoded OCI process spec.
const PROCESS_SPEC_TYPE_URL: &str =
    "types.containerd.io/opencontainers/runtime-spec/1.0.2/Process";

/// Subset of the OCI runtime spec needed for mount-source lookup.
#[derive(Debug, Deserialize)]
struct OciSpec {
    #[serde(default)]
    mounts: Vec<OciMount>,
}

#[derive(Debug, Deserialize)]
struct OciMount {
    #[serde(default)]
    source: String,
}

pub struct Containerd {
    channel: Channel,
    namespace: String,
    // exec ids must be unique per task; the prefix keeps them unique across
    // agent restarts as well
    exec_prefix: u64,
    exec_counter: AtomicU64,
}

impl Containerd {
    /// Connects to the containerd socket at `socket_path`. All calls are
    /// scoped to `namespace`.
    pub async fn connect(
        socket_path: impl AsRef<Path>,
        namespace: impl Into<String>,
    ) -> Result<Self> {
        let socket_path = socket_path.as_ref();
        let channel = crate::grpc::channel_for_unix_socket(socket_path)
            .await
            .map_err(|source| Error::SocketConnect {
                path: socket_path.to_path_buf(),
                source,
            })?;
        let exec_prefix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Ok(Self {
            channel,
            namespace: namespace.into(),
            exec_prefix,
            exec_counter: AtomicU64::new(0),
        })
    }

    fn namespaced<T>(&self, message: T) -> Result<tonic::Request<T>> {
        let value = MetadataValue::from_str(&self.namespace)
            .map_err(|_| Error::Namespace(self.namespace.clone()))?;
        let mut request = tonic::Request::new(message);
        request.metadata_mut().insert("containerd-namespace", value);
        Ok(request)
    }

    fn next_exec_id(&self) -> String {
        format!(
            "uinput-{}-{}",
            self.exec_prefix,
            self.exec_counter.fetch_add(1, Ordering::Relaxed)
        )
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for Containerd {
    async fn find_container_with_mount(&self, source: &Path) -> Result<Option<ContainerID>> {
        let mut client = ContainersClient::new(self.channel.clone());
        let request = self.namespaced(ListContainersRequest {
            filters: Vec::default(),
        })?;
        let response = client.list(request).await.map_err(|source| Error::Rpc {
            call: "containers.List",
            source: Box::new(source),
        })?;

        for container in response.into_inner().containers {
            let Some(spec) = container.spec else {
                continue;
            };
            let spec: OciSpec = match serde_json::from_slice(&spec.value) {
                Ok(spec) => spec,
                Err(err) => {
                    log::warn!(
                        "failed to decode OCI spec for container `{}`: {}",
                        container.id,
                        err
                    );
                    continue;
                }
            };
            if spec.mounts.iter().any(|m| Path::new(&m.source) == source) {
                return ContainerID::new(&container.id).map(Some);
            }
        }

        Ok(None)
    }

    async fn exec(&self, container: &ContainerID, argv: &[String]) -> Result<()> {
        let exec_id = self.next_exec_id();
        let process = serde_json::json!({
            "args": argv,
            "cwd": "/",
            "user": { "uid": 0, "gid": 0 },
            "env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"],
            "terminal": false,
        });
        let value = serde_json::to_vec(&process).map_err(Error::SpecEncode)?;

        let mut client = TasksClient::new(self.channel.clone());
        // empty stdio paths select null IO on the containerd side
        let request = self.namespaced(ExecProcessRequest {
            container_id: container.as_ref().to_owned(),
            stdin: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            terminal: false,
            spec: Some(Any {
                type_url: PROCESS_SPEC_TYPE_URL.to_owned(),
                value,
            }),
            exec_id: exec_id.clone(),
        })?;
        client.exec(request).await.map_err(|source| Error::Rpc {
            call: "tasks.Exec",
            source: Box::new(source),
        })?;

        let request = self.namespaced(StartRequest {
            container_id: container.as_ref().to_owned(),
            exec_id,
        })?;
        client.start(request).await.map_err(|source| Error::Rpc {
            call: "tasks.Start",
            source: Box::new(source),
        })?;

        Ok(())
    }
}
