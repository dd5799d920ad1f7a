//! Container runtime adapter: pushes device nodes into (and out of)
//! running containers.
//!
//! Grants and revocations are best effort. Each consists of two independent
//! steps, a device-cgroup rule and an in-container node mutation; a failure
//! in either step is logged and neither retried nor rolled back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cgroup::{self, Rule};
use crate::logext::ResultOkLogExt;
use crate::runtime::{ContainerID, ContainerRuntime};

/// Character-device major/minor numbers.
///
/// Cached per device path by the correlation engine, because the sysfs
/// entry is already gone by the time the device's removal is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNumbers {
    pub major: u32,
    pub minor: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Cgroup(#[from] cgroup::Error),
    #[error(transparent)]
    Read(#[from] crate::fsutil::FsError),
    #[error("invalid device numbers `{content}` in `{path}`, expected `major:minor`")]
    InvalidNumbers { path: PathBuf, content: String },
}

/// Mutations the correlation engine applies to target containers.
///
/// `grant` and `revoke` are fire-and-forget: implementations log failures
/// and never propagate them.
#[async_trait::async_trait]
pub trait DeviceInjector: Send + Sync {
    /// Allows `numbers` in the container's device cgroup and creates the
    /// device node at `device_path` inside the container.
    async fn grant(&self, container: &ContainerID, device_path: &Path, numbers: DeviceNumbers);

    /// Denies `numbers` in the container's device cgroup and removes the
    /// device node at `device_path` inside the container.
    async fn revoke(&self, container: &ContainerID, device_path: &Path, numbers: DeviceNumbers);

    /// All container ids in the pod whose cgroup contains `container`.
    fn pod_containers(&self, container: &ContainerID) -> Result<Vec<ContainerID>, Error>;

    /// Major/minor numbers of the input event device named `event_name`.
    fn device_numbers(&self, event_name: &str) -> Result<DeviceNumbers, Error>;
}

/// Production injector working against the devices cgroup hierarchy and the
/// container runtime's exec facility.
pub struct Injector {
    runtime: Arc<dyn ContainerRuntime>,
    sysfs_prefix: PathBuf,
    device_file_mode: u32,
}

impl Injector {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        sysfs_prefix: impl Into<PathBuf>,
        device_file_mode: u32,
    ) -> Self {
        Self {
            runtime,
            sysfs_prefix: sysfs_prefix.into(),
            device_file_mode,
        }
    }

    fn write_rule(&self, container: &ContainerID, rule: Rule, numbers: DeviceNumbers) {
        let result = cgroup::device_rule_file(&self.sysfs_prefix, container.as_ref(), rule)
            .and_then(|path| cgroup::write_device_rule(&path, numbers.major, numbers.minor));
        if let Err(err) = result {
            log::error!(
                "failed to update device cgroup of container `{}` for {}:{}: {}",
                container,
                numbers.major,
                numbers.minor,
                err
            );
        }
    }

    async fn exec(&self, container: &ContainerID, argv: Vec<String>, what: &str) {
        if let Err(err) = self.runtime.exec(container, &argv).await {
            log::error!("failed to {what} in container `{container}`: {err}");
        }
    }
}

#[async_trait::async_trait]
impl DeviceInjector for Injector {
    async fn grant(&self, container: &ContainerID, device_path: &Path, numbers: DeviceNumbers) {
        self.write_rule(container, Rule::Allow, numbers);

        let node = device_path.display();
        let dir = device_path
            .parent()
            .unwrap_or_else(|| Path::new("/dev"))
            .display();
        let script = format!(
            "mkdir -p {dir}; [ -e {node} ] || mknod -m {mode:o} {node} c {major} {minor}",
            mode = self.device_file_mode,
            major = numbers.major,
            minor = numbers.minor,
        );
        let argv = vec!["/bin/sh".to_owned(), "-c".to_owned(), script];
        self.exec(container, argv, "create device node").await;
    }

    async fn revoke(&self, container: &ContainerID, device_path: &Path, numbers: DeviceNumbers) {
        self.write_rule(container, Rule::Deny, numbers);

        let argv = vec![
            "/bin/rm".to_owned(),
            "-f".to_owned(),
            device_path.display().to_string(),
        ];
        self.exec(container, argv, "remove device node").await;
    }

    fn pod_containers(&self, container: &ContainerID) -> Result<Vec<ContainerID>, Error> {
        let ids = cgroup::pod_container_ids(&self.sysfs_prefix, container.as_ref())?;
        Ok(ids
            .into_iter()
            .filter_map(|id| ContainerID::new(&id).ok_log())
            .collect())
    }

    fn device_numbers(&self, event_name: &str) -> Result<DeviceNumbers, Error> {
        let pattern = format!(
            "{}/sys/devices/virtual/input/*/{}/dev",
            self.sysfs_prefix.display(),
            event_name
        );
        let path = cgroup::glob_one(&pattern)?;
        let content = crate::fsutil::read_trimmed(&path)?;

        let invalid = || Error::InvalidNumbers {
            path: path.clone(),
            content: content.clone(),
        };
        let (major, minor) = content.split_once(':').ok_or_else(invalid)?;
        let major = major.parse().map_err(|_| invalid())?;
        let minor = minor.parse().map_err(|_| invalid())?;
        Ok(DeviceNumbers { major, minor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoRuntime;

    #[async_trait::async_trait]
    impl ContainerRuntime for NoRuntime {
        async fn find_container_with_mount(
            &self,
            _source: &Path,
        ) -> crate::runtime::Result<Option<ContainerID>> {
            Ok(None)
        }

        async fn exec(&self, _container: &ContainerID, _argv: &[String]) -> crate::runtime::Result<()> {
            Ok(())
        }
    }

    fn injector(prefix: &Path) -> Injector {
        Injector::new(Arc::new(NoRuntime), prefix, 0o666)
    }

    fn sysfs_fixture(root: &Path, input: &str, event: &str, dev: &str) {
        let dir = root
            .join("sys/devices/virtual/input")
            .join(input)
            .join(event);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("dev"), dev).unwrap();
    }

    #[test]
    fn test_device_numbers_parses_major_minor() {
        let root = tempfile::tempdir().unwrap();
        sysfs_fixture(root.path(), "input23", "event5", "13:64\n");

        let numbers = injector(root.path()).device_numbers("event5").unwrap();
        assert_eq!(
            numbers,
            DeviceNumbers {
                major: 13,
                minor: 64
            }
        );
    }

    #[test]
    fn test_device_numbers_requires_single_match() {
        let root = tempfile::tempdir().unwrap();
        sysfs_fixture(root.path(), "input23", "event5", "13:64");
        sysfs_fixture(root.path(), "input24", "event5", "13:65");

        let err = injector(root.path()).device_numbers("event5").unwrap_err();
        assert!(matches!(
            err,
            Error::Cgroup(cgroup::Error::MatchCount { count: 2, .. })
        ));
    }

    #[test]
    fn test_device_numbers_rejects_garbage() {
        let root = tempfile::tempdir().unwrap();
        sysfs_fixture(root.path(), "input23", "event5", "not-a-devnum");

        let err = injector(root.path()).device_numbers("event5").unwrap_err();
        assert!(matches!(err, Error::InvalidNumbers { .. }));
    }
}
