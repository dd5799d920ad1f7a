//! Device-cgroup manipulation for running containers.
//!
//! The kubelet lays container cgroups out as
//! `<prefix>/sys/fs/cgroup/devices/kubepods/burstable/<pod>/<container>`;
//! the pod directory name is not known to the agent, so container lookups
//! glob over it.

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid glob pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("expected exactly one match for `{pattern}`, found {count}")]
    MatchCount { pattern: String, count: usize },
    #[error("failed to write device rule to `{path}`: {source}")]
    RuleWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Which device-cgroup list a rule is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Allow,
    Deny,
}

impl Rule {
    fn file_name(self) -> &'static str {
        match self {
            Rule::Allow => "devices.allow",
            Rule::Deny => "devices.deny",
        }
    }
}

/// Expands `pattern` and requires exactly one match.
pub(crate) fn glob_one(pattern: &str) -> Result<PathBuf, Error> {
    let paths = glob::glob(pattern).map_err(|source| Error::Pattern {
        pattern: pattern.to_owned(),
        source,
    })?;
    let mut matches: Vec<PathBuf> = paths.filter_map(std::result::Result::ok).collect();
    if matches.len() != 1 {
        return Err(Error::MatchCount {
            pattern: pattern.to_owned(),
            count: matches.len(),
        });
    }
    Ok(matches.remove(0))
}

/// Resolves the `devices.allow` / `devices.deny` file of a container's
/// cgroup under the (possibly re-mounted) host sysfs at `prefix`.
pub fn device_rule_file(prefix: &Path, container: &str, rule: Rule) -> Result<PathBuf, Error> {
    let pattern = format!(
        "{}/sys/fs/cgroup/devices/kubepods/burstable/*/{}/{}",
        prefix.display(),
        container,
        rule.file_name()
    );
    glob_one(&pattern)
}

/// Writes a character-device rule for `major:minor` to `path`.
pub fn write_device_rule(path: &Path, major: u32, minor: u32) -> Result<(), Error> {
    let rule = format!("c {major}:{minor} rwm");
    std::fs::write(path, rule).map_err(|source| Error::RuleWrite {
        path: path.to_path_buf(),
        source,
    })
}

/// Lists the ids of all containers in the pod whose cgroup contains
/// `container`, including `container` itself.
pub fn pod_container_ids(prefix: &Path, container: &str) -> Result<Vec<String>, Error> {
    let pattern = format!(
        "{}/sys/fs/cgroup/devices/kubepods/burstable/*/{}",
        prefix.display(),
        container
    );
    let container_dir = glob_one(&pattern)?;
    let pod_dir = container_dir
        .parent()
        .expect("container cgroup has a pod parent");

    let pattern = format!("{}/*/devices.allow", pod_dir.display());
    let paths = glob::glob(&pattern).map_err(|source| Error::Pattern {
        pattern: pattern.clone(),
        source,
    })?;
    let ids = paths
        .filter_map(std::result::Result::ok)
        .filter_map(|path| {
            path.parent()
                .and_then(|dir| dir.file_name())
                .and_then(|name| name.to_str())
                .map(str::to_owned)
        })
        .collect();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds `<root>/sys/fs/cgroup/devices/kubepods/burstable/<pod>` with
    /// one subdirectory per container id, each holding `devices.allow` and
    /// `devices.deny`.
    fn cgroup_fixture(root: &Path, pod: &str, containers: &[&str]) {
        let pod_dir = root
            .join("sys/fs/cgroup/devices/kubepods/burstable")
            .join(pod);
        for container in containers {
            let dir = pod_dir.join(container);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("devices.allow"), "").unwrap();
            std::fs::write(dir.join("devices.deny"), "").unwrap();
        }
    }

    #[test]
    fn test_device_rule_file_resolves_through_pod_glob() {
        let root = tempfile::tempdir().unwrap();
        cgroup_fixture(root.path(), "pod-uid-1", &["cont-a", "cont-b"]);

        let path = device_rule_file(root.path(), "cont-a", Rule::Allow).unwrap();
        assert!(path.ends_with("pod-uid-1/cont-a/devices.allow"));
        let path = device_rule_file(root.path(), "cont-b", Rule::Deny).unwrap();
        assert!(path.ends_with("pod-uid-1/cont-b/devices.deny"));
    }

    #[test]
    fn test_device_rule_file_unknown_container() {
        let root = tempfile::tempdir().unwrap();
        cgroup_fixture(root.path(), "pod-uid-1", &["cont-a"]);

        let err = device_rule_file(root.path(), "cont-x", Rule::Allow).unwrap_err();
        match err {
            Error::MatchCount { count, .. } => assert_eq!(count, 0),
            other => panic!("expected MatchCount error, got {other}"),
        }
    }

    #[test]
    fn test_write_device_rule_format() {
        let root = tempfile::tempdir().unwrap();
        cgroup_fixture(root.path(), "pod-uid-1", &["cont-a"]);

        let path = device_rule_file(root.path(), "cont-a", Rule::Allow).unwrap();
        write_device_rule(&path, 13, 64).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "c 13:64 rwm");
    }

    #[test]
    fn test_pod_container_ids_lists_siblings() {
        let root = tempfile::tempdir().unwrap();
        cgroup_fixture(root.path(), "pod-uid-1", &["cont-a", "cont-b", "cont-c"]);
        // containers of another pod are not siblings
        cgroup_fixture(root.path(), "pod-uid-2", &["cont-z"]);

        let mut ids = pod_container_ids(root.path(), "cont-b").unwrap();
        ids.sort();
        assert_eq!(ids, vec!["cont-a", "cont-b", "cont-c"]);
    }
}
