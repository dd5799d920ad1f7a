//! Resource discovery: walks the input-device sysfs tree and the control
//! socket directory to build the advertisable inventory.
//!
//! The inventory maps are owned by [`Inventory`] and reachable only through
//! its accessors. Discovery passes are idempotent; re-running them over an
//! unchanged tree yields an identical inventory.

use std::fmt;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use regex::Regex;

/// Directory entries naming an input class entry.
const INPUT_PATTERN: &str = "^input[0-9]+$";
/// Directory entries naming an event interface below an input entry.
const EVENT_PATTERN: &str = "^event[0-9]+$";
/// Name every allocated control socket is exposed under inside containers.
const CONTROL_SOCKET_CONTAINER_NAME: &str = "uinputctl";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read directory `{path}`: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid device pattern `{pattern}`: {source}")]
    DevicePattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Advertised health of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    /// The kubelet's health constants.
    pub fn as_str(self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Unhealthy => "Unhealthy",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One advertisable device entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub id: String,
    pub health: Health,
}

/// One pre-provisioned control socket available for allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub health: Health,
}

/// The discovered resource inventory.
#[derive(Debug)]
pub struct Inventory {
    dev_directory: PathBuf,
    sys_directory: PathBuf,
    socket_directory: PathBuf,
    device_re: Regex,
    input_re: Regex,
    event_re: Regex,
    /// Advertised event devices, keyed and identified by event name.
    event_devices: DashMap<String, DeviceEntry>,
    /// Device-node names, keyed by the corresponding event name.
    input_devices: DashMap<String, DeviceEntry>,
    /// Control mounts, keyed by socket name.
    control_mounts: DashMap<String, ControlMount>,
}

impl Inventory {
    pub fn new(
        dev_directory: impl Into<PathBuf>,
        sys_directory: impl Into<PathBuf>,
        socket_directory: impl Into<PathBuf>,
        device_pattern: &str,
    ) -> Result<Self, Error> {
        let device_re = Regex::new(device_pattern).map_err(|source| Error::DevicePattern {
            pattern: device_pattern.to_owned(),
            source,
        })?;
        Ok(Self {
            dev_directory: dev_directory.into(),
            sys_directory: sys_directory.into(),
            socket_directory: socket_directory.into(),
            device_re,
            input_re: Regex::new(INPUT_PATTERN).expect("input pattern is valid"),
            event_re: Regex::new(EVENT_PATTERN).expect("event pattern is valid"),
            event_devices: DashMap::default(),
            input_devices: DashMap::default(),
            control_mounts: DashMap::default(),
        })
    }

    /// Runs both discovery passes.
    pub fn discover(&self) -> Result<(), Error> {
        self.discover_inputs()?;
        self.discover_controls()
    }

    /// Walks the sysfs input-class tree and registers every (event, device)
    /// pair found.
    pub fn discover_inputs(&self) -> Result<(), Error> {
        log::info!("looking for devices in: {}", self.sys_directory.display());
        self.walk_inputs(|input_name, event_name, device_name| {
            log::info!("found {input_name} evdev: `{event_name}`, device: `{device_name}`");
            self.set_input_device(event_name, device_name, Health::Healthy);
        })
    }

    /// Walks the control socket directory and registers every socket
    /// matching the device pattern.
    pub fn discover_controls(&self) -> Result<(), Error> {
        log::info!(
            "looking for control sockets in: {}",
            self.socket_directory.display()
        );
        for name in list_dir_names(&self.socket_directory)? {
            if self.device_re.is_match(&name) {
                self.set_control_socket(name, Health::Healthy);
            }
        }
        Ok(())
    }

    /// Counts the (event, device) pairs a discovery pass would register,
    /// without touching the inventory.
    pub fn discover_num_inputs(&self) -> Result<usize, Error> {
        let mut count = 0;
        self.walk_inputs(|_, _, _| count += 1)?;
        Ok(count)
    }

    /// Counts the control sockets a discovery pass would register.
    pub fn discover_num_controls(&self) -> Result<usize, Error> {
        let names = list_dir_names(&self.socket_directory)?;
        Ok(names
            .into_iter()
            .filter(|name| self.device_re.is_match(name))
            .count())
    }

    fn walk_inputs(&self, mut found: impl FnMut(&str, String, String)) -> Result<(), Error> {
        for input_name in list_dir_names(&self.sys_directory)? {
            let input_dir = self.sys_directory.join(&input_name);
            if !self.input_re.is_match(&input_name) || !input_dir.is_dir() {
                continue;
            }

            let mut event_name = None;
            let mut device_name = None;
            for child in list_dir_names(&input_dir)? {
                if !input_dir.join(&child).is_dir() {
                    continue;
                }
                if self.event_re.is_match(&child) {
                    event_name = Some(child);
                } else if self.device_re.is_match(&child) {
                    device_name = Some(child);
                }
            }

            let Some(event_name) = event_name else {
                continue;
            };
            if device_name.is_none() {
                device_name = self.device_name_from_links(&event_name)?;
            }
            if let Some(device_name) = device_name {
                found(&input_name, event_name, device_name);
            }
        }
        Ok(())
    }

    /// Fallback for input entries without a device child: scans the device
    /// node directory for a symlink matching the device pattern whose
    /// target is the event node.
    fn device_name_from_links(&self, event_name: &str) -> Result<Option<String>, Error> {
        for name in list_dir_names(&self.dev_directory)? {
            if !self.device_re.is_match(&name) {
                continue;
            }
            let Ok(target) = std::fs::read_link(self.dev_directory.join(&name)) else {
                continue;
            };
            if target.file_name() == Some(std::ffi::OsStr::new(event_name)) {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }

    fn set_input_device(&self, event_name: String, device_name: String, health: Health) {
        self.event_devices.insert(
            event_name.clone(),
            DeviceEntry {
                id: event_name.clone(),
                health,
            },
        );
        self.input_devices.insert(
            event_name,
            DeviceEntry {
                id: device_name,
                health,
            },
        );
    }

    fn set_control_socket(&self, socket_name: String, health: Health) {
        self.control_mounts.insert(
            socket_name.clone(),
            ControlMount {
                host_path: self.socket_directory.join(&socket_name),
                container_path: self.socket_directory.join(CONTROL_SOCKET_CONTAINER_NAME),
                health,
            },
        );
    }

    /// Whether the number of discoverable devices differs from the
    /// advertised inventory. Probe errors are logged and treated as no
    /// change.
    pub fn has_device_count_changed(&self) -> bool {
        let advertised = self.input_devices.len();
        match self.discover_num_inputs() {
            Ok(count) if count != advertised => {
                log::info!(
                    "number of devices found has changed ({advertised} -> {count}), stopping device-plugin server"
                );
                true
            }
            Ok(_) => false,
            Err(err) => {
                log::error!("{err}");
                false
            }
        }
    }

    /// Whether the number of discoverable control sockets differs from the
    /// advertised inventory.
    pub fn has_control_count_changed(&self) -> bool {
        let advertised = self.control_mounts.len();
        match self.discover_num_controls() {
            Ok(count) if count != advertised => {
                log::info!(
                    "number of control sockets found has changed ({advertised} -> {count}), stopping device-plugin server"
                );
                true
            }
            Ok(_) => false,
            Err(err) => {
                log::error!("{err}");
                false
            }
        }
    }

    /// Health of a single device.
    pub fn device_state(&self, _id: &str) -> Health {
        // TODO: derive health from the device's sysfs capabilities metadata
        Health::Healthy
    }

    /// Re-evaluates the health of every advertised device. Returns whether
    /// anything changed.
    pub fn check_device_states(&self) -> bool {
        let mut changed = false;
        for map in [&self.event_devices, &self.input_devices] {
            for mut entry in map.iter_mut() {
                let state = self.device_state(entry.key());
                if entry.health != state {
                    changed = true;
                    entry.health = state;
                }
            }
        }
        changed
    }

    /// Re-evaluates the health of every advertised control socket. Returns
    /// whether anything changed.
    pub fn check_control_states(&self) -> bool {
        let mut changed = false;
        for mut entry in self.control_mounts.iter_mut() {
            let state = self.device_state(entry.key());
            if entry.health != state {
                changed = true;
                entry.health = state;
            }
        }
        changed
    }

    /// Snapshot of the advertised event devices.
    pub fn event_devices(&self) -> Vec<DeviceEntry> {
        self.event_devices
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn event_device(&self, id: &str) -> Option<DeviceEntry> {
        self.event_devices.get(id).map(|entry| entry.value().clone())
    }

    /// Name of the device node paired with the event device `id`.
    pub fn input_device_name(&self, id: &str) -> Option<String> {
        self.input_devices.get(id).map(|entry| entry.id.clone())
    }

    /// Snapshot of the advertised control socket names.
    pub fn control_names(&self) -> Vec<String> {
        self.control_mounts
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn control_mount(&self, id: &str) -> Option<ControlMount> {
        self.control_mounts.get(id).map(|entry| entry.value().clone())
    }
}

fn list_dir_names(path: &Path) -> Result<Vec<String>, Error> {
    let entries = std::fs::read_dir(path).map_err(|source| Error::ReadDir {
        path: path.to_path_buf(),
        source,
    })?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| Error::ReadDir {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_owned());
        }
    }
    Ok(names)
}
