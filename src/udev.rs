//! Kernel event source: tails `udevadm monitor` for input-subsystem uevents
//! and republishes add/remove notifications on the shared event bus.

use std::path::PathBuf;
use std::process::Stdio;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::event::{EventKind, EventSender, MonitorEvent};

/// Kernel uevent lines as printed by `udevadm monitor`, e.g.
/// `KERNEL[1234.5678] add /devices/virtual/input/input23/event5 (input)`.
const UDEV_EVENT_PATTERN: &str =
    r"^KERNEL\[([0-9.]+)\] (add|remove)\s+.*?input[0-9]+(/.*[0-9]+) \(input\).*$";

/// Diagnostic output of the monitor process goes here; it is never parsed.
const MONITOR_LOG_FILE: &str = "/var/log/udevmon.log";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to create monitor log file `{path}`: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn `udevadm monitor`: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("`udevadm monitor` did not expose a stdout pipe")]
    MissingStdout,
}

/// An action value the source must stop on rather than re-emit as a
/// mis-typed event.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("unsupported udev monitor action: {0}")]
pub struct UnsupportedAction(String);

/// Parses one monitor output line.
///
/// Lines not matching the uevent pattern yield `Ok(None)` and are dropped
/// silently.
fn parse_monitor_line(
    re: &Regex,
    line: &str,
) -> Result<Option<MonitorEvent>, UnsupportedAction> {
    let Some(caps) = re.captures(line) else {
        return Ok(None);
    };
    let kind = match &caps[2] {
        "add" => EventKind::DeviceAdded,
        "remove" => EventKind::DeviceRemoved,
        other => return Err(UnsupportedAction(other.to_owned())),
    };
    Ok(Some(MonitorEvent::device(kind, &caps[3])))
}

/// Spawns the udev monitor child process and a reader task feeding `events`.
///
/// The reader task is infinite and non-restartable: it ends only when the
/// child's stdout closes, an unsupported action is seen, or the bus is
/// dropped.
pub fn start(events: EventSender) -> Result<(), Error> {
    let re = Regex::new(UDEV_EVENT_PATTERN).expect("udev event pattern is valid");
    let log_file = std::fs::File::create(MONITOR_LOG_FILE).map_err(|source| Error::LogFile {
        path: MONITOR_LOG_FILE.into(),
        source,
    })?;

    let mut child = Command::new("udevadm")
        .args(["monitor", "--subsystem-match", "input"])
        .stdout(Stdio::piped())
        .stderr(Stdio::from(log_file))
        .spawn()
        .map_err(Error::Spawn)?;
    let stdout = child.stdout.take().ok_or(Error::MissingStdout)?;

    tokio::spawn(async move {
        // keep the child handle alive for the lifetime of the reader
        let _child = child;
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_monitor_line(&re, &line) {
                    Ok(Some(event)) => {
                        if events.send(event).is_err() {
                            log::warn!("event bus closed, stopping udev monitor reader");
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        log::error!("{err}");
                        break;
                    }
                },
                Ok(None) => {
                    log::error!("udevadm monitor output ended");
                    break;
                }
                Err(err) => {
                    log::error!("failed to read udevadm monitor output: {err}");
                    break;
                }
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ATTR_PATH;

    fn pattern() -> Regex {
        Regex::new(UDEV_EVENT_PATTERN).unwrap()
    }

    #[test]
    fn test_parse_add_line() {
        let re = pattern();
        let line = "KERNEL[1234.5678] add      /devices/virtual/input/input23/event5 (input)";
        let event = parse_monitor_line(&re, line).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::DeviceAdded);
        assert_eq!(event.attribute(ATTR_PATH), Some("/event5"));
    }

    #[test]
    fn test_parse_remove_line() {
        let re = pattern();
        let line = "KERNEL[99.1] remove   /devices/virtual/input/input7/event12 (input)";
        let event = parse_monitor_line(&re, line).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::DeviceRemoved);
        assert_eq!(event.attribute(ATTR_PATH), Some("/event12"));
    }

    #[test]
    fn test_malformed_lines_are_dropped() {
        let re = pattern();
        for line in [
            "",
            "monitor will print the received events for:",
            "UDEV  [1234.5678] add /devices/virtual/input/input23/event5 (input)",
            "KERNEL[1234.5678] bind /devices/virtual/input/input23/event5 (input)",
            "KERNEL[1234.5678] add /devices/virtual/misc/uhid (misc)",
        ] {
            assert_eq!(parse_monitor_line(&re, line).unwrap(), None, "line: {line}");
        }
    }
}
