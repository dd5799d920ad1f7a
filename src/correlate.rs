//! Event correlation engine: joins control-socket trigger events with the
//! kernel device events they cause, inside fixed-width time windows.
//!
//! There is no transaction boundary between a container opening the control
//! device and the kernel announcing the device nodes it created; the engine
//! approximates the join by bucketing both streams into wall-clock windows.
//! A window holds at most one trigger and any number of device events; on
//! close, every device event is attributed to the window's trigger.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::event::{self, EventKind, EventReceiver, MonitorEvent, TriggerScope};
use crate::inject::{DeviceInjector, DeviceNumbers};
use crate::runtime::ContainerID;

/// Width of one correlation window.
const WINDOW_LENGTH: Duration = Duration::from_millis(20);
/// Cadence of the polling loop; window closing happens on this cadence
/// regardless of event arrival, so the receive must never block.
const LOOP_PERIOD: Duration = Duration::from_millis(5);

/// Accumulator for one correlation window.
#[derive(Default)]
struct Window {
    trigger: Option<MonitorEvent>,
    device_events: Vec<MonitorEvent>,
}

pub struct Engine<I> {
    injector: Arc<I>,
    events: EventReceiver,
    dev_directory: PathBuf,
    window: Window,
    last_close: Instant,
    // never evicted: a later close of the same device path must still find
    // its numbers after repeated open/close toggles
    device_numbers: HashMap<PathBuf, DeviceNumbers>,
}

impl<I: DeviceInjector + 'static> Engine<I> {
    pub fn new(injector: Arc<I>, events: EventReceiver, dev_directory: impl Into<PathBuf>) -> Self {
        Self {
            injector,
            events,
            dev_directory: dev_directory.into(),
            window: Window::default(),
            last_close: Instant::now(),
            device_numbers: HashMap::new(),
        }
    }

    /// Runs the engine until the process exits.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(LOOP_PERIOD);
        loop {
            interval.tick().await;
            if let Ok(event) = self.events.try_recv() {
                self.observe(event);
            }
            self.maybe_close_window(Instant::now());
        }
    }

    /// Records one event into the current window.
    fn observe(&mut self, event: MonitorEvent) {
        log::info!("saw {} event: {:?}", event.kind, event.attributes);
        match event.kind {
            EventKind::TriggerOpened | EventKind::TriggerClosed => {
                if self.window.trigger.is_some() {
                    // Known correlation limit: under rapid toggling a second
                    // trigger steals the whole window's attribution.
                    log::warn!(
                        "trigger event replaces an earlier trigger in the same correlation window"
                    );
                }
                self.window.trigger = Some(event);
            }
            EventKind::DeviceAdded | EventKind::DeviceRemoved => {
                self.window.device_events.push(event);
            }
        }
    }

    /// Closes the window if its span has elapsed, resolving accumulated
    /// device events against the window's trigger.
    fn maybe_close_window(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_close) <= WINDOW_LENGTH {
            return;
        }
        match self.window.trigger.take() {
            Some(trigger) => {
                let device_events = std::mem::take(&mut self.window.device_events);
                self.resolve(&trigger, device_events);
                self.last_close = trigger.timestamp;
            }
            None => {
                // device events with no trigger in their window cannot be
                // attributed to any container
                self.window.device_events.clear();
                self.last_close = now;
            }
        }
    }

    fn resolve(&mut self, trigger: &MonitorEvent, device_events: Vec<MonitorEvent>) {
        let Some(container) = trigger.attribute(event::ATTR_CONTAINER) else {
            log::error!("dropping trigger event without container attribute");
            return;
        };
        let container = match ContainerID::new(container) {
            Ok(container) => container,
            Err(err) => {
                log::error!("dropping trigger event: {err}");
                return;
            }
        };
        let scope = trigger
            .attribute(event::ATTR_MODE)
            .and_then(|mode| mode.parse::<TriggerScope>().ok())
            .unwrap_or(TriggerScope::Container);
        let add = trigger.kind == EventKind::TriggerOpened;

        // one control-socket open may legitimately create several device
        // nodes; all of them belong to this trigger
        for device_event in device_events {
            let Some(kernel_path) = device_event.attribute(event::ATTR_PATH) else {
                continue;
            };
            let Some(file_name) = Path::new(kernel_path).file_name() else {
                continue;
            };
            let device_path = self.dev_directory.join(file_name);

            let targets = match scope {
                TriggerScope::Pod => match self.injector.pod_containers(&container) {
                    Ok(ids) => ids,
                    Err(err) => {
                        log::error!("{err}");
                        vec![container.clone()]
                    }
                },
                TriggerScope::Container => vec![container.clone()],
            };

            if add {
                let event_name = file_name.to_string_lossy();
                let numbers = match self.injector.device_numbers(&event_name) {
                    Ok(numbers) => numbers,
                    Err(err) => {
                        log::error!("{err}");
                        continue;
                    }
                };
                self.device_numbers.insert(device_path.clone(), numbers);
                for target in &targets {
                    let injector = Arc::clone(&self.injector);
                    let target = target.clone();
                    let device_path = device_path.clone();
                    tokio::spawn(async move {
                        injector.grant(&target, &device_path, numbers).await;
                    });
                }
                log::info!(
                    "added device {} to {} container(s)",
                    device_path.display(),
                    targets.len()
                );
            } else {
                let Some(&numbers) = self.device_numbers.get(&device_path) else {
                    log::error!(
                        "no cached device numbers for `{}`, skipping revoke",
                        device_path.display()
                    );
                    continue;
                };
                for target in &targets {
                    let injector = Arc::clone(&self.injector);
                    let target = target.clone();
                    let device_path = device_path.clone();
                    tokio::spawn(async move {
                        injector.revoke(&target, &device_path, numbers).await;
                    });
                }
                log::info!(
                    "removed device {} from {} container(s)",
                    device_path.display(),
                    targets.len()
                );
            }
        }
    }
}
