/*
 * This file is part of Casterd.
 *
 * Copyright (C) 2026 Casterd contributors
 *
 * Casterd is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Casterd is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Casterd. If not, see <https://www.gnu.org/licenses/>.
 */

//! Interface manager: one worker thread, valve bank and sensor per
//! configured interface, built once at startup.
//!
//! Commands arrive over a channel and are answered over oneshot replies,
//! which serializes them: at most one command is active per interface,
//! in FIFO order. The API layer reads status from a mutex-guarded
//! snapshot that only the worker writes, so status stays available while
//! a long casting run is in progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::caster::{Caster, OperationMode, StatusSnapshot};
use crate::config::{DaemonConfig, InterfaceConfig, OutputDriverKind, SensorDriverKind};
use crate::errors::{CasterError, Result};
use crate::i2c::BusRegistry;
use crate::interrupt::Interrupter;
use crate::sensor::{CycleSensor, NullCycleSensor, SysfsCycleSensor};
use crate::signals::Combination;
use crate::translate::Row16Mode;
use crate::valves::{ExpanderOutput, NullOutput, OutputDriver, ValveBank};

#[derive(Debug)]
pub enum Command {
    Start {
        mode: OperationMode,
    },
    Stop,
    Cast {
        combinations: Vec<Combination>,
        row16_mode: Row16Mode,
    },
    Punch {
        combinations: Vec<Combination>,
        row16_mode: Row16Mode,
        manual: bool,
    },
    Test {
        combination: Combination,
        row16_mode: Row16Mode,
    },
    Reset,
    Shutdown,
}

struct Request {
    command: Command,
    reply: oneshot::Sender<Result<StatusSnapshot>>,
}

pub struct InterfaceHandle {
    name: String,
    tx: mpsc::Sender<Request>,
    status: Arc<Mutex<StatusSnapshot>>,
    interrupter: Arc<Interrupter>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    pub supported_modes: Vec<OperationMode>,
    pub supported_row16_modes: Vec<Row16Mode>,
}

impl InterfaceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit a command and wait for the worker's answer. The snapshot
    /// in the reply reflects the state after the command ran.
    pub async fn call(&self, command: Command) -> Result<StatusSnapshot> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Request { command, reply })
            .map_err(|_| CasterError::hardware("interface worker is gone"))?;
        response
            .await
            .map_err(|_| CasterError::hardware("interface worker dropped the request"))?
    }

    /// Current status, without going through the worker.
    pub fn status(&self) -> StatusSnapshot {
        match self.status.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Highest priority: preempt whatever the worker is doing and queue
    /// the stop that follows.
    pub fn emergency_stop(&self) {
        self.interrupter.trip();
        let (reply, _discard) = oneshot::channel();
        let _ = self.tx.send(Request {
            command: Command::Stop,
            reply,
        });
    }

    fn shut_down(&self) {
        self.interrupter.trip();
        let (reply, _discard) = oneshot::channel();
        let _ = self.tx.send(Request {
            command: Command::Shutdown,
            reply,
        });
    }

    fn join(&self) {
        if let Ok(mut guard) = self.worker.lock() {
            if let Some(handle) = guard.take() {
                if handle.join().is_err() {
                    warn!(interface = %self.name, "worker thread panicked");
                }
            }
        }
    }
}

pub struct InterfaceManager {
    entries: HashMap<String, InterfaceHandle>,
    punching_hint: AtomicBool,
}

impl InterfaceManager {
    /// Greedily instantiate every configured interface. Interfaces on
    /// the same i2c bus share one mutex-guarded device handle.
    pub fn from_config(cfg: &DaemonConfig) -> Result<Self> {
        let mut registry = BusRegistry::new();
        let mut entries = HashMap::new();
        for interface_cfg in &cfg.interfaces {
            let handle = spawn_interface(interface_cfg, &mut registry)?;
            entries.insert(handle.name.clone(), handle);
        }
        Ok(Self {
            entries,
            punching_hint: AtomicBool::new(false),
        })
    }

    pub fn get(&self, name: &str) -> Result<&InterfaceHandle> {
        let folded = name.trim().to_ascii_lowercase();
        self.entries
            .get(&folded)
            .ok_or(CasterError::NotFound(folded))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn statuses(&self) -> Vec<(String, StatusSnapshot)> {
        let mut all: Vec<(String, StatusSnapshot)> = self
            .entries
            .values()
            .map(|h| (h.name.clone(), h.status()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn emergency_stop_all(&self) {
        warn!("emergency stop: preempting all interfaces");
        for handle in self.entries.values() {
            handle.emergency_stop();
        }
    }

    /// Level of the mode-detect line: low (pressed) means a punching
    /// attachment is present.
    pub fn set_punching_hint(&self, punching: bool) {
        self.punching_hint.store(punching, Ordering::Relaxed);
    }

    /// Mode for a start request that does not name one: the mode-detect
    /// hint when the interface supports it, else the interface's first
    /// supported mode.
    pub fn resolve_start_mode(
        &self,
        handle: &InterfaceHandle,
        requested: Option<OperationMode>,
    ) -> OperationMode {
        if let Some(mode) = requested {
            return mode;
        }
        let hinted = if self.punching_hint.load(Ordering::Relaxed) {
            OperationMode::Punching
        } else {
            OperationMode::Casting
        };
        if handle.supported_modes.contains(&hinted) {
            hinted
        } else {
            handle.supported_modes[0]
        }
    }

    /// Preempt, stop and join every worker; all valves end de-energized.
    pub fn shutdown(&self) {
        for handle in self.entries.values() {
            handle.shut_down();
        }
        for handle in self.entries.values() {
            handle.join();
        }
        info!("all interfaces shut down");
    }
}

fn spawn_interface(cfg: &InterfaceConfig, registry: &mut BusRegistry) -> Result<InterfaceHandle> {
    let driver: Box<dyn OutputDriver> = match cfg.output_driver {
        OutputDriverKind::I2cDev => Box::new(ExpanderOutput::new(
            registry.open(cfg.i2c_bus)?,
            cfg.mcp0_address,
            cfg.mcp1_address,
        )),
        OutputDriverKind::None => Box::<NullOutput>::default(),
    };
    let valves = ValveBank::new(driver)?;

    let sensor: Box<dyn CycleSensor> = match cfg.sensor_driver {
        SensorDriverKind::Sysfs => Box::new(SysfsCycleSensor::new(
            cfg.sensor_gpio,
            cfg.timings.input_bounce_time,
        )?),
        SensorDriverKind::None => Box::new(NullCycleSensor),
    };

    let interrupter = Interrupter::new()
        .map_err(|e| CasterError::hardware(format!("interrupter pipe: {e}")))?;
    let status = Arc::new(Mutex::new(StatusSnapshot::initial(cfg.supported_modes[0])));
    let caster = Caster::new(cfg, valves, sensor, interrupter.clone(), status.clone())?;

    let (tx, rx) = mpsc::channel();
    let worker = thread::Builder::new()
        .name(format!("caster-{}", cfg.name))
        .spawn(move || worker_loop(caster, rx))
        .map_err(|e| CasterError::hardware(format!("spawning worker: {e}")))?;

    info!(
        interface = %cfg.name,
        sensor = ?cfg.sensor_driver,
        output = ?cfg.output_driver,
        "interface registered"
    );

    Ok(InterfaceHandle {
        name: cfg.name.clone(),
        tx,
        status,
        interrupter,
        worker: Mutex::new(Some(worker)),
        supported_modes: cfg.supported_modes.clone(),
        supported_row16_modes: cfg.supported_row16_modes.clone(),
    })
}

fn worker_loop(mut caster: Caster, rx: mpsc::Receiver<Request>) {
    while let Ok(request) = rx.recv() {
        let last = matches!(request.command, Command::Shutdown);
        let result = dispatch(&mut caster, request.command);
        let _ = request.reply.send(result.map(|()| caster.snapshot()));
        if last {
            break;
        }
    }
    caster.quiesce();
}

fn dispatch(caster: &mut Caster, command: Command) -> Result<()> {
    // A tripped interrupter refuses everything until the stop or reset
    // that follows it has run.
    if caster.interrupted()
        && !matches!(command, Command::Stop | Command::Reset | Command::Shutdown)
    {
        return Err(CasterError::Interrupted);
    }
    match command {
        Command::Start { mode } => caster.start(mode),
        Command::Stop => {
            caster.clear_interrupt();
            caster.stop()
        }
        Command::Cast {
            combinations,
            row16_mode,
        } => caster.cast(&combinations, row16_mode).map(|_| ()),
        Command::Punch {
            combinations,
            row16_mode,
            manual,
        } => caster.punch(&combinations, row16_mode, manual).map(|_| ()),
        Command::Test {
            combination,
            row16_mode,
        } => caster.test_signals(&combination, row16_mode),
        Command::Reset => caster.reset(),
        Command::Shutdown => {
            caster.clear_interrupt();
            let _ = caster.stop();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ini::Ini;

    fn manager(text: &str) -> InterfaceManager {
        let ini = Ini::load_from_str(text).unwrap();
        let cfg = crate::config::parse(&ini).unwrap();
        InterfaceManager::from_config(&cfg).unwrap()
    }

    fn offline_interface(name: &str) -> String {
        format!("[{name}]\nsensor_driver = none\noutput_driver = none\n")
    }

    #[test]
    fn test_unknown_interface_is_not_found() {
        let mgr = manager(&offline_interface("caster"));
        let err = mgr.get("perforator").err().unwrap();
        assert_eq!(err.kind(), "not_found");
        mgr.shutdown();
    }

    #[test]
    fn test_names_fold_to_lowercase() {
        let mgr = manager(&offline_interface("Monotype"));
        assert_eq!(mgr.names(), vec!["monotype".to_string()]);
        assert!(mgr.get("MONOTYPE").is_ok());
        mgr.shutdown();
    }

    #[tokio::test]
    async fn test_commands_round_trip_through_worker() {
        let mgr = manager(&offline_interface("bench"));
        let handle = mgr.get("bench").unwrap();

        let snap = handle
            .call(Command::Start {
                mode: OperationMode::Testing,
            })
            .await
            .unwrap();
        assert_eq!(snap.state, crate::caster::MachineState::Ready);

        let snap = handle.call(Command::Stop).await.unwrap();
        assert_eq!(snap.state, crate::caster::MachineState::Stopped);
        mgr.shutdown();
    }

    #[test]
    fn test_start_mode_resolution() {
        let mgr = manager(&offline_interface("bench"));
        let handle = mgr.get("bench").unwrap();

        assert_eq!(
            mgr.resolve_start_mode(handle, Some(OperationMode::Testing)),
            OperationMode::Testing
        );
        assert_eq!(
            mgr.resolve_start_mode(handle, None),
            OperationMode::Casting
        );
        mgr.set_punching_hint(true);
        assert_eq!(
            mgr.resolve_start_mode(handle, None),
            OperationMode::Punching
        );
        mgr.shutdown();
    }
}
