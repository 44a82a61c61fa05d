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

//! The per-interface machine state machine.
//!
//! One `Caster` runs on one worker thread and is the only mutator of its
//! interface's state. Casting synchronizes valve actuation to the
//! machine cycle sensor; punching is purely time-driven. A timeout or
//! bus failure parks the machine in the fault state until an operator
//! resets it: valves must never re-energize on their own after an
//! unexplained stall.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::InterfaceConfig;
use crate::errors::{CasterError, Result};
use crate::gpio::SysfsOutput;
use crate::interrupt::Interrupter;
use crate::sensor::CycleSensor;
use crate::signals::{Combination, Signal};
use crate::translate::{self, Row16Mode, SignalTranslator};
use crate::valves::ValveBank;

/// Pump stop: the 0005 justification wedge pushed in through N+J.
pub const PUMP_STOP: [Signal; 4] = [Signal::N, Signal::J, Signal::S, Signal::Wedge0005];
/// Pump start: the 0075 wedge through N+K.
pub const PUMP_START: [Signal; 4] = [Signal::N, Signal::K, Signal::S, Signal::Wedge0075];

/// Rotation check at startup: full cycles the sensor must report.
const STARTUP_CYCLES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Testing,
    Casting,
    Punching,
    #[serde(alias = "manual punching", alias = "manual-punching")]
    ManualPunching,
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationMode::Testing => "testing",
            OperationMode::Casting => "casting",
            OperationMode::Punching => "punching",
            OperationMode::ManualPunching => "manual punching",
        };
        write!(f, "{name}")
    }
}

impl FromStr for OperationMode {
    type Err = CasterError;

    /// Accepts mode names in any case and the legacy numeric indices
    /// 0..=3 used by older configuration files.
    fn from_str(s: &str) -> Result<Self> {
        let folded = s.trim().to_ascii_lowercase().replace(['-', '_'], " ");
        let mode = match folded.as_str() {
            "0" | "testing" => OperationMode::Testing,
            "1" | "casting" => OperationMode::Casting,
            "2" | "punching" => OperationMode::Punching,
            "3" | "manual punching" | "manualpunching" => OperationMode::ManualPunching,
            _ => return Err(CasterError::UnsupportedMode(s.trim().to_string())),
        };
        Ok(mode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Stopped,
    Starting,
    Ready,
    Casting,
    Punching,
    Stopping,
    Fault,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineState::Stopped => "stopped",
            MachineState::Starting => "starting",
            MachineState::Ready => "ready",
            MachineState::Casting => "casting",
            MachineState::Punching => "punching",
            MachineState::Stopping => "stopping",
            MachineState::Fault => "fault",
        };
        write!(f, "{name}")
    }
}

/// The error that parked the machine in the fault state, and the state
/// it was in when that happened.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
    pub during: MachineState,
}

/// Published status of one interface, mirrored for the API layer.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: MachineState,
    pub mode: OperationMode,
    pub signals: Vec<String>,
    pub pump: bool,
    pub wedge_0075: u8,
    pub wedge_0005: u8,
    pub motor: bool,
    pub air: bool,
    pub water: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_rpm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorReport>,
}

impl StatusSnapshot {
    pub fn initial(mode: OperationMode) -> Self {
        Self {
            state: MachineState::Stopped,
            mode,
            signals: Vec::new(),
            pump: false,
            wedge_0075: 15,
            wedge_0005: 15,
            motor: false,
            air: false,
            water: false,
            speed_rpm: None,
            last_error: None,
        }
    }
}

/// Optional GPIO lines for the machine auxiliaries. Where a line is not
/// wired the flag is tracked in software only.
struct AuxOutputs {
    motor: Option<SysfsOutput>,
    air: Option<SysfsOutput>,
    water: Option<SysfsOutput>,
}

impl AuxOutputs {
    fn from_config(cfg: &InterfaceConfig) -> Result<Self> {
        let open = |pin: Option<u32>| pin.map(SysfsOutput::new).transpose();
        Ok(Self {
            motor: open(cfg.motor_gpio)?,
            air: open(cfg.air_gpio)?,
            water: open(cfg.water_gpio)?,
        })
    }

    fn set(line: &Option<SysfsOutput>, on: bool) -> Result<()> {
        if let Some(out) = line {
            out.set(on)?;
        }
        Ok(())
    }
}

pub struct Caster {
    name: String,
    timings: crate::config::Timings,
    supported_modes: Vec<OperationMode>,
    translator: SignalTranslator,
    valves: ValveBank,
    sensor: Box<dyn CycleSensor>,
    interrupter: Arc<Interrupter>,
    aux: AuxOutputs,
    status: Arc<Mutex<StatusSnapshot>>,
    snap: StatusSnapshot,
    signals: Combination,
}

impl Caster {
    pub fn new(
        cfg: &InterfaceConfig,
        valves: ValveBank,
        sensor: Box<dyn CycleSensor>,
        interrupter: Arc<Interrupter>,
        status: Arc<Mutex<StatusSnapshot>>,
    ) -> Result<Self> {
        let snap = StatusSnapshot::initial(cfg.supported_modes[0]);
        let caster = Self {
            name: cfg.name.clone(),
            timings: cfg.timings.clone(),
            supported_modes: cfg.supported_modes.clone(),
            translator: SignalTranslator::new(cfg.mappings.clone(), &cfg.supported_row16_modes),
            valves,
            sensor,
            interrupter,
            aux: AuxOutputs::from_config(cfg)?,
            status,
            snap,
            signals: Combination::new(),
        };
        caster.publish();
        Ok(caster)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> MachineState {
        self.snap.state
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.snap.clone()
    }

    pub fn clear_interrupt(&self) {
        self.interrupter.clear();
    }

    pub fn interrupted(&self) -> bool {
        self.interrupter.is_tripped()
    }

    /// `stopped -> starting -> ready`. Casting mode spins the motor up
    /// and confirms rotation before the interface is usable.
    pub fn start(&mut self, mode: OperationMode) -> Result<()> {
        self.gate_mode(mode)?;
        match self.snap.state {
            MachineState::Stopped => {}
            MachineState::Fault => return Err(CasterError::Faulted),
            _ => return Err(CasterError::InterfaceBusy),
        }
        self.snap.mode = mode;
        self.snap.speed_rpm = None;
        self.set_state(MachineState::Starting);

        match self.startup_sequence(mode) {
            Ok(()) => {
                self.set_state(MachineState::Ready);
                info!(interface = %self.name, %mode, "interface started");
                Ok(())
            }
            Err(CasterError::Interrupted) => {
                // preempted before the machine got going: back to rest
                self.quiesce_outputs();
                self.set_state(MachineState::Stopped);
                Err(CasterError::Interrupted)
            }
            Err(e) => Err(self.fault(e)),
        }
    }

    fn startup_sequence(&mut self, mode: OperationMode) -> Result<()> {
        self.air_control(true)?;
        if mode == OperationMode::Casting {
            self.water_control(true)?;
            self.motor_control(true)?;
            let rpm = self.check_rotation()?;
            self.snap.speed_rpm = Some(rpm);
            info!(interface = %self.name, rpm, "machine is turning");
        }
        Ok(())
    }

    /// Watch the sensor through three full cycles and measure the speed.
    fn check_rotation(&mut self) -> Result<f64> {
        let deadline = Instant::now() + self.timings.startup_timeout;
        let started = Instant::now();
        for _ in 0..STARTUP_CYCLES {
            self.wait_cycle_until(true, deadline)?;
            self.wait_cycle_until(false, deadline)?;
        }
        let elapsed = started.elapsed().as_secs_f64();
        Ok(f64::from(STARTUP_CYCLES) * 60.0 / elapsed)
    }

    /// Cast the queued combinations, one sensor-synchronized cycle each.
    /// Returns the number of cycles actually cast.
    pub fn cast(&mut self, combinations: &[Combination], row16: Row16Mode) -> Result<usize> {
        self.gate_mode(OperationMode::Casting)?;
        self.gate_row16(row16)?;
        self.require_ready()?;
        self.set_state(MachineState::Casting);
        debug!(interface = %self.name, cycles = combinations.len(), "casting");

        let mut done = 0;
        for combination in combinations {
            match self.cast_cycle(combination, row16) {
                Ok(()) => done += 1,
                Err(CasterError::Interrupted) => return Err(CasterError::Interrupted),
                Err(e) => return Err(self.fault(e)),
            }
        }
        self.set_state(MachineState::Ready);
        Ok(done)
    }

    fn cast_cycle(&mut self, combination: &Combination, row16: Row16Mode) -> Result<()> {
        let substituted = self.translator.substitute(combination, row16)?;
        // O15 is the rest position; casting never drives it
        let sequence = translate::strip_o15(&substituted);
        let mask = self.translator.mask(&sequence);
        if mask.is_empty() {
            // blank cycle, nothing to actuate
            return Ok(());
        }
        let deadline = Instant::now() + self.timings.sensor_timeout;
        self.wait_cycle_until(true, deadline)?;
        self.valves.activate(mask)?;
        self.record_signals(&sequence);
        let deadline = Instant::now() + self.timings.sensor_timeout;
        let wait = self.wait_cycle_until(false, deadline);
        let off = self.valves.deactivate(mask);
        wait?;
        off
    }

    /// Punch the queued combinations on fixed timing; no sensor
    /// involved. Manual punching does one perforation per request and
    /// skips the off wait.
    pub fn punch(
        &mut self,
        combinations: &[Combination],
        row16: Row16Mode,
        manual: bool,
    ) -> Result<usize> {
        let mode = if manual {
            OperationMode::ManualPunching
        } else {
            OperationMode::Punching
        };
        self.gate_mode(mode)?;
        self.gate_row16(row16)?;
        self.require_ready()?;
        self.set_state(MachineState::Punching);
        debug!(interface = %self.name, cycles = combinations.len(), manual, "punching");

        let mut done = 0;
        for combination in combinations {
            match self.punch_cycle(combination, row16, manual) {
                Ok(()) => done += 1,
                Err(CasterError::Interrupted) => return Err(CasterError::Interrupted),
                Err(e) => return Err(self.fault(e)),
            }
        }
        self.set_state(MachineState::Ready);
        Ok(done)
    }

    fn punch_cycle(
        &mut self,
        combination: &Combination,
        row16: Row16Mode,
        manual: bool,
    ) -> Result<()> {
        let substituted = self.translator.substitute(combination, row16)?;
        // fewer than two perforations would stall the ribbon advance
        let sequence = translate::pad_for_ribbon(&substituted);
        let mask = self.translator.mask(&sequence);
        self.valves.activate(mask)?;
        self.record_signals(&sequence);
        let hold = self.interrupter.sleep(self.timings.punching_on_time);
        let off = self.valves.deactivate(mask);
        hold?;
        off?;
        if !manual {
            self.interrupter.sleep(self.timings.punching_off_time)?;
        }
        Ok(())
    }

    /// Testing mode: resolve the combination and hold the valves open.
    pub fn test_signals(&mut self, combination: &Combination, row16: Row16Mode) -> Result<()> {
        self.gate_mode(OperationMode::Testing)?;
        self.gate_row16(row16)?;
        self.require_ready()?;
        let substituted = self.translator.substitute(combination, row16)?;
        let mask = self.translator.mask(&substituted);
        if let Err(e) = self
            .valves
            .all_off()
            .and_then(|()| self.valves.activate(mask))
        {
            return Err(self.fault(e));
        }
        self.record_signals(&substituted);
        Ok(())
    }

    /// `-> stopping -> stopped`. Stops the pump first when it is
    /// engaged, then releases valves, motor, water and air.
    pub fn stop(&mut self) -> Result<()> {
        match self.snap.state {
            MachineState::Stopped => return Ok(()),
            MachineState::Fault => return Err(CasterError::Faulted),
            _ => {}
        }
        self.set_state(MachineState::Stopping);
        match self.stop_sequence() {
            Ok(()) => {
                self.snap.speed_rpm = None;
                self.set_state(MachineState::Stopped);
                info!(interface = %self.name, "interface stopped");
                Ok(())
            }
            Err(CasterError::Interrupted) => {
                // preempted mid-stop: make safe without the pump niceties
                self.quiesce_outputs();
                self.set_state(MachineState::Stopped);
                Err(CasterError::Interrupted)
            }
            Err(e) => Err(self.fault(e)),
        }
    }

    fn stop_sequence(&mut self) -> Result<()> {
        if self.snap.pump && self.snap.mode == OperationMode::Casting {
            self.pump_stop()?;
        }
        self.valves.all_off()?;
        self.signals = Combination::new();
        self.snap.signals.clear();
        if self.snap.mode == OperationMode::Casting {
            self.motor_control(false)?;
            self.water_control(false)?;
        }
        self.air_control(false)?;
        Ok(())
    }

    /// Send the pump-stop combination on two consecutive machine cycles,
    /// bounded by the pump stop deadline. The 0005 wedge position resets
    /// along the way.
    fn pump_stop(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.timings.pump_stop_timeout;
        let combination: Combination = PUMP_STOP.into_iter().collect();
        let mask = self.translator.mask(&combination);
        info!(interface = %self.name, "stopping the pump");
        while self.snap.pump {
            for _ in 0..2 {
                self.wait_cycle_until(true, deadline)?;
                self.valves.activate(mask)?;
                let wait = self.wait_cycle_until(false, deadline);
                let off = self.valves.deactivate(mask);
                wait?;
                off?;
            }
            self.snap.pump = false;
        }
        self.snap.wedge_0005 = 15;
        self.show_signals(&combination);
        Ok(())
    }

    /// Clear the fault (or any) state back to stopped. The operator has
    /// acknowledged the machine; everything is de-energized.
    pub fn reset(&mut self) -> Result<()> {
        if let Err(e) = self.rest_outputs() {
            return Err(self.fault(e));
        }
        self.signals = Combination::new();
        self.snap.signals.clear();
        self.snap.pump = false;
        self.snap.speed_rpm = None;
        self.snap.last_error = None;
        self.interrupter.clear();
        self.set_state(MachineState::Stopped);
        info!(interface = %self.name, "interface reset");
        Ok(())
    }

    /// Final de-energization when the daemon shuts down.
    pub fn quiesce(&mut self) {
        self.quiesce_outputs();
        if self.snap.state != MachineState::Fault {
            self.set_state(MachineState::Stopped);
        }
    }

    fn rest_outputs(&mut self) -> Result<()> {
        self.valves.all_off()?;
        self.motor_control(false)?;
        self.water_control(false)?;
        self.air_control(false)?;
        Ok(())
    }

    fn quiesce_outputs(&mut self) {
        if let Err(e) = self.rest_outputs() {
            warn!(interface = %self.name, error = %e, "could not de-energize outputs");
        }
    }

    /// Enter the fault state, recording what failed and where. Outputs
    /// are released on a best-effort basis; only an explicit reset
    /// re-arms the interface.
    fn fault(&mut self, error: CasterError) -> CasterError {
        warn!(interface = %self.name, state = %self.snap.state, error = %error, "fault");
        self.snap.last_error = Some(ErrorReport {
            kind: error.kind().to_string(),
            message: error.to_string(),
            during: self.snap.state,
        });
        self.quiesce_outputs();
        self.set_state(MachineState::Fault);
        error
    }

    fn gate_mode(&self, mode: OperationMode) -> Result<()> {
        if self.supported_modes.contains(&mode) {
            Ok(())
        } else {
            Err(CasterError::UnsupportedMode(mode.to_string()))
        }
    }

    fn gate_row16(&self, mode: Row16Mode) -> Result<()> {
        if self.translator.supports(mode) {
            Ok(())
        } else {
            Err(CasterError::UnsupportedRow16Mode(mode.to_string()))
        }
    }

    fn require_ready(&self) -> Result<()> {
        match self.snap.state {
            MachineState::Ready => Ok(()),
            MachineState::Fault => Err(CasterError::Faulted),
            MachineState::Stopped | MachineState::Starting => Err(CasterError::NotStarted),
            _ => Err(CasterError::InterfaceBusy),
        }
    }

    fn wait_cycle_until(&mut self, level: bool, deadline: Instant) -> Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CasterError::timeout("waiting for the machine cycle sensor"));
        }
        self.sensor.wait_for(level, remaining, &self.interrupter)
    }

    fn motor_control(&mut self, on: bool) -> Result<()> {
        AuxOutputs::set(&self.aux.motor, on)?;
        self.snap.motor = on;
        Ok(())
    }

    fn air_control(&mut self, on: bool) -> Result<()> {
        AuxOutputs::set(&self.aux.air, on)?;
        self.snap.air = on;
        Ok(())
    }

    fn water_control(&mut self, on: bool) -> Result<()> {
        AuxOutputs::set(&self.aux.water, on)?;
        self.snap.water = on;
        Ok(())
    }

    /// Track the justification state the combination implies, then show
    /// it as the last sent signals.
    fn record_signals(&mut self, sequence: &Combination) {
        self.snap.pump = pump_after(sequence, self.snap.pump);
        let (wedge_0075, wedge_0005) =
            wedges_after(sequence, self.snap.wedge_0075, self.snap.wedge_0005);
        self.snap.wedge_0075 = wedge_0075;
        self.snap.wedge_0005 = wedge_0005;
        self.show_signals(sequence);
    }

    fn show_signals(&mut self, sequence: &Combination) {
        self.signals = sequence.clone();
        self.snap.signals = sequence.ordered_labels();
        self.publish();
    }

    fn set_state(&mut self, state: MachineState) {
        debug!(interface = %self.name, %state, "state");
        self.snap.state = state;
        self.publish();
    }

    fn publish(&self) {
        if let Ok(mut shared) = self.status.lock() {
            *shared = self.snap.clone();
        }
    }
}

/// 0075 (or NK) engages the pump, 0005 (or NJ) stops it; anything else
/// leaves it as it was.
pub(crate) fn pump_after(sequence: &Combination, current: bool) -> bool {
    if sequence.contains(Signal::Wedge0075) || sequence.contains_all(&[Signal::N, Signal::K]) {
        true
    } else if sequence.contains(Signal::Wedge0005)
        || sequence.contains_all(&[Signal::N, Signal::J])
    {
        false
    } else {
        current
    }
}

/// A justification combination sets its wedge to the earliest row in the
/// combination, or 15 when no row is present.
pub(crate) fn wedges_after(sequence: &Combination, current_0075: u8, current_0005: u8) -> (u8, u8) {
    let row = (1..15).find(|n| sequence.contains(Signal::Row(*n))).unwrap_or(15);
    let wedge_0075 = if sequence.contains(Signal::Wedge0075)
        || sequence.contains_all(&[Signal::N, Signal::K])
    {
        row
    } else {
        current_0075
    };
    let wedge_0005 = if sequence.contains(Signal::Wedge0005)
        || sequence.contains_all(&[Signal::N, Signal::J])
    {
        row
    } else {
        current_0005
    };
    (wedge_0075, wedge_0005)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_utils::*;
    use std::time::Duration;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("casting".parse::<OperationMode>().unwrap(), OperationMode::Casting);
        assert_eq!(
            "Manual Punching".parse::<OperationMode>().unwrap(),
            OperationMode::ManualPunching
        );
        assert_eq!("3".parse::<OperationMode>().unwrap(), OperationMode::ManualPunching);
        assert!("melting".parse::<OperationMode>().is_err());
    }

    #[test]
    fn test_pump_state_machine() {
        let on = Combination::parse("NKS 0075").unwrap();
        let off = Combination::parse("NJS 0005").unwrap();
        let neutral = Combination::parse("G 5").unwrap();
        assert!(pump_after(&on, false));
        assert!(pump_after(&neutral, true));
        assert!(!pump_after(&off, true));
        assert!(!pump_after(&neutral, false));
    }

    #[test]
    fn test_wedge_positions_track_rows() {
        let combo = Combination::parse("NKS 0075 3").unwrap();
        assert_eq!(wedges_after(&combo, 15, 15), (3, 15));
        let combo = Combination::parse("NJS 0005").unwrap();
        assert_eq!(wedges_after(&combo, 8, 8), (8, 15));
        let neutral = Combination::parse("A 1").unwrap();
        assert_eq!(wedges_after(&neutral, 8, 9), (8, 9));
    }

    #[test]
    fn test_start_in_testing_mode_goes_ready() {
        let mut fixture = CasterFixture::new(&[]);
        fixture.caster.start(OperationMode::Testing).unwrap();
        assert_eq!(fixture.caster.state(), MachineState::Ready);
        let snap = fixture.caster.snapshot();
        assert!(snap.air);
        assert!(!snap.motor);
    }

    #[test]
    fn test_start_twice_is_busy() {
        let mut fixture = CasterFixture::new(&[]);
        fixture.caster.start(OperationMode::Testing).unwrap();
        let err = fixture.caster.start(OperationMode::Testing).unwrap_err();
        assert_eq!(err.kind(), "interface_busy");
    }

    #[test]
    fn test_start_casting_without_rotation_faults() {
        // no scripted edges: the rotation check must time out
        let mut fixture = CasterFixture::new(&[]);
        let err = fixture.caster.start(OperationMode::Casting).unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert_eq!(fixture.caster.state(), MachineState::Fault);
        let report = fixture.caster.snapshot().last_error.unwrap();
        assert_eq!(report.kind, "timeout");
        assert_eq!(report.during, MachineState::Starting);
    }

    #[test]
    fn test_start_casting_measures_speed() {
        let mut fixture = CasterFixture::new(&cycles(8));
        fixture.caster.start(OperationMode::Casting).unwrap();
        assert_eq!(fixture.caster.state(), MachineState::Ready);
        let snap = fixture.caster.snapshot();
        assert!(snap.motor && snap.air && snap.water);
        assert!(snap.speed_rpm.unwrap() > 0.0);
    }

    #[test]
    fn test_cast_requires_start() {
        let mut fixture = CasterFixture::new(&[]);
        let combos = [Combination::parse("N").unwrap()];
        let err = fixture.caster.cast(&combos, Row16Mode::Off).unwrap_err();
        assert_eq!(err.kind(), "not_started");
    }

    #[test]
    fn test_unsupported_mode_produces_no_hardware_writes() {
        let mut fixture = CasterFixture::with_modes(&[], &[OperationMode::Punching]);
        let combos = [Combination::parse("N").unwrap()];
        let err = fixture.caster.cast(&combos, Row16Mode::Off).unwrap_err();
        assert_eq!(err.kind(), "unsupported_mode");
        assert!(fixture.writes.snapshot().is_empty());
    }

    #[test]
    fn test_cast_actuates_on_sensor_edges() {
        let mut fixture = CasterFixture::new(&cycles(16));
        fixture.caster.start(OperationMode::Casting).unwrap();
        let combos = [Combination::parse("N").unwrap()];
        let done = fixture.caster.cast(&combos, Row16Mode::Off).unwrap();
        assert_eq!(done, 1);
        assert_eq!(fixture.caster.state(), MachineState::Ready);
        let writes = fixture.writes.snapshot();
        // N is pin 0: energize then release
        assert!(writes.contains(&[0x01, 0, 0, 0]));
        assert_eq!(*writes.last().unwrap(), [0, 0, 0, 0]);
    }

    #[test]
    fn test_blank_combination_is_a_no_op_cycle() {
        let mut fixture = CasterFixture::new(&cycles(8));
        fixture.caster.start(OperationMode::Casting).unwrap();
        fixture.writes.clear();
        // O15 strips away entirely under casting
        let combos = [Combination::parse("O15").unwrap()];
        let done = fixture.caster.cast(&combos, Row16Mode::Off).unwrap();
        assert_eq!(done, 1);
        assert!(fixture.writes.snapshot().is_empty());
    }

    #[test]
    fn test_punch_is_time_driven_and_padded() {
        // no sensor edges at all: punching must not care
        let mut fixture = CasterFixture::new(&[]);
        fixture.caster.start(OperationMode::Punching).unwrap();
        let combos = [Combination::parse("A").unwrap()];
        let started = Instant::now();
        let done = fixture.caster.punch(&combos, Row16Mode::Off, false).unwrap();
        let elapsed = started.elapsed();
        assert_eq!(done, 1);
        // on time + off time with the fixture's 20ms/30ms timings
        assert!(elapsed >= Duration::from_millis(50));
        let writes = fixture.writes.snapshot();
        // A is pin 15 (valve2 bit 7), O15 pad is pin 31 (valve4 bit 7)
        assert!(writes.contains(&[0, 0x80, 0, 0x80]));
        assert_eq!(*writes.last().unwrap(), [0, 0, 0, 0]);
    }

    #[test]
    fn test_manual_punch_skips_off_wait() {
        let mut fixture = CasterFixture::new(&[]);
        fixture.caster.start(OperationMode::ManualPunching).unwrap();
        let combos = [Combination::parse("A 1").unwrap()];
        let started = Instant::now();
        fixture.caster.punch(&combos, Row16Mode::Off, true).unwrap();
        assert!(started.elapsed() < Duration::from_millis(45));
    }

    #[test]
    fn test_emergency_stop_preempts_casting() {
        let mut fixture = CasterFixture::new(&cycles(600));
        fixture.caster.start(OperationMode::Casting).unwrap();
        let combos: Vec<Combination> =
            (0..200).map(|_| Combination::parse("N").unwrap()).collect();
        let intr = fixture.interrupter.clone();
        let killer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            intr.trip();
        });
        let err = fixture.caster.cast(&combos, Row16Mode::Off).unwrap_err();
        assert_eq!(err.kind(), "interrupted");
        killer.join().unwrap();

        fixture.caster.clear_interrupt();
        fixture.caster.stop().unwrap();
        assert_eq!(fixture.caster.state(), MachineState::Stopped);
    }

    #[test]
    fn test_emergency_stop_preempts_punching() {
        let mut fixture = CasterFixture::new(&[]);
        fixture.caster.start(OperationMode::Punching).unwrap();
        let combos: Vec<Combination> =
            (0..100).map(|_| Combination::parse("A 1").unwrap()).collect();
        let intr = fixture.interrupter.clone();
        let killer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            intr.trip();
        });
        let started = Instant::now();
        let err = fixture
            .caster
            .punch(&combos, Row16Mode::Off, false)
            .unwrap_err();
        assert_eq!(err.kind(), "interrupted");
        // preempted long before the 100 combinations (5s+) would finish
        assert!(started.elapsed() < Duration::from_secs(1));
        killer.join().unwrap();

        // the stop that follows an emergency stop clears the trip first
        fixture.caster.clear_interrupt();
        fixture.caster.stop().unwrap();
        assert_eq!(fixture.caster.state(), MachineState::Stopped);
        assert!(fixture.writes.snapshot().ends_with(&[[0, 0, 0, 0]]));
    }

    #[test]
    fn test_stop_runs_pump_stop_cycles() {
        let mut fixture = CasterFixture::new(&cycles(32));
        fixture.caster.start(OperationMode::Casting).unwrap();
        // engage the pump
        let combos = [Combination::parse("NKS 0075").unwrap()];
        fixture.caster.cast(&combos, Row16Mode::Off).unwrap();
        assert!(fixture.caster.snapshot().pump);

        fixture.writes.clear();
        fixture.caster.stop().unwrap();
        let snap = fixture.caster.snapshot();
        assert_eq!(snap.state, MachineState::Stopped);
        assert!(!snap.pump);
        assert_eq!(snap.wedge_0005, 15);
        // the pump stop combination went out: N pin 0, J pin 4,
        // S pin 9, 0005 pin 30
        assert!(fixture.writes.snapshot().contains(&[0x11, 0x02, 0, 0x40]));
    }

    #[test]
    fn test_fault_requires_reset() {
        let mut fixture = CasterFixture::new(&[]);
        let _ = fixture.caster.start(OperationMode::Casting).unwrap_err();
        assert_eq!(fixture.caster.state(), MachineState::Fault);

        let err = fixture.caster.stop().unwrap_err();
        assert_eq!(err.kind(), "faulted");
        let err = fixture.caster.start(OperationMode::Testing).unwrap_err();
        assert_eq!(err.kind(), "faulted");

        fixture.caster.reset().unwrap();
        assert_eq!(fixture.caster.state(), MachineState::Stopped);
        assert!(fixture.caster.snapshot().last_error.is_none());
        fixture.caster.start(OperationMode::Testing).unwrap();
    }

    #[test]
    fn test_testing_mode_holds_valves() {
        let mut fixture = CasterFixture::new(&[]);
        fixture.caster.start(OperationMode::Testing).unwrap();
        let combo = Combination::parse("GS2").unwrap();
        fixture.caster.test_signals(&combo, Row16Mode::Off).unwrap();
        let writes = fixture.writes.snapshot();
        // G pin 7, S pin 9, row 2 pin 17: still energized afterwards
        assert_eq!(*writes.last().unwrap(), [0x80, 0x02, 0x02, 0]);
    }
}
