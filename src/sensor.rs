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

//! Machine-cycle sensor and button monitoring with software debounce.
//!
//! The cycle sensor is a photocell on the caster's camshaft: high while
//! the air bar is open. The state machine synchronizes valve timing to
//! its debounced edges. Buttons share the debounce discipline but keep
//! separate edge history; they are pulled up, so pressed = low.

use std::time::{Duration, Instant};

use crate::errors::{CasterError, Result};
use crate::gpio::{poll_fds, SysfsInput};
use crate::interrupt::Interrupter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

/// A debounced, timestamped edge.
#[derive(Debug, Clone, Copy)]
pub struct SensorEvent {
    pub edge: Edge,
    pub at: Instant,
}

/// Emits an edge only once the raw level has held for the bounce time.
/// Pure over (level, timestamp) inputs, so the filter is testable
/// without hardware.
#[derive(Debug)]
pub struct Debouncer {
    bounce: Duration,
    settled: Option<bool>,
    candidate: Option<(bool, Instant)>,
}

impl Debouncer {
    pub fn new(bounce: Duration) -> Self {
        Self {
            bounce,
            settled: None,
            candidate: None,
        }
    }

    pub fn settled(&self) -> Option<bool> {
        self.settled
    }

    /// Feed one raw reading. The first stable level establishes the
    /// baseline silently; afterwards every debounced transition yields
    /// an edge.
    pub fn feed(&mut self, level: bool, at: Instant) -> Option<Edge> {
        match self.candidate {
            Some((pending, _)) if pending != level => {
                self.candidate = Some((level, at));
                None
            }
            Some((pending, since)) => {
                if self.settled != Some(pending)
                    && at.duration_since(since) >= self.bounce
                {
                    let baseline = self.settled.is_none();
                    self.settled = Some(pending);
                    if baseline {
                        None
                    } else if pending {
                        Some(Edge::Rising)
                    } else {
                        Some(Edge::Falling)
                    }
                } else {
                    None
                }
            }
            None => {
                self.candidate = Some((level, at));
                None
            }
        }
    }
}

/// Cycle sensor backend, selected once at interface construction.
pub trait CycleSensor: Send {
    fn name(&self) -> &'static str;

    /// Block until the debounced sensor reaches `level` through a fresh
    /// transition, or until `timeout` expires, or until the interrupter
    /// trips.
    fn wait_for(&mut self, level: bool, timeout: Duration, intr: &Interrupter) -> Result<()>;
}

/// Real backend: exported GPIO with both-edge interrupts, POLLPRI waits.
pub struct SysfsCycleSensor {
    input: SysfsInput,
    debouncer: Debouncer,
    bounce: Duration,
}

impl SysfsCycleSensor {
    pub fn new(pin: u32, bounce: Duration) -> Result<Self> {
        Ok(Self {
            input: SysfsInput::new(pin, "both")?,
            debouncer: Debouncer::new(bounce),
            bounce,
        })
    }
}

impl CycleSensor for SysfsCycleSensor {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn wait_for(&mut self, level: bool, timeout: Duration, intr: &Interrupter) -> Result<()> {
        let wanted = if level { Edge::Rising } else { Edge::Falling };
        let deadline = Instant::now() + timeout;
        loop {
            if intr.is_tripped() {
                return Err(CasterError::Interrupted);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CasterError::timeout("waiting for the machine cycle sensor"));
            }
            // Cap the wait at one bounce interval so stability gets
            // confirmed promptly even without further edge interrupts.
            let tick = remaining.min(self.bounce.max(Duration::from_millis(1)));
            let mut fds = [
                libc::pollfd {
                    fd: self.input.fd(),
                    events: libc::POLLPRI | libc::POLLERR,
                    revents: 0,
                },
                libc::pollfd {
                    fd: intr.fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            poll_fds(&mut fds, Some(tick))?;
            if intr.is_tripped() {
                return Err(CasterError::Interrupted);
            }
            let raw = self.input.level()?;
            if self.debouncer.feed(raw, Instant::now()) == Some(wanted) {
                return Ok(());
            }
        }
    }
}

/// Null backend for machines without a cycle sensor (perforators): every
/// wait runs to its timeout, interruptibly.
pub struct NullCycleSensor;

impl CycleSensor for NullCycleSensor {
    fn name(&self) -> &'static str {
        "none"
    }

    fn wait_for(&mut self, _level: bool, timeout: Duration, intr: &Interrupter) -> Result<()> {
        intr.sleep(timeout)?;
        Err(CasterError::timeout("no machine cycle sensor attached"))
    }
}

/// Daemon buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    EmergencyStop,
    Reboot,
    Shutdown,
    ModeDetect,
}

impl std::fmt::Display for Button {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Button::EmergencyStop => "emergency stop",
            Button::Reboot => "reboot",
            Button::Shutdown => "shutdown",
            Button::ModeDetect => "mode detect",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ButtonEvent {
    pub button: Button,
    pub pressed: bool,
    pub at: Instant,
}

struct WatchedButton {
    button: Button,
    input: SysfsInput,
    debouncer: Debouncer,
}

/// Polls all configured buttons with per-button debounce state.
pub struct ButtonMonitor {
    bounce: Duration,
    watched: Vec<WatchedButton>,
}

impl ButtonMonitor {
    pub fn new(bounce: Duration) -> Self {
        Self {
            bounce,
            watched: Vec::new(),
        }
    }

    pub fn watch(&mut self, button: Button, pin: u32) -> Result<()> {
        self.watched.push(WatchedButton {
            button,
            input: SysfsInput::new(pin, "both")?,
            debouncer: Debouncer::new(self.bounce),
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    /// Wait up to `wait` for button activity, then sample every button
    /// once and return the debounced events. Buttons are pulled up:
    /// a falling edge is a press.
    pub fn poll(&mut self, wait: Duration) -> Result<Vec<ButtonEvent>> {
        let mut fds: Vec<libc::pollfd> = self
            .watched
            .iter()
            .map(|w| libc::pollfd {
                fd: w.input.fd(),
                events: libc::POLLPRI | libc::POLLERR,
                revents: 0,
            })
            .collect();
        poll_fds(&mut fds, Some(wait))?;

        let now = Instant::now();
        let mut events = Vec::new();
        for watched in &mut self.watched {
            let raw = watched.input.level()?;
            if let Some(edge) = watched.debouncer.feed(raw, now) {
                events.push(ButtonEvent {
                    button: watched.button,
                    pressed: edge == Edge::Falling,
                    at: now,
                });
            }
        }
        Ok(events)
    }

    /// Current raw level of a watched button, if configured.
    pub fn level(&mut self, button: Button) -> Option<std::io::Result<bool>> {
        self.watched
            .iter_mut()
            .find(|w| w.button == button)
            .map(|w| w.input.level())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn test_debouncer_establishes_baseline_silently() {
        let base = Instant::now();
        let mut d = Debouncer::new(Duration::from_millis(25));
        assert_eq!(d.feed(false, t(base, 0)), None);
        assert_eq!(d.feed(false, t(base, 30)), None);
        assert_eq!(d.settled(), Some(false));
    }

    #[test]
    fn test_debounced_edge_is_emitted_once() {
        let base = Instant::now();
        let mut d = Debouncer::new(Duration::from_millis(25));
        d.feed(false, t(base, 0));
        d.feed(false, t(base, 30));
        assert_eq!(d.feed(true, t(base, 40)), None);
        assert_eq!(d.feed(true, t(base, 70)), Some(Edge::Rising));
        // stable level produces no further events
        assert_eq!(d.feed(true, t(base, 100)), None);
        assert_eq!(d.feed(false, t(base, 110)), None);
        assert_eq!(d.feed(false, t(base, 140)), Some(Edge::Falling));
    }

    #[test]
    fn test_pulse_shorter_than_bounce_never_emits() {
        let base = Instant::now();
        let mut d = Debouncer::new(Duration::from_millis(25));
        d.feed(false, t(base, 0));
        d.feed(false, t(base, 30));
        // 10 ms glitch
        assert_eq!(d.feed(true, t(base, 40)), None);
        assert_eq!(d.feed(true, t(base, 45)), None);
        assert_eq!(d.feed(false, t(base, 50)), None);
        assert_eq!(d.feed(false, t(base, 80)), None);
        assert_eq!(d.settled(), Some(false));
    }

    #[test]
    fn test_null_sensor_times_out_interruptibly() {
        let intr = Interrupter::new().unwrap();
        let mut sensor = NullCycleSensor;
        let err = sensor
            .wait_for(true, Duration::from_millis(5), &intr)
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");

        intr.trip();
        let err = sensor
            .wait_for(true, Duration::from_secs(5), &intr)
            .unwrap_err();
        assert_eq!(err.kind(), "interrupted");
    }
}
