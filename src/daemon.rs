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

//! Daemon supervisor thread: panel buttons and status LEDs.
//!
//! Emergency stop preempts every interface immediately. Shutdown and
//! reboot must be held for two seconds before the configured system
//! command runs. The mode-detect line is a switch on the machine: closed
//! (low) means the punching attachment is mounted, which becomes the
//! default operation mode for start requests that don't name one.

use std::process::Command as SystemCommand;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::caster::MachineState;
use crate::config::DaemonConfig;
use crate::errors::Result;
use crate::gpio::SysfsOutput;
use crate::interface::InterfaceManager;
use crate::sensor::{Button, ButtonMonitor};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const HOLD_TIME: Duration = Duration::from_secs(2);

struct Leds {
    ready: Option<SysfsOutput>,
    working: Option<SysfsOutput>,
    error: Option<SysfsOutput>,
}

impl Leds {
    fn from_config(cfg: &DaemonConfig) -> Result<Self> {
        let open = |pin: Option<u32>| pin.map(SysfsOutput::new).transpose();
        Ok(Self {
            ready: open(cfg.led_ready_gpio)?,
            working: open(cfg.led_working_gpio)?,
            error: open(cfg.led_error_gpio)?,
        })
    }

    fn apply(&self, ready: bool, working: bool, error: bool) {
        let set = |led: &Option<SysfsOutput>, on: bool| {
            if let Some(led) = led {
                let _ = led.set(on);
            }
        };
        set(&self.ready, ready);
        set(&self.working, working);
        set(&self.error, error);
    }

    /// Confirmation blink before a shutdown or reboot command runs.
    fn blink(&self, times: u32, period: Duration) {
        if let Some(led) = &self.ready {
            for _ in 0..times {
                let _ = led.set(false);
                thread::sleep(period);
                let _ = led.set(true);
                thread::sleep(period);
            }
        }
    }
}

pub struct Supervisor {
    manager: Arc<InterfaceManager>,
    buttons: ButtonMonitor,
    leds: Leds,
    shutdown_command: Vec<String>,
    reboot_command: Vec<String>,
    running: Arc<AtomicBool>,
}

/// Wire up the configured buttons and LEDs and start the supervisor
/// loop on its own thread.
pub fn spawn(
    cfg: &DaemonConfig,
    manager: Arc<InterfaceManager>,
    running: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    let mut buttons = ButtonMonitor::new(cfg.input_bounce_time);
    if let Some(pin) = cfg.emergency_stop_gpio {
        buttons.watch(Button::EmergencyStop, pin)?;
    }
    if let Some(pin) = cfg.shutdown_gpio {
        buttons.watch(Button::Shutdown, pin)?;
    }
    if let Some(pin) = cfg.reboot_gpio {
        buttons.watch(Button::Reboot, pin)?;
    }
    if let Some(pin) = cfg.mode_detect_gpio {
        buttons.watch(Button::ModeDetect, pin)?;
    }

    let supervisor = Supervisor {
        manager,
        buttons,
        leds: Leds::from_config(cfg)?,
        shutdown_command: cfg.shutdown_command.clone(),
        reboot_command: cfg.reboot_command.clone(),
        running,
    };

    thread::Builder::new()
        .name("supervisor".to_string())
        .spawn(move || supervisor.run())
        .map_err(|e| crate::errors::CasterError::hardware(format!("spawning supervisor: {e}")))
}

impl Supervisor {
    fn run(mut self) {
        info!("supervisor running");
        self.leds.apply(true, false, false);
        while self.running.load(Ordering::SeqCst) {
            match self.buttons.poll(POLL_INTERVAL) {
                Ok(events) => {
                    for event in events {
                        if event.pressed {
                            self.on_press(event.button);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "button poll failed");
                    thread::sleep(POLL_INTERVAL);
                }
            }
            self.track_mode_detect();
            self.update_leds();
        }
        self.leds.apply(false, false, false);
        info!("supervisor stopped");
    }

    fn on_press(&mut self, button: Button) {
        match button {
            Button::EmergencyStop => {
                warn!("emergency stop button pressed");
                self.manager.emergency_stop_all();
            }
            Button::Shutdown => self.held_command(Button::Shutdown, self.shutdown_command.clone()),
            Button::Reboot => self.held_command(Button::Reboot, self.reboot_command.clone()),
            Button::ModeDetect => debug!("mode detect line closed"),
        }
    }

    /// Shutdown/reboot buttons act only when held down for two seconds.
    fn held_command(&mut self, button: Button, argv: Vec<String>) {
        info!(%button, "button pressed, hold for {}s to confirm", HOLD_TIME.as_secs());
        thread::sleep(HOLD_TIME);
        match self.buttons.level(button) {
            // still held: the line is still low
            Some(Ok(false)) => {
                info!(%button, command = %argv.join(" "), "confirmed, running command");
                self.manager.emergency_stop_all();
                self.leds.blink(3, Duration::from_millis(500));
                match SystemCommand::new(&argv[0]).args(&argv[1..]).status() {
                    Ok(status) if status.success() => {}
                    Ok(status) => warn!(%button, %status, "command exited nonzero"),
                    Err(e) => warn!(%button, error = %e, "command failed to run"),
                }
            }
            Some(Ok(true)) => info!(%button, "released early, ignoring"),
            Some(Err(e)) => warn!(%button, error = %e, "could not re-read button"),
            None => {}
        }
    }

    fn track_mode_detect(&mut self) {
        if let Some(Ok(level)) = self.buttons.level(Button::ModeDetect) {
            // low = switch closed = punching attachment present
            self.manager.set_punching_hint(!level);
        }
    }

    fn update_leds(&self) {
        let mut any_working = false;
        let mut any_error = false;
        let mut all_rest = true;
        for (_, status) in self.manager.statuses() {
            match status.state {
                MachineState::Casting
                | MachineState::Punching
                | MachineState::Starting
                | MachineState::Stopping => {
                    any_working = true;
                    all_rest = false;
                }
                MachineState::Fault => {
                    any_error = true;
                    all_rest = false;
                }
                MachineState::Ready | MachineState::Stopped => {}
            }
        }
        self.leds.apply(all_rest, any_working, any_error);
    }
}
