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

//! INI configuration: one `[DEFAULT]` section for daemon-wide keys and
//! per-interface fallbacks, one section per interface. Section names
//! become the URL path segment, folded to lowercase. Keys not present in
//! an interface section fall back to `[DEFAULT]`, then to the built-in
//! defaults below.

use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};

use crate::caster::OperationMode;
use crate::errors::{CasterError, Result};
use crate::signals::Signal;
use crate::translate::Row16Mode;
use crate::valves::ValveMappings;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/casterd.conf";

/// Built-in fallbacks, mirroring the values the hardware was designed
/// around. Button and LED lines have no default: absent means not wired.
const BUILTIN_DEFAULTS: &[(&str, &str)] = &[
    ("listen_address", "127.0.0.1:23017"),
    ("sensor_driver", "sysfs"),
    ("output_driver", "i2cdev"),
    ("shutdown_command", "shutdown -h now"),
    ("reboot_command", "shutdown -r now"),
    ("startup_timeout", "30"),
    ("sensor_timeout", "5"),
    ("pump_stop_timeout", "120"),
    ("punching_on_time", "0.2"),
    ("punching_off_time", "0.3"),
    ("input_bounce_time", "0.025"),
    ("sensor_gpio", "17"),
    ("i2c_bus", "1"),
    ("mcp0_address", "0x20"),
    ("mcp1_address", "0x21"),
    ("valve1", "N,M,L,K,J,I,H,G"),
    ("valve2", "F,S,E,D,0075,C,B,A"),
    ("valve3", "1,2,3,4,5,6,7,8"),
    ("valve4", "9,10,11,12,13,14,0005,O15"),
    ("supported_modes", "testing, casting, punching, manual punching"),
    ("supported_row16_modes", "off, HMN, KMN, unit shift"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorDriverKind {
    Sysfs,
    None,
}

impl FromStr for SensorDriverKind {
    type Err = CasterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sysfs" => Ok(Self::Sysfs),
            "none" | "off" => Ok(Self::None),
            other => Err(CasterError::config(
                "-",
                "sensor_driver",
                format!("unknown sensor driver '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputDriverKind {
    I2cDev,
    None,
}

impl FromStr for OutputDriverKind {
    type Err = CasterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            // "smbus" is what older installations call the i2c-dev backend
            "i2cdev" | "i2c" | "smbus" => Ok(Self::I2cDev),
            "none" | "off" => Ok(Self::None),
            other => Err(CasterError::config(
                "-",
                "output_driver",
                format!("unknown output driver '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Timings {
    pub input_bounce_time: Duration,
    pub startup_timeout: Duration,
    pub sensor_timeout: Duration,
    pub pump_stop_timeout: Duration,
    pub punching_on_time: Duration,
    pub punching_off_time: Duration,
}

#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub name: String,
    pub sensor_driver: SensorDriverKind,
    pub output_driver: OutputDriverKind,
    pub sensor_gpio: u32,
    pub motor_gpio: Option<u32>,
    pub air_gpio: Option<u32>,
    pub water_gpio: Option<u32>,
    pub i2c_bus: u32,
    pub mcp0_address: u16,
    pub mcp1_address: u16,
    pub mappings: ValveMappings,
    pub supported_modes: Vec<OperationMode>,
    pub supported_row16_modes: Vec<Row16Mode>,
    pub timings: Timings,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub listen_address: SocketAddr,
    pub shutdown_command: Vec<String>,
    pub reboot_command: Vec<String>,
    pub emergency_stop_gpio: Option<u32>,
    pub shutdown_gpio: Option<u32>,
    pub reboot_gpio: Option<u32>,
    pub mode_detect_gpio: Option<u32>,
    pub led_ready_gpio: Option<u32>,
    pub led_working_gpio: Option<u32>,
    pub led_error_gpio: Option<u32>,
    pub input_bounce_time: Duration,
    pub interfaces: Vec<InterfaceConfig>,
}

pub fn load(path: &Path) -> Result<DaemonConfig> {
    let ini = Ini::load_from_file(path).map_err(|e| {
        CasterError::config("-", path.display().to_string(), e.to_string())
    })?;
    parse(&ini)
}

pub fn parse(ini: &Ini) -> Result<DaemonConfig> {
    let empty = Properties::new();
    let defaults = ini
        .iter()
        .find(|(name, _)| {
            name.map(|n| n.eq_ignore_ascii_case("default"))
                .unwrap_or(false)
        })
        .map(|(_, props)| props)
        .unwrap_or(&empty);

    let daemon = SectionView {
        name: "DEFAULT",
        own: defaults,
        defaults: None,
    };

    let mut interfaces: Vec<InterfaceConfig> = Vec::new();
    for (name, props) in ini.iter() {
        let Some(name) = name else { continue };
        if name.eq_ignore_ascii_case("default") {
            continue;
        }
        let section = SectionView {
            name,
            own: props,
            defaults: Some(defaults),
        };
        let interface = parse_interface(&section)?;
        if interfaces.iter().any(|existing| existing.name == interface.name) {
            return Err(CasterError::config(
                name,
                "-",
                "duplicate interface name (names are case-insensitive)",
            ));
        }
        interfaces.push(interface);
    }
    if interfaces.is_empty() {
        return Err(CasterError::config(
            "-",
            "-",
            "no interface sections configured",
        ));
    }

    Ok(DaemonConfig {
        listen_address: parse_listen_address(&daemon)?,
        shutdown_command: daemon.command("shutdown_command")?,
        reboot_command: daemon.command("reboot_command")?,
        emergency_stop_gpio: daemon.optional_number("emergency_stop_gpio")?,
        shutdown_gpio: daemon.optional_number("shutdown_gpio")?,
        reboot_gpio: daemon.optional_number("reboot_gpio")?,
        mode_detect_gpio: daemon.optional_number("mode_detect_gpio")?,
        led_ready_gpio: daemon.optional_number("led_ready_gpio")?,
        led_working_gpio: daemon.optional_number("led_working_gpio")?,
        led_error_gpio: daemon.optional_number("led_error_gpio")?,
        input_bounce_time: daemon.seconds("input_bounce_time")?,
        interfaces,
    })
}

fn parse_listen_address(daemon: &SectionView<'_>) -> Result<SocketAddr> {
    let raw = daemon.require("listen_address")?;
    raw.parse()
        .or_else(|_| format!("{raw}:23017").parse())
        .map_err(|_| {
            CasterError::config(
                daemon.name,
                "listen_address",
                format!("not an address: '{raw}'"),
            )
        })
}

fn parse_interface(section: &SectionView<'_>) -> Result<InterfaceConfig> {
    let mappings = ValveMappings {
        groups: [
            section.valve_group("valve1")?,
            section.valve_group("valve2")?,
            section.valve_group("valve3")?,
            section.valve_group("valve4")?,
        ],
    };
    validate_mappings(section, &mappings)?;

    let supported_modes: Vec<OperationMode> = section.list("supported_modes")?;
    let supported_row16_modes: Vec<Row16Mode> = section.list("supported_row16_modes")?;
    if supported_modes.is_empty() {
        return Err(section.error("supported_modes", "at least one mode is required"));
    }
    if supported_row16_modes.is_empty() {
        return Err(section.error(
            "supported_row16_modes",
            "at least one row 16 mode is required",
        ));
    }

    let mcp0_address = section.address("mcp0_address")?;
    let mcp1_address = section.address("mcp1_address")?;
    let output_driver: OutputDriverKind = section.driver("output_driver")?;
    if output_driver == OutputDriverKind::I2cDev && mcp0_address == mcp1_address {
        return Err(section.error(
            "mcp1_address",
            "the two port expanders need distinct addresses",
        ));
    }

    Ok(InterfaceConfig {
        name: section.name.trim().to_ascii_lowercase(),
        sensor_driver: section.driver("sensor_driver")?,
        output_driver,
        sensor_gpio: section.number("sensor_gpio")?,
        motor_gpio: section.optional_number("motor_gpio")?,
        air_gpio: section.optional_number("air_gpio")?,
        water_gpio: section.optional_number("water_gpio")?,
        i2c_bus: section.number("i2c_bus")?,
        mcp0_address,
        mcp1_address,
        mappings,
        supported_modes,
        supported_row16_modes,
        timings: Timings {
            input_bounce_time: section.seconds("input_bounce_time")?,
            startup_timeout: section.seconds("startup_timeout")?,
            sensor_timeout: section.seconds("sensor_timeout")?,
            pump_stop_timeout: section.seconds("pump_stop_timeout")?,
            punching_on_time: section.seconds("punching_on_time")?,
            punching_off_time: section.seconds("punching_off_time")?,
        },
    })
}

fn validate_mappings(section: &SectionView<'_>, mappings: &ValveMappings) -> Result<()> {
    let mut seen = Vec::with_capacity(32);
    for signal in mappings.labels() {
        if seen.contains(&signal) {
            return Err(section.error(
                "valve1",
                format!("signal '{signal}' assigned to more than one valve pin"),
            ));
        }
        seen.push(signal);
    }
    // 4 groups x 8 labels with no duplicates: exactly 32 distinct labels
    debug_assert_eq!(seen.len(), 32);
    Ok(())
}

struct SectionView<'a> {
    name: &'a str,
    own: &'a Properties,
    defaults: Option<&'a Properties>,
}

impl<'a> SectionView<'a> {
    fn raw(&self, key: &str) -> Option<&'a str> {
        self.own
            .get(key)
            .or_else(|| self.defaults.and_then(|d| d.get(key)))
            .or_else(|| {
                BUILTIN_DEFAULTS
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| *v)
            })
    }

    fn error(&self, key: &str, reason: impl Into<String>) -> CasterError {
        CasterError::config(self.name, key, reason)
    }

    fn require(&self, key: &str) -> Result<&'a str> {
        self.raw(key)
            .map(str::trim)
            .ok_or_else(|| self.error(key, "missing value"))
    }

    fn number(&self, key: &str) -> Result<u32> {
        let raw = self.require(key)?;
        raw.parse()
            .map_err(|_| self.error(key, format!("not a number: '{raw}'")))
    }

    fn optional_number(&self, key: &str) -> Result<Option<u32>> {
        match self.raw(key).map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| self.error(key, format!("not a number: '{raw}'"))),
        }
    }

    /// I2C addresses come as hex ("0x20") or decimal.
    fn address(&self, key: &str) -> Result<u16> {
        let raw = self.require(key)?;
        let parsed = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            u16::from_str_radix(hex, 16)
        } else {
            raw.parse()
        };
        let addr =
            parsed.map_err(|_| self.error(key, format!("not an i2c address: '{raw}'")))?;
        if !(0x03..=0x77).contains(&addr) {
            return Err(self.error(key, format!("{raw} is outside the 7-bit address range")));
        }
        Ok(addr)
    }

    /// Fractional seconds to a duration.
    fn seconds(&self, key: &str) -> Result<Duration> {
        let raw = self.require(key)?;
        let secs: f64 = raw
            .parse()
            .map_err(|_| self.error(key, format!("not a duration in seconds: '{raw}'")))?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(self.error(key, format!("not a duration in seconds: '{raw}'")));
        }
        Ok(Duration::from_secs_f64(secs))
    }

    fn command(&self, key: &str) -> Result<Vec<String>> {
        let raw = self.require(key)?;
        let argv: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
        if argv.is_empty() {
            return Err(self.error(key, "empty command"));
        }
        Ok(argv)
    }

    fn driver<T: FromStr<Err = CasterError>>(&self, key: &str) -> Result<T> {
        let raw = self.require(key)?;
        raw.parse()
            .map_err(|e: CasterError| self.error(key, e.to_string()))
    }

    fn list<T: FromStr<Err = CasterError>>(&self, key: &str) -> Result<Vec<T>> {
        let raw = self.require(key)?;
        let mut items = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            items.push(
                part.parse::<T>()
                    .map_err(|e| self.error(key, e.to_string()))?,
            );
        }
        Ok(items)
    }

    fn valve_group(&self, key: &str) -> Result<[Signal; 8]> {
        let labels: Vec<Signal> = self.list(key)?;
        for signal in &labels {
            if !signal.is_mappable() {
                return Err(self.error(
                    key,
                    format!("signal '{signal}' cannot be assigned to a valve pin"),
                ));
            }
        }
        labels.try_into().map_err(|bad: Vec<Signal>| {
            self.error(key, format!("expected 8 signals, got {}", bad.len()))
        })
    }
}
