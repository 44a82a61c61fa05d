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

//! Unified error type for all casterd operations.

use std::io;

/// Result type alias using CasterError
pub type Result<T> = std::result::Result<T, CasterError>;

#[derive(thiserror::Error, Debug)]
pub enum CasterError {
    /// A combination contained a label that is not a Monotype signal.
    /// Rejected at parse time, before any hardware I/O.
    #[error("unknown signal {0:?} in combination")]
    InvalidSignal(String),

    #[error("operation mode '{0}' is not supported by this interface")]
    UnsupportedMode(String),

    #[error("row 16 addressing mode '{0}' is not supported by this interface")]
    UnsupportedRow16Mode(String),

    /// A sensor or rotation-stop deadline expired. The owning state
    /// machine transitions to fault.
    #[error("timed out {0}")]
    Timeout(String),

    /// I2C or GPIO failure. The owning state machine transitions to fault.
    #[error("hardware I/O failure: {0}")]
    HardwareIo(String),

    #[error("no interface named {0:?}")]
    NotFound(String),

    /// Start requested while the interface is not in the stopped state.
    #[error("interface is already started")]
    InterfaceBusy,

    /// Signals sent before the interface was started.
    #[error("interface is not started")]
    NotStarted,

    /// The machine is in the fault state and needs an explicit reset
    /// before it may move again.
    #[error("machine is in fault state; reset required")]
    Faulted,

    /// The operation was preempted by the emergency stop button or by
    /// daemon shutdown.
    #[error("operation interrupted")]
    Interrupted,

    #[error("configuration error in [{section}] {key}: {reason}")]
    Config {
        section: String,
        key: String,
        reason: String,
    },
}

impl CasterError {
    pub fn hardware(msg: impl Into<String>) -> Self {
        Self::HardwareIo(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn config(
        section: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Config {
            section: section.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable tag, used in API responses and status
    /// snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSignal(_) => "invalid_signal",
            Self::UnsupportedMode(_) => "unsupported_mode",
            Self::UnsupportedRow16Mode(_) => "unsupported_row16_mode",
            Self::Timeout(_) => "timeout",
            Self::HardwareIo(_) => "hardware_io",
            Self::NotFound(_) => "not_found",
            Self::InterfaceBusy => "interface_busy",
            Self::NotStarted => "not_started",
            Self::Faulted => "faulted",
            Self::Interrupted => "interrupted",
            Self::Config { .. } => "configuration",
        }
    }

    /// Errors that leave the machine in the fault state.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::HardwareIo(_))
    }
}

impl From<io::Error> for CasterError {
    fn from(e: io::Error) -> Self {
        Self::HardwareIo(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(CasterError::InvalidSignal("Q".into()).kind(), "invalid_signal");
        assert_eq!(CasterError::Faulted.kind(), "faulted");
        assert_eq!(
            CasterError::config("caster", "valve1", "bad").kind(),
            "configuration"
        );
    }

    #[test]
    fn test_fault_classification() {
        assert!(CasterError::timeout("waiting for sensor").is_fault());
        assert!(CasterError::hardware("bus gone").is_fault());
        assert!(!CasterError::InterfaceBusy.is_fault());
        assert!(!CasterError::Interrupted.is_fault());
    }

    #[test]
    fn test_io_error_maps_to_hardware() {
        let e: CasterError = io::Error::new(io::ErrorKind::Other, "EIO").into();
        assert_eq!(e.kind(), "hardware_io");
    }
}
