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

//! Valve bank: 32 pneumatic valves behind two MCP23017 port expanders.
//!
//! The hardware topology never varies: valve group 1 is MCP0 port A,
//! group 2 MCP0 port B, group 3 MCP1 port A, group 4 MCP1 port B. Bit i
//! of group g is physical pin g*8+i of the `PinMask`. Both ports of a
//! chip are always written in one sequential-register transaction so a
//! chip's valves can never be observed half-applied.

use std::fmt;
use std::sync::MutexGuard;

use crate::errors::{CasterError, Result};
use crate::i2c::{I2cBus, SharedBus};
use crate::signals::Signal;

/// MCP23017 register map (IOCON.BANK = 0).
pub const IODIRA: u8 = 0x00;
pub const IODIRB: u8 = 0x01;
pub const OLATA: u8 = 0x14;
pub const OLATB: u8 = 0x15;

/// Activation state of the 32 valve pins.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PinMask(u32);

impl PinMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn set(&mut self, pin: u8) {
        self.0 |= 1 << u32::from(pin);
    }

    pub fn contains(self, pin: u8) -> bool {
        self.0 & (1 << u32::from(pin)) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn clear(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Port bytes in write order: [MCP0 A, MCP0 B, MCP1 A, MCP1 B].
    pub fn ports(self) -> [u8; 4] {
        [
            (self.0 & 0xff) as u8,
            ((self.0 >> 8) & 0xff) as u8,
            ((self.0 >> 16) & 0xff) as u8,
            ((self.0 >> 24) & 0xff) as u8,
        ]
    }

    pub fn from_ports(ports: [u8; 4]) -> Self {
        Self(
            u32::from(ports[0])
                | u32::from(ports[1]) << 8
                | u32::from(ports[2]) << 16
                | u32::from(ports[3]) << 24,
        )
    }
}

impl fmt::Debug for PinMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PinMask({:#010x})", self.0)
    }
}

/// The four ordered 8-label valve group assignments of one interface.
#[derive(Debug, Clone)]
pub struct ValveMappings {
    pub groups: [[Signal; 8]; 4],
}

impl ValveMappings {
    pub fn labels(&self) -> impl Iterator<Item = Signal> + '_ {
        self.groups.iter().flatten().copied()
    }

    /// Pin number of a signal, if the signal is mapped.
    pub fn pin(&self, signal: Signal) -> Option<u8> {
        self.labels()
            .position(|s| s == signal)
            .map(|p| p as u8)
    }
}

/// Output backend strategy, selected once at interface construction.
pub trait OutputDriver: Send {
    fn name(&self) -> &'static str;

    /// Configure all 32 pins as outputs, de-energized.
    fn init(&mut self) -> Result<()>;

    /// Apply all four port bytes, one transaction per chip.
    fn write_ports(&mut self, ports: [u8; 4]) -> Result<()>;

    /// Read the output latches back, if the backend supports it.
    fn read_ports(&mut self) -> Result<Option<[u8; 4]>>;
}

/// Real backend: two MCP23017 chips on a shared i2c-dev bus.
pub struct ExpanderOutput {
    bus: SharedBus,
    mcp0: u16,
    mcp1: u16,
}

impl ExpanderOutput {
    pub fn new(bus: SharedBus, mcp0: u16, mcp1: u16) -> Self {
        Self { bus, mcp0, mcp1 }
    }

    fn bus(&self) -> Result<MutexGuard<'_, dyn I2cBus + 'static>> {
        self.bus
            .lock()
            .map_err(|_| CasterError::hardware("i2c bus mutex poisoned"))
    }
}

impl OutputDriver for ExpanderOutput {
    fn name(&self) -> &'static str {
        "i2cdev"
    }

    fn init(&mut self) -> Result<()> {
        let mut bus = self.bus()?;
        for addr in [self.mcp0, self.mcp1] {
            bus.write_block(addr, IODIRA, &[0x00, 0x00])?;
            bus.write_block(addr, OLATA, &[0x00, 0x00])?;
        }
        Ok(())
    }

    fn write_ports(&mut self, ports: [u8; 4]) -> Result<()> {
        // One lock acquisition for the whole call keeps the two chips of
        // this interface contiguous on the bus.
        let mut bus = self.bus()?;
        bus.write_block(self.mcp0, OLATA, &[ports[0], ports[1]])?;
        bus.write_block(self.mcp1, OLATA, &[ports[2], ports[3]])?;
        Ok(())
    }

    fn read_ports(&mut self) -> Result<Option<[u8; 4]>> {
        let mut bus = self.bus()?;
        let ports = [
            bus.read_reg(self.mcp0, OLATA)?,
            bus.read_reg(self.mcp0, OLATB)?,
            bus.read_reg(self.mcp1, OLATA)?,
            bus.read_reg(self.mcp1, OLATB)?,
        ];
        Ok(Some(ports))
    }
}

/// Null backend for bench setups without valve hardware; keeps the
/// shadow state so `read_back` still works.
#[derive(Default)]
pub struct NullOutput {
    ports: [u8; 4],
}

impl OutputDriver for NullOutput {
    fn name(&self) -> &'static str {
        "none"
    }

    fn init(&mut self) -> Result<()> {
        self.ports = [0; 4];
        Ok(())
    }

    fn write_ports(&mut self, ports: [u8; 4]) -> Result<()> {
        self.ports = ports;
        Ok(())
    }

    fn read_ports(&mut self) -> Result<Option<[u8; 4]>> {
        Ok(Some(self.ports))
    }
}

/// The per-interface valve bank: shadow pin state plus the selected
/// output backend.
pub struct ValveBank {
    driver: Box<dyn OutputDriver>,
    shadow: PinMask,
}

impl ValveBank {
    pub fn new(mut driver: Box<dyn OutputDriver>) -> Result<Self> {
        driver.init()?;
        Ok(Self {
            driver,
            shadow: PinMask::empty(),
        })
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    /// Energize the pins in `mask`, leaving other active pins alone.
    pub fn activate(&mut self, mask: PinMask) -> Result<()> {
        self.shadow = self.shadow.union(mask);
        self.driver.write_ports(self.shadow.ports())
    }

    /// De-energize the pins in `mask`.
    pub fn deactivate(&mut self, mask: PinMask) -> Result<()> {
        self.shadow = self.shadow.clear(mask);
        self.driver.write_ports(self.shadow.ports())
    }

    pub fn all_off(&mut self) -> Result<()> {
        self.shadow = PinMask::empty();
        self.driver.write_ports([0; 4])
    }

    pub fn active(&self) -> PinMask {
        self.shadow
    }

    pub fn read_back(&mut self) -> Result<Option<PinMask>> {
        Ok(self.driver.read_ports()?.map(PinMask::from_ports))
    }
}
