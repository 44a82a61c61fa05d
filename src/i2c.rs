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

//! Raw I2C bus access through the Linux i2c-dev character devices.
//!
//! One `/dev/i2c-N` handle is shared, behind a mutex, by every interface
//! configured on bus N: the MCP23017 transactions of two interfaces on
//! the same bus must never interleave.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::errors::{CasterError, Result};

/// ioctl request selecting the slave address for subsequent read/write.
const I2C_SLAVE: libc::c_ulong = 0x0703;

/// Byte-level register access to devices on one bus.
pub trait I2cBus: Send {
    /// Write `data` to consecutive registers starting at `reg`
    /// (MCP23017 sequential addressing) as a single bus transaction.
    fn write_block(&mut self, addr: u16, reg: u8, data: &[u8]) -> io::Result<()>;

    /// Read a single register.
    fn read_reg(&mut self, addr: u16, reg: u8) -> io::Result<u8>;
}

pub type SharedBus = Arc<Mutex<dyn I2cBus>>;

/// An open i2c-dev device.
pub struct I2cDev {
    fd: RawFd,
    bus: u32,
    selected: Option<u16>,
}

impl I2cDev {
    pub fn open(bus: u32) -> io::Result<Self> {
        let path = format!("/dev/i2c-{bus}");
        let cpath = CString::new(path)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad device path"))?;
        // SAFETY: cpath is a valid NUL-terminated string for the lifetime
        // of the call.
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd,
            bus,
            selected: None,
        })
    }

    pub fn bus_number(&self) -> u32 {
        self.bus
    }

    fn select(&mut self, addr: u16) -> io::Result<()> {
        if self.selected == Some(addr) {
            return Ok(());
        }
        // SAFETY: fd is an open i2c-dev descriptor owned by self.
        if unsafe { libc::ioctl(self.fd, I2C_SLAVE, libc::c_ulong::from(addr)) } < 0 {
            return Err(io::Error::last_os_error());
        }
        self.selected = Some(addr);
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        // SAFETY: buf is valid for buf.len() bytes; fd is owned by self.
        let written = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
        if written != buf.len() as isize {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl I2cBus for I2cDev {
    fn write_block(&mut self, addr: u16, reg: u8, data: &[u8]) -> io::Result<()> {
        self.select(addr)?;
        let mut buf = Vec::with_capacity(1 + data.len());
        buf.push(reg);
        buf.extend_from_slice(data);
        self.write_all(&buf)
    }

    fn read_reg(&mut self, addr: u16, reg: u8) -> io::Result<u8> {
        self.select(addr)?;
        self.write_all(&[reg])?;
        let mut byte = 0u8;
        // SAFETY: reading one byte into a stack variable owned by this frame.
        let read = unsafe { libc::read(self.fd, (&mut byte as *mut u8).cast(), 1) };
        if read != 1 {
            return Err(io::Error::last_os_error());
        }
        Ok(byte)
    }
}

impl Drop for I2cDev {
    fn drop(&mut self) {
        // SAFETY: fd was opened by us and is closed exactly once.
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Opens each bus number once and hands out the shared, mutex-guarded
/// handle to every interface configured on it.
#[derive(Default)]
pub struct BusRegistry {
    buses: HashMap<u32, SharedBus>,
}

impl BusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, bus: u32) -> Result<SharedBus> {
        if let Some(shared) = self.buses.get(&bus) {
            return Ok(shared.clone());
        }
        let dev = I2cDev::open(bus)
            .map_err(|e| CasterError::hardware(format!("opening /dev/i2c-{bus}: {e}")))?;
        let shared: SharedBus = Arc::new(Mutex::new(dev));
        self.buses.insert(bus, shared.clone());
        Ok(shared)
    }
}
