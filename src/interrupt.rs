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

//! Per-interface preemption: an atomic flag plus a self-pipe.
//!
//! Every blocking wait in the machine loop polls the pipe's read end
//! alongside its own descriptor, so tripping the interrupter (emergency
//! stop, daemon shutdown) wakes the wait immediately instead of at the
//! next poll tick. A tripped interrupter stays tripped until the stop or
//! reset that follows it clears the flag.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::{CasterError, Result};
use crate::gpio::poll_fds;

pub struct Interrupter {
    tripped: AtomicBool,
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Interrupter {
    pub fn new() -> io::Result<Arc<Self>> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds is a valid out-array of two ints.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Arc::new(Self {
            tripped: AtomicBool::new(false),
            read_fd: fds[0],
            write_fd: fds[1],
        }))
    }

    /// Wake every wait multiplexed on this interrupter.
    pub fn trip(&self) {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            let token = [1u8];
            // SAFETY: write_fd is our open pipe end; a failed or partial
            // write only means the pipe is already signaled.
            unsafe {
                libc::write(self.write_fd, token.as_ptr().cast(), 1);
            }
        }
    }

    pub fn clear(&self) {
        self.tripped.store(false, Ordering::SeqCst);
        let mut drain = [0u8; 16];
        // SAFETY: read_fd is our open non-blocking pipe end.
        while unsafe { libc::read(self.read_fd, drain.as_mut_ptr().cast(), drain.len()) } > 0 {}
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    pub fn fd(&self) -> RawFd {
        self.read_fd
    }

    /// Cancellable sleep: returns `Interrupted` as soon as the
    /// interrupter trips, `Ok` after the full duration otherwise.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_tripped() {
                return Err(CasterError::Interrupted);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            let mut fds = [libc::pollfd {
                fd: self.read_fd,
                events: libc::POLLIN,
                revents: 0,
            }];
            poll_fds(&mut fds, Some(remaining)).map_err(CasterError::from)?;
        }
    }
}

impl Drop for Interrupter {
    fn drop(&mut self) {
        // SAFETY: both fds were opened by us and are closed exactly once.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}
