// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.


use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use serialport::{SerialPort as SerialPortTrait, DataBits, Parity, StopBits};

// ============================================================================
// Consumed Interfaces
// ============================================================================

/// Byte-at-a-time link to the sender.
pub trait ByteChannel {
    /// Returns the next byte if one is already waiting. Never blocks.
    fn try_read_byte(&mut self) -> io::Result<Option<u8>>;

    /// Blocks until the byte has been handed to the transport.
    fn write_byte(&mut self, byte: u8) -> io::Result<()>;
}

/// Monotonic microsecond counter that wraps at 32 bits.
pub trait Clock {
    fn now_usecs(&self) -> u32;
}

// ============================================================================
// Host Clock
// ============================================================================

/// `Clock` backed by `Instant`, truncated so it wraps like the hardware timer.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_usecs(&self) -> u32 {
        self.origin.elapsed().as_micros() as u32
    }
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// Serial port channel that wraps the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(RealSerialPort { port })
    }
}

impl ByteChannel for RealSerialPort {
    fn try_read_byte(&mut self) -> io::Result<Option<u8>> {
        if self.port.bytes_to_read()? == 0 {
            return Ok(None);
        }

        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.port.write_all(&[byte])?;
        self.port.flush()
    }
}

// ============================================================================
// Mock Channel and Clock for Testing
// ============================================================================

#[cfg(test)]
use std::{cell::Cell, collections::HashMap, rc::Rc};

/// Clock whose time only moves when the mock channel (or a test) says so.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct FakeClock {
    now: Rc<Cell<u32>>,
}

#[cfg(test)]
impl FakeClock {
    pub fn starting_at(usecs: u32) -> Self {
        FakeClock { now: Rc::new(Cell::new(usecs)) }
    }

    pub fn advance(&self, usecs: u32) {
        self.now.set(self.now.get().wrapping_add(usecs));
    }
}

#[cfg(test)]
impl Clock for FakeClock {
    fn now_usecs(&self) -> u32 {
        self.now.get()
    }
}

/// A `None` entry jumps the clock this far: longer than any protocol timeout.
#[cfg(test)]
pub const SILENCE_USECS: u32 = 10_000_000;

/// Clock step for each empty poll once the script is used up.
#[cfg(test)]
pub const IDLE_POLL_USECS: u32 = 100_000;

/// Clock step for each empty poll while a scripted gap runs down.
#[cfg(test)]
pub const GAP_POLL_USECS: u32 = 10_000;

#[cfg(test)]
pub struct MockChannel {
    // Bytes the sender has on the wire (None = line goes quiet)
    script: Vec<Option<u8>>,
    read_pos: usize,
    // Line time that must pass before the entry at an index shows up
    gaps: HashMap<usize, u32>,
    clock: FakeClock,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
}

#[cfg(test)]
impl MockChannel {
    pub fn new(script: Vec<Option<u8>>, expected_writes: Vec<u8>, clock: FakeClock) -> Self {
        MockChannel {
            script,
            read_pos: 0,
            gaps: HashMap::new(),
            clock,
            write_log: Vec::new(),
            expected_writes,
        }
    }

    /// Holds back script entry `index` until `usecs` of polling have passed.
    pub fn with_gap(mut self, index: usize, usecs: u32) -> Self {
        self.gaps.insert(index, usecs);
        self
    }
}

#[cfg(test)]
impl ByteChannel for MockChannel {
    fn try_read_byte(&mut self) -> io::Result<Option<u8>> {
        if let Some(remaining) = self.gaps.get_mut(&self.read_pos) {
            if *remaining > 0 {
                let step = (*remaining).min(GAP_POLL_USECS);
                *remaining -= step;
                self.clock.advance(step);
                return Ok(None);
            }
        }

        match self.script.get(self.read_pos) {
            Some(Some(byte)) => {
                self.read_pos += 1;
                Ok(Some(*byte))
            }
            Some(None) => {
                self.read_pos += 1;
                self.clock.advance(SILENCE_USECS);
                Ok(None)
            }
            None => {
                self.clock.advance(IDLE_POLL_USECS);
                Ok(None)
            }
        }
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.write_log.push(byte);
        Ok(())
    }
}

#[cfg(test)]
impl Drop for MockChannel {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.script.len(),
            "MockChannel dropped with {} unconsumed script entries (read {} of {})",
            self.script.len() - self.read_pos,
            self.read_pos,
            self.script.len()
        );

        assert_eq!(
            &self.write_log,
            &self.expected_writes,
            "MockChannel write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            self.expected_writes,
            self.write_log.len(),
            self.write_log
        );
    }
}
