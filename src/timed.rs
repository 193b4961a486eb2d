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


//! Timed reads over a byte channel.
//!
//! There is no scheduler to yield to, so waiting is a busy-poll of the
//! channel against a deadline taken from the wrapping microsecond clock.

use std::io;
use log::debug;
use crate::serial::{ByteChannel, Clock};

/// True once `now` has reached `deadline`, even if the counter wrapped in between.
pub fn deadline_passed(now: u32, deadline: u32) -> bool {
    (now.wrapping_sub(deadline) as i32) >= 0
}

/// Reads one byte, giving up after `max_wait_usecs`.
///
/// Returns `Ok(None)` on timeout. A byte that is already waiting is returned
/// without looking at the clock again.
pub fn read_with_timeout(
    channel: &mut dyn ByteChannel,
    clock: &dyn Clock,
    max_wait_usecs: u32,
) -> io::Result<Option<u8>> {
    let deadline = clock.now_usecs().wrapping_add(max_wait_usecs);

    loop {
        if let Some(byte) = channel.try_read_byte()? {
            return Ok(Some(byte));
        }
        if deadline_passed(clock.now_usecs(), deadline) {
            return Ok(None);
        }
    }
}

/// Discards incoming bytes until the line stays idle for `idle_usecs`.
///
/// Returns how many bytes were thrown away.
pub fn flush(
    channel: &mut dyn ByteChannel,
    clock: &dyn Clock,
    idle_usecs: u32,
) -> io::Result<usize> {
    let mut discarded = 0;
    while read_with_timeout(channel, clock, idle_usecs)?.is_some() {
        discarded += 1;
    }

    if discarded > 0 {
        debug!("Flushed {} stray bytes", discarded);
    }
    Ok(discarded)
}
