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


//! XMODEM protocol constants

/// Start of header - begins a 128-byte data block
pub const SOH: u8 = 0x01;

/// End of transmission - sender has no more blocks
pub const EOT: u8 = 0x04;

/// Acknowledge - receiver accepted the last block
pub const ACK: u8 = 0x06;

/// Negative acknowledge - receiver is ready, or wants the last block again
pub const NAK: u8 = 0x15;

/// Cancel - receiver aborts the transfer
pub const CAN: u8 = 0x18;

/// Payload bytes in a block
pub const BLOCK_SIZE: usize = 128;

/// Consecutive failed attempts before the transfer is abandoned
pub const MAX_RETRIES: u32 = 10;

/// How many times CAN is sent when giving up
pub const CANCEL_REPEAT: usize = 3;

/// Wait for SOH/EOT after sending a control byte
pub const START_TIMEOUT_USECS: u32 = 3_000_000;

/// Wait for each byte inside a frame
pub const BYTE_TIMEOUT_USECS: u32 = 250_000;

/// A flush ends once the line has been idle this long
pub const FLUSH_IDLE_USECS: u32 = 250_000;

/// Unsigned sum of the payload, truncated to 8 bits.
pub fn checksum(block: &[u8]) -> u8 {
    block.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}
