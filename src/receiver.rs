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


use std::io;
use log::{debug, error, info, warn};
use thiserror::Error;
use crate::protocol::*;
use crate::serial::{ByteChannel, Clock};
use crate::timed::{flush, read_with_timeout};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum TransferError {
    /// Retry ceiling exceeded
    #[error("TIMEOUT")]
    Timeout,
    /// Sender is on a block we neither expect nor just acknowledged
    #[error("UNEXPECTED BLOCK #")]
    UnexpectedBlock { expected: u8, received: u8 },
    /// Sender offered another block but there is no room for it
    #[error("BUFFER FULL")]
    BufferFull,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// Short fixed message suitable for a monitor prompt.
    pub fn diagnostic(&self) -> &'static str {
        match self {
            TransferError::Timeout => "TIMEOUT",
            TransferError::UnexpectedBlock { .. } => "UNEXPECTED BLOCK #",
            TransferError::BufferFull => "BUFFER FULL",
            TransferError::Io(_) => "I/O ERROR",
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveConfig {
    pub start_timeout_usecs: u32,
    pub byte_timeout_usecs: u32,
    pub flush_idle_usecs: u32,
    pub max_retries: u32,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        ReceiveConfig {
            start_timeout_usecs: START_TIMEOUT_USECS,
            byte_timeout_usecs: BYTE_TIMEOUT_USECS,
            flush_idle_usecs: FLUSH_IDLE_USECS,
            max_retries: MAX_RETRIES,
        }
    }
}

// ============================================================================
// States
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitStart,
    ReadBlockNumber,
    ReadInverseBlockNumber,
    ReadPayload,
    ReadChecksum { sum: u8 },
}

#[derive(Debug)]
enum Transition {
    Continue(State),
    /// Answer the next attempt with ACK: a block was committed or a duplicate seen.
    Acknowledge,
    /// Answer the next attempt with NAK after resynchronising.
    Retry,
    Fail(TransferError),
    Success(usize),
}

// ============================================================================
// Session
// ============================================================================

struct Session<'a> {
    channel: &'a mut dyn ByteChannel,
    clock: &'a dyn Clock,
    config: &'a ReceiveConfig,
    buffer: &'a mut [u8],
    capacity: usize,
    length: usize,
    expected_block: u8,
    retry_count: u32,
    pending_ack: u8,
}

impl<'a> Session<'a> {
    fn new(
        channel: &'a mut dyn ByteChannel,
        clock: &'a dyn Clock,
        config: &'a ReceiveConfig,
        buffer: &'a mut [u8],
        capacity: usize,
    ) -> Self {
        Session {
            channel,
            clock,
            config,
            buffer,
            capacity,
            length: 0,
            expected_block: 1,
            retry_count: 0,
            pending_ack: NAK,
        }
    }

    fn read(&mut self, max_wait_usecs: u32) -> io::Result<Option<u8>> {
        read_with_timeout(&mut *self.channel, self.clock, max_wait_usecs)
    }

    fn flush(&mut self) -> io::Result<usize> {
        flush(&mut *self.channel, self.clock, self.config.flush_idle_usecs)
    }

    fn run(&mut self) -> Result<usize, TransferError> {
        match self.transfer() {
            Ok(length) => Ok(length),
            Err(e) => {
                self.cancel();
                Err(e)
            }
        }
    }

    fn transfer(&mut self) -> Result<usize, TransferError> {
        loop {
            self.begin_attempt()?;

            let mut state = State::AwaitStart;
            loop {
                match self.step(state)? {
                    Transition::Continue(next) => state = next,
                    Transition::Acknowledge => {
                        self.pending_ack = ACK;
                        break;
                    }
                    Transition::Retry => break,
                    Transition::Fail(e) => return Err(e),
                    Transition::Success(length) => return Ok(length),
                }
            }
        }
    }

    /// Sends the control byte that opens an attempt and enforces the retry ceiling.
    fn begin_attempt(&mut self) -> Result<(), TransferError> {
        if self.pending_ack == ACK {
            self.retry_count = 0;
        } else {
            self.flush()?;
        }

        self.retry_count += 1;
        if self.retry_count > self.config.max_retries {
            return Err(TransferError::Timeout);
        }
        if self.retry_count > 1 {
            warn!("Retry {} of {} for block #{}", self.retry_count - 1,
                  self.config.max_retries - 1, self.expected_block);
        }

        self.channel.write_byte(self.pending_ack)?;
        debug!("Sent: {}", if self.pending_ack == ACK { "ACK" } else { "NAK" });
        self.pending_ack = NAK;
        Ok(())
    }

    fn step(&mut self, state: State) -> io::Result<Transition> {
        match state {
            State::AwaitStart => self.await_start(),
            State::ReadBlockNumber => self.read_block_number(),
            State::ReadInverseBlockNumber => self.read_inverse_block_number(),
            State::ReadPayload => self.read_payload(),
            State::ReadChecksum { sum } => self.read_checksum(sum),
        }
    }

    fn await_start(&mut self) -> io::Result<Transition> {
        match self.read(self.config.start_timeout_usecs)? {
            Some(SOH) => Ok(Transition::Continue(State::ReadBlockNumber)),
            Some(EOT) => {
                debug!("Received: EOT");
                self.channel.write_byte(ACK)?;
                Ok(Transition::Success(self.length))
            }
            Some(other) => {
                debug!("Expected SOH or EOT, got 0x{:02X}", other);
                Ok(Transition::Retry)
            }
            None => {
                debug!("No start of header");
                Ok(Transition::Retry)
            }
        }
    }

    fn read_block_number(&mut self) -> io::Result<Transition> {
        let Some(block) = self.read(self.config.byte_timeout_usecs)? else {
            return Ok(Transition::Retry);
        };

        if block == self.expected_block.wrapping_sub(1) {
            debug!("Block #{} resent, acknowledging again", block);
            self.flush()?;
            return Ok(Transition::Acknowledge);
        }

        if block != self.expected_block {
            self.flush()?;
            return Ok(Transition::Fail(TransferError::UnexpectedBlock {
                expected: self.expected_block,
                received: block,
            }));
        }

        if self.length + BLOCK_SIZE > self.capacity {
            return Ok(Transition::Fail(TransferError::BufferFull));
        }

        Ok(Transition::Continue(State::ReadInverseBlockNumber))
    }

    fn read_inverse_block_number(&mut self) -> io::Result<Transition> {
        match self.read(self.config.byte_timeout_usecs)? {
            Some(inverse) if inverse == !self.expected_block => {
                Ok(Transition::Continue(State::ReadPayload))
            }
            Some(inverse) => {
                debug!("Bad inverse block number 0x{:02X} for block #{}", inverse, self.expected_block);
                Ok(Transition::Retry)
            }
            None => Ok(Transition::Retry),
        }
    }

    fn read_payload(&mut self) -> io::Result<Transition> {
        let mut sum = 0u8;

        for written in 0..BLOCK_SIZE {
            match self.read(self.config.byte_timeout_usecs)? {
                Some(byte) => {
                    self.buffer[self.length] = byte;
                    self.length += 1;
                    sum = sum.wrapping_add(byte);
                }
                None => {
                    debug!("Payload stalled after {} bytes", written);
                    self.length -= written;
                    return Ok(Transition::Retry);
                }
            }
        }

        Ok(Transition::Continue(State::ReadChecksum { sum }))
    }

    fn read_checksum(&mut self, sum: u8) -> io::Result<Transition> {
        match self.read(self.config.byte_timeout_usecs)? {
            Some(received) if received == sum => {
                debug!("Block #{} OK ({} bytes total)", self.expected_block, self.length);
                self.expected_block = self.expected_block.wrapping_add(1);
                Ok(Transition::Acknowledge)
            }
            received => {
                match received {
                    Some(received) => debug!("Checksum mismatch: received 0x{:02X}, expected 0x{:02X}",
                                              received, sum),
                    None => debug!("Checksum byte timed out"),
                }
                self.length -= BLOCK_SIZE;
                Ok(Transition::Retry)
            }
        }
    }

    /// Best-effort abort: a single CAN may be lost to noise.
    fn cancel(&mut self) {
        for _ in 0..CANCEL_REPEAT {
            if let Err(e) = self.channel.write_byte(CAN) {
                warn!("Could not send CAN: {}", e);
                return;
            }
        }
        debug!("Sent: CAN x{}", CANCEL_REPEAT);
    }
}

// ============================================================================
// Entry Points
// ============================================================================

/// Receives one file into `buffer[..capacity]` with the default timing.
pub fn receive(
    channel: &mut dyn ByteChannel,
    clock: &dyn Clock,
    buffer: &mut [u8],
    capacity: usize,
) -> Result<usize, TransferError> {
    receive_with_config(channel, clock, buffer, capacity, &ReceiveConfig::default())
}

/// Receives one file into `buffer[..capacity]`.
///
/// Returns the number of bytes received, always a multiple of the block size.
/// On failure three CAN bytes are sent before returning.
///
/// # Panics
///
/// If `capacity` is zero or larger than `buffer`.
pub fn receive_with_config(
    channel: &mut dyn ByteChannel,
    clock: &dyn Clock,
    buffer: &mut [u8],
    capacity: usize,
    config: &ReceiveConfig,
) -> Result<usize, TransferError> {
    assert!(capacity > 0, "receive buffer capacity must be non-zero");
    assert!(
        capacity <= buffer.len(),
        "capacity {} exceeds buffer length {}",
        capacity,
        buffer.len()
    );

    let result = Session::new(channel, clock, config, buffer, capacity).run();
    match &result {
        Ok(length) => info!("Received {} bytes ({} blocks)", length, length / BLOCK_SIZE),
        Err(e) => error!("Transfer failed: {}", e),
    }
    result
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{FakeClock, MockChannel};
    use ntest::timeout;

    fn frame_with_checksum(number: u8, payload: &[u8], sum: u8) -> Vec<Option<u8>> {
        assert_eq!(payload.len(), BLOCK_SIZE);
        let mut frame = vec![Some(SOH), Some(number), Some(!number)];
        frame.extend(payload.iter().map(|&b| Some(b)));
        frame.push(Some(sum));
        frame
    }

    fn frame(number: u8, payload: &[u8]) -> Vec<Option<u8>> {
        frame_with_checksum(number, payload, checksum(payload))
    }

    fn silences(n: usize) -> Vec<Option<u8>> {
        vec![None; n]
    }

    fn run(script: Vec<Option<u8>>, expected_writes: Vec<u8>, buffer: &mut [u8], capacity: usize)
        -> Result<usize, TransferError>
    {
        run_with_gap(script, (0, 0), expected_writes, buffer, capacity)
    }

    /// Like `run`, but script entry `gap.0` only arrives after `gap.1` microseconds.
    fn run_with_gap(
        script: Vec<Option<u8>>,
        gap: (usize, u32),
        expected_writes: Vec<u8>,
        buffer: &mut [u8],
        capacity: usize,
    ) -> Result<usize, TransferError> {
        let clock = FakeClock::starting_at(0);
        let mut channel = MockChannel::new(script, expected_writes, clock.clone())
            .with_gap(gap.0, gap.1);
        receive(&mut channel, &clock, buffer, capacity)
    }

    // Script index of the SOH in `silences(1) + frame(..)`
    const FIRST_SOH: usize = 1;
    // Script index of payload byte 50 in the same layout
    const PAYLOAD_BYTE_50: usize = FIRST_SOH + 3 + 50;

    #[test]
    fn test_two_blocks_then_eot() {
        let block1 = [0xAA; BLOCK_SIZE];
        let block2 = [0xBB; BLOCK_SIZE];
        assert_eq!(checksum(&block1), 0x00);

        let mut script = silences(1);
        script.extend(frame(1, &block1));
        script.extend(frame(2, &block2));
        script.push(Some(EOT));

        let mut buffer = [0u8; 256];
        let result = run(script, vec![NAK, ACK, ACK, ACK], &mut buffer, 256);

        assert_eq!(result.unwrap(), 256);
        assert!(buffer[..128].iter().all(|&b| b == 0xAA));
        assert!(buffer[128..].iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn test_immediate_eot() {
        let mut script = silences(1);
        script.push(Some(EOT));

        let mut buffer = [0u8; 512];
        let result = run(script, vec![NAK, ACK], &mut buffer, 512);

        assert_eq!(result.unwrap(), 0);
        assert!(buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_many_blocks_byte_exact() {
        let payloads: Vec<Vec<u8>> = (0..5)
            .map(|n| (0..BLOCK_SIZE).map(|i| ((n * BLOCK_SIZE + i) * 7 % 256) as u8).collect())
            .collect();

        let mut script = silences(1);
        for (n, payload) in payloads.iter().enumerate() {
            script.extend(frame(n as u8 + 1, payload));
        }
        script.push(Some(EOT));

        let mut expected_writes = vec![NAK];
        expected_writes.extend([ACK; 6]);

        let mut buffer = vec![0u8; 1024];
        let result = run(script, expected_writes, &mut buffer, 1024);

        assert_eq!(result.unwrap(), 5 * BLOCK_SIZE);
        assert_eq!(&buffer[..5 * BLOCK_SIZE], payloads.concat().as_slice());
    }

    #[test]
    fn test_duplicate_block_is_acked_not_stored() {
        let block1 = [0x11; BLOCK_SIZE];
        let block2 = [0x22; BLOCK_SIZE];

        let mut script = silences(1);
        script.extend(frame(1, &block1));
        // Our ACK was lost: the sender repeats block 1, then waits
        script.extend(frame(1, &block1));
        script.extend(silences(1));
        script.extend(frame(2, &block2));
        script.push(Some(EOT));

        let mut buffer = [0u8; 512];
        let result = run(script, vec![NAK, ACK, ACK, ACK, ACK], &mut buffer, 512);

        assert_eq!(result.unwrap(), 256);
        assert_eq!(&buffer[..128], &block1);
        assert_eq!(&buffer[128..256], &block2);
        assert!(buffer[256..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bad_checksum_retried_once() {
        let block = [0x5A; BLOCK_SIZE];
        let good = checksum(&block);

        let mut script = silences(1);
        script.extend(frame_with_checksum(1, &block, good ^ 0xFF));
        script.extend(silences(1));
        script.extend(frame(1, &block));
        script.push(Some(EOT));

        let mut buffer = [0u8; 256];
        let result = run(script, vec![NAK, NAK, ACK, ACK], &mut buffer, 256);

        assert_eq!(result.unwrap(), 128);
        assert_eq!(&buffer[..128], &block);
    }

    #[test]
    fn test_bad_inverse_block_number_retried() {
        let block = [0x33; BLOCK_SIZE];

        let mut script = vec![None, Some(SOH), Some(1), Some(0x00)];
        script.extend(block.iter().map(|&b| Some(b)));
        script.push(Some(checksum(&block)));
        script.extend(silences(1));
        script.extend(frame(1, &block));
        script.push(Some(EOT));

        let mut buffer = [0u8; 256];
        let result = run(script, vec![NAK, NAK, ACK, ACK], &mut buffer, 256);

        assert_eq!(result.unwrap(), 128);
        assert_eq!(&buffer[..128], &block);
    }

    #[test]
    #[timeout(1000)]
    fn test_payload_stall_rolls_back() {
        let partial = [0xEE; 60];
        let block: Vec<u8> = (0..BLOCK_SIZE as u8).collect();

        let mut script = vec![None, Some(SOH), Some(1), Some(0xFE)];
        script.extend(partial.iter().map(|&b| Some(b)));
        // One silence ends the payload read, the next ends the flush
        script.extend(silences(2));
        script.extend(frame(1, &block));
        script.push(Some(EOT));

        let mut buffer = [0u8; 256];
        let result = run(script, vec![NAK, NAK, ACK, ACK], &mut buffer, 256);

        assert_eq!(result.unwrap(), 128);
        assert_eq!(&buffer[..128], block.as_slice());
    }

    #[test]
    fn test_noise_before_header_retried() {
        let block = [0x44; BLOCK_SIZE];

        let mut script = vec![None, Some(0x7F), None];
        script.extend(frame(1, &block));
        script.push(Some(EOT));

        let mut buffer = [0u8; 128];
        let result = run(script, vec![NAK, NAK, ACK, ACK], &mut buffer, 128);

        assert_eq!(result.unwrap(), 128);
        assert_eq!(&buffer[..], &block);
    }

    #[test]
    #[timeout(2000)]
    fn test_slow_header_within_start_timeout() {
        let block = [0x3C; BLOCK_SIZE];

        let mut script = silences(1);
        script.extend(frame(1, &block));
        script.push(Some(EOT));

        let mut buffer = [0u8; 128];
        let result = run_with_gap(script, (FIRST_SOH, 2_900_000), vec![NAK, ACK, ACK], &mut buffer, 128);

        assert_eq!(result.unwrap(), 128);
        assert_eq!(&buffer[..], &block);
    }

    #[test]
    #[timeout(2000)]
    fn test_late_header_costs_a_retry() {
        let block = [0x3C; BLOCK_SIZE];

        let mut script = silences(1);
        // Arrives after the receiver gave up waiting, so the next flush eats it
        script.extend(frame(1, &block));
        script.extend(silences(1));
        script.extend(frame(1, &block));
        script.push(Some(EOT));

        let mut buffer = [0u8; 128];
        let result = run_with_gap(script, (FIRST_SOH, 3_100_000), vec![NAK, NAK, ACK, ACK], &mut buffer, 128);

        assert_eq!(result.unwrap(), 128);
        assert_eq!(&buffer[..], &block);
    }

    #[test]
    #[timeout(2000)]
    fn test_slow_payload_byte_within_byte_timeout() {
        let block: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i * 3) as u8).collect();

        let mut script = silences(1);
        script.extend(frame(1, &block));
        script.push(Some(EOT));

        let mut buffer = [0u8; 256];
        let result = run_with_gap(script, (PAYLOAD_BYTE_50, 240_000), vec![NAK, ACK, ACK], &mut buffer, 256);

        assert_eq!(result.unwrap(), 128);
        assert_eq!(&buffer[..128], block.as_slice());
    }

    #[test]
    #[timeout(2000)]
    fn test_late_payload_byte_rolls_back() {
        let block: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i * 3) as u8).collect();

        let mut script = silences(1);
        script.extend(frame(1, &block));
        script.extend(silences(1));
        script.extend(frame(1, &block));
        script.push(Some(EOT));

        let mut buffer = [0u8; 256];
        let result = run_with_gap(script, (PAYLOAD_BYTE_50, 260_000), vec![NAK, NAK, ACK, ACK], &mut buffer, 256);

        // Without the rollback the 50 stalled bytes would precede the block
        assert_eq!(result.unwrap(), 128);
        assert_eq!(&buffer[..128], block.as_slice());
        assert!(buffer[128..].iter().all(|&b| b == 0));
    }

    #[test]
    #[timeout(1000)]
    fn test_silent_sender_times_out() {
        let mut expected_writes = vec![NAK; 10];
        expected_writes.extend([CAN; 3]);

        let mut buffer = [0u8; 256];
        let err = run(vec![], expected_writes, &mut buffer, 256).unwrap_err();

        assert!(matches!(err, TransferError::Timeout));
        assert_eq!(err.to_string(), "TIMEOUT");
    }

    #[test]
    fn test_retry_count_resets_after_block() {
        let block = [0x66; BLOCK_SIZE];

        // Nine timed-out attempts, each costing a flush silence and an await silence
        let mut script = silences(1 + 9 * 2);
        script.extend(frame(1, &block));
        // Nine more failures after the ACK, then EOT on the tenth attempt
        script.extend(silences(1 + 8 * 2 + 1));
        script.push(Some(EOT));

        let mut expected_writes = vec![NAK; 10];
        expected_writes.push(ACK);
        expected_writes.extend([NAK; 9]);
        expected_writes.push(ACK);

        let mut buffer = [0u8; 256];
        let result = run(script, expected_writes, &mut buffer, 256);

        assert_eq!(result.unwrap(), 128);
    }

    #[test]
    fn test_unexpected_block_is_terminal() {
        let block = [0x77; BLOCK_SIZE];

        let mut script = silences(1);
        script.extend(frame(5, &block));
        script.extend(silences(1));

        let mut buffer = [0u8; 256];
        let err = run(script, vec![NAK, CAN, CAN, CAN], &mut buffer, 256).unwrap_err();

        assert!(matches!(err, TransferError::UnexpectedBlock { expected: 1, received: 5 }));
        assert_eq!(err.to_string(), "UNEXPECTED BLOCK #");
        assert!(buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_buffer_full_cancels() {
        let block = [0x99; BLOCK_SIZE];

        let mut script = silences(1);
        script.extend(frame(1, &block));
        // The sender is cut off right after the header of block 2
        script.extend([Some(SOH), Some(2)]);

        let mut buffer = [0u8; 128];
        let err = run(script, vec![NAK, ACK, CAN, CAN, CAN], &mut buffer, 128).unwrap_err();

        assert!(matches!(err, TransferError::BufferFull));
        assert_eq!(err.diagnostic(), "BUFFER FULL");
        assert_eq!(&buffer[..], &block);
    }

    #[test]
    fn test_capacity_below_block_size() {
        let mut script = silences(1);
        script.extend([Some(SOH), Some(1)]);

        let mut buffer = [0u8; 100];
        let err = run(script, vec![NAK, CAN, CAN, CAN], &mut buffer, 100).unwrap_err();

        assert!(matches!(err, TransferError::BufferFull));
    }

    #[test]
    #[timeout(5000)]
    fn test_block_number_wraps() {
        let count = 257;
        let mut script = silences(1);
        for n in 0..count {
            let payload = [(n % 251) as u8; BLOCK_SIZE];
            script.extend(frame((n + 1) as u8, &payload));
        }
        script.push(Some(EOT));

        let mut expected_writes = vec![NAK];
        expected_writes.extend(vec![ACK; count + 1]);

        let capacity = count * BLOCK_SIZE;
        let mut buffer = vec![0u8; capacity];
        let result = run(script, expected_writes, &mut buffer, capacity);

        assert_eq!(result.unwrap(), capacity);
        for (n, chunk) in buffer.chunks(BLOCK_SIZE).enumerate() {
            assert!(chunk.iter().all(|&b| b == (n % 251) as u8), "block {} corrupted", n + 1);
        }
    }

    #[test]
    #[timeout(1000)]
    fn test_custom_retry_ceiling() {
        let config = ReceiveConfig { max_retries: 2, ..ReceiveConfig::default() };
        let clock = FakeClock::starting_at(u32::MAX - 1_000);
        let mut channel = MockChannel::new(vec![], vec![NAK, NAK, CAN, CAN, CAN], clock.clone());

        let mut buffer = [0u8; 128];
        let err = receive_with_config(&mut channel, &clock, &mut buffer, 128, &config).unwrap_err();

        assert!(matches!(err, TransferError::Timeout));
    }

    #[test]
    #[should_panic(expected = "capacity must be non-zero")]
    fn test_zero_capacity_panics() {
        let clock = FakeClock::starting_at(0);
        let mut channel = MockChannel::new(vec![], vec![], clock.clone());
        let mut buffer = [0u8; 0];
        let _ = receive(&mut channel, &clock, &mut buffer, 0);
    }

    struct BrokenChannel;

    impl ByteChannel for BrokenChannel {
        fn try_read_byte(&mut self) -> io::Result<Option<u8>> {
            Ok(None)
        }

        fn write_byte(&mut self, _byte: u8) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "port closed"))
        }
    }

    #[test]
    #[timeout(1000)]
    fn test_write_failure_surfaces_io_error() {
        let clock = FakeClock::starting_at(0);
        let mut buffer = [0u8; 128];
        // BrokenChannel never advances the clock, so only the write can end this
        let config = ReceiveConfig { flush_idle_usecs: 0, ..ReceiveConfig::default() };
        let err = receive_with_config(&mut BrokenChannel, &clock, &mut buffer, 128, &config)
            .unwrap_err();

        assert!(matches!(err, TransferError::Io(_)));
        assert_eq!(err.diagnostic(), "I/O ERROR");
    }

    // ------------------------------------------------------------------------
    // Single transitions
    // ------------------------------------------------------------------------

    #[test]
    fn test_step_duplicate_keeps_expected_block() {
        let clock = FakeClock::starting_at(0);
        let mut channel = MockChannel::new(vec![Some(1)], vec![], clock.clone());
        let config = ReceiveConfig::default();
        let mut buffer = [0u8; 256];

        let mut session = Session::new(&mut channel, &clock, &config, &mut buffer, 256);
        session.expected_block = 2;
        session.length = 128;

        let transition = session.step(State::ReadBlockNumber).unwrap();
        assert!(matches!(transition, Transition::Acknowledge));
        assert_eq!(session.expected_block, 2);
        assert_eq!(session.length, 128);
    }

    #[test]
    fn test_step_checksum_mismatch_rolls_back() {
        let clock = FakeClock::starting_at(0);
        let mut channel = MockChannel::new(vec![Some(0x12)], vec![], clock.clone());
        let config = ReceiveConfig::default();
        let mut buffer = [0u8; 256];

        let mut session = Session::new(&mut channel, &clock, &config, &mut buffer, 256);
        session.length = 256;
        session.expected_block = 3;

        let transition = session.step(State::ReadChecksum { sum: 0x34 }).unwrap();
        assert!(matches!(transition, Transition::Retry));
        assert_eq!(session.length, 128);
        assert_eq!(session.expected_block, 3);
    }

    #[test]
    fn test_step_payload_accumulates_sum() {
        let clock = FakeClock::starting_at(0);
        let payload: Vec<u8> = (0..BLOCK_SIZE).map(|i| i as u8).collect();
        let script = payload.iter().map(|&b| Some(b)).collect();
        let mut channel = MockChannel::new(script, vec![], clock.clone());
        let config = ReceiveConfig::default();
        let mut buffer = [0u8; 128];

        let mut session = Session::new(&mut channel, &clock, &config, &mut buffer, 128);
        let transition = session.step(State::ReadPayload).unwrap();

        match transition {
            Transition::Continue(State::ReadChecksum { sum }) => assert_eq!(sum, checksum(&payload)),
            other => panic!("unexpected transition: {:?}", other),
        }
        assert_eq!(session.length, 128);
    }
}
