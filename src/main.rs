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


use clap::{Parser, Subcommand};
use log::info;
use serialport::{DataBits, Parity, StopBits};
use std::path::{Path, PathBuf};
use thiserror::Error;
use xmrecv::{hexdump, ReceiveConfig, TransferError};
use xmrecv::serial::{RealSerialPort, SystemClock};

/// Longest wait the wrapping microsecond deadline can express (i32::MAX usecs)
const MAX_TIMEOUT_MS: i64 = i32::MAX as i64 / 1000;

#[derive(Parser)]
#[command(name = "xmrecv")]
#[command(about = "XMODEM (checksum) file receiver for RS-232 links", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name="BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name="BITS")]
    stop_bits: u8,

    /// Enable debug output (RUST_LOG overrides)
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Receive a single file using XMODEM
    Receive {
        /// File to write the received bytes to
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Receive buffer size in bytes
        #[arg(short, long, default_value = "1048576", value_name = "BYTES")]
        capacity: usize,

        /// Consecutive failed attempts before giving up
        #[arg(long, default_value = "10")]
        retries: u32,

        /// How long to wait for each block to start
        #[arg(long = "start-timeout-ms", default_value = "3000", value_name = "MS",
              value_parser = clap::value_parser!(u32).range(1..=MAX_TIMEOUT_MS))]
        start_timeout: u32,

        /// How long to wait for each byte inside a block
        #[arg(long = "byte-timeout-ms", default_value = "250", value_name = "MS",
              value_parser = clap::value_parser!(u32).range(1..=MAX_TIMEOUT_MS))]
        byte_timeout: u32,

        /// Print a hex dump of the received bytes
        #[arg(long)]
        hexdump: bool,
    },
}

#[derive(Debug, Error)]
enum ReceiveError {
    #[error("{0}")]
    Transfer(#[from] TransferError),
    #[error("received {length} bytes but could not write {}: {source}", .path.display())]
    Output {
        length: usize,
        path: PathBuf,
        source: std::io::Error,
    },
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn receive_config(retries: u32, start_timeout_ms: u32, byte_timeout_ms: u32) -> ReceiveConfig {
    ReceiveConfig {
        start_timeout_usecs: start_timeout_ms.saturating_mul(1000),
        byte_timeout_usecs: byte_timeout_ms.saturating_mul(1000),
        max_retries: retries,
        ..ReceiveConfig::default()
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let data_bits = match parse_data_bits(cli.data_bits) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let parity = match parse_parity(&cli.parity) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let stop_bits = match parse_stop_bits(cli.stop_bits) {
        Ok(sb) => sb,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    info!("Opening serial port: {}", cli.port);
    info!("Settings: {} baud, {:?}, {:?}, {:?}", cli.baud, data_bits, parity, stop_bits);

    let serial_port = match RealSerialPort::open(&cli.port, cli.baud, data_bits, parity, stop_bits) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Failed to open serial port: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Receive { output, capacity, retries, start_timeout, byte_timeout, hexdump: dump } => {
            if capacity == 0 {
                eprintln!("Error: capacity must be at least 1 byte");
                std::process::exit(1);
            }

            let config = receive_config(retries, start_timeout, byte_timeout);
            println!("\nWaiting for sender (up to {} bytes)...", capacity);
            match receive_file(serial_port, capacity, &config, output, dump) {
                Ok(length) => println!("\nReceived {} bytes", length),
                Err(ReceiveError::Transfer(e)) => {
                    eprintln!("Receive failed: {}", e);
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}

fn receive_file(
    mut serial_port: RealSerialPort,
    capacity: usize,
    config: &ReceiveConfig,
    output: Option<PathBuf>,
    dump: bool,
) -> Result<usize, ReceiveError> {
    let clock = SystemClock::new();
    let mut buffer = vec![0u8; capacity];

    let length = xmrecv::receive_with_config(&mut serial_port, &clock, &mut buffer, capacity, config)?;
    let data = &buffer[..length];

    if let Some(path) = output {
        save_output(&path, data)?;
    }

    if dump {
        print!("{}", hexdump::hexdump(data));
    }

    Ok(length)
}

fn save_output(path: &Path, data: &[u8]) -> Result<(), ReceiveError> {
    std::fs::write(path, data).map_err(|source| ReceiveError::Output {
        length: data.len(),
        path: path.to_path_buf(),
        source,
    })?;
    info!("Wrote {}", path.display());
    Ok(())
}
