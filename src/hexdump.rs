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


//! Hex/ASCII listing of a received image.

use std::fmt::Write;

/// Bytes shown per line
pub const WIDTH: usize = 16;

/// Formats `data` as `OOOOOOOO: xx xx ..  |ascii|` lines, one per 16 bytes.
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::new();
    for (n, chunk) in data.chunks(WIDTH).enumerate() {
        format_line(&mut out, n * WIDTH, chunk);
    }
    out
}

fn format_line(out: &mut String, offset: usize, chunk: &[u8]) {
    let _ = write!(out, "{:08X}:", offset);
    for byte in chunk {
        let _ = write!(out, " {:02X}", byte);
    }
    for _ in chunk.len()..WIDTH {
        out.push_str("   ");
    }

    out.push_str("  |");
    out.extend(chunk.iter().map(|&b| if b.is_ascii_graphic() { b as char } else { '.' }));
    out.push_str("|\n");
}
