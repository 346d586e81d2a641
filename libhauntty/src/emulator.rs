// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `Emulator` is the capability-typed terminal instance the session engine
//! drives: `feed`, `resize`, `dump`, `encode_key`, `get_pwd`, `close`. It
//! wraps `shpool_vt100::Parser`, the same crate `session_restore.rs` uses
//! for in-process reattach, and adds the key-encoding and cwd-reading
//! operations that crate doesn't provide.

use tracing::debug;

/// Selects which textual rendering `Dump` produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpSelector {
    Plain,
    VtSafe,
    Html,
}

/// Decoded form of the protocol's one-byte dump format selector: bits 0-3
/// choose the rendering, bit 4 asks for soft-wrapped lines to be joined,
/// bit 5 asks for scrollback history to be included.
#[derive(Debug, Clone, Copy)]
pub struct DumpFormat {
    pub selector: DumpSelector,
    pub join_wrapped: bool,
    pub include_scrollback: bool,
}

impl DumpFormat {
    pub fn from_byte(b: u8) -> DumpFormat {
        let selector = match b & 0x0F {
            0 => DumpSelector::Plain,
            1 => DumpSelector::VtSafe,
            2 => DumpSelector::Html,
            other => {
                debug!("unknown dump selector {}, falling back to plain", other);
                DumpSelector::Plain
            }
        };
        DumpFormat { selector, join_wrapped: b & 0x10 != 0, include_scrollback: b & 0x20 != 0 }
    }
}

/// Result of `Emulator::dump`.
pub struct Dump {
    pub vt: Vec<u8>,
    pub cursor_row: u32,
    pub cursor_col: u32,
    pub is_alt_screen: bool,
}

pub struct Emulator {
    parser: shpool_vt100::Parser,
}

impl Emulator {
    pub fn new(cols: u16, rows: u16, scrollback_lines: usize) -> Emulator {
        Emulator { parser: shpool_vt100::Parser::new(rows, cols, scrollback_lines) }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.parser.screen_mut().set_size(rows, cols);
    }

    pub fn size(&self) -> (u16, u16) {
        // vt100's Screen::size returns (rows, cols); we report (cols, rows)
        // to match the rest of this crate's field ordering.
        let (rows, cols) = self.parser.screen().size();
        (cols, rows)
    }

    pub fn dump(&self, format: DumpFormat) -> Dump {
        let screen = self.parser.screen();
        let vt = match (format.selector, format.include_scrollback) {
            (DumpSelector::Html, _) => {
                debug!("html dump requested but not supported by the backing emulator, falling back to vt-safe");
                screen.contents_formatted()
            }
            (DumpSelector::VtSafe, false) => screen.contents_formatted(),
            (DumpSelector::VtSafe, true) => {
                screen.last_n_rows_contents_formatted(screen.size().0 as usize)
            }
            (DumpSelector::Plain, false) => screen.contents().into_bytes(),
            (DumpSelector::Plain, true) => {
                screen.last_n_rows_contents_formatted(screen.size().0 as usize)
            }
        };
        let (cursor_row, cursor_col) = screen.cursor_position();
        Dump {
            vt,
            cursor_row: cursor_row as u32,
            cursor_col: cursor_col as u32,
            is_alt_screen: screen.alternate_screen(),
        }
    }

    /// Reads bytes into the emulator without returning a dump; used during
    /// session restore to replay persisted VT state and the soft-reset
    /// sequences that follow it.
    pub fn replay(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    pub fn close(&mut self) {
        // Nothing to release; `shpool_vt100::Parser` has no external
        // resources. Present for capability-contract symmetry.
    }
}

// ---------------------------------------------------------------------
// key encoding
// ---------------------------------------------------------------------

pub const KEY_UP: u32 = 1;
pub const KEY_DOWN: u32 = 2;
pub const KEY_LEFT: u32 = 3;
pub const KEY_RIGHT: u32 = 4;
pub const KEY_HOME: u32 = 5;
pub const KEY_END: u32 = 6;
pub const KEY_PAGE_UP: u32 = 7;
pub const KEY_PAGE_DOWN: u32 = 8;
pub const KEY_INSERT: u32 = 9;
pub const KEY_DELETE: u32 = 10;
pub const KEY_F1: u32 = 11;
pub const KEY_F12: u32 = 22;
pub const KEY_BACKSPACE: u32 = 23;
pub const KEY_TAB: u32 = 24;
pub const KEY_ENTER: u32 = 25;
pub const KEY_ESCAPE: u32 = 26;

pub const MOD_SHIFT: u32 = 1;
pub const MOD_ALT: u32 = 2;
pub const MOD_CTRL: u32 = 4;

/// Encodes a logical key + modifier set into the byte sequence a shell
/// expects on its PTY, following the xterm `modifyOtherKeys`-style
/// convention (`CSI 1 ; <modifier+1> <letter>` for arrow/nav keys).
pub fn encode_key(key_code: u32, mods: u32) -> Vec<u8> {
    let modifier_param = 1 + mods;
    let plain = |letter: u8| -> Vec<u8> {
        if mods == 0 {
            vec![0x1b, b'[', letter]
        } else {
            format!("\x1b[1;{}{}", modifier_param, letter as char).into_bytes()
        }
    };
    match key_code {
        KEY_UP => plain(b'A'),
        KEY_DOWN => plain(b'B'),
        KEY_RIGHT => plain(b'C'),
        KEY_LEFT => plain(b'D'),
        KEY_HOME => plain(b'H'),
        KEY_END => plain(b'F'),
        KEY_PAGE_UP => tilde_seq(5, mods),
        KEY_PAGE_DOWN => tilde_seq(6, mods),
        KEY_INSERT => tilde_seq(2, mods),
        KEY_DELETE => tilde_seq(3, mods),
        f @ KEY_F1..=KEY_F12 => function_key_seq((f - KEY_F1 + 1) as u8, mods),
        KEY_BACKSPACE => vec![0x7f],
        KEY_TAB => vec![b'\t'],
        KEY_ENTER => vec![b'\r'],
        KEY_ESCAPE => vec![0x1b],
        other => {
            debug!("unknown key code {}, ignoring", other);
            Vec::new()
        }
    }
}

fn tilde_seq(num: u8, mods: u32) -> Vec<u8> {
    if mods == 0 {
        format!("\x1b[{}~", num).into_bytes()
    } else {
        format!("\x1b[{};{}~", num, 1 + mods).into_bytes()
    }
}

fn function_key_seq(n: u8, mods: u32) -> Vec<u8> {
    // xterm encodes F1-F4 as SS3 letters and F5+ as CSI ~ sequences.
    let base = match n {
        1 => return ss3_or_modified(b'P', mods),
        2 => return ss3_or_modified(b'Q', mods),
        3 => return ss3_or_modified(b'R', mods),
        4 => return ss3_or_modified(b'S', mods),
        5 => 15,
        6 => 17,
        7 => 18,
        8 => 19,
        9 => 20,
        10 => 21,
        11 => 23,
        12 => 24,
        _ => 24,
    };
    tilde_seq(base, mods)
}

fn ss3_or_modified(letter: u8, mods: u32) -> Vec<u8> {
    if mods == 0 {
        vec![0x1b, b'O', letter]
    } else {
        format!("\x1b[1;{}{}", 1 + mods, letter as char).into_bytes()
    }
}

/// Reads a process's current working directory off `/proc`. Linux only,
/// matching the daemon's other `/proc`-based introspection.
pub fn get_pwd(pid: libc::pid_t) -> Option<String> {
    std::fs::read_link(format!("/proc/{}/cwd", pid))
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn feed_and_dump_plain_roundtrips_text() {
        let mut emu = Emulator::new(80, 24, 100);
        emu.feed(b"hello world");
        let dump = emu.dump(DumpFormat::from_byte(0));
        assert!(String::from_utf8_lossy(&dump.vt).contains("hello world"));
    }

    #[test]
    fn resize_updates_size() {
        let mut emu = Emulator::new(80, 24, 100);
        emu.resize(100, 30);
        assert_eq!(emu.size(), (100, 30));
    }

    #[test]
    fn encode_key_plain_arrow() {
        assert_eq!(encode_key(KEY_UP, 0), vec![0x1b, b'[', b'A']);
    }

    #[test]
    fn encode_key_shifted_arrow() {
        assert_eq!(encode_key(KEY_UP, MOD_SHIFT), b"\x1b[1;2A".to_vec());
    }

    #[test]
    fn encode_key_unknown_is_empty() {
        assert!(encode_key(9999, 0).is_empty());
    }

    #[test]
    fn dump_format_decodes_bits() {
        let f = DumpFormat::from_byte(0b0011_0001);
        assert_eq!(f.selector, DumpSelector::VtSafe);
        assert!(f.join_wrapped);
        assert!(f.include_scrollback);
    }
}
