//! Stream parser
//!
//! Incremental decoder for the byte stream coming out of a session. Input may
//! be split at any byte: escape sequences and UTF-8 characters are carried
//! over between `feed` calls.

use tracing::debug;

use super::buffer::{AttrFlags, Color, TerminalBuffer};

const REPLACEMENT: char = '\u{FFFD}';
const MAX_OSC_LEN: usize = 4096;
const MAX_PARAMS: usize = 32;

/// Reply that needs to be written back to the session
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Cursor position report: ESC [ row ; col R
    CursorPosition(u16, u16),
    /// Device attributes response
    DeviceAttributes,
    /// Secondary device attributes response
    SecondaryDeviceAttributes,
    /// Device status report: terminal OK
    StatusOk,
}

impl Response {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Response::CursorPosition(row, col) => format!("\x1b[{};{}R", row, col).into_bytes(),
            // VT220
            Response::DeviceAttributes => b"\x1b[?62;c".to_vec(),
            Response::SecondaryDeviceAttributes => b"\x1b[>1;10;0c".to_vec(),
            Response::StatusOk => b"\x1b[0n".to_vec(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
enum ParserState {
    #[default]
    Ground,
    Escape,
    EscapeIntermediate,
    CsiEntry,
    CsiParam,
    CsiIntermediate,
    /// Malformed CSI, swallowed up to its final byte
    CsiIgnore,
    OscString,
    /// ESC received inside OSC, waiting for backslash
    EscapeInOsc,
}

/// UTF-8 bytes of a character not yet complete
#[derive(Default)]
struct Utf8Carry {
    bytes: [u8; 4],
    len: usize,
    need: usize,
}

impl Utf8Carry {
    fn is_pending(&self) -> bool {
        self.len > 0
    }

    fn reset(&mut self) {
        self.len = 0;
        self.need = 0;
    }

    /// Start a sequence with its lead byte; `None` for bytes that cannot lead
    fn start(&mut self, byte: u8) -> Option<()> {
        let need = match byte {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return None,
        };
        self.bytes[0] = byte;
        self.len = 1;
        self.need = need;
        Some(())
    }

    /// Add a continuation byte; returns the character once complete
    fn push(&mut self, byte: u8) -> Option<char> {
        self.bytes[self.len] = byte;
        self.len += 1;
        if self.len < self.need {
            return None;
        }
        let ch = std::str::from_utf8(&self.bytes[..self.len])
            .ok()
            .and_then(|s| s.chars().next())
            .unwrap_or(REPLACEMENT);
        self.reset();
        Some(ch)
    }
}

fn is_continuation(byte: u8) -> bool {
    (0x80..=0xBF).contains(&byte)
}

/// Escape sequence state machine
#[derive(Default)]
pub struct StreamParser {
    state: ParserState,
    params: Vec<u16>,
    intermediates: Vec<u8>,
    current_param: Option<u16>,
    osc: Vec<u8>,
    utf8: Utf8Carry,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a chunk of output to the buffer, returning any replies
    pub fn feed(&mut self, data: &[u8], buf: &mut TerminalBuffer) -> Vec<Response> {
        let mut responses = Vec::new();
        for &byte in data {
            if let Some(response) = self.advance(byte, buf) {
                responses.push(response);
            }
        }
        responses
    }

    fn advance(&mut self, byte: u8, buf: &mut TerminalBuffer) -> Option<Response> {
        if self.utf8.is_pending() {
            if is_continuation(byte) {
                if let Some(ch) = self.utf8.push(byte) {
                    buf.put_char(ch);
                }
                return None;
            }
            // Truncated sequence
            self.utf8.reset();
            buf.put_char(REPLACEMENT);
        }

        let in_osc = matches!(self.state, ParserState::OscString | ParserState::EscapeInOsc);
        if byte < 0x20 && !in_osc {
            self.execute_c0(byte, buf);
            return None;
        }

        match self.state {
            ParserState::Ground => {
                self.ground(byte, buf);
                None
            }
            ParserState::Escape => {
                self.escape(byte, buf);
                None
            }
            ParserState::EscapeIntermediate => {
                self.escape_intermediate(byte);
                None
            }
            ParserState::CsiEntry => self.csi_entry(byte, buf),
            ParserState::CsiParam => self.csi_param(byte, buf),
            ParserState::CsiIntermediate => self.csi_intermediate(byte, buf),
            ParserState::CsiIgnore => {
                if (0x40..=0x7E).contains(&byte) {
                    self.state = ParserState::Ground;
                }
                None
            }
            ParserState::OscString => {
                self.osc_string(byte, buf);
                None
            }
            ParserState::EscapeInOsc => {
                self.escape_in_osc(byte, buf);
                None
            }
        }
    }

    fn execute_c0(&mut self, byte: u8, buf: &mut TerminalBuffer) {
        match byte {
            0x1B => self.enter_escape(),
            0x07 => {} // BEL
            0x08 => buf.backspace(),
            0x09 => buf.horizontal_tab(),
            0x0A..=0x0C => {
                if buf.modes.linefeed_newline {
                    buf.carriage_return();
                }
                buf.linefeed();
            }
            0x0D => buf.carriage_return(),
            // CAN / SUB abort a sequence
            0x18 | 0x1A => self.state = ParserState::Ground,
            _ => {}
        }
    }

    fn enter_escape(&mut self) {
        self.state = ParserState::Escape;
        self.params.clear();
        self.intermediates.clear();
        self.current_param = None;
    }

    fn ground(&mut self, byte: u8, buf: &mut TerminalBuffer) {
        match byte {
            0x20..=0x7E => buf.put_char(byte as char),
            0x7F => {}
            _ => {
                if self.utf8.start(byte).is_none() {
                    buf.put_char(REPLACEMENT);
                }
            }
        }
    }

    fn escape(&mut self, byte: u8, buf: &mut TerminalBuffer) {
        self.state = ParserState::Ground;
        match byte {
            b'[' => self.state = ParserState::CsiEntry,
            b']' => {
                self.osc.clear();
                self.state = ParserState::OscString;
            }
            b'7' => buf.save_cursor(),
            b'8' => buf.restore_cursor(),
            // IND
            b'D' => buf.linefeed(),
            // NEL
            b'E' => {
                buf.carriage_return();
                buf.linefeed();
            }
            b'M' => buf.reverse_index(),
            b'c' => {
                buf.reset();
                self.utf8.reset();
            }
            0x20..=0x2F => {
                self.intermediates.push(byte);
                self.state = ParserState::EscapeIntermediate;
            }
            _ => debug!(byte, "ignoring escape sequence"),
        }
    }

    fn escape_intermediate(&mut self, byte: u8) {
        match byte {
            0x20..=0x2F => self.intermediates.push(byte),
            // Final byte; charset selections land here and are ignored
            _ => self.state = ParserState::Ground,
        }
    }

    fn csi_entry(&mut self, byte: u8, buf: &mut TerminalBuffer) -> Option<Response> {
        match byte {
            b'0'..=b'9' | b';' | b':' => {
                self.state = ParserState::CsiParam;
                self.csi_param(byte, buf)
            }
            b'?' | b'>' | b'!' | b'=' => {
                self.intermediates.push(byte);
                None
            }
            0x20..=0x2F => {
                self.intermediates.push(byte);
                self.state = ParserState::CsiIntermediate;
                None
            }
            0x40..=0x7E => self.execute_csi(byte, buf),
            _ => {
                self.state = ParserState::Ground;
                None
            }
        }
    }

    fn csi_param(&mut self, byte: u8, buf: &mut TerminalBuffer) -> Option<Response> {
        match byte {
            b'0'..=b'9' => {
                let digit = (byte - b'0') as u16;
                self.current_param = Some(
                    self.current_param
                        .unwrap_or(0)
                        .saturating_mul(10)
                        .saturating_add(digit),
                );
                None
            }
            // Subparameters are flattened into the parameter list
            b';' | b':' => {
                self.push_param();
                None
            }
            0x20..=0x2F => {
                self.push_param();
                self.intermediates.push(byte);
                self.state = ParserState::CsiIntermediate;
                None
            }
            0x40..=0x7E => {
                if self.current_param.is_some() {
                    self.push_param();
                }
                self.execute_csi(byte, buf)
            }
            _ => {
                self.state = ParserState::CsiIgnore;
                None
            }
        }
    }

    fn push_param(&mut self) {
        let param = self.current_param.take().unwrap_or(0);
        if self.params.len() < MAX_PARAMS {
            self.params.push(param);
        }
    }

    fn csi_intermediate(&mut self, byte: u8, buf: &mut TerminalBuffer) -> Option<Response> {
        match byte {
            0x20..=0x2F => {
                self.intermediates.push(byte);
                None
            }
            0x40..=0x7E => self.execute_csi(byte, buf),
            _ => {
                self.state = ParserState::CsiIgnore;
                None
            }
        }
    }

    fn osc_string(&mut self, byte: u8, buf: &mut TerminalBuffer) {
        match byte {
            0x07 => {
                self.execute_osc(buf);
                self.state = ParserState::Ground;
            }
            0x1B => self.state = ParserState::EscapeInOsc,
            _ => {
                if self.osc.len() < MAX_OSC_LEN {
                    self.osc.push(byte);
                }
            }
        }
    }

    fn escape_in_osc(&mut self, byte: u8, buf: &mut TerminalBuffer) {
        self.execute_osc(buf);
        if byte == b'\\' {
            self.state = ParserState::Ground;
        } else {
            // Not ST: the ESC starts a new sequence
            self.enter_escape();
            self.advance(byte, buf);
        }
    }

    /// First parameter as a repeat count (0 and missing mean 1)
    fn count(&self) -> u16 {
        self.params.first().copied().unwrap_or(1).max(1)
    }

    fn param(&self, idx: usize, default: u16) -> u16 {
        match self.params.get(idx).copied() {
            Some(0) | None => default,
            Some(v) => v,
        }
    }

    fn execute_csi(&mut self, final_byte: u8, buf: &mut TerminalBuffer) -> Option<Response> {
        self.state = ParserState::Ground;

        let is_private = self.intermediates.contains(&b'?');
        let is_gt = self.intermediates.contains(&b'>');
        let has_space = self.intermediates.contains(&b' ');
        let n = self.count();

        match (is_private, is_gt, final_byte) {
            // DECSCUSR - cursor style is not tracked
            _ if has_space && final_byte == b'q' => {}

            (false, false, b'A') => buf.cursor_up(n),
            (false, false, b'B') => buf.cursor_down(n),
            (false, false, b'C') => buf.cursor_forward(n),
            (false, false, b'D') => buf.cursor_backward(n),
            (false, false, b'E') => {
                buf.cursor_down(n);
                buf.carriage_return();
            }
            (false, false, b'F') => {
                buf.cursor_up(n);
                buf.carriage_return();
            }
            (false, false, b'G') | (false, false, b'`') => buf.set_column(self.param(0, 1)),
            (false, false, b'H') | (false, false, b'f') => {
                buf.cursor_position(self.param(0, 1), self.param(1, 1));
            }
            (false, false, b'd') => buf.set_row(self.param(0, 1)),

            (false, false, b'J') => {
                buf.erase_in_display(self.params.first().copied().unwrap_or(0));
            }
            (false, false, b'K') => buf.erase_in_line(self.params.first().copied().unwrap_or(0)),

            (false, false, b'L') => buf.insert_lines(n),
            (false, false, b'M') => buf.delete_lines(n),
            (false, false, b'@') => buf.insert_chars(n),
            (false, false, b'P') => buf.delete_chars(n),
            (false, false, b'X') => buf.erase_chars(n),

            (false, false, b'S') => buf.scroll_up(n),
            (false, false, b'T') => buf.scroll_down(n),

            (false, false, b'r') => {
                let bottom = self.param(1, buf.rows());
                buf.set_scroll_region(self.param(0, 1), bottom);
            }

            (false, false, b'm') => self.execute_sgr(buf),

            (false, false, b's') => buf.save_cursor(),
            (false, false, b'u') => buf.restore_cursor(),

            (false, false, b'n') => match self.params.first() {
                Some(5) => return Some(Response::StatusOk),
                Some(6) => {
                    let cursor = buf.cursor();
                    return Some(Response::CursorPosition(cursor.row + 1, cursor.col + 1));
                }
                _ => {}
            },

            (false, false, b'c') => return Some(Response::DeviceAttributes),
            (false, true, b'c') => return Some(Response::SecondaryDeviceAttributes),

            (true, false, b'h') | (true, false, b'l') => {
                let enable = final_byte == b'h';
                for &mode in &self.params {
                    buf.set_private_mode(mode, enable);
                }
            }

            (false, false, b'h') | (false, false, b'l') => {
                let enable = final_byte == b'h';
                for &mode in &self.params {
                    match mode {
                        4 => buf.modes.insert_mode = enable,
                        20 => buf.modes.linefeed_newline = enable,
                        _ => debug!(mode, enable, "ignoring mode"),
                    }
                }
            }

            _ => debug!(
                intermediates = ?self.intermediates,
                params = ?self.params,
                final_byte = %(final_byte as char),
                "unknown CSI"
            ),
        }
        None
    }

    fn execute_sgr(&self, buf: &mut TerminalBuffer) {
        let attrs = &mut buf.attrs;
        if self.params.is_empty() {
            attrs.reset();
            return;
        }

        let mut iter = self.params.iter().copied();
        while let Some(param) = iter.next() {
            match param {
                0 => attrs.reset(),
                1 => attrs.flags |= AttrFlags::BOLD,
                2 => attrs.flags |= AttrFlags::DIM,
                3 => attrs.flags |= AttrFlags::ITALIC,
                4 => attrs.flags |= AttrFlags::UNDERLINE,
                5 => attrs.flags |= AttrFlags::BLINK,
                7 => attrs.flags |= AttrFlags::INVERSE,
                8 => attrs.flags |= AttrFlags::HIDDEN,
                9 => attrs.flags |= AttrFlags::STRIKETHROUGH,

                22 => attrs.flags &= !(AttrFlags::BOLD | AttrFlags::DIM),
                23 => attrs.flags &= !AttrFlags::ITALIC,
                24 => attrs.flags &= !AttrFlags::UNDERLINE,
                25 => attrs.flags &= !AttrFlags::BLINK,
                27 => attrs.flags &= !AttrFlags::INVERSE,
                28 => attrs.flags &= !AttrFlags::HIDDEN,
                29 => attrs.flags &= !AttrFlags::STRIKETHROUGH,

                30..=37 => attrs.fg = Color::Indexed((param - 30) as u8),
                38 => {
                    if let Some(color) = extended_color(&mut iter) {
                        attrs.fg = color;
                    }
                }
                39 => attrs.fg = Color::Default,

                40..=47 => attrs.bg = Color::Indexed((param - 40) as u8),
                48 => {
                    if let Some(color) = extended_color(&mut iter) {
                        attrs.bg = color;
                    }
                }
                49 => attrs.bg = Color::Default,

                90..=97 => attrs.fg = Color::Indexed((param - 90 + 8) as u8),
                100..=107 => attrs.bg = Color::Indexed((param - 100 + 8) as u8),

                _ => {}
            }
        }
    }

    fn execute_osc(&mut self, buf: &mut TerminalBuffer) {
        let text = String::from_utf8_lossy(&self.osc);
        if let Some((code, value)) = text.split_once(';') {
            match code {
                "0" | "1" | "2" => buf.title = value.to_string(),
                _ => debug!(code, "ignoring OSC"),
            }
        }
        self.osc.clear();
    }
}

/// `5;n` (256 colors) or `2;r;g;b` (truecolor) after 38/48
fn extended_color(iter: &mut impl Iterator<Item = u16>) -> Option<Color> {
    match iter.next()? {
        5 => iter.next().map(|n| Color::Indexed(n as u8)),
        2 => {
            let r = iter.next().unwrap_or(0) as u8;
            let g = iter.next().unwrap_or(0) as u8;
            let b = iter.next().unwrap_or(0) as u8;
            Some(Color::Rgb(r, g, b))
        }
        _ => None,
    }
}
