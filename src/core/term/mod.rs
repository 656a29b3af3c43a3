//! Terminal emulation: escape-sequence parser and scrollback buffer.

pub mod buffer;
pub mod parser;

pub use buffer::{
    AttrFlags, Cell, CellAttrs, Color, Cursor, Line, TerminalBuffer, TerminalModes,
    DEFAULT_SCROLLBACK,
};
pub use parser::{Response, StreamParser};
