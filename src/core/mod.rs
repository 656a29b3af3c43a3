//! Core terminal components.
//!
//! - **pty**: local shell process, in a pseudo-terminal or over pipes
//! - **term**: terminal buffer and escape sequence parser
//! - **render**: diffing the buffer into view patches
//! - **session**: local and remote shell sessions
//!
//! # Architecture
//!
//! ```text
//! Session (bytes) ──> StreamParser ──> TerminalBuffer
//!                                         │
//!                                RenderDiffEngine ──> RenderSink
//! ```

pub mod pty;
pub mod render;
pub mod session;
pub mod term;
