//! Render diff engine
//!
//! Turns terminal buffer state into text patches for a scrolling view. The
//! view document is history followed by the live screen. Most refreshes only
//! append new history and replace the screen window; a full rebuild happens
//! after a clear, a history wipe or a width change.

use std::time::{Duration, Instant};

use tracing::trace;

use super::term::{Line, TerminalBuffer};

/// Position of the terminal cursor in document coordinates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CursorLocation {
    /// History length + cursor row
    pub line: usize,
    pub col: u16,
    pub visible: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RenderUpdate {
    /// Replace the whole document
    Full {
        lines: Vec<String>,
        /// Line to scroll to; `None` keeps the current offset
        scroll_to: Option<usize>,
    },
    /// Drop `evicted` lines from the front, cut the document at
    /// `history_start`, then append `new_history` and `screen`
    Incremental {
        evicted: usize,
        history_start: usize,
        new_history: Vec<String>,
        screen: Vec<String>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderPatch {
    pub update: RenderUpdate,
    pub cursor: CursorLocation,
}

/// Consumer of render patches
pub trait RenderSink {
    fn apply(&mut self, patch: &RenderPatch);
}

#[derive(Clone, Copy, Debug)]
struct RenderState {
    history_len: usize,
    history_pushed: u64,
    history_epoch: u64,
    cols: u16,
}

#[derive(Default)]
pub struct RenderDiffEngine {
    last: Option<RenderState>,
}

impl RenderDiffEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the patch bringing the view up to date with `buf`.
    ///
    /// Consumes the buffer's "cleared" notification.
    pub fn refresh(&mut self, buf: &mut TerminalBuffer) -> RenderPatch {
        let cleared = buf.take_cleared();
        let history_len = buf.history_len();
        let state = RenderState {
            history_len,
            history_pushed: buf.history_pushed(),
            history_epoch: buf.history_epoch(),
            cols: buf.cols(),
        };

        let update = match self.last {
            Some(last)
                if !cleared
                    && last.history_epoch == state.history_epoch
                    && last.cols == state.cols
                    && history_len >= last.history_len =>
            {
                let pushed = (state.history_pushed - last.history_pushed) as usize;
                let shown = pushed.min(history_len);
                let evicted = (last.history_len + pushed - history_len).min(last.history_len);
                trace!(pushed, evicted, "incremental render");

                RenderUpdate::Incremental {
                    evicted,
                    history_start: last.history_len - evicted,
                    new_history: lines_text(buf.history().range(history_len - shown..)),
                    screen: lines_text(buf.screen()),
                }
            }
            _ => {
                trace!(history_len, cleared, "full render");
                RenderUpdate::Full {
                    lines: Self::document(buf),
                    scroll_to: cleared.then_some(history_len),
                }
            }
        };

        self.last = Some(state);
        let cursor = buf.cursor();
        RenderPatch {
            update,
            cursor: CursorLocation {
                line: history_len + cursor.row as usize,
                col: cursor.col,
                visible: cursor.visible,
            },
        }
    }

    /// Full document text: history followed by the screen
    pub fn document(buf: &TerminalBuffer) -> Vec<String> {
        let mut lines = Vec::with_capacity(buf.history_len() + buf.rows() as usize);
        lines.extend(buf.history().iter().map(Line::text));
        lines.extend(buf.screen().iter().map(Line::text));
        lines
    }
}

fn lines_text<'a>(lines: impl IntoIterator<Item = &'a Line>) -> Vec<String> {
    lines.into_iter().map(Line::text).collect()
}

/// Coalesces output into at most one render per interval
pub struct RenderTicker {
    interval: Duration,
    last: Option<Instant>,
    dirty: bool,
}

impl RenderTicker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            dirty: false,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// True when dirty and the interval has elapsed; clears the flag
    pub fn due(&mut self, now: Instant) -> bool {
        if !self.dirty {
            return false;
        }
        if let Some(last) = self.last {
            if now.duration_since(last) < self.interval {
                return false;
            }
        }
        self.dirty = false;
        self.last = Some(now);
        true
    }

    /// Time left before a pending render may run
    pub fn time_until_due(&self, now: Instant) -> Option<Duration> {
        if !self.dirty {
            return None;
        }
        Some(match self.last {
            Some(last) => self.interval.saturating_sub(now.duration_since(last)),
            None => Duration::ZERO,
        })
    }
}
