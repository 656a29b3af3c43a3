//! Scrollable text view fed by render patches

use std::ops::Range;

use crate::core::render::{CursorLocation, RenderPatch, RenderSink, RenderUpdate};

/// Document of history plus screen lines with a viewport.
///
/// `offset` counts lines between the viewport bottom and the document end;
/// zero means the view follows live output.
pub struct ScrollView {
    lines: Vec<String>,
    cursor: Option<CursorLocation>,
    height: usize,
    offset: usize,
}

impl ScrollView {
    pub fn new(height: u16) -> Self {
        Self {
            lines: Vec::new(),
            cursor: None,
            height: height.max(1) as usize,
            offset: 0,
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn cursor(&self) -> Option<CursorLocation> {
        self.cursor
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn set_height(&mut self, height: u16) {
        self.height = height.max(1) as usize;
        self.offset = self.offset.min(self.max_offset());
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_live(&self) -> bool {
        self.offset == 0
    }

    pub fn scroll_up(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.max_offset());
    }

    pub fn scroll_down(&mut self, n: usize) {
        self.offset = self.offset.saturating_sub(n);
    }

    pub fn scroll_to_top(&mut self) {
        self.offset = self.max_offset();
    }

    pub fn scroll_to_bottom(&mut self) {
        self.offset = 0;
    }

    /// Document lines currently in the viewport
    pub fn visible_range(&self) -> Range<usize> {
        let end = self.lines.len().saturating_sub(self.offset);
        end.saturating_sub(self.height)..end
    }

    /// Viewport row of the cursor, if the cursor is visible and on screen
    pub fn cursor_row(&self) -> Option<u16> {
        let cursor = self.cursor.filter(|c| c.visible)?;
        let range = self.visible_range();
        range
            .contains(&cursor.line)
            .then(|| (cursor.line - range.start) as u16)
    }

    fn max_offset(&self) -> usize {
        self.lines.len().saturating_sub(self.height)
    }

    fn top(&self) -> usize {
        self.visible_range().start
    }
}

impl RenderSink for ScrollView {
    fn apply(&mut self, patch: &RenderPatch) {
        match &patch.update {
            RenderUpdate::Full { lines, scroll_to } => {
                let top = self.top();
                self.lines.clone_from(lines);
                match scroll_to {
                    Some(line) => {
                        let bottom = (line + self.height).min(self.lines.len());
                        self.offset = self.lines.len() - bottom;
                    }
                    None => self.offset = self.offset.min(self.max_offset()),
                }
                if !self.is_live() && scroll_to.is_none() {
                    self.keep_top(top);
                }
            }
            RenderUpdate::Incremental {
                evicted,
                history_start,
                new_history,
                screen,
            } => {
                let top = self.top().saturating_sub(*evicted);
                let evicted = (*evicted).min(self.lines.len());
                self.lines.drain(..evicted);
                self.lines.truncate(*history_start);
                self.lines.extend(new_history.iter().cloned());
                self.lines.extend(screen.iter().cloned());
                if !self.is_live() {
                    self.keep_top(top);
                }
            }
        }
        self.cursor = Some(patch.cursor);
    }
}

impl ScrollView {
    /// Pin the viewport to start at document line `top`
    fn keep_top(&mut self, top: usize) {
        let bottom = (top + self.height).min(self.lines.len());
        self.offset = (self.lines.len() - bottom).min(self.max_offset());
    }
}
