//! Terminal buffer
//!
//! Owns the screen grid, the cursor and the bounded scrollback history.
//! The parser drives it through the editing operations below; the render
//! engine reads it back as text.

use std::collections::VecDeque;

use bitflags::bitflags;
use tracing::debug;
use unicode_width::UnicodeWidthChar;

/// Default number of history lines kept
pub const DEFAULT_SCROLLBACK: usize = 10_000;

/// Screen grid plus scrollback history
pub struct TerminalBuffer {
    cols: u16,
    rows: u16,
    primary: Vec<Line>,
    alternate: Vec<Line>,
    using_alternate: bool,
    primary_cursor: Cursor,
    alternate_cursor: Cursor,
    history: VecDeque<Line>,
    scrollback_limit: usize,
    /// Total lines ever pushed to history, evicted ones included
    history_pushed: u64,
    /// Incremented whenever history is wiped
    history_epoch: u64,
    /// Set by a soft clear until the renderer consumes it
    cleared: bool,
    pub attrs: CellAttrs,
    pub modes: TerminalModes,
    pub title: String,
    /// Scroll region (top, bottom) - 0-indexed, inclusive
    scroll_region: (u16, u16),
}

impl TerminalBuffer {
    pub fn new(rows: u16, cols: u16, scrollback_limit: usize) -> Self {
        let rows = rows.max(1);
        let cols = cols.max(1);
        Self {
            cols,
            rows,
            primary: blank_grid(rows, cols, &CellAttrs::default()),
            alternate: blank_grid(rows, cols, &CellAttrs::default()),
            using_alternate: false,
            primary_cursor: Cursor::default(),
            alternate_cursor: Cursor::default(),
            history: VecDeque::new(),
            scrollback_limit,
            history_pushed: 0,
            history_epoch: 0,
            cleared: false,
            attrs: CellAttrs::default(),
            modes: TerminalModes::default(),
            title: String::new(),
            scroll_region: (0, rows - 1),
        }
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    /// Lines of the active screen; always exactly `rows` long
    pub fn screen(&self) -> &[Line] {
        if self.using_alternate {
            &self.alternate
        } else {
            &self.primary
        }
    }

    fn screen_mut(&mut self) -> &mut Vec<Line> {
        if self.using_alternate {
            &mut self.alternate
        } else {
            &mut self.primary
        }
    }

    pub fn cursor(&self) -> &Cursor {
        if self.using_alternate {
            &self.alternate_cursor
        } else {
            &self.primary_cursor
        }
    }

    fn cursor_mut(&mut self) -> &mut Cursor {
        if self.using_alternate {
            &mut self.alternate_cursor
        } else {
            &mut self.primary_cursor
        }
    }

    pub fn is_alternate(&self) -> bool {
        self.using_alternate
    }

    pub fn history(&self) -> &VecDeque<Line> {
        &self.history
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn history_pushed(&self) -> u64 {
        self.history_pushed
    }

    pub fn history_epoch(&self) -> u64 {
        self.history_epoch
    }

    pub fn scrollback_limit(&self) -> usize {
        self.scrollback_limit
    }

    pub fn scroll_region(&self) -> (u16, u16) {
        self.scroll_region
    }

    /// Whether a soft clear happened since the last `take_cleared`
    pub fn cleared_pending(&self) -> bool {
        self.cleared
    }

    /// Consume the "cleared" notification
    pub fn take_cleared(&mut self) -> bool {
        std::mem::take(&mut self.cleared)
    }

    /// Append a line to history, evicting the oldest once the limit is hit
    pub fn push_history(&mut self, line: Line) {
        self.history_pushed += 1;
        if self.scrollback_limit == 0 {
            return;
        }
        self.history.push_back(line);
        while self.history.len() > self.scrollback_limit {
            self.history.pop_front();
        }
    }

    /// Drop all history (ED 3, RIS)
    pub fn clear_history(&mut self) {
        self.history.clear();
        self.history_epoch += 1;
    }

    /// Resize the grid; lines pushed off the top land in history
    pub fn resize(&mut self, rows: u16, cols: u16) {
        let rows = rows.max(1);
        let cols = cols.max(1);
        if rows == self.rows && cols == self.cols {
            return;
        }

        for line in self.primary.iter_mut().chain(self.alternate.iter_mut()) {
            line.resize(cols);
        }

        if rows < self.rows {
            let excess = self.rows - rows;
            let shift = (self.primary_cursor.row + 1).saturating_sub(rows).min(excess);
            for _ in 0..shift {
                let line = self.primary.remove(0);
                self.push_history(line);
            }
            self.primary.truncate(rows as usize);
            self.primary_cursor.row -= shift;

            let shift = (self.alternate_cursor.row + 1).saturating_sub(rows).min(excess);
            self.alternate.drain(..shift as usize);
            self.alternate.truncate(rows as usize);
            self.alternate_cursor.row -= shift;
        } else {
            let attrs = CellAttrs::default();
            self.primary.resize_with(rows as usize, || Line::blank(cols, &attrs));
            self.alternate.resize_with(rows as usize, || Line::blank(cols, &attrs));
        }

        self.rows = rows;
        self.cols = cols;
        self.scroll_region = (0, rows - 1);
        for cursor in [&mut self.primary_cursor, &mut self.alternate_cursor] {
            cursor.row = cursor.row.min(rows - 1);
            cursor.col = cursor.col.min(cols - 1);
            cursor.pending_wrap = false;
        }
    }

    /// Put a character at the cursor
    pub fn put_char(&mut self, ch: char) {
        let width = match ch.width() {
            Some(w) => w as u16,
            None => return,
        };

        if width == 0 {
            self.append_to_previous_cell(ch);
            return;
        }
        if width > self.cols {
            return;
        }

        let cols = self.cols;
        let needs_wrap = {
            let cursor = self.cursor();
            cursor.pending_wrap || cursor.col + width > cols
        };
        if needs_wrap {
            if self.modes.auto_wrap {
                let row = self.cursor().row as usize;
                self.screen_mut()[row].wrapped = true;
                let cursor = self.cursor_mut();
                cursor.col = 0;
                cursor.pending_wrap = false;
                self.linefeed();
            } else {
                let cursor = self.cursor_mut();
                cursor.pending_wrap = false;
                cursor.col = cols - width;
            }
        }

        if self.modes.insert_mode {
            self.insert_chars(width);
        }

        let (row, col) = {
            let cursor = self.cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        self.handle_wide_char_overwrite(row, col);

        let attrs = self.attrs.clone();
        let line = &mut self.screen_mut()[row];
        line.cells[col] = Cell {
            grapheme: ch.to_string(),
            width: width as u8,
            attrs: attrs.clone(),
        };
        if width == 2 {
            line.cells[col + 1] = Cell::continuation(&attrs);
        }

        let next = col as u16 + width;
        let auto_wrap = self.modes.auto_wrap;
        let cursor = self.cursor_mut();
        if next >= cols {
            cursor.col = cols - 1;
            cursor.pending_wrap = auto_wrap;
        } else {
            cursor.col = next;
        }
    }

    fn append_to_previous_cell(&mut self, ch: char) {
        let (row, col, pending) = {
            let cursor = self.cursor();
            (cursor.row as usize, cursor.col as usize, cursor.pending_wrap)
        };
        let mut target = if pending {
            col
        } else if col > 0 {
            col - 1
        } else {
            return;
        };
        let line = &mut self.screen_mut()[row];
        if target > 0 && line.cells[target].is_continuation() {
            target -= 1;
        }
        line.cells[target].grapheme.push(ch);
    }

    fn handle_wide_char_overwrite(&mut self, row: usize, col: usize) {
        let attrs = self.attrs.clone();
        let cols = self.cols as usize;
        let line = &mut self.screen_mut()[row];

        // Right half of a wide char
        if col > 0 && line.cells[col].is_continuation() {
            line.cells[col - 1].clear(&attrs);
        }
        // Left half of a wide char
        if line.cells[col].width == 2 && col + 1 < cols {
            line.cells[col + 1].clear(&attrs);
        }
    }

    pub fn carriage_return(&mut self) {
        let cursor = self.cursor_mut();
        cursor.col = 0;
        cursor.pending_wrap = false;
    }

    /// Move down one line, scrolling at the bottom of the scroll region
    pub fn linefeed(&mut self) {
        let bottom = self.scroll_region.1;
        let rows = self.rows;
        self.cursor_mut().pending_wrap = false;

        let row = self.cursor().row;
        if row == bottom {
            self.scroll_up(1);
        } else if row < rows - 1 {
            self.cursor_mut().row += 1;
        }
    }

    pub fn backspace(&mut self) {
        let cursor = self.cursor_mut();
        if cursor.pending_wrap {
            cursor.pending_wrap = false;
        } else if cursor.col > 0 {
            cursor.col -= 1;
        }
    }

    pub fn horizontal_tab(&mut self) {
        let cols = self.cols;
        let cursor = self.cursor_mut();
        cursor.col = (((cursor.col / 8) + 1) * 8).min(cols - 1);
        cursor.pending_wrap = false;
    }

    /// Scroll the region up; lines leaving the top of the primary screen go to history
    pub fn scroll_up(&mut self, n: u16) {
        let (top, bottom) = self.scroll_region;
        let n = n.min(bottom - top + 1);
        let cols = self.cols;
        let attrs = self.attrs.clone();
        let to_history = !self.using_alternate && top == 0;

        for _ in 0..n {
            let removed = self.screen_mut().remove(top as usize);
            self.screen_mut()
                .insert(bottom as usize, Line::blank(cols, &attrs));
            if to_history {
                self.push_history(removed);
            }
        }
    }

    pub fn scroll_down(&mut self, n: u16) {
        let (top, bottom) = self.scroll_region;
        let n = n.min(bottom - top + 1);
        let cols = self.cols;
        let attrs = self.attrs.clone();
        let screen = self.screen_mut();

        for _ in 0..n {
            screen.remove(bottom as usize);
            screen.insert(top as usize, Line::blank(cols, &attrs));
        }
    }

    pub fn cursor_up(&mut self, n: u16) {
        let top = self.scroll_region.0;
        let cursor = self.cursor_mut();
        // Stop at the region top when starting inside it
        let floor = if cursor.row >= top { top } else { 0 };
        cursor.row = cursor.row.saturating_sub(n).max(floor);
        cursor.pending_wrap = false;
    }

    pub fn cursor_down(&mut self, n: u16) {
        let bottom = self.scroll_region.1;
        let rows = self.rows;
        let cursor = self.cursor_mut();
        let ceiling = if cursor.row <= bottom { bottom } else { rows - 1 };
        cursor.row = cursor.row.saturating_add(n).min(ceiling);
        cursor.pending_wrap = false;
    }

    pub fn cursor_forward(&mut self, n: u16) {
        let cols = self.cols;
        let cursor = self.cursor_mut();
        cursor.col = cursor.col.saturating_add(n).min(cols - 1);
        cursor.pending_wrap = false;
    }

    pub fn cursor_backward(&mut self, n: u16) {
        let cursor = self.cursor_mut();
        cursor.col = cursor.col.saturating_sub(n);
        cursor.pending_wrap = false;
    }

    /// Set cursor position (1-indexed parameters)
    pub fn cursor_position(&mut self, row: u16, col: u16) {
        let rows = self.rows;
        let cols = self.cols;
        let cursor = self.cursor_mut();
        cursor.row = row.saturating_sub(1).min(rows - 1);
        cursor.col = col.saturating_sub(1).min(cols - 1);
        cursor.pending_wrap = false;
    }

    /// CHA (1-indexed)
    pub fn set_column(&mut self, col: u16) {
        let cols = self.cols;
        let cursor = self.cursor_mut();
        cursor.col = col.saturating_sub(1).min(cols - 1);
        cursor.pending_wrap = false;
    }

    /// VPA (1-indexed)
    pub fn set_row(&mut self, row: u16) {
        let rows = self.rows;
        let cursor = self.cursor_mut();
        cursor.row = row.saturating_sub(1).min(rows - 1);
        cursor.pending_wrap = false;
    }

    /// Erase in display.
    ///
    /// Mode 2, and mode 0 issued at the screen origin, are treated as a full
    /// clear: the screen is moved into history first and the "cleared"
    /// notification is raised. Mode 3 wipes history.
    pub fn erase_in_display(&mut self, mode: u16) {
        let (row, col) = {
            let cursor = self.cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        match mode {
            0 if row == 0 && col == 0 => self.soft_clear(),
            0 => {
                self.erase_in_line(0);
                let attrs = self.attrs.clone();
                for line in self.screen_mut().iter_mut().skip(row + 1) {
                    line.clear(&attrs);
                }
            }
            1 => {
                let attrs = self.attrs.clone();
                for line in self.screen_mut().iter_mut().take(row) {
                    line.clear(&attrs);
                }
                self.erase_in_line(1);
            }
            2 => self.soft_clear(),
            3 => self.clear_history(),
            _ => debug!(mode, "ignoring erase-in-display mode"),
        }
    }

    fn soft_clear(&mut self) {
        let blank = blank_grid(self.rows, self.cols, &self.attrs);
        if self.using_alternate {
            self.alternate = blank;
            return;
        }

        let old = std::mem::replace(&mut self.primary, blank);
        for line in old {
            self.push_history(line);
        }
        self.cleared = true;
        debug!(history = self.history.len(), "screen cleared into history");
    }

    pub fn erase_in_line(&mut self, mode: u16) {
        let (row, col) = {
            let cursor = self.cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        let attrs = self.attrs.clone();
        let line = &mut self.screen_mut()[row];

        match mode {
            0 => line.cells[col..].iter_mut().for_each(|c| c.clear(&attrs)),
            1 => line.cells[..=col].iter_mut().for_each(|c| c.clear(&attrs)),
            2 => line.clear(&attrs),
            _ => {}
        }
    }

    pub fn insert_lines(&mut self, n: u16) {
        let row = self.cursor().row;
        let (top, bottom) = self.scroll_region;
        if row < top || row > bottom {
            return;
        }
        let n = n.min(bottom - row + 1);
        let cols = self.cols;
        let attrs = self.attrs.clone();
        let screen = self.screen_mut();
        for _ in 0..n {
            screen.remove(bottom as usize);
            screen.insert(row as usize, Line::blank(cols, &attrs));
        }
        self.carriage_return();
    }

    pub fn delete_lines(&mut self, n: u16) {
        let row = self.cursor().row;
        let (top, bottom) = self.scroll_region;
        if row < top || row > bottom {
            return;
        }
        let n = n.min(bottom - row + 1);
        let cols = self.cols;
        let attrs = self.attrs.clone();
        let screen = self.screen_mut();
        for _ in 0..n {
            screen.remove(row as usize);
            screen.insert(bottom as usize, Line::blank(cols, &attrs));
        }
        self.carriage_return();
    }

    /// ICH - shift the rest of the line right
    pub fn insert_chars(&mut self, n: u16) {
        let (row, col) = {
            let cursor = self.cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        let attrs = self.attrs.clone();
        let cells = &mut self.screen_mut()[row].cells;
        let n = (n as usize).min(cells.len() - col);
        for _ in 0..n {
            cells.pop();
            cells.insert(col, Cell::blank(&attrs));
        }
    }

    /// DCH - shift the rest of the line left
    pub fn delete_chars(&mut self, n: u16) {
        let (row, col) = {
            let cursor = self.cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        let attrs = self.attrs.clone();
        let cells = &mut self.screen_mut()[row].cells;
        let n = (n as usize).min(cells.len() - col);
        for _ in 0..n {
            cells.remove(col);
            cells.push(Cell::blank(&attrs));
        }
    }

    /// ECH - blank cells without shifting
    pub fn erase_chars(&mut self, n: u16) {
        let (row, col) = {
            let cursor = self.cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        let attrs = self.attrs.clone();
        let cells = &mut self.screen_mut()[row].cells;
        let end = (col + n as usize).min(cells.len());
        cells[col..end].iter_mut().for_each(|c| c.clear(&attrs));
    }

    /// DECSTBM (1-indexed); invalid regions are ignored
    pub fn set_scroll_region(&mut self, top: u16, bottom: u16) {
        let rows = self.rows;
        let top = top.saturating_sub(1).min(rows - 1);
        let bottom = bottom.saturating_sub(1).min(rows - 1);
        if top < bottom {
            self.scroll_region = (top, bottom);
            self.cursor_position(1, 1);
        }
    }

    pub fn save_cursor(&mut self) {
        let attrs = self.attrs.clone();
        let cursor = self.cursor_mut();
        cursor.saved = Some(SavedCursor {
            row: cursor.row,
            col: cursor.col,
            attrs,
        });
    }

    pub fn restore_cursor(&mut self) {
        let saved = self.cursor().saved.clone();
        if let Some(saved) = saved {
            let (rows, cols) = (self.rows, self.cols);
            let cursor = self.cursor_mut();
            cursor.row = saved.row.min(rows - 1);
            cursor.col = saved.col.min(cols - 1);
            cursor.pending_wrap = false;
            self.attrs = saved.attrs;
        }
    }

    /// DECSET / DECRST
    pub fn set_private_mode(&mut self, mode: u16, enable: bool) {
        match mode {
            1 => self.modes.application_cursor = enable,
            7 => {
                self.modes.auto_wrap = enable;
                if !enable {
                    self.cursor_mut().pending_wrap = false;
                }
            }
            25 => self.cursor_mut().visible = enable,
            47 | 1047 => self.switch_screen(enable),
            1048 => {
                if enable {
                    self.save_cursor();
                } else {
                    self.restore_cursor();
                }
            }
            1049 => {
                if enable {
                    self.save_cursor();
                    self.switch_screen(true);
                    self.alternate_cursor = Cursor::default();
                } else {
                    self.switch_screen(false);
                    self.restore_cursor();
                }
            }
            2004 => self.modes.bracketed_paste = enable,
            _ => debug!(mode, enable, "ignoring private mode"),
        }
    }

    fn switch_screen(&mut self, alternate: bool) {
        if alternate && !self.using_alternate {
            self.alternate = blank_grid(self.rows, self.cols, &CellAttrs::default());
        }
        self.using_alternate = alternate;
    }

    /// RI - cursor up, scrolling down at the region top
    pub fn reverse_index(&mut self) {
        if self.cursor().row == self.scroll_region.0 {
            self.scroll_down(1);
        } else {
            self.cursor_up(1);
        }
    }

    /// RIS - back to power-on state, history included
    pub fn reset(&mut self) {
        let (rows, cols) = (self.rows, self.cols);
        self.primary = blank_grid(rows, cols, &CellAttrs::default());
        self.alternate = blank_grid(rows, cols, &CellAttrs::default());
        self.using_alternate = false;
        self.primary_cursor = Cursor::default();
        self.alternate_cursor = Cursor::default();
        self.attrs = CellAttrs::default();
        self.modes = TerminalModes::default();
        self.scroll_region = (0, rows - 1);
        self.clear_history();
    }
}

fn blank_grid(rows: u16, cols: u16, attrs: &CellAttrs) -> Vec<Line> {
    (0..rows).map(|_| Line::blank(cols, attrs)).collect()
}

/// A single line of cells
#[derive(Clone, Debug, PartialEq)]
pub struct Line {
    pub cells: Vec<Cell>,
    /// Set when the line was continued by autowrap
    pub wrapped: bool,
}

impl Line {
    pub fn blank(cols: u16, attrs: &CellAttrs) -> Self {
        Self {
            cells: vec![Cell::blank(attrs); cols as usize],
            wrapped: false,
        }
    }

    /// Build a plain line from text, padded or cut to `cols`
    pub fn from_text(text: &str, cols: u16) -> Self {
        let mut line = Self::blank(cols, &CellAttrs::default());
        for (cell, ch) in line.cells.iter_mut().zip(text.chars()) {
            cell.grapheme = ch.to_string();
        }
        line
    }

    pub fn resize(&mut self, cols: u16) {
        let cols = cols as usize;
        if cols < self.cells.len() && cols > 0 && self.cells[cols - 1].width == 2 {
            // Wide char cut in half
            self.cells[cols - 1] = Cell::default();
        }
        self.cells.resize(cols, Cell::default());
    }

    pub fn clear(&mut self, attrs: &CellAttrs) {
        for cell in &mut self.cells {
            cell.clear(attrs);
        }
        self.wrapped = false;
    }

    /// Display text with trailing blanks removed
    pub fn text(&self) -> String {
        let mut text = String::with_capacity(self.cells.len());
        for cell in self.cells.iter().filter(|c| !c.is_continuation()) {
            text.push_str(cell.display_str());
        }
        let trimmed = text.trim_end_matches(' ').len();
        text.truncate(trimmed);
        text
    }
}

/// A single cell
#[derive(Clone, Debug, PartialEq)]
pub struct Cell {
    pub grapheme: String,
    pub width: u8,
    pub attrs: CellAttrs,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            grapheme: String::new(),
            width: 1,
            attrs: CellAttrs::default(),
        }
    }
}

impl Cell {
    pub fn blank(attrs: &CellAttrs) -> Self {
        Self {
            attrs: attrs.clone(),
            ..Self::default()
        }
    }

    pub fn clear(&mut self, attrs: &CellAttrs) {
        self.grapheme.clear();
        self.width = 1;
        self.attrs = attrs.clone();
    }

    /// Placeholder for the right half of a wide character
    pub fn continuation(attrs: &CellAttrs) -> Self {
        Self {
            grapheme: String::new(),
            width: 0,
            attrs: attrs.clone(),
        }
    }

    pub fn is_continuation(&self) -> bool {
        self.width == 0
    }

    /// Space for empty cells
    pub fn display_str(&self) -> &str {
        if self.grapheme.is_empty() {
            " "
        } else {
            &self.grapheme
        }
    }
}

/// Cell attributes
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CellAttrs {
    pub fg: Color,
    pub bg: Color,
    pub flags: AttrFlags,
}

impl CellAttrs {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Color definition
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum Color {
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl Color {
    pub fn to_crossterm(self) -> crossterm::style::Color {
        match self {
            Color::Default => crossterm::style::Color::Reset,
            Color::Indexed(n) => crossterm::style::Color::AnsiValue(n),
            Color::Rgb(r, g, b) => crossterm::style::Color::Rgb { r, g, b },
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct AttrFlags: u16 {
        const BOLD          = 0b0000_0000_0001;
        const DIM           = 0b0000_0000_0010;
        const ITALIC        = 0b0000_0000_0100;
        const UNDERLINE     = 0b0000_0000_1000;
        const BLINK         = 0b0000_0001_0000;
        const INVERSE       = 0b0000_0010_0000;
        const HIDDEN        = 0b0000_0100_0000;
        const STRIKETHROUGH = 0b0000_1000_0000;
    }
}

/// Cursor state.
///
/// `pending_wrap` is set after writing the last column; the next printable
/// character wraps first. The position itself never leaves the grid.
#[derive(Clone, Debug)]
pub struct Cursor {
    pub row: u16,
    pub col: u16,
    pub visible: bool,
    pub pending_wrap: bool,
    pub saved: Option<SavedCursor>,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            row: 0,
            col: 0,
            visible: true,
            pending_wrap: false,
            saved: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SavedCursor {
    pub row: u16,
    pub col: u16,
    pub attrs: CellAttrs,
}

/// Terminal modes
#[derive(Clone, Debug)]
pub struct TerminalModes {
    pub application_cursor: bool,
    pub auto_wrap: bool,
    pub insert_mode: bool,
    pub linefeed_newline: bool,
    pub bracketed_paste: bool,
}

impl Default for TerminalModes {
    fn default() -> Self {
        Self {
            application_cursor: false,
            auto_wrap: true,
            insert_mode: false,
            linefeed_newline: false,
            bracketed_paste: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(buf: &mut TerminalBuffer, text: &str) {
        for ch in text.chars() {
            match ch {
                '\n' => {
                    buf.carriage_return();
                    buf.linefeed();
                }
                _ => buf.put_char(ch),
            }
        }
    }

    fn screen_text(buf: &TerminalBuffer) -> Vec<String> {
        buf.screen().iter().map(Line::text).collect()
    }

    #[test]
    fn test_put_char_advances_cursor() {
        let mut buf = TerminalBuffer::new(3, 10, 100);
        write(&mut buf, "abc");
        assert_eq!(buf.cursor().col, 3);
        assert_eq!(screen_text(&buf)[0], "abc");
    }

    #[test]
    fn test_deferred_wrap_keeps_cursor_in_grid() {
        let mut buf = TerminalBuffer::new(3, 4, 100);
        write(&mut buf, "abcd");
        assert_eq!(buf.cursor().col, 3);
        assert!(buf.cursor().pending_wrap);
        assert_eq!(buf.cursor().row, 0);

        buf.put_char('e');
        assert_eq!(buf.cursor().row, 1);
        assert_eq!(buf.cursor().col, 1);
        assert!(buf.screen()[0].wrapped);
        assert_eq!(screen_text(&buf), vec!["abcd", "e", ""]);
    }

    #[test]
    fn test_no_autowrap_overwrites_last_column() {
        let mut buf = TerminalBuffer::new(2, 3, 100);
        buf.set_private_mode(7, false);
        write(&mut buf, "abcdef");
        assert_eq!(screen_text(&buf), vec!["abf", ""]);
        assert_eq!(buf.cursor().row, 0);
    }

    #[test]
    fn test_linefeed_at_bottom_pushes_history() {
        let mut buf = TerminalBuffer::new(2, 10, 100);
        write(&mut buf, "one\ntwo\nthree");
        assert_eq!(buf.history_len(), 1);
        assert_eq!(buf.history()[0].text(), "one");
        assert_eq!(screen_text(&buf), vec!["two", "three"]);
    }

    #[test]
    fn test_scrollback_evicts_oldest_first() {
        let mut buf = TerminalBuffer::new(2, 10, 3);
        for i in 0..5 {
            buf.push_history(Line::from_text(&i.to_string(), 10));
        }
        let kept: Vec<String> = buf.history().iter().map(Line::text).collect();
        assert_eq!(kept, vec!["2", "3", "4"]);
        assert_eq!(buf.history_pushed(), 5);
    }

    #[test]
    fn test_zero_scrollback_keeps_nothing() {
        let mut buf = TerminalBuffer::new(1, 10, 0);
        write(&mut buf, "a\nb\nc");
        assert_eq!(buf.history_len(), 0);
        assert_eq!(buf.history_pushed(), 2);
    }

    #[test]
    fn test_full_clear_moves_screen_to_history() {
        let mut buf = TerminalBuffer::new(3, 10, 100);
        write(&mut buf, "a\nb");
        buf.erase_in_display(2);

        assert_eq!(buf.history_len(), 3);
        assert_eq!(buf.history()[0].text(), "a");
        assert_eq!(buf.history()[1].text(), "b");
        assert!(buf.take_cleared());
        assert!(!buf.take_cleared());
        assert!(screen_text(&buf).iter().all(String::is_empty));
    }

    #[test]
    fn test_erase_below_at_origin_is_a_full_clear() {
        let mut explicit = TerminalBuffer::new(3, 10, 100);
        let mut implicit = TerminalBuffer::new(3, 10, 100);
        for buf in [&mut explicit, &mut implicit] {
            write(buf, "x\ny\nz");
            buf.cursor_position(1, 1);
        }
        explicit.erase_in_display(2);
        implicit.erase_in_display(0);

        let a: Vec<String> = explicit.history().iter().map(Line::text).collect();
        let b: Vec<String> = implicit.history().iter().map(Line::text).collect();
        assert_eq!(a, b);
        assert!(explicit.cleared_pending());
        assert!(implicit.cleared_pending());
    }

    #[test]
    fn test_erase_below_elsewhere_keeps_history() {
        let mut buf = TerminalBuffer::new(3, 10, 100);
        write(&mut buf, "x\ny\nz");
        buf.cursor_position(2, 1);
        buf.erase_in_display(0);

        assert_eq!(buf.history_len(), 0);
        assert!(!buf.cleared_pending());
        assert_eq!(screen_text(&buf), vec!["x", "", ""]);
    }

    #[test]
    fn test_alternate_screen_does_not_feed_history() {
        let mut buf = TerminalBuffer::new(2, 10, 100);
        write(&mut buf, "keep");
        buf.set_private_mode(1049, true);
        write(&mut buf, "a\nb\nc");
        buf.erase_in_display(2);
        assert_eq!(buf.history_len(), 0);
        assert!(!buf.cleared_pending());

        buf.set_private_mode(1049, false);
        assert_eq!(screen_text(&buf)[0], "keep");
        assert_eq!(buf.cursor().col, 4);
    }

    #[test]
    fn test_scroll_region_limits_scrolling() {
        let mut buf = TerminalBuffer::new(4, 10, 100);
        write(&mut buf, "h\n1\n2\nf");
        buf.set_scroll_region(2, 3);
        buf.cursor_position(3, 1);
        buf.linefeed();

        assert_eq!(screen_text(&buf), vec!["h", "2", "", "f"]);
        assert_eq!(buf.history_len(), 0);
    }

    #[test]
    fn test_wide_char_uses_two_cells() {
        let mut buf = TerminalBuffer::new(1, 4, 100);
        buf.put_char('日');
        assert_eq!(buf.cursor().col, 2);
        assert!(buf.screen()[0].cells[1].is_continuation());
        assert_eq!(buf.screen()[0].text(), "日");
    }

    #[test]
    fn test_resize_shrink_keeps_cursor_line() {
        let mut buf = TerminalBuffer::new(4, 10, 100);
        write(&mut buf, "a\nb\nc\nd");
        buf.resize(2, 5);

        assert_eq!(buf.screen().len(), 2);
        assert_eq!(screen_text(&buf), vec!["c", "d"]);
        assert_eq!(buf.history_len(), 2);
        assert_eq!(buf.cursor().row, 1);
        assert!(buf.screen().iter().all(|l| l.cells.len() == 5));
    }

    #[test]
    fn test_resize_grow_pads_lines() {
        let mut buf = TerminalBuffer::new(2, 3, 100);
        buf.resize(4, 6);
        assert_eq!(buf.screen().len(), 4);
        assert!(buf.screen().iter().all(|l| l.cells.len() == 6));
        assert_eq!(buf.scroll_region(), (0, 3));
    }

    #[test]
    fn test_insert_and_delete_chars() {
        let mut buf = TerminalBuffer::new(1, 6, 100);
        write(&mut buf, "abcdef");
        buf.cursor_position(1, 2);
        buf.insert_chars(2);
        assert_eq!(buf.screen()[0].text(), "a  bcd");
        buf.delete_chars(3);
        assert_eq!(buf.screen()[0].text(), "acd");
    }

    #[test]
    fn test_reset_wipes_history() {
        let mut buf = TerminalBuffer::new(1, 6, 100);
        write(&mut buf, "a\nb");
        let epoch = buf.history_epoch();
        buf.reset();
        assert_eq!(buf.history_len(), 0);
        assert_eq!(buf.history_epoch(), epoch + 1);
    }
}
