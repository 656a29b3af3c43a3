//! Terminal renderer using crossterm
//!
//! Draws the scroll view to the console. Lines belonging to the live screen
//! are drawn from buffer cells with their attributes; history lines are
//! drawn from the view's text.

use std::io::{self, Write};

use crossterm::{
    cursor::{Hide, MoveTo, Show},
    queue,
    style::{Attribute, Print, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor},
    terminal::{
        self, Clear, ClearType, DisableLineWrap, EnableLineWrap, EnterAlternateScreen,
        LeaveAlternateScreen, SetTitle,
    },
};
use unicode_width::UnicodeWidthStr;

use super::view::ScrollView;
use crate::core::term::{AttrFlags, CellAttrs, Line, TerminalBuffer};

const SYNC_BEGIN: &str = "\x1b[?2026h";
const SYNC_END: &str = "\x1b[?2026l";

pub struct Renderer {
    initialized: bool,
    title: String,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        Self {
            initialized: false,
            title: String::new(),
        }
    }

    /// Enter raw mode and the alternate screen
    pub fn init(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;
        let mut stdout = io::stdout();
        queue!(
            stdout,
            EnterAlternateScreen,
            crossterm::event::EnableBracketedPaste,
            DisableLineWrap,
            Clear(ClearType::All),
            MoveTo(0, 0)
        )?;
        stdout.flush()?;
        self.initialized = true;
        Ok(())
    }

    pub fn cleanup(&mut self) -> io::Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;

        let mut stdout = io::stdout();
        let _ = queue!(
            stdout,
            ResetColor,
            SetAttribute(Attribute::Reset),
            Show,
            EnableLineWrap,
            crossterm::event::DisableBracketedPaste,
            LeaveAlternateScreen
        );
        let _ = stdout.flush();
        terminal::disable_raw_mode()
    }

    /// Draw one frame
    pub fn render(&mut self, view: &ScrollView, buf: &TerminalBuffer) -> io::Result<()> {
        let stdout = io::stdout();
        let mut out = io::BufWriter::with_capacity(65536, stdout.lock());
        self.draw(&mut out, view, buf)?;
        out.flush()
    }

    pub fn draw<W: Write>(
        &mut self,
        out: &mut W,
        view: &ScrollView,
        buf: &TerminalBuffer,
    ) -> io::Result<()> {
        write!(out, "{}", SYNC_BEGIN)?;
        queue!(out, Hide)?;

        if buf.title != self.title {
            self.title.clone_from(&buf.title);
            queue!(out, SetTitle(&self.title))?;
        }

        let history_len = buf.history_len();
        let range = view.visible_range();
        let cols = buf.cols();

        for row in 0..view.height() {
            queue!(out, MoveTo(0, row as u16), Clear(ClearType::UntilNewLine))?;
            let line = range.start + row;
            if line >= range.end {
                continue;
            }
            match line.checked_sub(history_len).and_then(|i| buf.screen().get(i)) {
                Some(screen_line) => draw_cells(out, screen_line, cols)?,
                None => {
                    if let Some(text) = view.lines().get(line) {
                        queue!(out, Print(clip(text, cols)))?;
                    }
                }
            }
        }

        if !view.is_live() {
            let indicator = format!("[↑ {} lines]", view.offset());
            let col = cols.saturating_sub(indicator.width() as u16);
            queue!(
                out,
                MoveTo(col, 0),
                SetAttribute(Attribute::Reverse),
                Print(indicator),
                SetAttribute(Attribute::Reset)
            )?;
        }

        if let (Some(row), Some(cursor)) = (view.cursor_row(), view.cursor()) {
            queue!(out, MoveTo(cursor.col, row), Show)?;
        }

        write!(out, "{}", SYNC_END)?;
        Ok(())
    }

    pub fn size() -> io::Result<(u16, u16)> {
        terminal::size()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

/// Draw a screen line, batching runs of equal attributes
fn draw_cells<W: Write>(out: &mut W, line: &Line, cols: u16) -> io::Result<()> {
    let mut run = String::with_capacity(256);
    let mut run_attrs = CellAttrs::default();
    let mut col: u16 = 0;

    for cell in &line.cells {
        if col >= cols {
            break;
        }
        if cell.is_continuation() {
            col += 1;
            continue;
        }
        if cell.attrs != run_attrs {
            if !run.is_empty() {
                apply_attrs(out, &run_attrs)?;
                queue!(out, Print(&run))?;
                run.clear();
            }
            run_attrs = cell.attrs.clone();
        }
        run.push_str(cell.display_str());
        col += cell.width.max(1) as u16;
    }

    if !run.is_empty() {
        apply_attrs(out, &run_attrs)?;
        queue!(out, Print(&run))?;
    }
    queue!(out, ResetColor, SetAttribute(Attribute::Reset))
}

fn apply_attrs<W: Write>(out: &mut W, attrs: &CellAttrs) -> io::Result<()> {
    queue!(out, SetAttribute(Attribute::Reset))?;

    let styles = [
        (AttrFlags::BOLD, Attribute::Bold),
        (AttrFlags::DIM, Attribute::Dim),
        (AttrFlags::ITALIC, Attribute::Italic),
        (AttrFlags::UNDERLINE, Attribute::Underlined),
        (AttrFlags::BLINK, Attribute::SlowBlink),
        (AttrFlags::INVERSE, Attribute::Reverse),
        (AttrFlags::HIDDEN, Attribute::Hidden),
        (AttrFlags::STRIKETHROUGH, Attribute::CrossedOut),
    ];
    for (flag, attribute) in styles {
        if attrs.flags.contains(flag) {
            queue!(out, SetAttribute(attribute))?;
        }
    }

    queue!(
        out,
        SetForegroundColor(attrs.fg.to_crossterm()),
        SetBackgroundColor(attrs.bg.to_crossterm())
    )
}

/// Longest prefix of `text` fitting in `cols` columns
fn clip(text: &str, cols: u16) -> &str {
    let mut width = 0;
    for (i, ch) in text.char_indices() {
        width += unicode_width::UnicodeWidthChar::width(ch).unwrap_or(0);
        if width > cols as usize {
            return &text[..i];
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::render::{RenderDiffEngine, RenderSink};
    use crate::core::term::StreamParser;

    fn frame(input: &[u8], scroll_up: usize) -> String {
        let mut buf = TerminalBuffer::new(2, 20, 100);
        StreamParser::new().feed(input, &mut buf);
        let mut view = ScrollView::new(2);
        view.apply(&RenderDiffEngine::new().refresh(&mut buf));
        view.scroll_up(scroll_up);

        let mut out = Vec::new();
        Renderer::new().draw(&mut out, &view, &buf).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_frame_is_synchronized_and_shows_screen() {
        let out = frame(b"one\r\ntwo\r\nthree", 0);
        assert!(out.starts_with(SYNC_BEGIN));
        assert!(out.ends_with(SYNC_END));
        assert!(out.contains("two"));
        assert!(out.contains("three"));
        assert!(!out.contains("one"));
        assert!(!out.contains("lines]"));
    }

    #[test]
    fn test_scrolled_frame_draws_history_and_indicator() {
        let out = frame(b"one\r\ntwo\r\nthree", 1);
        assert!(out.contains("one"));
        assert!(out.contains("[↑ 1 lines]"));
    }

    #[test]
    fn test_clip_respects_wide_characters() {
        assert_eq!(clip("abc", 2), "ab");
        assert_eq!(clip("日本語", 5), "日本");
        assert_eq!(clip("ok", 10), "ok");
    }
}
