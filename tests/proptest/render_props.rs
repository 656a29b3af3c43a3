//! Property-based tests for the render diff engine
//!
//! A view that only ever applies patches must hold the same document as a
//! full rebuild from the buffer, whatever the output looked like.

use hopterm::core::render::{RenderDiffEngine, RenderPatch, RenderSink, RenderUpdate};
use hopterm::core::term::{StreamParser, TerminalBuffer};
use proptest::prelude::*;

#[derive(Default)]
struct Doc(Vec<String>);

impl RenderSink for Doc {
    fn apply(&mut self, patch: &RenderPatch) {
        match &patch.update {
            RenderUpdate::Full { lines, .. } => self.0 = lines.clone(),
            RenderUpdate::Incremental {
                evicted,
                history_start,
                new_history,
                screen,
            } => {
                let evicted = (*evicted).min(self.0.len());
                self.0.drain(..evicted);
                self.0.truncate(*history_start);
                self.0.extend(new_history.iter().cloned());
                self.0.extend(screen.iter().cloned());
            }
        }
    }
}

#[derive(Clone, Debug)]
enum Step {
    Output(String),
    Resize(u16, u16),
    Refresh,
}

fn output() -> impl Strategy<Value = String> {
    prop_oneof![
        4 => "[a-z ]{0,12}",
        3 => Just("\r\n".to_string()),
        1 => Just("\x1b[2J".to_string()),
        1 => Just("\x1b[H\x1b[J".to_string()),
        1 => Just("\x1b[3J".to_string()),
        1 => Just("\x1b[?1049h".to_string()),
        1 => Just("\x1b[?1049l".to_string()),
        1 => Just("\x1b[2;3r".to_string()),
        1 => Just("\x1b[r".to_string()),
        1 => Just("\x1bM".to_string()),
        1 => Just("\x1b[2S".to_string()),
        1 => Just("\x1bc".to_string()),
    ]
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        6 => output().prop_map(Step::Output),
        1 => (1u16..6, 4u16..20).prop_map(|(rows, cols)| Step::Resize(rows, cols)),
        3 => Just(Step::Refresh),
    ]
}

proptest! {
    #[test]
    fn test_patched_view_matches_full_document(
        steps in prop::collection::vec(step(), 0..60),
        scrollback in 0usize..8,
    ) {
        let mut buf = TerminalBuffer::new(4, 12, scrollback);
        let mut parser = StreamParser::new();
        let mut engine = RenderDiffEngine::new();
        let mut doc = Doc::default();

        for step in steps {
            match step {
                Step::Output(text) => {
                    parser.feed(text.as_bytes(), &mut buf);
                }
                Step::Resize(rows, cols) => buf.resize(rows, cols),
                Step::Refresh => {
                    doc.apply(&engine.refresh(&mut buf));
                    prop_assert_eq!(&doc.0, &RenderDiffEngine::document(&buf));
                }
            }
        }

        doc.apply(&engine.refresh(&mut buf));
        prop_assert_eq!(&doc.0, &RenderDiffEngine::document(&buf));
    }

    #[test]
    fn test_cursor_line_points_into_screen(
        text in "[a-z\r\n]{0,200}",
    ) {
        let mut buf = TerminalBuffer::new(3, 10, 50);
        StreamParser::new().feed(text.as_bytes(), &mut buf);
        let patch = RenderDiffEngine::new().refresh(&mut buf);

        prop_assert!(patch.cursor.line >= buf.history_len());
        prop_assert!(patch.cursor.line < buf.history_len() + buf.rows() as usize);
    }

    #[test]
    fn test_scrollback_keeps_newest_lines(
        limit in 1usize..20,
        extra in 0usize..30,
    ) {
        let rows = 2u16;
        let count = limit + extra + rows as usize;
        let mut buf = TerminalBuffer::new(rows, 20, limit);
        let mut parser = StreamParser::new();
        for i in 0..count {
            parser.feed(format!("line{}\r\n", i).as_bytes(), &mut buf);
        }

        // The final newline leaves the cursor on a blank row, so the last
        // line printed is still on screen and the one before it is the
        // newest history entry.
        let scrolled = count - 1;
        prop_assert_eq!(buf.history_len(), limit);
        let history: Vec<String> = buf.history().iter().map(|l| l.text()).collect();
        let expected: Vec<String> = (scrolled - limit..scrolled)
            .map(|i| format!("line{}", i))
            .collect();
        prop_assert_eq!(history, expected);
    }
}
