//! Property-based tests for the stream parser
//!
//! Output arrives in arbitrary chunks, so the parsed result must not depend
//! on where the chunk boundaries fall.

use hopterm::core::term::{StreamParser, TerminalBuffer};
use proptest::prelude::*;

fn snapshot(buf: &TerminalBuffer) -> (Vec<String>, Vec<String>, u16, u16) {
    let cursor = buf.cursor();
    (
        buf.history().iter().map(|l| l.text()).collect(),
        buf.screen().iter().map(|l| l.text()).collect(),
        cursor.row,
        cursor.col,
    )
}

fn terminal_output() -> impl Strategy<Value = Vec<u8>> {
    let piece = prop_oneof![
        4 => "[a-zA-Z0-9 ]{1,10}".prop_map(String::into_bytes),
        2 => Just(b"\r\n".to_vec()),
        1 => Just("日本語".as_bytes().to_vec()),
        1 => Just("héllo".as_bytes().to_vec()),
        1 => (1u8..40, 1u8..40).prop_map(|(r, c)| format!("\x1b[{};{}H", r, c).into_bytes()),
        1 => (30u8..38).prop_map(|c| format!("\x1b[1;{}m", c).into_bytes()),
        1 => Just(b"\x1b[0m".to_vec()),
        1 => Just(b"\x1b[2J".to_vec()),
        1 => Just(b"\x1b[K".to_vec()),
        1 => Just(b"\x1b]0;title\x07".to_vec()),
        1 => Just(b"\x1b[?1049h".to_vec()),
        1 => Just(b"\x1b[?1049l".to_vec()),
        1 => Just(vec![0xE2, 0x28, 0xA1]),
    ];
    prop::collection::vec(piece, 0..40).prop_map(|pieces| pieces.concat())
}

proptest! {
    #[test]
    fn test_parser_doesnt_panic_on_random_bytes(
        data in prop::collection::vec(any::<u8>(), 0..2000),
        rows in 1u16..30,
        cols in 1u16..100,
    ) {
        let mut buf = TerminalBuffer::new(rows, cols, 100);
        let _ = StreamParser::new().feed(&data, &mut buf);
        prop_assert_eq!(buf.screen().len(), rows as usize);
        prop_assert!(buf.cursor().row < rows);
        prop_assert!(buf.cursor().col < cols);
    }

    #[test]
    fn test_chunk_boundaries_do_not_change_result(
        data in terminal_output(),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
    ) {
        let mut whole = TerminalBuffer::new(5, 16, 20);
        StreamParser::new().feed(&data, &mut whole);

        let mut points: Vec<usize> = cuts.iter().map(|i| i.index(data.len() + 1)).collect();
        points.push(0);
        points.push(data.len());
        points.sort_unstable();

        let mut chunked = TerminalBuffer::new(5, 16, 20);
        let mut parser = StreamParser::new();
        for pair in points.windows(2) {
            parser.feed(&data[pair[0]..pair[1]], &mut chunked);
        }

        prop_assert_eq!(snapshot(&chunked), snapshot(&whole));
        prop_assert_eq!(&chunked.title, &whole.title);
    }

    #[test]
    fn test_plain_text_lands_on_screen(text in "[a-z]{1,16}") {
        let mut buf = TerminalBuffer::new(3, 16, 10);
        StreamParser::new().feed(text.as_bytes(), &mut buf);
        prop_assert_eq!(buf.screen()[0].text(), text);
        prop_assert_eq!(buf.history_len(), 0);
    }
}
