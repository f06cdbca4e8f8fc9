//! Terminal screen reconstruction from raw pipe-pane streams.
//!
//! Captured pane text loses anything that scrolled past the capture
//! window. The raw pipe-pane log keeps every byte, but it is full of
//! cursor movement and screen clears; feeding it through a virtual
//! terminal recovers what a human actually saw, scrollback included.

use std::path::Path;

use crate::utils::ansi::strip_ansi;

const SCREEN_COLS: usize = 220;
const SCREEN_ROWS: usize = 50;

/// Lines of scrollback retained while replaying the stream. Deep enough
/// that a full agent run survives screen clears.
const SCROLLBACK_LIMIT: usize = 100_000;

/// Render a raw terminal byte stream into clean text lines.
///
/// Returns the scrollback history followed by the final screen content
/// after feeding the whole stream. Empty lines are dropped. If `tail`
/// is set, only the last N lines are returned.
pub fn render_raw_stream(raw: &str, tail: Option<usize>) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let mut vt = avt::Vt::builder()
        .size(SCREEN_COLS, SCREEN_ROWS)
        .scrollback_limit(SCROLLBACK_LIMIT)
        .build();
    let _ = vt.feed_str(raw);

    // The full buffer: lines that scrolled off the top plus the live
    // screen, in order.
    let mut lines: Vec<String> = vt
        .text()
        .into_iter()
        .map(|line| line.trim_end().to_string())
        .filter(|line| !line.is_empty())
        .collect();

    if let Some(n) = tail {
        if lines.len() > n {
            lines = lines.split_off(lines.len() - n);
        }
    }

    lines.join("\n")
}

/// Render a raw pipe-pane log file. Missing or unreadable files render
/// as empty; undecodable bytes are replaced rather than failing.
pub fn render_raw_log(path: &Path, tail: Option<usize>) -> String {
    let Ok(bytes) = std::fs::read(path) else {
        return String::new();
    };
    let raw = String::from_utf8_lossy(&bytes);
    let rendered = render_raw_stream(&raw, tail);
    if rendered.is_empty() && !raw.is_empty() {
        // Defense against streams the emulator cannot make sense of.
        return strip_ansi(&raw);
    }
    rendered
}
