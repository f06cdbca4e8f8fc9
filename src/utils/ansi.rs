//! ANSI escape sequence stripping.

use std::sync::LazyLock;

use regex::Regex;

// Matches CSI sequences (colors, cursor movement), OSC sequences
// (window title etc., BEL-terminated) and two-character ESC sequences.
static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\x1B\[[0-9;?]*[ -/]*[@-~]|\x1B\][^\x07]*\x07|\x1B[@-_]",
    )
    .expect("ANSI regex is valid")
});

/// Remove ANSI escape sequences from text.
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}
