//! Terminal-safe rendering of subprocess output.
//!
//! `make`, `patch` and `dpkg-deb` happily print colour codes, carriage-return
//! progress updates and the odd OSC title sequence. Lines are cleaned before
//! they reach a sink or an error log.

use std::sync::LazyLock;

use regex::Regex;

const MAX_LOG_CHARS: usize = 4096;

// CSI (`ESC [ ... final`), OSC (`ESC ] ... BEL|ST`), DCS/SOS/PM/APC (`ESC P|X|^|_ ... ST`)
// and lone two-byte escapes.
static ESCAPES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?|\x1b[PX^_][^\x1b]*(?:\x1b\\)?|\x1b[@-Z\\-_]?",
    )
    .expect("escape sequence regex")
});

pub fn sanitize_log_line(input: &str) -> String {
    let stripped = ESCAPES.replace_all(input, "");

    let mut out = String::with_capacity(stripped.len().min(MAX_LOG_CHARS));
    let mut kept = 0usize;
    for c in stripped.chars() {
        let c = match c {
            '\t' => ' ',
            '\r' | '\n' => continue,
            c if c.is_control() || is_bidi_control(c) => continue,
            c => c,
        };
        if kept == MAX_LOG_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
        out.push(c);
        kept += 1;
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}')
}
