//! UTF-8-safe truncation helpers shared by previews and operation messages.
//!
//! Byte slicing can panic when the cut falls inside a multi-byte character,
//! so everything here counts characters.

/// Truncate by characters and append `suffix` when truncation occurs.
pub fn truncate_with_suffix_by_chars(text: &str, max_chars: usize, suffix: &str) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}{suffix}", &text[..cut]),
    }
}

/// Collapse newlines and truncate, for one-line status and event previews.
pub fn single_line_preview(text: &str, max_chars: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    truncate_with_suffix_by_chars(flat.trim(), max_chars, "...")
}
