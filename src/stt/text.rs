//! Transcript text cleanup.
//!
//! Whisper output tends to carry stray whitespace and, on silence or
//! noise, punctuation-only artifacts. Every result passes through
//! `clean_transcript` before it reaches a client.

/// Normalize a raw transcript and decide whether it is worth emitting.
///
/// Cleanup order: collapse runs of internal whitespace to a single space,
/// trim, then reject anything without an alphanumeric character or with at
/// most one character left.
pub fn clean_transcript(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let cleaned = collapsed.trim();

    if cleaned.chars().count() <= 1 {
        return None;
    }
    if !cleaned.chars().any(char::is_alphanumeric) {
        return None;
    }
    Some(cleaned.to_string())
}
