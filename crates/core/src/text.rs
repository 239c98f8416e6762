//! Text normalization helpers
//!
//! Exit commands and wake words are matched on a punctuation-stripped form
//! of the transcript; the same normalization decides whether a recognition
//! result is empty.

/// Strip punctuation and surrounding whitespace, returning the character
/// count of what is left together with the filtered text.
pub fn remove_punctuation_and_length(text: &str) -> (usize, String) {
    let filtered: String = text
        .chars()
        .filter(|c| !c.is_ascii_punctuation() && !is_cjk_punctuation(*c) && !c.is_whitespace())
        .collect();
    (filtered.chars().count(), filtered)
}

fn is_cjk_punctuation(c: char) -> bool {
    matches!(c,
        '\u{3000}'..='\u{303F}'   // CJK symbols and punctuation
        | '\u{FF00}'..='\u{FFEF}' // full-width forms
        | '\u{2018}'..='\u{201F}' // curly quotes
        | '\u{2026}'              // ellipsis
    )
}

/// A transcript wrapped as `{"speaker": …, "content": …}` by the speaker
/// identification step. Downstream consumers match intent against
/// `content` while keeping the speaker for LLM context.
pub fn parse_speaker_envelope(text: &str) -> Option<(Option<String>, String)> {
    let trimmed = text.trim();
    if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    let content = value.get("content")?.as_str()?.to_string();
    let speaker = value
        .get("speaker")
        .and_then(|s| s.as_str())
        .map(str::to_owned);
    Some((speaker, content))
}
