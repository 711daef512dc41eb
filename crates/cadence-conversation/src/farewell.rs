//! Detection of utterances that close the conversation.

const FAREWELL_WORDS: &[&str] = &["goodbye", "bye", "farewell", "byebye"];
const FAREWELL_PHRASES: &[&str] = &["good bye", "see you", "see ya", "talk to you later"];

/// Whether `text` contains a farewell such as "goodbye" or "see you".
pub fn is_farewell(text: &str) -> bool {
    let normalized: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();

    if normalized
        .split_whitespace()
        .any(|word| FAREWELL_WORDS.contains(&word))
    {
        return true;
    }

    let collapsed = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
    let padded = format!(" {} ", collapsed);
    FAREWELL_PHRASES
        .iter()
        .any(|phrase| padded.contains(&format!(" {} ", phrase)))
}
