use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref SENTENCE_END: Regex = Regex::new(r#"[.!?…]+["')\]]*\s+"#).unwrap();
}

/// Strips control and zero-width characters and collapses whitespace. Non-ASCII text the
/// engine might choke on is transliterated only when `ascii_only` is set.
pub fn sanitize(text: &str, ascii_only: bool) -> String {
    let stripped: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .filter(|c| !is_invisible(*c))
        .collect();

    let stripped = if ascii_only {
        deunicode::deunicode(&stripped)
    } else {
        stripped
    };

    WHITESPACE.replace_all(stripped.trim(), " ").into_owned()
}

fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'..='\u{200F}' | '\u{2028}'..='\u{202E}' | '\u{2060}'..='\u{2064}' | '\u{FEFF}'
    )
}

/// Cuts `text` to at most `limit` characters, preferring the last word boundary.
pub fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }

    let cut: String = text.chars().take(limit).collect();
    match cut.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => cut[..idx].trim_end().to_string(),
        _ => cut,
    }
}

/// Splits text into sentences, keeping terminal punctuation with each sentence.
pub fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0;
    for m in SENTENCE_END.find_iter(text) {
        let sentence = text[start..m.end()].trim();
        if !sentence.is_empty() {
            out.push(sentence.to_string());
        }
        start = m.end();
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    out
}

/// Leading whole sentences that fit within `limit` characters. Falls back to a
/// word-boundary truncation of the first sentence when even that is too long.
pub fn leading_sentences(text: &str, limit: usize) -> String {
    let mut out = String::new();
    for sentence in sentences(text) {
        let extra = if out.is_empty() { 0 } else { 1 };
        if out.chars().count() + extra + sentence.chars().count() > limit {
            if out.is_empty() {
                return truncate(&sentence, limit);
            }
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&sentence);
    }
    out
}
