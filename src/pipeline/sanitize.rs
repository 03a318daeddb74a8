//! Cleaning of untrusted text before it reaches a prompt or a user.
//!
//! OCR output, user profile fields and third-party snippets all pass through
//! here: invisible Unicode and control characters are stripped, prompt
//! injection phrases are neutralized, HTML is flattened to text.

use std::sync::LazyLock;

use regex::Regex;

/// Sanitized text plus whether anything was changed.
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedText {
    pub text: String,
    pub was_modified: bool,
}

/// Sanitize text that originates outside the pipeline.
pub fn sanitize_untrusted(raw: &str) -> SanitizedText {
    let text = remove_invisible_unicode(raw);
    let text = remove_control_characters(&text);
    let text = remove_injection_patterns(&text);
    let text = text.trim().to_string();
    SanitizedText {
        was_modified: text != raw.trim(),
        text,
    }
}

/// Sanitize a short single-line field (profile entries), capped at `max_chars`.
pub fn sanitize_field(raw: &str, max_chars: usize) -> String {
    let cleaned = sanitize_untrusted(raw).text;
    let single_line = collapse_whitespace(&cleaned);
    truncate_at_word_boundary(&single_line, max_chars)
}

/// Remove zero-width and invisible Unicode characters.
fn remove_invisible_unicode(text: &str) -> String {
    text.chars()
        .filter(|c| {
            !matches!(
                *c,
                '\u{200B}'..='\u{200F}'
                | '\u{202A}'..='\u{202E}'
                | '\u{2060}'..='\u{2064}'
                | '\u{2066}'..='\u{2069}'
                | '\u{FEFF}'
                | '\u{00AD}'
                | '\u{034F}'
                | '\u{061C}'
                | '\u{180E}'
            )
        })
        .collect()
}

/// Remove control characters except newline and tab.
fn remove_control_characters(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Replace known prompt injection patterns with `[FILTERED]`.
fn remove_injection_patterns(text: &str) -> String {
    static INJECTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
        [
            r"(?i)ignore\s+(?:previous|above|all\s+prior|the\s+above)\s+(?:instructions?|rules?|prompts?)",
            r"(?i)forget\s+(?:everything|all|your)\s+(?:previous|prior)?",
            r"(?i)new\s+instructions?:",
            r"(?i)you\s+are\s+now\s+(?:a|an)\s+",
            r"(?i)\bsystem\s*:",
            r"(?i)\bassistant\s*:",
            r"<<SYS>>",
            r"\[INST\]",
            r"<\|im_start\|>",
            r"<\|im_end\|>",
            // Our own response markers must not be forged by the label text.
            r"(?i)\b(?:SUMMARY|WARNINGS|VERDICT)\s*:",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    });

    let mut result = text.to_string();
    for pattern in INJECTION_PATTERNS.iter() {
        result = pattern.replace_all(&result, "[FILTERED]").to_string();
    }
    result
}

/// Collapse all whitespace runs (including newlines) to single spaces.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate to at most `max_chars` characters, cutting at a word boundary when
/// one exists. Never splits a UTF-8 character.
pub fn truncate_at_word_boundary(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut = text
        .char_indices()
        .nth(max_chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    let truncated = &text[..cut];
    match truncated.rfind(char::is_whitespace) {
        Some(pos) if pos > 0 => truncated[..pos].trim_end().to_string(),
        _ => truncated.to_string(),
    }
}

/// Flatten an HTML fragment (search excerpts, abstracts) to plain text.
pub fn strip_html(html: &str) -> String {
    static TAG: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"<[^>]*>").ok());

    let without_tags = match TAG.as_ref() {
        Some(re) => re.replace_all(html, " ").to_string(),
        None => html.to_string(),
    };
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#039;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");
    collapse_whitespace(&decoded)
}
