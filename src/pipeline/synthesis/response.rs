//! Parsing of the model's sectioned answer.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::Suitability;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    /// Summary with evidence markers removed.
    pub summary: String,
    pub warnings: Vec<String>,
    pub verdict: Suitability,
    /// Evidence labels referenced anywhere in the answer, ascending, unique.
    pub cited_labels: Vec<usize>,
}

/// Why a response could not be used.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseIssue {
    Refusal,
    Malformed(String),
}

static SECTION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?mi)^[\s#*]*(SUMMARY|WARNINGS|VERDICT)[\s*]*:[ \t*]*").ok());

static MARKER_GROUP: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\[\s*(E\d+(?:\s*,\s*E\d+)*)\s*\]").ok());

/// A marker together with the horizontal space around it.
static MARKER_SPAN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[ \t]*\[\s*E\d+(?:\s*,\s*E\d+)*\s*\][ \t]*").ok());

static MARKER_NUMBER: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"E(\d+)").ok());

static REFUSAL: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:I\s+(?:can(?:['’]|no)?t|cannot|won't|am\s+(?:not\s+able|unable))\s+(?:help|assist|provide|comply|do\s+that)|as\s+an\s+ai\b)",
    )
    .ok()
});

/// Split the raw answer into its labelled sections.
fn sections(raw: &str) -> Vec<(String, String)> {
    let Some(re) = SECTION.as_ref() else {
        return Vec::new();
    };
    let headers: Vec<(usize, usize, String)> = re
        .captures_iter(raw)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            let name = cap.get(1)?.as_str().to_uppercase();
            Some((whole.start(), whole.end(), name))
        })
        .collect();

    headers
        .iter()
        .enumerate()
        .map(|(i, (_, body_start, name))| {
            let body_end = headers.get(i + 1).map(|h| h.0).unwrap_or(raw.len());
            (name.clone(), raw[*body_start..body_end].trim().to_string())
        })
        .collect()
}

pub fn cited_labels(raw: &str) -> Vec<usize> {
    let (Some(group), Some(number)) = (MARKER_GROUP.as_ref(), MARKER_NUMBER.as_ref()) else {
        return Vec::new();
    };
    let mut labels: Vec<usize> = group
        .captures_iter(raw)
        .filter_map(|cap| cap.get(1))
        .flat_map(|inner| {
            number
                .captures_iter(inner.as_str())
                .filter_map(|c| c.get(1)?.as_str().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .collect();
    labels.sort_unstable();
    labels.dedup();
    labels
}

/// Remove `[E<n>]` markers. Only the spacing at a removed marker changes:
/// it becomes one space between words, or none before punctuation and at
/// line edges.
pub fn strip_markers(text: &str) -> String {
    let Some(re) = MARKER_SPAN.as_ref() else {
        return text.trim().to_string();
    };
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in re.find_iter(text) {
        out.push_str(&text[last..m.start()]);
        let rest = &text[m.end()..];
        let joins_words = !out.is_empty()
            && !out.ends_with(char::is_whitespace)
            && rest
                .chars()
                .next()
                .is_some_and(|c| !c.is_whitespace() && !matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | ')'));
        if joins_words {
            out.push(' ');
        }
        last = m.end();
    }
    out.push_str(&text[last..]);
    out.trim().to_string()
}

/// Drop a leading `1.` or `2)` list number.
fn strip_numbering(line: &str) -> &str {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(stripped) = rest.strip_prefix(['.', ')']) {
            return stripped.trim_start();
        }
    }
    line
}

fn parse_warnings(body: &str) -> Vec<String> {
    body.lines()
        .map(|line| {
            let line = line.trim().trim_start_matches(['-', '*', '•']).trim();
            strip_numbering(line)
        })
        .filter(|line| !line.is_empty())
        .filter(|line| {
            let lower = line.trim_end_matches('.').to_lowercase();
            !matches!(lower.as_str(), "none" | "n/a" | "no warnings")
        })
        .map(strip_markers)
        .filter(|w| !w.is_empty())
        .collect()
}

fn parse_verdict(body: &str) -> Suitability {
    let first_line = body.lines().next().unwrap_or("").trim();
    let first_token = first_line.split_whitespace().next().unwrap_or("");
    match Suitability::parse(first_token) {
        Suitability::Unknown => {
            let lower = first_line.to_lowercase();
            if lower.contains("not suitable") || lower.contains("unsuitable") {
                Suitability::NotSuitable
            } else if lower.contains("moderately") {
                Suitability::ModeratelySuitable
            } else if lower.contains("suitable") {
                Suitability::Suitable
            } else {
                Suitability::Unknown
            }
        }
        verdict => verdict,
    }
}

pub fn is_refusal(raw: &str) -> bool {
    REFUSAL.as_ref().is_some_and(|re| re.is_match(raw))
}

pub fn parse_response(raw: &str) -> Result<ParsedResponse, ResponseIssue> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ResponseIssue::Malformed("empty response".into()));
    }

    let parts = sections(raw);
    let find = |name: &str| parts.iter().find(|(n, _)| n == name).map(|(_, b)| b.as_str());

    let summary = find("SUMMARY").map(strip_markers).unwrap_or_default();
    if summary.is_empty() {
        if is_refusal(raw) {
            return Err(ResponseIssue::Refusal);
        }
        return Err(ResponseIssue::Malformed("missing SUMMARY section".into()));
    }

    Ok(ParsedResponse {
        summary,
        warnings: find("WARNINGS").map(parse_warnings).unwrap_or_default(),
        verdict: find("VERDICT").map(parse_verdict).unwrap_or(Suitability::Unknown),
        cited_labels: cited_labels(raw),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_FORMED: &str = "SUMMARY: This cereal is high in added sugar [E1] but a good fiber source [E2, E3].\n\
WARNINGS:\n\
- Contains wheat, which conflicts with your gluten allergy [E2].\n\
- High sugar for someone managing type 2 diabetes.\n\
VERDICT: MS (moderately suitable)";

    #[test]
    fn parses_all_sections() {
        let parsed = parse_response(WELL_FORMED).unwrap();
        assert_eq!(
            parsed.summary,
            "This cereal is high in added sugar but a good fiber source."
        );
        assert_eq!(parsed.warnings.len(), 2);
        assert_eq!(
            parsed.warnings[0],
            "Contains wheat, which conflicts with your gluten allergy."
        );
        assert_eq!(parsed.verdict, Suitability::ModeratelySuitable);
        assert_eq!(parsed.cited_labels, vec![1, 2, 3]);
    }

    #[test]
    fn none_warnings_are_empty() {
        let parsed = parse_response("SUMMARY: Fine.\nWARNINGS:\n- none\nVERDICT: S").unwrap();
        assert!(parsed.warnings.is_empty());
        assert_eq!(parsed.verdict, Suitability::Suitable);
    }

    #[test]
    fn markdown_headers_tolerated() {
        let parsed = parse_response("**SUMMARY:** Mostly whole grain.\n**VERDICT:** NS").unwrap();
        assert_eq!(parsed.summary, "Mostly whole grain.");
        assert_eq!(parsed.verdict, Suitability::NotSuitable);
    }

    #[test]
    fn missing_verdict_is_unknown() {
        let parsed = parse_response("SUMMARY: Contains sugar.").unwrap();
        assert_eq!(parsed.verdict, Suitability::Unknown);
        assert!(parsed.cited_labels.is_empty());
    }

    #[test]
    fn refusal_detected() {
        assert_eq!(
            parse_response("I'm sorry, but I can't help with medical questions."),
            Err(ResponseIssue::Refusal)
        );
    }

    #[test]
    fn unstructured_text_is_malformed() {
        assert!(matches!(
            parse_response("This product looks okay to me."),
            Err(ResponseIssue::Malformed(_))
        ));
        assert!(matches!(parse_response("   "), Err(ResponseIssue::Malformed(_))));
        assert!(matches!(
            parse_response("SUMMARY:\nWARNINGS:\n- none"),
            Err(ResponseIssue::Malformed(_))
        ));
    }

    #[test]
    fn strip_markers_tidies_spacing() {
        assert_eq!(strip_markers("Sugar [E1] is high [E2] ."), "Sugar is high.");
        assert_eq!(strip_markers("[E1] Oats are whole grain."), "Oats are whole grain.");
    }

    #[test]
    fn strip_markers_leaves_unmarked_text_alone() {
        assert_eq!(strip_markers("Contains 0 .5 g salt , per serving"), "Contains 0 .5 g salt , per serving");
        assert_eq!(
            strip_markers("Contains 0 .5 g salt [E1], per serving [E2]."),
            "Contains 0 .5 g salt, per serving."
        );
    }

    #[test]
    fn numbered_warnings_keep_leading_quantities() {
        let warnings = parse_warnings("1. High sodium.\n2) 2 servings exceed the daily sugar limit.");
        assert_eq!(warnings, vec!["High sodium.", "2 servings exceed the daily sugar limit."]);
    }

    #[test]
    fn verdict_words_parse() {
        assert_eq!(parse_verdict("Not suitable for you."), Suitability::NotSuitable);
        assert_eq!(parse_verdict("moderately suitable"), Suitability::ModeratelySuitable);
    }
}
