//! Evaluation of `text` artifacts (reports, summaries).
//!
//! Text needs no capabilities: executing it measures the text and extracts
//! the sources it cites, which is what the critic and validators inspect.

use std::sync::LazyLock;

use serde_json::{Value, json};

use super::fault::MalformedArtifact;
use crate::domain::ArtifactKind;

static URL_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r#"https?://[^\s<>"'\)\]\}]+"#).unwrap());

/// Reject empty reports.
pub fn check(source: &str) -> Result<(), MalformedArtifact> {
    if source.trim().is_empty() {
        Err(MalformedArtifact::new(ArtifactKind::Text, "report is empty"))
    } else {
        Ok(())
    }
}

/// Cited URLs in order of first appearance, trailing punctuation stripped.
pub fn extract_sources(text: &str) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for m in URL_RE.find_iter(text) {
        let url = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']);
        if !sources.iter().any(|s| s == url) {
            sources.push(url.to_string());
        }
    }
    sources
}

/// Output of a text artifact: `{text, word_count, sources}`.
pub fn evaluate(source: &str) -> Value {
    let text = source.trim();
    json!({
        "text": text,
        "word_count": text.split_whitespace().count(),
        "sources": extract_sources(text),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_sources() {
        let text = "See https://arxiv.org/abs/2401.00001. Also (https://example.com/post) and \
                    https://arxiv.org/abs/2401.00001 again, plus http://blog.test/x?y=1;";
        assert_eq!(
            extract_sources(text),
            vec![
                "https://arxiv.org/abs/2401.00001",
                "https://example.com/post",
                "http://blog.test/x?y=1",
            ]
        );
    }

    #[test]
    fn test_evaluate() {
        let output = evaluate("  Solar adoption grew 20% (https://iea.org/report).  ");
        assert_eq!(output["word_count"], json!(5));
        assert_eq!(output["sources"], json!(["https://iea.org/report"]));
        assert_eq!(output["text"], json!("Solar adoption grew 20% (https://iea.org/report)."));
    }

    #[test]
    fn test_empty_report_is_malformed() {
        assert!(check(" \n ").is_err());
        assert!(check("ok").is_ok());
    }
}
