//! Strict parsers for model output.
//!
//! Model text is untrusted. Artifacts are pulled out of `<artifact>` or
//! `<execute_*>` tags or a markdown fence and must then pass the structural
//! check for their kind. Critic replies must decode as exactly one feedback
//! object; there is no fallback to scraping prose.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::domain::{ArtifactKind, Feedback, Verdict};
use crate::sandbox::{MalformedArtifact, check_well_formed};

static ARTIFACT_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<artifact>(.*?)</artifact>").unwrap());

static EXECUTE_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<execute_[a-z]+>(.*?)</execute_[a-z]+>").unwrap());

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\n?(.*?)```").unwrap());

static STRAY_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</?(?:artifact|execute_[a-z]+)>").unwrap());

/// Extract artifact source of the given kind from a model response.
pub fn extract_artifact(response: &str, kind: ArtifactKind) -> Result<String, MalformedArtifact> {
    let text = response.trim();
    if text.is_empty() {
        return Err(MalformedArtifact::new(kind, "model returned an empty response"));
    }

    let mut body = ARTIFACT_TAG_RE
        .captures(text)
        .or_else(|| EXECUTE_TAG_RE.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or(text);

    // Reports may legitimately contain fenced snippets; only unwrap a report
    // that is fenced as a whole.
    let unwrap_fence = match kind {
        ArtifactKind::Text => body.starts_with("```"),
        ArtifactKind::Query | ArtifactKind::Code => true,
    };
    if unwrap_fence && let Some(inner) = FENCE_RE.captures(body).and_then(|c| c.get(1)) {
        body = inner.as_str();
    }

    let source = STRAY_TAG_RE.replace_all(body, "").trim().to_string();
    if source.is_empty() {
        return Err(MalformedArtifact::new(kind, "no artifact found in response"));
    }

    check_well_formed(kind, &source)?;
    Ok(source)
}

/// Wire shape of a critic reply.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CriticReply {
    verdict: Verdict,
    rationale: String,
    #[serde(default)]
    issues: Vec<String>,
}

/// Decode a critic reply into feedback on `artifact_id`.
///
/// The error is the reason the reply breaks the critic contract.
pub fn parse_critique(response: &str, artifact_id: &str) -> Result<Feedback, String> {
    let mut text = response.trim();
    if text.starts_with("```")
        && let Some(inner) = FENCE_RE.captures(text).and_then(|c| c.get(1))
    {
        text = inner.as_str().trim();
    }

    let reply: CriticReply =
        serde_json::from_str(text).map_err(|e| format!("reply is not a feedback object: {}", e))?;

    let issues: Vec<String> = reply
        .issues
        .into_iter()
        .map(|i| i.trim().to_string())
        .filter(|i| !i.is_empty())
        .collect();

    let feedback = match reply.verdict {
        Verdict::Accept => {
            let mut fb = Feedback::accept(artifact_id, reply.rationale.trim());
            fb.issues = issues;
            fb
        }
        Verdict::Revise => Feedback::revise(artifact_id, reply.rationale.trim(), issues),
    };

    if feedback.violates_contract() {
        return Err("revise verdict without a concrete issue".to_string());
    }

    Ok(feedback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_from_artifact_tags() {
        let response = "Here you go:\n<artifact>\nSELECT color FROM sales\n</artifact>\nThanks";
        assert_eq!(
            extract_artifact(response, ArtifactKind::Query).unwrap(),
            "SELECT color FROM sales"
        );
    }

    #[test]
    fn test_extract_from_execute_tags_with_fence() {
        let response = "<execute_python>\n```json\n[{\"op\": \"answer\", \"value\": 1}]\n```\n</execute_python>";
        assert_eq!(
            extract_artifact(response, ArtifactKind::Code).unwrap(),
            r#"[{"op": "answer", "value": 1}]"#
        );
    }

    #[test]
    fn test_extract_from_bare_fence() {
        let response = "```sql\nSELECT 1\n```";
        assert_eq!(extract_artifact(response, ArtifactKind::Query).unwrap(), "SELECT 1");
    }

    #[test]
    fn test_extract_plain_query() {
        assert_eq!(
            extract_artifact("  SELECT 2;  ", ArtifactKind::Query).unwrap(),
            "SELECT 2;"
        );
    }

    #[test]
    fn test_text_keeps_inner_fences() {
        let report = "# Findings\n\nExample:\n```\ncode\n```\nSee https://arxiv.org/abs/1";
        let source = extract_artifact(report, ArtifactKind::Text).unwrap();
        assert!(source.starts_with("# Findings"));
        assert!(source.contains("```\ncode\n```"));
    }

    #[test]
    fn test_extract_rejects_empty() {
        let err = extract_artifact("   ", ArtifactKind::Query).unwrap_err();
        assert_eq!(err.kind, ArtifactKind::Query);

        let err = extract_artifact("<artifact>  </artifact>", ArtifactKind::Text).unwrap_err();
        assert!(err.reason.contains("no artifact"));
    }

    #[test]
    fn test_extract_rejects_malformed_code() {
        let err = extract_artifact("<artifact>import os</artifact>", ArtifactKind::Code).unwrap_err();
        assert_eq!(err.kind, ArtifactKind::Code);
    }

    #[test]
    fn test_extract_rejects_multiple_statements() {
        assert!(extract_artifact("SELECT 1; DROP TABLE sales", ArtifactKind::Query).is_err());
    }

    #[test]
    fn test_parse_accept() {
        let fb = parse_critique(r#"{"verdict": "accept", "rationale": "answers it"}"#, "s-v1").unwrap();
        assert!(fb.is_accept());
        assert_eq!(fb.source_artifact_id, "s-v1");
        assert!(fb.issues.is_empty());
    }

    #[test]
    fn test_parse_revise_in_fence() {
        let reply = "```json\n{\"verdict\": \"revise\", \"rationale\": \"all colors\", \"issues\": [\" must select only the maximum \", \"\"]}\n```";
        let fb = parse_critique(reply, "s-v1").unwrap();
        assert_eq!(fb.verdict, Verdict::Revise);
        assert_eq!(fb.issues, vec!["must select only the maximum"]);
    }

    #[test]
    fn test_parse_revise_without_issues_is_violation() {
        let err = parse_critique(r#"{"verdict": "revise", "rationale": "meh", "issues": []}"#, "s-v1").unwrap_err();
        assert!(err.contains("without a concrete issue"));
    }

    #[test]
    fn test_parse_rejects_prose_and_unknown_fields() {
        assert!(parse_critique("Looks good to me!", "s-v1").is_err());
        assert!(
            parse_critique(r#"{"verdict": "accept", "rationale": "ok", "score": 9}"#, "s-v1").is_err()
        );
        assert!(parse_critique(r#"{"verdict": "maybe", "rationale": "ok"}"#, "s-v1").is_err());
    }
}
