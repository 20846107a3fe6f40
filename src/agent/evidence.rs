//! Rendering execution evidence and feedback into prompt text.
//!
//! The critic and refiner judge what an artifact actually did, so the
//! execution result is shown as the model would see a terminal: status,
//! output (tables as markdown), the mutations it made and its trace.

use crate::domain::{Attempt, ExecutionOutput, ExecutionResult, Feedback};

/// Formatter for incorporating execution evidence into prompts.
#[derive(Debug, Clone)]
pub struct EvidenceFormatter {
    /// Maximum number of table rows to show.
    pub max_rows: usize,

    /// Maximum number of trace lines to show.
    pub max_trace_lines: usize,

    /// Maximum number of mutations to list.
    pub max_mutations: usize,

    /// Maximum number of lines of structured output to show.
    pub max_output_lines: usize,
}

impl Default for EvidenceFormatter {
    fn default() -> Self {
        Self {
            max_rows: 50,
            max_trace_lines: 20,
            max_mutations: 20,
            max_output_lines: 60,
        }
    }
}

impl EvidenceFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_rows(mut self, max: usize) -> Self {
        self.max_rows = max;
        self
    }

    /// Format one execution result.
    pub fn format_execution(&self, result: &ExecutionResult) -> String {
        let mut output = String::new();

        output.push_str(&format!(
            "Status: {} ({} ms, {} steps)\n\n",
            result.status, result.duration_ms, result.steps
        ));

        output.push_str("Output:\n");
        match &result.output {
            ExecutionOutput::None => output.push_str("(none)\n"),
            ExecutionOutput::Table(rows) => output.push_str(&rows.to_markdown(self.max_rows)),
            ExecutionOutput::Value(value) => {
                let pretty = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
                output.push_str(&truncate_lines(&pretty, self.max_output_lines));
                output.push('\n');
            }
        }

        if !result.side_effects.is_empty() {
            output.push_str(&format!("\nStore mutations ({}):\n", result.side_effects.len()));
            for mutation in result.side_effects.iter().take(self.max_mutations) {
                output.push_str(&format!("- {}\n", mutation));
            }
            if result.side_effects.len() > self.max_mutations {
                output.push_str(&format!(
                    "- ... and {} more\n",
                    result.side_effects.len() - self.max_mutations
                ));
            }
        }

        if !result.trace.trim().is_empty() {
            output.push_str("\nTrace:\n");
            output.push_str(&indent_text(&truncate_lines(&result.trace, self.max_trace_lines), "  "));
            output.push('\n');
        }

        output
    }

    /// Format feedback as a list of issues to fix.
    pub fn format_feedback(&self, feedback: &Feedback) -> String {
        let mut output = String::new();
        output.push_str(&format!("Verdict: {}\n", feedback.verdict));
        if !feedback.rationale.is_empty() {
            output.push_str(&format!("Rationale: {}\n", feedback.rationale));
        }
        if !feedback.issues.is_empty() {
            output.push_str("Issues:\n");
            for (i, issue) in feedback.issues.iter().enumerate() {
                output.push_str(&format!("{}. {}\n", i + 1, issue));
            }
        }
        output
    }

    /// Summarise earlier attempts, most recent last.
    pub fn format_history(&self, attempts: &[Attempt]) -> String {
        if attempts.is_empty() {
            return String::new();
        }

        let mut output = String::new();
        output.push_str("## Previous Attempts\n\n");
        for attempt in attempts {
            let verdict = attempt
                .feedback
                .as_ref()
                .map(|f| f.verdict.to_string())
                .unwrap_or_else(|| "not reviewed".to_string());
            output.push_str(&format!(
                "- v{}: {} → {}\n",
                attempt.artifact.version, attempt.execution.status, verdict
            ));
            if let Some(feedback) = &attempt.feedback {
                for issue in &feedback.issues {
                    output.push_str(&format!("  - {}\n", issue));
                }
            }
        }
        output
    }
}

/// Truncate text to a maximum number of lines.
pub fn truncate_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().take(max_lines).collect();
    let truncated = lines.len() < text.lines().count();
    let mut result = lines.join("\n");
    if truncated {
        result.push_str("\n... (truncated)");
    }
    result
}

/// Indent all lines of text by a prefix.
pub fn indent_text(text: &str, prefix: &str) -> String {
    text.lines()
        .map(|line| format!("{}{}", prefix, line))
        .collect::<Vec<_>>()
        .join("\n")
}
