//! Prompt text for the generator, refiner and critic.

use crate::domain::ArtifactKind;
use crate::sandbox::{PURE_FUNCTIONS, STORE_FUNCTIONS};

/// Reference for the policy-program language, shown to code generators.
pub fn policy_language() -> String {
    format!(
        r#"Policy programs are a JSON array of operations, run in order:
- {{"op": "read", "table": T, "where": [COND...], "into": NAME}}    bind matching rows (objects) to NAME
- {{"op": "insert", "table": T, "values": {{COL: EXPR}}, "into": NAME?}}
- {{"op": "update", "table": T, "where": [COND...], "set": {{COL: EXPR}}}}    `row` is bound to each matching row
- {{"op": "delete", "table": T, "where": [COND...]}}
- {{"op": "let", "name": NAME, "value": EXPR}}
- {{"op": "if", "cond": EXPR, "then": [OP...], "else": [OP...]}}
- {{"op": "for_each", "var": NAME, "in": EXPR, "body": [OP...]}}
- {{"op": "assert", "cond": EXPR, "message": TEXT}}    fail the run unless cond holds
- {{"op": "emit", "value": EXPR}}    append to the output log
- {{"op": "answer", "value": EXPR}}    set the answer and stop
- {{"op": "fail", "message": TEXT}}    abort; nothing is written
COND is {{"column": COL, "cmp": "eq|ne|lt|lte|gt|gte|like", "value": EXPR}} (cmp defaults to eq).
EXPR is a JSON scalar, {{"var": "name.path.0"}}, {{"call": FN, "args": [EXPR...]}}, {{"lit": ANY}} or an array of EXPR.
Functions: {}.
Store helpers ({}) need read access: next_id(table, prefix) -> "PREFIX-0001", last(table, column) -> value in the newest row.
No other functions exist. There is no filesystem, network or environment access.
A failed run is rolled back completely, so validate stock and inputs before mutating."#,
        PURE_FUNCTIONS.join(", "),
        STORE_FUNCTIONS.join(", "),
    )
}

/// System prompt for producing an artifact of `kind`.
pub fn generator_system(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::Query => "You are a SQL assistant. You write a single correct SQLite statement for the user's question.",
        ArtifactKind::Code => {
            "You are a senior data assistant. You plan by writing policy programs that read and update the store safely."
        }
        ArtifactKind::Text => {
            "You are a research assistant that writes detailed, accurate and properly sourced research reports. \
             Cite sources with full URLs. Use an academic tone and clearly labelled sections. \
             Do not include placeholder text such as '(citation needed)'."
        }
    }
}

/// Output contract appended to generator and refiner prompts.
pub fn output_contract(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::Query => "Return ONLY the SQL statement between <artifact> and </artifact> tags.",
        ArtifactKind::Code => "Return ONLY the JSON program between <artifact> and </artifact> tags.",
        ArtifactKind::Text => "Return ONLY the report between <artifact> and </artifact> tags.",
    }
}

/// Kind-specific guidance for writing the artifact.
pub fn kind_rules(kind: ArtifactKind) -> String {
    match kind {
        ArtifactKind::Query => "Write one statement for SQLite. Use only the tables and columns in the schema.".to_string(),
        ArtifactKind::Code => format!(
            "{}\n\nPlanning rules:\n\
             - Derive every filter and quantity from the request; do not hard-code values it does not mention.\n\
             - Only mutate when the request clearly asks to change state (buy, return, restock, adjust).\n\
             - Record one transaction row per purchased item, updating the running balance.\n\
             - If any item lacks stock, mutate nothing and answer with the available quantity.\n\
             - Always finish with an `answer` holding a short customer-facing sentence.",
            policy_language()
        ),
        ArtifactKind::Text => "Organise the report into sections and cite every claim with a full URL.".to_string(),
    }
}

/// What the critic should check for `kind`.
pub fn critic_rubric(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::Query => {
            "Judge whether the SQL OUTPUT shown fully answers the question. \
             Consider missing filters, wrong grouping, ordering or limits, and whether extra rows are returned."
        }
        ArtifactKind::Code => {
            "Judge whether the execution did what the request asked: the right rows were read or changed, \
             nothing was changed that should not have been, and the answer is a correct customer-facing sentence. \
             A failed execution always needs revision."
        }
        ArtifactKind::Text => {
            "Review the report as an academic reviewer. Consider strengths, limitations (what is missing or weak), \
             and specific actionable suggestions. Reports without credible cited sources need revision."
        }
    }
}

/// Reply format the critic must follow.
pub const CRITIC_CONTRACT: &str = r#"Reply with ONLY a JSON object, no prose and no extra fields:
{"verdict": "accept" | "revise", "rationale": "<1-3 sentences>", "issues": ["<concrete, actionable fix>", ...]}
A "revise" verdict MUST list at least one concrete issue."#;

/// Extra instruction after a reply broke the contract.
pub const CRITIC_STRICT: &str = "Your previous reply did not follow the required format. \
Reply with the JSON object only. If the verdict is \"revise\", \"issues\" must contain at least one specific fix.";
