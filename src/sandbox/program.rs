//! Policy programs: the closed operation language for `code` artifacts.
//!
//! A program is a JSON array of operations. The only way a program can touch
//! anything outside its own variables is through the store operations
//! (`read`, `insert`, `update`, `delete`) and the store helpers
//! (`next_id`, `last`); every other function name is an ambient binding that
//! does not exist here.
//!
//! ```json
//! [
//!   {"op": "read", "table": "inventory", "where": [{"column": "frame", "value": "round"}], "into": "items"},
//!   {"op": "if", "cond": {"call": "gt", "args": [{"call": "len", "args": [{"var": "items"}]}, 0]},
//!    "then": [{"op": "answer", "value": {"var": "items.0.name"}}],
//!    "else": [{"op": "answer", "value": "none in stock"}]}
//! ]
//! ```

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::capability::CapabilitySet;
use super::fault::{Fault, MalformedArtifact};
use crate::domain::ArtifactKind;
use crate::store::{Cmp, is_identifier};

/// Pure functions available to every program.
pub const PURE_FUNCTIONS: &[&str] = &[
    "add", "sub", "mul", "div", "eq", "ne", "lt", "lte", "gt", "gte", "and", "or", "not", "len", "first", "get", "sum",
    "concat", "lower", "contains", "round", "min", "max",
];

/// Functions that read the store and need `read_store`.
pub const STORE_FUNCTIONS: &[&str] = &["next_id", "last"];

/// An expression evaluated against the program's variables.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A JSON scalar, or `{"lit": ...}` for any JSON value
    Literal(Value),
    /// `{"var": "items.0.price"}`: variable with an optional dotted path
    Var(String),
    /// `{"call": "add", "args": [...]}`
    Call { name: String, args: Vec<Expr> },
    /// A JSON array; each element is an expression
    List(Vec<Expr>),
}

impl Expr {
    pub fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(Expr::from_value)
                .collect::<Result<Vec<_>, _>>()
                .map(Expr::List),
            Value::Object(mut map) => {
                if map.len() == 1 {
                    if let Some(var) = map.remove("var") {
                        return match var {
                            Value::String(path) if !path.trim().is_empty() => Ok(Expr::Var(path)),
                            other => Err(format!("\"var\" must be a non-empty string, got {}", other)),
                        };
                    }
                    if let Some(lit) = map.remove("lit") {
                        return Ok(Expr::Literal(lit));
                    }
                }
                if map.contains_key("call") && map.keys().all(|k| k == "call" || k == "args") {
                    let name = match map.remove("call") {
                        Some(Value::String(name)) => name,
                        other => return Err(format!("\"call\" must be a function name, got {:?}", other)),
                    };
                    let args = match map.remove("args") {
                        None => Vec::new(),
                        Some(Value::Array(args)) => args
                            .into_iter()
                            .map(Expr::from_value)
                            .collect::<Result<Vec<_>, _>>()?,
                        Some(other) => return Err(format!("\"args\" must be an array, got {}", other)),
                    };
                    return Ok(Expr::Call { name, args });
                }
                let keys: Vec<&str> = map.keys().map(String::as_str).collect();
                Err(format!(
                    "unrecognized expression object with keys [{}]; use var, call/args or lit",
                    keys.join(", ")
                ))
            }
            scalar => Ok(Expr::Literal(scalar)),
        }
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Expr::from_value(value).map_err(D::Error::custom)
    }
}

/// One `column <cmp> value` term of a `where` list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    pub column: String,
    #[serde(default)]
    pub cmp: Cmp,
    pub value: Expr,
}

/// A policy program operation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Op {
    /// Bind the matching rows (as objects) to `into`
    Read {
        table: String,
        #[serde(rename = "where", default)]
        conditions: Vec<Condition>,
        into: String,
    },
    /// Insert one row; optionally bind the inserted row to `into`
    Insert {
        table: String,
        values: BTreeMap<String, Expr>,
        #[serde(default)]
        into: Option<String>,
    },
    /// Update every matching row; `set` is evaluated per row with `row` bound
    Update {
        table: String,
        #[serde(rename = "where", default)]
        conditions: Vec<Condition>,
        set: BTreeMap<String, Expr>,
    },
    Delete {
        table: String,
        #[serde(rename = "where", default)]
        conditions: Vec<Condition>,
    },
    Let {
        name: String,
        value: Expr,
    },
    If {
        cond: Expr,
        #[serde(default)]
        then: Vec<Op>,
        #[serde(rename = "else", default)]
        otherwise: Vec<Op>,
    },
    ForEach {
        var: String,
        #[serde(rename = "in")]
        items: Expr,
        body: Vec<Op>,
    },
    /// Raise a runtime error unless `cond` holds
    Assert {
        cond: Expr,
        message: String,
    },
    /// Append a value to the program's output log
    Emit {
        value: Expr,
    },
    /// Set the answer and stop
    Answer {
        value: Expr,
    },
    /// Raise a runtime error
    Fail {
        message: String,
    },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Read { .. } => "read",
            Op::Insert { .. } => "insert",
            Op::Update { .. } => "update",
            Op::Delete { .. } => "delete",
            Op::Let { .. } => "let",
            Op::If { .. } => "if",
            Op::ForEach { .. } => "for_each",
            Op::Assert { .. } => "assert",
            Op::Emit { .. } => "emit",
            Op::Answer { .. } => "answer",
            Op::Fail { .. } => "fail",
        }
    }
}

/// A decoded policy program.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub ops: Vec<Op>,
}

impl Program {
    /// Decode and structurally validate program source.
    pub fn parse(source: &str) -> Result<Self, MalformedArtifact> {
        let malformed = |reason: String| MalformedArtifact::new(ArtifactKind::Code, reason);

        let ops: Vec<Op> = serde_json::from_str(source.trim()).map_err(|e| malformed(e.to_string()))?;
        if ops.is_empty() {
            return Err(malformed("program has no operations".to_string()));
        }

        let program = Self { ops };
        program.validate_names().map_err(malformed)?;
        Ok(program)
    }

    fn validate_names(&self) -> Result<(), String> {
        let mut problems = Vec::new();
        visit(&self.ops, "ops", &mut |op, path| {
            let mut names: Vec<&str> = Vec::new();
            match op {
                Op::Read { table, conditions, into } => {
                    names.push(table);
                    names.push(into);
                    names.extend(conditions.iter().map(|c| c.column.as_str()));
                }
                Op::Insert { table, values, into } => {
                    names.push(table);
                    names.extend(values.keys().map(String::as_str));
                    names.extend(into.as_deref());
                }
                Op::Update {
                    table,
                    conditions,
                    set,
                } => {
                    names.push(table);
                    names.extend(conditions.iter().map(|c| c.column.as_str()));
                    names.extend(set.keys().map(String::as_str));
                }
                Op::Delete { table, conditions } => {
                    names.push(table);
                    names.extend(conditions.iter().map(|c| c.column.as_str()));
                }
                Op::Let { name, .. } => names.push(name),
                Op::ForEach { var, .. } => names.push(var),
                _ => {}
            }
            for name in names {
                if !is_identifier(name) {
                    problems.push(format!("{}: '{}' is not a valid identifier", path, name));
                }
            }
        });

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }

    /// Reject, before touching the store, any access the capability set does
    /// not grant and any call to a function that does not exist.
    pub fn check(&self, caps: &CapabilitySet) -> Result<(), Fault> {
        let mut fault: Option<Fault> = None;
        visit(&self.ops, "ops", &mut |op, path| {
            if fault.is_some() {
                return;
            }
            let result = check_op(op, caps).and_then(|()| {
                op_exprs(op)
                    .into_iter()
                    .try_for_each(|expr| check_expr(expr, caps))
            });
            if let Err(f) = result {
                fault = Some(f.at(|| path.to_string()));
            }
        });
        match fault {
            Some(f) => Err(f),
            None => Ok(()),
        }
    }

    /// Number of operations, nested ones included.
    pub fn op_count(&self) -> usize {
        let mut count = 0;
        visit(&self.ops, "ops", &mut |_, _| count += 1);
        count
    }
}

fn check_op(op: &Op, caps: &CapabilitySet) -> Result<(), Fault> {
    match op {
        Op::Read { .. } => caps.check_read("read"),
        Op::Insert { table, .. } | Op::Update { table, .. } | Op::Delete { table, .. } => caps.check_write(table),
        _ => Ok(()),
    }
}

fn check_expr(expr: &Expr, caps: &CapabilitySet) -> Result<(), Fault> {
    match expr {
        Expr::Literal(_) | Expr::Var(_) => Ok(()),
        Expr::List(items) => items.iter().try_for_each(|e| check_expr(e, caps)),
        Expr::Call { name, args } => {
            check_function(name, caps)?;
            args.iter().try_for_each(|e| check_expr(e, caps))
        }
    }
}

/// Whether a function name is callable under `caps`.
pub fn check_function(name: &str, caps: &CapabilitySet) -> Result<(), Fault> {
    if PURE_FUNCTIONS.contains(&name) {
        Ok(())
    } else if STORE_FUNCTIONS.contains(&name) {
        caps.check_read(name)
    } else {
        Err(Fault::capability(format!("'{}' is not an available binding", name)))
    }
}

/// Expressions an operation evaluates directly (nested blocks excluded).
fn op_exprs(op: &Op) -> Vec<&Expr> {
    let mut exprs = Vec::new();
    match op {
        Op::Read { conditions, .. } | Op::Delete { conditions, .. } => {
            exprs.extend(conditions.iter().map(|c| &c.value));
        }
        Op::Insert { values, .. } => exprs.extend(values.values()),
        Op::Update { conditions, set, .. } => {
            exprs.extend(conditions.iter().map(|c| &c.value));
            exprs.extend(set.values());
        }
        Op::Let { value, .. } | Op::Emit { value } | Op::Answer { value } => exprs.push(value),
        Op::If { cond, .. } | Op::Assert { cond, .. } => exprs.push(cond),
        Op::ForEach { items, .. } => exprs.push(items),
        Op::Fail { .. } => {}
    }
    exprs
}

/// Depth-first walk over every operation with its path.
fn visit<'a>(ops: &'a [Op], prefix: &str, f: &mut dyn FnMut(&'a Op, &str)) {
    for (i, op) in ops.iter().enumerate() {
        let path = format!("{}[{}]", prefix, i);
        f(op, &path);
        match op {
            Op::If { then, otherwise, .. } => {
                visit(then, &format!("{}.then", path), f);
                visit(otherwise, &format!("{}.else", path), f);
            }
            Op::ForEach { body, .. } => visit(body, &format!("{}.body", path), f),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExecutionStatus;
    use serde_json::json;

    #[test]
    fn test_expr_forms() {
        assert_eq!(Expr::from_value(json!(3)).unwrap(), Expr::Literal(json!(3)));
        assert_eq!(Expr::from_value(json!({"var": "a.b"})).unwrap(), Expr::Var("a.b".to_string()));
        assert_eq!(
            Expr::from_value(json!({"lit": {"var": "x"}})).unwrap(),
            Expr::Literal(json!({"var": "x"}))
        );
        assert_eq!(
            Expr::from_value(json!({"call": "len", "args": [[1, 2]]})).unwrap(),
            Expr::Call {
                name: "len".to_string(),
                args: vec![Expr::List(vec![Expr::Literal(json!(1)), Expr::Literal(json!(2))])],
            }
        );
        assert!(Expr::from_value(json!({"name": "x"})).is_err());
        assert!(Expr::from_value(json!({"var": 3})).is_err());
        assert!(Expr::from_value(json!({"call": "len", "argz": []})).is_err());
    }

    #[test]
    fn test_parse_program() {
        let program = Program::parse(
            r#"[
                {"op": "read", "table": "inventory", "where": [{"column": "frame", "value": "round"}], "into": "items"},
                {"op": "for_each", "var": "item", "in": {"var": "items"}, "body": [
                    {"op": "emit", "value": {"var": "item.name"}}
                ]},
                {"op": "answer", "value": "done"}
            ]"#,
        )
        .unwrap();
        assert_eq!(program.ops.len(), 3);
        assert_eq!(program.op_count(), 4);
        assert_eq!(program.ops[1].name(), "for_each");
    }

    #[test]
    fn test_parse_rejects_unknown_ops_and_fields() {
        assert!(Program::parse(r#"[{"op": "exec", "cmd": "rm -rf /"}]"#).is_err());
        assert!(Program::parse(r#"[{"op": "answer", "value": 1, "extra": true}]"#).is_err());
        assert!(Program::parse("[]").is_err());
        assert!(Program::parse("print('hi')").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_identifiers() {
        let err = Program::parse(r#"[{"op": "let", "name": "a b", "value": 1}]"#).unwrap_err();
        assert!(err.reason.contains("ops[0]"));
        assert!(Program::parse(r#"[{"op": "delete", "table": "x; DROP TABLE y"}]"#).is_err());
    }

    #[test]
    fn test_check_rejects_ambient_bindings() {
        let program = Program::parse(
            r#"[{"op": "if", "cond": true, "then": [
                {"op": "emit", "value": {"call": "fs.write", "args": ["/tmp/x", "data"]}}
            ]}]"#,
        )
        .unwrap();
        let fault = program.check(&CapabilitySet::read_only()).unwrap_err();
        assert_eq!(fault.status, ExecutionStatus::CapabilityViolation);
        assert_eq!(fault.location.as_deref(), Some("ops[0].then[0]"));
        assert!(fault.message.contains("fs.write"));
    }

    #[test]
    fn test_check_table_capabilities() {
        let program =
            Program::parse(r#"[{"op": "update", "table": "inventory", "set": {"price": 1}}]"#).unwrap();
        assert!(program.check(&CapabilitySet::read_only()).is_err());
        assert!(program.check(&CapabilitySet::none().with_write("inventory")).is_ok());

        let read = Program::parse(r#"[{"op": "read", "table": "inventory", "into": "rows"}]"#).unwrap();
        assert!(read.check(&CapabilitySet::none()).is_err());
    }

    #[test]
    fn test_store_helpers_need_read() {
        let program = Program::parse(
            r#"[{"op": "let", "name": "id", "value": {"call": "next_id", "args": ["transactions", "TXN"]}}]"#,
        )
        .unwrap();
        assert!(program.check(&CapabilitySet::none()).is_err());
        assert!(program.check(&CapabilitySet::read_only()).is_ok());
    }
}
