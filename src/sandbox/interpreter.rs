//! Capability-scoped interpreter for policy programs.

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value, json};

use super::capability::{CapabilitySet, Meter};
use super::fault::Fault;
use super::program::{Condition, Expr, Op, Program, check_function};
use crate::store::{Filter, RowValues, StoreTxn};

static NULL: Value = Value::Null;

enum Flow {
    Continue,
    Halt,
}

/// Runs one program inside an open store transaction.
///
/// The interpreter never commits: it only issues reads and writes through the
/// transaction it was handed, and every one of them is re-checked against the
/// capability set.
pub struct Interpreter<'t, 'a> {
    txn: &'t mut StoreTxn<'a>,
    caps: &'t CapabilitySet,
    meter: &'t mut Meter,
    vars: BTreeMap<String, Value>,
    emitted: Vec<Value>,
    answer: Option<Value>,
}

impl<'t, 'a> Interpreter<'t, 'a> {
    pub fn new(txn: &'t mut StoreTxn<'a>, caps: &'t CapabilitySet, meter: &'t mut Meter) -> Self {
        Self {
            txn,
            caps,
            meter,
            vars: BTreeMap::new(),
            emitted: Vec::new(),
            answer: None,
        }
    }

    /// Run to completion. Output is `{"answer": ..., "emitted": [...]}`.
    pub fn run(mut self, program: &Program) -> Result<Value, Fault> {
        self.block(&program.ops, "ops")?;
        Ok(json!({
            "answer": self.answer.unwrap_or(Value::Null),
            "emitted": self.emitted,
        }))
    }

    fn block(&mut self, ops: &[Op], prefix: &str) -> Result<Flow, Fault> {
        for (i, op) in ops.iter().enumerate() {
            let path = format!("{}[{}]", prefix, i);
            match self.op(op, &path).map_err(|f| f.at(|| format!("{} ({})", path, op.name())))? {
                Flow::Continue => {}
                Flow::Halt => return Ok(Flow::Halt),
            }
        }
        Ok(Flow::Continue)
    }

    fn op(&mut self, op: &Op, path: &str) -> Result<Flow, Fault> {
        self.meter.step()?;

        match op {
            Op::Read {
                table,
                conditions,
                into,
            } => {
                self.caps.check_read("read")?;
                let filters = self.filters(conditions)?;
                let rows = self.txn.select(table, &filters).map_err(Fault::from_store)?;
                self.meter.check_rows(rows.len())?;
                let objects: Vec<Value> = rows.iter().map(|r| r.to_object()).collect();
                self.vars.insert(into.clone(), Value::Array(objects));
            }

            Op::Insert { table, values, into } => {
                self.caps.check_write(table)?;
                let mut row = RowValues::new();
                for (column, expr) in values {
                    row.insert(column.clone(), self.eval(expr)?);
                }
                self.txn.insert(table, &row).map_err(Fault::from_store)?;
                self.meter.record_mutations(1)?;
                if let Some(into) = into {
                    self.vars.insert(into.clone(), object(&row));
                }
            }

            Op::Update {
                table,
                conditions,
                set,
            } => {
                self.caps.check_write(table)?;
                let filters = self.filters(conditions)?;
                let rows = self.txn.select(table, &filters).map_err(Fault::from_store)?;
                self.meter.check_rows(rows.len())?;

                let saved = self.vars.remove("row");
                let mut result = Ok(());
                for row in &rows {
                    self.vars.insert("row".to_string(), row.to_object());
                    result = self.update_one(table, row.rowid, set);
                    if result.is_err() {
                        break;
                    }
                }
                self.restore("row", saved);
                result?;
            }

            Op::Delete { table, conditions } => {
                self.caps.check_write(table)?;
                let filters = self.filters(conditions)?;
                let rows = self.txn.select(table, &filters).map_err(Fault::from_store)?;
                for row in &rows {
                    self.meter.step()?;
                    self.txn.delete_row(table, row.rowid).map_err(Fault::from_store)?;
                    self.meter.record_mutations(1)?;
                }
            }

            Op::Let { name, value } => {
                let value = self.eval(value)?;
                self.vars.insert(name.clone(), value);
            }

            Op::If { cond, then, otherwise } => {
                let flow = if truthy(&self.eval(cond)?) {
                    self.block(then, &format!("{}.then", path))?
                } else {
                    self.block(otherwise, &format!("{}.else", path))?
                };
                return Ok(flow);
            }

            Op::ForEach { var, items, body } => {
                let items = match self.eval(items)? {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    other => return Err(Fault::runtime(format!("for_each expects a list, got {}", type_name(&other)))),
                };

                let saved = self.vars.remove(var);
                let body_path = format!("{}.body", path);
                let mut flow = Ok(Flow::Continue);
                for item in items {
                    self.vars.insert(var.clone(), item);
                    flow = self.block(body, &body_path);
                    if !matches!(flow, Ok(Flow::Continue)) {
                        break;
                    }
                }
                self.restore(var, saved);
                return flow;
            }

            Op::Assert { cond, message } => {
                if !truthy(&self.eval(cond)?) {
                    return Err(Fault::runtime(format!("assertion failed: {}", message)));
                }
            }

            Op::Emit { value } => {
                let value = self.eval(value)?;
                self.emitted.push(value);
            }

            Op::Answer { value } => {
                self.answer = Some(self.eval(value)?);
                return Ok(Flow::Halt);
            }

            Op::Fail { message } => {
                return Err(Fault::runtime(message.clone()));
            }
        }

        Ok(Flow::Continue)
    }

    fn update_one(&mut self, table: &str, rowid: i64, set: &BTreeMap<String, Expr>) -> Result<(), Fault> {
        self.meter.step()?;
        let mut values = RowValues::new();
        for (column, expr) in set {
            values.insert(column.clone(), self.eval(expr)?);
        }
        self.txn.update_row(table, rowid, &values).map_err(Fault::from_store)?;
        self.meter.record_mutations(1)
    }

    fn restore(&mut self, name: &str, saved: Option<Value>) {
        match saved {
            Some(value) => {
                self.vars.insert(name.to_string(), value);
            }
            None => {
                self.vars.remove(name);
            }
        }
    }

    fn filters(&mut self, conditions: &[Condition]) -> Result<Vec<Filter>, Fault> {
        let mut filters = Vec::with_capacity(conditions.len());
        for condition in conditions {
            let value = self.eval(&condition.value)?;
            filters.push(Filter::new(condition.column.clone(), condition.cmp, value));
        }
        Ok(filters)
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, Fault> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(path) => self.lookup(path),
            Expr::List(items) => items.iter().map(|e| self.eval(e)).collect::<Result<Vec<_>, _>>().map(Value::Array),
            Expr::Call { name, args } => {
                self.meter.step()?;
                check_function(name, self.caps)?;
                let args = args.iter().map(|e| self.eval(e)).collect::<Result<Vec<_>, _>>()?;
                match name.as_str() {
                    "next_id" => self.next_id(&args),
                    "last" => self.last(&args),
                    _ => call_pure(name, &args),
                }
            }
        }
    }

    fn lookup(&self, path: &str) -> Result<Value, Fault> {
        let mut segments = path.split('.');
        let head = segments.next().unwrap_or_default();
        let mut current = self
            .vars
            .get(head)
            .ok_or_else(|| Fault::runtime(format!("undefined variable '{}'", head)))?;

        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment).unwrap_or(&NULL),
                Value::Array(items) => match segment.parse::<usize>() {
                    Ok(i) => items.get(i).unwrap_or(&NULL),
                    Err(_) => return Err(Fault::runtime(format!("'{}': cannot index a list with '{}'", path, segment))),
                },
                Value::Null => &NULL,
                other => {
                    return Err(Fault::runtime(format!(
                        "'{}': cannot read '{}' of a {}",
                        path,
                        segment,
                        type_name(other)
                    )));
                }
            };
        }
        Ok(current.clone())
    }

    /// `next_id(table, prefix)`: next sequential id, e.g. `TXN-0002`.
    fn next_id(&mut self, args: &[Value]) -> Result<Value, Fault> {
        self.caps.check_read("next_id")?;
        let [table, prefix] = args else {
            return Err(Fault::runtime("next_id expects (table, prefix)"));
        };
        let table = as_str(table, "next_id")?;
        let prefix = as_str(prefix, "next_id")?;
        let count = self.txn.table_rows(table).map_err(Fault::from_store)?.len();
        Ok(Value::String(format!("{}-{:04}", prefix, count + 1)))
    }

    /// `last(table, column)`: the column of the most recently inserted row.
    fn last(&mut self, args: &[Value]) -> Result<Value, Fault> {
        self.caps.check_read("last")?;
        let [table, column] = args else {
            return Err(Fault::runtime("last expects (table, column)"));
        };
        let table = as_str(table, "last")?;
        let column = as_str(column, "last")?;
        let schema = self.txn.schema(table).map_err(Fault::from_store)?;
        if !schema.has_column(column) {
            return Err(Fault::runtime(format!("no such column: {}.{}", table, column)));
        }
        let rows = self.txn.table_rows(table).map_err(Fault::from_store)?;
        Ok(rows
            .last()
            .and_then(|r| r.values.get(column).cloned())
            .unwrap_or(Value::Null))
    }
}

fn object(row: &RowValues) -> Value {
    Value::Object(row.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<Map<_, _>>())
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn as_str<'v>(value: &'v Value, func: &str) -> Result<&'v str, Fault> {
    value
        .as_str()
        .ok_or_else(|| Fault::runtime(format!("{} expects a string, got {}", func, type_name(value))))
}

fn as_num(value: &Value, func: &str) -> Result<f64, Fault> {
    value
        .as_f64()
        .ok_or_else(|| Fault::runtime(format!("{} expects a number, got {}", func, type_name(value))))
}

fn float(f: f64, func: &str) -> Result<Value, Fault> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| Fault::runtime(format!("{} produced a non-finite number", func)))
}

fn arity(func: &str, args: &[Value], n: usize) -> Result<(), Fault> {
    if args.len() == n {
        Ok(())
    } else {
        Err(Fault::runtime(format!("{} expects {} argument(s), got {}", func, n, args.len())))
    }
}

/// Integer arithmetic when both sides are integers and it does not overflow.
fn arith(
    func: &str,
    args: &[Value],
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, Fault> {
    arity(func, args, 2)?;
    if let (Some(a), Some(b)) = (args[0].as_i64(), args[1].as_i64())
        && let Some(result) = int_op(a, b)
    {
        return Ok(Value::from(result));
    }
    float(float_op(as_num(&args[0], func)?, as_num(&args[1], func)?), func)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(func: &str, args: &[Value]) -> Result<std::cmp::Ordering, Fault> {
    arity(func, args, 2)?;
    match (&args[0], &args[1]) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
                .ok_or_else(|| Fault::runtime(format!("{}: numbers are not comparable", func)))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (a, b) => Err(Fault::runtime(format!(
            "{} cannot compare {} with {}",
            func,
            type_name(a),
            type_name(b)
        ))),
    }
}

/// Numbers to reduce: either the arguments themselves or a single list argument.
fn number_list(func: &str, args: &[Value]) -> Result<Vec<f64>, Fault> {
    let items: Vec<&Value> = match args {
        [Value::Array(items)] => items.iter().collect(),
        _ => args.iter().collect(),
    };
    items.into_iter().map(|v| as_num(v, func)).collect()
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn call_pure(name: &str, args: &[Value]) -> Result<Value, Fault> {
    use std::cmp::Ordering;

    match name {
        "add" => arith(name, args, i64::checked_add, |a, b| a + b),
        "sub" => arith(name, args, i64::checked_sub, |a, b| a - b),
        "mul" => arith(name, args, i64::checked_mul, |a, b| a * b),
        "div" => {
            arity(name, args, 2)?;
            let divisor = as_num(&args[1], name)?;
            if divisor == 0.0 {
                return Err(Fault::runtime("division by zero"));
            }
            float(as_num(&args[0], name)? / divisor, name)
        }
        "eq" => {
            arity(name, args, 2)?;
            Ok(Value::Bool(values_equal(&args[0], &args[1])))
        }
        "ne" => {
            arity(name, args, 2)?;
            Ok(Value::Bool(!values_equal(&args[0], &args[1])))
        }
        "lt" => Ok(Value::Bool(compare(name, args)? == Ordering::Less)),
        "lte" => Ok(Value::Bool(compare(name, args)? != Ordering::Greater)),
        "gt" => Ok(Value::Bool(compare(name, args)? == Ordering::Greater)),
        "gte" => Ok(Value::Bool(compare(name, args)? != Ordering::Less)),
        "and" => Ok(Value::Bool(args.iter().all(truthy))),
        "or" => Ok(Value::Bool(args.iter().any(truthy))),
        "not" => {
            arity(name, args, 1)?;
            Ok(Value::Bool(!truthy(&args[0])))
        }
        "len" => {
            arity(name, args, 1)?;
            match &args[0] {
                Value::String(s) => Ok(Value::from(s.chars().count())),
                Value::Array(a) => Ok(Value::from(a.len())),
                Value::Object(o) => Ok(Value::from(o.len())),
                Value::Null => Ok(Value::from(0)),
                other => Err(Fault::runtime(format!("len of a {}", type_name(other)))),
            }
        }
        "first" => {
            arity(name, args, 1)?;
            match &args[0] {
                Value::Array(a) => Ok(a.first().cloned().unwrap_or(Value::Null)),
                Value::Null => Ok(Value::Null),
                other => Err(Fault::runtime(format!("first of a {}", type_name(other)))),
            }
        }
        "get" => {
            if args.len() != 2 && args.len() != 3 {
                return Err(Fault::runtime("get expects (container, key[, default])"));
            }
            let default = args.get(2).cloned().unwrap_or(Value::Null);
            let found = match (&args[0], &args[1]) {
                (Value::Object(map), Value::String(key)) => map.get(key).cloned(),
                (Value::Array(items), index) => index.as_u64().and_then(|i| items.get(i as usize)).cloned(),
                _ => None,
            };
            Ok(found.filter(|v| !v.is_null()).unwrap_or(default))
        }
        "sum" => match args {
            [Value::Array(items), Value::String(field)] => {
                let mut total = 0.0;
                let mut all_int = true;
                let mut int_total: i64 = 0;
                for item in items {
                    let value = item.get(field).unwrap_or(&NULL);
                    if value.is_null() {
                        continue;
                    }
                    match value.as_i64() {
                        Some(i) if all_int => int_total = int_total.saturating_add(i),
                        _ => all_int = false,
                    }
                    total += as_num(value, name)?;
                }
                if all_int { Ok(Value::from(int_total)) } else { float(total, name) }
            }
            _ => {
                let numbers = number_list(name, args)?;
                let all_int = match args {
                    [Value::Array(items)] => items.iter().all(|v| v.is_i64()),
                    _ => args.iter().all(|v| v.is_i64()),
                };
                if all_int {
                    Ok(Value::from(numbers.iter().map(|f| *f as i64).sum::<i64>()))
                } else {
                    float(numbers.iter().sum(), name)
                }
            }
        },
        "concat" => {
            if !args.is_empty() && args.iter().all(Value::is_array) {
                let joined: Vec<Value> = args
                    .iter()
                    .filter_map(Value::as_array)
                    .flat_map(|a| a.iter().cloned())
                    .collect();
                Ok(Value::Array(joined))
            } else {
                Ok(Value::String(args.iter().map(render).collect()))
            }
        }
        "lower" => {
            arity(name, args, 1)?;
            Ok(Value::String(as_str(&args[0], name)?.to_lowercase()))
        }
        "contains" => {
            arity(name, args, 2)?;
            match (&args[0], &args[1]) {
                (Value::String(haystack), Value::String(needle)) => Ok(Value::Bool(haystack.contains(needle.as_str()))),
                (Value::Array(items), needle) => Ok(Value::Bool(items.iter().any(|v| values_equal(v, needle)))),
                (Value::Object(map), Value::String(key)) => Ok(Value::Bool(map.contains_key(key))),
                (a, _) => Err(Fault::runtime(format!("contains on a {}", type_name(a)))),
            }
        }
        "round" => {
            if args.is_empty() || args.len() > 2 {
                return Err(Fault::runtime("round expects (number[, digits])"));
            }
            let value = as_num(&args[0], name)?;
            let digits = match args.get(1) {
                Some(d) => d
                    .as_i64()
                    .ok_or_else(|| Fault::runtime("round digits must be an integer"))?,
                None => 0,
            };
            if digits <= 0 {
                Ok(Value::from(value.round() as i64))
            } else {
                let factor = 10f64.powi(digits.min(12) as i32);
                float((value * factor).round() / factor, name)
            }
        }
        "min" | "max" => {
            let numbers = number_list(name, args)?;
            let picked = if name == "min" {
                numbers.iter().copied().reduce(f64::min)
            } else {
                numbers.iter().copied().reduce(f64::max)
            };
            match picked {
                None => Ok(Value::Null),
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(Value::from(f as i64)),
                Some(f) => float(f, name),
            }
        }
        other => Err(Fault::capability(format!("'{}' is not an available binding", other))),
    }
}
