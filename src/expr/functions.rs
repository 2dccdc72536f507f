//! Built-in functions.
//!
//! Arity is checked when the expression is compiled, so `call` can assume
//! `args.len()` matches one of the registered signatures.

use super::ast::Ast;
use super::eval::{self, compare, eval, is_truthy, number, to_text, type_name, EvalContext, EvalError, Outputs};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt::Write;

/// (name, arity) of every builtin.
const BUILTINS: &[(&str, usize)] = &[
    ("empty", 0),
    ("not", 0),
    ("length", 0),
    ("keys", 0),
    ("values", 0),
    ("type", 0),
    ("tostring", 0),
    ("tonumber", 0),
    ("tojson", 0),
    ("fromjson", 0),
    ("ascii_downcase", 0),
    ("ascii_upcase", 0),
    ("first", 0),
    ("first", 1),
    ("last", 0),
    ("add", 0),
    ("floor", 0),
    ("unique", 0),
    ("sort", 0),
    ("to_entries", 0),
    ("from_entries", 0),
    ("todate", 0),
    ("fromdate", 0),
    ("now", 0),
    ("env", 0),
    ("map", 1),
    ("select", 1),
    ("has", 1),
    ("split", 1),
    ("join", 1),
    ("contains", 1),
    ("test", 1),
    ("startswith", 1),
    ("endswith", 1),
    ("ltrimstr", 1),
    ("rtrimstr", 1),
    ("strftime", 1),
];

pub fn is_builtin(name: &str, arity: usize) -> bool {
    BUILTINS.iter().any(|(n, a)| *n == name && *a == arity)
}

pub(super) fn call(name: &str, args: &[Ast], input: &Value, ctx: &EvalContext) -> Outputs {
    match (name, args) {
        ("empty", []) => Ok(Vec::new()),
        ("not", []) => Ok(vec![Value::Bool(!is_truthy(input))]),
        ("now", []) => Ok(vec![number(ctx.now())]),
        ("env", []) => Ok(vec![ctx.env().clone()]),
        ("first", [f]) => Ok(eval(f, input, ctx)?.into_iter().take(1).collect()),

        ("map", [f]) => {
            let items = iterable(input, "map")?;
            let mut out = Vec::new();
            for item in items {
                out.extend(eval(f, &item, ctx)?);
            }
            Ok(vec![Value::Array(out)])
        }
        ("select", [f]) => Ok(eval(f, input, ctx)?
            .iter()
            .filter(|v| is_truthy(v))
            .map(|_| input.clone())
            .collect()),

        (_, []) => Ok(vec![unary(name, input)?]),

        (_, [arg]) => {
            let mut out = Vec::new();
            for value in eval(arg, input, ctx)? {
                out.push(with_argument(name, input, &value)?);
            }
            Ok(out)
        }

        _ => Err(EvalError::new(format!(
            "Unknown function '{}/{}'",
            name,
            args.len()
        ))),
    }
}

fn unary(name: &str, input: &Value) -> Result<Value, EvalError> {
    match name {
        "length" => match input {
            Value::Null => Ok(Value::from(0)),
            Value::Bool(_) => Err(EvalError::new("boolean has no length")),
            Value::Number(n) => Ok(number(n.as_f64().unwrap_or(0.0).abs())),
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(map) => Ok(Value::from(map.len())),
        },
        "keys" => match input {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                Ok(Value::Array(
                    keys.into_iter().map(|k| Value::String(k.clone())).collect(),
                ))
            }
            Value::Array(items) => Ok(Value::Array((0..items.len()).map(Value::from).collect())),
            other => Err(wrong_type("keys", other)),
        },
        "values" => Ok(Value::Array(iterable(input, "values")?)),
        "type" => Ok(Value::String(type_name(input).to_string())),
        "tostring" => Ok(Value::String(to_text(input))),
        "tonumber" => match input {
            Value::Number(_) => Ok(input.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(number)
                .map_err(|_| EvalError::new(format!("Cannot parse '{s}' as a number"))),
            other => Err(wrong_type("tonumber", other)),
        },
        "tojson" => Ok(Value::String(input.to_string())),
        "fromjson" => match input {
            Value::String(s) => serde_json::from_str(s)
                .map_err(|e| EvalError::new(format!("Invalid JSON text: {e}"))),
            other => Err(wrong_type("fromjson", other)),
        },
        "ascii_downcase" => match input {
            Value::String(s) => Ok(Value::String(s.to_ascii_lowercase())),
            other => Err(wrong_type("ascii_downcase", other)),
        },
        "ascii_upcase" => match input {
            Value::String(s) => Ok(Value::String(s.to_ascii_uppercase())),
            other => Err(wrong_type("ascii_upcase", other)),
        },
        "first" => match input {
            Value::Array(items) => Ok(items.first().cloned().unwrap_or(Value::Null)),
            Value::Null => Ok(Value::Null),
            other => Err(wrong_type("first", other)),
        },
        "last" => match input {
            Value::Array(items) => Ok(items.last().cloned().unwrap_or(Value::Null)),
            Value::Null => Ok(Value::Null),
            other => Err(wrong_type("last", other)),
        },
        "add" => {
            let mut acc = Value::Null;
            for item in iterable(input, "add")? {
                acc = eval::add(&acc, &item)?;
            }
            Ok(acc)
        }
        "floor" => match input {
            Value::Number(n) => Ok(number(n.as_f64().unwrap_or(0.0).floor())),
            other => Err(wrong_type("floor", other)),
        },
        "sort" => match input {
            Value::Array(items) => {
                let mut items = items.clone();
                items.sort_by(compare);
                Ok(Value::Array(items))
            }
            other => Err(wrong_type("sort", other)),
        },
        "unique" => match input {
            Value::Array(items) => {
                let mut items = items.clone();
                items.sort_by(compare);
                items.dedup_by(|a, b| compare(a, b) == Ordering::Equal);
                Ok(Value::Array(items))
            }
            other => Err(wrong_type("unique", other)),
        },
        "to_entries" => match input {
            Value::Object(map) => Ok(Value::Array(
                map.iter()
                    .map(|(k, v)| serde_json::json!({"key": k, "value": v}))
                    .collect(),
            )),
            other => Err(wrong_type("to_entries", other)),
        },
        "from_entries" => {
            let mut map = serde_json::Map::new();
            for entry in iterable(input, "from_entries")? {
                let key = ["key", "k", "name", "Name", "Key"]
                    .iter()
                    .find_map(|k| entry.get(*k).filter(|v| !v.is_null()))
                    .map(to_text)
                    .ok_or_else(|| EvalError::new("from_entries: entry without a key"))?;
                let value = ["value", "v", "Value"]
                    .iter()
                    .find_map(|k| entry.get(*k))
                    .cloned()
                    .unwrap_or(Value::Null);
                map.insert(key, value);
            }
            Ok(Value::Object(map))
        }
        "todate" => match input {
            Value::Number(n) => {
                let dt = epoch_to_datetime(n.as_f64().unwrap_or(0.0))?;
                Ok(Value::String(dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()))
            }
            other => Err(wrong_type("todate", other)),
        },
        "fromdate" => match input {
            Value::String(s) => parse_date(s).map(|dt| Value::from(dt.timestamp())),
            other => Err(wrong_type("fromdate", other)),
        },
        _ => Err(EvalError::new(format!("Unknown function '{name}/0'"))),
    }
}

fn with_argument(name: &str, input: &Value, arg: &Value) -> Result<Value, EvalError> {
    match name {
        "has" => match (input, arg) {
            (Value::Object(map), Value::String(key)) => Ok(Value::Bool(map.contains_key(key))),
            (Value::Array(items), Value::Number(n)) => {
                let i = n.as_f64().unwrap_or(-1.0);
                Ok(Value::Bool(i >= 0.0 && (i as usize) < items.len()))
            }
            _ => Err(EvalError::new(format!(
                "Cannot check whether {} has a {} key",
                type_name(input),
                type_name(arg)
            ))),
        },
        "split" => match (input, arg) {
            (Value::String(s), Value::String(sep)) => Ok(split_string(s, sep)),
            _ => Err(wrong_type("split", input)),
        },
        "join" => {
            let sep = match arg {
                Value::String(s) => s.as_str(),
                other => return Err(wrong_type("join", other)),
            };
            let mut parts = Vec::new();
            for item in iterable(input, "join")? {
                parts.push(match item {
                    Value::Null => String::new(),
                    Value::String(s) => s,
                    Value::Number(_) | Value::Bool(_) => item.to_string(),
                    other => {
                        return Err(EvalError::new(format!(
                            "Cannot join with {}",
                            type_name(&other)
                        )))
                    }
                });
            }
            Ok(Value::String(parts.join(sep)))
        }
        "contains" => Ok(Value::Bool(contains(input, arg)?)),
        "test" => match (input, arg) {
            (Value::String(s), Value::String(needle)) => Ok(Value::Bool(s.contains(needle.as_str()))),
            _ => Err(wrong_type("test", input)),
        },
        "startswith" => match (input, arg) {
            (Value::String(s), Value::String(prefix)) => {
                Ok(Value::Bool(s.starts_with(prefix.as_str())))
            }
            _ => Err(EvalError::new("startswith() requires string inputs")),
        },
        "endswith" => match (input, arg) {
            (Value::String(s), Value::String(suffix)) => {
                Ok(Value::Bool(s.ends_with(suffix.as_str())))
            }
            _ => Err(EvalError::new("endswith() requires string inputs")),
        },
        "ltrimstr" => match (input, arg) {
            (Value::String(s), Value::String(prefix)) => Ok(Value::String(
                s.strip_prefix(prefix.as_str()).unwrap_or(s).to_string(),
            )),
            _ => Ok(input.clone()),
        },
        "rtrimstr" => match (input, arg) {
            (Value::String(s), Value::String(suffix)) => Ok(Value::String(
                s.strip_suffix(suffix.as_str()).unwrap_or(s).to_string(),
            )),
            _ => Ok(input.clone()),
        },
        "strftime" => {
            let format = match arg {
                Value::String(f) => f,
                other => return Err(wrong_type("strftime", other)),
            };
            let dt = match input {
                Value::Number(n) => epoch_to_datetime(n.as_f64().unwrap_or(0.0))?,
                Value::String(s) => parse_date(s)?,
                other => return Err(wrong_type("strftime", other)),
            };
            let mut out = String::new();
            write!(out, "{}", dt.format(format))
                .map_err(|_| EvalError::new(format!("Invalid strftime format '{format}'")))?;
            Ok(Value::String(out))
        }
        _ => Err(EvalError::new(format!("Unknown function '{name}/1'"))),
    }
}

pub(super) fn split_string(s: &str, sep: &str) -> Value {
    if s.is_empty() {
        return Value::Array(Vec::new());
    }
    if sep.is_empty() {
        return Value::Array(s.chars().map(|c| Value::String(c.to_string())).collect());
    }
    Value::Array(s.split(sep).map(|p| Value::String(p.to_string())).collect())
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, EvalError> {
    match (haystack, needle) {
        (Value::String(a), Value::String(b)) => Ok(a.contains(b.as_str())),
        (Value::Array(a), Value::Array(b)) => {
            for wanted in b {
                let mut found = false;
                for item in a {
                    if contains(item, wanted)? {
                        found = true;
                        break;
                    }
                }
                if !found {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        (Value::Object(a), Value::Object(b)) => {
            for (k, wanted) in b {
                match a.get(k) {
                    Some(item) if contains(item, wanted)? => {}
                    _ => return Ok(false),
                }
            }
            Ok(true)
        }
        (a, b) if type_name(a) == type_name(b) => Ok(compare(a, b) == Ordering::Equal),
        (a, b) => Err(EvalError::new(format!(
            "{} and {} cannot have their containment checked",
            type_name(a),
            type_name(b)
        ))),
    }
}

fn iterable(input: &Value, function: &str) -> Result<Vec<Value>, EvalError> {
    match input {
        Value::Array(items) => Ok(items.clone()),
        Value::Object(map) => Ok(map.values().cloned().collect()),
        Value::Null if function == "add" || function == "join" => Ok(Vec::new()),
        other => Err(EvalError::new(format!(
            "Cannot iterate over {} in {}",
            type_name(other),
            function
        ))),
    }
}

fn wrong_type(function: &str, value: &Value) -> EvalError {
    EvalError::new(format!(
        "{}() cannot be applied to {}",
        function,
        type_name(value)
    ))
}

fn epoch_to_datetime(seconds: f64) -> Result<DateTime<Utc>, EvalError> {
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9) as u32;
    Utc.timestamp_opt(whole as i64, nanos)
        .single()
        .ok_or_else(|| EvalError::new(format!("Timestamp {seconds} is out of range")))
}

/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SSZ` without offset, and plain dates.
fn parse_date(s: &str) -> Result<DateTime<Utc>, EvalError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Some(naive) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    Err(EvalError::new(format!(
        "date \"{s}\" does not match format \"%Y-%m-%dT%H:%M:%SZ\""
    )))
}
