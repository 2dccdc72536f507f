//! Stream evaluator for mapping expressions.
//!
//! Every node maps one input value to a list of outputs. A mapping field
//! that needs a single value takes the first output.

use super::ast::{Ast, BinaryOp, FormatPart, ObjectKey};
use super::functions;
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Error during evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for EvalError {}

/// Read-only ambient state visible to expressions (`$ENV`, `env`, `now`).
#[derive(Debug, Clone)]
pub struct EvalContext {
    env: Value,
    now: Option<f64>,
}

impl Default for EvalContext {
    fn default() -> Self {
        Self {
            env: Value::Object(Map::new()),
            now: None,
        }
    }
}

impl EvalContext {
    /// Snapshot of the process environment.
    pub fn from_process() -> Self {
        let env = std::env::vars()
            .map(|(k, v)| (k, Value::String(v)))
            .collect::<Map<_, _>>();
        Self {
            env: Value::Object(env),
            now: None,
        }
    }

    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Value::Object(
            vars.into_iter()
                .map(|(k, v)| (k.into(), Value::String(v.into())))
                .collect(),
        );
        self
    }

    /// Pin `now` to a fixed epoch timestamp.
    pub fn with_now(mut self, epoch_seconds: f64) -> Self {
        self.now = Some(epoch_seconds);
        self
    }

    pub fn env(&self) -> &Value {
        &self.env
    }

    pub fn now(&self) -> f64 {
        self.now.unwrap_or_else(|| {
            let now = chrono::Utc::now();
            now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0
        })
    }
}

pub type Outputs = Result<Vec<Value>, EvalError>;

/// Evaluate `ast` against `input`.
pub fn eval(ast: &Ast, input: &Value, ctx: &EvalContext) -> Outputs {
    match ast {
        Ast::Identity => Ok(vec![input.clone()]),
        Ast::Literal(value) => Ok(vec![value.clone()]),
        Ast::Variable(_) => Ok(vec![ctx.env().clone()]),
        Ast::Format(parts) => eval_format(parts, input, ctx),

        Ast::Field { target, name } => {
            let mut out = Vec::new();
            for value in eval(target, input, ctx)? {
                out.push(index_field(&value, name)?);
            }
            Ok(out)
        }
        Ast::Index { target, index } => {
            let targets = eval(target, input, ctx)?;
            let indices = eval(index, input, ctx)?;
            let mut out = Vec::with_capacity(targets.len() * indices.len());
            for value in &targets {
                for key in &indices {
                    out.push(index_value(value, key)?);
                }
            }
            Ok(out)
        }
        Ast::Slice { target, from, to } => {
            let from = optional_single(from.as_deref(), input, ctx)?;
            let to = optional_single(to.as_deref(), input, ctx)?;
            eval(target, input, ctx)?
                .iter()
                .map(|value| slice(value, &from, &to))
                .collect()
        }
        Ast::Iterate(target) => {
            let mut out = Vec::new();
            for value in eval(target, input, ctx)? {
                match value {
                    Value::Array(items) => out.extend(items),
                    Value::Object(map) => out.extend(map.into_iter().map(|(_, v)| v)),
                    other => {
                        return Err(EvalError::new(format!(
                            "Cannot iterate over {}",
                            type_name(&other)
                        )))
                    }
                }
            }
            Ok(out)
        }
        Ast::Try(inner) => Ok(eval(inner, input, ctx).unwrap_or_default()),

        Ast::Array(None) => Ok(vec![Value::Array(Vec::new())]),
        Ast::Array(Some(inner)) => Ok(vec![Value::Array(eval(inner, input, ctx)?)]),
        Ast::Object(entries) => eval_object(entries, input, ctx),

        Ast::Negate(inner) => eval(inner, input, ctx)?
            .iter()
            .map(|value| match value.as_f64() {
                Some(n) => Ok(number(-n)),
                None => Err(EvalError::new(format!(
                    "{} cannot be negated",
                    type_name(value)
                ))),
            })
            .collect(),
        Ast::Binary { op, left, right } => {
            let rights = eval(right, input, ctx)?;
            let lefts = eval(left, input, ctx)?;
            let mut out = Vec::with_capacity(lefts.len() * rights.len());
            for r in &rights {
                for l in &lefts {
                    out.push(binary(*op, l, r)?);
                }
            }
            Ok(out)
        }
        Ast::And(left, right) => {
            let mut out = Vec::new();
            for l in eval(left, input, ctx)? {
                if !is_truthy(&l) {
                    out.push(Value::Bool(false));
                    continue;
                }
                for r in eval(right, input, ctx)? {
                    out.push(Value::Bool(is_truthy(&r)));
                }
            }
            Ok(out)
        }
        Ast::Or(left, right) => {
            let mut out = Vec::new();
            for l in eval(left, input, ctx)? {
                if is_truthy(&l) {
                    out.push(Value::Bool(true));
                    continue;
                }
                for r in eval(right, input, ctx)? {
                    out.push(Value::Bool(is_truthy(&r)));
                }
            }
            Ok(out)
        }
        Ast::Alternative(left, right) => {
            let truthy: Vec<Value> = eval(left, input, ctx)
                .unwrap_or_default()
                .into_iter()
                .filter(is_truthy)
                .collect();
            if truthy.is_empty() {
                eval(right, input, ctx)
            } else {
                Ok(truthy)
            }
        }
        Ast::Pipe(left, right) => {
            let mut out = Vec::new();
            for value in eval(left, input, ctx)? {
                out.extend(eval(right, &value, ctx)?);
            }
            Ok(out)
        }
        Ast::Comma(left, right) => {
            let mut out = eval(left, input, ctx)?;
            out.extend(eval(right, input, ctx)?);
            Ok(out)
        }
        Ast::If {
            branches,
            otherwise,
        } => eval_if(branches, otherwise.as_deref(), input, ctx),
        Ast::Call { name, args } => functions::call(name, args, input, ctx),
    }
}

fn eval_if(
    branches: &[(Ast, Ast)],
    otherwise: Option<&Ast>,
    input: &Value,
    ctx: &EvalContext,
) -> Outputs {
    let Some(((condition, then), rest)) = branches.split_first() else {
        return match otherwise {
            Some(e) => eval(e, input, ctx),
            None => Ok(vec![input.clone()]),
        };
    };

    let mut out = Vec::new();
    for value in eval(condition, input, ctx)? {
        if is_truthy(&value) {
            out.extend(eval(then, input, ctx)?);
        } else {
            out.extend(eval_if(rest, otherwise, input, ctx)?);
        }
    }
    Ok(out)
}

fn eval_format(parts: &[FormatPart], input: &Value, ctx: &EvalContext) -> Outputs {
    let mut results = vec![String::new()];
    for part in parts {
        match part {
            FormatPart::Text(text) => {
                for r in &mut results {
                    r.push_str(text);
                }
            }
            FormatPart::Expr(expr) => {
                let values = eval(expr, input, ctx)?;
                let mut next = Vec::with_capacity(results.len() * values.len());
                for prefix in &results {
                    for value in &values {
                        next.push(format!("{prefix}{}", to_text(value)));
                    }
                }
                results = next;
            }
        }
    }
    Ok(results.into_iter().map(Value::String).collect())
}

fn eval_object(entries: &[(ObjectKey, Option<Ast>)], input: &Value, ctx: &EvalContext) -> Outputs {
    let mut objects = vec![Map::new()];
    for (key, value) in entries {
        let keys: Vec<String> = match key {
            ObjectKey::Name(name) => vec![name.clone()],
            ObjectKey::Variable(name) => vec![name.clone()],
            ObjectKey::Computed(expr) => eval(expr, input, ctx)?
                .into_iter()
                .map(|k| match k {
                    Value::String(s) => Ok(s),
                    other => Err(EvalError::new(format!(
                        "Object keys must be strings, got {}",
                        type_name(&other)
                    ))),
                })
                .collect::<Result<_, _>>()?,
        };
        let values = match (key, value) {
            (_, Some(expr)) => eval(expr, input, ctx)?,
            (ObjectKey::Variable(_), None) => vec![ctx.env().clone()],
            (ObjectKey::Name(name), None) => vec![index_field(input, name)?],
            (ObjectKey::Computed(_), None) => {
                return Err(EvalError::new("Computed object key requires a value"))
            }
        };

        let mut next = Vec::with_capacity(objects.len() * keys.len() * values.len());
        for object in &objects {
            for k in &keys {
                for v in &values {
                    let mut object = object.clone();
                    object.insert(k.clone(), v.clone());
                    next.push(object);
                }
            }
        }
        objects = next;
    }
    Ok(objects.into_iter().map(Value::Object).collect())
}

fn optional_single(
    expr: Option<&Ast>,
    input: &Value,
    ctx: &EvalContext,
) -> Result<Option<Value>, EvalError> {
    match expr {
        None => Ok(None),
        Some(e) => Ok(eval(e, input, ctx)?.into_iter().next()),
    }
}

pub(super) fn index_field(value: &Value, name: &str) -> Result<Value, EvalError> {
    match value {
        Value::Object(map) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
        Value::Null => Ok(Value::Null),
        other => Err(EvalError::new(format!(
            "Cannot index {} with \"{}\"",
            type_name(other),
            name
        ))),
    }
}

fn index_value(value: &Value, key: &Value) -> Result<Value, EvalError> {
    match (value, key) {
        (Value::Null, Value::String(_) | Value::Number(_)) => Ok(Value::Null),
        (Value::Object(_), Value::String(name)) => index_field(value, name),
        (Value::Array(items), Value::Number(n)) => {
            let Some(i) = n.as_f64() else {
                return Ok(Value::Null);
            };
            let i = i.floor() as i64;
            let len = items.len() as i64;
            let i = if i < 0 { len + i } else { i };
            if i < 0 || i >= len {
                Ok(Value::Null)
            } else {
                Ok(items[i as usize].clone())
            }
        }
        _ => Err(EvalError::new(format!(
            "Cannot index {} with {}",
            type_name(value),
            type_name(key)
        ))),
    }
}

fn slice(value: &Value, from: &Option<Value>, to: &Option<Value>) -> Result<Value, EvalError> {
    let bound = |b: &Option<Value>, len: usize, default: usize| -> Result<usize, EvalError> {
        match b {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Number(n)) => {
                let i = n.as_f64().unwrap_or(0.0).floor() as i64;
                let len = len as i64;
                let i = if i < 0 { len + i } else { i };
                Ok(i.clamp(0, len) as usize)
            }
            Some(other) => Err(EvalError::new(format!(
                "Slice bounds must be numbers, got {}",
                type_name(other)
            ))),
        }
    };

    match value {
        Value::Null => Ok(Value::Null),
        Value::Array(items) => {
            let start = bound(from, items.len(), 0)?;
            let end = bound(to, items.len(), items.len())?.max(start);
            Ok(Value::Array(items[start..end].to_vec()))
        }
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let start = bound(from, chars.len(), 0)?;
            let end = bound(to, chars.len(), chars.len())?.max(start);
            Ok(Value::String(chars[start..end].iter().collect()))
        }
        other => Err(EvalError::new(format!("Cannot slice {}", type_name(other)))),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Equal => Ok(Value::Bool(compare(left, right) == Ordering::Equal)),
        BinaryOp::NotEqual => Ok(Value::Bool(compare(left, right) != Ordering::Equal)),
        BinaryOp::LessThan => Ok(Value::Bool(compare(left, right) == Ordering::Less)),
        BinaryOp::LessThanOrEqual => Ok(Value::Bool(compare(left, right) != Ordering::Greater)),
        BinaryOp::GreaterThan => Ok(Value::Bool(compare(left, right) == Ordering::Greater)),
        BinaryOp::GreaterThanOrEqual => Ok(Value::Bool(compare(left, right) != Ordering::Less)),
        BinaryOp::Add => add(left, right),
        BinaryOp::Subtract => match (left, right) {
            (Value::Number(a), Value::Number(b)) => Ok(arith(a, b, |x, y| x - y)),
            (Value::Array(a), Value::Array(b)) => Ok(Value::Array(
                a.iter()
                    .filter(|x| !b.iter().any(|y| compare(x, y) == Ordering::Equal))
                    .cloned()
                    .collect(),
            )),
            _ => Err(op_error(op, left, right)),
        },
        BinaryOp::Multiply => match (left, right) {
            (Value::Number(a), Value::Number(b)) => Ok(arith(a, b, |x, y| x * y)),
            (Value::Object(a), Value::Object(b)) => {
                let mut merged = a.clone();
                for (k, v) in b {
                    merged.insert(k.clone(), v.clone());
                }
                Ok(Value::Object(merged))
            }
            _ => Err(op_error(op, left, right)),
        },
        BinaryOp::Divide => match (left, right) {
            (Value::Number(a), Value::Number(b)) => {
                if b.as_f64() == Some(0.0) {
                    return Err(EvalError::new("Division by zero"));
                }
                Ok(arith(a, b, |x, y| x / y))
            }
            (Value::String(a), Value::String(b)) => Ok(functions::split_string(a, b)),
            _ => Err(op_error(op, left, right)),
        },
        BinaryOp::Modulo => match (left, right) {
            (Value::Number(a), Value::Number(b)) => {
                let a = a.as_f64().unwrap_or(0.0) as i64;
                let b = b.as_f64().unwrap_or(0.0) as i64;
                if b == 0 {
                    return Err(EvalError::new("Modulo by zero"));
                }
                Ok(Value::from(a % b))
            }
            _ => Err(op_error(op, left, right)),
        },
    }
}

pub(super) fn add(left: &Value, right: &Value) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::Null, other) | (other, Value::Null) => Ok(other.clone()),
        (Value::Number(a), Value::Number(b)) => Ok(arith(a, b, |x, y| x + y)),
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        (Value::Array(a), Value::Array(b)) => {
            let mut joined = a.clone();
            joined.extend(b.iter().cloned());
            Ok(Value::Array(joined))
        }
        (Value::Object(a), Value::Object(b)) => {
            let mut merged = a.clone();
            for (k, v) in b {
                merged.insert(k.clone(), v.clone());
            }
            Ok(Value::Object(merged))
        }
        _ => Err(op_error(BinaryOp::Add, left, right)),
    }
}

fn arith(a: &serde_json::Number, b: &serde_json::Number, f: impl Fn(f64, f64) -> f64) -> Value {
    number(f(a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0)))
}

fn op_error(op: BinaryOp, left: &Value, right: &Value) -> EvalError {
    EvalError::new(format!(
        "{} ({}) and {} ({}) cannot be combined with '{}'",
        type_name(left),
        short(left),
        type_name(right),
        short(right),
        op
    ))
}

fn short(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() > 16 {
        format!("{}...", text.chars().take(13).collect::<String>())
    } else {
        text
    }
}

/// Number value, normalized to an integer when it has no fractional part.
pub(crate) fn number(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// `false` and `null` are falsy, everything else is truthy.
pub fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

pub(super) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// String form used by interpolation and `tostring`.
pub(super) fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

/// Total order: null < false < true < numbers < strings < arrays < objects.
pub(super) fn compare(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&y.as_f64().unwrap_or(0.0))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            let mut xk: Vec<&String> = x.keys().collect();
            let mut yk: Vec<&String> = y.keys().collect();
            xk.sort();
            yk.sort();
            let keys = xk.cmp(&yk);
            if keys != Ordering::Equal {
                return keys;
            }
            for k in xk {
                let ord = compare(&x[k.as_str()], &y[k.as_str()]);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        }
        _ => Ordering::Equal,
    }
}
