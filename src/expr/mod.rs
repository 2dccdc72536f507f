//! Mapping expression language.
//!
//! A jq-style filter language evaluated over raw JSON records. Expressions
//! are compiled once and evaluated many times; evaluation is pure apart from
//! read access to the environment (`$ENV`, `env`) and the clock (`now`).
//!
//! # Syntax
//!
//! ## Paths
//! - `.` - the input
//! - `.name`, `."quoted name"` - object field (null on missing field or null input)
//! - `.[n]`, `.[from:to]` - array index (negative from end) and slice
//! - `.[]` - iterate array elements or object values
//! - `expr?` - suppress errors
//!
//! ## Operators (lowest precedence first)
//! - `|` - pipe
//! - `,` - emit both
//! - `//` - alternative: left side unless it yields only `null`/`false`
//! - `or`, `and`
//! - `==`, `!=`, `<`, `<=`, `>`, `>=`
//! - `+`, `-` (numbers, string and array concatenation, object merge)
//! - `*`, `/`, `%`
//!
//! ## Construction
//! - `"text \(expr) text"` - string interpolation
//! - `[expr]` - collect outputs into an array
//! - `{key: expr, "key": expr, (expr): expr, key}` - object
//! - `if c then a elif d then b else e end`
//!
//! ## Built-in Functions
//! `length`, `keys`, `values`, `has(k)`, `map(f)`, `select(f)`, `first`,
//! `first(f)`, `last`, `add`, `not`, `empty`, `type`, `tostring`, `tonumber`,
//! `tojson`, `fromjson`, `ascii_downcase`, `ascii_upcase`, `split(s)`,
//! `join(s)`, `contains(x)`, `test(s)`, `startswith(s)`, `endswith(s)`,
//! `ltrimstr(s)`, `rtrimstr(s)`, `floor`, `sort`, `unique`, `to_entries`,
//! `from_entries`, `todate`, `fromdate`, `strftime(fmt)`, `now`, `env`.
//!
//! # Example
//!
//! ```rust
//! use catalog_sync::expr::{EvalContext, Expr};
//! use serde_json::json;
//!
//! let expr = Expr::compile(r#""\(.owner.login)/\(.name)""#).unwrap();
//! let record = json!({"name": "api", "owner": {"login": "acme"}});
//! let value = expr.eval_one(&record, &EvalContext::default()).unwrap();
//! assert_eq!(value, json!("acme/api"));
//! ```

pub mod ast;
pub mod eval;
pub mod functions;
pub mod lexer;
pub mod parser;


pub use ast::Ast;
pub use eval::{is_truthy, EvalContext, EvalError};
pub use parser::{ParseError, Parser};

use serde_json::Value;

/// Compiled expression, cheap to evaluate repeatedly.
#[derive(Debug, Clone)]
pub struct Expr {
    source: String,
    ast: Ast,
}

impl Expr {
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        let ast = Parser::parse(source)?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// All outputs of the expression.
    pub fn eval(&self, input: &Value, ctx: &EvalContext) -> Result<Vec<Value>, ExprError> {
        Ok(eval::eval(&self.ast, input, ctx)?)
    }

    /// First output, or `null` when the expression yields nothing.
    pub fn eval_one(&self, input: &Value, ctx: &EvalContext) -> Result<Value, ExprError> {
        Ok(self.eval(input, ctx)?.into_iter().next().unwrap_or(Value::Null))
    }

    /// Truthiness of the first output; an empty result is `false`.
    pub fn eval_bool(&self, input: &Value, ctx: &EvalContext) -> Result<bool, ExprError> {
        Ok(self
            .eval(input, ctx)?
            .first()
            .map(is_truthy)
            .unwrap_or(false))
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// Combined error type for expression compilation and evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprError {
    Parse(ParseError),
    Eval(EvalError),
}

impl std::fmt::Display for ExprError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExprError::Parse(e) => write!(f, "Parse error: {e}"),
            ExprError::Eval(e) => write!(f, "Evaluation error: {e}"),
        }
    }
}

impl std::error::Error for ExprError {}

impl From<ParseError> for ExprError {
    fn from(err: ParseError) -> Self {
        ExprError::Parse(err)
    }
}

impl From<EvalError> for ExprError {
    fn from(err: EvalError) -> Self {
        ExprError::Eval(err)
    }
}
