//! Syntax tree for mapping expressions.

use serde_json::Value;

/// A parsed expression. Every node produces a stream of zero or more values.
#[derive(Debug, Clone, PartialEq)]
pub enum Ast {
    /// `.`
    Identity,
    /// Constant value
    Literal(Value),
    /// String with `\(...)` interpolations
    Format(Vec<FormatPart>),
    /// `$name`
    Variable(String),
    /// `target.name` / `target."name"`
    Field { target: Box<Ast>, name: String },
    /// `target[index]`, index evaluated against the enclosing input
    Index { target: Box<Ast>, index: Box<Ast> },
    /// `target[from:to]`
    Slice {
        target: Box<Ast>,
        from: Option<Box<Ast>>,
        to: Option<Box<Ast>>,
    },
    /// `target[]`
    Iterate(Box<Ast>),
    /// `expr?`, errors become an empty stream
    Try(Box<Ast>),
    /// `[expr]`, or `[]` when `None`
    Array(Option<Box<Ast>>),
    /// `{key: value, ...}`
    Object(Vec<(ObjectKey, Option<Ast>)>),
    /// Unary minus
    Negate(Box<Ast>),
    Binary {
        op: BinaryOp,
        left: Box<Ast>,
        right: Box<Ast>,
    },
    And(Box<Ast>, Box<Ast>),
    Or(Box<Ast>, Box<Ast>),
    /// `left // right`
    Alternative(Box<Ast>, Box<Ast>),
    /// `left | right`
    Pipe(Box<Ast>, Box<Ast>),
    /// `left, right`
    Comma(Box<Ast>, Box<Ast>),
    If {
        branches: Vec<(Ast, Ast)>,
        otherwise: Option<Box<Ast>>,
    },
    /// Built-in function call
    Call { name: String, args: Vec<Ast> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormatPart {
    Text(String),
    Expr(Ast),
}

/// Key of an object construction entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKey {
    /// `name` or `"name"`; a missing value means `.name`
    Name(String),
    /// `$name`; a missing value means the variable itself
    Variable(String),
    /// `(expr)`
    Computed(Ast),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
        };
        write!(f, "{symbol}")
    }
}
