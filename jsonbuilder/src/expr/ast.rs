//! Syntax tree for filter, transmute and transform expressions.

use std::fmt;
use std::sync::Arc;

use crate::models::Value;

/// Binary operators, arithmetic and element-wise logical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    /// `&`
    BitAnd,
    /// `|`
    BitOr,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
        };
        write!(f, "{}", s)
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
        };
        write!(f, "{}", s)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `+x`
    Pos,
    /// `not x` / `!x`
    Not,
    /// `~x`, element-wise negation
    Invert,
}

/// A function or lambda parameter, with an optional default.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

/// An expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),

    /// Bare or backtick-quoted name.
    Name(String),

    /// `@name`: per-call bindings and the base environment only.
    Global(String),

    List(Vec<Expr>),

    Dict(Vec<(Expr, Expr)>),

    /// `object.name`
    Attr { object: Box<Expr>, name: String },

    /// `object[index]`
    Index { object: Box<Expr>, index: Box<Expr> },

    /// `callee(args, key=value)`
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },

    Unary { op: UnaryOp, operand: Box<Expr> },

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// Short-circuit `and`; yields the deciding operand.
    And(Box<Expr>, Box<Expr>),

    /// Short-circuit `or`; yields the deciding operand.
    Or(Box<Expr>, Box<Expr>),

    /// `then_branch if condition else else_branch`
    IfElse {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },

    Lambda { params: Vec<Param>, body: Arc<Expr> },
}

/// One entry of a definition source: `def name(params): expr` or `name = expr`.
#[derive(Debug, Clone, PartialEq)]
pub enum Definition {
    Function {
        name: String,
        params: Vec<Param>,
        body: Arc<Expr>,
    },
    Assign { name: String, value: Expr },
}

impl Definition {
    pub fn name(&self) -> &str {
        match self {
            Definition::Function { name, .. } | Definition::Assign { name, .. } => name,
        }
    }
}
