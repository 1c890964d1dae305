//! Expression evaluation for filters, transmutes and table transforms.
//!
//! The builder only talks to the [`Evaluator`] trait. [`Interpreter`] is the
//! shipped implementation: a small expression language with
//! a builtin library for strings, dates, deltas, columns and tables.
//!
//! # Example
//!
//! ```
//! use jsonbuilder::expr::{Bindings, Evaluator, Interpreter};
//! use jsonbuilder::models::Value;
//!
//! let interp = Interpreter::default();
//! let program = interp.compile("x * 2 if x > 1 else x").unwrap();
//! let bindings = Bindings::new().with("x", Value::Int(3));
//! assert_eq!(interp.run(&program, &bindings).unwrap(), Value::Int(6));
//! ```

pub mod ast;
mod builtins;
pub mod interpreter;
pub mod parser;

use std::fmt;
use std::sync::Arc;

use crate::error::ExprResult;
use crate::models::Value;
use crate::table::Row;

pub use ast::Expr;
pub use builtins::parse_date;
pub use interpreter::{Interpreter, Program};

/// Compiles expression sources once and runs them against per-call bindings.
pub trait Evaluator {
    /// A compiled expression.
    type Program: Clone + fmt::Debug;

    /// Parse `source` into a reusable program.
    fn compile(&self, source: &str) -> ExprResult<Self::Program>;

    /// Run `program` with `bindings` layered over the base environment.
    fn run(&self, program: &Self::Program, bindings: &Bindings) -> ExprResult<Value>;

    /// Install definitions (`def f(x): ...`, `name = expr`) into the base
    /// environment; returns the defined names.
    fn define(&mut self, source: &str) -> ExprResult<Vec<String>>;

    /// Set a constant in the base environment.
    fn set_global(&mut self, name: &str, value: Value);
}

/// Per-call names visible to an expression.
///
/// Later bindings shadow earlier ones. When a row is exposed, its columns are
/// visible as bare names after the explicit bindings.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    vars: Vec<(String, Value)>,
    row: Option<Row>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Bindings::set`].
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.push((name.into(), value));
    }

    /// Make the columns of `row` visible as bare names.
    pub fn expose_row(mut self, row: Row) -> Self {
        self.row = Some(row);
        self
    }

    /// Explicit binding for `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Column of the exposed row.
    pub fn column(&self, name: &str) -> Option<&Value> {
        self.row.as_ref().and_then(|row| row.get(name))
    }

    pub fn row(&self) -> Option<&Row> {
        self.row.as_ref()
    }
}

/// A callable value.
#[derive(Debug)]
pub enum Function {
    /// Library function, by name (`upper`, `re.sub`, ...).
    Builtin(String),
    /// `def` or `lambda`.
    Closure(Closure),
}

/// User-defined function with the bindings visible where it was created.
#[derive(Debug)]
pub struct Closure {
    pub name: Option<String>,
    pub params: Vec<ast::Param>,
    pub body: Arc<Expr>,
    pub captured: Bindings,
}

impl Function {
    pub fn name(&self) -> &str {
        match self {
            Function::Builtin(name) => name,
            Function::Closure(closure) => closure.name.as_deref().unwrap_or("<lambda>"),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Function::Builtin(name) => write!(f, "<built-in function {}>", name),
            Function::Closure(_) => write!(f, "<function {}>", self.name()),
        }
    }
}
