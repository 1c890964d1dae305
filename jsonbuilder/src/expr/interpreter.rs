//! Tree-walking interpreter for the expression language.
//!
//! Name resolution for a bare name: per-call bindings, then the columns of an
//! exposed row, then the base environment (globals and definitions), then the
//! builtin library. `@name` skips row columns. Callees skip row columns too, so
//! a column called `date` does not hide the `date()` builtin.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use log::debug;

use super::ast::{BinaryOp, CompareOp, Definition, Expr, UnaryOp};
use super::parser::{parse_definitions, parse_expression};
use super::{builtins, Bindings, Closure, Evaluator, Function};
use crate::error::{ExprError, ExprResult};
use crate::models::{Map, Value};
use crate::table::Column;

/// Nested function calls allowed before giving up. Each call costs several
/// evaluator frames, so this stays well inside a 2 MiB thread stack.
const MAX_CALL_DEPTH: usize = 64;

/// Largest string (bytes) or list (items) that `*` repetition may build.
const MAX_REPEAT_LEN: usize = 10_000_000;

/// A compiled expression and the source it came from.
#[derive(Debug, Clone)]
pub struct Program {
    source: String,
    expr: Arc<Expr>,
}

impl Program {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }
}

/// The shipped [`Evaluator`].
#[derive(Debug)]
pub struct Interpreter {
    globals: HashMap<String, Value>,
    depth: Cell<usize>,
}

impl Default for Interpreter {
    /// Interpreter whose `today` is the current local date.
    fn default() -> Self {
        Self::new(chrono::Local::now().date_naive())
    }
}

impl Interpreter {
    /// Create an interpreter with `today` bound to the given date.
    pub fn new(today: NaiveDate) -> Self {
        let mut globals = HashMap::new();
        globals.insert("today".to_string(), Value::Date(today));
        Self {
            globals,
            depth: Cell::new(0),
        }
    }

    /// Value in the base environment.
    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    /// Compile and run `source` in one go.
    pub fn eval(&self, source: &str, bindings: &Bindings) -> ExprResult<Value> {
        let program = self.compile(source)?;
        self.run(&program, bindings)
    }

    // -------------------------------------------------------------------------
    // Name resolution
    // -------------------------------------------------------------------------

    fn lookup(&self, name: &str, scope: &Bindings) -> ExprResult<Value> {
        if let Some(value) = scope.get(name).or_else(|| scope.column(name)) {
            return Ok(value.clone());
        }
        self.lookup_global(name, &Bindings::new())
    }

    fn lookup_global(&self, name: &str, scope: &Bindings) -> ExprResult<Value> {
        if let Some(value) = scope.get(name).or_else(|| self.globals.get(name)) {
            return Ok(value.clone());
        }
        if builtins::exists(name) {
            return Ok(Value::Function(Arc::new(Function::Builtin(name.to_string()))));
        }
        Err(ExprError::UnknownName(name.to_string()))
    }

    fn lookup_callable(&self, name: &str, scope: &Bindings) -> ExprResult<Value> {
        self.lookup_global(name, scope).map_err(|err| match err {
            ExprError::UnknownName(n) => ExprError::UnknownFunction(n),
            other => other,
        })
    }

    /// Whether `name` refers to something other than a builtin namespace.
    fn is_bound(&self, name: &str, scope: &Bindings) -> bool {
        scope.get(name).is_some() || scope.column(name).is_some() || self.globals.contains_key(name)
    }

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------

    /// Call a function value.
    pub(crate) fn call(
        &self,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> ExprResult<Value> {
        match callee {
            Value::Function(function) => self.call_function(function, args, kwargs),
            other => Err(ExprError::Type(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_function(
        &self,
        function: &Function,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> ExprResult<Value> {
        let depth = self.depth.get();
        if depth >= MAX_CALL_DEPTH {
            return Err(ExprError::RecursionLimit(MAX_CALL_DEPTH));
        }
        self.depth.set(depth + 1);
        let result = match function {
            Function::Builtin(name) => builtins::call(self, name, args, kwargs),
            Function::Closure(closure) => self.call_closure(closure, args, kwargs),
        };
        self.depth.set(depth);
        result
    }

    fn call_closure(
        &self,
        closure: &Closure,
        args: Vec<Value>,
        mut kwargs: Vec<(String, Value)>,
    ) -> ExprResult<Value> {
        let name = closure.name.as_deref().unwrap_or("<lambda>");
        let found = args.len() + kwargs.len();
        let arity = || {
            let required = closure.params.iter().filter(|p| p.default.is_none()).count();
            let expected = if required == closure.params.len() {
                required.to_string()
            } else {
                format!("{} to {}", required, closure.params.len())
            };
            ExprError::Arity {
                function: name.to_string(),
                expected,
                found,
            }
        };
        if args.len() > closure.params.len() {
            return Err(arity());
        }

        let mut scope = closure.captured.clone();
        let mut positional = args.into_iter();
        for param in &closure.params {
            let keyword = kwargs.iter().position(|(k, _)| *k == param.name);
            let value = match (positional.next(), keyword) {
                (Some(_), Some(_)) => {
                    return Err(ExprError::Type(format!(
                        "{}() got multiple values for argument '{}'",
                        name, param.name
                    )))
                }
                (Some(value), None) => value,
                (None, Some(pos)) => kwargs.remove(pos).1,
                (None, None) => match &param.default {
                    Some(default) => self.evaluate(default, &closure.captured)?,
                    None => return Err(arity()),
                },
            };
            scope.set(param.name.clone(), value);
        }
        if let Some((unexpected, _)) = kwargs.first() {
            return Err(ExprError::Type(format!(
                "{}() got an unexpected keyword argument '{}'",
                name, unexpected
            )));
        }

        self.evaluate(&closure.body, &scope)
    }

    fn eval_call(
        &self,
        callee: &Expr,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        scope: &Bindings,
    ) -> ExprResult<Value> {
        let args = args
            .iter()
            .map(|a| self.evaluate(a, scope))
            .collect::<ExprResult<Vec<_>>>()?;
        let kwargs = kwargs
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.evaluate(v, scope)?)))
            .collect::<ExprResult<Vec<_>>>()?;

        match callee {
            Expr::Name(name) => {
                let function = self.lookup_callable(name, scope)?;
                self.call(&function, args, kwargs)
            }
            Expr::Attr { object, name } => {
                // namespaced builtin: re.sub(...)
                if let Expr::Name(namespace) = object.as_ref() {
                    let qualified = format!("{}.{}", namespace, name);
                    if builtins::exists(&qualified) && !self.is_bound(namespace, scope) {
                        return self.call_function(&Function::Builtin(qualified), args, kwargs);
                    }
                }

                let target = self.evaluate(object, scope)?;
                if let Value::Map(map) = &target {
                    if let Some(stored @ Value::Function(_)) = map.get(name) {
                        return self.call(stored, args, kwargs);
                    }
                }

                // method sugar: a.f(b) is f(a, b)
                let method = self.lookup_callable(name, scope)?;
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(target);
                full.extend(args);
                self.call(&method, full, kwargs)
            }
            other => {
                let function = self.evaluate(other, scope)?;
                self.call(&function, args, kwargs)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    pub(crate) fn evaluate(&self, expr: &Expr, scope: &Bindings) -> ExprResult<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Name(name) => self.lookup(name, scope),
            Expr::Global(name) => self.lookup_global(name, scope),
            Expr::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| self.evaluate(item, scope))
                    .collect::<ExprResult<_>>()?,
            )),
            Expr::Dict(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    let key = match self.evaluate(key, scope)? {
                        Value::Str(s) => s,
                        other => other.to_string(),
                    };
                    map.insert(key, self.evaluate(value, scope)?);
                }
                Ok(Value::Map(map))
            }
            Expr::Attr { object, name } => {
                if let Expr::Name(namespace) = object.as_ref() {
                    let qualified = format!("{}.{}", namespace, name);
                    if builtins::exists(&qualified) && !self.is_bound(namespace, scope) {
                        return Ok(Value::Function(Arc::new(Function::Builtin(qualified))));
                    }
                }
                let target = self.evaluate(object, scope)?;
                attribute(target, name)
            }
            Expr::Index { object, index } => {
                let target = self.evaluate(object, scope)?;
                let index = self.evaluate(index, scope)?;
                subscript(target, index)
            }
            Expr::Call {
                callee,
                args,
                kwargs,
            } => self.eval_call(callee, args, kwargs, scope),
            Expr::Unary { op, operand } => {
                let value = self.evaluate(operand, scope)?;
                unary(*op, value)
            }
            Expr::Binary { op, left, right } => {
                let left = self.evaluate(left, scope)?;
                let right = self.evaluate(right, scope)?;
                binary(*op, left, right)
            }
            Expr::Compare { op, left, right } => {
                let left = self.evaluate(left, scope)?;
                let right = self.evaluate(right, scope)?;
                compare(*op, left, right)
            }
            Expr::And(left, right) => {
                let left = self.evaluate(left, scope)?;
                if !left.truthy()? {
                    return Ok(left);
                }
                self.evaluate(right, scope)
            }
            Expr::Or(left, right) => {
                let left = self.evaluate(left, scope)?;
                if left.truthy()? {
                    return Ok(left);
                }
                self.evaluate(right, scope)
            }
            Expr::IfElse {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.evaluate(condition, scope)?.truthy()? {
                    self.evaluate(then_branch, scope)
                } else {
                    self.evaluate(else_branch, scope)
                }
            }
            Expr::Lambda { params, body } => Ok(Value::Function(Arc::new(Function::Closure(
                Closure {
                    name: None,
                    params: params.clone(),
                    body: Arc::clone(body),
                    captured: scope.clone(),
                },
            )))),
        }
    }
}

impl Evaluator for Interpreter {
    type Program = Program;

    fn compile(&self, source: &str) -> ExprResult<Program> {
        let expr = parse_expression(source)?;
        Ok(Program {
            source: source.to_string(),
            expr: Arc::new(expr),
        })
    }

    fn run(&self, program: &Program, bindings: &Bindings) -> ExprResult<Value> {
        self.evaluate(&program.expr, bindings)
    }

    fn define(&mut self, source: &str) -> ExprResult<Vec<String>> {
        let definitions = parse_definitions(source)?;
        let mut names = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let name = definition.name().to_string();
            let value = match definition {
                Definition::Function { name, params, body } => {
                    Value::Function(Arc::new(Function::Closure(Closure {
                        name: Some(name),
                        params,
                        body,
                        captured: Bindings::new(),
                    })))
                }
                Definition::Assign { value, .. } => self.evaluate(&value, &Bindings::new())?,
            };
            debug!("Defined '{}'", name);
            self.globals.insert(name.clone(), value);
            names.push(name);
        }
        Ok(names)
    }

    fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }
}

// =============================================================================
// Operators
// =============================================================================

fn unsupported(op: impl std::fmt::Display, a: &Value, b: &Value) -> ExprError {
    ExprError::Type(format!(
        "unsupported operand types for {}: '{}' and '{}'",
        op,
        a.type_name(),
        b.type_name()
    ))
}

/// Apply `f` pairwise, broadcasting scalars against columns.
fn broadcast(
    left: Value,
    right: Value,
    f: impl Fn(Value, Value) -> ExprResult<Value>,
) -> ExprResult<Value> {
    match (left, right) {
        (Value::Column(a), Value::Column(b)) => {
            if a.len() != b.len() {
                return Err(ExprError::Type(format!(
                    "columns '{}' ({}) and '{}' ({}) differ in length",
                    a.name,
                    a.len(),
                    b.name,
                    b.len()
                )));
            }
            let values = a
                .values
                .into_iter()
                .zip(b.values)
                .map(|(x, y)| f(x, y))
                .collect::<ExprResult<_>>()?;
            Ok(Value::Column(Column::new(a.name, values)))
        }
        (Value::Column(a), b) => {
            let values = a
                .values
                .into_iter()
                .map(|x| f(x, b.clone()))
                .collect::<ExprResult<_>>()?;
            Ok(Value::Column(Column::new(a.name, values)))
        }
        (a, Value::Column(b)) => {
            let values = b
                .values
                .into_iter()
                .map(|y| f(a.clone(), y))
                .collect::<ExprResult<_>>()?;
            Ok(Value::Column(Column::new(b.name, values)))
        }
        (a, b) => f(a, b),
    }
}

fn unary(op: UnaryOp, value: Value) -> ExprResult<Value> {
    if let Value::Column(column) = value {
        let values = column
            .values
            .into_iter()
            .map(|v| unary(op, v))
            .collect::<ExprResult<_>>()?;
        return Ok(Value::Column(Column::new(column.name, values)));
    }

    match (op, value) {
        (UnaryOp::Not, v) => Ok(Value::Bool(!v.truthy()?)),
        (_, Value::Null) => Ok(Value::Null),
        (UnaryOp::Neg, Value::Int(i)) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| ExprError::Arithmetic("integer overflow".to_string())),
        (UnaryOp::Neg, Value::Bool(b)) => Ok(Value::Int(-(b as i64))),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, Value::Delta(d)) => d.negate().map(Value::Delta),
        (UnaryOp::Pos, v @ (Value::Int(_) | Value::Float(_) | Value::Delta(_))) => Ok(v),
        (UnaryOp::Pos, Value::Bool(b)) => Ok(Value::Int(b as i64)),
        (UnaryOp::Invert, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Invert, Value::Int(i)) => Ok(Value::Int(!i)),
        (op, v) => Err(ExprError::Type(format!(
            "bad operand type for unary {}: '{}'",
            match op {
                UnaryOp::Neg => "-",
                UnaryOp::Pos => "+",
                UnaryOp::Invert => "~",
                UnaryOp::Not => "not",
            },
            v.type_name()
        ))),
    }
}

/// Negative counts repeat zero times; results past [`MAX_REPEAT_LEN`] fail.
fn repeat_count(len: usize, n: i64) -> ExprResult<usize> {
    let count = usize::try_from(n.max(0)).unwrap_or(usize::MAX);
    if len == 0 {
        return Ok(0);
    }
    match len.checked_mul(count) {
        Some(total) if total <= MAX_REPEAT_LEN => Ok(count),
        _ => Err(ExprError::Arithmetic(format!(
            "repetition by {} exceeds {} elements",
            n, MAX_REPEAT_LEN
        ))),
    }
}

pub(crate) fn binary(op: BinaryOp, left: Value, right: Value) -> ExprResult<Value> {
    broadcast(left, right, |a, b| scalar_binary(op, a, b))
}

fn scalar_binary(op: BinaryOp, a: Value, b: Value) -> ExprResult<Value> {
    use BinaryOp::*;

    if matches!(op, BitAnd | BitOr) {
        return match (&a, &b) {
            (Value::Int(x), Value::Int(y)) => Ok(Value::Int(if op == BitAnd { x & y } else { x | y })),
            (Value::Bool(_) | Value::Null, Value::Bool(_) | Value::Null) => {
                let (x, y) = (a.truthy()?, b.truthy()?);
                Ok(Value::Bool(if op == BitAnd { x && y } else { x || y }))
            }
            _ => Err(unsupported(op, &a, &b)),
        };
    }

    match (op, a, b) {
        (_, Value::Null, _) | (_, _, Value::Null) => Ok(Value::Null),
        (Add, Value::Str(x), Value::Str(y)) => Ok(Value::Str(x + &y)),
        (Mul, Value::Str(s), Value::Int(n)) | (Mul, Value::Int(n), Value::Str(s)) => {
            let count = repeat_count(s.len(), n)?;
            Ok(Value::Str(s.repeat(count)))
        }
        (Add, Value::List(mut x), Value::List(y)) => {
            x.extend(y);
            Ok(Value::List(x))
        }
        (Mul, Value::List(items), Value::Int(n)) | (Mul, Value::Int(n), Value::List(items)) => {
            let count = repeat_count(items.len(), n)?;
            Ok(Value::List(
                std::iter::repeat(items).take(count).flatten().collect(),
            ))
        }
        (Add, Value::Date(d), Value::Delta(delta)) | (Add, Value::Delta(delta), Value::Date(d)) => {
            delta.apply(d).map(Value::Date)
        }
        (Sub, Value::Date(d), Value::Delta(delta)) => delta.negate()?.apply(d).map(Value::Date),
        (Sub, Value::Date(x), Value::Date(y)) => Ok(Value::Int((x - y).num_days())),
        (Add, Value::Delta(x), Value::Delta(y)) => x.plus(y).map(Value::Delta),
        (Sub, Value::Delta(x), Value::Delta(y)) => x.plus(y.negate()?).map(Value::Delta),
        (Mul, Value::Delta(d), Value::Int(n)) | (Mul, Value::Int(n), Value::Delta(d)) => {
            d.scale(n).map(Value::Delta)
        }
        (op, a, b) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) if !matches!(a, Value::Float(_)) && !matches!(b, Value::Float(_)) => {
                int_binary(op, x, y)
            }
            _ => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => float_binary(op, x, y),
                _ => Err(unsupported(op, &a, &b)),
            },
        },
    }
}

fn int_binary(op: BinaryOp, x: i64, y: i64) -> ExprResult<Value> {
    let overflow = || ExprError::Arithmetic("integer overflow".to_string());
    let zero = || ExprError::Arithmetic("division by zero".to_string());
    match op {
        BinaryOp::Add => x.checked_add(y).map(Value::Int).ok_or_else(overflow),
        BinaryOp::Sub => x.checked_sub(y).map(Value::Int).ok_or_else(overflow),
        BinaryOp::Mul => x.checked_mul(y).map(Value::Int).ok_or_else(overflow),
        BinaryOp::Div => {
            if y == 0 {
                return Err(zero());
            }
            Ok(Value::Float(x as f64 / y as f64))
        }
        BinaryOp::FloorDiv => {
            if y == 0 {
                return Err(zero());
            }
            let q = x.checked_div(y).ok_or_else(overflow)?;
            let adjust = x % y != 0 && ((x < 0) != (y < 0));
            Ok(Value::Int(if adjust { q - 1 } else { q }))
        }
        BinaryOp::Mod => {
            if y == 0 {
                return Err(zero());
            }
            let r = x.checked_rem(y).ok_or_else(overflow)?;
            Ok(Value::Int(if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r }))
        }
        BinaryOp::Pow => {
            if y < 0 {
                return Ok(Value::Float((x as f64).powf(y as f64)));
            }
            let exp = u32::try_from(y).map_err(|_| overflow())?;
            x.checked_pow(exp).map(Value::Int).ok_or_else(overflow)
        }
        BinaryOp::BitAnd | BinaryOp::BitOr => Err(ExprError::Type(format!(
            "unsupported operand types for {}: 'int' and 'int'",
            op
        ))),
    }
}

fn float_binary(op: BinaryOp, x: f64, y: f64) -> ExprResult<Value> {
    let zero = || ExprError::Arithmetic("float division by zero".to_string());
    let value = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => {
            if y == 0.0 {
                return Err(zero());
            }
            x / y
        }
        BinaryOp::FloorDiv => {
            if y == 0.0 {
                return Err(zero());
            }
            (x / y).floor()
        }
        BinaryOp::Mod => {
            if y == 0.0 {
                return Err(zero());
            }
            x - y * (x / y).floor()
        }
        BinaryOp::Pow => x.powf(y),
        BinaryOp::BitAnd | BinaryOp::BitOr => {
            return Err(ExprError::Type(format!(
                "unsupported operand types for {}: 'float' and 'float'",
                op
            )))
        }
    };
    Ok(Value::Float(value))
}

pub(crate) fn compare(op: CompareOp, left: Value, right: Value) -> ExprResult<Value> {
    match op {
        CompareOp::In | CompareOp::NotIn => {
            let negate = op == CompareOp::NotIn;
            match left {
                Value::Column(_) if !matches!(right, Value::Column(_)) => {
                    broadcast(left, Value::Null, |item, _| {
                        Ok(Value::Bool(contains(&right, &item)? != negate))
                    })
                }
                item => Ok(Value::Bool(contains(&right, &item)? != negate)),
            }
        }
        _ => broadcast(left, right, |a, b| {
            let result = match op {
                CompareOp::Eq => a == b,
                CompareOp::Ne => a != b,
                _ => match a.compare(&b)? {
                    None => false,
                    Some(ord) => match op {
                        CompareOp::Lt => ord.is_lt(),
                        CompareOp::Le => ord.is_le(),
                        CompareOp::Gt => ord.is_gt(),
                        _ => ord.is_ge(),
                    },
                },
            };
            Ok(Value::Bool(result))
        }),
    }
}

/// Membership test behind `in`.
pub(crate) fn contains(container: &Value, item: &Value) -> ExprResult<bool> {
    match container {
        Value::Str(s) => match item {
            Value::Str(sub) => Ok(s.contains(sub.as_str())),
            other => Err(ExprError::Type(format!(
                "'in <str>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => Ok(items.contains(item)),
        Value::Column(column) => Ok(column.values.contains(item)),
        Value::Map(map) => Ok(item.as_str().is_some_and(|k| map.contains_key(k))),
        Value::Row(row) => Ok(item.as_str().is_some_and(|k| row.get(k).is_some())),
        Value::Table(table) => Ok(item.as_str().is_some_and(|k| table.has_column(k))),
        other => Err(ExprError::Type(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

// =============================================================================
// Attribute and subscript access
// =============================================================================

pub(crate) fn attribute(target: Value, name: &str) -> ExprResult<Value> {
    let missing = |target: &Value| {
        ExprError::Lookup(format!(
            "'{}' object has no attribute '{}'",
            target.type_name(),
            name
        ))
    };
    match &target {
        Value::Row(row) => match row.get(name) {
            Some(value) => Ok(value.clone()),
            None if name == "Index" || name == "index" => Ok(Value::Int(row.index() as i64)),
            None => Err(ExprError::Lookup(format!("row has no column '{}'", name))),
        },
        Value::Map(map) => map
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::Lookup(format!("key '{}' not found", name))),
        Value::Table(table) => {
            if table.has_column(name) {
                return Ok(Value::Column(table.column(name)?));
            }
            match name {
                "columns" => Ok(Value::List(
                    table.columns().iter().map(|c| Value::from(c.as_str())).collect(),
                )),
                _ => Err(ExprError::Lookup(format!("table has no column '{}'", name))),
            }
        }
        Value::Column(column) => match name {
            "name" => Ok(Value::from(column.name.as_str())),
            "values" => Ok(Value::List(column.values.clone())),
            _ => Err(missing(&target)),
        },
        Value::Date(date) => {
            use chrono::Datelike;
            match name {
                "year" => Ok(Value::Int(date.year() as i64)),
                "month" => Ok(Value::Int(date.month() as i64)),
                "day" => Ok(Value::Int(date.day() as i64)),
                _ => Err(missing(&target)),
            }
        }
        Value::Delta(delta) => match name {
            "years" => Ok(Value::Int(delta.years)),
            "months" => Ok(Value::Int(delta.months)),
            "weeks" => Ok(Value::Int(delta.weeks)),
            "days" => Ok(Value::Int(delta.days)),
            _ => Err(missing(&target)),
        },
        _ => Err(missing(&target)),
    }
}

/// Index (negative counts from the end) into a sequence of `len` items.
fn position(index: i64, len: usize) -> ExprResult<usize> {
    let resolved = if index < 0 {
        len as i64 + index
    } else {
        index
    };
    if resolved < 0 || resolved >= len as i64 {
        return Err(ExprError::Lookup(format!("index {} out of range", index)));
    }
    Ok(resolved as usize)
}

pub(crate) fn subscript(target: Value, index: Value) -> ExprResult<Value> {
    match (target, index) {
        (Value::List(items), Value::Int(i)) => Ok(items[position(i, items.len())?].clone()),
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::Str(chars[position(i, chars.len())?].to_string()))
        }
        (Value::Column(column), Value::Int(i)) => {
            Ok(column.values[position(i, column.len())?].clone())
        }
        (Value::Map(map), key) => {
            let key = match key {
                Value::Str(s) => s,
                other => other.to_string(),
            };
            map.get(&key)
                .cloned()
                .ok_or_else(|| ExprError::Lookup(format!("key '{}' not found", key)))
        }
        (Value::Row(row), Value::Str(name)) => row
            .get(&name)
            .cloned()
            .ok_or_else(|| ExprError::Lookup(format!("row has no column '{}'", name))),
        (Value::Row(row), Value::Int(i)) => Ok(row.cells()[position(i, row.cells().len())?].clone()),
        (Value::Table(table), Value::Str(name)) => Ok(Value::Column(table.column(&name)?)),
        (Value::Table(table), Value::Int(i)) => {
            Ok(Value::Row(table.rows()[position(i, table.len())?].clone()))
        }
        (Value::Table(table), Value::List(names)) => {
            let names = names
                .iter()
                .map(|n| match n {
                    Value::Str(s) => Ok(s.clone()),
                    other => Err(ExprError::Type(format!(
                        "column names must be str, not {}",
                        other.type_name()
                    ))),
                })
                .collect::<ExprResult<Vec<_>>>()?;
            Ok(Value::Table(table.select(&names)?))
        }
        (Value::Table(table), Value::Column(mask)) => {
            Ok(Value::Table(builtins::mask_rows(&table, &mask)?))
        }
        (target, index) => Err(ExprError::Type(format!(
            "'{}' object is not subscriptable with '{}'",
            target.type_name(),
            index.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Delta;
    use crate::table::Table;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn eval(source: &str) -> Value {
        Interpreter::new(ymd(2020, 1, 15))
            .eval(source, &Bindings::new())
            .unwrap()
    }

    fn eval_err(source: &str) -> ExprError {
        Interpreter::new(ymd(2020, 1, 15))
            .eval(source, &Bindings::new())
            .unwrap_err()
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("1 + 2 * 3"), Value::Int(7));
        assert_eq!(eval("7 / 2"), Value::Float(3.5));
        assert_eq!(eval("-7 // 2"), Value::Int(-4));
        assert_eq!(eval("-7 % 3"), Value::Int(2));
        assert_eq!(eval("2 ** 10"), Value::Int(1024));
        assert_eq!(eval("-2 ** 2"), Value::Int(-4));
        assert_eq!(eval("1.5 * 2"), Value::Float(3.0));
        assert_eq!(eval("'ab' + 'c'"), Value::from("abc"));
        assert_eq!(eval("None + 1"), Value::Null);
        assert!(matches!(eval_err("1 / 0"), ExprError::Arithmetic(_)));
        assert!(matches!(eval_err("'a' - 1"), ExprError::Type(_)));
    }

    #[test]
    fn test_logic_returns_operand() {
        assert_eq!(eval("0 or 'x'"), Value::from("x"));
        assert_eq!(eval("'' and 1"), Value::from(""));
        assert_eq!(eval("not 0"), Value::Bool(true));
        assert_eq!(eval("1 if 2 > 3 else 4"), Value::Int(4));
        assert_eq!(eval("1 < 2 <= 2"), Value::Bool(true));
        assert_eq!(eval("'b' in ['a', 'b']"), Value::Bool(true));
        assert_eq!(eval("'z' not in 'abc'"), Value::Bool(true));
        assert_eq!(eval("None < 1"), Value::Bool(false));
    }

    #[test]
    fn test_dates_and_deltas() {
        assert_eq!(eval("today"), Value::Date(ymd(2020, 1, 15)));
        assert_eq!(eval("today + delta('1m')"), Value::Date(ymd(2020, 2, 15)));
        assert_eq!(eval("@today - delta('o/n')"), Value::Date(ymd(2020, 1, 14)));
        assert_eq!(eval("date('2020-03-01') - today"), Value::Int(46));
        assert_eq!(eval("delta('1m') * 3"), Value::Delta(Delta::months(3)));
        assert_eq!(eval("today.year"), Value::Int(2020));
    }

    #[test]
    fn test_names_resolve_in_order() {
        let table = Table::new(
            vec!["ccy".into(), "x".into()],
            vec![vec!["USD".into(), Value::Int(1)]],
        )
        .unwrap();
        let row = table.rows()[0].clone();
        let interp = Interpreter::default();
        let b = Bindings::new()
            .with("x", Value::Int(10))
            .with("r", Value::Row(row.clone()))
            .expose_row(row);
        assert_eq!(interp.eval("x", &b).unwrap(), Value::Int(10));
        assert_eq!(interp.eval("ccy", &b).unwrap(), Value::from("USD"));
        assert_eq!(interp.eval("r.x + r['x']", &b).unwrap(), Value::Int(2));
        assert_eq!(interp.eval("r.Index", &b).unwrap(), Value::Int(1));
        assert!(matches!(
            interp.eval("@ccy", &b),
            Err(ExprError::UnknownName(n)) if n == "ccy"
        ));
        assert!(matches!(
            interp.eval("nope", &b),
            Err(ExprError::UnknownName(_))
        ));
    }

    #[test]
    fn test_definitions_and_closures() {
        let mut interp = Interpreter::default();
        let names = interp
            .define("def scale(v, f=100): return v * f\nbase = 2; def fact(n): 1 if n <= 1 else n * fact(n - 1)")
            .unwrap();
        assert_eq!(names, vec!["scale", "base", "fact"]);
        let b = Bindings::new();
        assert_eq!(interp.eval("scale(0.5)", &b).unwrap(), Value::Float(50.0));
        assert_eq!(interp.eval("scale(3, f=base)", &b).unwrap(), Value::Int(6));
        assert_eq!(interp.eval("fact(5)", &b).unwrap(), Value::Int(120));
        assert_eq!(
            interp.eval("(lambda a: a + k)(1)", &Bindings::new().with("k", Value::Int(5))).unwrap(),
            Value::Int(6)
        );
        assert!(matches!(
            interp.eval("scale()", &b),
            Err(ExprError::Arity { .. })
        ));
        assert!(matches!(
            interp.eval("scale(1, g=2)", &b),
            Err(ExprError::Type(_))
        ));
    }

    #[test]
    fn test_runaway_recursion_is_an_error() {
        let mut interp = Interpreter::default();
        interp.define("def loop(n): loop(n + 1)").unwrap();
        assert!(matches!(
            interp.eval("loop(0)", &Bindings::new()),
            Err(ExprError::RecursionLimit(MAX_CALL_DEPTH))
        ));
        // the counter unwinds, so later calls start from zero again
        interp.define("def fact(n): 1 if n <= 1 else n * fact(n - 1)").unwrap();
        assert_eq!(
            interp.eval("fact(20)", &Bindings::new()).unwrap(),
            Value::Int(2_432_902_008_176_640_000)
        );
    }

    #[test]
    fn test_delta_overflow_is_an_error() {
        assert!(matches!(
            eval_err("today + delta('1y') * 1000000000000000000"),
            ExprError::Arithmetic(_)
        ));
        assert!(matches!(
            eval_err("delta('1d') * 9223372036854775807 * 2"),
            ExprError::Arithmetic(_)
        ));
        assert!(matches!(
            eval_err("delta('999999999999999999y')"),
            ExprError::InvalidDeltaString(_)
        ));
        assert_eq!(eval("delta('1m') - delta('1m')"), Value::Delta(Delta::default()));
        assert_eq!(eval("-delta('2w')"), Value::Delta(Delta::days(-14)));
    }

    #[test]
    fn test_repetition_is_bounded() {
        assert_eq!(eval("'ab' * 3"), Value::from("ababab"));
        assert_eq!(eval("'ab' * -1"), Value::from(""));
        assert_eq!(eval("2 * [0]"), Value::List(vec![Value::Int(0), Value::Int(0)]));
        assert!(matches!(eval_err("'a' * 100000000000"), ExprError::Arithmetic(_)));
        assert!(matches!(
            eval_err("[1, 2] * 9223372036854775807"),
            ExprError::Arithmetic(_)
        ));
        // an empty list repeats to nothing however large the count
        assert_eq!(eval("[] * 9223372036854775807"), Value::List(vec![]));
    }

    #[test]
    fn test_method_sugar_and_namespace() {
        assert_eq!(eval("'abc'.upper()"), Value::from("ABC"));
        assert_eq!(eval("', '.join(['a', 'b'])"), Value::from("a, b"));
        assert_eq!(eval("re.sub('[0-9]', '#', 'a1b2')"), Value::from("a#b#"));
        assert!(matches!(eval_err("missing(1)"), ExprError::UnknownFunction(_)));
        assert!(matches!(eval_err("(1)(2)"), ExprError::Type(_)));
    }

    #[test]
    fn test_subscripts() {
        assert_eq!(eval("[1, 2, 3][-1]"), Value::Int(3));
        assert_eq!(eval("{'a': 1}['a']"), Value::Int(1));
        assert_eq!(eval("'abc'[1]"), Value::from("b"));
        assert!(matches!(eval_err("[1][5]"), ExprError::Lookup(_)));
        assert!(matches!(eval_err("{'a': 1}['b']"), ExprError::Lookup(_)));
    }

    #[test]
    fn test_column_broadcasting() {
        let table = Table::new(
            vec!["rate".into(), "ccy".into()],
            vec![
                vec![Value::Float(1.5), "USD".into()],
                vec![Value::Float(0.5), "EUR".into()],
            ],
        )
        .unwrap();
        let interp = Interpreter::default();
        let b = Bindings::new().with("df", Value::Table(table));
        let scaled = interp.eval("df.rate * 100", &b).unwrap();
        assert_eq!(
            scaled,
            Value::Column(Column::new("rate", vec![Value::Float(150.0), Value::Float(50.0)]))
        );
        let mask = interp.eval("(df.rate > 1) & (df.ccy == 'USD')", &b).unwrap();
        assert_eq!(
            mask,
            Value::Column(Column::new("rate", vec![Value::Bool(true), Value::Bool(false)]))
        );
        let kept = interp.eval("len(df[df.ccy in ['EUR']])", &b).unwrap();
        assert_eq!(kept, Value::Int(1));
        assert!(matches!(
            interp.eval("df.rate if df.rate else 0", &b),
            Err(ExprError::Type(_))
        ));
    }
}
