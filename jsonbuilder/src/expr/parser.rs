//! Pest front end for the expression language.
//!
//! The grammar lives in `expression.pest`. Precedence, loosest first:
//! lambda, `x if c else y`, `or`, `and`, `not`, comparisons, `|`, `&`,
//! `+ -`, `* / // %`, unary `- + ~`, `**`, then postfix `.attr`, `[i]` and
//! calls. This module walks the parse tree into [`Expr`] and [`Definition`].

use std::sync::Arc;

use pest::error::InputLocation;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use super::ast::{BinaryOp, CompareOp, Definition, Expr, Param, UnaryOp};
use crate::error::{ExprError, ExprResult};
use crate::models::Value;

#[derive(Parser)]
#[grammar = "src/expr/expression.pest"]
struct ExpressionParser;

/// Deepest bracket and prefix-operator nesting accepted.
pub const MAX_NESTING: usize = 32;

/// Parse a single expression; the whole source must be consumed.
pub fn parse_expression(source: &str) -> ExprResult<Expr> {
    check_nesting(source)?;
    let mut pairs = ExpressionParser::parse(Rule::complete_expr, source).map_err(syntax_error)?;
    let complete = next_pair(&mut pairs, 0)?;
    let expr = next_pair(&mut complete.into_inner(), 0)?;
    build_expr(expr)
}

/// Parse a sequence of `def name(params): [return] expr` and `name = expr`
/// definitions, optionally separated by `;`.
pub fn parse_definitions(source: &str) -> ExprResult<Vec<Definition>> {
    check_nesting(source)?;
    let mut pairs = ExpressionParser::parse(Rule::definitions, source).map_err(syntax_error)?;
    let root = next_pair(&mut pairs, 0)?;
    root.into_inner()
        .filter(|pair| pair.as_rule() != Rule::EOI)
        .map(build_definition)
        .collect()
}

/// The generated parser recurses once per grammar level, so deep nesting is
/// refused before parsing.
fn check_nesting(source: &str) -> ExprResult<()> {
    let mut depth = 0usize;
    let mut prefix_run = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = source.char_indices();

    while let Some((offset, c)) = chars.next() {
        if let Some(q) = quote {
            if c == '\\' && q != '`' {
                chars.next();
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '#' => {
                for (_, c) in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
        prefix_run = match c {
            '-' | '+' | '~' | '!' => prefix_run + 1,
            c if c.is_whitespace() => prefix_run,
            _ => 0,
        };
        if depth + prefix_run > MAX_NESTING {
            return Err(ExprError::Syntax {
                offset,
                message: format!("expression nested deeper than {} levels", MAX_NESTING),
            });
        }
    }
    Ok(())
}

fn syntax_error(error: pest::error::Error<Rule>) -> ExprError {
    let error = error.renamed_rules(describe_rule);
    let offset = match error.location {
        InputLocation::Pos(pos) => pos,
        InputLocation::Span((start, _)) => start,
    };
    ExprError::Syntax {
        offset,
        message: error.variant.message().into_owned(),
    }
}

fn describe_rule(rule: &Rule) -> String {
    match rule {
        Rule::EOI => "end of input".to_string(),
        Rule::ident => "a name".to_string(),
        Rule::expression | Rule::ternary | Rule::atom => "an expression".to_string(),
        Rule::definitions | Rule::function_def | Rule::assignment => "a definition".to_string(),
        other => format!("{:?}", other),
    }
}

fn next_pair<'i>(
    pairs: &mut impl Iterator<Item = Pair<'i, Rule>>,
    offset: usize,
) -> ExprResult<Pair<'i, Rule>> {
    pairs.next().ok_or_else(|| ExprError::Syntax {
        offset,
        message: "incomplete expression".to_string(),
    })
}

fn unexpected(pair: &Pair<Rule>) -> ExprError {
    ExprError::Syntax {
        offset: pair.as_span().start(),
        message: format!("unexpected {:?}", pair.as_rule()),
    }
}

// -----------------------------------------------------------------------------
// Definitions
// -----------------------------------------------------------------------------

fn build_definition(pair: Pair<Rule>) -> ExprResult<Definition> {
    let offset = pair.as_span().start();
    match pair.as_rule() {
        Rule::function_def => {
            let mut name = None;
            let mut params = Vec::new();
            let mut body = None;
            for part in pair.into_inner() {
                match part.as_rule() {
                    Rule::kw_def | Rule::kw_return => {}
                    Rule::ident => name = Some(part.as_str().to_string()),
                    Rule::params => params = build_params(part)?,
                    _ => body = Some(build_expr(part)?),
                }
            }
            match (name, body) {
                (Some(name), Some(body)) => Ok(Definition::Function {
                    name,
                    params,
                    body: Arc::new(body),
                }),
                _ => Err(ExprError::Syntax {
                    offset,
                    message: "incomplete function definition".to_string(),
                }),
            }
        }
        Rule::assignment => {
            let mut parts = pair.into_inner();
            let name = next_pair(&mut parts, offset)?.as_str().to_string();
            let value = build_expr(next_pair(&mut parts, offset)?)?;
            Ok(Definition::Assign { name, value })
        }
        _ => Err(unexpected(&pair)),
    }
}

/// Comma-separated parameters with optional `= default`.
fn build_params(pair: Pair<Rule>) -> ExprResult<Vec<Param>> {
    let mut params: Vec<Param> = Vec::new();
    for param in pair.into_inner() {
        let offset = param.as_span().start();
        let mut parts = param.into_inner();
        let name = next_pair(&mut parts, offset)?.as_str().to_string();
        if params.iter().any(|p| p.name == name) {
            return Err(ExprError::Syntax {
                offset,
                message: format!("duplicate parameter '{}'", name),
            });
        }
        let default = parts.next().map(build_expr).transpose()?;
        params.push(Param { name, default });
    }
    Ok(params)
}

// -----------------------------------------------------------------------------
// Expressions
// -----------------------------------------------------------------------------

fn build_expr(pair: Pair<Rule>) -> ExprResult<Expr> {
    let offset = pair.as_span().start();
    match pair.as_rule() {
        Rule::expression => build_expr(next_pair(&mut pair.into_inner(), offset)?),
        Rule::lambda_expr => {
            let mut params = Vec::new();
            let mut body = None;
            for part in pair.into_inner() {
                match part.as_rule() {
                    Rule::kw_lambda => {}
                    Rule::params => params = build_params(part)?,
                    _ => body = Some(build_expr(part)?),
                }
            }
            let body = body.ok_or_else(|| ExprError::Syntax {
                offset,
                message: "lambda without a body".to_string(),
            })?;
            Ok(Expr::Lambda {
                params,
                body: Arc::new(body),
            })
        }
        Rule::ternary => {
            let mut parts = pair
                .into_inner()
                .filter(|p| !matches!(p.as_rule(), Rule::kw_if | Rule::kw_else));
            let then_branch = build_expr(next_pair(&mut parts, offset)?)?;
            match parts.next() {
                None => Ok(then_branch),
                Some(condition) => {
                    let condition = build_expr(condition)?;
                    let else_branch = build_expr(next_pair(&mut parts, offset)?)?;
                    Ok(Expr::IfElse {
                        condition: Box::new(condition),
                        then_branch: Box::new(then_branch),
                        else_branch: Box::new(else_branch),
                    })
                }
            }
        }
        Rule::or_test
        | Rule::and_test
        | Rule::bit_or
        | Rule::bit_and
        | Rule::arith
        | Rule::term => build_chain(pair),
        Rule::not_test => {
            let mut parts = pair.into_inner();
            let first = next_pair(&mut parts, offset)?;
            if first.as_rule() != Rule::not_op {
                return build_expr(first);
            }
            let operand = build_expr(next_pair(&mut parts, offset)?)?;
            Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            })
        }
        Rule::comparison => build_comparison(pair),
        Rule::factor => {
            let mut parts = pair.into_inner();
            let first = next_pair(&mut parts, offset)?;
            if first.as_rule() != Rule::unary_op {
                return build_expr(first);
            }
            let op = match first.as_str() {
                "-" => UnaryOp::Neg,
                "+" => UnaryOp::Pos,
                "~" => UnaryOp::Invert,
                _ => return Err(unexpected(&first)),
            };
            let operand = build_expr(next_pair(&mut parts, offset)?)?;
            Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            })
        }
        Rule::power => {
            let mut parts = pair.into_inner();
            let base = build_expr(next_pair(&mut parts, offset)?)?;
            match parts.next() {
                None => Ok(base),
                Some(_pow) => {
                    let exponent = build_expr(next_pair(&mut parts, offset)?)?;
                    Ok(binary(BinaryOp::Pow, base, exponent))
                }
            }
        }
        Rule::postfix => build_postfix(pair),
        Rule::atom => build_atom(pair),
        _ => Err(unexpected(&pair)),
    }
}

/// Left-associative `operand (op operand)*` levels.
fn build_chain(pair: Pair<Rule>) -> ExprResult<Expr> {
    let offset = pair.as_span().start();
    let mut pairs = pair.into_inner();
    let mut expr = build_expr(next_pair(&mut pairs, offset)?)?;

    while let Some(op_pair) = pairs.next() {
        let right = build_expr(next_pair(&mut pairs, op_pair.as_span().start())?)?;
        expr = match op_pair.as_rule() {
            Rule::or_op => Expr::Or(Box::new(expr), Box::new(right)),
            Rule::and_op => Expr::And(Box::new(expr), Box::new(right)),
            _ => {
                let op = match op_pair.as_str() {
                    "|" => BinaryOp::BitOr,
                    "&" => BinaryOp::BitAnd,
                    "+" => BinaryOp::Add,
                    "-" => BinaryOp::Sub,
                    "*" => BinaryOp::Mul,
                    "/" => BinaryOp::Div,
                    "//" => BinaryOp::FloorDiv,
                    "%" => BinaryOp::Mod,
                    _ => return Err(unexpected(&op_pair)),
                };
                binary(op, expr, right)
            }
        };
    }
    Ok(expr)
}

/// Chained comparisons `a < b < c` become `a < b and b < c`.
fn build_comparison(pair: Pair<Rule>) -> ExprResult<Expr> {
    let offset = pair.as_span().start();
    let mut pairs = pair.into_inner();
    let mut left = build_expr(next_pair(&mut pairs, offset)?)?;
    let mut result: Option<Expr> = None;

    while let Some(op_pair) = pairs.next() {
        let op_offset = op_pair.as_span().start();
        let op_rule = next_pair(&mut op_pair.into_inner(), op_offset)?;
        let op = match op_rule.as_rule() {
            Rule::eq_op => CompareOp::Eq,
            Rule::ne_op => CompareOp::Ne,
            Rule::lt_op => CompareOp::Lt,
            Rule::le_op => CompareOp::Le,
            Rule::gt_op => CompareOp::Gt,
            Rule::ge_op => CompareOp::Ge,
            Rule::in_op => CompareOp::In,
            Rule::not_in_op => CompareOp::NotIn,
            _ => return Err(unexpected(&op_rule)),
        };
        let right = build_expr(next_pair(&mut pairs, op_offset)?)?;
        let link = Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right.clone()),
        };
        result = Some(match result {
            None => link,
            Some(prev) => Expr::And(Box::new(prev), Box::new(link)),
        });
        left = right;
    }
    Ok(result.unwrap_or(left))
}

fn build_postfix(pair: Pair<Rule>) -> ExprResult<Expr> {
    let offset = pair.as_span().start();
    let mut pairs = pair.into_inner();
    let mut expr = build_expr(next_pair(&mut pairs, offset)?)?;

    for suffix in pairs {
        let suffix_offset = suffix.as_span().start();
        expr = match suffix.as_rule() {
            Rule::attr_access => Expr::Attr {
                object: Box::new(expr),
                name: next_pair(&mut suffix.into_inner(), suffix_offset)?
                    .as_str()
                    .to_string(),
            },
            Rule::index_access => Expr::Index {
                object: Box::new(expr),
                index: Box::new(build_expr(next_pair(
                    &mut suffix.into_inner(),
                    suffix_offset,
                )?)?),
            },
            Rule::call_args => build_call(expr, suffix)?,
            _ => return Err(unexpected(&suffix)),
        };
    }
    Ok(expr)
}

fn build_call(callee: Expr, pair: Pair<Rule>) -> ExprResult<Expr> {
    let mut args = Vec::new();
    let mut kwargs: Vec<(String, Expr)> = Vec::new();

    for argument in pair.into_inner() {
        let offset = argument.as_span().start();
        let inner = next_pair(&mut argument.into_inner(), offset)?;
        if inner.as_rule() == Rule::kwarg {
            let mut parts = inner.into_inner();
            let name = next_pair(&mut parts, offset)?.as_str().to_string();
            kwargs.push((name, build_expr(next_pair(&mut parts, offset)?)?));
        } else {
            if !kwargs.is_empty() {
                return Err(ExprError::Syntax {
                    offset,
                    message: "positional argument follows keyword argument".to_string(),
                });
            }
            args.push(build_expr(inner)?);
        }
    }

    Ok(Expr::Call {
        callee: Box::new(callee),
        args,
        kwargs,
    })
}

fn build_atom(pair: Pair<Rule>) -> ExprResult<Expr> {
    let offset = pair.as_span().start();
    let inner = next_pair(&mut pair.into_inner(), offset)?;

    match inner.as_rule() {
        Rule::number => build_number(next_pair(&mut inner.into_inner(), offset)?),
        Rule::strings => {
            let mut text = String::new();
            for string in inner.into_inner() {
                text.push_str(&string_text(string)?);
            }
            Ok(Expr::Literal(Value::Str(text)))
        }
        Rule::quoted_name => Ok(Expr::Name(body_text(inner).to_string())),
        Rule::global_name => Ok(Expr::Global(body_text(inner).to_string())),
        Rule::constant => {
            let constant = next_pair(&mut inner.into_inner(), offset)?;
            Ok(Expr::Literal(match constant.as_rule() {
                Rule::true_lit => Value::Bool(true),
                Rule::false_lit => Value::Bool(false),
                _ => Value::Null,
            }))
        }
        Rule::ident => Ok(Expr::Name(inner.as_str().to_string())),
        Rule::paren => {
            // `(x)` groups; `()`, `(x,)` and `(x, y)` are lists
            let mut items = Vec::new();
            let mut tuple = false;
            for part in inner.into_inner() {
                if part.as_rule() == Rule::tuple_sep {
                    tuple = true;
                } else {
                    items.push(build_expr(part)?);
                }
            }
            match items.pop() {
                Some(only) if !tuple && items.is_empty() => Ok(only),
                Some(last) => {
                    items.push(last);
                    Ok(Expr::List(items))
                }
                None => Ok(Expr::List(items)),
            }
        }
        Rule::list => Ok(Expr::List(
            inner
                .into_inner()
                .map(build_expr)
                .collect::<ExprResult<Vec<_>>>()?,
        )),
        Rule::dict => {
            let mut entries = Vec::new();
            for entry in inner.into_inner() {
                let entry_offset = entry.as_span().start();
                let mut parts = entry.into_inner();
                let key = build_expr(next_pair(&mut parts, entry_offset)?)?;
                let value = build_expr(next_pair(&mut parts, entry_offset)?)?;
                entries.push((key, value));
            }
            Ok(Expr::Dict(entries))
        }
        _ => Err(unexpected(&inner)),
    }
}

fn build_number(pair: Pair<Rule>) -> ExprResult<Expr> {
    let text = pair.as_str().replace('_', "");
    let invalid = || ExprError::Syntax {
        offset: pair.as_span().start(),
        message: format!("invalid number '{}'", text),
    };
    let value = match pair.as_rule() {
        Rule::int => match text.parse::<i64>() {
            Ok(n) => Value::Int(n),
            Err(_) => Value::Float(text.parse().map_err(|_| invalid())?),
        },
        _ => Value::Float(text.parse().map_err(|_| invalid())?),
    };
    Ok(Expr::Literal(value))
}

/// Text between the delimiters of a quoted name or a string.
fn body_text<'i>(pair: Pair<'i, Rule>) -> &'i str {
    pair.into_inner().next().map(|body| body.as_str()).unwrap_or("")
}

fn string_text(pair: Pair<Rule>) -> ExprResult<String> {
    let offset = pair.as_span().start();
    let quoted = next_pair(&mut pair.into_inner(), offset)?;
    Ok(match quoted.as_rule() {
        Rule::raw_string => body_text(quoted).to_string(),
        _ => unescape(body_text(quoted)),
    })
}

/// Unknown escapes keep their backslash, so `'\d'` stays a regex escape.
fn unescape(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}
