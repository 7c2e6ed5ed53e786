//! Restricted boolean expression language for custom validation rules.
//!
//! Expressions operate over `output` and `task` as JSON values and support
//! comparison, membership (`in`), boolean connectives, `len(...)` and
//! dotted-path / index access. There is no other capability: no calls, no
//! attribute lookup, no side effects.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_until, take_while, take_while1},
    character::complete::{char, digit1, multispace0},
    combinator::{map, map_res, opt, value},
    multi::many0,
    number::complete::double,
    sequence::{delimited, pair, preceded},
};
use nom::combinator::recognize;
use serde_json::Value;

const RESERVED: [&str; 8] = ["and", "or", "not", "in", "true", "false", "null", "len"];

#[derive(Debug, Clone, PartialEq)]
pub enum PathSeg {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<PathSeg>),
    Len(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    In(Box<Expr>, Box<Expr>),
}

/// Parse a complete expression; trailing input is an error.
pub fn parse_expr(input: &str) -> Result<Expr, String> {
    match parse_or(input) {
        Ok((rest, expr)) => {
            let rest = rest.trim();
            if rest.is_empty() {
                Ok(expr)
            } else {
                Err(format!("unexpected trailing input: '{rest}'"))
            }
        }
        Err(err) => Err(format!("parse error: {err}")),
    }
}

/// Evaluate to a strict boolean; a non-boolean result is an error.
pub fn eval_bool(expr: &Expr, output: &Value, task: &Value) -> Result<bool, String> {
    match eval(expr, output, task)? {
        Value::Bool(b) => Ok(b),
        other => Err(format!(
            "expression must return a boolean, got {}",
            kind_name(&other)
        )),
    }
}

fn kw(word: &'static str) -> impl Fn(&str) -> IResult<&str, &str> {
    move |input: &str| {
        let (rest, matched) = tag::<_, _, nom::error::Error<&str>>(word)(input)?;
        match rest.chars().next() {
            Some(c) if c.is_alphanumeric() || c == '_' => Err(nom::Err::Error(
                nom::error::Error::new(input, nom::error::ErrorKind::Tag),
            )),
            _ => Ok((rest, matched)),
        }
    }
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_alphabetic() || c == '_'),
        take_while(|c: char| c.is_alphanumeric() || c == '_'),
    ))(input)
}

fn parse_string_literal(input: &str) -> IResult<&str, Expr> {
    let single = delimited(char('\''), take_until("'"), char('\''));
    let double_quoted = delimited(char('"'), take_until("\""), char('"'));
    map(alt((single, double_quoted)), |s: &str| {
        Expr::Literal(Value::String(s.to_string()))
    })(input)
}

fn parse_number(input: &str) -> IResult<&str, Expr> {
    map(double, |n| {
        if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
            Expr::Literal(Value::from(n as i64))
        } else {
            Expr::Literal(Value::from(n))
        }
    })(input)
}

fn parse_keyword_literal(input: &str) -> IResult<&str, Expr> {
    alt((
        value(Expr::Literal(Value::Bool(true)), kw("true")),
        value(Expr::Literal(Value::Bool(false)), kw("false")),
        value(Expr::Literal(Value::Null), kw("null")),
    ))(input)
}

fn parse_len(input: &str) -> IResult<&str, Expr> {
    let (rest, _) = kw("len")(input)?;
    let (rest, inner) = delimited(
        preceded(multispace0, char('(')),
        parse_or,
        preceded(multispace0, char(')')),
    )(rest)?;
    Ok((rest, Expr::Len(Box::new(inner))))
}

fn parse_path(input: &str) -> IResult<&str, Expr> {
    let (rest, root) = identifier(input)?;
    if RESERVED.contains(&root) {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        )));
    }

    let key_index = delimited(
        char('['),
        delimited(char('\''), take_until("'"), char('\'')),
        char(']'),
    );
    let numeric_index = delimited(char('['), map_res(digit1, str::parse::<usize>), char(']'));

    let (rest, segments) = many0(alt((
        map(preceded(char('.'), identifier), |s: &str| {
            PathSeg::Key(s.to_string())
        }),
        map(key_index, |s: &str| PathSeg::Key(s.to_string())),
        map(numeric_index, PathSeg::Index),
    )))(rest)?;

    let mut path = vec![PathSeg::Key(root.to_string())];
    path.extend(segments);
    Ok((rest, Expr::Path(path)))
}

fn parse_parens(input: &str) -> IResult<&str, Expr> {
    delimited(
        char('('),
        parse_or,
        preceded(multispace0, char(')')),
    )(input)
}

fn parse_primary(input: &str) -> IResult<&str, Expr> {
    preceded(
        multispace0,
        alt((
            parse_parens,
            parse_len,
            parse_keyword_literal,
            parse_number,
            parse_string_literal,
            parse_path,
        )),
    )(input)
}

#[derive(Clone, Copy)]
enum BinTag {
    Cmp(CmpOp),
    In,
}

fn parse_comparison(input: &str) -> IResult<&str, Expr> {
    let (rest, lhs) = parse_primary(input)?;
    let (rest, _) = multispace0(rest)?;
    let (rest, op) = opt(alt((
        value(BinTag::Cmp(CmpOp::Le), tag("<=")),
        value(BinTag::Cmp(CmpOp::Ge), tag(">=")),
        value(BinTag::Cmp(CmpOp::Eq), tag("==")),
        value(BinTag::Cmp(CmpOp::Ne), tag("!=")),
        value(BinTag::Cmp(CmpOp::Lt), tag("<")),
        value(BinTag::Cmp(CmpOp::Gt), tag(">")),
        value(BinTag::In, kw("in")),
    )))(rest)?;

    match op {
        None => Ok((rest, lhs)),
        Some(bin) => {
            let (rest, rhs) = parse_primary(rest)?;
            let expr = match bin {
                BinTag::Cmp(op) => Expr::Cmp(op, Box::new(lhs), Box::new(rhs)),
                BinTag::In => Expr::In(Box::new(lhs), Box::new(rhs)),
            };
            Ok((rest, expr))
        }
    }
}

fn parse_not(input: &str) -> IResult<&str, Expr> {
    let (rest, _) = multispace0(input)?;
    if let Ok((after_not, _)) = kw("not")(rest) {
        let (rest, inner) = parse_not(after_not)?;
        return Ok((rest, Expr::Not(Box::new(inner))));
    }
    parse_comparison(rest)
}

fn parse_and(input: &str) -> IResult<&str, Expr> {
    let (mut rest, mut acc) = parse_not(input)?;
    loop {
        let (after_ws, _) = multispace0::<_, nom::error::Error<&str>>(rest)?;
        match kw("and")(after_ws) {
            Ok((after_kw, _)) => {
                let (after_rhs, rhs) = parse_not(after_kw)?;
                acc = Expr::And(Box::new(acc), Box::new(rhs));
                rest = after_rhs;
            }
            Err(_) => {
                rest = after_ws;
                break;
            }
        }
    }
    Ok((rest, acc))
}

fn parse_or(input: &str) -> IResult<&str, Expr> {
    let (mut rest, mut acc) = parse_and(input)?;
    loop {
        let (after_ws, _) = multispace0::<_, nom::error::Error<&str>>(rest)?;
        match kw("or")(after_ws) {
            Ok((after_kw, _)) => {
                let (after_rhs, rhs) = parse_and(after_kw)?;
                acc = Expr::Or(Box::new(acc), Box::new(rhs));
                rest = after_rhs;
            }
            Err(_) => {
                rest = after_ws;
                break;
            }
        }
    }
    Ok((rest, acc))
}

fn resolve(path: &[PathSeg], output: &Value, task: &Value) -> Value {
    let mut current = match path.first() {
        Some(PathSeg::Key(root)) if root == "output" => output.clone(),
        Some(PathSeg::Key(root)) if root == "task" => task.clone(),
        _ => return Value::Null,
    };

    for seg in &path[1..] {
        current = match (seg, &current) {
            (PathSeg::Key(key), Value::Object(map)) => {
                map.get(key).cloned().unwrap_or(Value::Null)
            }
            (PathSeg::Index(idx), Value::Array(items)) => {
                items.get(*idx).cloned().unwrap_or(Value::Null)
            }
            _ => Value::Null,
        };
    }
    current
}

fn eval(expr: &Expr, output: &Value, task: &Value) -> Result<Value, String> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(path) => Ok(resolve(path, output, task)),
        Expr::Len(inner) => {
            let v = eval(inner, output, task)?;
            match v {
                Value::String(s) => Ok(Value::from(s.chars().count())),
                Value::Array(items) => Ok(Value::from(items.len())),
                Value::Object(map) => Ok(Value::from(map.len())),
                Value::Null => Ok(Value::from(0)),
                other => Err(format!("len() not defined for {}", kind_name(&other))),
            }
        }
        Expr::Not(inner) => {
            let b = eval_bool(inner, output, task)?;
            Ok(Value::Bool(!b))
        }
        Expr::And(lhs, rhs) => {
            if !eval_bool(lhs, output, task)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval_bool(rhs, output, task)?))
        }
        Expr::Or(lhs, rhs) => {
            if eval_bool(lhs, output, task)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval_bool(rhs, output, task)?))
        }
        Expr::Cmp(op, lhs, rhs) => {
            let l = eval(lhs, output, task)?;
            let r = eval(rhs, output, task)?;
            compare(*op, &l, &r).map(Value::Bool)
        }
        Expr::In(lhs, rhs) => {
            let needle = eval(lhs, output, task)?;
            let haystack = eval(rhs, output, task)?;
            membership(&needle, &haystack).map(Value::Bool)
        }
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, String> {
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return Ok(match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        });
    }

    if let (Value::String(a), Value::String(b)) = (l, r) {
        return Ok(match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        });
    }

    match op {
        CmpOp::Eq => Ok(l == r),
        CmpOp::Ne => Ok(l != r),
        _ => Err(format!(
            "cannot order {} and {}",
            kind_name(l),
            kind_name(r)
        )),
    }
}

fn membership(needle: &Value, haystack: &Value) -> Result<bool, String> {
    match haystack {
        Value::Array(items) => Ok(items.contains(needle)),
        Value::String(s) => match needle {
            Value::String(sub) => Ok(s.contains(sub.as_str())),
            other => Err(format!(
                "cannot search for {} in a string",
                kind_name(other)
            )),
        },
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key.as_str())),
            other => Err(format!(
                "cannot use {} as an object key",
                kind_name(other)
            )),
        },
        other => Err(format!("'in' not defined for {}", kind_name(other))),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
