//! Aggregation expression language: AST, parser, and the host-code
//! evaluation back-end. The SQL emission back-end over the same AST
//! lives in `sql_expr`; the two must agree on semantics.

use crate::aggregation::values::{Numeric, coerce_numeric, json_cmp, values_equal};
use crate::document::Document;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Evaluation result of `$$REMOVE`; projection contexts drop fields
/// that evaluate to this marker.
pub const REMOVE: &str = "$$REMOVE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    // Arithmetic
    Abs,
    Ceil,
    Floor,
    Sqrt,
    Exp,
    Ln,
    Log10,
    // Trigonometric
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    RadiansToDegrees,
    DegreesToRadians,
    // Logical
    Not,
    // String
    ToUpper,
    ToLower,
    StrLenCp,
    StrLenBytes,
    // Array
    Size,
    IsArray,
    ReverseArray,
    // Set
    AnyElementTrue,
    AllElementsTrue,
    // Type
    ToInt,
    ToLong,
    ToDouble,
    ToDecimal,
    ToBool,
    ToString,
    ToDate,
    ToObjectId,
    ToBinData,
    ToRegex,
    Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Subtract,
    Divide,
    Mod,
    Pow,
    Log,
    Atan2,
    // Comparison
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Cmp,
    // Array
    ArrayElemAt,
    In,
    Split,
    // Set
    SetDifference,
    SetIsSubset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariadicOp {
    Add,
    Multiply,
    And,
    Or,
    Concat,
    ConcatArrays,
    IfNull,
    SetEquals,
    SetIntersection,
    SetUnion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePart {
    Year,
    Month,
    DayOfMonth,
    Hour,
    Minute,
    Second,
    DayOfWeek,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimMode {
    Both,
    Left,
    Right,
}

/// Expression AST node.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    FieldRef(String),
    Variable(String),
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Variadic(VariadicOp, Vec<Expr>),
    Round {
        input: Box<Expr>,
        place: Option<Box<Expr>>,
    },
    Cond {
        if_expr: Box<Expr>,
        then: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Switch {
        branches: Vec<(Expr, Expr)>,
        default: Option<Box<Expr>>,
    },
    Substr {
        string: Box<Expr>,
        start: Box<Expr>,
        length: Box<Expr>,
    },
    IndexOfCp {
        string: Box<Expr>,
        substring: Box<Expr>,
    },
    Trim {
        input: Box<Expr>,
        chars: Option<Box<Expr>>,
        mode: TrimMode,
    },
    Replace {
        input: Box<Expr>,
        find: Box<Expr>,
        replacement: Box<Expr>,
        all: bool,
    },
    RegexMatch {
        input: Box<Expr>,
        regex: Box<Expr>,
        options: Option<String>,
    },
    DatePart(DatePart, Box<Expr>),
    DateToString {
        date: Box<Expr>,
        format: Option<String>,
    },
    DateFromString {
        date_string: Box<Expr>,
    },
    Slice {
        array: Box<Expr>,
        first: Box<Expr>,
        second: Option<Box<Expr>>,
    },
    Convert {
        input: Box<Expr>,
        to: Box<Expr>,
        on_error: Option<Box<Expr>>,
        on_null: Option<Box<Expr>>,
    },
}

/// Context for host-side evaluation: the document bound to `$$CURRENT`,
/// the one bound to `$$ROOT`, and user variables.
pub struct EvalContext {
    pub root: Document,
    pub current: Document,
    pub vars: HashMap<String, Value>,
}

impl EvalContext {
    pub fn new(doc: Document) -> Self {
        Self {
            root: doc.clone(),
            current: doc,
            vars: HashMap::new(),
        }
    }

    pub fn with_vars(doc: Document, vars: HashMap<String, Value>) -> Self {
        Self {
            root: doc.clone(),
            current: doc,
            vars,
        }
    }
}

/// Parse a JSON value into an expression.
pub fn parse_expr(v: &Value) -> anyhow::Result<Expr> {
    match v {
        Value::Object(map) => {
            if map.len() == 1 {
                let (op, arg) = map.iter().next().expect("non-empty");
                if op.starts_with('$') {
                    return parse_operator(op, arg);
                }
            }
            if map.keys().any(|k| k.starts_with('$')) {
                anyhow::bail!("misplaced operator in expression document");
            }
            let mut fields = Vec::new();
            for (k, sub) in map {
                fields.push((k.clone(), parse_expr(sub)?));
            }
            Ok(Expr::Object(fields))
        }
        Value::Array(items) => {
            let exprs = items.iter().map(parse_expr).collect::<anyhow::Result<_>>()?;
            Ok(Expr::Array(exprs))
        }
        Value::String(s) if s.starts_with("$$") => Ok(Expr::Variable(s[2..].to_string())),
        Value::String(s) if s.starts_with('$') => Ok(Expr::FieldRef(s[1..].to_string())),
        other => Ok(Expr::Literal(other.clone())),
    }
}

fn parse_operator(op: &str, arg: &Value) -> anyhow::Result<Expr> {
    if let Some(unary) = unary_op(op) {
        return Ok(Expr::Unary(unary, Box::new(parse_single(op, arg)?)));
    }
    if let Some(binary) = binary_op(op) {
        let (a, b) = parse_pair(op, arg)?;
        return Ok(Expr::Binary(binary, Box::new(a), Box::new(b)));
    }
    if let Some(variadic) = variadic_op(op) {
        let items = arg
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("{op} requires an array"))?;
        let exprs = items.iter().map(parse_expr).collect::<anyhow::Result<_>>()?;
        return Ok(Expr::Variadic(variadic, exprs));
    }
    if let Some(part) = date_part(op) {
        return Ok(Expr::DatePart(part, Box::new(parse_single(op, arg)?)));
    }

    match op {
        "$literal" => Ok(Expr::Literal(arg.clone())),
        "$round" => match arg {
            Value::Array(items) if !items.is_empty() && items.len() <= 2 => Ok(Expr::Round {
                input: Box::new(parse_expr(&items[0])?),
                place: items.get(1).map(parse_expr).transpose()?.map(Box::new),
            }),
            other => Ok(Expr::Round {
                input: Box::new(parse_expr(other)?),
                place: None,
            }),
        },
        "$cond" => {
            if let Some(items) = arg.as_array() {
                anyhow::ensure!(items.len() == 3, "$cond array form requires 3 elements");
                Ok(Expr::Cond {
                    if_expr: Box::new(parse_expr(&items[0])?),
                    then: Box::new(parse_expr(&items[1])?),
                    else_expr: Box::new(parse_expr(&items[2])?),
                })
            } else if let Some(doc) = arg.as_object() {
                let take = |key: &str| {
                    doc.get(key)
                        .ok_or_else(|| anyhow::anyhow!("$cond missing {key}"))
                };
                Ok(Expr::Cond {
                    if_expr: Box::new(parse_expr(take("if")?)?),
                    then: Box::new(parse_expr(take("then")?)?),
                    else_expr: Box::new(parse_expr(take("else")?)?),
                })
            } else {
                anyhow::bail!("$cond must be array or document")
            }
        }
        "$switch" => {
            let doc = arg
                .as_object()
                .ok_or_else(|| anyhow::anyhow!("$switch requires a document"))?;
            let branches_in = doc
                .get("branches")
                .and_then(Value::as_array)
                .ok_or_else(|| anyhow::anyhow!("$switch requires branches"))?;
            let mut branches = Vec::new();
            for branch in branches_in {
                let b = branch
                    .as_object()
                    .ok_or_else(|| anyhow::anyhow!("$switch branch must be a document"))?;
                let case = b
                    .get("case")
                    .ok_or_else(|| anyhow::anyhow!("$switch branch missing case"))?;
                let then = b
                    .get("then")
                    .ok_or_else(|| anyhow::anyhow!("$switch branch missing then"))?;
                branches.push((parse_expr(case)?, parse_expr(then)?));
            }
            let default = doc.get("default").map(parse_expr).transpose()?.map(Box::new);
            Ok(Expr::Switch { branches, default })
        }
        "$substr" | "$substrCP" => {
            let items = arg
                .as_array()
                .filter(|a| a.len() == 3)
                .ok_or_else(|| anyhow::anyhow!("{op} requires [string, start, length]"))?;
            Ok(Expr::Substr {
                string: Box::new(parse_expr(&items[0])?),
                start: Box::new(parse_expr(&items[1])?),
                length: Box::new(parse_expr(&items[2])?),
            })
        }
        "$indexOfCP" => {
            let items = arg
                .as_array()
                .filter(|a| a.len() >= 2)
                .ok_or_else(|| anyhow::anyhow!("$indexOfCP requires [string, substring]"))?;
            Ok(Expr::IndexOfCp {
                string: Box::new(parse_expr(&items[0])?),
                substring: Box::new(parse_expr(&items[1])?),
            })
        }
        "$trim" | "$ltrim" | "$rtrim" => {
            let doc = arg
                .as_object()
                .ok_or_else(|| anyhow::anyhow!("{op} requires a document"))?;
            let input = doc
                .get("input")
                .ok_or_else(|| anyhow::anyhow!("{op} missing input"))?;
            let chars = doc.get("chars").map(parse_expr).transpose()?.map(Box::new);
            let mode = match op {
                "$ltrim" => TrimMode::Left,
                "$rtrim" => TrimMode::Right,
                _ => TrimMode::Both,
            };
            Ok(Expr::Trim {
                input: Box::new(parse_expr(input)?),
                chars,
                mode,
            })
        }
        "$replaceOne" | "$replaceAll" => {
            let doc = arg
                .as_object()
                .ok_or_else(|| anyhow::anyhow!("{op} requires a document"))?;
            let take = |key: &str| {
                doc.get(key)
                    .ok_or_else(|| anyhow::anyhow!("{op} missing {key}"))
            };
            Ok(Expr::Replace {
                input: Box::new(parse_expr(take("input")?)?),
                find: Box::new(parse_expr(take("find")?)?),
                replacement: Box::new(parse_expr(take("replacement")?)?),
                all: op == "$replaceAll",
            })
        }
        "$regexMatch" => {
            let doc = arg
                .as_object()
                .ok_or_else(|| anyhow::anyhow!("$regexMatch requires a document"))?;
            let input = doc
                .get("input")
                .ok_or_else(|| anyhow::anyhow!("$regexMatch missing input"))?;
            let regex = doc
                .get("regex")
                .ok_or_else(|| anyhow::anyhow!("$regexMatch missing regex"))?;
            let options = doc
                .get("options")
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok(Expr::RegexMatch {
                input: Box::new(parse_expr(input)?),
                regex: Box::new(parse_expr(regex)?),
                options,
            })
        }
        "$dateToString" => {
            let doc = arg
                .as_object()
                .ok_or_else(|| anyhow::anyhow!("$dateToString requires a document"))?;
            let date = doc
                .get("date")
                .ok_or_else(|| anyhow::anyhow!("$dateToString missing date"))?;
            let format = doc
                .get("format")
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok(Expr::DateToString {
                date: Box::new(parse_expr(date)?),
                format,
            })
        }
        "$dateFromString" => {
            let doc = arg
                .as_object()
                .ok_or_else(|| anyhow::anyhow!("$dateFromString requires a document"))?;
            let date_string = doc
                .get("dateString")
                .ok_or_else(|| anyhow::anyhow!("$dateFromString missing dateString"))?;
            Ok(Expr::DateFromString {
                date_string: Box::new(parse_expr(date_string)?),
            })
        }
        "$slice" => {
            let items = arg
                .as_array()
                .filter(|a| a.len() == 2 || a.len() == 3)
                .ok_or_else(|| anyhow::anyhow!("$slice requires 2 or 3 arguments"))?;
            Ok(Expr::Slice {
                array: Box::new(parse_expr(&items[0])?),
                first: Box::new(parse_expr(&items[1])?),
                second: items.get(2).map(parse_expr).transpose()?.map(Box::new),
            })
        }
        "$convert" => {
            let doc = arg
                .as_object()
                .ok_or_else(|| anyhow::anyhow!("$convert requires a document"))?;
            let input = doc
                .get("input")
                .ok_or_else(|| anyhow::anyhow!("$convert missing input"))?;
            let to = doc
                .get("to")
                .ok_or_else(|| anyhow::anyhow!("$convert missing to"))?;
            Ok(Expr::Convert {
                input: Box::new(parse_expr(input)?),
                to: Box::new(parse_expr(to)?),
                on_error: doc.get("onError").map(parse_expr).transpose()?.map(Box::new),
                on_null: doc.get("onNull").map(parse_expr).transpose()?.map(Box::new),
            })
        }
        _ => anyhow::bail!("unknown expression operator: {op}"),
    }
}

fn parse_single(op: &str, arg: &Value) -> anyhow::Result<Expr> {
    // Unary operators also accept the one-element array form.
    match arg {
        Value::Array(items) if items.len() == 1 => parse_expr(&items[0]),
        Value::Array(_) => anyhow::bail!("{op} takes a single argument"),
        other => parse_expr(other),
    }
}

fn parse_pair(op: &str, arg: &Value) -> anyhow::Result<(Expr, Expr)> {
    let items = arg
        .as_array()
        .filter(|a| a.len() == 2)
        .ok_or_else(|| anyhow::anyhow!("{op} requires exactly 2 arguments"))?;
    Ok((parse_expr(&items[0])?, parse_expr(&items[1])?))
}

fn unary_op(op: &str) -> Option<UnaryOp> {
    Some(match op {
        "$abs" => UnaryOp::Abs,
        "$ceil" => UnaryOp::Ceil,
        "$floor" => UnaryOp::Floor,
        "$sqrt" => UnaryOp::Sqrt,
        "$exp" => UnaryOp::Exp,
        "$ln" => UnaryOp::Ln,
        "$log10" => UnaryOp::Log10,
        "$sin" => UnaryOp::Sin,
        "$cos" => UnaryOp::Cos,
        "$tan" => UnaryOp::Tan,
        "$asin" => UnaryOp::Asin,
        "$acos" => UnaryOp::Acos,
        "$atan" => UnaryOp::Atan,
        "$sinh" => UnaryOp::Sinh,
        "$cosh" => UnaryOp::Cosh,
        "$tanh" => UnaryOp::Tanh,
        "$radiansToDegrees" => UnaryOp::RadiansToDegrees,
        "$degreesToRadians" => UnaryOp::DegreesToRadians,
        "$not" => UnaryOp::Not,
        "$toUpper" => UnaryOp::ToUpper,
        "$toLower" => UnaryOp::ToLower,
        "$strLenCP" => UnaryOp::StrLenCp,
        "$strLenBytes" => UnaryOp::StrLenBytes,
        "$size" => UnaryOp::Size,
        "$isArray" => UnaryOp::IsArray,
        "$reverseArray" => UnaryOp::ReverseArray,
        "$anyElementTrue" => UnaryOp::AnyElementTrue,
        "$allElementsTrue" => UnaryOp::AllElementsTrue,
        "$toInt" => UnaryOp::ToInt,
        "$toLong" => UnaryOp::ToLong,
        "$toDouble" => UnaryOp::ToDouble,
        "$toDecimal" => UnaryOp::ToDecimal,
        "$toBool" => UnaryOp::ToBool,
        "$toString" => UnaryOp::ToString,
        "$toDate" => UnaryOp::ToDate,
        "$toObjectId" => UnaryOp::ToObjectId,
        "$toBinData" => UnaryOp::ToBinData,
        "$toRegex" => UnaryOp::ToRegex,
        "$type" => UnaryOp::Type,
        _ => return None,
    })
}

fn binary_op(op: &str) -> Option<BinaryOp> {
    Some(match op {
        "$subtract" => BinaryOp::Subtract,
        "$divide" => BinaryOp::Divide,
        "$mod" => BinaryOp::Mod,
        "$pow" => BinaryOp::Pow,
        "$log" => BinaryOp::Log,
        "$atan2" => BinaryOp::Atan2,
        "$eq" => BinaryOp::Eq,
        "$ne" => BinaryOp::Ne,
        "$gt" => BinaryOp::Gt,
        "$gte" => BinaryOp::Gte,
        "$lt" => BinaryOp::Lt,
        "$lte" => BinaryOp::Lte,
        "$cmp" => BinaryOp::Cmp,
        "$arrayElemAt" => BinaryOp::ArrayElemAt,
        "$in" => BinaryOp::In,
        "$split" => BinaryOp::Split,
        "$setDifference" => BinaryOp::SetDifference,
        "$setIsSubset" => BinaryOp::SetIsSubset,
        _ => return None,
    })
}

fn variadic_op(op: &str) -> Option<VariadicOp> {
    Some(match op {
        "$add" => VariadicOp::Add,
        "$multiply" => VariadicOp::Multiply,
        "$and" => VariadicOp::And,
        "$or" => VariadicOp::Or,
        "$concat" => VariadicOp::Concat,
        "$concatArrays" => VariadicOp::ConcatArrays,
        "$ifNull" => VariadicOp::IfNull,
        "$setEquals" => VariadicOp::SetEquals,
        "$setIntersection" => VariadicOp::SetIntersection,
        "$setUnion" => VariadicOp::SetUnion,
        _ => return None,
    })
}

fn date_part(op: &str) -> Option<DatePart> {
    Some(match op {
        "$year" => DatePart::Year,
        "$month" => DatePart::Month,
        "$dayOfMonth" => DatePart::DayOfMonth,
        "$hour" => DatePart::Hour,
        "$minute" => DatePart::Minute,
        "$second" => DatePart::Second,
        "$dayOfWeek" => DatePart::DayOfWeek,
        _ => return None,
    })
}

pub fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => true,
    }
}

/// Evaluate an expression against a context.
pub fn eval_expr(expr: &Expr, ctx: &EvalContext) -> anyhow::Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::FieldRef(path) => Ok(crate::matcher::resolve_path(&ctx.current, path)
            .cloned()
            .unwrap_or(Value::Null)),
        Expr::Variable(name) => match name.as_str() {
            "ROOT" => Ok(Value::Object(ctx.root.clone())),
            "CURRENT" => Ok(Value::Object(ctx.current.clone())),
            "REMOVE" => Ok(Value::String(REMOVE.to_string())),
            other => match split_var_path(other) {
                (var, None) => Ok(ctx.vars.get(var).cloned().unwrap_or(Value::Null)),
                (var, Some(rest)) => {
                    let base = ctx.vars.get(var).cloned().unwrap_or(Value::Null);
                    match base {
                        Value::Object(map) => Ok(crate::matcher::resolve_path(&map, rest)
                            .cloned()
                            .unwrap_or(Value::Null)),
                        _ => Ok(Value::Null),
                    }
                }
            },
        },
        Expr::Object(fields) => {
            let mut out = Map::new();
            for (k, sub) in fields {
                let v = eval_expr(sub, ctx)?;
                if v.as_str() != Some(REMOVE) {
                    out.insert(k.clone(), v);
                }
            }
            Ok(Value::Object(out))
        }
        Expr::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                out.push(eval_expr(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Unary(op, inner) => eval_unary(*op, eval_expr(inner, ctx)?),
        Expr::Binary(op, a, b) => eval_binary(*op, eval_expr(a, ctx)?, eval_expr(b, ctx)?),
        Expr::Variadic(op, items) => eval_variadic(*op, items, ctx),
        Expr::Round { input, place } => {
            let v = eval_expr(input, ctx)?;
            let place = match place {
                Some(p) => eval_expr(p, ctx)?.as_i64().unwrap_or(0),
                None => 0,
            };
            match coerce_numeric(&v) {
                Some(n) => {
                    let factor = 10f64.powi(place as i32);
                    let rounded = (n.as_f64() * factor).round() / factor;
                    Ok(number(rounded, place <= 0 && matches!(n, Numeric::Int(_))))
                }
                None => Ok(Value::Null),
            }
        }
        Expr::Cond {
            if_expr,
            then,
            else_expr,
        } => {
            if is_truthy(&eval_expr(if_expr, ctx)?) {
                eval_expr(then, ctx)
            } else {
                eval_expr(else_expr, ctx)
            }
        }
        Expr::Switch { branches, default } => {
            for (case, then) in branches {
                if is_truthy(&eval_expr(case, ctx)?) {
                    return eval_expr(then, ctx);
                }
            }
            match default {
                Some(d) => eval_expr(d, ctx),
                None => anyhow::bail!("$switch had no matching branch and no default"),
            }
        }
        Expr::Substr {
            string,
            start,
            length,
        } => {
            let s = string_arg(eval_expr(string, ctx)?);
            let start = eval_expr(start, ctx)?.as_i64().unwrap_or(0).max(0) as usize;
            let length = eval_expr(length, ctx)?.as_i64().unwrap_or(0);
            let taken: String = if length < 0 {
                s.chars().skip(start).collect()
            } else {
                s.chars().skip(start).take(length as usize).collect()
            };
            Ok(Value::String(taken))
        }
        Expr::IndexOfCp { string, substring } => {
            let s = string_arg(eval_expr(string, ctx)?);
            let sub = string_arg(eval_expr(substring, ctx)?);
            match s.find(&sub) {
                Some(byte_idx) => Ok(Value::from(s[..byte_idx].chars().count() as i64)),
                None => Ok(Value::from(-1)),
            }
        }
        Expr::Trim { input, chars, mode } => {
            let s = string_arg(eval_expr(input, ctx)?);
            let chars: Vec<char> = match chars {
                Some(c) => string_arg(eval_expr(c, ctx)?).chars().collect(),
                None => Vec::new(),
            };
            let pred = |c: char| {
                if chars.is_empty() {
                    c.is_whitespace()
                } else {
                    chars.contains(&c)
                }
            };
            let trimmed = match mode {
                TrimMode::Both => s.trim_matches(pred),
                TrimMode::Left => s.trim_start_matches(pred),
                TrimMode::Right => s.trim_end_matches(pred),
            };
            Ok(Value::String(trimmed.to_string()))
        }
        Expr::Replace {
            input,
            find,
            replacement,
            all,
        } => {
            let input = eval_expr(input, ctx)?;
            if input.is_null() {
                return Ok(Value::Null);
            }
            let s = string_arg(input);
            let find = string_arg(eval_expr(find, ctx)?);
            let replacement = string_arg(eval_expr(replacement, ctx)?);
            let out = if *all {
                s.replace(&find, &replacement)
            } else {
                s.replacen(&find, &replacement, 1)
            };
            Ok(Value::String(out))
        }
        Expr::RegexMatch {
            input,
            regex,
            options,
        } => {
            let s = string_arg(eval_expr(input, ctx)?);
            let pattern = string_arg(eval_expr(regex, ctx)?);
            let pattern = match options {
                Some(o) if o.contains('i') => format!("(?i){pattern}"),
                _ => pattern,
            };
            let re = regex::Regex::new(&pattern)?;
            Ok(Value::Bool(re.is_match(&s)))
        }
        Expr::DatePart(part, date) => {
            let v = eval_expr(date, ctx)?;
            match crate::datetime::parse_json_datetime(&v) {
                Some(dt) => Ok(Value::from(crate::datetime::date_part(&dt, *part))),
                None => Ok(Value::Null),
            }
        }
        Expr::DateToString { date, format } => {
            let v = eval_expr(date, ctx)?;
            match crate::datetime::parse_json_datetime(&v) {
                Some(dt) => Ok(Value::String(crate::datetime::format_datetime(
                    &dt,
                    format.as_deref().unwrap_or("%Y-%m-%dT%H:%M:%S"),
                ))),
                None => Ok(Value::Null),
            }
        }
        Expr::DateFromString { date_string } => {
            let v = eval_expr(date_string, ctx)?;
            match crate::datetime::parse_json_datetime(&v) {
                Some(dt) => Ok(Value::String(crate::datetime::to_iso_string(&dt))),
                None => Ok(Value::Null),
            }
        }
        Expr::Slice {
            array,
            first,
            second,
        } => {
            let Some(items) = eval_expr(array, ctx)?.as_array().cloned() else {
                return Ok(Value::Null);
            };
            let first = eval_expr(first, ctx)?.as_i64().unwrap_or(0);
            match second {
                None => {
                    let n = first;
                    let out: Vec<Value> = if n >= 0 {
                        items.into_iter().take(n as usize).collect()
                    } else {
                        let skip = items.len().saturating_sub((-n) as usize);
                        items.into_iter().skip(skip).collect()
                    };
                    Ok(Value::Array(out))
                }
                Some(second) => {
                    let n = eval_expr(second, ctx)?.as_i64().unwrap_or(0).max(0) as usize;
                    let start = if first >= 0 {
                        (first as usize).min(items.len())
                    } else {
                        items.len().saturating_sub((-first) as usize)
                    };
                    Ok(Value::Array(
                        items.into_iter().skip(start).take(n).collect(),
                    ))
                }
            }
        }
        Expr::Convert {
            input,
            to,
            on_error,
            on_null,
        } => {
            let v = eval_expr(input, ctx)?;
            if v.is_null() {
                return match on_null {
                    Some(e) => eval_expr(e, ctx),
                    None => Ok(Value::Null),
                };
            }
            let target = string_arg(eval_expr(to, ctx)?);
            match convert_value(&v, &target) {
                Ok(out) => Ok(out),
                Err(err) => match on_error {
                    Some(e) => eval_expr(e, ctx),
                    None => Err(err),
                },
            }
        }
    }
}

fn split_var_path(name: &str) -> (&str, Option<&str>) {
    match name.find('.') {
        Some(idx) => (&name[..idx], Some(&name[idx + 1..])),
        None => (name, None),
    }
}

fn string_arg(v: Value) -> String {
    match v {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn number(f: f64, prefer_int: bool) -> Value {
    if prefer_int && f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Value::from(f as i64)
    } else {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn eval_unary(op: UnaryOp, v: Value) -> anyhow::Result<Value> {
    use UnaryOp::*;
    match op {
        Not => return Ok(Value::Bool(!is_truthy(&v))),
        ToUpper => return Ok(Value::String(string_arg(v).to_uppercase())),
        ToLower => return Ok(Value::String(string_arg(v).to_lowercase())),
        StrLenCp => return Ok(Value::from(string_arg(v).chars().count() as i64)),
        StrLenBytes => return Ok(Value::from(string_arg(v).len() as i64)),
        Size => {
            return match v.as_array() {
                Some(items) => Ok(Value::from(items.len() as i64)),
                None => anyhow::bail!("$size requires an array"),
            };
        }
        IsArray => return Ok(Value::Bool(v.is_array())),
        ReverseArray => {
            return match v {
                Value::Array(mut items) => {
                    items.reverse();
                    Ok(Value::Array(items))
                }
                Value::Null => Ok(Value::Null),
                _ => anyhow::bail!("$reverseArray requires an array"),
            };
        }
        AnyElementTrue => {
            return match v.as_array() {
                Some(items) => Ok(Value::Bool(items.iter().any(is_truthy))),
                None => anyhow::bail!("$anyElementTrue requires an array"),
            };
        }
        AllElementsTrue => {
            return match v.as_array() {
                Some(items) => Ok(Value::Bool(items.iter().all(is_truthy))),
                None => anyhow::bail!("$allElementsTrue requires an array"),
            };
        }
        ToInt | ToLong => return convert_value(&v, "long"),
        ToDouble | ToDecimal => return convert_value(&v, "double"),
        ToBool => return convert_value(&v, "bool"),
        ToString => return convert_value(&v, "string"),
        ToDate => return convert_value(&v, "date"),
        ToObjectId => return convert_value(&v, "objectId"),
        ToBinData => return convert_value(&v, "binData"),
        ToRegex => {
            return match v {
                Value::Null => Ok(Value::Null),
                Value::String(s) => Ok(serde_json::json!({ "$regex": s })),
                _ => anyhow::bail!("$toRegex requires a string"),
            };
        }
        Type => return Ok(Value::String(type_name(&v).to_string())),
        _ => {}
    }

    // Numeric unaries: null in, null out.
    let Some(n) = coerce_numeric(&v) else {
        return Ok(Value::Null);
    };
    let f = n.as_f64();
    let out = match op {
        Abs => {
            return Ok(match n {
                Numeric::Int(i) => Value::from(i.abs()),
                Numeric::Float(f) => number(f.abs(), false),
            });
        }
        Ceil => return Ok(number(f.ceil(), true)),
        Floor => return Ok(number(f.floor(), true)),
        Sqrt => f.sqrt(),
        Exp => f.exp(),
        Ln => f.ln(),
        Log10 => f.log10(),
        Sin => f.sin(),
        Cos => f.cos(),
        Tan => f.tan(),
        Asin => f.asin(),
        Acos => f.acos(),
        Atan => f.atan(),
        Sinh => f.sinh(),
        Cosh => f.cosh(),
        Tanh => f.tanh(),
        RadiansToDegrees => f.to_degrees(),
        DegreesToRadians => f.to_radians(),
        _ => unreachable!("handled above"),
    };
    Ok(number(out, false))
}

fn eval_binary(op: BinaryOp, a: Value, b: Value) -> anyhow::Result<Value> {
    use BinaryOp::*;
    match op {
        Eq => return Ok(Value::Bool(values_equal(&a, &b))),
        Ne => return Ok(Value::Bool(!values_equal(&a, &b))),
        Gt => return Ok(Value::Bool(json_cmp(&a, &b) == Ordering::Greater)),
        Gte => return Ok(Value::Bool(json_cmp(&a, &b) != Ordering::Less)),
        Lt => return Ok(Value::Bool(json_cmp(&a, &b) == Ordering::Less)),
        Lte => return Ok(Value::Bool(json_cmp(&a, &b) != Ordering::Greater)),
        Cmp => {
            return Ok(Value::from(match json_cmp(&a, &b) {
                Ordering::Less => -1,
                Ordering::Equal => 0,
                Ordering::Greater => 1,
            }));
        }
        ArrayElemAt => {
            let Some(items) = a.as_array() else {
                return Ok(Value::Null);
            };
            let Some(idx) = b.as_i64() else {
                return Ok(Value::Null);
            };
            let idx = if idx < 0 {
                items.len() as i64 + idx
            } else {
                idx
            };
            if idx < 0 || idx as usize >= items.len() {
                return Ok(Value::Null);
            }
            return Ok(items[idx as usize].clone());
        }
        In => {
            let Some(items) = b.as_array() else {
                anyhow::bail!("$in requires an array as second argument");
            };
            return Ok(Value::Bool(items.iter().any(|i| values_equal(i, &a))));
        }
        Split => {
            if a.is_null() {
                return Ok(Value::Null);
            }
            let s = string_arg(a);
            let sep = string_arg(b);
            if sep.is_empty() {
                anyhow::bail!("$split delimiter must be non-empty");
            }
            return Ok(Value::Array(
                s.split(&sep).map(|p| Value::String(p.to_string())).collect(),
            ));
        }
        SetDifference => {
            let (Some(xs), Some(ys)) = (a.as_array(), b.as_array()) else {
                return Ok(Value::Null);
            };
            let mut out: Vec<Value> = Vec::new();
            for x in xs {
                if !ys.iter().any(|y| values_equal(x, y))
                    && !out.iter().any(|o| values_equal(o, x))
                {
                    out.push(x.clone());
                }
            }
            return Ok(Value::Array(out));
        }
        SetIsSubset => {
            let (Some(xs), Some(ys)) = (a.as_array(), b.as_array()) else {
                anyhow::bail!("$setIsSubset requires two arrays");
            };
            return Ok(Value::Bool(
                xs.iter().all(|x| ys.iter().any(|y| values_equal(x, y))),
            ));
        }
        _ => {}
    }

    // Numeric binaries: null in, null out.
    let (Some(na), Some(nb)) = (coerce_numeric(&a), coerce_numeric(&b)) else {
        return Ok(Value::Null);
    };
    match op {
        Subtract => Ok(match (na, nb) {
            (Numeric::Int(x), Numeric::Int(y)) => Value::from(x - y),
            _ => number(na.as_f64() - nb.as_f64(), false),
        }),
        Divide => {
            if nb.as_f64() == 0.0 {
                Ok(Value::Null)
            } else {
                Ok(number(na.as_f64() / nb.as_f64(), false))
            }
        }
        Mod => match (na, nb) {
            (_, Numeric::Int(0)) => Ok(Value::Null),
            (Numeric::Int(x), Numeric::Int(y)) => Ok(Value::from(x % y)),
            _ => Ok(number(na.as_f64() % nb.as_f64(), false)),
        },
        Pow => Ok(number(na.as_f64().powf(nb.as_f64()), false)),
        Log => Ok(number(na.as_f64().log(nb.as_f64()), false)),
        Atan2 => Ok(number(na.as_f64().atan2(nb.as_f64()), false)),
        _ => unreachable!("handled above"),
    }
}

fn eval_variadic(op: VariadicOp, items: &[Expr], ctx: &EvalContext) -> anyhow::Result<Value> {
    use VariadicOp::*;
    match op {
        And => {
            for item in items {
                if !is_truthy(&eval_expr(item, ctx)?) {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        Or => {
            for item in items {
                if is_truthy(&eval_expr(item, ctx)?) {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        IfNull => {
            for item in items {
                let v = eval_expr(item, ctx)?;
                if !v.is_null() {
                    return Ok(v);
                }
            }
            Ok(Value::Null)
        }
        Add => {
            let mut sum_int: i64 = 0;
            let mut sum_float = 0.0;
            let mut saw_float = false;
            for item in items {
                let v = eval_expr(item, ctx)?;
                match coerce_numeric(&v) {
                    Some(Numeric::Int(i)) => sum_int += i,
                    Some(Numeric::Float(f)) => {
                        saw_float = true;
                        sum_float += f;
                    }
                    None => return Ok(Value::Null),
                }
            }
            if saw_float {
                Ok(number(sum_float + sum_int as f64, false))
            } else {
                Ok(Value::from(sum_int))
            }
        }
        Multiply => {
            let mut prod_int: i64 = 1;
            let mut prod_float = 1.0;
            let mut saw_float = false;
            for item in items {
                let v = eval_expr(item, ctx)?;
                match coerce_numeric(&v) {
                    Some(Numeric::Int(i)) => prod_int *= i,
                    Some(Numeric::Float(f)) => {
                        saw_float = true;
                        prod_float *= f;
                    }
                    None => return Ok(Value::Null),
                }
            }
            if saw_float {
                Ok(number(prod_float * prod_int as f64, false))
            } else {
                Ok(Value::from(prod_int))
            }
        }
        Concat => {
            let mut out = String::new();
            for item in items {
                let v = eval_expr(item, ctx)?;
                if v.is_null() {
                    return Ok(Value::Null);
                }
                out.push_str(&string_arg(v));
            }
            Ok(Value::String(out))
        }
        ConcatArrays => {
            let mut out = Vec::new();
            for item in items {
                let v = eval_expr(item, ctx)?;
                match v {
                    Value::Array(xs) => out.extend(xs),
                    Value::Null => return Ok(Value::Null),
                    _ => anyhow::bail!("$concatArrays requires arrays"),
                }
            }
            Ok(Value::Array(out))
        }
        SetEquals => {
            let mut sets = Vec::new();
            for item in items {
                match eval_expr(item, ctx)? {
                    Value::Array(xs) => sets.push(xs),
                    _ => anyhow::bail!("$setEquals requires arrays"),
                }
            }
            anyhow::ensure!(sets.len() >= 2, "$setEquals requires at least 2 arrays");
            let first = &sets[0];
            let equal = sets.iter().all(|s| {
                s.iter().all(|x| first.iter().any(|y| values_equal(x, y)))
                    && first.iter().all(|x| s.iter().any(|y| values_equal(x, y)))
            });
            Ok(Value::Bool(equal))
        }
        SetIntersection => {
            let mut sets = Vec::new();
            for item in items {
                match eval_expr(item, ctx)? {
                    Value::Array(xs) => sets.push(xs),
                    Value::Null => return Ok(Value::Null),
                    _ => anyhow::bail!("$setIntersection requires arrays"),
                }
            }
            let Some((first, rest)) = sets.split_first() else {
                return Ok(Value::Array(Vec::new()));
            };
            let mut out: Vec<Value> = Vec::new();
            for x in first {
                if rest.iter().all(|s| s.iter().any(|y| values_equal(x, y)))
                    && !out.iter().any(|o| values_equal(o, x))
                {
                    out.push(x.clone());
                }
            }
            Ok(Value::Array(out))
        }
        SetUnion => {
            let mut out: Vec<Value> = Vec::new();
            for item in items {
                match eval_expr(item, ctx)? {
                    Value::Array(xs) => {
                        for x in xs {
                            if !out.iter().any(|o| values_equal(o, &x)) {
                                out.push(x);
                            }
                        }
                    }
                    Value::Null => return Ok(Value::Null),
                    _ => anyhow::bail!("$setUnion requires arrays"),
                }
            }
            Ok(Value::Array(out))
        }
    }
}

fn convert_value(v: &Value, target: &str) -> anyhow::Result<Value> {
    match target {
        "int" | "long" => match v {
            Value::Number(n) => Ok(Value::from(
                n.as_i64()
                    .or_else(|| n.as_f64().map(|f| f as i64))
                    .ok_or_else(|| anyhow::anyhow!("cannot convert to integer"))?,
            )),
            Value::Bool(b) => Ok(Value::from(*b as i64)),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| anyhow::anyhow!("cannot convert {s:?} to integer")),
            _ => anyhow::bail!("cannot convert {} to integer", type_name(v)),
        },
        "double" | "decimal" => match v {
            Value::Number(n) => Ok(number(
                n.as_f64().ok_or_else(|| anyhow::anyhow!("bad number"))?,
                false,
            )),
            Value::Bool(b) => Ok(number(*b as i64 as f64, false)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(|f| number(f, false))
                .map_err(|_| anyhow::anyhow!("cannot convert {s:?} to double")),
            _ => anyhow::bail!("cannot convert {} to double", type_name(v)),
        },
        "bool" => match v {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) => Ok(Value::Bool(n.as_f64() != Some(0.0))),
            Value::String(_) => Ok(Value::Bool(true)),
            _ => anyhow::bail!("cannot convert {} to bool", type_name(v)),
        },
        "string" => match v {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => anyhow::bail!("cannot convert {} to string", type_name(v)),
        },
        "date" => match crate::datetime::parse_json_datetime(v) {
            Some(dt) => Ok(Value::String(crate::datetime::to_iso_string(&dt))),
            None => anyhow::bail!("cannot convert {} to date", type_name(v)),
        },
        "objectId" => match v {
            Value::String(s) => crate::objectid::ObjectId::parse_str(s)
                .map(|oid| oid.to_value())
                .map_err(|_| anyhow::anyhow!("cannot convert {s:?} to ObjectId")),
            other if crate::objectid::is_objectid_value(other) => Ok(other.clone()),
            _ => anyhow::bail!("cannot convert {} to ObjectId", type_name(v)),
        },
        "binData" => match v {
            Value::String(s) => Ok(crate::binary::Binary::new(s.as_bytes().to_vec()).to_value()),
            other if crate::binary::is_binary_value(other) => Ok(other.clone()),
            _ => anyhow::bail!("cannot convert {} to binData", type_name(v)),
        },
        other => anyhow::bail!("unknown conversion target: {other}"),
    }
}

pub fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(_) => "long",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) if crate::objectid::is_objectid_value(v) => "objectId",
        Value::Object(_) if crate::binary::is_binary_value(v) => "binData",
        Value::Object(_) => "object",
    }
}
