//! SQL emission back-end for the expression AST. Returns `None` for
//! shapes with no SQL analogue; those evaluate host-side. Semantics of
//! emitted SQL must agree with `expr::eval_expr`.

use crate::aggregation::expr::{
    BinaryOp, DatePart, Expr, TrimMode, UnaryOp, VariadicOp, parse_expr,
};
use crate::error::{Error, Result};
use crate::translate::{SqlParams, escape_sql, field_expr};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

/// Emit SQL for an expression, for inlining into `$project`,
/// `$addFields`, `$group` accumulators, and `$expr`.
pub fn expr_to_sql(expr: &Expr) -> Option<(String, SqlParams)> {
    match expr {
        Expr::Literal(v) => literal_sql(v),
        Expr::FieldRef(path) => {
            if path.contains('[') || crate::translate::path_has_numeric_segment(path) {
                return None;
            }
            Some((field_expr(path), Vec::new()))
        }
        Expr::Variable(name) => match name.as_str() {
            "ROOT" | "CURRENT" => Some(("json(data)".to_string(), Vec::new())),
            _ => None,
        },
        Expr::Object(fields) => {
            let mut parts = Vec::new();
            let mut params = Vec::new();
            for (key, sub) in fields {
                let (sql, p) = expr_to_sql(sub)?;
                parts.push(format!("'{}', {}", escape_sql(key), sql));
                params.extend(p);
            }
            Some((format!("json_object({})", parts.join(", ")), params))
        }
        Expr::Array(items) => {
            let mut parts = Vec::new();
            let mut params = Vec::new();
            for item in items {
                let (sql, p) = expr_to_sql(item)?;
                parts.push(sql);
                params.extend(p);
            }
            Some((format!("json_array({})", parts.join(", ")), params))
        }
        Expr::Unary(op, inner) => unary_sql(*op, inner),
        Expr::Binary(op, a, b) => binary_sql(*op, a, b),
        Expr::Variadic(op, items) => variadic_sql(*op, items),
        Expr::Round { input, place } => {
            let (input_sql, mut params) = expr_to_sql(input)?;
            match place {
                Some(place) => {
                    let (place_sql, p) = expr_to_sql(place)?;
                    params.extend(p);
                    Some((format!("round({input_sql}, {place_sql})"), params))
                }
                None => Some((format!("round({input_sql})"), params)),
            }
        }
        Expr::Cond {
            if_expr,
            then,
            else_expr,
        } => {
            let (c, mut params) = expr_to_sql(if_expr)?;
            let (t, pt) = expr_to_sql(then)?;
            let (e, pe) = expr_to_sql(else_expr)?;
            params.extend(pt);
            params.extend(pe);
            Some((format!("CASE WHEN {c} THEN {t} ELSE {e} END"), params))
        }
        Expr::Switch { branches, default } => {
            let mut sql = String::from("CASE");
            let mut params = Vec::new();
            for (case, then) in branches {
                let (c, pc) = expr_to_sql(case)?;
                let (t, pt) = expr_to_sql(then)?;
                sql.push_str(&format!(" WHEN {c} THEN {t}"));
                params.extend(pc);
                params.extend(pt);
            }
            match default {
                Some(d) => {
                    let (e, pe) = expr_to_sql(d)?;
                    sql.push_str(&format!(" ELSE {e}"));
                    params.extend(pe);
                }
                None => return None,
            }
            sql.push_str(" END");
            Some((sql, params))
        }
        Expr::Substr {
            string,
            start,
            length,
        } => {
            let (s, mut params) = expr_to_sql(string)?;
            let (st, p1) = expr_to_sql(start)?;
            let (len, p2) = expr_to_sql(length)?;
            params.extend(p1);
            params.extend(p2);
            Some((format!("substr({s}, ({st}) + 1, {len})"), params))
        }
        Expr::IndexOfCp { string, substring } => {
            let (s, mut params) = expr_to_sql(string)?;
            let (sub, p) = expr_to_sql(substring)?;
            params.extend(p);
            Some((format!("(instr({s}, {sub}) - 1)"), params))
        }
        Expr::Trim { input, chars, mode } => {
            let func = match mode {
                TrimMode::Both => "trim",
                TrimMode::Left => "ltrim",
                TrimMode::Right => "rtrim",
            };
            let (s, mut params) = expr_to_sql(input)?;
            match chars {
                Some(chars) => {
                    let (c, p) = expr_to_sql(chars)?;
                    params.extend(p);
                    Some((format!("{func}({s}, {c})"), params))
                }
                None => Some((format!("{func}({s})"), params)),
            }
        }
        Expr::Replace {
            input,
            find,
            replacement,
            all,
        } => {
            // SQLite replace() replaces every occurrence.
            if !*all {
                return None;
            }
            let (s, mut params) = expr_to_sql(input)?;
            let (f, p1) = expr_to_sql(find)?;
            let (r, p2) = expr_to_sql(replacement)?;
            params.extend(p1);
            params.extend(p2);
            Some((format!("replace({s}, {f}, {r})"), params))
        }
        Expr::RegexMatch { .. } => None,
        Expr::DatePart(part, date) => {
            let (d, params) = expr_to_sql(date)?;
            let sql = match part {
                DatePart::DayOfWeek => {
                    format!("(CAST(strftime('%w', {d}) AS INTEGER) + 1)")
                }
                other => {
                    let code = match other {
                        DatePart::Year => "%Y",
                        DatePart::Month => "%m",
                        DatePart::DayOfMonth => "%d",
                        DatePart::Hour => "%H",
                        DatePart::Minute => "%M",
                        DatePart::Second => "%S",
                        DatePart::DayOfWeek => unreachable!(),
                    };
                    format!("CAST(strftime('{code}', {d}) AS INTEGER)")
                }
            };
            Some((sql, params))
        }
        Expr::DateToString { date, format } => {
            let (d, params) = expr_to_sql(date)?;
            let fmt = strftime_format(format.as_deref().unwrap_or("%Y-%m-%dT%H:%M:%S"))?;
            Some((format!("strftime('{}', {d})", escape_sql(&fmt)), params))
        }
        Expr::DateFromString { date_string } => {
            let (d, params) = expr_to_sql(date_string)?;
            Some((format!("strftime('%Y-%m-%dT%H:%M:%S', {d})"), params))
        }
        Expr::Slice { .. } | Expr::Convert { .. } => None,
    }
}

fn literal_sql(v: &Value) -> Option<(String, SqlParams)> {
    match v {
        // Booleans bind as 0/1, the shape json_extract gives them.
        Value::Null => Some(("NULL".to_string(), Vec::new())),
        Value::Bool(b) => Some(("?".to_string(), vec![SqlValue::Integer(*b as i64)])),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(("?".to_string(), vec![SqlValue::Integer(i)]))
            } else {
                n.as_f64().map(|f| ("?".to_string(), vec![SqlValue::Real(f)]))
            }
        }
        Value::String(s) => Some(("?".to_string(), vec![SqlValue::Text(s.clone())])),
        Value::Array(_) | Value::Object(_) => Some((
            "json(?)".to_string(),
            vec![SqlValue::Text(v.to_string())],
        )),
    }
}

fn unary_sql(op: UnaryOp, inner: &Expr) -> Option<(String, SqlParams)> {
    use UnaryOp::*;
    let (x, params) = expr_to_sql(inner)?;
    let sql = match op {
        Abs => format!("abs({x})"),
        Ceil => format!("CAST(ceil({x}) AS INTEGER)"),
        Floor => format!("CAST(floor({x}) AS INTEGER)"),
        Sqrt => format!("sqrt({x})"),
        Exp => format!("exp({x})"),
        Ln => format!("ln({x})"),
        Log10 => format!("log10({x})"),
        Sin => format!("sin({x})"),
        Cos => format!("cos({x})"),
        Tan => format!("tan({x})"),
        Asin => format!("asin({x})"),
        Acos => format!("acos({x})"),
        Atan => format!("atan({x})"),
        Sinh => format!("sinh({x})"),
        Cosh => format!("cosh({x})"),
        Tanh => format!("tanh({x})"),
        RadiansToDegrees => format!("degrees({x})"),
        DegreesToRadians => format!("radians({x})"),
        Not => format!("(NOT ({x}))"),
        ToUpper => format!("upper({x})"),
        ToLower => format!("lower({x})"),
        StrLenCp => format!("length({x})"),
        StrLenBytes => format!("length(CAST({x} AS BLOB))"),
        Size => format!("json_array_length({x})"),
        IsArray => format!("(json_type({x}) = 'array')"),
        ToInt | ToLong => format!("CAST({x} AS INTEGER)"),
        ToDouble | ToDecimal => format!("CAST({x} AS REAL)"),
        ToString => format!("CAST({x} AS TEXT)"),
        ToDate => format!("strftime('%Y-%m-%dT%H:%M:%S', {x})"),
        ReverseArray | AnyElementTrue | AllElementsTrue | ToBool | ToObjectId | ToBinData
        | ToRegex | Type => return None,
    };
    Some((sql, params))
}

fn binary_sql(op: BinaryOp, a: &Expr, b: &Expr) -> Option<(String, SqlParams)> {
    use BinaryOp::*;
    if op == Cmp {
        // Both operands are emitted twice; their parameters bind twice.
        let (x, px) = expr_to_sql(a)?;
        let (y, py) = expr_to_sql(b)?;
        let mut params = px.clone();
        params.extend(py.clone());
        params.extend(px);
        params.extend(py);
        return Some((
            format!("(CASE WHEN {x} < {y} THEN -1 WHEN {x} = {y} THEN 0 ELSE 1 END)"),
            params,
        ));
    }
    if op == ArrayElemAt {
        // Only constant indexes inline as a JSON path.
        let idx = match b {
            Expr::Literal(Value::Number(n)) => n.as_i64()?,
            _ => return None,
        };
        let path = if idx >= 0 {
            format!("$[{idx}]")
        } else {
            format!("$[#{idx}]")
        };
        let (arr_sql, arr_params) = expr_to_sql(a)?;
        return Some((format!("json_extract({arr_sql}, '{path}')"), arr_params));
    }
    let (x, mut params) = expr_to_sql(a)?;
    let (y, p) = expr_to_sql(b)?;
    params.extend(p);
    let sql = match op {
        Subtract => format!("({x} - {y})"),
        Divide => format!("(CAST({x} AS REAL) / {y})"),
        Mod => format!("({x} % {y})"),
        Pow => format!("pow({x}, {y})"),
        Log => format!("log({y}, {x})"),
        Atan2 => format!("atan2({x}, {y})"),
        Eq => format!("({x} = {y})"),
        Ne => format!("({x} != {y})"),
        Gt => format!("({x} > {y})"),
        Gte => format!("({x} >= {y})"),
        Lt => format!("({x} < {y})"),
        Lte => format!("({x} <= {y})"),
        Cmp => unreachable!("handled above"),
        In => format!("({x} IN (SELECT value FROM json_each({y})))"),
        ArrayElemAt => unreachable!("handled above"),
        Split | SetDifference | SetIsSubset => return None,
    };
    Some((sql, params))
}

fn variadic_sql(op: VariadicOp, items: &[Expr]) -> Option<(String, SqlParams)> {
    use VariadicOp::*;
    let mut parts = Vec::new();
    let mut params = Vec::new();
    for item in items {
        let (sql, p) = expr_to_sql(item)?;
        parts.push(sql);
        params.extend(p);
    }
    if parts.is_empty() {
        return None;
    }
    let sql = match op {
        Add => format!("({})", parts.join(" + ")),
        Multiply => format!("({})", parts.join(" * ")),
        And => format!("({})", parts.join(" AND ")),
        Or => format!("({})", parts.join(" OR ")),
        Concat => format!("({})", parts.join(" || ")),
        IfNull => format!("coalesce({})", parts.join(", ")),
        ConcatArrays | SetEquals | SetIntersection | SetUnion => return None,
    };
    Some((sql, params))
}

/// Translate a MongoDB date format string to `strftime` codes.
fn strftime_format(format: &str) -> Option<String> {
    let mut out = String::with_capacity(format.len());
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            code @ ('Y' | 'm' | 'd' | 'H' | 'M' | 'S' | 'j' | 'w') => {
                out.push('%');
                out.push(code);
            }
            'L' => out.push_str("%f"),
            '%' => out.push('%'),
            _ => return None,
        }
    }
    Some(out)
}

/// SQL for a `$expr` predicate. The expression must produce a boolean;
/// non-boolean top-level shapes fall back to host evaluation.
pub fn boolean_expr_sql(value: &Value) -> Result<Option<(String, SqlParams)>> {
    let expr = parse_expr(value).map_err(|e| Error::MalformedQuery(e.to_string()))?;
    if !is_boolean_shape(&expr) {
        return Ok(None);
    }
    Ok(expr_to_sql(&expr))
}

fn is_boolean_shape(expr: &Expr) -> bool {
    match expr {
        Expr::Binary(op, _, _) => matches!(
            op,
            BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Gt
                | BinaryOp::Gte
                | BinaryOp::Lt
                | BinaryOp::Lte
                | BinaryOp::In
        ),
        Expr::Variadic(op, _) => matches!(op, VariadicOp::And | VariadicOp::Or),
        Expr::Unary(UnaryOp::Not | UnaryOp::IsArray, _) => true,
        Expr::Cond {
            then, else_expr, ..
        } => is_boolean_shape(then) && is_boolean_shape(else_expr),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn emit(expr: serde_json::Value) -> Option<(String, SqlParams)> {
        expr_to_sql(&parse_expr(&expr).unwrap())
    }

    #[test]
    fn field_ref_and_literal() {
        let (sql, params) = emit(json!({"$add": ["$a", 5]})).unwrap();
        assert_eq!(sql, r#"(json_extract(data, '$."a"') + ?)"#);
        assert_eq!(params, vec![SqlValue::Integer(5)]);
    }

    #[test]
    fn cond_emits_case() {
        let (sql, _) =
            emit(json!({"$cond": {"if": {"$gt": ["$a", 1]}, "then": 1, "else": 0}})).unwrap();
        assert!(sql.starts_with("CASE WHEN"));
        assert!(sql.contains("THEN"));
    }

    #[test]
    fn divide_forces_real() {
        let (sql, _) = emit(json!({"$divide": ["$a", "$b"]})).unwrap();
        assert!(sql.contains("CAST"));
        assert!(sql.contains("AS REAL"));
    }

    #[test]
    fn set_operators_fall_back() {
        assert!(emit(json!({"$setUnion": [["$a"], ["$b"]]})).is_none());
        assert!(emit(json!({"$convert": {"input": "$a", "to": "int"}})).is_none());
    }

    #[test]
    fn boolean_expr_gate() {
        let ok = boolean_expr_sql(&json!({"$ne": [{"$multiply": ["$a", "$b"]}, "$total"]}))
            .unwrap();
        assert!(ok.is_some());
        let not_boolean = boolean_expr_sql(&json!({"$add": ["$a", 1]})).unwrap();
        assert!(not_boolean.is_none());
    }

    #[test]
    fn date_part_sql() {
        let (sql, _) = emit(json!({"$year": "$ts"})).unwrap();
        assert!(sql.contains("strftime('%Y'"));
        assert!(sql.contains("AS INTEGER"));
    }
}
