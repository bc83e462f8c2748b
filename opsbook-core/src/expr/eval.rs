use serde_json::{Map, Value};

use super::parser::{parse, BinOp, Expr, Seg, UnaryOp};
use super::{Env, ExprError, FUNC_SENTINEL};

/// Evaluate an expression against a snapshot and return its raw value.
pub fn eval(src: &str, env: &Env<'_>) -> Result<Value, ExprError> {
    let expr = parse(src)?;
    eval_node(&expr, env)
}

/// Evaluate an expression that must produce a boolean.
pub fn eval_cond(src: &str, env: &Env<'_>) -> Result<bool, ExprError> {
    match eval(src, env)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::NotABool(other.to_string())),
    }
}

/// Evaluate an expression that must produce a non-negative integer.
pub fn eval_count(src: &str, env: &Env<'_>) -> Result<usize, ExprError> {
    let v = eval(src, env)?;
    match &v {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                return Ok(u as usize);
            }
            if let Some(f) = n.as_f64() {
                if f >= 0.0 && f.fract() == 0.0 {
                    return Ok(f as usize);
                }
            }
            Err(ExprError::NotACount(v.to_string()))
        }
        Value::String(s) => s
            .trim()
            .parse::<usize>()
            .map_err(|_| ExprError::NotACount(v.to_string())),
        _ => Err(ExprError::NotACount(v.to_string())),
    }
}

/// Recursively walk a composite value, substituting `{{ expr }}` occurrences
/// inside strings and inside both keys and values of nested mappings.
///
/// A string that is exactly one `{{ expr }}` becomes the expression's raw
/// value; otherwise each occurrence stringifies into the surrounding text.
pub fn eval_expand(v: &Value, env: &Env<'_>) -> Result<Value, ExprError> {
    match v {
        Value::String(s) => expand_str(s, env),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_expand(item, env)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                let key = match expand_str(k, env)? {
                    Value::String(s) => s,
                    other => stringify(&other),
                };
                out.insert(key, eval_expand(v, env)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Render the evaluation of a (typically failing) condition: the source
/// followed by each leaf operand and the value it resolved to.
pub fn explain(src: &str, env: &Env<'_>) -> String {
    let expr = match parse(src) {
        Ok(e) => e,
        Err(e) => return format!("{src}\n└── parse error: {e}"),
    };
    let mut leaves = Vec::new();
    collect_leaves(&expr, env, &mut leaves);
    let mut out = String::from(src);
    let n = leaves.len();
    for (i, (text, value)) in leaves.into_iter().enumerate() {
        let branch = if i + 1 == n { "└──" } else { "├──" };
        out.push_str(&format!("\n{branch} {text} => {value}"));
    }
    out
}

fn collect_leaves(expr: &Expr, env: &Env<'_>, out: &mut Vec<(String, String)>) {
    match expr {
        Expr::Binary { lhs, rhs, .. } => {
            collect_leaves(lhs, env, out);
            collect_leaves(rhs, env, out);
        }
        Expr::Unary { expr, .. } => collect_leaves(expr, env, out),
        leaf => {
            let value = match eval_node(leaf, env) {
                Ok(v) => v.to_string(),
                Err(e) => format!("error: {e}"),
            };
            out.push((leaf.to_string(), value));
        }
    }
}

fn expand_str(s: &str, env: &Env<'_>) -> Result<Value, ExprError> {
    if !s.contains("{{") {
        return Ok(Value::String(s.to_string()));
    }

    let trimmed = s.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") {
        let inner = &trimmed[2..trimmed.len() - 2];
        if !inner.contains("{{") && !inner.contains("}}") {
            return eval(inner.trim(), env);
        }
    }

    let mut out = String::new();
    let mut rest = s;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| ExprError::UnclosedTemplate(s.to_string()))?;
        let v = eval(after[..close].trim(), env)?;
        out.push_str(&stringify(&v));
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn eval_node(expr: &Expr, env: &Env<'_>) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(segs) => eval_path(expr, segs, env),
        Expr::Call { name, args } => eval_call(name, args, env),
        Expr::Unary { op, expr } => {
            let v = eval_node(expr, env)?;
            match op {
                UnaryOp::Not => match v {
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    other => Err(ExprError::Type(format!("cannot negate {other}"))),
                },
                UnaryOp::Neg => {
                    let n = v
                        .as_f64()
                        .ok_or_else(|| ExprError::Type(format!("cannot negate {v}")))?;
                    if let Some(i) = v.as_i64() {
                        Ok(Value::from(-i))
                    } else {
                        Ok(Value::from(-n))
                    }
                }
            }
        }
        Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, env),
    }
}

fn eval_path(whole: &Expr, segs: &[Seg], env: &Env<'_>) -> Result<Value, ExprError> {
    let root = match &segs[0] {
        Seg::Key(k) => k,
        Seg::Index(_) => return Err(ExprError::Type("path cannot start with an index".into())),
    };
    let Some(mut cur) = env.data.get(root) else {
        // A bare function name resolves to a sentinel so that dump output
        // has something printable for it.
        if segs.len() == 1 && env.funcs.map(|f| f.contains_key(root)).unwrap_or(false) {
            return Ok(Value::String(FUNC_SENTINEL.to_string()));
        }
        return Err(ExprError::UnknownName(root.clone()));
    };
    for seg in &segs[1..] {
        let next = match seg {
            Seg::Key(k) => cur.get(k),
            Seg::Index(i) => cur.get(i),
        };
        cur = next.ok_or_else(|| ExprError::MissingPath {
            expr: whole.to_string(),
            segment: match seg {
                Seg::Key(k) => k.clone(),
                Seg::Index(i) => i.to_string(),
            },
        })?;
    }
    Ok(cur.clone())
}

fn eval_call(name: &str, args: &[Expr], env: &Env<'_>) -> Result<Value, ExprError> {
    let mut values = Vec::with_capacity(args.len());
    for a in args {
        values.push(eval_node(a, env)?);
    }
    if let Some(f) = env.funcs.and_then(|funcs| funcs.get(name)) {
        return f(&values);
    }
    match name {
        "len" => match values.as_slice() {
            [Value::String(s)] => Ok(Value::from(s.chars().count())),
            [Value::Array(a)] => Ok(Value::from(a.len())),
            [Value::Object(m)] => Ok(Value::from(m.len())),
            _ => Err(ExprError::Type("len expects one string, array or map".into())),
        },
        "string" => match values.as_slice() {
            [v] => Ok(Value::String(stringify(v))),
            _ => Err(ExprError::Type("string expects one argument".into())),
        },
        "int" => match values.as_slice() {
            [Value::Number(n)] => n
                .as_f64()
                .map(|f| Value::from(f as i64))
                .ok_or_else(|| ExprError::Type("not a finite number".into())),
            [Value::String(s)] => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| ExprError::Type(format!("cannot parse {s:?} as int"))),
            _ => Err(ExprError::Type("int expects one number or string".into())),
        },
        _ => Err(ExprError::UnknownFunction(name.to_string())),
    }
}

fn eval_binary(op: BinOp, lhs: &Expr, rhs: &Expr, env: &Env<'_>) -> Result<Value, ExprError> {
    match op {
        BinOp::And | BinOp::Or => {
            let l = match eval_node(lhs, env)? {
                Value::Bool(b) => b,
                other => return Err(ExprError::Type(format!("{other} is not a boolean"))),
            };
            if (op == BinOp::And && !l) || (op == BinOp::Or && l) {
                return Ok(Value::Bool(l));
            }
            match eval_node(rhs, env)? {
                Value::Bool(b) => Ok(Value::Bool(b)),
                other => Err(ExprError::Type(format!("{other} is not a boolean"))),
            }
        }
        BinOp::Eq => Ok(Value::Bool(json_eq(
            &eval_node(lhs, env)?,
            &eval_node(rhs, env)?,
        ))),
        BinOp::Ne => Ok(Value::Bool(!json_eq(
            &eval_node(lhs, env)?,
            &eval_node(rhs, env)?,
        ))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let l = eval_node(lhs, env)?;
            let r = eval_node(rhs, env)?;
            let ord = json_cmp(&l, &r)
                .ok_or_else(|| ExprError::Type(format!("cannot compare {l} and {r}")))?;
            Ok(Value::Bool(match op {
                BinOp::Lt => ord.is_lt(),
                BinOp::Le => ord.is_le(),
                BinOp::Gt => ord.is_gt(),
                BinOp::Ge => ord.is_ge(),
                _ => unreachable!(),
            }))
        }
        BinOp::Add | BinOp::Sub => {
            let l = eval_node(lhs, env)?;
            let r = eval_node(rhs, env)?;
            match (&l, &r) {
                (Value::String(a), Value::String(b)) if op == BinOp::Add => {
                    Ok(Value::String(format!("{a}{b}")))
                }
                (Value::Number(a), Value::Number(b)) => {
                    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                        let n = if op == BinOp::Add { a + b } else { a - b };
                        Ok(Value::from(n))
                    } else {
                        let (a, b) = (
                            a.as_f64().unwrap_or(f64::NAN),
                            b.as_f64().unwrap_or(f64::NAN),
                        );
                        let n = if op == BinOp::Add { a + b } else { a - b };
                        Ok(Value::from(n))
                    }
                }
                _ => Err(ExprError::Type(format!(
                    "cannot apply `{}` to {l} and {r}",
                    op.symbol()
                ))),
            }
        }
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| json_eq(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).map(|bv| json_eq(v, bv)).unwrap_or(false))
        }
        _ => a == b,
    }
}

fn json_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::expr::FuncMap;

    fn data() -> Map<String, Value> {
        match json!({
            "vars": {"token": "abc", "retries": 3},
            "steps": [
                {"run": true, "res": {"status": 0, "message": {"msg": "hi"}}},
                {"run": false},
            ],
            "i": 2,
        }) {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn navigates_paths() {
        let data = data();
        let env = Env::new(&data);
        assert_eq!(eval("vars.token", &env).unwrap(), json!("abc"));
        assert_eq!(eval("steps[0].res.status", &env).unwrap(), json!(0));
        assert_eq!(eval("steps[1].run", &env).unwrap(), json!(false));
        assert!(matches!(
            eval("vars.nope", &env),
            Err(ExprError::MissingPath { .. })
        ));
        assert!(matches!(
            eval("nope", &env),
            Err(ExprError::UnknownName(_))
        ));
    }

    #[test]
    fn compares_with_numeric_coercion() {
        let data = data();
        let env = Env::new(&data);
        assert!(eval_cond("steps[0].res.status == 0", &env).unwrap());
        assert!(eval_cond("vars.retries >= 3", &env).unwrap());
        assert!(eval_cond("vars.token == 'abc' && i < 3", &env).unwrap());
        assert!(!eval_cond("steps[1].run || false", &env).unwrap());
    }

    #[test]
    fn cond_requires_boolean() {
        let data = data();
        let env = Env::new(&data);
        assert!(matches!(
            eval_cond("vars.token", &env),
            Err(ExprError::NotABool(_))
        ));
    }

    #[test]
    fn counts() {
        let data = data();
        let env = Env::new(&data);
        assert_eq!(eval_count("3", &env).unwrap(), 3);
        assert_eq!(eval_count("vars.retries", &env).unwrap(), 3);
        assert!(eval_count("-1", &env).is_err());
        assert!(eval_count("'x'", &env).is_err());
    }

    #[test]
    fn expands_templates() {
        let data = data();
        let env = Env::new(&data);
        // Whole-string template keeps the raw value.
        assert_eq!(
            eval_expand(&json!("{{ steps[0].res.message }}"), &env).unwrap(),
            json!({"msg": "hi"})
        );
        // Embedded templates stringify.
        assert_eq!(
            eval_expand(&json!("token={{ vars.token }}!"), &env).unwrap(),
            json!("token=abc!")
        );
        // Keys expand too.
        assert_eq!(
            eval_expand(&json!({"{{ vars.token }}": ["{{ i }}"]}), &env).unwrap(),
            json!({"abc": [2]})
        );
        assert!(matches!(
            eval_expand(&json!("{{ vars.token"), &env),
            Err(ExprError::UnclosedTemplate(_))
        ));
    }

    #[test]
    fn calls_user_funcs_before_builtins() {
        let data = data();
        let mut funcs: FuncMap = FuncMap::new();
        funcs.insert(
            "len".to_string(),
            Arc::new(|_args| Ok(json!(99))),
        );
        funcs.insert(
            "upper".to_string(),
            Arc::new(|args| match args {
                [Value::String(s)] => Ok(json!(s.to_uppercase())),
                _ => Err(ExprError::Func("upper expects one string".into())),
            }),
        );
        let env = Env::with_funcs(&data, &funcs);
        assert_eq!(eval("upper(vars.token)", &env).unwrap(), json!("ABC"));
        assert_eq!(eval("len(vars.token)", &env).unwrap(), json!(99));
        assert_eq!(eval("upper", &env).unwrap(), json!(FUNC_SENTINEL));
    }

    #[test]
    fn explains_failed_conditions() {
        let data = data();
        let env = Env::new(&data);
        let tree = explain("steps[0].res.status == 1", &env);
        assert!(tree.contains("steps[0].res.status == 1"));
        assert!(tree.contains("├── steps[0].res.status => 0"));
        assert!(tree.contains("└── 1 => 1"));
    }
}
