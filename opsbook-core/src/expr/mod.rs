//! Expression evaluation over store snapshots.
//!
//! Step conditions, loop predicates, bind values, dump expressions and
//! `{{ }}` template substitution all go through this module. The language is
//! deliberately small: literals, path navigation into the snapshot,
//! comparisons with numeric coercion, short-circuit `&&`/`||`, unary `!`/`-`,
//! `+` for addition and string concatenation, and calls resolving
//! user-registered functions before builtins.

mod eval;
mod parser;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

pub use eval::{eval, eval_cond, eval_count, eval_expand, explain};

/// A callable registered under `funcs` in a book.
pub type Func = Arc<dyn Fn(&[Value]) -> Result<Value, ExprError> + Send + Sync>;

pub type FuncMap = BTreeMap<String, Func>;

/// Rendering used when an expression resolves to a registered function
/// rather than data.
pub const FUNC_SENTINEL: &str = "[function]";

/// Snapshot view an expression evaluates against.
#[derive(Clone, Copy)]
pub struct Env<'a> {
    pub data: &'a Map<String, Value>,
    pub funcs: Option<&'a FuncMap>,
}

impl<'a> Env<'a> {
    pub fn new(data: &'a Map<String, Value>) -> Self {
        Self { data, funcs: None }
    }

    pub fn with_funcs(data: &'a Map<String, Value>, funcs: &'a FuncMap) -> Self {
        Self {
            data,
            funcs: Some(funcs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("syntax error at byte {pos}: {msg}")]
    Syntax { pos: usize, msg: String },
    #[error("unknown name: {0}")]
    UnknownName(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("missing `{segment}` in `{expr}`")]
    MissingPath { expr: String, segment: String },
    #[error("type mismatch: {0}")]
    Type(String),
    #[error("expected a boolean condition, got {0}")]
    NotABool(String),
    #[error("expected a non-negative count, got {0}")]
    NotACount(String),
    #[error("{0}")]
    Func(String),
    #[error("unclosed {{{{ }}}} in {0:?}")]
    UnclosedTemplate(String),
}
