//! Protocol runners and the uniform contract they satisfy.
//!
//! A runner receives the ambient step handle (store, capturers, book root)
//! explicitly at invocation; it owns no operator state. Each `run` emits its
//! capture events and records exactly one result mapping through the store
//! (side-runners piggy-back on the primary's record, see the operator).

pub mod bind;
pub mod cdp;
pub mod db;
pub mod dump;
pub mod exec;
pub mod grpc;
pub mod http;
pub mod test;

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use opsbook_core::expr::ExprError;
use opsbook_core::store::Store;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::capture::CapturerList;

/// Where `dump` steps without an `out:` path write to.
pub type OutSink = Arc<Mutex<Box<dyn Write + Send>>>;

pub fn stdout_sink() -> OutSink {
    Arc::new(Mutex::new(Box::new(std::io::stdout())))
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("invalid {kind} request: {reason}")]
    InvalidRequest { kind: &'static str, reason: String },
    #[error("{0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to resolve methods: {0}")]
    Resolve(String),
    #[error("cannot find method: {0}")]
    MethodNotFound(String),
    #[error("condition ({cond}) is not true\n{tree}")]
    TestFailed { cond: String, tree: String },
    #[error("bind name is reserved: {0}")]
    ReservedBindName(String),
    #[error("no CDP driver is installed for runner {0}")]
    NoCdpDriver(String),
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    pub(crate) fn invalid(kind: &'static str, reason: impl Into<String>) -> Self {
        RunnerError::InvalidRequest {
            kind,
            reason: reason.into(),
        }
    }
}

/// The operator-owned state a runner may touch during one step, passed
/// explicitly instead of a stored back-pointer.
pub struct StepHandle<'a> {
    pub store: &'a mut Store,
    pub capturers: &'a CapturerList,
    /// Directory relative paths (dump targets, included books) resolve
    /// against.
    pub root: &'a Path,
    pub included: bool,
    pub skip_test: bool,
    pub out: &'a OutSink,
}

impl StepHandle<'_> {
    /// Expand `{{ }}` templates in a raw request mapping against the
    /// current snapshot.
    pub fn expand(&self, raw: &Map<String, Value>) -> Result<Map<String, Value>, RunnerError> {
        let snapshot = self.store.to_map();
        let env = self.store.env(&snapshot);
        match opsbook_core::expr::eval_expand(&Value::Object(raw.clone()), &env)? {
            Value::Object(m) => Ok(m),
            other => Err(RunnerError::invalid(
                "step",
                format!("expanded request is not a mapping: {other}"),
            )),
        }
    }
}

/// Multi-valued header map (HTTP headers, gRPC metadata) rendered the way
/// results store them: name to list of values.
pub(crate) fn headers_to_value<'a, I>(pairs: I) -> Value
where
    I: IntoIterator<Item = (&'a str, String)>,
{
    let mut m = Map::new();
    for (name, value) in pairs {
        match m.entry(name.to_string()).or_insert_with(|| Value::Array(Vec::new())) {
            Value::Array(values) => values.push(Value::String(value)),
            _ => {}
        }
    }
    Value::Object(m)
}
