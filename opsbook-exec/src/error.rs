use opsbook_core::error::{ConfigError, ParseError};
use opsbook_core::expr::ExprError;
use opsbook_core::BookError;
use thiserror::Error;

use crate::runner::RunnerError;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("{kind} failed on {step}: {source}")]
    Step {
        kind: &'static str,
        step: String,
        #[source]
        source: Box<ExecError>,
    },
    #[error("loop condition ({until}) was not satisfied after {count} iterations\n{tree}")]
    LoopExhausted {
        until: String,
        count: usize,
        tree: String,
    },
    #[error("before hook {index} failed: {message}")]
    BeforeFunc { index: usize, message: String },
    #[error("after hook {index} failed: {message}")]
    AfterFunc { index: usize, message: String },
    #[error("failed to run {book}: {source}")]
    Book {
        book: String,
        #[source]
        source: Box<ExecError>,
    },
    #[error("failed to join operator task: {0}")]
    TaskJoin(String),
    #[error("no books match {0:?}")]
    NoBooks(String),
    #[error("invalid run filter: {0}")]
    RunMatch(#[from] regex::Error),
}

impl From<BookError> for ExecError {
    fn from(e: BookError) -> Self {
        match e {
            BookError::Parse(e) => ExecError::Parse(e),
            BookError::Config(e) => ExecError::Config(e),
        }
    }
}

impl ExecError {
    /// Wrap a step-fn error as `"<kind> failed on <step>"`.
    pub(crate) fn on_step(self, kind: &'static str, step: String) -> Self {
        ExecError::Step {
            kind,
            step,
            source: Box::new(self),
        }
    }
}
