#![forbid(unsafe_code)]

pub mod capture;
pub mod error;
pub mod operator;
pub mod operators;
pub mod profile;
pub mod result;
pub mod retry;
pub mod runner;

pub use crate::capture::{CaptureEvent, Capturer, CapturerList, Debugger};
pub use crate::error::ExecError;
pub use crate::operator::{AfterHook, BeforeHook, Operator, Options, RunnerPools};
pub use crate::operators::{LoadOptions, Operators};
pub use crate::profile::Stopwatch;
pub use crate::result::{RunNResult, RunResult};
pub use crate::runner::RunnerError;

/// Regex from this variable selects which book paths run (see
/// [`Operators::load`]).
pub const RUN_MATCH_ENV: &str = "OPSBOOK_RUN";
