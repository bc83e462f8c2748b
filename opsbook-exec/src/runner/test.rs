use opsbook_core::expr::{eval_cond, explain};
use opsbook_core::store::{CURRENT_KEY, INCLUDED_KEY, PREVIOUS_KEY};
use serde_json::Value;

use super::{RunnerError, StepHandle};

pub struct TestRunner;

impl TestRunner {
    /// A false condition fails the step; the error carries the evaluation
    /// tree so the failing operand is visible.
    pub async fn run(&self, h: &mut StepHandle<'_>, cond: &str) -> Result<(), RunnerError> {
        let mut snapshot = h.store.to_map();
        snapshot.insert(INCLUDED_KEY.to_string(), Value::Bool(h.included));
        if let Some(previous) = h.store.previous() {
            snapshot.insert(PREVIOUS_KEY.to_string(), previous.clone());
        }
        if let Some(latest) = h.store.latest() {
            snapshot.insert(CURRENT_KEY.to_string(), latest.clone());
        }
        let env = h.store.env(&snapshot);
        if !eval_cond(cond, &env)? {
            return Err(RunnerError::TestFailed {
                cond: cond.to_string(),
                tree: explain(cond, &env),
            });
        }
        Ok(())
    }
}
