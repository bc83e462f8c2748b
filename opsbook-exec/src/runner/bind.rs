use opsbook_core::expr::eval;
use opsbook_core::store::RESERVED_KEYS;

use super::{RunnerError, StepHandle};

pub struct BindRunner;

impl BindRunner {
    /// Evaluate each target expression against one snapshot, then commit
    /// the results into the store's bound variables.
    pub async fn run(
        &self,
        h: &mut StepHandle<'_>,
        targets: &[(String, String)],
    ) -> Result<(), RunnerError> {
        let snapshot = h.store.to_map();
        let env = h.store.env(&snapshot);
        let mut bound = Vec::with_capacity(targets.len());
        for (name, expr) in targets {
            if RESERVED_KEYS.contains(&name.as_str()) {
                return Err(RunnerError::ReservedBindName(name.clone()));
            }
            bound.push((name.clone(), eval(expr, &env)?));
        }
        for (name, value) in bound {
            h.store.bind(name, value);
        }
        Ok(())
    }
}
