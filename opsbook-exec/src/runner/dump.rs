use std::io::Write;
use std::path::PathBuf;

use opsbook_core::expr::{eval, eval_expand};
use opsbook_core::step::DumpRequest;
use opsbook_core::store::{CURRENT_KEY, INCLUDED_KEY, PREVIOUS_KEY};
use serde_json::Value;

use super::{RunnerError, StepHandle};

pub struct DumpRunner;

impl DumpRunner {
    /// Evaluate the dump expression against a snapshot augmented with
    /// `previous`/`current` and write it out. `first` means no primary
    /// runner recorded this step yet; the record happens here, after the
    /// evaluation, so `previous` still points at the prior step.
    pub async fn run(
        &self,
        h: &mut StepHandle<'_>,
        req: &DumpRequest,
        first: bool,
    ) -> Result<(), RunnerError> {
        let mut snapshot = h.store.to_map();
        snapshot.insert(INCLUDED_KEY.to_string(), Value::Bool(h.included));
        if first {
            if let Some(latest) = h.store.latest() {
                snapshot.insert(PREVIOUS_KEY.to_string(), latest.clone());
            }
        } else {
            if let Some(previous) = h.store.previous() {
                snapshot.insert(PREVIOUS_KEY.to_string(), previous.clone());
            }
            if let Some(latest) = h.store.latest() {
                snapshot.insert(CURRENT_KEY.to_string(), latest.clone());
            }
        }
        let env = h.store.env(&snapshot);

        let value = eval(&req.expr, &env)?;
        let rendered = render(&value)?;

        match &req.out {
            None => {
                let mut out = h
                    .out
                    .lock()
                    .map_err(|_| RunnerError::Transport("output sink poisoned".to_string()))?;
                out.write_all(&rendered)?;
                out.write_all(b"\n")?;
            }
            Some(out_expr) => {
                let path = match eval_expand(&Value::String(out_expr.clone()), &env)? {
                    Value::String(p) => PathBuf::from(p),
                    other => {
                        return Err(RunnerError::invalid(
                            "dump",
                            format!("out must expand to a path, got {other}"),
                        ))
                    }
                };
                let path = if path.is_absolute() {
                    path
                } else {
                    h.root.join(path)
                };
                std::fs::write(&path, &rendered)?;
            }
        }

        if first {
            h.store.record(serde_json::Map::new());
        }
        Ok(())
    }
}

// Strings (including the function sentinel) write verbatim; everything
// else as indented JSON.
fn render(value: &Value) -> Result<Vec<u8>, RunnerError> {
    Ok(match value {
        Value::String(s) => s.clone().into_bytes(),
        other => serde_json::to_string_pretty(other)
            .map_err(|e| RunnerError::invalid("dump", e.to_string()))?
            .into_bytes(),
    })
}
