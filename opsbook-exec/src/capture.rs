//! Lifecycle observers. Every event is broadcast to each registered
//! capturer in order; capturers never mutate the store or the steps.

use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::runner::grpc::GrpcMode;

#[derive(Debug, Clone)]
pub enum CaptureEvent {
    RunbookStart {
        trail: Vec<String>,
        path: Option<String>,
        desc: String,
    },
    RunbookEnd {
        trail: Vec<String>,
        path: Option<String>,
        desc: String,
    },
    RunbookSuccess {
        desc: String,
    },
    RunbookFailure {
        desc: String,
        error: String,
    },
    RunbookSkipped {
        desc: String,
    },
    StepStart {
        step: String,
        runner: String,
    },
    StepSkipped {
        step: String,
    },
    HttpRequest {
        runner: String,
        method: String,
        url: String,
    },
    HttpResponse {
        runner: String,
        status: u16,
    },
    DbQuery {
        runner: String,
        stmt: String,
    },
    DbResult {
        runner: String,
        result: Value,
    },
    ExecCommand {
        command: String,
    },
    CdpActions {
        runner: String,
    },
    GrpcStart {
        runner: String,
        mode: GrpcMode,
        service: String,
        method: String,
    },
    GrpcEnd {
        runner: String,
        mode: GrpcMode,
        service: String,
        method: String,
    },
    GrpcRequestHeaders(Value),
    GrpcRequestMessage(Value),
    GrpcResponseStatus(i32),
    GrpcResponseHeaders(Value),
    GrpcResponseTrailers(Value),
    GrpcResponseMessage(Value),
    GrpcClientClose,
}

#[async_trait]
pub trait Capturer: Send + Sync {
    async fn capture(&self, event: &CaptureEvent);
}

/// Broadcast fan-out over the registered capturers. Cloning shares the
/// underlying list, which is how included runbooks inherit their parent's
/// observers.
#[derive(Clone, Default)]
pub struct CapturerList {
    inner: Arc<Vec<Arc<dyn Capturer>>>,
}

impl CapturerList {
    pub fn new(capturers: Vec<Arc<dyn Capturer>>) -> Self {
        Self {
            inner: Arc::new(capturers),
        }
    }

    /// A new list with `extra` appended after the existing capturers.
    pub fn with(&self, extra: Arc<dyn Capturer>) -> Self {
        let mut all: Vec<Arc<dyn Capturer>> = self.inner.iter().cloned().collect();
        all.push(extra);
        Self {
            inner: Arc::new(all),
        }
    }

    pub async fn capture(&self, event: CaptureEvent) {
        for c in self.inner.iter() {
            c.capture(&event).await;
        }
    }
}

/// Human-readable step trace, attached when a book sets `debug: true`.
pub struct Debugger {
    out: Mutex<Box<dyn Write + Send>>,
}

impl Debugger {
    pub fn stderr() -> Self {
        Self::new(Box::new(std::io::stderr()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    fn line(&self, text: &str) {
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{text}");
        }
    }
}

#[async_trait]
impl Capturer for Debugger {
    async fn capture(&self, event: &CaptureEvent) {
        match event {
            CaptureEvent::RunbookStart { desc, path, .. } => match path {
                Some(p) => self.line(&format!("Run {desc:?} ({p})")),
                None => self.line(&format!("Run {desc:?}")),
            },
            CaptureEvent::RunbookSkipped { desc } => self.line(&format!("Skip {desc:?}")),
            CaptureEvent::RunbookFailure { desc, error } => {
                self.line(&format!("Failure {desc:?}: {error}"))
            }
            CaptureEvent::StepStart { step, runner } => {
                self.line(&format!("Run {runner:?} on {step}"))
            }
            CaptureEvent::StepSkipped { step } => self.line(&format!("Skip {step}")),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl Capturer for Recorder {
        async fn capture(&self, event: &CaptureEvent) {
            if let CaptureEvent::StepStart { step, .. } = event {
                if let Ok(mut seen) = self.0.lock() {
                    seen.push(step.clone());
                }
            }
        }
    }

    #[tokio::test]
    async fn broadcasts_to_every_capturer_in_order() {
        let a = Arc::new(Recorder(Mutex::new(Vec::new())));
        let b = Arc::new(Recorder(Mutex::new(Vec::new())));
        let list = CapturerList::new(vec![a.clone(), b.clone()]);
        list.capture(CaptureEvent::StepStart {
            step: "steps[0]".to_string(),
            runner: "req".to_string(),
        })
        .await;
        assert_eq!(a.0.lock().unwrap().as_slice(), ["steps[0]"]);
        assert_eq!(b.0.lock().unwrap().as_slice(), ["steps[0]"]);
    }
}
