use async_trait::async_trait;
use opsbook_core::book::CdpConfig;
use serde_json::{Map, Value};

use crate::capture::CaptureEvent;

use super::{RunnerError, StepHandle};

/// Seam for a headless-browser driver. The engine ships no driver of its
/// own; embedders install one per runner.
#[async_trait]
pub trait CdpDriver: Send + Sync {
    async fn run_actions(
        &mut self,
        actions: &Map<String, Value>,
    ) -> Result<Map<String, Value>, RunnerError>;

    async fn close(&mut self) {}
}

pub struct CdpRunner {
    name: String,
    pub remote: String,
    driver: Option<Box<dyn CdpDriver>>,
}

impl CdpRunner {
    pub fn new(name: &str, cfg: &CdpConfig) -> Self {
        Self {
            name: name.to_string(),
            remote: cfg.remote.clone(),
            driver: None,
        }
    }

    pub fn install_driver(&mut self, driver: Box<dyn CdpDriver>) {
        self.driver = Some(driver);
    }

    pub async fn run(
        &mut self,
        h: &mut StepHandle<'_>,
        actions: Map<String, Value>,
    ) -> Result<(), RunnerError> {
        let Some(driver) = self.driver.as_mut() else {
            return Err(RunnerError::NoCdpDriver(self.name.clone()));
        };
        h.capturers
            .capture(CaptureEvent::CdpActions {
                runner: self.name.clone(),
            })
            .await;
        let result = driver.run_actions(&actions).await?;
        h.store.record(result);
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Some(driver) = self.driver.as_mut() {
            driver.close().await;
        }
    }
}
