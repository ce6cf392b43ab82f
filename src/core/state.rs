use std::sync::Arc;
use std::time::Duration;

use crate::core::{config::Settings, redis::RedisHandle};
use crate::grading::credentials::CredentialPool;
use crate::grading::dispatcher::Dispatcher;
use crate::grading::drain::{DrainController, DrainPolicy};
use crate::grading::monitor::Monitor;
use crate::grading::scorer::Scorer;
use crate::grading::store::JobStore;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    jobs: Arc<dyn JobStore>,
    credentials: CredentialPool,
    scorer: Arc<dyn Scorer>,
    redis: RedisHandle,
}

impl AppState {
    pub(crate) fn new(
        settings: Settings,
        jobs: Arc<dyn JobStore>,
        credentials: CredentialPool,
        scorer: Arc<dyn Scorer>,
        redis: RedisHandle,
    ) -> Self {
        Self { inner: Arc::new(InnerState { settings, jobs, credentials, scorer, redis }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.inner.jobs
    }

    pub(crate) fn credentials(&self) -> &CredentialPool {
        &self.inner.credentials
    }

    pub(crate) fn redis(&self) -> &RedisHandle {
        &self.inner.redis
    }

    pub(crate) fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            self.inner.jobs.clone(),
            self.inner.credentials.clone(),
            self.inner.scorer.clone(),
            Duration::from_secs(self.inner.settings.scorer().timeout_seconds),
        )
    }

    pub(crate) fn drain_controller(&self) -> DrainController {
        DrainController::new(
            self.dispatcher(),
            self.inner.jobs.clone(),
            self.inner.credentials.size(),
            DrainPolicy::from_settings(&self.inner.settings),
        )
    }

    pub(crate) fn monitor(&self) -> Monitor {
        Monitor::new(self.inner.jobs.clone(), self.inner.credentials.clone())
    }
}
