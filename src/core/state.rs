use std::sync::Arc;

use crate::core::{config::Settings, redis::RedisHandle};
use crate::repositories::ExamStore;
use crate::services::auto_submit::AutoSubmitScheduler;
use crate::services::grading::GradingCoordinator;
use crate::services::lobby::LobbyRegistry;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    store: Arc<dyn ExamStore>,
    redis: RedisHandle,
    lobby: LobbyRegistry,
    auto_submit: AutoSubmitScheduler,
    grading: GradingCoordinator,
}

impl AppState {
    pub(crate) fn new(settings: Settings, store: Arc<dyn ExamStore>, redis: RedisHandle) -> Self {
        let lobby = LobbyRegistry::new(settings.lobby().broadcast_capacity);
        let grading = GradingCoordinator::new(store.clone());
        Self {
            inner: Arc::new(InnerState {
                settings,
                store,
                redis,
                lobby,
                auto_submit: AutoSubmitScheduler::new(),
                grading,
            }),
        }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn store(&self) -> &dyn ExamStore {
        self.inner.store.as_ref()
    }

    pub(crate) fn redis(&self) -> &RedisHandle {
        &self.inner.redis
    }

    pub(crate) fn lobby(&self) -> &LobbyRegistry {
        &self.inner.lobby
    }

    pub(crate) fn auto_submit(&self) -> &AutoSubmitScheduler {
        &self.inner.auto_submit
    }

    pub(crate) fn grading(&self) -> &GradingCoordinator {
        &self.inner.grading
    }
}
