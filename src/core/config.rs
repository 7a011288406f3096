mod parsing;
mod secret;
mod settings;
mod types;

pub(crate) use types::{
    ConfigError, Environment, ExamSettings, GradingSettings, LobbySettings, PersistenceBackend,
    Settings,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn load_uses_memory_backend_from_env() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();

        let settings = Settings::load().expect("settings");
        assert_eq!(settings.persistence().backend, PersistenceBackend::Memory);
        assert_eq!(settings.runtime().environment, Environment::Test);
        assert_eq!(settings.api().api_v1_str, "/api/v1");
        assert!(settings.lobby().heartbeat_timeout_seconds > 0);
    }

    #[tokio::test]
    async fn strict_mode_rejects_memory_backend() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        std::env::set_var("EXAM_STRICT_CONFIG", "1");

        let result = Settings::load();
        std::env::set_var("EXAM_STRICT_CONFIG", "0");

        assert!(matches!(result, Err(ConfigError::InvalidValue { field: "EXAM_STORE_BACKEND", .. })));
    }

    #[tokio::test]
    async fn zero_worker_concurrency_is_rejected() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        std::env::set_var("GRADING_WORKER_CONCURRENCY", "0");

        let result = Settings::load();
        std::env::remove_var("GRADING_WORKER_CONCURRENCY");

        assert!(result.is_err());
    }
}
