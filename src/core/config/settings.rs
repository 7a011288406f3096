use super::parsing::{
    env_optional, env_or_default, parse_backend, parse_bool, parse_cors_origins,
    parse_environment, parse_u16, parse_u32, parse_u64, parse_usize,
};
use super::secret::load_or_create_secret_key;
use super::types::{
    AiSettings, ApiSettings, ConfigError, CorsSettings, DatabaseSettings, ExamSettings,
    GradingSettings, LobbySettings, PersistenceBackend, PersistenceSettings, RedisSettings,
    RuntimeSettings, SecuritySettings, ServerHost, ServerPort, ServerSettings, Settings,
    TelemetrySettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("EXAM_HOST", "0.0.0.0");
        let port = env_or_default("EXAM_PORT", "8000");

        let environment =
            parse_environment(env_optional("EXAM_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let strict_config =
            env_optional("EXAM_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "Exam Orchestrator");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));
        let api_v1_str = env_or_default("API_V1_STR", "/api/v1");

        let env_secret = env_optional("SECRET_KEY");
        if strict_config && env_secret.is_none() {
            return Err(ConfigError::MissingSecret("SECRET_KEY"));
        }
        let secret_key = env_secret.unwrap_or_else(load_or_create_secret_key);
        let algorithm = env_or_default("ALGORITHM", "HS256");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let backend = parse_backend(env_optional("EXAM_STORE_BACKEND"))?;

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "exam");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "exam_orchestrator");
        let database_url = env_optional("DATABASE_URL");
        let max_connections =
            parse_u32("DATABASE_MAX_CONNECTIONS", env_or_default("DATABASE_MAX_CONNECTIONS", "10"))?;

        let redis_host = env_or_default("REDIS_HOST", "localhost");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");

        let openai_api_key = env_or_default("OPENAI_API_KEY", "");
        let openai_base_url = env_or_default("OPENAI_BASE_URL", "");
        let ai_model = env_or_default("AI_MODEL", "gpt-4o-mini");
        let ai_max_tokens = parse_u32("AI_MAX_TOKENS", env_or_default("AI_MAX_TOKENS", "1000"))?;
        let ai_request_timeout =
            parse_u64("AI_REQUEST_TIMEOUT", env_or_default("AI_REQUEST_TIMEOUT", "60"))?;

        let max_concurrent_sessions = parse_u64(
            "MAX_CONCURRENT_SESSIONS",
            env_or_default("MAX_CONCURRENT_SESSIONS", "500"),
        )?;
        let answer_save_interval_seconds = parse_u64(
            "ANSWER_SAVE_INTERVAL_SECONDS",
            env_or_default("ANSWER_SAVE_INTERVAL_SECONDS", "2"),
        )?;
        let submit_grace_seconds =
            parse_u64("SUBMIT_GRACE_SECONDS", env_or_default("SUBMIT_GRACE_SECONDS", "30"))?;

        let heartbeat_timeout_seconds = parse_u64(
            "LOBBY_HEARTBEAT_TIMEOUT_SECONDS",
            env_or_default("LOBBY_HEARTBEAT_TIMEOUT_SECONDS", "45"),
        )?;
        let broadcast_capacity = parse_usize(
            "LOBBY_BROADCAST_CAPACITY",
            env_or_default("LOBBY_BROADCAST_CAPACITY", "256"),
        )?;

        let worker_concurrency = parse_usize(
            "GRADING_WORKER_CONCURRENCY",
            env_or_default("GRADING_WORKER_CONCURRENCY", "4"),
        )?;
        let poll_interval_seconds = parse_u64(
            "GRADING_POLL_INTERVAL_SECONDS",
            env_or_default("GRADING_POLL_INTERVAL_SECONDS", "5"),
        )?;
        let retry_base_seconds = parse_u64(
            "GRADING_RETRY_BASE_SECONDS",
            env_or_default("GRADING_RETRY_BASE_SECONDS", "10"),
        )?;
        let retry_max_seconds = parse_u64(
            "GRADING_RETRY_MAX_SECONDS",
            env_or_default("GRADING_RETRY_MAX_SECONDS", "900"),
        )?;
        let lease_seconds =
            parse_u64("GRADING_LEASE_SECONDS", env_or_default("GRADING_LEASE_SECONDS", "300"))?;
        let maintenance_interval_seconds = parse_u64(
            "MAINTENANCE_INTERVAL_SECONDS",
            env_or_default("MAINTENANCE_INTERVAL_SECONDS", "30"),
        )?;

        let log_level = env_or_default("EXAM_LOG_LEVEL", "info");
        let json = env_optional("EXAM_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings { project_name, version, api_v1_str },
            security: SecuritySettings { secret_key, algorithm },
            cors: CorsSettings { origins: cors_origins },
            persistence: PersistenceSettings { backend },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
                max_connections,
            },
            redis: RedisSettings {
                host: redis_host,
                port: redis_port,
                db: redis_db,
                password: redis_password,
            },
            ai: AiSettings {
                openai_api_key,
                openai_base_url,
                ai_model,
                ai_max_tokens,
                ai_request_timeout,
            },
            exam: ExamSettings {
                max_concurrent_sessions,
                answer_save_interval_seconds,
                submit_grace_seconds,
            },
            lobby: LobbySettings { heartbeat_timeout_seconds, broadcast_capacity },
            grading: GradingSettings {
                worker_concurrency,
                poll_interval_seconds,
                retry_base_seconds,
                retry_max_seconds,
                lease_seconds,
                maintenance_interval_seconds,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Defaults for in-process tests, independent of the environment.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        use super::types::Environment;

        Self {
            server: ServerSettings {
                host: ServerHost("127.0.0.1".to_string()),
                port: ServerPort(8000),
            },
            runtime: RuntimeSettings { environment: Environment::Test, strict_config: false },
            api: ApiSettings {
                project_name: "Exam Orchestrator".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                api_v1_str: "/api/v1".to_string(),
            },
            security: SecuritySettings {
                secret_key: "test-secret".to_string(),
                algorithm: "HS256".to_string(),
            },
            cors: CorsSettings { origins: Vec::new() },
            persistence: PersistenceSettings { backend: PersistenceBackend::Memory },
            database: DatabaseSettings {
                postgres_server: "localhost".to_string(),
                postgres_port: 5432,
                postgres_user: "exam".to_string(),
                postgres_password: String::new(),
                postgres_db: "exam_orchestrator_test".to_string(),
                database_url: None,
                max_connections: 5,
            },
            redis: RedisSettings {
                host: "127.0.0.1".to_string(),
                port: 6379,
                db: 1,
                password: String::new(),
            },
            ai: AiSettings {
                openai_api_key: String::new(),
                openai_base_url: String::new(),
                ai_model: "gpt-4o-mini".to_string(),
                ai_max_tokens: 1000,
                ai_request_timeout: 5,
            },
            exam: ExamSettings {
                max_concurrent_sessions: 500,
                answer_save_interval_seconds: 2,
                submit_grace_seconds: 30,
            },
            lobby: LobbySettings { heartbeat_timeout_seconds: 45, broadcast_capacity: 64 },
            grading: GradingSettings {
                worker_concurrency: 2,
                poll_interval_seconds: 1,
                retry_base_seconds: 10,
                retry_max_seconds: 900,
                lease_seconds: 300,
                maintenance_interval_seconds: 30,
            },
            telemetry: TelemetrySettings {
                log_level: "info".to_string(),
                json: false,
                prometheus_enabled: false,
            },
        }
    }

    #[cfg(test)]
    pub(crate) fn exam_mut(&mut self) -> &mut ExamSettings {
        &mut self.exam
    }

    #[cfg(test)]
    pub(crate) fn lobby_mut(&mut self) -> &mut LobbySettings {
        &mut self.lobby
    }

    #[cfg(test)]
    pub(crate) fn telemetry_mut(&mut self) -> &mut TelemetrySettings {
        &mut self.telemetry
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn security(&self) -> &SecuritySettings {
        &self.security
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn persistence(&self) -> &PersistenceSettings {
        &self.persistence
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn redis(&self) -> &RedisSettings {
        &self.redis
    }

    pub(crate) fn ai(&self) -> &AiSettings {
        &self.ai
    }

    pub(crate) fn exam(&self) -> &ExamSettings {
        &self.exam
    }

    pub(crate) fn lobby(&self) -> &LobbySettings {
        &self.lobby
    }

    pub(crate) fn grading(&self) -> &GradingSettings {
        &self.grading
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.lobby.heartbeat_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "LOBBY_HEARTBEAT_TIMEOUT_SECONDS",
                value: "0".to_string(),
            });
        }

        if self.lobby.broadcast_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "LOBBY_BROADCAST_CAPACITY",
                value: "0".to_string(),
            });
        }

        if self.grading.worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_WORKER_CONCURRENCY",
                value: "0".to_string(),
            });
        }

        if self.grading.poll_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_POLL_INTERVAL_SECONDS",
                value: "0".to_string(),
            });
        }

        if self.grading.retry_max_seconds < self.grading.retry_base_seconds {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_RETRY_MAX_SECONDS",
                value: self.grading.retry_max_seconds.to_string(),
            });
        }

        if !self.runtime.strict_config {
            return Ok(());
        }

        if self.persistence.backend == PersistenceBackend::Memory {
            return Err(ConfigError::InvalidValue {
                field: "EXAM_STORE_BACKEND",
                value: self.persistence.backend.as_str().to_string(),
            });
        }
        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }
        if self.ai.openai_api_key.is_empty() {
            return Err(ConfigError::MissingSecret("OPENAI_API_KEY"));
        }
        if self.ai.openai_base_url.is_empty() {
            return Err(ConfigError::MissingSecret("OPENAI_BASE_URL"));
        }

        Ok(())
    }
}
