use super::parsing::{
    env_optional, env_or_default, parse_api_keys, parse_bool, parse_cors_origins,
    parse_credential_store, parse_environment, parse_f64, parse_i32, parse_u16, parse_u32,
    parse_u64,
};
use super::types::{
    ApiSettings, ConfigError, CorsSettings, CredentialSettings, DatabaseSettings, DrainSettings,
    QueueSettings, RedisSettings, RuntimeSettings, ScorerSettings, ServerHost, ServerPort,
    ServerSettings, Settings, TelemetrySettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("GRADING_HOST", "0.0.0.0");
        let port = env_or_default("GRADING_PORT", "8000");

        let environment = parse_environment(
            env_optional("GRADING_ENV").or_else(|| env_optional("ENVIRONMENT")),
        );
        let strict_config =
            env_optional("GRADING_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "Grading Dispatch API");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));
        let api_v1_str = env_or_default("API_V1_STR", "/api/v1");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "grading");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "grading_db");
        let database_url = env_optional("DATABASE_URL");
        let max_connections = parse_u32(
            "DATABASE_MAX_CONNECTIONS",
            env_or_default("DATABASE_MAX_CONNECTIONS", "10"),
        )?;

        let redis_host = env_or_default("REDIS_HOST", "localhost");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");

        let scorer_base_url = env_or_default("SCORER_BASE_URL", "");
        let scorer_model = env_or_default("SCORER_MODEL", "gpt-4o-mini");
        let scorer_max_tokens =
            parse_u32("SCORER_MAX_TOKENS", env_or_default("SCORER_MAX_TOKENS", "2000"))?;
        let scorer_temperature =
            parse_f64("SCORER_TEMPERATURE", env_or_default("SCORER_TEMPERATURE", "0.0"))?;
        let scorer_timeout_seconds =
            parse_u64("SCORER_TIMEOUT_SECONDS", env_or_default("SCORER_TIMEOUT_SECONDS", "15"))?;
        let api_keys =
            parse_api_keys(env_optional("SCORER_API_KEYS"), env_optional("SCORER_API_KEY"));

        let rpm_limit =
            parse_u32("CREDENTIAL_RPM_LIMIT", env_or_default("CREDENTIAL_RPM_LIMIT", "8"))?;
        let window_seconds = parse_u64(
            "CREDENTIAL_WINDOW_SECONDS",
            env_or_default("CREDENTIAL_WINDOW_SECONDS", "60"),
        )?;
        let backoff_base_seconds = parse_u64(
            "CREDENTIAL_BACKOFF_BASE_SECONDS",
            env_or_default("CREDENTIAL_BACKOFF_BASE_SECONDS", "15"),
        )?;
        let backoff_max_seconds = parse_u64(
            "CREDENTIAL_BACKOFF_MAX_SECONDS",
            env_or_default("CREDENTIAL_BACKOFF_MAX_SECONDS", "300"),
        )?;
        let credential_store = parse_credential_store(env_or_default("CREDENTIAL_STORE", "redis"))?;
        let key_prefix = env_or_default("CREDENTIAL_KEY_PREFIX", "grading:credentials");

        let max_attempts =
            parse_i32("GRADING_MAX_ATTEMPTS", env_or_default("GRADING_MAX_ATTEMPTS", "3"))?;
        let default_priority =
            parse_i32("GRADING_DEFAULT_PRIORITY", env_or_default("GRADING_DEFAULT_PRIORITY", "0"))?;
        let stale_processing_seconds = parse_u64(
            "GRADING_STALE_PROCESSING_SECONDS",
            env_or_default("GRADING_STALE_PROCESSING_SECONDS", "300"),
        )?;

        let default_limit =
            parse_u64("DRAIN_DEFAULT_LIMIT", env_or_default("DRAIN_DEFAULT_LIMIT", "6"))? as usize;
        let default_rounds =
            parse_u32("DRAIN_DEFAULT_ROUNDS", env_or_default("DRAIN_DEFAULT_ROUNDS", "2"))?;
        let max_rounds = parse_u32("DRAIN_MAX_ROUNDS", env_or_default("DRAIN_MAX_ROUNDS", "10"))?;
        let round_pause_ms =
            parse_u64("DRAIN_ROUND_PAUSE_MS", env_or_default("DRAIN_ROUND_PAUSE_MS", "1500"))?;
        let max_duration_seconds = parse_u64(
            "DRAIN_MAX_DURATION_SECONDS",
            env_or_default("DRAIN_MAX_DURATION_SECONDS", "50"),
        )?;
        let trigger_secret = env_optional("DRAIN_TRIGGER_SECRET");

        let log_level = env_or_default("GRADING_LOG_LEVEL", "info");
        let json = env_optional("GRADING_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings { project_name, version, api_v1_str },
            cors: CorsSettings { origins: cors_origins },
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
            scorer: ScorerSettings {
                base_url: scorer_base_url,
                model: scorer_model,
                max_tokens: scorer_max_tokens,
                temperature: scorer_temperature,
                timeout_seconds: scorer_timeout_seconds,
                api_keys,
            },
            credentials: CredentialSettings {
                rpm_limit,
                window_seconds,
                backoff_base_seconds,
                backoff_max_seconds,
                store: credential_store,
                key_prefix,
            },
            queue: QueueSettings { max_attempts, default_priority, stale_processing_seconds },
            drain: DrainSettings {
                default_limit,
                default_rounds,
                max_rounds,
                round_pause_ms,
                max_duration_seconds,
                trigger_secret,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;

        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn redis(&self) -> &RedisSettings {
        &self.redis
    }

    pub(crate) fn scorer(&self) -> &ScorerSettings {
        &self.scorer
    }

    pub(crate) fn credentials(&self) -> &CredentialSettings {
        &self.credentials
    }

    pub(crate) fn queue(&self) -> &QueueSettings {
        &self.queue
    }

    pub(crate) fn drain(&self) -> &DrainSettings {
        &self.drain
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.credentials.rpm_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "CREDENTIAL_RPM_LIMIT",
                value: String::from("0"),
            });
        }
        if self.credentials.window_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "CREDENTIAL_WINDOW_SECONDS",
                value: String::from("0"),
            });
        }
        if self.credentials.backoff_max_seconds < self.credentials.backoff_base_seconds {
            return Err(ConfigError::InvalidValue {
                field: "CREDENTIAL_BACKOFF_MAX_SECONDS",
                value: self.credentials.backoff_max_seconds.to_string(),
            });
        }
        if self.queue.max_attempts < 1 {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_MAX_ATTEMPTS",
                value: self.queue.max_attempts.to_string(),
            });
        }
        if self.scorer.timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "SCORER_TIMEOUT_SECONDS",
                value: String::from("0"),
            });
        }
        if self.drain.max_rounds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "DRAIN_MAX_ROUNDS",
                value: String::from("0"),
            });
        }
        // stale claims must outlive the scorer timeout
        if self.queue.stale_processing_seconds <= self.scorer.timeout_seconds {
            return Err(ConfigError::InvalidValue {
                field: "GRADING_STALE_PROCESSING_SECONDS",
                value: self.queue.stale_processing_seconds.to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }

        if self.scorer.api_keys.is_empty() {
            return Err(ConfigError::MissingSecret("SCORER_API_KEYS"));
        }

        if self.scorer.base_url.is_empty() {
            return Err(ConfigError::MissingSecret("SCORER_BASE_URL"));
        }

        Ok(())
    }
}
