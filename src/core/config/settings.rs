use super::parsing::{
    env_optional, env_or_default, is_supported_extension, parse_bool, parse_cors_origins,
    parse_environment, parse_f64, parse_handle_verification, parse_string_list,
    parse_subject_mapping, parse_u16, parse_u32, parse_u64, parse_usize,
};
use super::secret::load_or_create_secret;
use super::types::{
    ApiSettings, ConfigError, CorsSettings, DatabaseSettings, LmsSettings, MappingSettings,
    RedisSettings, RuntimeSettings, S3Settings, SecuritySettings, ServerHost, ServerPort,
    ServerSettings, Settings, StorageSettings, SubmissionSettings, TelemetrySettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("SCANBRIDGE_HOST", "0.0.0.0");
        let port = env_or_default("SCANBRIDGE_PORT", "8000");

        let environment = parse_environment(
            env_optional("SCANBRIDGE_ENV").or_else(|| env_optional("ENVIRONMENT")),
        );
        let strict_config = env_optional("SCANBRIDGE_STRICT_CONFIG")
            .map(|value| parse_bool(&value))
            .unwrap_or(false)
            || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "Scanbridge API");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));
        let api_v1_str = env_or_default("API_V1_STR", "/api/v1");

        let secret_key = match env_optional("SECRET_KEY") {
            Some(value) => value,
            None => load_or_create_secret(".secret_key"),
        };
        let algorithm = env_or_default("ALGORITHM", "HS256");
        let token_encryption_key = env_optional("TOKEN_ENCRYPTION_KEY");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "scanbridge");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "scanbridge");
        let database_url = env_optional("DATABASE_URL");

        let redis_host = env_or_default("REDIS_HOST", "localhost");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");

        let lms_base_url = env_or_default("MOODLE_BASE_URL", "");
        let lms_service_token = env_or_default("MOODLE_SERVICE_TOKEN", "");
        let lms_request_timeout_seconds = parse_u64(
            "LMS_REQUEST_TIMEOUT_SECONDS",
            env_or_default("LMS_REQUEST_TIMEOUT_SECONDS", "30"),
        )?;
        let lms_connect_timeout_seconds = parse_u64(
            "LMS_CONNECT_TIMEOUT_SECONDS",
            env_or_default("LMS_CONNECT_TIMEOUT_SECONDS", "10"),
        )?;

        let max_attempts =
            parse_u32("RETRY_MAX_ATTEMPTS", env_or_default("RETRY_MAX_ATTEMPTS", "3"))?;
        let retry_base_delay_seconds = parse_u64(
            "RETRY_BASE_DELAY_SECONDS",
            env_or_default("RETRY_BASE_DELAY_SECONDS", "30"),
        )?;
        let retry_max_delay_seconds = parse_u64(
            "RETRY_MAX_DELAY_SECONDS",
            env_or_default("RETRY_MAX_DELAY_SECONDS", "900"),
        )?;
        let retry_jitter_ratio =
            parse_f64("RETRY_JITTER_RATIO", env_or_default("RETRY_JITTER_RATIO", "0.2"))?;
        let lease_seconds = parse_u64("LEASE_SECONDS", env_or_default("LEASE_SECONDS", "120"))?;
        let worker_concurrency =
            parse_usize("WORKER_CONCURRENCY", env_or_default("WORKER_CONCURRENCY", "4"))?;
        let poll_interval_ms =
            parse_u64("WORKER_POLL_INTERVAL_MS", env_or_default("WORKER_POLL_INTERVAL_MS", "2000"))?;
        let handle_verification = parse_handle_verification(env_optional("HANDLE_VERIFICATION"))?;
        let handle_ttl_seconds =
            parse_u64("HANDLE_TTL_SECONDS", env_or_default("HANDLE_TTL_SECONDS", "3600"))?;
        let submit_rate_limit =
            parse_u64("SUBMIT_RATE_LIMIT", env_or_default("SUBMIT_RATE_LIMIT", "5"))?;
        let submit_rate_window_seconds = parse_u64(
            "SUBMIT_RATE_WINDOW_SECONDS",
            env_or_default("SUBMIT_RATE_WINDOW_SECONDS", "60"),
        )?;

        let mapping_cache_ttl_seconds = parse_u64(
            "MAPPING_CACHE_TTL_SECONDS",
            env_or_default("MAPPING_CACHE_TTL_SECONDS", "1800"),
        )?;
        let mapping_fallback = parse_subject_mapping(env_optional("SUBJECT_ASSIGNMENT_MAPPING"))?;

        let max_upload_size_mb =
            parse_u64("MAX_UPLOAD_SIZE_MB", env_or_default("MAX_UPLOAD_SIZE_MB", "50"))?;
        let allowed_extensions = parse_string_list(
            env_optional("ALLOWED_EXTENSIONS"),
            &["pdf", "jpg", "jpeg", "png"],
        );

        let s3_endpoint = env_or_default("S3_ENDPOINT", "http://localhost:9000");
        let s3_access_key = env_or_default("S3_ACCESS_KEY", "");
        let s3_secret_key = env_or_default("S3_SECRET_KEY", "");
        let s3_bucket = env_or_default("S3_BUCKET", "scanbridge-artifacts");
        let s3_region = env_or_default("S3_REGION", "us-east-1");

        let log_level = env_or_default("SCANBRIDGE_LOG_LEVEL", "info");
        let json =
            env_optional("SCANBRIDGE_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings { project_name, version, api_v1_str },
            security: SecuritySettings { secret_key, algorithm, token_encryption_key },
            cors: CorsSettings { origins: cors_origins },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
            },
            redis: RedisSettings {
                host: redis_host,
                port: redis_port,
                db: redis_db,
                password: redis_password,
            },
            lms: LmsSettings {
                base_url: lms_base_url.trim_end_matches('/').to_string(),
                service_token: lms_service_token,
                request_timeout_seconds: lms_request_timeout_seconds,
                connect_timeout_seconds: lms_connect_timeout_seconds,
            },
            submission: SubmissionSettings {
                max_attempts,
                retry_base_delay_seconds,
                retry_max_delay_seconds,
                retry_jitter_ratio,
                lease_seconds,
                worker_concurrency,
                poll_interval_ms,
                handle_verification,
                handle_ttl_seconds,
                submit_rate_limit,
                submit_rate_window_seconds,
            },
            mapping: MappingSettings {
                cache_ttl_seconds: mapping_cache_ttl_seconds,
                fallback: mapping_fallback,
            },
            storage: StorageSettings { max_upload_size_mb, allowed_extensions },
            s3: S3Settings {
                endpoint: s3_endpoint,
                access_key: s3_access_key,
                secret_key: s3_secret_key,
                bucket: s3_bucket,
                region: s3_region,
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

    pub(crate) fn security(&self) -> &SecuritySettings {
        &self.security
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

    pub(crate) fn lms(&self) -> &LmsSettings {
        &self.lms
    }

    pub(crate) fn submission(&self) -> &SubmissionSettings {
        &self.submission
    }

    pub(crate) fn mapping(&self) -> &MappingSettings {
        &self.mapping
    }

    pub(crate) fn storage(&self) -> &StorageSettings {
        &self.storage
    }

    pub(crate) fn s3(&self) -> &S3Settings {
        &self.s3
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.allowed_extensions.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ALLOWED_EXTENSIONS",
                value: String::from("<empty>"),
            });
        }

        for extension in &self.storage.allowed_extensions {
            if !is_supported_extension(extension) {
                return Err(ConfigError::InvalidValue {
                    field: "ALLOWED_EXTENSIONS",
                    value: extension.clone(),
                });
            }
        }

        let submission = &self.submission;
        if submission.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "RETRY_MAX_ATTEMPTS",
                value: "0".to_string(),
            });
        }
        if submission.worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "WORKER_CONCURRENCY",
                value: "0".to_string(),
            });
        }
        if !(0.0..1.0).contains(&submission.retry_jitter_ratio) {
            return Err(ConfigError::InvalidValue {
                field: "RETRY_JITTER_RATIO",
                value: submission.retry_jitter_ratio.to_string(),
            });
        }
        if submission.retry_base_delay_seconds > submission.retry_max_delay_seconds {
            return Err(ConfigError::InvalidValue {
                field: "RETRY_BASE_DELAY_SECONDS",
                value: submission.retry_base_delay_seconds.to_string(),
            });
        }
        // Leases must outlive the slowest single LMS call.
        if submission.lease_seconds <= self.lms.request_timeout_seconds {
            return Err(ConfigError::InvalidValue {
                field: "LEASE_SECONDS",
                value: submission.lease_seconds.to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }
        if self.lms.base_url.is_empty() {
            return Err(ConfigError::MissingSecret("MOODLE_BASE_URL"));
        }
        if self.security.token_encryption_key.is_none() {
            return Err(ConfigError::MissingSecret("TOKEN_ENCRYPTION_KEY"));
        }
        if self.s3.access_key.is_empty() || self.s3.secret_key.is_empty() {
            return Err(ConfigError::MissingSecret("S3_ACCESS_KEY/S3_SECRET_KEY"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Settings;
    use crate::core::config::{ConfigError, HandleVerification};
    use crate::test_support;

    #[tokio::test]
    async fn defaults_load_in_test_environment() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();

        let settings = Settings::load().expect("settings");
        assert_eq!(settings.submission().max_attempts, 3);
        assert_eq!(settings.submission().handle_verification, HandleVerification::Probe);
        assert_eq!(settings.mapping().cache_ttl_seconds, 1800);
        assert_eq!(settings.security().token_encryption_key(), "test-secret");
        assert!(settings.storage().allowed_extensions.iter().any(|ext| ext == "pdf"));
    }

    #[tokio::test]
    async fn lease_must_exceed_request_timeout() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        std::env::set_var("LEASE_SECONDS", "30");
        std::env::set_var("LMS_REQUEST_TIMEOUT_SECONDS", "30");

        let result = Settings::load();

        std::env::remove_var("LEASE_SECONDS");
        std::env::remove_var("LMS_REQUEST_TIMEOUT_SECONDS");
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { field: "LEASE_SECONDS", .. })
        ));
    }

    #[tokio::test]
    async fn strict_mode_requires_token_key() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();
        std::env::set_var("SCANBRIDGE_STRICT_CONFIG", "1");
        std::env::set_var("MOODLE_BASE_URL", "https://lms.example.edu");

        let result = Settings::load();

        std::env::set_var("SCANBRIDGE_STRICT_CONFIG", "0");
        std::env::remove_var("MOODLE_BASE_URL");
        assert!(matches!(result, Err(ConfigError::MissingSecret("TOKEN_ENCRYPTION_KEY"))));
    }
}
