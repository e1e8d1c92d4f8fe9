use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub store: StoreConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub security: SecurityConfig,
    pub claim: ClaimConfig,
    pub cards: CardConfig,
    pub email: EmailConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(skip_serializing)]
    pub url: Option<String>,
    pub max_connections: u32,
    pub connection_timeout: u64,
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub port: u16,
    pub enable_request_logging: bool,
    pub max_request_size_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(skip_serializing)]
    pub jwt_secret: String,
    pub jwt_expiry_hours: u64,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimConfig {
    /// Public origin claim links point at, e.g. https://tap.example.com
    pub base_url: String,
    pub token_ttl_hours: i64,
    pub max_ttl_hours: i64,
    pub verification_code_ttl_minutes: i64,
    pub max_failed_attempts: usize,
    pub attempt_window_minutes: i64,
    pub attempt_log_capacity: usize,
    /// 0 disables the background expiry sweep
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardConfig {
    pub max_bulk_count: usize,
    pub preview_size: usize,
    pub id_length: usize,
    pub id_max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub enabled: bool,
    pub channel_capacity: usize,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            token_ttl_hours: 24 * 7,
            max_ttl_hours: 24 * 30,
            verification_code_ttl_minutes: 15,
            max_failed_attempts: 5,
            attempt_window_minutes: 15,
            attempt_log_capacity: 50,
            sweep_interval_secs: 0,
        }
    }
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            max_bulk_count: 1000,
            preview_size: 10,
            id_length: 8,
            id_max_attempts: 10,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = match env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            Ok("staging") | Ok("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        // Set defaults based on environment, then override with specific env vars
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
        .with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        // Store / database overrides
        if let Ok(v) = env::var("STORE_BACKEND") {
            match v.as_str() {
                "memory" => self.store.backend = StoreBackend::Memory,
                "postgres" | "pg" => self.store.backend = StoreBackend::Postgres,
                other => tracing::warn!("Ignoring unknown STORE_BACKEND '{}'", other),
            }
        }
        if let Ok(v) = env::var("DATABASE_URL") {
            self.database.url = Some(v);
        }
        if let Ok(v) = env::var("DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = v.parse().unwrap_or(self.database.max_connections);
        }
        if let Ok(v) = env::var("DATABASE_CONNECTION_TIMEOUT") {
            self.database.connection_timeout = v.parse().unwrap_or(self.database.connection_timeout);
        }
        if let Ok(v) = env::var("DATABASE_RUN_MIGRATIONS") {
            self.database.run_migrations = v.parse().unwrap_or(self.database.run_migrations);
        }

        // API overrides
        if let Ok(v) = env::var("TAPCARD_API_PORT").or_else(|_| env::var("PORT")) {
            self.api.port = v.parse().unwrap_or(self.api.port);
        }
        if let Ok(v) = env::var("API_ENABLE_REQUEST_LOGGING") {
            self.api.enable_request_logging = v.parse().unwrap_or(self.api.enable_request_logging);
        }
        if let Ok(v) = env::var("API_MAX_REQUEST_SIZE_BYTES") {
            self.api.max_request_size_bytes = v.parse().unwrap_or(self.api.max_request_size_bytes);
        }

        // Security overrides
        if let Ok(v) = env::var("JWT_SECRET") {
            self.security.jwt_secret = v;
        }
        if let Ok(v) = env::var("SECURITY_JWT_EXPIRY_HOURS") {
            self.security.jwt_expiry_hours = v.parse().unwrap_or(self.security.jwt_expiry_hours);
        }
        if let Ok(v) = env::var("SECURITY_CORS_ORIGINS") {
            self.security.cors_origins = v.split(',').map(|s| s.trim().to_string()).collect();
        }

        // Claim overrides
        if let Ok(v) = env::var("CLAIM_BASE_URL") {
            self.claim.base_url = v;
        }
        if let Ok(v) = env::var("CLAIM_TOKEN_TTL_HOURS") {
            self.claim.token_ttl_hours = v.parse().unwrap_or(self.claim.token_ttl_hours);
        }
        if let Ok(v) = env::var("CLAIM_MAX_FAILED_ATTEMPTS") {
            self.claim.max_failed_attempts = v.parse().unwrap_or(self.claim.max_failed_attempts);
        }
        if let Ok(v) = env::var("CLAIM_SWEEP_INTERVAL_SECS") {
            self.claim.sweep_interval_secs = v.parse().unwrap_or(self.claim.sweep_interval_secs);
        }

        // Card overrides
        if let Ok(v) = env::var("CARDS_MAX_BULK_COUNT") {
            self.cards.max_bulk_count = v.parse().unwrap_or(self.cards.max_bulk_count);
        }
        if let Ok(v) = env::var("CARDS_ID_MAX_ATTEMPTS") {
            self.cards.id_max_attempts = v.parse().unwrap_or(self.cards.id_max_attempts);
        }

        // Collaborators
        if let Ok(v) = env::var("EMAIL_WEBHOOK_URL") {
            self.email.webhook_url = Some(v).filter(|s| !s.is_empty());
        }
        if let Ok(v) = env::var("AUDIT_ENABLED") {
            self.audit.enabled = v.parse().unwrap_or(self.audit.enabled);
        }
        if let Ok(v) = env::var("AUDIT_CHANNEL_CAPACITY") {
            self.audit.channel_capacity = v.parse().unwrap_or(self.audit.channel_capacity);
        }

        self
    }

    pub fn development() -> Self {
        Self {
            environment: Environment::Development,
            store: StoreConfig {
                backend: StoreBackend::Memory,
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 10,
                connection_timeout: 30,
                run_migrations: true,
            },
            api: ApiConfig {
                port: 3000,
                enable_request_logging: true,
                max_request_size_bytes: 10 * 1024 * 1024, // 10MB
            },
            security: SecurityConfig {
                jwt_secret: "development-only-secret".to_string(),
                jwt_expiry_hours: 24 * 7, // 1 week
                cors_origins: vec!["http://localhost:3000".to_string(), "http://localhost:5173".to_string()],
            },
            claim: ClaimConfig::default(),
            cards: CardConfig::default(),
            email: EmailConfig { webhook_url: None },
            audit: AuditConfig {
                enabled: true,
                channel_capacity: 1024,
            },
        }
    }

    fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            store: StoreConfig {
                backend: StoreBackend::Postgres,
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 20,
                connection_timeout: 10,
                run_migrations: true,
            },
            api: ApiConfig {
                port: 3000,
                enable_request_logging: true,
                max_request_size_bytes: 5 * 1024 * 1024, // 5MB
            },
            security: SecurityConfig {
                jwt_secret: String::new(),
                jwt_expiry_hours: 24,
                cors_origins: vec!["https://staging.example.com".to_string()],
            },
            claim: ClaimConfig {
                base_url: "https://staging.example.com".to_string(),
                sweep_interval_secs: 600,
                ..ClaimConfig::default()
            },
            cards: CardConfig::default(),
            email: EmailConfig { webhook_url: None },
            audit: AuditConfig {
                enabled: true,
                channel_capacity: 4096,
            },
        }
    }

    fn production() -> Self {
        Self {
            environment: Environment::Production,
            store: StoreConfig {
                backend: StoreBackend::Postgres,
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 50,
                connection_timeout: 5,
                run_migrations: false,
            },
            api: ApiConfig {
                port: 3000,
                enable_request_logging: false,
                max_request_size_bytes: 2 * 1024 * 1024, // 2MB
            },
            security: SecurityConfig {
                jwt_secret: String::new(),
                jwt_expiry_hours: 4,
                cors_origins: vec!["https://app.example.com".to_string()],
            },
            claim: ClaimConfig {
                base_url: "https://app.example.com".to_string(),
                sweep_interval_secs: 300,
                ..ClaimConfig::default()
            },
            cards: CardConfig::default(),
            email: EmailConfig { webhook_url: None },
            audit: AuditConfig {
                enabled: true,
                channel_capacity: 8192,
            },
        }
    }
}

// Global singleton config - initialized once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

// Convenience function for accessing config
pub fn config() -> &'static AppConfig {
    &CONFIG
}

#[macro_export]
macro_rules! is_production {
    () => {
        matches!($crate::config::CONFIG.environment, $crate::config::Environment::Production)
    };
}
