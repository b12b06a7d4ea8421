use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub presign_ttl_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisProvider {
    Stub,
    OpenAi,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    pub provider: AnalysisProvider,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub stub_latency_ms: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    pub default_auto_promote_minutes: i32,
    pub sweep_interval_secs: u64,
    /// A `processing` draft older than this is treated as abandoned.
    /// Always longer than the analysis request timeout.
    pub processing_lease_secs: u64,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub store: StoreBackend,
    pub database_url: Option<String>,
    pub jwt: JwtConfig,
    pub storage: StorageConfig,
    pub analysis: AnalysisConfig,
    pub lifecycle: LifecycleConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());
        let store = match lookup("STORE_BACKEND").as_deref().map(str::trim) {
            Some("memory") => StoreBackend::Memory,
            Some("postgres") => StoreBackend::Postgres,
            Some(other) => anyhow::bail!("unknown STORE_BACKEND: {other}"),
            None if database_url.is_some() => StoreBackend::Postgres,
            None => StoreBackend::Memory,
        };
        if store == StoreBackend::Postgres && database_url.is_none() {
            anyhow::bail!("STORE_BACKEND=postgres requires DATABASE_URL");
        }

        let jwt = JwtConfig {
            secret: lookup("JWT_SECRET").ok_or_else(|| anyhow::anyhow!("JWT_SECRET is not set"))?,
            issuer: var("JWT_ISSUER", "mealflow"),
            audience: var("JWT_AUDIENCE", "mealflow-users"),
            ttl_minutes: lookup("JWT_TTL_MINUTES")
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(60),
        };

        let storage_backend = match var("STORAGE_BACKEND", "s3").trim() {
            "s3" => StorageBackend::S3,
            "memory" => StorageBackend::Memory,
            other => anyhow::bail!("unknown STORAGE_BACKEND: {other}"),
        };
        let storage = StorageConfig {
            backend: storage_backend,
            endpoint: var("S3_ENDPOINT", "http://localhost:9000"),
            bucket: var("S3_BUCKET", "meal-images"),
            access_key: var("S3_ACCESS_KEY", ""),
            secret_key: var("S3_SECRET_KEY", ""),
            region: var("S3_REGION", "us-east-1"),
            presign_ttl_secs: parsed("PRESIGN_TTL_SECS").unwrap_or(30 * 60),
        };

        let provider = match var("ANALYSIS_PROVIDER", "stub").trim() {
            "stub" => AnalysisProvider::Stub,
            "openai" => AnalysisProvider::OpenAi,
            other => anyhow::bail!("unknown ANALYSIS_PROVIDER: {other}"),
        };
        let openai_model = var("OPENAI_MODEL", "gpt-4o").trim().to_string();
        let analysis = AnalysisConfig {
            provider,
            openai_api_key: lookup("OPENAI_API_KEY").filter(|v| !v.trim().is_empty()),
            openai_model: if openai_model.is_empty() {
                "gpt-4o".into()
            } else {
                openai_model
            },
            stub_latency_ms: parsed("ANALYSIS_STUB_LATENCY_MS").unwrap_or(1500),
            request_timeout_secs: parsed("ANALYSIS_TIMEOUT_SECS").unwrap_or(60).max(1),
        };

        let lifecycle = LifecycleConfig {
            default_auto_promote_minutes: lookup("AUTO_PROMOTE_DEFAULT_MINUTES")
                .and_then(|v| v.trim().parse::<i32>().ok())
                .unwrap_or(5)
                .max(1),
            sweep_interval_secs: parsed("LIFECYCLE_SWEEP_SECS").unwrap_or(30).max(1),
            processing_lease_secs: parsed("ANALYSIS_LEASE_SECS")
                .unwrap_or(300)
                .max(analysis.request_timeout_secs + 1),
            max_upload_bytes: parsed("MAX_UPLOAD_BYTES")
                .map(|v| v as usize)
                .unwrap_or(20 * 1024 * 1024),
        };

        Ok(Self {
            store,
            database_url,
            jwt,
            storage,
            analysis,
            lifecycle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_memory_store_and_stub_engine() {
        let cfg = AppConfig::from_lookup(lookup_from(&[("JWT_SECRET", "s")])).unwrap();
        assert_eq!(cfg.store, StoreBackend::Memory);
        assert_eq!(cfg.analysis.provider, AnalysisProvider::Stub);
        assert_eq!(cfg.analysis.openai_model, "gpt-4o");
        assert_eq!(cfg.analysis.stub_latency_ms, 1500);
        assert_eq!(cfg.lifecycle.default_auto_promote_minutes, 5);
        assert_eq!(cfg.jwt.issuer, "mealflow");
        assert_eq!(cfg.storage.backend, StorageBackend::S3);
    }

    #[test]
    fn database_url_selects_postgres() {
        let cfg = AppConfig::from_lookup(lookup_from(&[
            ("JWT_SECRET", "s"),
            ("DATABASE_URL", "postgres://localhost/meals"),
        ]))
        .unwrap();
        assert_eq!(cfg.store, StoreBackend::Postgres);
    }

    #[test]
    fn postgres_without_url_is_rejected() {
        let err = AppConfig::from_lookup(lookup_from(&[
            ("JWT_SECRET", "s"),
            ("STORE_BACKEND", "postgres"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn missing_jwt_secret_is_an_error() {
        assert!(AppConfig::from_lookup(lookup_from(&[])).is_err());
    }

    #[test]
    fn auto_promote_minutes_are_clamped() {
        let cfg = AppConfig::from_lookup(lookup_from(&[
            ("JWT_SECRET", "s"),
            ("AUTO_PROMOTE_DEFAULT_MINUTES", "0"),
        ]))
        .unwrap();
        assert_eq!(cfg.lifecycle.default_auto_promote_minutes, 1);
    }

    #[test]
    fn processing_lease_outlasts_request_timeout() {
        let cfg = AppConfig::from_lookup(lookup_from(&[("JWT_SECRET", "s")])).unwrap();
        assert_eq!(cfg.analysis.request_timeout_secs, 60);
        assert_eq!(cfg.lifecycle.processing_lease_secs, 300);

        let cfg = AppConfig::from_lookup(lookup_from(&[
            ("JWT_SECRET", "s"),
            ("ANALYSIS_TIMEOUT_SECS", "120"),
            ("ANALYSIS_LEASE_SECS", "30"),
        ]))
        .unwrap();
        assert_eq!(cfg.lifecycle.processing_lease_secs, 121);
    }
}
