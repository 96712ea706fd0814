use crate::ratelimit::FailMode;

/// Rate limiter backend selection. The in-memory backend is correctness-
/// incompatible with more than one service instance and is refused in
/// production.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitBackend {
    Redis,
    Memory,
}

#[derive(Debug)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    /// Server-side key for the keyed token hash. Never stored next to the
    /// hashes it protects.
    pub token_pepper: String,
    pub rate_limit_backend: RateLimitBackend,
    pub rate_limit_fail_mode: FailMode,
    /// Blob storage URL for job input/output bytes
    /// (s3://..., gs://..., az://..., file:///...).
    pub blob_store_url: String,
    /// Extraction worker executable invoked by the sandbox dispatcher.
    pub extractor_cmd: String,
    pub sandbox_timeout_secs: u64,
    pub sandbox_memory_limit_mb: u64,
    /// Maximum accepted upload size in megabytes.
    pub max_upload_mb: usize,
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let env_mode = std::env::var("PDF2MD_ENV").unwrap_or_default();
    let production = env_mode == "production";

    let token_pepper = std::env::var("PDF2MD_TOKEN_PEPPER")
        .unwrap_or_else(|_| "CHANGE_ME_32_BYTE_HEX_KEY".into());
    if token_pepper == "CHANGE_ME_32_BYTE_HEX_KEY" {
        if production {
            anyhow::bail!(
                "PDF2MD_TOKEN_PEPPER is still the insecure placeholder. \
                 Set a proper 64-char hex key before running in production."
            );
        }
        eprintln!("warning: PDF2MD_TOKEN_PEPPER is not set — using insecure placeholder");
    }

    let rate_limit_backend = match std::env::var("PDF2MD_RATE_LIMIT_BACKEND")
        .unwrap_or_else(|_| "redis".into())
        .to_lowercase()
        .as_str()
    {
        "redis" => RateLimitBackend::Redis,
        "memory" => {
            if production {
                anyhow::bail!(
                    "PDF2MD_RATE_LIMIT_BACKEND=memory is a single-process development \
                     backend and cannot be used in production"
                );
            }
            RateLimitBackend::Memory
        }
        other => anyhow::bail!("invalid rate limit backend: {other}"),
    };

    // Read once at process start; fail-closed unless explicitly opted out.
    let rate_limit_fail_mode = match std::env::var("PDF2MD_RATE_LIMIT_FAIL_MODE")
        .unwrap_or_else(|_| "closed".into())
        .to_lowercase()
        .as_str()
    {
        "closed" => FailMode::Closed,
        "open" => FailMode::Open,
        other => anyhow::bail!("invalid rate limit fail mode: {other}"),
    };

    Ok(Config {
        port: std::env::var("PDF2MD_PORT")
            .unwrap_or_else(|_| "8080".into())
            .parse()
            .unwrap_or(8080),
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/pdf2md".into()),
        redis_url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
        token_pepper,
        rate_limit_backend,
        rate_limit_fail_mode,
        blob_store_url: std::env::var("PDF2MD_BLOB_STORE_URL")
            .unwrap_or_else(|_| "file:///var/lib/pdf2md/blobs".into()),
        extractor_cmd: std::env::var("PDF2MD_EXTRACTOR_CMD")
            .unwrap_or_else(|_| "pdf2md-extract".into()),
        sandbox_timeout_secs: std::env::var("PDF2MD_SANDBOX_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60),
        sandbox_memory_limit_mb: std::env::var("PDF2MD_SANDBOX_MEMORY_LIMIT_MB")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(512),
        max_upload_mb: std::env::var("PDF2MD_MAX_UPLOAD_MB")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(50),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_builds_config_with_safe_defaults() {
        for var in [
            "PDF2MD_ENV",
            "PDF2MD_RATE_LIMIT_BACKEND",
            "PDF2MD_RATE_LIMIT_FAIL_MODE",
            "PDF2MD_PORT",
            "PDF2MD_MAX_UPLOAD_MB",
        ] {
            std::env::remove_var(var);
        }

        let cfg = load().expect("defaults must load outside production");
        assert_eq!(cfg.rate_limit_backend, RateLimitBackend::Redis);
        assert_eq!(cfg.rate_limit_fail_mode, FailMode::Closed);
        assert_eq!(cfg.max_upload_mb, 50);
        assert_eq!(cfg.sandbox_timeout_secs, 60);
    }
}
