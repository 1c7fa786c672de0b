use std::env;

use dotenvy::dotenv;

/// CORS configuration mode
#[derive(Debug, Clone)]
pub enum CorsMode {
    /// Only allow localhost origins (default, for local development)
    LocalhostOnly,
    /// Allow all origins (for public deployment with API key auth)
    AllowAll,
    /// Allow specific origins (comma-separated list)
    AllowList(Vec<String>),
}

pub struct Config {
    pub host: String,
    pub port: u16,
    /// Redis connection URL for the shared state store.
    pub redis_url: String,
    /// Optional auth token spliced into the store URL when it carries none.
    pub redis_token: Option<String>,
    /// Upstream base URL used when GlobalSettings.api_url is unset.
    pub fallback_api_url: Option<String>,
    /// Backend key used when GlobalSettings.api_key is unset.
    pub fallback_api_key: Option<String>,
    pub admin_username: String,
    pub admin_password: String,
    pub cors_mode: CorsMode,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let host = env::var("CASCADE_PROXY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("CASCADE_PROXY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(4100);

        let redis_url = env::var("CASCADE_PROXY_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let redis_token = env::var("CASCADE_PROXY_REDIS_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        let fallback_api_url = env::var("CASCADE_PROXY_FALLBACK_API_URL")
            .ok()
            .filter(|u| !u.is_empty());
        let fallback_api_key = env::var("CASCADE_PROXY_FALLBACK_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());

        let admin_username = env::var("CASCADE_PROXY_ADMIN_USERNAME")
            .expect("CASCADE_PROXY_ADMIN_USERNAME must be set");
        let admin_password = env::var("CASCADE_PROXY_ADMIN_PASSWORD")
            .expect("CASCADE_PROXY_ADMIN_PASSWORD must be set");

        // CORS configuration: "localhost" (default), "*" (allow all), or comma-separated origins
        let cors_mode = match env::var("CASCADE_PROXY_CORS_ORIGINS").as_deref() {
            Ok("*") => CorsMode::AllowAll,
            Ok(origins) if !origins.is_empty() => {
                CorsMode::AllowList(origins.split(',').map(|s| s.trim().to_string()).collect())
            }
            _ => CorsMode::LocalhostOnly,
        };

        Self {
            host,
            port,
            redis_url,
            redis_token,
            fallback_api_url,
            fallback_api_key,
            admin_username,
            admin_password,
            cors_mode,
        }
    }

    /// Store URL with the auth token applied, when one is configured and the
    /// URL itself carries no password.
    pub fn store_url(&self) -> String {
        let Some(token) = &self.redis_token else {
            return self.redis_url.clone();
        };
        match url::Url::parse(&self.redis_url) {
            Ok(mut parsed) if parsed.password().is_none() => {
                let _ = parsed.set_password(Some(token));
                parsed.to_string()
            }
            _ => self.redis_url.clone(),
        }
    }
}
