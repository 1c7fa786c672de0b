mod config;
mod constants;
mod dispatch;
mod error;
mod metrics;
mod routes;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::ServiceExt;
use axum::{
    Router,
    http::{HeaderValue, Method, StatusCode, header},
    routing::{get, post},
};
use clap::Parser;
use config::{Config, CorsMode};
use metrics::Metrics;
use reqwest::Client;
use store::StoreClient;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::normalize_path::NormalizePath;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

pub struct AppState {
    pub store: StoreClient,
    pub http_client: Client,
    pub metrics: Arc<Metrics>,
    /// Stand-ins for the default source when global settings leave it unset.
    pub fallback_api_url: Option<String>,
    pub fallback_api_key: Option<String>,
    pub admin_credentials: (String, String),
}

#[derive(Parser)]
#[command(name = "cascade-proxy")]
#[command(about = "OpenAI/Anthropic-compatible proxy with quotas and waterfall fallback")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, env = "CASCADE_PROXY_HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "CASCADE_PROXY_PORT")]
    port: Option<u16>,
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    let host = args.host.unwrap_or(config.host.clone());
    let port = args.port.unwrap_or(config.port);

    let metrics = Arc::new(Metrics::new());
    let store =
        StoreClient::new(&config.store_url(), metrics.clone()).expect("Failed to open store");

    // Shared HTTP client with keep-alive connection pooling.
    let http_client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .expect("Failed to create HTTP client");

    let state = Arc::new(AppState {
        store,
        http_client,
        metrics,
        fallback_api_url: config.fallback_api_url.clone(),
        fallback_api_key: config.fallback_api_key.clone(),
        admin_credentials: (config.admin_username.clone(), config.admin_password.clone()),
    });

    // Admin/misc CORS, configurable via environment.
    let cors_origins = config.cors_mode.clone();
    let admin_cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let Ok(origin_str) = origin.to_str() else {
                return false;
            };
            match &cors_origins {
                CorsMode::AllowAll => true,
                CorsMode::LocalhostOnly => {
                    let Ok(url) = url::Url::parse(origin_str) else {
                        return false;
                    };
                    matches!(
                        url.host_str(),
                        Some("localhost") | Some("127.0.0.1") | Some("::1")
                    )
                }
                CorsMode::AllowList(allowed) => allowed.iter().any(|a| a == origin_str),
            }
        }))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true);

    match &config.cors_mode {
        CorsMode::AllowAll => info!("Admin CORS: allowing all origins"),
        CorsMode::LocalhostOnly => info!("Admin CORS: localhost only"),
        CorsMode::AllowList(list) => info!("Admin CORS: allowing origins: {:?}", list),
    }

    // The proxy surface itself is permissive: callers authenticate with
    // their API key, not their origin.
    let api_routes = Router::new()
        .route("/{*path}", post(dispatch::dispatch).options(preflight))
        .layer(CorsLayer::permissive());

    let app = NormalizePath::trim_trailing_slash(
        Router::new()
            .route("/health", get(routes::health::health))
            .route("/version", get(routes::health::version))
            .route("/announcements", get(routes::announcements::list))
            .nest("/admin/api", routes::admin::router(state.clone()))
            .layer(admin_cors)
            .nest("/v1", api_routes)
            .with_state(state),
    );

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .expect("Invalid address");
    info!(
        "Starting cascade-proxy v{}-{} (built {})",
        VERSION, GIT_HASH, BUILD_TIME
    );
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        ServiceExt::<axum::extract::Request>::into_make_service_with_connect_info::<SocketAddr>(
            app,
        ),
    )
    .await
    .unwrap();
}
