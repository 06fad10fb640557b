mod auth;
mod cache;
mod config;
mod db;
mod encoder;
mod format;
mod http;
mod metrics;
mod pipeline;
mod policy;
mod render;
mod size;
mod state;
mod thumbnail;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::db::Database;
use crate::state::AppState;
use axum::Router;
use axum::body::HttpBody;
use axum::http::{Response, header};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::{
    CompressionLayer,
    predicate::{DefaultPredicate, Predicate},
};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::info;

/// Image bodies are already compressed; re-compressing them wastes CPU on
/// every response.
#[derive(Clone)]
struct NoImageCompression {
    inner: DefaultPredicate,
}

impl NoImageCompression {
    fn new() -> Self {
        Self {
            inner: DefaultPredicate::new(),
        }
    }
}

impl Predicate for NoImageCompression {
    fn should_compress<B>(&self, response: &Response<B>) -> bool
    where
        B: HttpBody,
    {
        if let Some(content_type) = response.headers().get(header::CONTENT_TYPE) {
            if let Ok(content_type) = content_type.to_str() {
                if content_type.starts_with("image/") {
                    return false;
                }
            }
        }
        self.inner.should_compress(response)
    }
}

fn build_app(state: Arc<AppState>) -> Router {
    let max_in_flight = if state.config.max_in_flight_requests == 0 {
        usize::MAX
    } else {
        state.config.max_in_flight_requests
    };
    http::router(state)
        .layer(CompressionLayer::new().compress_when(NoImageCompression::new()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false)),
        )
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION]))
        .layer(ConcurrencyLimitLayer::new(max_in_flight))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    info!(
        image_dir = %config.image_dir.display(),
        thumb_dir = %config.thumb_dir.display(),
        allow_origins = config.allow_origins.len(),
        quality_default = config.quality_default,
        "startup config summary"
    );

    let db = Database::new(&config).await?;
    let cache = CacheStore::new(&config.thumb_dir)?;
    let metrics = Arc::new(metrics::Metrics::new());
    let state = Arc::new(AppState::new(config, db, cache, metrics));

    let app = build_app(state.clone());

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(address = %addr, "thumbserve listening");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn test_config(root: PathBuf) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            image_dir: root.join("images"),
            thumb_dir: root.join("thumbs"),
            db_path: root.join("queue.db"),
            allow_origins: Vec::new(),
            referrer_exclusion_origins: Vec::new(),
            quality_default: 80,
            cache_control: "max-age=600".to_string(),
            api_username: "admin".to_string(),
            api_password: "secret".to_string(),
            max_in_flight_requests: 4,
            singleflight_wait: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn app_serves_through_middleware_stack() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let db = Database::new(&config).await.unwrap();
        let cache = CacheStore::new(&config.thumb_dir).unwrap();
        let metrics = Arc::new(metrics::Metrics::new());
        let state = Arc::new(AppState::new(config, db, cache, metrics));
        let app = build_app(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
