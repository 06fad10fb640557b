use crate::cache::{self, CachedFile};
use crate::db::QueuedGeneration;
use crate::format::{ImageType, original_mime};
use crate::metrics::RequestOutcome;
use crate::pipeline;
use crate::policy::{self, PolicyDecision};
use crate::size::{self, ImageSize};
use crate::state::AppState;
use crate::thumbnail::ThumbnailIdentity;
use anyhow::{Context, Result};
use axum::http::HeaderMap;
use std::path::{Component, Path, PathBuf};
use std::time::{Instant, SystemTime};
use thiserror::Error;
use tracing::info;

/// Client-recoverable request failures. Anything `Internal` is a server
/// fault and surfaces as a generic error upstream.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("file not found")]
    NotFound,
    #[error("unsupported source image")]
    UnsupportedSource,
    #[error("access from an unauthorized origin")]
    PolicyDenied,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// A validated thumbnail request: parameters are in range and the format is
/// a registry member before the engine ever runs.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub source_path: String,
    pub format: ImageType,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: u8,
}

#[derive(Debug)]
pub struct RenderResponse {
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// Set on cache-hit paths; drives `Last-Modified`/`If-Modified-Since`.
    pub modified: Option<SystemTime>,
    /// Original-asset responses skip `Cache-Control`.
    pub send_cache_control: bool,
    pub allow_origin: Option<String>,
    pub vary: &'static str,
    pub outcome: RequestOutcome,
}

/// The per-request decision: resolve the source, apply the embedding
/// policy, probe the cache, and either serve, defer-and-fall-back, or
/// regenerate.
pub async fn render_thumbnail(
    state: &AppState,
    request: RenderRequest,
    headers: &HeaderMap,
) -> Result<RenderResponse, RenderError> {
    let source_full = resolve_source_path(&state.config.image_dir, &request.source_path)
        .ok_or(RenderError::NotFound)?;
    let source_modified = cache::modified_time(&source_full)
        .await
        .ok_or(RenderError::NotFound)?;

    let outcome = policy::evaluate(&state.config, headers, &request.source_path);
    let allow_origin = match outcome.decision {
        PolicyDecision::Denied => return Err(RenderError::PolicyDenied),
        PolicyDecision::Original => {
            return serve_original(&request, &source_full, outcome.vary).await;
        }
        PolicyDecision::Thumbnail { allow_origin } => allow_origin,
    };

    let natural = crate::encoder::probe_dimensions(&source_full)
        .await
        .map_err(|_| RenderError::UnsupportedSource)?;
    let resolved = size::resolve(request.width, request.height, natural);
    let identity = ThumbnailIdentity::new(
        &request.source_path,
        request.format,
        resolved,
        Some(request.quality),
    );

    if let Some(cached) = probe_fresh(state, &identity, source_modified).await {
        return Ok(RenderResponse {
            bytes: cached.bytes,
            content_type: identity.mime().to_string(),
            modified: Some(cached.modified),
            send_cache_control: true,
            allow_origin,
            vary: outcome.vary,
            outcome: RequestOutcome::CacheHit,
        });
    }

    // Formats with a fallback are not generated in the request path: queue
    // the primary format for the batch generator and serve the fallback.
    if identity.fallback_format().is_some() {
        enqueue_primary(state, &identity).await?;
        let fallback = identity
            .with_fallback()
            .context("fallback format vanished")?;
        if let Some(cached) = state
            .cache
            .load(&fallback.full_cache_path(state.cache.thumb_dir()))
            .await
        {
            return Ok(RenderResponse {
                bytes: cached.bytes,
                content_type: fallback.mime().to_string(),
                modified: Some(cached.modified),
                send_cache_control: true,
                allow_origin,
                vary: outcome.vary,
                outcome: RequestOutcome::Deferred,
            });
        }
        let bytes = generate_collapsed(state, &source_full, &fallback).await?;
        return Ok(RenderResponse {
            bytes,
            content_type: fallback.mime().to_string(),
            modified: None,
            send_cache_control: true,
            allow_origin,
            vary: outcome.vary,
            outcome: RequestOutcome::Deferred,
        });
    }

    let bytes = generate_collapsed(state, &source_full, &identity).await?;
    Ok(RenderResponse {
        bytes,
        content_type: identity.mime().to_string(),
        modified: None,
        send_cache_control: true,
        allow_origin,
        vary: outcome.vary,
        outcome: RequestOutcome::Generated,
    })
}

/// Synchronous generation for the authenticated create API: the caller
/// dictates the exact output dimensions, no policy or cache probe.
pub async fn force_generate(
    state: &AppState,
    source_path: &str,
    format: ImageType,
    size: ImageSize,
    quality: Option<u8>,
) -> Result<(), RenderError> {
    let source_full =
        resolve_source_path(&state.config.image_dir, source_path).ok_or(RenderError::NotFound)?;
    if cache::modified_time(&source_full).await.is_none() {
        return Err(RenderError::NotFound);
    }
    let identity = ThumbnailIdentity::new(source_path, format, size, quality);
    generate_collapsed(state, &source_full, &identity).await?;
    Ok(())
}

async fn serve_original(
    request: &RenderRequest,
    source_full: &Path,
    vary: &'static str,
) -> Result<RenderResponse, RenderError> {
    let extension = source_full
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("");
    let mime = original_mime(extension).ok_or(RenderError::UnsupportedSource)?;
    let bytes = tokio::fs::read(source_full)
        .await
        .with_context(|| format!("read original {:?}", source_full))?;
    info!(source = %request.source_path, "serving original asset");
    Ok(RenderResponse {
        bytes,
        content_type: mime.to_string(),
        modified: None,
        send_cache_control: false,
        allow_origin: None,
        vary,
        outcome: RequestOutcome::Original,
    })
}

/// Loads the identity's cache entry if it exists and is at least as new as
/// the source. A stale entry is reported (and left for the regeneration to
/// overwrite) — expected churn after a source update, not an error.
async fn probe_fresh(
    state: &AppState,
    identity: &ThumbnailIdentity,
    source_modified: SystemTime,
) -> Option<CachedFile> {
    let cached = state
        .cache
        .load(&identity.full_cache_path(state.cache.thumb_dir()))
        .await?;
    if cached.modified >= source_modified {
        return Some(cached);
    }
    info!(
        cache_path = %identity.cache_path(),
        "source newer than cached thumbnail; replacing"
    );
    None
}

async fn enqueue_primary(state: &AppState, identity: &ThumbnailIdentity) -> Result<()> {
    let request = QueuedGeneration::from_identity(identity);
    let inserted = state.db.enqueue_generation(&request).await?;
    state.metrics.observe_queue_insert(inserted > 0);
    if inserted > 0 {
        info!(
            source = %identity.source_path(),
            format = identity.format().as_str(),
            "generation queued for batch processing"
        );
    }
    Ok(())
}

/// Runs the pipeline behind the per-key singleflight. Non-leaders wait for
/// the leader and re-probe the cache; only if the entry still is not there
/// do they generate themselves. The encode itself runs on a detached task
/// so a client hanging up does not waste the almost-finished derivative.
async fn generate_collapsed(
    state: &AppState,
    source_full: &Path,
    identity: &ThumbnailIdentity,
) -> Result<Vec<u8>> {
    let permit = state.singleflight.acquire(&identity.cache_path());
    if !permit.is_leader() {
        permit.wait_for_leader(state.config.singleflight_wait).await;
        if let Some(cached) = state
            .cache
            .load(&identity.full_cache_path(state.cache.thumb_dir()))
            .await
        {
            return Ok(cached.bytes);
        }
    }
    let started = Instant::now();
    let task = {
        let cache = state.cache.clone();
        let source = source_full.to_path_buf();
        let identity = identity.clone();
        tokio::spawn(async move { pipeline::generate(&cache, &source, &identity).await })
    };
    let bytes = task.await.context("generation task aborted")??;
    state
        .metrics
        .observe_generation_seconds(started.elapsed().as_secs_f64());
    Ok(bytes)
}

/// Joins a request path to the image root, refusing empty, absolute and
/// parent-traversing paths. A path that cannot be represented under the
/// root is reported as missing.
fn resolve_source_path(image_dir: &Path, source_path: &str) -> Option<PathBuf> {
    if source_path.is_empty() {
        return None;
    }
    let relative = Path::new(source_path);
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            _ => return None,
        }
    }
    Some(image_dir.join(relative))
}
