use crate::cache::CacheStore;
use crate::encoder::{self, EncodeRequest};
use crate::format::ImageType;
use crate::thumbnail::ThumbnailIdentity;
use anyhow::{Context, Result};
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

/// A generated derivative that ballooned this far past its source gets
/// flagged: re-encoding an already tiny source near-losslessly can produce
/// absurd output.
const SIZE_WARN_RATIO: u64 = 10;
const SIZE_WARN_MIN_BYTES: u64 = 10 * 1024;

/// Produces one derivative: encodes the source at the identity's dimensions
/// and format, writes it into the cache (atomically) and returns the bytes
/// for immediate use, so the response never re-reads the file.
pub async fn generate(
    cache: &CacheStore,
    source_path: &Path,
    identity: &ThumbnailIdentity,
) -> Result<Vec<u8>> {
    let destination = identity.full_cache_path(cache.thumb_dir());

    // Palette output only for sources that are already reduced-palette.
    let palette = identity.format() == ImageType::Png && encoder::is_palette_png(source_path).await;

    let request = EncodeRequest {
        size: identity.size(),
        format: identity.format(),
        quality: identity.quality(),
        palette,
    };

    let started = Instant::now();
    let bytes = {
        let source = source_path.to_path_buf();
        tokio::task::spawn_blocking(move || encoder::encode(&source, &request))
            .await
            .context("encoder task panicked")??
    };
    cache.store(&destination, &bytes).await?;
    let elapsed = started.elapsed();

    let original_bytes = tokio::fs::metadata(source_path)
        .await
        .map(|metadata| metadata.len())
        .unwrap_or(0);
    let generated_bytes = bytes.len() as u64;
    info!(
        cache_path = %identity.cache_path(),
        elapsed_ms = elapsed.as_millis() as u64,
        original = %format_size(original_bytes),
        generated = %format_size(generated_bytes),
        "thumbnail generated"
    );
    if generated_bytes >= original_bytes.saturating_mul(SIZE_WARN_RATIO)
        && generated_bytes >= SIZE_WARN_MIN_BYTES
    {
        warn!(
            cache_path = %identity.cache_path(),
            original = %format_size(original_bytes),
            generated = %format_size(generated_bytes),
            "generated thumbnail is far larger than its source"
        );
    }

    Ok(bytes)
}

/// IEC byte formatting with one decimal, e.g. `1.5 KiB`.
fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
