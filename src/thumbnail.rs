use crate::format::ImageType;
use crate::size::ImageSize;
use mime::Mime;
use std::path::{Path, PathBuf};

/// Identity of one thumbnail derivative. The cache key *is* the file path:
/// `{source}@s={w}x{h}[;q={quality}].{ext}`, so the filesystem doubles as
/// the cache index and a freshness check is a single stat comparison.
///
/// The value is immutable; switching to a fallback format produces a new
/// identity via [`ThumbnailIdentity::with_fallback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailIdentity {
    source_path: String,
    format: ImageType,
    size: ImageSize,
    quality: Option<u8>,
}

impl ThumbnailIdentity {
    /// `quality` is kept only for quality-sensitive formats so the encoded
    /// cache path stays format-correct.
    pub fn new(source_path: &str, format: ImageType, size: ImageSize, quality: Option<u8>) -> Self {
        Self {
            source_path: source_path.to_string(),
            format,
            size,
            quality: if format.quality_sensitive() { quality } else { None },
        }
    }

    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    pub fn format(&self) -> ImageType {
        self.format
    }

    pub fn size(&self) -> ImageSize {
        self.size
    }

    pub fn quality(&self) -> Option<u8> {
        self.quality
    }

    pub fn mime(&self) -> Mime {
        self.format.mime()
    }

    pub fn fallback_format(&self) -> Option<ImageType> {
        self.format.fallback()
    }

    /// Cache file path relative to the cache root. Must stay bit-exact with
    /// the out-of-process batch generator's naming, e.g.
    /// `path/to.jpg@s=100x200;q=80.webp`.
    pub fn cache_path(&self) -> String {
        let param_size = format!("s={}x{}", self.size.width, self.size.height);
        let params = match self.quality {
            Some(quality) => format!("{param_size};q={quality}"),
            None => param_size,
        };
        format!("{}@{}.{}", self.source_path, params, self.format.extension())
    }

    pub fn full_cache_path(&self, cache_root: &Path) -> PathBuf {
        cache_root.join(self.cache_path())
    }

    /// New identity for this derivative's fallback format, carrying size and
    /// quality over (quality re-normalized for the new format).
    pub fn with_fallback(&self) -> Option<Self> {
        let fallback = self.format.fallback()?;
        Some(Self::new(&self.source_path, fallback, self.size, self.quality))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_path_includes_quality_for_sensitive_formats() {
        let identity = ThumbnailIdentity::new(
            "path/to.jpg",
            ImageType::Webp,
            ImageSize::new(100, 200),
            Some(80),
        );
        assert_eq!(identity.cache_path(), "path/to.jpg@s=100x200;q=80.webp");
    }

    #[test]
    fn cache_path_omits_quality_for_png() {
        let identity = ThumbnailIdentity::new(
            "photo/cat.png",
            ImageType::Png,
            ImageSize::new(320, 240),
            Some(80),
        );
        assert_eq!(identity.cache_path(), "photo/cat.png@s=320x240.png");
        assert_eq!(identity.quality(), None);
    }

    #[test]
    fn cache_path_is_deterministic() {
        let a = ThumbnailIdentity::new("a.jpg", ImageType::Avif, ImageSize::new(10, 20), Some(50));
        let b = ThumbnailIdentity::new("a.jpg", ImageType::Avif, ImageSize::new(10, 20), Some(50));
        assert_eq!(a.cache_path(), b.cache_path());
        assert_eq!(a.cache_path(), "a.jpg@s=10x20;q=50.avif");
    }

    #[test]
    fn full_cache_path_joins_root() {
        let identity =
            ThumbnailIdentity::new("a.jpg", ImageType::Jpeg, ImageSize::new(10, 20), Some(80));
        assert_eq!(
            identity.full_cache_path(Path::new("/var/cache/thumb")),
            PathBuf::from("/var/cache/thumb/a.jpg@s=10x20;q=80.jpeg")
        );
    }

    #[test]
    fn fallback_carries_size_and_quality() {
        let avif = ThumbnailIdentity::new(
            "sample.jpg",
            ImageType::Avif,
            ImageSize::new(50, 100),
            Some(80),
        );
        let webp = avif.with_fallback().unwrap();
        assert_eq!(webp.format(), ImageType::Webp);
        assert_eq!(webp.size(), ImageSize::new(50, 100));
        assert_eq!(webp.quality(), Some(80));
        assert_eq!(webp.cache_path(), "sample.jpg@s=50x100;q=80.webp");
        // the original identity is untouched
        assert_eq!(avif.format(), ImageType::Avif);
        assert!(webp.with_fallback().is_none());
    }
}
