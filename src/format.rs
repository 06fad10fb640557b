use mime::Mime;

/// Output formats the thumbnail pipeline can produce. The registry data
/// (MIME type, file extension, quality handling, batch fallback) lives in
/// the match arms so adding a format forces every call site to be revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageType {
    Avif,
    Webp,
    Jpeg,
    Png,
}

impl ImageType {
    pub fn from_param(value: &str) -> Option<Self> {
        match value {
            "avif" => Some(Self::Avif),
            "webp" => Some(Self::Webp),
            "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    pub fn mime(&self) -> Mime {
        match self {
            Self::Avif => "image/avif".parse().unwrap(),
            Self::Webp => "image/webp".parse().unwrap(),
            Self::Jpeg => "image/jpeg".parse().unwrap(),
            Self::Png => "image/png".parse().unwrap(),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Avif => "avif",
            Self::Webp => "webp",
            Self::Jpeg => "jpeg",
            Self::Png => "png",
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.extension()
    }

    /// Whether the encoder takes a quality setting for this format. The
    /// quality segment appears in the cache file name only when this is true.
    pub fn quality_sensitive(&self) -> bool {
        match self {
            Self::Avif | Self::Webp | Self::Jpeg => true,
            Self::Png => false,
        }
    }

    /// Format served in place of this one while batch generation is pending.
    pub fn fallback(&self) -> Option<Self> {
        match self {
            Self::Avif => Some(Self::Webp),
            Self::Webp | Self::Jpeg | Self::Png => None,
        }
    }
}

/// MIME type for an original (non-derived) asset, keyed by its file
/// extension. Originals outside this table are refused rather than sniffed.
pub fn original_mime(extension: &str) -> Option<&'static str> {
    match extension.to_ascii_lowercase().as_str() {
        "avif" => Some("image/avif"),
        "jpeg" | "jpg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "svg" => Some("image/svg+xml;charset=utf-8"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}
