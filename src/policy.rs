use crate::config::Config;
use axum::http::HeaderMap;
use tracing::{debug, warn};
use url::Url;

/// `Sec-Fetch-Dest` values that mean the asset is being embedded into a
/// document rather than navigated to.
const EMBED_DESTS: [&str; 4] = ["image", "iframe", "object", "embed"];

/// What the request-context signals say this request is entitled to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Trusted context: serve (or generate) the thumbnail derivative.
    /// `allow_origin` echoes an allow-listed `Origin` back to the caller.
    Thumbnail { allow_origin: Option<String> },
    /// Untrusted but harmless context (`<img>`/`<a>` without `crossorigin`,
    /// address-bar navigation): serve the original asset, no generation.
    Original,
    /// Cross-origin caller that is not allow-listed.
    Denied,
}

#[derive(Debug)]
pub struct PolicyOutcome {
    pub decision: PolicyDecision,
    /// Header the decision varied on, for the response `Vary`.
    pub vary: &'static str,
}

/// Applies the embedding policy. Requests carrying an `Origin` header are
/// gated by the allow-list; everything else branches on `Sec-Fetch-Mode`,
/// because a request without CORS metadata cannot be attributed to a
/// trusted embedding context and only ever receives the original bytes.
pub fn evaluate(config: &Config, headers: &HeaderMap, source_path: &str) -> PolicyOutcome {
    if let Some(origin) = header_str(headers, "origin") {
        if config.allow_origins.iter().any(|allowed| allowed == origin) {
            return PolicyOutcome {
                decision: PolicyDecision::Thumbnail {
                    allow_origin: Some(origin.to_string()),
                },
                vary: "Origin",
            };
        }
        if is_embed_context(headers) && !is_excluded_origin(config, origin) {
            warn!(
                source = %source_path,
                origin = %origin,
                dest = header_str(headers, "sec-fetch-dest").unwrap_or("-"),
                "image embedded from a foreign origin"
            );
        }
        return PolicyOutcome {
            decision: PolicyDecision::Denied,
            vary: "Origin",
        };
    }

    let fetch_mode = header_str(headers, "sec-fetch-mode");
    debug!(fetch_mode = fetch_mode.unwrap_or("-"), "fetch mode check");
    if fetch_mode == Some("cors") {
        return PolicyOutcome {
            decision: PolicyDecision::Thumbnail { allow_origin: None },
            vary: "Sec-Fetch-Mode",
        };
    }

    // Monitoring only: an original served into a foreign page is the
    // hotlinking signal worth flagging.
    if is_embed_context(headers) {
        if let Some(referrer_origin) = referrer_origin(headers) {
            if !config
                .allow_origins
                .iter()
                .any(|allowed| *allowed == referrer_origin)
                && !is_excluded_origin(config, &referrer_origin)
            {
                warn!(
                    source = %source_path,
                    referrer = %referrer_origin,
                    dest = header_str(headers, "sec-fetch-dest").unwrap_or("-"),
                    "image embedded from a foreign origin"
                );
            }
        }
    }

    PolicyOutcome {
        decision: PolicyDecision::Original,
        vary: "Sec-Fetch-Mode",
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn is_embed_context(headers: &HeaderMap) -> bool {
    header_str(headers, "sec-fetch-dest")
        .map(|dest| EMBED_DESTS.contains(&dest))
        .unwrap_or(false)
}

fn is_excluded_origin(config: &Config, origin: &str) -> bool {
    config
        .referrer_exclusion_origins
        .iter()
        .any(|excluded| excluded == origin)
}

fn referrer_origin(headers: &HeaderMap) -> Option<String> {
    let referrer = header_str(headers, "referer")?;
    let url = Url::parse(referrer).ok()?;
    let origin = url.origin();
    if !origin.is_tuple() {
        return None;
    }
    Some(origin.ascii_serialization())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            image_dir: PathBuf::from("images"),
            thumb_dir: PathBuf::from("thumbs"),
            db_path: PathBuf::from("queue.db"),
            allow_origins: vec!["https://media.example".to_string()],
            referrer_exclusion_origins: vec!["https://cache.example".to_string()],
            quality_default: 80,
            cache_control: "max-age=600".to_string(),
            api_username: "admin".to_string(),
            api_password: "secret".to_string(),
            max_in_flight_requests: 1,
            singleflight_wait: Duration::from_secs(1),
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn allow_listed_origin_is_echoed() {
        let outcome = evaluate(
            &test_config(),
            &headers(&[("origin", "https://media.example")]),
            "a.jpg",
        );
        assert_eq!(
            outcome.decision,
            PolicyDecision::Thumbnail {
                allow_origin: Some("https://media.example".to_string())
            }
        );
        assert_eq!(outcome.vary, "Origin");
    }

    #[test]
    fn foreign_origin_is_denied() {
        let outcome = evaluate(
            &test_config(),
            &headers(&[("origin", "https://evil.example")]),
            "a.jpg",
        );
        assert_eq!(outcome.decision, PolicyDecision::Denied);
    }

    #[test]
    fn foreign_embedded_origin_is_denied_and_flagged() {
        // exercises the warn path; the decision itself must still be Denied
        let outcome = evaluate(
            &test_config(),
            &headers(&[
                ("origin", "https://evil.example"),
                ("sec-fetch-dest", "image"),
            ]),
            "a.jpg",
        );
        assert_eq!(outcome.decision, PolicyDecision::Denied);
    }

    #[test]
    fn cors_fetch_mode_without_origin_generates() {
        let outcome = evaluate(
            &test_config(),
            &headers(&[("sec-fetch-mode", "cors")]),
            "a.jpg",
        );
        assert_eq!(
            outcome.decision,
            PolicyDecision::Thumbnail { allow_origin: None }
        );
        assert_eq!(outcome.vary, "Sec-Fetch-Mode");
    }

    #[test]
    fn navigation_serves_original() {
        for mode_headers in [
            headers(&[]),
            headers(&[("sec-fetch-mode", "navigate")]),
            headers(&[("sec-fetch-mode", "no-cors")]),
        ] {
            let outcome = evaluate(&test_config(), &mode_headers, "a.jpg");
            assert_eq!(outcome.decision, PolicyDecision::Original);
            assert_eq!(outcome.vary, "Sec-Fetch-Mode");
        }
    }

    #[test]
    fn foreign_embed_with_referrer_still_serves_original() {
        let outcome = evaluate(
            &test_config(),
            &headers(&[
                ("sec-fetch-mode", "no-cors"),
                ("sec-fetch-dest", "image"),
                ("referer", "https://blog.example/entry/1"),
            ]),
            "a.jpg",
        );
        assert_eq!(outcome.decision, PolicyDecision::Original);
    }

    #[test]
    fn excluded_referrer_origin_is_not_flagged() {
        // warn suppression path; still serves the original
        let outcome = evaluate(
            &test_config(),
            &headers(&[
                ("sec-fetch-dest", "image"),
                ("referer", "https://cache.example/mirror"),
            ]),
            "a.jpg",
        );
        assert_eq!(outcome.decision, PolicyDecision::Original);
    }
}
