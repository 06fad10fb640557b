use axum::http::HeaderMap;
use axum::http::header;
use base64::Engine;
use subtle::ConstantTimeEq;

/// Checks the request's `Authorization: Basic` credentials against the
/// configured account. Comparison is constant-time on both fields.
pub fn verify_basic(headers: &HeaderMap, username: &str, password: &str) -> bool {
    let Some(credentials) = extract_credentials(headers) else {
        return false;
    };
    let user_ok: bool = credentials
        .username
        .as_bytes()
        .ct_eq(username.as_bytes())
        .into();
    let pass_ok: bool = credentials
        .password
        .as_bytes()
        .ct_eq(password.as_bytes())
        .into();
    user_ok && pass_ok
}

struct Credentials {
    username: String,
    password: String,
}

fn extract_credentials(headers: &HeaderMap) -> Option<Credentials> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(Credentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn auth_headers(raw: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(raw).unwrap());
        headers
    }

    fn basic(username: &str, password: &str) -> HeaderMap {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{username}:{password}"));
        auth_headers(&format!("Basic {token}"))
    }

    #[test]
    fn accepts_matching_credentials() {
        assert!(verify_basic(&basic("admin", "secret"), "admin", "secret"));
    }

    #[test]
    fn rejects_wrong_password_or_user() {
        assert!(!verify_basic(&basic("admin", "wrong"), "admin", "secret"));
        assert!(!verify_basic(&basic("other", "secret"), "admin", "secret"));
    }

    #[test]
    fn rejects_missing_or_malformed_header() {
        assert!(!verify_basic(&HeaderMap::new(), "admin", "secret"));
        assert!(!verify_basic(&auth_headers("Bearer token"), "admin", "secret"));
        assert!(!verify_basic(&auth_headers("Basic ???"), "admin", "secret"));
    }

    #[test]
    fn password_may_contain_colons() {
        assert!(verify_basic(&basic("admin", "se:cr:et"), "admin", "se:cr:et"));
    }
}
