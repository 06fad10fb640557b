use crate::auth;
use crate::format::ImageType;
use crate::render::{self, RenderError, RenderRequest, RenderResponse};
use crate::size::ImageSize;
use crate::state::AppState;
use axum::Router;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::SystemTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

const MAX_DIMENSION: u32 = 9999;
const MAX_QUALITY: u32 = 100;

/// IMF-fixdate, the only `Last-Modified`/`If-Modified-Since` form emitted
/// and accepted, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
const HTTP_DATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/thumbimage/{*path}", get(render_thumbimage))
        .route("/api/thumbimage/create", post(create_thumbimage))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    (headers, state.metrics.render())
}

async fn render_thumbimage(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let params = parse_render_query(query.as_deref().unwrap_or(""), &headers)?;
    let request = RenderRequest {
        source_path: path,
        format: params.format,
        width: params.width,
        height: params.height,
        quality: params.quality.unwrap_or(state.config.quality_default),
    };
    match render::render_thumbnail(&state, request, &headers).await {
        Ok(response) => Ok(to_http_response(&state, response, &headers)),
        Err(err) => {
            if matches!(err, RenderError::PolicyDenied) {
                state
                    .metrics
                    .observe_request(crate::metrics::RequestOutcome::Denied);
            }
            Err(map_render_error(err))
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateBody {
    path: String,
    #[serde(rename = "type")]
    format: String,
    width: u32,
    height: u32,
    quality: Option<u32>,
}

async fn create_thumbimage(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateBody>,
) -> Result<StatusCode, ApiError> {
    if !auth::verify_basic(&headers, &state.config.api_username, &state.config.api_password) {
        return Err(ApiError::unauthorized());
    }

    // The create API reports validation failures as 403, unlike the render
    // route's 400.
    let format = ImageType::from_param(&body.format)
        .ok_or_else(|| ApiError::forbidden("The value of the `type` parameter is not an accepted string"))?;
    if body.path.is_empty() {
        return Err(ApiError::forbidden("The `path` parameter is invalid"));
    }
    for (value, name) in [(body.width, "width"), (body.height, "height")] {
        if !(1..=MAX_DIMENSION).contains(&value) {
            return Err(ApiError::forbidden(&format!(
                "The value of the `{name}` parameter must be between 1 and 9999"
            )));
        }
    }
    let quality = match body.quality {
        Some(value) if !(1..=MAX_QUALITY).contains(&value) => {
            return Err(ApiError::forbidden(
                "The value of the `quality` parameter must be between 1 and 100",
            ));
        }
        Some(value) => Some(value as u8),
        None => Some(state.config.quality_default),
    };

    let size = ImageSize::new(body.width, body.height);
    match render::force_generate(&state, &body.path, format, size, quality).await {
        Ok(()) => {
            state
                .metrics
                .observe_request(crate::metrics::RequestOutcome::Generated);
            Ok(StatusCode::NO_CONTENT)
        }
        Err(err) => Err(map_render_error(err)),
    }
}

struct RenderQueryParams {
    format: ImageType,
    width: Option<u32>,
    height: Option<u32>,
    quality: Option<u8>,
}

/// Validates the render query. `type` may repeat and is resolved against
/// `Accept`; the numeric parameters are single-valued and bounded.
fn parse_render_query(query: &str, headers: &HeaderMap) -> Result<RenderQueryParams, ApiError> {
    let mut types: Vec<ImageType> = Vec::new();
    let mut widths: Vec<String> = Vec::new();
    let mut heights: Vec<String> = Vec::new();
    let mut qualities: Vec<String> = Vec::new();

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "type" => {
                let format = ImageType::from_param(&value).ok_or_else(|| {
                    ApiError::bad_request("The value of the `type` parameter is not an accepted string")
                })?;
                types.push(format);
            }
            "w" => widths.push(value.into_owned()),
            "h" => heights.push(value.into_owned()),
            "quality" => qualities.push(value.into_owned()),
            _ => {}
        }
    }

    if types.is_empty() {
        return Err(ApiError::bad_request("The `type` parameter is required"));
    }
    let format = negotiate_type(&types, headers);

    let width = parse_single_uint(&widths, "w", MAX_DIMENSION)?;
    let height = parse_single_uint(&heights, "h", MAX_DIMENSION)?;
    let quality = parse_single_uint(&qualities, "quality", MAX_QUALITY)?.map(|value| value as u8);

    Ok(RenderQueryParams {
        format,
        width,
        height,
        quality,
    })
}

fn parse_single_uint(
    values: &[String],
    name: &str,
    max: u32,
) -> Result<Option<u32>, ApiError> {
    match values {
        [] => Ok(None),
        [value] => {
            let parsed: u32 = value.parse().map_err(|_| {
                ApiError::bad_request(&format!("The value of the `{name}` parameter must be an integer"))
            })?;
            if !(1..=max).contains(&parsed) {
                return Err(ApiError::bad_request(&format!(
                    "The value of the `{name}` parameter must be between 1 and {max}"
                )));
            }
            Ok(Some(parsed))
        }
        _ => Err(ApiError::bad_request(&format!(
            "The `{name}` parameter can only be singular"
        ))),
    }
}

/// Picks the first requested format acceptable to the client, falling back
/// to the last supplied value when nothing matches.
fn negotiate_type(types: &[ImageType], headers: &HeaderMap) -> ImageType {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok());
    let Some(accept) = accept else {
        return types[0];
    };
    for candidate in types {
        if accepts(accept, candidate) {
            return *candidate;
        }
    }
    *types.last().expect("types checked non-empty")
}

fn accepts(accept: &str, format: &ImageType) -> bool {
    let mime = format.mime();
    for range in accept.split(',') {
        let media = range.split(';').next().unwrap_or("").trim();
        if media == "*/*" || media == "image/*" || media == mime.essence_str() {
            return true;
        }
    }
    false
}

fn to_http_response(state: &AppState, response: RenderResponse, request_headers: &HeaderMap) -> Response {
    if let Some(modified) = response.modified {
        if not_modified_since(request_headers, modified) {
            state
                .metrics
                .observe_request(crate::metrics::RequestOutcome::NotModified);
            let mut headers = HeaderMap::new();
            append_vary(&mut headers, response.vary);
            return (StatusCode::NOT_MODIFIED, headers).into_response();
        }
    }

    state.metrics.observe_request(response.outcome);
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&response.content_type)
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    if response.send_cache_control {
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_str(&state.config.cache_control)
                .unwrap_or(HeaderValue::from_static("no-store")),
        );
    }
    if let Some(modified) = response.modified {
        if let Some(value) = format_http_date(modified) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
    if let Some(origin) = response.allow_origin.as_deref() {
        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }
    append_vary(&mut headers, response.vary);
    (headers, response.bytes).into_response()
}

fn append_vary(headers: &mut HeaderMap, vary: &'static str) {
    headers.append(header::VARY, HeaderValue::from_static(vary));
}

/// Second-granularity conditional check: HTTP dates carry no sub-second
/// precision, so the stored mtime is truncated before comparing.
fn not_modified_since(request_headers: &HeaderMap, modified: SystemTime) -> bool {
    let Some(value) = request_headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let Some(condition) = parse_http_date(value) else {
        return false;
    };
    let modified = OffsetDateTime::from(modified);
    modified.unix_timestamp() <= condition.unix_timestamp()
}

fn format_http_date(time: SystemTime) -> Option<HeaderValue> {
    let formatted = OffsetDateTime::from(time).format(&HTTP_DATE).ok()?;
    HeaderValue::from_str(&formatted).ok()
}

fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(value, &HTTP_DATE)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

fn map_render_error(error: RenderError) -> ApiError {
    match error {
        RenderError::NotFound => {
            tracing::info!("requested file path does not exist");
            ApiError::not_found("File not found")
        }
        RenderError::UnsupportedSource => {
            tracing::info!("source image dimensions or type unreadable");
            ApiError::forbidden("Unsupported image")
        }
        RenderError::PolicyDenied => {
            ApiError::forbidden("Access from an unauthorized origin")
        }
        RenderError::Internal(err) => {
            tracing::error!(error = ?err, "thumbnail request failed");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
    pub headers: HeaderMap,
}

impl ApiError {
    pub fn new(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": message }),
            headers: HeaderMap::new(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn forbidden(message: &str) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unauthorized() -> Self {
        let mut error = Self::new(StatusCode::UNAUTHORIZED, "Authentication required");
        error.headers.insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"thumbimage\""),
        );
        error
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        response.headers_mut().extend(self.headers);
        response
    }
}
