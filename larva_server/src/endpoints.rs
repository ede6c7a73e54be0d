//! Endpoints of HTTP server.
//!
use std::{path::Path, sync::Arc};

use anyhow::anyhow;
use axum::{
    extract::{DefaultBodyLimit, Multipart},
    headers::Cookie,
    http::{header, HeaderValue},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Extension, Form, Router, TypedHeader,
};
use image::ImageFormat;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    annotate::{encode_jpeg, process_image},
    config::{
        confidence_in_range, has_accepted_extension, AppConfig, DEFAULT_CONFIDENCE, JPEG_QUALITY,
    },
    error::AppError,
    nn::ModelSlot,
    page::{render_model_error, render_page, PageView},
    session::SessionStore,
};

/// Name of the cookie carrying the session id.
pub const SESSION_COOKIE: &str = "larva_session";

/// Largest accepted upload.
pub const MAX_UPLOAD_BYTES: usize = 200 * 1024 * 1024;

/// State shared by all handlers.
pub struct AppState {
    pub model: ModelSlot,
    pub sessions: SessionStore,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(model: ModelSlot, config: AppConfig) -> Self {
        Self {
            model,
            sessions: SessionStore::new(),
            config,
        }
    }
}

/// Build the HTTP router with all endpoints.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/upload", post(upload))
        .route("/remove", post(remove))
        .route("/detect", post(detect))
        .route("/image/original", get(original_image))
        .route("/image/result", get(result_image))
        .route("/download", get(download))
        .route("/logo", get(logo))
        .route("/healthcheck", get(healthcheck))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(Extension(state))
}

/// Session id taken from the request cookie, or a fresh one.
struct SessionCookie {
    id: Uuid,
    is_new: bool,
}

impl SessionCookie {
    fn from_cookie(cookie: Option<TypedHeader<Cookie>>) -> Self {
        let id = cookie
            .as_ref()
            .and_then(|TypedHeader(cookie)| cookie.get(SESSION_COOKIE))
            .and_then(|value| Uuid::parse_str(value).ok());

        match id {
            Some(id) => Self { id, is_new: false },
            None => Self {
                id: Uuid::new_v4(),
                is_new: true,
            },
        }
    }

    /// Attach the cookie to `response` if the browser does not know it yet.
    fn attach(&self, response: impl IntoResponse) -> Response {
        let mut response = response.into_response();
        if self.is_new {
            let cookie = format!(
                "{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax",
                self.id
            );
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
        }
        response
    }
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// The application page.
pub async fn index(
    Extension(state): Extension<Arc<AppState>>,
    cookie: Option<TypedHeader<Cookie>>,
) -> Response {
    if let Some(error) = state.model.error() {
        return Html(render_model_error(error)).into_response();
    }

    let session = SessionCookie::from_cookie(cookie);
    let show_logo = state.config.existing_logo().is_some();
    let view = state
        .sessions
        .get(session.id, |s| PageView {
            show_logo,
            confidence: s.confidence(),
            upload_name: s.upload_ref().map(|upload| upload.name.clone()),
            count: s.count(),
        })
        .unwrap_or(PageView {
            show_logo,
            confidence: DEFAULT_CONFIDENCE,
            ..Default::default()
        });

    session.attach(Html(render_page(&view)))
}

/// Receive an uploaded image in the multipart field `image`.
///
/// Submitting the field without a file clears the session, like removing the file.
pub async fn upload(
    Extension(state): Extension<Arc<AppState>>,
    cookie: Option<TypedHeader<Cookie>>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let session = SessionCookie::from_cookie(cookie);

    let mut file = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidImage(e.to_string()))?
    {
        if field.name() != Some("image") {
            continue;
        }

        let name = field.file_name().map(base_name).unwrap_or_default();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::InvalidImage(e.to_string()))?;
        file = Some((name, bytes.to_vec()));
    }

    let (name, bytes) = match file {
        Some((name, bytes)) if !name.is_empty() => (name, bytes),
        _ => {
            log::info!("Session {}: upload without file, clearing", session.id);
            state.sessions.update(session.id, |s| s.remove());
            return Ok(session.attach(Redirect::to("/")));
        }
    };

    if !has_accepted_extension(&name) {
        return Err(AppError::UnsupportedFormat(name));
    }

    let (bytes, image) = tokio::task::spawn_blocking(move || {
        let image = image::load_from_memory(&bytes).map(|image| image.to_rgb8());
        (bytes, image)
    })
    .await
    .map_err(|e| anyhow!(e))?;
    let image = image.map_err(|e| AppError::InvalidImage(e.to_string()))?;

    log::info!(
        "Session {}: uploaded {} ({}x{}, {} bytes)",
        session.id,
        name,
        image.width(),
        image.height(),
        bytes.len()
    );
    state
        .sessions
        .with_session(session.id, |s| s.upload(&name, bytes, image));

    Ok(session.attach(Redirect::to("/")))
}

/// Forget the uploaded file and its result.
pub async fn remove(
    Extension(state): Extension<Arc<AppState>>,
    cookie: Option<TypedHeader<Cookie>>,
) -> Response {
    let session = SessionCookie::from_cookie(cookie);
    state.sessions.update(session.id, |s| s.remove());
    log::info!("Session {}: file removed", session.id);

    session.attach(Redirect::to("/"))
}

/// Parameters of the detect form.
#[derive(Debug, Deserialize)]
pub struct DetectParams {
    confidence: f32,
}

/// Count the larvae on the uploaded image.
pub async fn detect(
    Extension(state): Extension<Arc<AppState>>,
    cookie: Option<TypedHeader<Cookie>>,
    Form(params): Form<DetectParams>,
) -> Result<Response, AppError> {
    let session = SessionCookie::from_cookie(cookie);
    let confidence = params.confidence;

    let model = match &state.model {
        ModelSlot::Loaded(model) => Arc::clone(model),
        ModelSlot::Failed(msg) => return Err(AppError::ModelUnavailable(msg.clone())),
    };
    if !confidence_in_range(confidence) {
        return Err(AppError::InvalidConfidence(confidence));
    }

    let upload = state
        .sessions
        .update(session.id, |s| {
            s.set_confidence(confidence);
            s.upload_ref()
        })
        .flatten()
        .ok_or(AppError::NoUpload)?;

    let file_id = upload.id.clone();
    let (jpeg, count) = tokio::task::spawn_blocking(move || {
        let annotated = process_image(model.as_ref(), upload.image.clone(), confidence)?;
        let jpeg = encode_jpeg(&annotated.image, JPEG_QUALITY)?;
        Ok::<_, anyhow::Error>((jpeg, annotated.count))
    })
    .await
    .map_err(|e| anyhow!(e))??;

    let stored = state
        .sessions
        .update(session.id, |s| s.store_result(&file_id, jpeg, count));
    match stored.unwrap_or(false) {
        true => log::info!("Session {}: detected {} larvae", session.id, count),
        false => log::info!("Session {}: file changed during detection", session.id),
    }

    Ok(session.attach(Redirect::to("/")))
}

/// The uploaded image as sent by the browser.
pub async fn original_image(
    Extension(state): Extension<Arc<AppState>>,
    cookie: Option<TypedHeader<Cookie>>,
) -> Result<Response, AppError> {
    let session = SessionCookie::from_cookie(cookie);
    let upload = state
        .sessions
        .get(session.id, |s| s.upload_ref())
        .flatten()
        .ok_or(AppError::NotFound)?;

    let headers = [
        (header::CONTENT_TYPE, image_mime_type(&upload.bytes)),
        (header::CACHE_CONTROL, "no-store"),
    ];

    Ok((headers, upload.bytes.clone()).into_response())
}

/// The annotated image of the last detection.
pub async fn result_image(
    Extension(state): Extension<Arc<AppState>>,
    cookie: Option<TypedHeader<Cookie>>,
) -> Result<Response, AppError> {
    let session = SessionCookie::from_cookie(cookie);
    let result = state
        .sessions
        .get(session.id, |s| s.result())
        .flatten()
        .ok_or(AppError::NotFound)?;

    let headers = [
        (header::CONTENT_TYPE, "image/jpeg"),
        (header::CACHE_CONTROL, "no-store"),
    ];

    Ok((headers, result.jpeg.clone()).into_response())
}

/// The annotated image as a file download named after the count.
pub async fn download(
    Extension(state): Extension<Arc<AppState>>,
    cookie: Option<TypedHeader<Cookie>>,
) -> Result<Response, AppError> {
    let session = SessionCookie::from_cookie(cookie);
    let (file_name, result) = state
        .sessions
        .get(session.id, |s| s.download())
        .flatten()
        .ok_or(AppError::NotFound)?;

    let disposition =
        HeaderValue::from_str(&content_disposition(&file_name)).map_err(|e| anyhow!(e))?;

    let mut response = ([(header::CONTENT_TYPE, "image/jpeg")], result.jpeg.clone()).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_DISPOSITION, disposition);

    Ok(response)
}

/// The company logo shown in the sidebar.
pub async fn logo(Extension(state): Extension<Arc<AppState>>) -> Result<Response, AppError> {
    let path = state.config.existing_logo().ok_or(AppError::NotFound)?;
    let bytes = tokio::fs::read(path).await.map_err(|e| anyhow!(e))?;

    Ok(([(header::CONTENT_TYPE, image_mime_type(&bytes))], bytes).into_response())
}

/// `Content-Disposition` for an attachment: an ASCII `filename` for old clients and the exact
/// name as RFC 5987 `filename*`.
fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();

    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(file_name)
    )
}

fn image_mime_type(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => "image/png",
        _ => "image/jpeg",
    }
}

/// Strip any directory part some browsers send along with the file name.
fn base_name(file_name: &str) -> String {
    let name = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    Path::new(name)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_owned()
}
