//! Demo web UI and JSON API over the breed and try-on pipelines.

use crate::breed::{BreedDetector, BreedReport};
use crate::config::Settings;
use crate::detector::AnimalKind;
use crate::error::PawsightError;
use crate::prompt::{Catalog, Product, Style};
use crate::tryon::{ProductRef, TryOnPipeline, TryOnRequest};
use axum::extract::multipart::{Multipart, MultipartError};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, ImageFormat, RgbImage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn};

const INDEX_HTML: &str = include_str!("../assets/index.html");
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
    pub errors: Vec<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            errors,
        }
    }
}

/// Error response carrying its status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    errors: Vec<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            errors: Vec::new(),
        }
    }

    fn bad_request(message: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            errors,
            ..Self::new(StatusCode::BAD_REQUEST, message)
        }
    }

    fn not_ready(what: &str, failure: Option<String>) -> Self {
        let message = failure.map_or_else(
            || format!("{what} service is initializing..."),
            |e| format!("{what} service failed to load: {e}"),
        );
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    fn internal(e: &impl std::fmt::Display) -> Self {
        Self {
            errors: vec![e.to_string()],
            ..Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "An error occurred while processing your request",
            )
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()>::error(self.message, self.errors);
        (self.status, Json(body)).into_response()
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        Self::bad_request("Invalid request", vec![e.body_text()])
    }
}

impl From<PawsightError> for ApiError {
    fn from(e: PawsightError) -> Self {
        match e {
            PawsightError::UnknownProduct(_) | PawsightError::NoAnimal | PawsightError::Config(_) => {
                Self::bad_request(e.to_string(), Vec::new())
            }
            other => Self::internal(&other),
        }
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Models load once in the background; handlers answer 503 until then.
pub struct AppState {
    pub settings: Settings,
    pub catalog: Catalog,
    breed: OnceLock<Mutex<BreedDetector>>,
    tryon: OnceLock<Mutex<TryOnPipeline>>,
    breed_failure: Mutex<Option<String>>,
    tryon_failure: Mutex<Option<String>>,
}

impl AppState {
    #[must_use]
    pub fn new(settings: Settings, catalog: Catalog) -> Self {
        Self {
            settings,
            catalog,
            breed: OnceLock::new(),
            tryon: OnceLock::new(),
            breed_failure: Mutex::new(None),
            tryon_failure: Mutex::new(None),
        }
    }

    /// Settings plus the product catalog from disk, empty if it cannot be read.
    #[must_use]
    pub fn from_settings(settings: Settings) -> Self {
        let catalog = Catalog::from_file(&settings.tryon.catalog).unwrap_or_else(|e| {
            warn!(path = %settings.tryon.catalog.display(), error = %e, "no product catalog");
            Catalog::default()
        });
        Self::new(settings, catalog)
    }

    #[must_use]
    pub fn breed_ready(&self) -> bool {
        self.breed.get().is_some()
    }

    /// Load both pipelines on the blocking pool, breed first.
    pub fn spawn_loader(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            match BreedDetector::new(&state.settings).and_then(|mut detector| {
                detector.init()?;
                Ok(detector)
            }) {
                Ok(detector) => {
                    if state.breed.set(Mutex::new(detector)).is_err() {
                        warn!("breed detector already loaded");
                    }
                    info!("breed detection ready");
                }
                Err(e) => {
                    error!(error = %e, "breed detection failed to load");
                    *state.breed_failure.lock() = Some(e.to_string());
                }
            }
            match TryOnPipeline::new(&state.settings) {
                Ok(pipeline) => {
                    if state.tryon.set(Mutex::new(pipeline)).is_err() {
                        warn!("try-on pipeline already loaded");
                    }
                    info!("try-on ready");
                }
                Err(e) => {
                    error!(error = %e, "try-on failed to load");
                    *state.tryon_failure.lock() = Some(e.to_string());
                }
            }
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/breed-detection/detect", post(detect_breed))
        .route("/api/breed-detection/status", get(status))
        .route("/api/products", get(products))
        .route("/api/try-on", post(try_on))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Bind, start loading models, and serve until Ctrl+C.
pub async fn serve(settings: Settings, bind: SocketAddr) -> std::io::Result<()> {
    let state = Arc::new(AppState::from_settings(settings));
    state.spawn_loader();

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %listener.local_addr()?, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutting down");
        })
        .await
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Debug, Serialize)]
pub struct StatusData {
    pub ready: bool,
    pub message: String,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<StatusData>> {
    let ready = state.breed_ready();
    let message = if ready {
        "Breed detection service is ready".to_string()
    } else if let Some(e) = state.breed_failure.lock().clone() {
        format!("Breed detection service failed to load: {e}")
    } else {
        "Breed detection service is initializing...".to_string()
    };
    Json(ApiResponse::ok(StatusData { ready, message }, "OK"))
}

#[derive(Debug, Deserialize)]
pub struct ProductQuery {
    pub animal: Option<AnimalKind>,
}

async fn products(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProductQuery>,
) -> Json<ApiResponse<Vec<Product>>> {
    let products: Vec<Product> = state
        .catalog
        .products_for(query.animal)
        .into_iter()
        .cloned()
        .collect();
    let message = format!("Found {} products", products.len());
    Json(ApiResponse::ok(products, message))
}

/// Multipart fields shared by both upload endpoints.
#[derive(Default)]
struct UploadForm {
    image: Option<Vec<u8>>,
    animal: Option<String>,
    product_id: Option<String>,
    style: Option<String>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "image" => form.image = Some(field.bytes().await?.to_vec()),
                "animalType" => form.animal = Some(field.text().await?),
                "productId" => form.product_id = Some(field.text().await?),
                "style" => form.style = Some(field.text().await?),
                other => debug!(field = other, "ignoring form field"),
            }
        }
        Ok(form)
    }

    fn decode_image(&self) -> Result<DynamicImage, ApiError> {
        let bytes = self
            .image
            .as_deref()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ApiError::bad_request("Invalid request", vec!["Image is required".into()]))?;
        image::load_from_memory(bytes)
            .map_err(|e| ApiError::bad_request("Invalid image", vec![e.to_string()]))
    }

    fn animal(&self) -> Result<Option<AnimalKind>, ApiError> {
        match self.animal.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => s
                .parse()
                .map(Some)
                .map_err(|e: PawsightError| ApiError::bad_request("Invalid request", vec![e.to_string()])),
        }
    }
}

async fn detect_breed(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> ApiResult<BreedReport> {
    if !state.breed_ready() {
        return Err(ApiError::not_ready("Breed detection", state.breed_failure.lock().clone()));
    }
    let form = UploadForm::read(multipart).await?;
    let image = form.decode_image()?;
    let hint = form.animal()?;

    let worker = Arc::clone(&state);
    let report = tokio::task::spawn_blocking(move || {
        worker
            .breed
            .get()
            .map(|detector| detector.lock().detect_breed(&image, hint, false))
    })
    .await
    .map_err(|e| ApiError::internal(&e))?
    .ok_or_else(|| ApiError::not_ready("Breed detection", None))?;

    if let BreedReport::Failure(failure) = &report {
        return Err(ApiError::bad_request(failure.error.clone(), Vec::new()));
    }
    Ok(Json(ApiResponse::ok(report, "Breed detected successfully")))
}

#[derive(Debug, Serialize)]
pub struct TryOnData {
    pub images: Vec<String>,
    pub edge_map: String,
    pub animal_type: AnimalKind,
    pub product_id: String,
    pub style: Style,
    pub style_name: &'static str,
    pub prompt: String,
    pub negative_prompt: String,
    pub processing_time_ms: u64,
}

pub fn encode_png(image: &RgbImage) -> crate::error::Result<String> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(general_purpose::STANDARD.encode(bytes))
}

async fn try_on(State(state): State<Arc<AppState>>, multipart: Multipart) -> ApiResult<TryOnData> {
    if state.tryon.get().is_none() {
        return Err(ApiError::not_ready("Try-on", state.tryon_failure.lock().clone()));
    }
    let form = UploadForm::read(multipart).await?;
    let image = form.decode_image()?;
    let product_id = form
        .product_id
        .clone()
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Invalid request", vec!["productId is required".into()]))?;
    let request = TryOnRequest {
        product: ProductRef::Catalog(product_id),
        style: form
            .style
            .as_deref()
            .map(Style::from_id_or_default)
            .unwrap_or_default(),
        animal: form.animal()?,
    };

    let worker = Arc::clone(&state);
    let data = tokio::task::spawn_blocking(move || -> Result<TryOnData, ApiError> {
        let pipeline = worker
            .tryon
            .get()
            .ok_or_else(|| ApiError::not_ready("Try-on", None))?;
        let result = pipeline.lock().generate(&image, &request, &mut |p| {
            debug!(progress = p, "try-on step");
        })?;
        Ok(TryOnData {
            images: result
                .images
                .iter()
                .map(encode_png)
                .collect::<crate::error::Result<_>>()?,
            edge_map: encode_png(&result.control)?,
            animal_type: result.animal_type,
            product_id: result.product_id,
            style: result.style,
            style_name: result.style.display_name(),
            prompt: result.prompts.positive,
            negative_prompt: result.prompts.negative,
            processing_time_ms: result.processing_time_ms,
        })
    })
    .await
    .map_err(|e| ApiError::internal(&e))??;

    Ok(Json(ApiResponse::ok(data, "Try-on generated successfully")))
}
