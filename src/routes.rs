use std::sync::Arc;

use axum::{
    body::Body,
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderValue, Method},
    middleware,
    response::Response,
    routing::{delete, get, post, put},
    Json,
    Router,
};
use data_model::{guess_content_type, FileId, FileRecord};
use futures::TryStreamExt;
use opentelemetry::KeyValue;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::{OpenApi, ToSchema};

use crate::{
    config::{CorsConfig, UploadConfig},
    file_manager::{FileError, FileManager},
    http_objects::{ApiError, DeleteResponse, FileInfo, RenameFile},
    metrics::api_io_stats,
    middleware::{require_api_key, InstanceRequestSpan},
};

#[derive(OpenApi)]
#[openapi(
        paths(
            upload_file,
            list_files,
            download_file,
            delete_file,
            rename_file,
        ),
        components(
            schemas(
                ApiError,
                FileInfo,
                RenameFile,
                DeleteResponse,
                UploadFileForm,
            )
        ),
        tags(
            (name = "filevault", description = "File storage API")
        )
    )]
struct ApiDoc;

#[derive(Clone)]
pub struct RouteState {
    pub file_manager: Arc<FileManager>,
    pub api_key: Arc<String>,
    pub upload: Arc<UploadConfig>,
    pub metrics: Arc<api_io_stats::Metrics>,
}

pub fn create_routes(
    route_state: RouteState,
    cors: &CorsConfig,
    request_span: InstanceRequestSpan,
) -> Router {
    let protected = Router::new()
        .route("/upload", post(upload_file))
        .route("/files", get(list_files))
        .route("/delete/{id}", delete(delete_file))
        .route("/delete/", delete(missing_id))
        .route("/update/{id}", put(rename_file))
        .route("/update/", put(missing_id))
        .route_layer(middleware::from_fn_with_state(
            route_state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/", get(index))
        .route("/docs/openapi.json", get(openapi_json))
        .route("/files/{id}", get(download_file))
        .route("/files/", get(missing_id))
        .merge(protected)
        .layer(DefaultBodyLimit::max(route_state.upload.max_size_bytes))
        .layer(cors_layer(cors))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(route_state)
}

fn cors_layer(cors: &CorsConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);
    if cors.allowed_origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = cors
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

async fn index() -> &'static str {
    "File Storage Service\n\
     \n\
     GET    /              this page\n\
     POST   /upload        upload a file (multipart field \"file\", auth)\n\
     GET    /files         list files (auth)\n\
     GET    /files/{id}    download a file\n\
     DELETE /delete/{id}   delete a file (auth)\n\
     PUT    /update/{id}   rename a file, body {\"name\": \"...\"} (auth)\n\
     GET    /docs/openapi.json\n"
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

pub fn openapi_document() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

async fn missing_id() -> ApiError {
    ApiError::bad_request("missing file id")
}

#[allow(dead_code)]
#[derive(ToSchema)]
struct UploadFileForm {
    #[schema(format = "binary")]
    file: String,
}

/// Upload a file
#[utoipa::path(
    post,
    path = "/upload",
    tag = "filevault",
    request_body(content_type = "multipart/form-data", content = inline(UploadFileForm)),
    responses(
        (status = 200, description = "Id of the stored file", body = String),
        (status = BAD_REQUEST, description = "No file in the request or file type not allowed"),
        (status = UNAUTHORIZED, description = "Missing or wrong API key"),
        (status = 413, description = "File exceeds the upload limit"),
    ),
)]
async fn upload_file(
    State(state): State<RouteState>,
    mut files: Multipart,
) -> Result<String, ApiError> {
    while let Some(field) = files.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::bad_request("file field has no filename"))?;
        let content_type = guess_content_type(&filename);
        if !state.upload.is_allowed(&content_type) {
            return Err(ApiError::bad_request(&format!(
                "file type {} is not allowed",
                content_type
            )));
        }

        let stream = Box::pin(field.map_err(anyhow::Error::from));
        let record = state
            .file_manager
            .upload(&filename, stream)
            .await
            .map_err(upload_error)?;

        let labels = [KeyValue::new("content_type", record.content_type.clone())];
        state.metrics.uploads.add(1, &labels);
        state.metrics.upload_bytes.add(record.size, &labels);
        return Ok(record.id.get().to_string());
    }
    Err(ApiError::bad_request("no file in request"))
}

fn multipart_error(err: MultipartError) -> ApiError {
    ApiError::new(err.status(), &err.body_text())
}

// A body that was cut off by the size limit surfaces as a write failure.
// Report it the way the multipart extractor would.
fn upload_error(err: FileError) -> ApiError {
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        if let Some(multipart_err) = cause.downcast_ref::<MultipartError>() {
            return ApiError::new(multipart_err.status(), &multipart_err.body_text());
        }
        source = cause.source();
    }
    err.into()
}

/// List all files
#[utoipa::path(
    get,
    path = "/files",
    tag = "filevault",
    responses(
        (status = 200, description = "All stored files", body = [FileInfo]),
        (status = UNAUTHORIZED, description = "Missing or wrong API key"),
    ),
)]
async fn list_files(State(state): State<RouteState>) -> Json<Vec<FileInfo>> {
    let files = state.file_manager.list().await;
    Json(files.into_iter().map(FileInfo::from).collect())
}

/// Download a file
#[utoipa::path(
    get,
    path = "/files/{id}",
    tag = "filevault",
    params(("id" = String, Path, description = "File id")),
    responses(
        (status = 200, description = "File contents"),
        (status = NOT_FOUND, description = "No such file"),
        (status = INTERNAL_SERVER_ERROR, description = "File contents are unavailable"),
    ),
)]
async fn download_file(
    Path(id): Path<String>,
    State(state): State<RouteState>,
) -> Result<Response<Body>, ApiError> {
    let (record, stream) = state.file_manager.download(&FileId::from(id)).await?;
    state.metrics.downloads.add(1, &[]);

    Response::builder()
        .header(header::CONTENT_TYPE, record.content_type.as_str())
        .header(header::CONTENT_LENGTH, record.size.to_string())
        .header(header::CONTENT_DISPOSITION, content_disposition(&record))
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::internal_error(e.into()))
}

fn content_disposition(record: &FileRecord) -> String {
    let name: String = record
        .original_name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() || c == ' ') && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("inline; filename=\"{}\"", name)
}

/// Delete a file
#[utoipa::path(
    delete,
    path = "/delete/{id}",
    tag = "filevault",
    params(("id" = String, Path, description = "File id")),
    responses(
        (status = 200, description = "File deleted", body = DeleteResponse),
        (status = NOT_FOUND, description = "No such file"),
        (status = UNAUTHORIZED, description = "Missing or wrong API key"),
    ),
)]
async fn delete_file(
    Path(id): Path<String>,
    State(state): State<RouteState>,
) -> Result<Json<DeleteResponse>, ApiError> {
    state.file_manager.delete(&FileId::from(id)).await?;
    state.metrics.deletes.add(1, &[]);
    Ok(Json(DeleteResponse::deleted()))
}

/// Rename a file
#[utoipa::path(
    put,
    path = "/update/{id}",
    tag = "filevault",
    params(("id" = String, Path, description = "File id")),
    request_body = RenameFile,
    responses(
        (status = 200, description = "Updated file", body = FileInfo),
        (status = BAD_REQUEST, description = "Invalid body or empty name"),
        (status = NOT_FOUND, description = "No such file"),
        (status = UNAUTHORIZED, description = "Missing or wrong API key"),
    ),
)]
async fn rename_file(
    Path(id): Path<String>,
    State(state): State<RouteState>,
    body: axum::body::Bytes,
) -> Result<Json<FileInfo>, ApiError> {
    let request: RenameFile = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(&format!("invalid request body: {}", e)))?;
    let record = state
        .file_manager
        .rename(&FileId::from(id), &request.name)
        .await?;
    state.metrics.renames.add(1, &[]);
    Ok(Json(record.into()))
}
