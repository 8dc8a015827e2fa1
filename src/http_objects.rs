use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use data_model::FileRecord;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use utoipa::ToSchema;

use crate::file_manager::FileError;

#[derive(Debug, ToSchema, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }

    #[cfg(test)]
    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!("API Error: {} - {}", self.status_code, self.message);
        } else {
            warn!("API Error: {} - {}", self.status_code, self.message);
        }
        (self.status_code, self.message).into_response()
    }
}

impl From<FileError> for ApiError {
    fn from(e: FileError) -> Self {
        match &e {
            FileError::NotFound(_) => Self::not_found("file not found"),
            FileError::Conflict(_) => Self::new(StatusCode::CONFLICT, &e.to_string()),
            FileError::InvalidName(_) => Self::bad_request(&e.to_string()),
            FileError::Write(_)
            | FileError::Read(_)
            | FileError::ConsistencyViolation { .. }
            | FileError::Interrupted(_) => Self::internal_error(e.into()),
        }
    }
}

/// A stored file as seen by API clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FileInfo {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub content_type: String,
    pub url: String,
    pub created_at: u64,
}

impl From<FileRecord> for FileInfo {
    fn from(record: FileRecord) -> Self {
        Self {
            url: format!("/files/{}", record.id),
            id: record.id.get().to_string(),
            name: record.original_name,
            size: record.size,
            content_type: record.content_type,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RenameFile {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeleteResponse {
    pub status: String,
}

impl DeleteResponse {
    pub fn deleted() -> Self {
        Self {
            status: "deleted".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use data_model::{test_objects::tests::mock_file_record, FileId, StorageKey};

    use super::*;

    #[test]
    fn file_info_json_shape() {
        let record = mock_file_record(1, "report.pdf");
        let json = serde_json::to_value(FileInfo::from(record.clone())).unwrap();
        assert_eq!(json["id"], record.id.get());
        assert_eq!(json["name"], "report.pdf");
        assert_eq!(json["size"], 100);
        assert_eq!(json["type"], "application/pdf");
        assert_eq!(json["url"], format!("/files/{}", record.id));
        assert_eq!(json["created_at"], 1_700_000_000_000u64);
    }

    #[test]
    fn file_errors_map_to_status_codes() {
        let id = FileId::from("abc");
        let cases = [
            (FileError::NotFound(id.clone()), StatusCode::NOT_FOUND),
            (FileError::Conflict(id.clone()), StatusCode::CONFLICT),
            (FileError::InvalidName(" ".to_string()), StatusCode::BAD_REQUEST),
            (
                FileError::ConsistencyViolation {
                    id: id.clone(),
                    key: StorageKey::derive(&id, "a.txt"),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }
}
