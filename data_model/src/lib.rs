use std::{
    fmt::{self, Display},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

pub mod id_generator;
pub mod test_objects;

pub use id_generator::{IdGenerator, Sha256IdGenerator};

/// Length of a hex encoded file id.
pub const FILE_ID_LEN: usize = 64;

/// Longest original extension carried into a storage key.
const MAX_EXTENSION_LEN: usize = 16;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn get(&self) -> &str {
        &self.0
    }

    /// True when the id has the shape produced by the generators: 64
    /// lowercase hex characters.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == FILE_ID_LEN
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

impl From<&str> for FileId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for FileId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical name of a blob: `<id><ext>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    /// Derives the storage key for an upload from its id and the
    /// extension of the original filename.
    ///
    /// Extensions that are not short ASCII alphanumerics are dropped, so the
    /// key never carries path separators or other surprises from the client.
    pub fn derive(id: &FileId, original_name: &str) -> Self {
        match sanitized_extension(original_name) {
            Some(ext) => Self(format!("{}.{}", id, ext)),
            None => Self(id.to_string()),
        }
    }

    /// Parses a blob name back into a storage key, returning `None` for
    /// names that could not have been produced by [`StorageKey::derive`].
    pub fn parse(name: &str) -> Option<Self> {
        if name.len() < FILE_ID_LEN || !name.is_char_boundary(FILE_ID_LEN) {
            return None;
        }
        let (id, rest) = name.split_at(FILE_ID_LEN);
        if !FileId::from(id).is_well_formed() {
            return None;
        }
        if rest.is_empty() {
            return Some(Self(name.to_string()));
        }
        let ext = rest.strip_prefix('.')?;
        if is_valid_extension(ext) && ext == ext.to_ascii_lowercase() {
            return Some(Self(name.to_string()));
        }
        None
    }

    pub fn get(&self) -> &str {
        &self.0
    }

    /// The id this key was derived from.
    pub fn file_id(&self) -> FileId {
        FileId::from(&self.0[..FILE_ID_LEN.min(self.0.len())])
    }
}

impl Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn is_valid_extension(ext: &str) -> bool {
    !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LEN
        && ext.bytes().all(|b| b.is_ascii_alphanumeric())
}

fn sanitized_extension(original_name: &str) -> Option<String> {
    let ext = Path::new(original_name).extension()?.to_str()?;
    if !is_valid_extension(ext) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Best effort MIME type for a filename.
pub fn guess_content_type(original_name: &str) -> String {
    mime_guess::from_path(original_name)
        .first_raw()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub stored_name: StorageKey,
    pub original_name: String,
    pub size: u64,
    pub content_type: String,
    pub created_at: u64,
}

impl FileRecord {
    pub fn storage_key(&self) -> &StorageKey {
        &self.stored_name
    }
}

#[derive(Debug, Default)]
pub struct FileRecordBuilder {
    id: Option<FileId>,
    original_name: Option<String>,
    size: u64,
    content_type: Option<String>,
    created_at: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
#[error("file record is missing field `{0}`")]
pub struct MissingField(&'static str);

impl FileRecordBuilder {
    pub fn id(mut self, id: FileId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn original_name(mut self, name: impl Into<String>) -> Self {
        self.original_name = Some(name.into());
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn build(self) -> Result<FileRecord, MissingField> {
        let id = self.id.ok_or(MissingField("id"))?;
        let original_name = self.original_name.ok_or(MissingField("original_name"))?;
        let stored_name = StorageKey::derive(&id, &original_name);
        let content_type = self
            .content_type
            .unwrap_or_else(|| guess_content_type(&original_name));
        Ok(FileRecord {
            id,
            stored_name,
            original_name,
            size: self.size,
            content_type,
            created_at: self.created_at.unwrap_or_else(get_epoch_time_in_ms),
        })
    }
}
