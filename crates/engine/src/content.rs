// CMS content store: the store of record for page content.
//
// Sessions are a working copy over this store. A fresh session is seeded
// from `load_document_content`; dirty sessions are flushed back through
// `save_document_content` before the janitor reclaims them.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

const MAX_DOCUMENT_ID_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ContentStoreError {
    #[error("document `{0}` does not exist")]
    NotFound(String),
    #[error("invalid document id `{0}`")]
    InvalidDocumentId(String),
    #[error("content store is unavailable: {0}")]
    Unavailable(String),
    #[error("content store I/O failed")]
    Io(#[from] std::io::Error),
    #[error("stored content is not valid JSON")]
    Malformed(#[from] serde_json::Error),
}

pub trait ContentStore: Send + Sync {
    fn load_document_content(&self, document_id: &str) -> Result<Value, ContentStoreError>;

    fn save_document_content(
        &self,
        document_id: &str,
        content: &Value,
    ) -> Result<(), ContentStoreError>;
}

/// Document ids become file names, so only a conservative character set is
/// accepted.
pub fn validate_document_id(document_id: &str) -> Result<(), ContentStoreError> {
    let valid = !document_id.is_empty()
        && document_id.len() <= MAX_DOCUMENT_ID_LEN
        && document_id != "."
        && document_id != ".."
        && document_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ':'));

    if valid {
        Ok(())
    } else {
        Err(ContentStoreError::InvalidDocumentId(document_id.to_owned()))
    }
}

/// One `<document_id>.json` file per document under `root`.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, document_id: &str) -> Result<PathBuf, ContentStoreError> {
        validate_document_id(document_id)?;
        Ok(self.root.join(format!("{document_id}.json")))
    }

    fn temp_path_for(&self, document_id: &str) -> PathBuf {
        self.root.join(format!(".{document_id}.json.{}.tmp", Uuid::new_v4().simple()))
    }
}

impl ContentStore for FsContentStore {
    fn load_document_content(&self, document_id: &str) -> Result<Value, ContentStoreError> {
        let path = self.document_path(document_id)?;
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContentStoreError::NotFound(document_id.to_owned()));
            }
            Err(error) => return Err(error.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    fn save_document_content(
        &self,
        document_id: &str,
        content: &Value,
    ) -> Result<(), ContentStoreError> {
        let path = self.document_path(document_id)?;
        fs::create_dir_all(&self.root)?;

        // Write-then-rename so readers never observe a half-written file. The
        // temp name is unique per save; several processes may flush the same
        // document.
        let tmp_path = self.temp_path_for(document_id);
        let written = write_json_file(&tmp_path, content).and_then(|()| {
            fs::rename(&tmp_path, &path)?;
            Ok(())
        });
        if written.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        written
    }
}

fn write_json_file(path: &Path, content: &Value) -> Result<(), ContentStoreError> {
    let mut file = fs::File::create(path)?;
    serde_json::to_writer_pretty(&mut file, content)?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    Ok(())
}

/// In-process content store for tests and local development.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    documents: RwLock<HashMap<String, Value>>,
    unavailable: AtomicBool,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(self, document_id: impl Into<String>, content: Value) -> Self {
        self.insert(document_id, content);
        self
    }

    pub fn insert(&self, document_id: impl Into<String>, content: Value) {
        self.documents
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(document_id.into(), content);
    }

    pub fn get(&self, document_id: &str) -> Option<Value> {
        self.documents
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(document_id)
            .cloned()
    }

    /// Simulate an outage: every load and save fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), ContentStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ContentStoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

impl ContentStore for MemoryContentStore {
    fn load_document_content(&self, document_id: &str) -> Result<Value, ContentStoreError> {
        self.ensure_available()?;
        self.get(document_id).ok_or_else(|| ContentStoreError::NotFound(document_id.to_owned()))
    }

    fn save_document_content(
        &self,
        document_id: &str,
        content: &Value,
    ) -> Result<(), ContentStoreError> {
        self.ensure_available()?;
        self.insert(document_id, content.clone());
        Ok(())
    }
}
