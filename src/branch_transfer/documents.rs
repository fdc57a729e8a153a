//! Supporting document storage
//!
//! Uploads are only stored after the request they belong to has passed
//! validation. Viewing a document means handing out a URL.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::error::{BranchTransferError, ValidationError};
use super::types::{DocumentId, DocumentUpload, UserId};

/// Largest accepted document
pub const MAX_DOCUMENT_BYTES: usize = 10 * 1024 * 1024;

const DEFAULT_FILE_NAME: &str = "document";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub file_name: String,
    pub content_type: String,
    pub size: usize,
    pub uploaded_by: UserId,
    pub uploaded_at: DateTime<Utc>,
}

impl DocumentMeta {
    fn from_upload(upload: &DocumentUpload, uploaded_by: UserId) -> Self {
        Self {
            file_name: upload
                .file_name
                .as_deref()
                .map(sanitize_file_name)
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string()),
            content_type: upload
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            size: upload.bytes.len(),
            uploaded_by,
            uploaded_at: Utc::now(),
        }
    }
}

/// Keep the last path component, restricted to a safe character set
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    base.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect()
}

fn check_upload(upload: &DocumentUpload) -> Result<(), BranchTransferError> {
    if upload.bytes.is_empty() {
        return Err(ValidationError::MissingDocument.into());
    }
    if upload.bytes.len() > MAX_DOCUMENT_BYTES {
        return Err(ValidationError::DocumentTooLarge {
            max: MAX_DOCUMENT_BYTES,
        }
        .into());
    }
    Ok(())
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn save(
        &self,
        upload: DocumentUpload,
        uploaded_by: UserId,
    ) -> Result<DocumentId, BranchTransferError>;

    async fn metadata(
        &self,
        document_id: DocumentId,
    ) -> Result<Option<DocumentMeta>, BranchTransferError>;

    /// Delete a document; unknown ids are not an error
    async fn remove(&self, document_id: DocumentId) -> Result<(), BranchTransferError>;

    /// URL the client can open to view the document
    fn url_for(&self, document_id: DocumentId, meta: &DocumentMeta) -> String;

    async fn exists(&self, document_id: DocumentId) -> Result<bool, BranchTransferError> {
        Ok(self.metadata(document_id).await?.is_some())
    }

    async fn view_url(&self, document_id: DocumentId) -> Result<Option<String>, BranchTransferError> {
        Ok(self
            .metadata(document_id)
            .await?
            .map(|meta| self.url_for(document_id, &meta)))
    }
}

fn public_url(base: &str, document_id: DocumentId, meta: &DocumentMeta) -> String {
    format!(
        "{}/{}/{}",
        base.trim_end_matches('/'),
        document_id,
        meta.file_name
    )
}

// ============================================================================
// Local filesystem
// ============================================================================

/// Stores `<id>.bin` plus an `<id>.json` metadata sidecar under one directory
pub struct LocalDocumentStore {
    dir: PathBuf,
    public_base_url: String,
}

impl LocalDocumentStore {
    pub async fn open(
        dir: impl AsRef<Path>,
        public_base_url: impl Into<String>,
    ) -> Result<Self, BranchTransferError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            BranchTransferError::SystemError(format!(
                "Failed to create document dir {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            dir,
            public_base_url: public_base_url.into(),
        })
    }

    fn content_path(&self, document_id: DocumentId) -> PathBuf {
        self.dir.join(format!("{}.bin", document_id))
    }

    fn meta_path(&self, document_id: DocumentId) -> PathBuf {
        self.dir.join(format!("{}.json", document_id))
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> BranchTransferError {
    BranchTransferError::SystemError(format!("Failed to {} {}: {}", action, path.display(), e))
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn save(
        &self,
        upload: DocumentUpload,
        uploaded_by: UserId,
    ) -> Result<DocumentId, BranchTransferError> {
        check_upload(&upload)?;

        let document_id = DocumentId::new();
        let meta = DocumentMeta::from_upload(&upload, uploaded_by);

        let content_path = self.content_path(document_id);
        tokio::fs::write(&content_path, &upload.bytes)
            .await
            .map_err(|e| io_error("write", &content_path, e))?;

        // Sidecar last: a document exists once its metadata does
        let meta_path = self.meta_path(document_id);
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| BranchTransferError::SystemError(e.to_string()))?;
        tokio::fs::write(&meta_path, json)
            .await
            .map_err(|e| io_error("write", &meta_path, e))?;

        tracing::info!(
            document_id = %document_id,
            size = meta.size,
            uploaded_by,
            "Supporting document stored"
        );
        Ok(document_id)
    }

    async fn metadata(
        &self,
        document_id: DocumentId,
    ) -> Result<Option<DocumentMeta>, BranchTransferError> {
        let meta_path = self.meta_path(document_id);
        let bytes = match tokio::fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("read", &meta_path, e)),
        };
        let meta = serde_json::from_slice(&bytes).map_err(|e| {
            BranchTransferError::SystemError(format!(
                "Corrupt document metadata {}: {}",
                meta_path.display(),
                e
            ))
        })?;
        Ok(Some(meta))
    }

    async fn remove(&self, document_id: DocumentId) -> Result<(), BranchTransferError> {
        // Sidecar first, mirroring save: the document is gone once it is
        for path in [self.meta_path(document_id), self.content_path(document_id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("remove", &path, e)),
            }
        }
        tracing::info!(document_id = %document_id, "Supporting document removed");
        Ok(())
    }

    fn url_for(&self, document_id: DocumentId, meta: &DocumentMeta) -> String {
        public_url(&self.public_base_url, document_id, meta)
    }
}

// ============================================================================
// In-memory
// ============================================================================

pub struct MemoryDocumentStore {
    documents: DashMap<DocumentId, (DocumentMeta, Vec<u8>)>,
    public_base_url: String,
}

impl MemoryDocumentStore {
    pub fn new(public_base_url: impl Into<String>) -> Self {
        Self {
            documents: DashMap::new(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn content(&self, document_id: DocumentId) -> Option<Vec<u8>> {
        self.documents
            .get(&document_id)
            .map(|entry| entry.value().1.clone())
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new("/files")
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn save(
        &self,
        upload: DocumentUpload,
        uploaded_by: UserId,
    ) -> Result<DocumentId, BranchTransferError> {
        check_upload(&upload)?;
        let document_id = DocumentId::new();
        let meta = DocumentMeta::from_upload(&upload, uploaded_by);
        self.documents.insert(document_id, (meta, upload.bytes));
        Ok(document_id)
    }

    async fn metadata(
        &self,
        document_id: DocumentId,
    ) -> Result<Option<DocumentMeta>, BranchTransferError> {
        Ok(self
            .documents
            .get(&document_id)
            .map(|entry| entry.value().0.clone()))
    }

    async fn remove(&self, document_id: DocumentId) -> Result<(), BranchTransferError> {
        self.documents.remove(&document_id);
        Ok(())
    }

    fn url_for(&self, document_id: DocumentId, meta: &DocumentMeta) -> String {
        public_url(&self.public_base_url, document_id, meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(name: &str, bytes: &[u8]) -> DocumentUpload {
        DocumentUpload {
            file_name: Some(name.to_string()),
            content_type: Some("image/png".to_string()),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\docs\\birth cert.png"), "birthcert.png");
        assert_eq!(sanitize_file_name("report-01_v2.pdf"), "report-01_v2.pdf");
    }

    #[tokio::test]
    async fn test_local_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDocumentStore::open(dir.path(), "https://files.example.com/docs/")
            .await
            .unwrap();

        let id = store.save(upload("cert.png", b"\x89PNG"), 7).await.unwrap();
        assert!(store.exists(id).await.unwrap());

        let meta = store.metadata(id).await.unwrap().unwrap();
        assert_eq!(meta.size, 4);
        assert_eq!(meta.uploaded_by, 7);
        assert_eq!(
            store.view_url(id).await.unwrap().unwrap(),
            format!("https://files.example.com/docs/{}/cert.png", id)
        );

        let content = tokio::fs::read(dir.path().join(format!("{}.bin", id)))
            .await
            .unwrap();
        assert_eq!(content, b"\x89PNG");
    }

    #[tokio::test]
    async fn test_local_remove_deletes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDocumentStore::open(dir.path(), "/files").await.unwrap();
        let id = store.save(upload("cert.png", b"\x89PNG"), 7).await.unwrap();

        store.remove(id).await.unwrap();
        assert!(!store.exists(id).await.unwrap());
        assert!(!dir.path().join(format!("{}.bin", id)).exists());

        // Already gone
        store.remove(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDocumentStore::open(dir.path(), "/files").await.unwrap();
        let id = DocumentId::new();
        assert!(!store.exists(id).await.unwrap());
        assert!(store.view_url(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_upload_rejected() {
        let store = MemoryDocumentStore::default();
        let err = store.save(upload("a.png", b""), 7).await.unwrap_err();
        assert_eq!(err.code(), "MISSING_DOCUMENT");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_defaults_file_name() {
        let store = MemoryDocumentStore::new("/files");
        let id = store
            .save(
                DocumentUpload {
                    file_name: None,
                    content_type: None,
                    bytes: vec![1, 2, 3],
                },
                9,
            )
            .await
            .unwrap();
        let meta = store.metadata(id).await.unwrap().unwrap();
        assert_eq!(meta.file_name, "document");
        assert_eq!(meta.content_type, "application/octet-stream");
        assert_eq!(store.content(id), Some(vec![1, 2, 3]));
    }
}
