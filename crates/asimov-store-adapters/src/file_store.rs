use asimov_contract::{ContextStore, ContextStoreError, StoredContext};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// One JSON file per service channel ID under a base directory.
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Create a new file storage with the given base path.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn record_path(&self, key: &str) -> Result<PathBuf, ContextStoreError> {
        Self::validate_key(key)?;
        Ok(self.base_path.join(format!("{key}.json")))
    }

    /// Validate that a key is safe for use as a filename.
    /// Rejects path separators, `..`, and control characters.
    fn validate_key(key: &str) -> Result<(), ContextStoreError> {
        if key.is_empty() {
            return Err(ContextStoreError::InvalidKey(
                "context key cannot be empty".to_string(),
            ));
        }
        if key.contains('/') || key.contains('\\') || key.contains("..") || key.contains('\0') {
            return Err(ContextStoreError::InvalidKey(format!(
                "context key contains invalid characters: {key:?}"
            )));
        }
        if key.chars().any(|c| c.is_control()) {
            return Err(ContextStoreError::InvalidKey(format!(
                "context key contains control characters: {key:?}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ContextStore for FileStore {
    async fn store(&self, key: &str, record: &StoredContext) -> Result<(), ContextStoreError> {
        let path = self.record_path(key)?;
        tokio::fs::create_dir_all(&self.base_path).await?;
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| ContextStoreError::Serialization(e.to_string()))?;
        // Write-then-rename so a crash never leaves a torn record behind.
        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.flush().await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredContext>, ContextStoreError> {
        let path = self.record_path(key)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_slice(&bytes)
            .map_err(|e| ContextStoreError::Serialization(e.to_string()))?;
        Ok(Some(record))
    }

    async fn delete(&self, key: &str) -> Result<(), ContextStoreError> {
        let path = self.record_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
