//! 租户凭证持久化
//!
//! 凭证内容由协议层决定，这里只按租户 ID 读写不透明的字节块。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// 不透明的凭证字节块
pub type AuthBlob = Vec<u8>;

const CREDS_FILE: &str = "creds.json";

#[derive(Error, Debug)]
pub enum AuthStoreError {
    #[error("invalid tenant id for credential storage: {0:?}")]
    InvalidTenantId(String),

    #[error("credential I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// 凭证存储接口
#[async_trait]
pub trait AuthStateStore: Send + Sync {
    async fn load(&self, tenant_id: &str) -> Result<Option<AuthBlob>, AuthStoreError>;

    async fn save(&self, tenant_id: &str, blob: &[u8]) -> Result<(), AuthStoreError>;

    /// 删除租户凭证；不存在时视为成功
    async fn remove(&self, tenant_id: &str) -> Result<(), AuthStoreError>;
}

const MAX_TENANT_ID_LEN: usize = 128;

/// 租户 ID 会拼进凭证路径和 sidecar URL，只允许 `[A-Za-z0-9._-]`，且不能以 `.` 开头
pub fn is_valid_tenant_id(tenant_id: &str) -> bool {
    !tenant_id.is_empty()
        && tenant_id.len() <= MAX_TENANT_ID_LEN
        && !tenant_id.starts_with('.')
        && tenant_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

fn validate_tenant_id(tenant_id: &str) -> Result<(), AuthStoreError> {
    if !is_valid_tenant_id(tenant_id) {
        return Err(AuthStoreError::InvalidTenantId(tenant_id.to_string()));
    }
    Ok(())
}

/// 文件存储：`<root>/<tenant_id>/creds.json`，写入走临时文件 + rename
#[derive(Debug, Clone)]
pub struct FileAuthStore {
    root: PathBuf,
}

impl FileAuthStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn tenant_dir(&self, tenant_id: &str) -> Result<PathBuf, AuthStoreError> {
        validate_tenant_id(tenant_id)?;
        Ok(self.root.join(tenant_id))
    }
}

#[async_trait]
impl AuthStateStore for FileAuthStore {
    async fn load(&self, tenant_id: &str) -> Result<Option<AuthBlob>, AuthStoreError> {
        let path = self.tenant_dir(tenant_id)?.join(CREDS_FILE);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, tenant_id: &str, blob: &[u8]) -> Result<(), AuthStoreError> {
        let dir = self.tenant_dir(tenant_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!("{}.tmp", CREDS_FILE));
        tokio::fs::write(&tmp, blob).await?;
        tokio::fs::rename(&tmp, dir.join(CREDS_FILE)).await?;
        Ok(())
    }

    async fn remove(&self, tenant_id: &str) -> Result<(), AuthStoreError> {
        let dir = self.tenant_dir(tenant_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 内存存储（测试与无持久化部署）
#[derive(Debug, Default)]
pub struct MemoryAuthStore {
    blobs: RwLock<HashMap<String, AuthBlob>>,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, tenant_id: &str) -> bool {
        self.blobs.read().await.contains_key(tenant_id)
    }
}

#[async_trait]
impl AuthStateStore for MemoryAuthStore {
    async fn load(&self, tenant_id: &str) -> Result<Option<AuthBlob>, AuthStoreError> {
        Ok(self.blobs.read().await.get(tenant_id).cloned())
    }

    async fn save(&self, tenant_id: &str, blob: &[u8]) -> Result<(), AuthStoreError> {
        self.blobs
            .write()
            .await
            .insert(tenant_id.to_string(), blob.to_vec());
        Ok(())
    }

    async fn remove(&self, tenant_id: &str) -> Result<(), AuthStoreError> {
        self.blobs.write().await.remove(tenant_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_roundtrip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuthStore::new(dir.path());

        assert!(store.load("42").await.unwrap().is_none());

        store.save("42", br#"{"me":"x"}"#).await.unwrap();
        store.save("42", br#"{"me":"y"}"#).await.unwrap();
        assert_eq!(store.load("42").await.unwrap().unwrap(), br#"{"me":"y"}"#.to_vec());
        assert!(dir.path().join("42").join(CREDS_FILE).exists());

        store.remove("42").await.unwrap();
        assert!(store.load("42").await.unwrap().is_none());
        // 重复删除不报错
        store.remove("42").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_tenant_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuthStore::new(dir.path());
        for bad in ["", "..", ".hidden", "a/b", "a\\b", "../escape", "a b", "a?b", "a#b"] {
            let err = store.save(bad, b"x").await.unwrap_err();
            assert!(matches!(err, AuthStoreError::InvalidTenantId(_)));
        }
    }

    #[test]
    fn test_tenant_id_charset() {
        for good in ["42", "T1", "shop-7", "acme_co.cm"] {
            assert!(is_valid_tenant_id(good), "{good}");
        }
        assert!(!is_valid_tenant_id(&"x".repeat(MAX_TENANT_ID_LEN + 1)));
        assert!(!is_valid_tenant_id("caf\u{e9}"));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryAuthStore::new();
        store.save("t", b"abc").await.unwrap();
        assert!(store.contains("t").await);
        store.remove("t").await.unwrap();
        assert!(!store.contains("t").await);
    }
}
