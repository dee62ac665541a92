//! 会话级客户端标识
//!
//! 标识在首次访问时生成，并写入会话存储（若有），之后在整个会话内保持不变。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, warn};

/// 会话存储中保存标识所用的键
pub const IDENTITY_STORAGE_KEY: &str = "rust_sse_hub.client_id";

/// 会话存储的错误
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("存储 IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("存储序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 会话级键值存储
pub trait SessionStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// 进程内存储
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// 以单个 JSON 对象文件保存的存储
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<HashMap<String, String>, StorageError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl SessionStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value.to_string());
        std::fs::write(&self.path, serde_json::to_vec(&entries)?)?;
        Ok(())
    }
}

/// 客户端标识提供者
pub struct IdentityProvider {
    storage: Option<Arc<dyn SessionStorage>>,
    detached: bool,
    cached: OnceLock<String>,
}

impl std::fmt::Debug for IdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityProvider")
            .field("detached", &self.detached)
            .field("cached", &self.cached.get())
            .finish()
    }
}

impl Default for IdentityProvider {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl IdentityProvider {
    /// 标识持久化到给定的会话存储
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        Self {
            storage: Some(storage),
            detached: false,
            cached: OnceLock::new(),
        }
    }

    /// 无持久化，仅在本实例生命周期内缓存
    pub fn in_memory() -> Self {
        Self {
            storage: None,
            detached: false,
            cached: OnceLock::new(),
        }
    }

    /// 没有会话作用域：`get` 始终返回空字符串
    pub fn detached() -> Self {
        Self {
            storage: None,
            detached: true,
            cached: OnceLock::new(),
        }
    }

    /// 获取当前标识；首次调用时读取或生成
    pub fn get(&self) -> String {
        if self.detached {
            return String::new();
        }
        self.cached.get_or_init(|| self.load_or_generate()).clone()
    }

    /// `candidate` 是否为本客户端的标识
    pub fn is_own(&self, candidate: Option<&str>) -> bool {
        match candidate {
            Some(candidate) if !candidate.is_empty() => candidate == self.get(),
            _ => false,
        }
    }

    fn load_or_generate(&self) -> String {
        if let Some(storage) = &self.storage {
            match storage.get(IDENTITY_STORAGE_KEY) {
                Ok(Some(existing)) if !existing.is_empty() => {
                    debug!(identity = %existing, "Loaded client identity from session storage");
                    return existing;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to read client identity, generating a new one"),
            }
        }

        let identity = generate_identity();
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.set(IDENTITY_STORAGE_KEY, &identity) {
                warn!(error = %e, "Failed to persist client identity, keeping it in memory");
            }
        }
        debug!(identity = %identity, "Generated client identity");
        identity
    }
}

fn generate_identity() -> String {
    identity_from_random(getrandom::getrandom)
}

// 安全随机源可用时生成 UUID v4，否则退回时间戳 + 伪随机
fn identity_from_random(fill: impl FnOnce(&mut [u8]) -> Result<(), getrandom::Error>) -> String {
    let mut bytes = [0u8; 16];
    match fill(&mut bytes) {
        Ok(()) => uuid::Builder::from_random_bytes(bytes).into_uuid().to_string(),
        Err(e) => {
            warn!(error = %e, "Secure random source unavailable, using fallback identity");
            fallback_identity()
        }
    }
}

// 时间戳 + 伪随机
fn fallback_identity() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u128(nanos);
    format!("{:x}-{:016x}", nanos / 1_000_000, hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_stable() {
        let provider = IdentityProvider::in_memory();
        let first = provider.get();
        assert!(!first.is_empty());
        assert_eq!(provider.get(), first);
    }

    #[test]
    fn test_is_own() {
        let provider = IdentityProvider::in_memory();
        let me = provider.get();
        assert!(provider.is_own(Some(&me)));
        assert!(!provider.is_own(Some("someone-else")));
        assert!(!provider.is_own(Some("")));
        assert!(!provider.is_own(None));
    }

    #[test]
    fn test_detached_returns_empty() {
        let provider = IdentityProvider::detached();
        assert_eq!(provider.get(), "");
        assert!(!provider.is_own(Some("")));
    }

    #[test]
    fn test_storage_shares_identity_across_providers() {
        let storage: Arc<dyn SessionStorage> = Arc::new(MemoryStorage::new());
        let a = IdentityProvider::new(storage.clone()).get();
        let b = IdentityProvider::new(storage.clone()).get();
        assert_eq!(a, b);
        assert_eq!(storage.get(IDENTITY_STORAGE_KEY).unwrap(), Some(a));
    }

    #[test]
    fn test_file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let first = IdentityProvider::new(Arc::new(FileStorage::new(&path))).get();
        let second = IdentityProvider::new(Arc::new(FileStorage::new(&path))).get();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unreadable_storage_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, b"not json").unwrap();

        let provider = IdentityProvider::new(Arc::new(FileStorage::new(&path)));
        let id = provider.get();
        assert!(!id.is_empty());
        assert_eq!(provider.get(), id);
    }

    #[test]
    fn test_fallback_identity_is_not_empty() {
        assert!(!fallback_identity().is_empty());
    }

    #[test]
    fn test_random_bytes_become_v4_uuid() {
        let id = identity_from_random(|buf| {
            buf.fill(0xab);
            Ok(())
        });
        let parsed = uuid::Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn test_rng_failure_uses_fallback() {
        let id = identity_from_random(|_| Err(getrandom::Error::UNSUPPORTED));
        assert!(!id.is_empty());
        assert!(uuid::Uuid::parse_str(&id).is_err());
    }
}
