use common::error::GitRepickError;
use common::utils::debug_log;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

/// One cached exchange. The query is stored verbatim so a hash collision or
/// a stale hashing scheme can never hand back the wrong answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub query: String,
    pub answer: String,
    pub model_id: String,
}

/// Disk-backed prompt→response cache shared across processes.
///
/// Readers are lock-free and tolerate the file being racily replaced;
/// writers serialize on an advisory lock held over a sidecar file and
/// replace the cache atomically (write temp, rename). Entries are only ever
/// added; invalidation is deletion of the file.
pub struct PromptCache {
    path: PathBuf,
}

impl PromptCache {
    pub fn new(path: PathBuf) -> Self {
        PromptCache { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte-exact fingerprint of a prompt for one model. No normalization:
    /// a single changed byte is a different entry.
    pub fn fingerprint(model_id: &str, prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model_id.as_bytes());
        hasher.update(prompt.as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Look up a verbatim response for this model and prompt.
    pub fn lookup(&self, model_id: &str, prompt: &str) -> Option<String> {
        let entries = self.read_entries().ok()?;
        let key = Self::fingerprint(model_id, prompt);
        let entry = entries.get(&key)?;
        // Belt and braces: the stored query must match byte for byte.
        if entry.query != prompt || entry.model_id != model_id {
            return None;
        }
        if entry.answer.is_empty() {
            return None;
        }
        debug_log(&format!("LLM cache hit for {}", &key[..12]));
        Some(entry.answer.clone())
    }

    /// Insert an exchange. Concurrent writers from other processes serialize
    /// on the lock; their entries are merged by re-reading under it.
    pub fn store(&self, model_id: &str, prompt: &str, answer: &str) -> Result<(), GitRepickError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_path = self.path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        lock_file.lock_exclusive()?;

        let result = self.store_locked(model_id, prompt, answer);
        let _ = FileExt::unlock(&lock_file);
        result
    }

    fn store_locked(
        &self,
        model_id: &str,
        prompt: &str,
        answer: &str,
    ) -> Result<(), GitRepickError> {
        let mut entries = self.read_entries().unwrap_or_default();
        let key = Self::fingerprint(model_id, prompt);
        entries.insert(
            key,
            CacheEntry {
                query: prompt.to_string(),
                answer: answer.to_string(),
                model_id: model_id.to_string(),
            },
        );

        let serialized = serde_json::to_string_pretty(&entries)?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, serialized)?;
        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read_entries().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_entries(&self) -> Result<BTreeMap<String, CacheEntry>, GitRepickError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_byte_exact() {
        let a = PromptCache::fingerprint("model", "prompt");
        assert_eq!(a, PromptCache::fingerprint("model", "prompt"));
        assert_ne!(a, PromptCache::fingerprint("model", "prompt "));
        assert_ne!(a, PromptCache::fingerprint("model2", "prompt"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_store_then_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PromptCache::new(dir.path().join("cache.json"));
        assert!(cache.lookup("m", "q").is_none());

        cache.store("m", "q", "the answer").unwrap();
        assert_eq!(cache.lookup("m", "q").as_deref(), Some("the answer"));
        assert!(cache.lookup("other-model", "q").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_store_appends() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PromptCache::new(dir.path().join("cache.json"));
        cache.store("m", "one", "1").unwrap();
        cache.store("m", "two", "2").unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup("m", "one").as_deref(), Some("1"));
        assert_eq!(cache.lookup("m", "two").as_deref(), Some("2"));
    }

    #[test]
    fn test_corrupt_cache_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "not json at all").unwrap();
        let cache = PromptCache::new(path);
        assert!(cache.lookup("m", "q").is_none());
        // A write straightens the file out again.
        cache.store("m", "q", "a").unwrap();
        assert_eq!(cache.lookup("m", "q").as_deref(), Some("a"));
    }

    #[test]
    fn test_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        PromptCache::new(path.clone()).store("m", "q", "a").unwrap();
        assert_eq!(PromptCache::new(path).lookup("m", "q").as_deref(), Some("a"));
    }
}
