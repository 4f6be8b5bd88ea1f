use super::StateStore;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

/// A lock file older than this is left over from a crashed writer.
const STALE_LOCK_AGE: Duration = Duration::from_secs(10);
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(2);
const LOCK_TIMEOUT: Duration = Duration::from_secs(15);

/// On-disk layout of one namespace.
#[derive(Debug, Default, Serialize, Deserialize)]
struct NamespaceFile {
    namespace: String,
    entries: BTreeMap<String, Value>,
}

/// Store that keeps each namespace in `<root>/<namespace>.json`.
///
/// The files are the only copy: reads load the file, and every mutation
/// re-reads it under `<namespace>.lock` before writing it back. Any number of
/// stores (in one process or several) opened on the same directory see each
/// other's writes. Writes go to a temp file and are renamed into place, so a
/// reader never sees a half-written snapshot.
pub struct FileStore {
    root: PathBuf,
}

/// Held while a namespace file is read, modified and written back.
struct NamespaceLock {
    path: PathBuf,
}

impl NamespaceLock {
    fn acquire(path: PathBuf) -> Result<Self> {
        let started = SystemTime::now();
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let age = fs::metadata(&path)
                        .and_then(|meta| meta.modified())
                        .ok()
                        .and_then(|modified| modified.elapsed().ok());
                    if age.is_some_and(|age| age > STALE_LOCK_AGE) {
                        tracing::warn!("Breaking stale lock {}", path.display());
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed().unwrap_or_default() > LOCK_TIMEOUT {
                        anyhow::bail!("timed out waiting for lock {}", path.display());
                    }
                    thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to create lock {}", path.display()));
                }
            }
        }
    }
}

impl Drop for NamespaceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

impl FileStore {
    /// Opens (or creates) a store rooted at `root`, validating any existing namespaces.
    pub fn open(root: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state dir: {}", root.display()))?;

        for entry in fs::read_dir(&root)
            .with_context(|| format!("failed to list state dir: {}", root.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            let file = read_file(&path)?;
            tracing::debug!(
                "Found namespace '{}' ({} entries) in {}",
                file.namespace,
                file.entries.len(),
                path.display()
            );
        }

        Ok(Arc::new(Self { root }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, namespace: &str) -> PathBuf {
        let file_name: String = namespace
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{}.json", file_name))
    }

    fn load(&self, namespace: &str) -> Result<BTreeMap<String, Value>> {
        let path = self.file_path(namespace);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        Ok(read_file(&path)?.entries)
    }

    /// Read-modify-write of one namespace under its lock file. `apply`
    /// returns whether the file needs rewriting, plus the caller's result.
    fn update<T>(
        &self,
        namespace: &str,
        apply: impl FnOnce(&mut BTreeMap<String, Value>) -> (bool, T),
    ) -> Result<T> {
        let path = self.file_path(namespace);
        let _lock = NamespaceLock::acquire(path.with_extension("lock"))?;

        let mut entries = self.load(namespace)?;
        let (changed, result) = apply(&mut entries);
        if changed {
            write_file(
                &path,
                &NamespaceFile {
                    namespace: namespace.to_string(),
                    entries,
                },
            )?;
        }
        Ok(result)
    }
}

fn read_file(path: &Path) -> Result<NamespaceFile> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(NamespaceFile::default()),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn write_file(path: &Path, file: &NamespaceFile) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(file)?;

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes)
        .with_context(|| format!("failed to write temp file: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "failed to rename {} to {}",
            tmp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}

impl StateStore for FileStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.load(namespace)?.remove(key))
    }

    fn put(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        self.update(namespace, |entries| {
            entries.insert(key.to_string(), value);
            (true, ())
        })
    }

    fn insert_if_absent(&self, namespace: &str, key: &str, value: Value) -> Result<bool> {
        self.update(namespace, |entries| {
            if entries.contains_key(key) {
                (false, false)
            } else {
                entries.insert(key.to_string(), value);
                (true, true)
            }
        })
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        self.update(namespace, |entries| {
            let removed = entries.remove(key);
            (removed.is_some(), removed)
        })
    }

    fn clear(&self, namespace: &str) -> Result<()> {
        if !self.store_exists(namespace) {
            return Ok(());
        }
        self.update(namespace, |entries| {
            entries.clear();
            (true, ())
        })
    }

    fn is_empty(&self, namespace: &str) -> Result<bool> {
        Ok(self.load(namespace)?.is_empty())
    }

    fn store_exists(&self, namespace: &str) -> bool {
        self.file_path(namespace).exists()
    }
}
