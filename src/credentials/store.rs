/// 凭据存储
///
/// 条目按应用标签分组，以 URL 为键
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::Credentials;
use crate::error::{ProxyError, Result};

/// Get/save/delete contract of a credential store.
pub trait CredentialStore: Send + Sync {
    /// Look up the credentials saved for `url` under `label`.
    fn get(&self, label: &str, url: &str) -> Result<Option<Credentials>>;

    fn save(&self, label: &str, url: &str, login: &str, secret: &str) -> Result<()>;

    /// Remove an entry. Removing a missing entry is not an error.
    fn delete(&self, label: &str, url: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
struct StoredSecret {
    login: String,
    secret: String,
}

type Entries = BTreeMap<String, BTreeMap<String, StoredSecret>>;

/// In-process store, for embedding and tests.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<Entries>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, label: &str, url: &str) -> Result<Option<Credentials>> {
        Ok(lookup(&self.entries.read(), label, url))
    }

    fn save(&self, label: &str, url: &str, login: &str, secret: &str) -> Result<()> {
        insert(&mut self.entries.write(), label, url, login, secret);
        Ok(())
    }

    fn delete(&self, label: &str, url: &str) -> Result<()> {
        remove(&mut self.entries.write(), label, url);
        Ok(())
    }
}

/// TOML-file backed store:
///
/// ```toml
/// [simple-proxy."http://upstream:8080"]
/// login = "alice"
/// secret = "secret"
/// ```
pub struct FileCredentialStore {
    path: PathBuf,
    // 串行化读-改-写
    lock: RwLock<()>,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Result<Entries> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Entries::new()),
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&content).map_err(|e| {
            ProxyError::Credentials(format!("Failed to parse {:?}: {}", self.path, e))
        })
    }

    fn write_entries(&self, entries: &Entries) -> Result<()> {
        let content = toml::to_string_pretty(entries).map_err(|e| {
            ProxyError::Credentials(format!("Failed to serialize credentials: {}", e))
        })?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_private(&self.path, &content)?;
        debug!("Credential store {:?} updated", self.path);
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, label: &str, url: &str) -> Result<Option<Credentials>> {
        let _guard = self.lock.read();
        Ok(lookup(&self.read_entries()?, label, url))
    }

    fn save(&self, label: &str, url: &str, login: &str, secret: &str) -> Result<()> {
        let _guard = self.lock.write();
        let mut entries = self.read_entries()?;
        insert(&mut entries, label, url, login, secret);
        self.write_entries(&entries)
    }

    fn delete(&self, label: &str, url: &str) -> Result<()> {
        let _guard = self.lock.write();
        let mut entries = self.read_entries()?;
        if remove(&mut entries, label, url) {
            self.write_entries(&entries)?;
        }
        Ok(())
    }
}

fn lookup(entries: &Entries, label: &str, url: &str) -> Option<Credentials> {
    entries
        .get(label)
        .and_then(|urls| urls.get(url))
        .map(|s| Credentials::new(&s.login, &s.secret))
}

fn insert(entries: &mut Entries, label: &str, url: &str, login: &str, secret: &str) {
    entries.entry(label.to_string()).or_default().insert(
        url.to_string(),
        StoredSecret {
            login: login.to_string(),
            secret: secret.to_string(),
        },
    );
}

fn remove(entries: &mut Entries, label: &str, url: &str) -> bool {
    let Some(urls) = entries.get_mut(label) else {
        return false;
    };
    let removed = urls.remove(url).is_some();
    if urls.is_empty() {
        entries.remove(label);
    }
    removed
}

/// 以 0600 权限创建文件后再写入内容
#[cfg(unix)]
fn write_private(path: &Path, content: &str) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode 只作用于新建文件，已有文件在写入前收紧
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content)?;
    Ok(())
}
