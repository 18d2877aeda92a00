// 上游代理凭据解析
//
// 顺序：配置中的显式凭据、本机 netrc 文件、可选的凭据存储；都找不到时匿名转发

mod netrc_file;
mod store;

pub use netrc_file::{Netrc, NetrcEntry};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ProxyConfiguration;

/// Login/password pair used for `Proxy-Authorization`.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.login.is_empty()
    }
}

// 不打印密码
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Resolves the credentials for one listener lifetime.
#[derive(Clone, Default)]
pub struct CredentialResolver {
    netrc_path: Option<PathBuf>,
    store: Option<Arc<dyn CredentialStore>>,
}

impl CredentialResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_netrc(mut self, path: impl Into<PathBuf>) -> Self {
        self.netrc_path = Some(path.into());
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the resolver the configuration asks for: its netrc file (or
    /// `~/.netrc`) and, when configured, a file credential store.
    pub fn from_config(config: &ProxyConfiguration) -> Self {
        let mut resolver = Self::new();
        if let Some(path) = config
            .netrc_path
            .clone()
            .or_else(|| crate::config::home_dir().map(|home| home.join(".netrc")))
        {
            resolver = resolver.with_netrc(path);
        }
        if let Some(path) = &config.credential_store {
            resolver = resolver.with_store(Arc::new(FileCredentialStore::new(path)));
        }
        resolver
    }

    /// Resolve the credentials to present to `target_host`.
    pub fn resolve(&self, config: &ProxyConfiguration, target_host: &str) -> Credentials {
        if !config.login.is_empty() {
            return Credentials::new(&config.login, &config.password);
        }

        info!("Empty credentials, looking up {:?} in netrc", target_host);
        if let Some(creds) = self
            .netrc_path
            .as_deref()
            .and_then(Netrc::from_file)
            .and_then(|netrc| netrc.credentials_for(target_host))
        {
            info!("Credentials loaded from netrc for host {:?}", target_host);
            return creds;
        }

        if let Some(store) = &self.store {
            let url = config.target_proxy_url();
            match store.get(&config.credential_label, &url) {
                Ok(Some(creds)) if !creds.is_anonymous() => {
                    info!("Credentials loaded from credential store for {}", url);
                    return creds;
                }
                Ok(_) => {}
                Err(e) => warn!("Credential store lookup for {} failed: {}", url, e),
            }
        }

        info!(
            "No credentials found for {:?}, forwarding unauthenticated",
            target_host
        );
        Credentials::anonymous()
    }
}
