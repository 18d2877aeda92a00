/// netrc 文件读取
///
/// 词法解析交给 `netrc` crate，这里只负责按主机查找条目
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, warn};

use super::Credentials;
use crate::error::{ProxyError, Result};

/// 单个 machine 条目
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetrcEntry {
    pub login: String,
    pub password: String,
    pub account: Option<String>,
}

impl From<::netrc::Machine> for NetrcEntry {
    fn from(machine: ::netrc::Machine) -> Self {
        Self {
            login: machine.login,
            password: machine.password.unwrap_or_default(),
            account: machine.account,
        }
    }
}

/// 解析后的 netrc 文件
#[derive(Debug, Clone, Default)]
pub struct Netrc {
    machines: Vec<(String, NetrcEntry)>,
    default: Option<NetrcEntry>,
}

impl Netrc {
    /// 解析 netrc 内容
    pub fn parse(content: &str) -> Result<Self> {
        let parsed = ::netrc::Netrc::parse(content.as_bytes())
            .map_err(|e| ProxyError::Credentials(format!("Invalid netrc content: {:?}", e)))?;

        Ok(Self::from_parsed(parsed))
    }

    fn from_parsed(parsed: ::netrc::Netrc) -> Self {
        Self {
            machines: parsed
                .hosts
                .into_iter()
                .map(|(host, machine)| (host, machine.into()))
                .collect(),
            default: parsed.default.map(Into::into),
        }
    }

    /// 从文件读取；文件不存在或无法解析时返回 None
    pub fn from_file(path: &Path) -> Option<Self> {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) => {
                debug!("Cannot read netrc file {:?}: {}", path, e);
                return None;
            }
        };

        match ::netrc::Netrc::parse(BufReader::new(file)) {
            Ok(parsed) => Some(Self::from_parsed(parsed)),
            Err(e) => {
                warn!("Ignoring malformed netrc file {:?}: {:?}", path, e);
                None
            }
        }
    }

    /// 查找主机对应的条目，第一个匹配的 machine 优先，没有时使用 default
    pub fn machine(&self, host: &str) -> Option<&NetrcEntry> {
        self.machines
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(host))
            .map(|(_, entry)| entry)
            .or(self.default.as_ref())
    }

    /// 查找主机对应的凭据
    pub fn credentials_for(&self, host: &str) -> Option<Credentials> {
        self.machine(host)
            .filter(|entry| !entry.login.is_empty())
            .map(|entry| Credentials::new(&entry.login, &entry.password))
    }
}
