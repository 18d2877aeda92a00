/// 上游代理认证头注入
///
/// 转发模式下的每个请求都经过 [`AuthInjector`]：替换客户端携带的
/// Proxy-Authorization，并在缺少 User-Agent 时补上默认值
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ::http::header::{PROXY_AUTHORIZATION, USER_AGENT};

use crate::credentials::Credentials;
use crate::http::RequestHead;

/// 生成 Basic 认证头的值：`Basic base64(login:password)`
pub fn basic_auth(login: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", login, password)))
}

/// 请求头改写器，一次构造，整个监听器生命周期内复用
#[derive(Clone, PartialEq, Eq)]
pub struct AuthInjector {
    authorization: Option<String>,
    user_agent: String,
}

impl AuthInjector {
    /// 登录名为空时不注入认证头
    pub fn new(credentials: &Credentials, user_agent: impl Into<String>) -> Self {
        let authorization = (!credentials.is_anonymous())
            .then(|| basic_auth(&credentials.login, &credentials.password));
        Self {
            authorization,
            user_agent: user_agent.into(),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.authorization.is_some()
    }

    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// 改写请求头
    ///
    /// 客户端自带的 Proxy-Authorization 一律移除，有凭据时只保留注入的那一个；
    /// User-Agent 只在缺失时补充
    pub fn apply(&self, head: &mut RequestHead) {
        let proxy_auth = PROXY_AUTHORIZATION.as_str();
        match &self.authorization {
            Some(value) => head.set_header("Proxy-Authorization", value.clone()),
            None => head.remove_header(proxy_auth),
        }

        if !head.has_header(USER_AGENT.as_str()) {
            head.headers
                .push(("User-Agent".to_string(), self.user_agent.clone()));
        }
    }
}

impl std::fmt::Debug for AuthInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthInjector")
            .field("authorization", &self.authorization.as_ref().map(|_| "<redacted>"))
            .field("user_agent", &self.user_agent)
            .finish()
    }
}
