//! 连接描述与凭证加载

use crate::endpoint::DEFAULT_CREDENTIAL_QUERY_KEY;
use crate::error::CredentialError;
use crate::event::DEFAULT_EVENT_NAME;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// 凭证加载的返回值
pub type CredentialFuture<'a> = Pin<Box<dyn Future<Output = Result<String, CredentialError>> + Send + 'a>>;

/// 在每次连接时异步获取访问凭证
pub trait CredentialLoader: Send + Sync {
    fn load(&self) -> CredentialFuture<'_>;
}

impl<F, Fut> CredentialLoader for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, CredentialError>> + Send + 'static,
{
    fn load(&self) -> CredentialFuture<'_> {
        Box::pin((self)())
    }
}

/// 固定不变的凭证
#[derive(Debug, Clone)]
pub struct StaticCredential(pub String);

impl CredentialLoader for StaticCredential {
    fn load(&self) -> CredentialFuture<'_> {
        let token = self.0.clone();
        Box::pin(async move { Ok(token) })
    }
}

/// 一个 SSE 连接的描述；注册后不可变
#[derive(Clone)]
pub struct ConnectionDescriptor {
    /// 唯一 id
    pub id: String,
    /// 基础 URL（标识与凭证会追加为查询参数）
    pub url: String,
    pub credential_loader: Arc<dyn CredentialLoader>,
    /// 凭证查询参数名，默认 `authToken`
    pub credential_query_key: String,
    /// 注册时是否立即连接，默认 true
    pub auto_connect: bool,
    /// 需要监听的事件名；为空时等同于 `["message"]`
    pub event_names: Vec<String>,
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("credential_query_key", &self.credential_query_key)
            .field("auto_connect", &self.auto_connect)
            .field("event_names", &self.event_names)
            .finish_non_exhaustive()
    }
}

impl ConnectionDescriptor {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        credential_loader: impl CredentialLoader + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            credential_loader: Arc::new(credential_loader),
            credential_query_key: DEFAULT_CREDENTIAL_QUERY_KEY.to_string(),
            auto_connect: true,
            event_names: Vec::new(),
        }
    }

    /// 设置凭证查询参数名
    pub fn credential_query_key(mut self, key: impl Into<String>) -> Self {
        self.credential_query_key = key.into();
        self
    }

    /// 设置注册时是否自动连接
    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// 设置监听的事件名；显式列表完全替换默认的 `message`
    pub fn event_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// 实际生效的事件名列表
    pub fn effective_event_names(&self) -> Vec<String> {
        if self.event_names.is_empty() {
            vec![DEFAULT_EVENT_NAME.to_string()]
        } else {
            self.event_names.clone()
        }
    }
}
