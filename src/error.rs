//! rust-sse-hub 统一错误类型

use thiserror::Error;

/// 装箱的通用错误，用于承接宿主提供的凭证加载器等外部实现的失败
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// SSE 客户端操作中可能发生的错误
#[derive(Debug, Error)]
pub enum SseError {
    #[cfg(feature = "client")]
    #[error("HTTP 错误: {0}")]
    Http(#[from] reqwest::Error),

    #[error("无效的 content-type: 期望 text/event-stream, 收到 {0:?}")]
    InvalidContentType(Option<String>),

    #[error("无效的 header 值")]
    InvalidHeaderValue,

    #[error("URL 解析错误: {0}")]
    Url(String),
}

/// 凭证加载失败
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CredentialError(#[source] BoxError);

impl CredentialError {
    /// 用任意错误构造凭证错误
    pub fn new(err: impl Into<BoxError>) -> Self {
        Self(err.into())
    }

    /// 用一条消息构造凭证错误
    pub fn msg(message: impl Into<String>) -> Self {
        Self(message.into().into())
    }
}

/// 连接生命周期中上报给宿主的错误
#[derive(Debug, Error)]
pub enum HubError {
    #[error("连接 {id} 加载凭证失败: {source}")]
    Credential {
        id: String,
        #[source]
        source: CredentialError,
    },

    #[error("连接 {id} 传输错误: {message}")]
    Transport { id: String, message: String },
}

impl HubError {
    /// 出错的连接 id
    pub fn connection_id(&self) -> &str {
        match self {
            Self::Credential { id, .. } | Self::Transport { id, .. } => id,
        }
    }
}
