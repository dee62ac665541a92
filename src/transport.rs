//! 流式传输抽象：`open(url)` → 命名文本事件流，或终止性错误

use crate::event::SseEvent;
use futures_core::Stream;
use std::pin::Pin;

/// 传输层产出的生命周期与数据事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// 连接已打开
    Open,
    /// 收到一条 SSE 事件
    Message(SseEvent),
    /// 传输错误，附带可读的错误描述（可能为空）
    Error(String),
}

/// 装箱的传输事件流
pub type TransportStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send + 'static>>;

/// 可以打开 SSE 连接的传输 trait
///
/// 重连策略属于传输自身；流结束表示传输已放弃该连接。
pub trait Transport: Send + Sync {
    /// 打开到 `url` 的连接
    fn open(&self, url: &str) -> TransportStream;
}

#[cfg(feature = "client")]
pub use http::HttpTransport;

#[cfg(feature = "client")]
mod http {
    use super::{Transport, TransportEvent, TransportStream};
    use crate::client::{ClientEvent, SseClient, SseRequest, SseRetry};
    use async_stream::stream;
    use futures_util::StreamExt;
    use tracing::warn;

    /// 基于 [`SseClient`] 的 HTTP 传输
    #[derive(Debug, Clone, Default)]
    pub struct HttpTransport {
        client: SseClient,
        retry: SseRetry,
    }

    impl HttpTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// 使用给定的客户端
        pub fn with_client(client: SseClient) -> Self {
            Self {
                client,
                retry: SseRetry::default(),
            }
        }

        /// 设置重连策略
        pub fn retry(mut self, retry: SseRetry) -> Self {
            self.retry = retry;
            self
        }
    }

    impl Transport for HttpTransport {
        fn open(&self, url: &str) -> TransportStream {
            let client = self.client.clone();
            let request = SseRequest::get(url).retry(self.retry.clone());

            Box::pin(stream! {
                let events = client.stream(request);
                tokio::pin!(events);

                while let Some(item) = events.next().await {
                    match item {
                        Ok(ClientEvent::Connected) => yield TransportEvent::Open,
                        Ok(ClientEvent::Event(ev)) => yield TransportEvent::Message(ev),
                        Err(e) => {
                            warn!(error = %e, "SSE transport failed");
                            yield TransportEvent::Error(e.to_string());
                            break;
                        }
                    }
                }
            })
        }
    }
}
