//! 基于 reqwest 的 SSE 客户端

use crate::error::SseError;
use crate::event::SseEvent;
use crate::parser::SseParser;
use async_stream::try_stream;
use futures_core::Stream;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING, CONTENT_TYPE};
use reqwest::Url;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// 重试配置：基础间隔 + 最大次数（None 表示无限重试）
///
/// 仅在连接正常结束后重连；请求失败或流读取出错会终止整个流。
#[derive(Debug, Clone)]
pub struct SseRetry {
    /// 初始重试延迟
    pub base_delay: Duration,
    /// 最大重试次数（None 表示无限重试）
    pub max_retries: Option<usize>,
    /// 是否启用指数退避
    pub exponential_backoff: bool,
    /// 指数退避的乘数因子
    pub backoff_factor: f64,
    /// 最大重试间隔
    pub max_delay: Duration,
}

impl Default for SseRetry {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_retries: None,
            exponential_backoff: false,
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl SseRetry {
    /// 不重连：连接结束即结束流
    pub fn never() -> Self {
        Self {
            max_retries: Some(0),
            ..Default::default()
        }
    }

    /// 创建带指数退避的重试配置
    pub fn with_exponential_backoff(base_delay: Duration) -> Self {
        Self {
            base_delay,
            exponential_backoff: true,
            ..Default::default()
        }
    }

    /// 设置最大重试次数
    pub fn max_retries(mut self, max: usize) -> Self {
        self.max_retries = Some(max);
        self
    }

    /// 设置最大重试间隔
    pub fn max_delay(mut self, max: Duration) -> Self {
        self.max_delay = max;
        self
    }

    fn next_delay(&self, current: Duration) -> Duration {
        if !self.exponential_backoff {
            return current;
        }
        let scaled = Duration::from_secs_f64(current.as_secs_f64() * self.backoff_factor);
        scaled.min(self.max_delay)
    }
}

/// 一次 SSE GET 请求
#[derive(Debug, Clone)]
pub struct SseRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub retry: SseRetry,
    /// 初始 Last-Event-ID（重连时会自动更新为最近一次收到的 id）
    pub last_event_id: Option<String>,
    /// 是否主动禁用压缩（避免某些链路下的 buffering 影响流式体验）
    pub accept_identity_encoding: bool,
}

impl SseRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
            retry: SseRetry::default(),
            last_event_id: None,
            accept_identity_encoding: true,
        }
    }

    /// 设置重试配置
    pub fn retry(mut self, retry: SseRetry) -> Self {
        self.retry = retry;
        self
    }

    /// 追加一个请求头
    pub fn header(mut self, name: &'static str, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// 客户端流产出的条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// 连接建立（每次重连成功都会再产出一次）
    Connected,
    /// 一条完整的 SSE 事件
    Event(SseEvent),
}

/// SSE 客户端：基于 reqwest 的 streaming body + SseParser
#[derive(Clone, Debug, Default)]
pub struct SseClient {
    http: reqwest::Client,
}

impl SseClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// 使用已配置好的 reqwest 客户端
    pub fn with_http(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// 返回一个 Stream：先产出 `Connected`，随后不断产出解析后的事件。
    ///
    /// - 自动设置 `Accept: text/event-stream`
    /// - 重连时带上 `Last-Event-ID`
    /// - 事件里的 `retry` 字段会更新下一次重连等待时间
    pub fn stream(&self, req: SseRequest) -> impl Stream<Item = Result<ClientEvent, SseError>> {
        let client = self.http.clone();

        try_stream! {
            let url: Url = req.url.parse().map_err(|e: url::ParseError| {
                error!(url = %req.url, error = %e, "Failed to parse SSE URL");
                SseError::Url(e.to_string())
            })?;
            let mut last_event_id = req.last_event_id.clone();
            let mut retry_delay = req.retry.base_delay;
            let mut retries = 0usize;

            loop {
                let mut headers = req.headers.clone();
                headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
                if req.accept_identity_encoding {
                    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
                }
                if let Some(id) = &last_event_id {
                    let v = HeaderValue::from_str(id).map_err(|_| SseError::InvalidHeaderValue)?;
                    headers.insert("Last-Event-ID", v);
                }

                debug!(url = %url, retry = retries, "Sending SSE request");
                let resp = match client.get(url.clone()).headers(headers).send().await {
                    Ok(resp) => resp,
                    Err(e) => {
                        error!(url = %url, error = %e, retry = retries, "HTTP request failed");
                        Err(e)?
                    }
                };

                let content_type = resp
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                if !content_type
                    .as_deref()
                    .is_some_and(|ct| ct.starts_with("text/event-stream"))
                {
                    error!(url = %url, content_type = ?content_type, "Invalid content-type, expected text/event-stream");
                    Err(SseError::InvalidContentType(content_type))?;
                }

                info!(url = %url, "SSE connection established");
                yield ClientEvent::Connected;

                let mut parser = SseParser::new();
                let mut body = resp.bytes_stream();
                while let Some(next) = body.next().await {
                    let chunk = match next {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            warn!(url = %url, error = %e, "Error reading SSE stream chunk");
                            Err(e)?
                        }
                    };
                    for ev in parser.push(&chunk) {
                        if let Some(id) = &ev.id {
                            last_event_id = (!id.is_empty()).then(|| id.clone());
                        }
                        if let Some(ms) = ev.retry {
                            retry_delay = Duration::from_millis(ms);
                        }
                        yield ClientEvent::Event(ev);
                    }
                }

                retries += 1;
                if req.retry.max_retries.is_some_and(|max| retries > max) {
                    info!(url = %url, retries = retries, "SSE stream ended, retries exhausted");
                    break;
                }

                info!(url = %url, retry = retries, delay_ms = retry_delay.as_millis() as u64, "Connection ended, scheduling reconnect");
                sleep(retry_delay).await;
                retry_delay = req.retry.next_delay(retry_delay);
            }
        }
    }
}
