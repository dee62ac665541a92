//! 事件类型：线上的 SSE 帧与进入事件存储的流事件

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// 没有 `event:` 字段时 SSE 规定的默认事件名
pub const DEFAULT_EVENT_NAME: &str = "message";

/// 一条 SSE 事件（由 field/value 行组成，以空行结束）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    pub retry: Option<u64>,
}

impl SseEvent {
    /// 使用给定的数据创建新的 SSE 事件
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// 设置事件类型
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// 设置事件 ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// 事件名；未指定或为空时为 `"message"`
    pub fn event_name(&self) -> &str {
        match self.event.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => DEFAULT_EVENT_NAME,
        }
    }
}

/// 写入事件日志的流事件
///
/// 构造后不可变，在存储与查询结果之间以 `Arc<StreamEvent>` 共享。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    /// 产生该事件的连接 id
    pub connection_id: String,
    /// 事件名
    pub event_type: String,
    /// 原始载荷，始终保留
    pub raw: String,
    /// 尽力而为的 JSON 解析结果；解析失败时为 None
    pub parsed: Option<serde_json::Value>,
    /// 服务端给出的事件 id
    pub source_event_id: Option<String>,
    /// 接收时间（Unix 毫秒）
    pub timestamp_ms: u64,
    /// 接收方的客户端标识
    pub client_identity: Option<String>,
}

impl StreamEvent {
    /// 以当前时间创建事件，并尝试把载荷解析为 JSON
    pub fn new(
        connection_id: impl Into<String>,
        event_type: impl Into<String>,
        raw: impl Into<String>,
    ) -> Self {
        let raw = raw.into();
        Self {
            connection_id: connection_id.into(),
            event_type: event_type.into(),
            parsed: parse_payload(&raw),
            raw,
            source_event_id: None,
            timestamp_ms: now_ms(),
            client_identity: None,
        }
    }

    /// 从一条 SSE 帧构造
    pub fn from_sse(connection_id: impl Into<String>, sse: SseEvent) -> Self {
        let event_type = sse.event_name().to_string();
        Self::new(connection_id, event_type, sse.data).with_source_event_id(sse.id)
    }

    pub fn with_source_event_id(mut self, id: Option<String>) -> Self {
        self.source_event_id = id.filter(|id| !id.is_empty());
        self
    }

    /// 设置客户端标识；空字符串视为缺失
    pub fn with_client_identity(mut self, identity: impl Into<String>) -> Self {
        let identity = identity.into();
        self.client_identity = (!identity.is_empty()).then_some(identity);
        self
    }

    /// 覆盖时间戳
    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }
}

/// 尽力而为地解析 JSON；失败不是错误
fn parse_payload(raw: &str) -> Option<serde_json::Value> {
    serde_json::from_str(raw).ok()
}

/// 当前 Unix 时间（毫秒）
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
