//! rust-sse-hub: 多路 SSE 连接 + 有界事件存储 + 稳定查询
//!
//! 本库提供:
//! - 增量 SSE 解析器与基于 reqwest 的 SSE 客户端
//! - 连接管理器：按连接加载凭证、拼接 URL、打开传输并把事件写入存储
//! - 有界事件存储：所有连接的事件按到达顺序合并，超出容量时丢弃最旧的
//! - 查询层：依赖不变时返回同一个 `Arc`，便于观察者做廉价的变更检测
//! - 会话级客户端标识
//!
//! # 功能特性
//!
//! - `client` (默认): 基于 reqwest 的 HTTP 传输
//! - `full`: 所有功能
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use rust_sse_hub::{ConnectionDescriptor, SseHub, StaticCredential};
//!
//! # async fn example() {
//! let hub = SseHub::builder().build();
//! hub.register([
//!     ConnectionDescriptor::new("orders", "https://example.com/sse", StaticCredential("token".into()))
//!         .event_names(["order.created", "order.updated"]),
//! ]);
//!
//! let query = hub.query();
//! let mut changes = hub.store().changes();
//! while changes.changed().await.is_ok() {
//!     if let Some(event) = query.latest_since_mount("orders", "order.created") {
//!         println!("新订单: {}", event.raw);
//!     }
//! }
//! # }
//! ```

mod descriptor;
mod endpoint;
mod error;
mod event;
mod hub;
mod identity;
mod manager;
mod parser;
pub mod query;
mod store;
pub mod transport;

#[cfg(feature = "client")]
mod client;

pub use descriptor::{ConnectionDescriptor, CredentialFuture, CredentialLoader, StaticCredential};
pub use endpoint::{build_stream_url, DEFAULT_CREDENTIAL_QUERY_KEY, IDENTITY_QUERY_KEY};
pub use error::{BoxError, CredentialError, HubError, SseError};
pub use event::{now_ms, SseEvent, StreamEvent, DEFAULT_EVENT_NAME};
pub use hub::{HubConfig, SseHub, SseHubBuilder};
pub use identity::{
    FileStorage, IdentityProvider, MemoryStorage, SessionStorage, StorageError, IDENTITY_STORAGE_KEY,
};
pub use manager::{ConnectionCallbacks, ConnectionManager, GENERIC_TRANSPORT_ERROR};
pub use parser::SseParser;
pub use query::{EventFilter, EventPredicate, Memo, Query, Selection};
pub use store::{
    ConnectionMap, ConnectionState, ConnectionStatus, EventLog, EventStore, Subscription,
    DEFAULT_MAX_EVENTS,
};
pub use transport::{Transport, TransportEvent, TransportStream};

#[cfg(feature = "client")]
pub use client::{ClientEvent, SseClient, SseRequest, SseRetry};

#[cfg(feature = "client")]
pub use transport::HttpTransport;
