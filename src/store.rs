//! 事件存储：连接状态 + 有界事件日志 + 订阅通知
//!
//! 所有读取接口返回 `Arc` 快照。没有发生写入时，两次读取得到的是同一个
//! `Arc`（`Arc::ptr_eq` 为真），查询层据此跳过重复计算。快照只读。

use crate::event::StreamEvent;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockWriteGuard, Weak};
use tokio::sync::watch;
use tracing::{debug, trace};

/// 默认的事件日志容量
pub const DEFAULT_MAX_EVENTS: usize = 500;

/// 按到达顺序排列的事件日志快照
pub type EventLog = Arc<Vec<Arc<StreamEvent>>>;

/// 连接 id → 连接状态 的快照
pub type ConnectionMap = Arc<HashMap<String, ConnectionState>>;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Open,
    Closed,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个连接的当前状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionState {
    pub id: String,
    /// 实际使用的 URL（连接成功后包含标识与凭证）
    pub url: String,
    pub status: ConnectionStatus,
    pub last_event: Option<Arc<StreamEvent>>,
    pub error: Option<String>,
}

impl ConnectionState {
    pub fn new(id: impl Into<String>, url: impl Into<String>, status: ConnectionStatus) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            status,
            last_event: None,
            error: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }
}

type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

struct Inner {
    connections: ConnectionMap,
    events: EventLog,
    version: u64,
}

/// 事件存储
///
/// 由应用显式创建并以 `Arc` 共享给连接管理器和查询层。
pub struct EventStore {
    inner: RwLock<Inner>,
    capacity: usize,
    listeners: Arc<Mutex<Listeners>>,
    changes: watch::Sender<u64>,
}

impl fmt::Debug for EventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.read();
        f.debug_struct("EventStore")
            .field("capacity", &self.capacity)
            .field("connections", &inner.connections.len())
            .field("events", &inner.events.len())
            .field("version", &inner.version)
            .finish()
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}

impl EventStore {
    /// 创建容量为 `capacity` 的存储
    pub fn new(capacity: usize) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: RwLock::new(Inner {
                connections: Arc::new(HashMap::new()),
                events: Arc::new(Vec::new()),
                version: 0,
            }),
            capacity,
            listeners: Arc::new(Mutex::new(Listeners::default())),
            changes,
        }
    }

    /// 事件日志容量
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 写入计数；每次写入加一
    pub fn version(&self) -> u64 {
        self.read().version
    }

    pub fn connection_state(&self, id: &str) -> Option<ConnectionState> {
        self.read().connections.get(id).cloned()
    }

    /// 所有连接状态的快照
    pub fn connections(&self) -> ConnectionMap {
        self.read().connections.clone()
    }

    /// 事件日志快照
    pub fn events(&self) -> EventLog {
        self.read().events.clone()
    }

    /// 整体替换 `state.id` 对应的状态
    pub fn set_connection_state(&self, state: ConnectionState) {
        let version = {
            let mut inner = self.write();
            trace!(id = %state.id, status = %state.status, "Set connection state");
            Arc::make_mut(&mut inner.connections).insert(state.id.clone(), state);
            bump(&mut inner)
        };
        self.notify(version);
    }

    /// 仅当 `id` 已存在时原地修改其状态；返回是否修改
    pub fn update_connection_state(&self, id: &str, f: impl FnOnce(&mut ConnectionState)) -> bool {
        let version = {
            let mut inner = self.write();
            if !inner.connections.contains_key(id) {
                return false;
            }
            if let Some(state) = Arc::make_mut(&mut inner.connections).get_mut(id) {
                f(state);
            }
            bump(&mut inner)
        };
        self.notify(version);
        true
    }

    /// 删除 `id` 的状态；不存在时不通知
    pub fn remove_connection_state(&self, id: &str) -> bool {
        let version = {
            let mut inner = self.write();
            if !inner.connections.contains_key(id) {
                return false;
            }
            Arc::make_mut(&mut inner.connections).remove(id);
            bump(&mut inner)
        };
        self.notify(version);
        true
    }

    /// 追加事件，超出容量时丢弃最旧的事件，并把所属连接标记为 open
    pub fn append_event(&self, event: StreamEvent) -> Arc<StreamEvent> {
        let event = Arc::new(event);
        let version = {
            let mut inner = self.write();

            let events = Arc::make_mut(&mut inner.events);
            events.push(event.clone());
            if events.len() > self.capacity {
                let overflow = events.len() - self.capacity;
                events.drain(..overflow);
                trace!(evicted = overflow, "Evicted oldest events");
            }

            let connections = Arc::make_mut(&mut inner.connections);
            let state = connections
                .entry(event.connection_id.clone())
                .or_insert_with(|| {
                    ConnectionState::new(event.connection_id.clone(), "", ConnectionStatus::Open)
                });
            state.status = ConnectionStatus::Open;
            state.last_event = Some(event.clone());

            bump(&mut inner)
        };
        self.notify(version);
        event
    }

    /// 清空事件与连接状态
    pub fn clear(&self) {
        let version = {
            let mut inner = self.write();
            inner.connections = Arc::new(HashMap::new());
            inner.events = Arc::new(Vec::new());
            bump(&mut inner)
        };
        self.notify(version);
    }

    /// 注册一个在每次写入后调用的监听器
    ///
    /// 监听器在写入线程上同步执行（写锁已释放），不保证多个监听器之间的顺序。
    /// 返回的 [`Subscription`] 被 drop 时自动注销。
    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));
        debug!(listener_id = id, listener_count = listeners.entries.len(), "Listener subscribed");

        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// 写入版本的 watch 通道，供异步观察者使用
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// 当前注册的监听器数量
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    fn notify(&self, version: u64) {
        // 并发写入可能乱序到达，只前进不后退
        self.changes.send_if_modified(|current| {
            if version > *current {
                *current = version;
                true
            } else {
                false
            }
        });

        // 复制后再调用，监听器内可以安全地读取存储或再订阅
        let listeners: Vec<Listener> = {
            let guard = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            guard.entries.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in listeners {
            listener();
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn bump(inner: &mut Inner) -> u64 {
    inner.version += 1;
    inner.version
}

/// 监听器注册句柄
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    /// 注销监听器
    pub fn unsubscribe(self) {}
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            let mut listeners = listeners.lock().unwrap_or_else(PoisonError::into_inner);
            listeners.entries.retain(|(id, _)| *id != self.id);
        }
    }
}
