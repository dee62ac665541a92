//! 连接管理器：每个连接一个任务，加载凭证、打开传输并把生命周期与事件写入存储
//!
//! 单个连接的状态机：
//!
//! ```text
//! idle -> connecting -> open | error
//! open -> error | (disconnect)
//! error -> open      (传输自行恢复后)
//! ```

use crate::descriptor::ConnectionDescriptor;
use crate::endpoint::build_stream_url;
use crate::error::HubError;
use crate::event::StreamEvent;
use crate::identity::IdentityProvider;
use crate::store::{ConnectionState, ConnectionStatus, EventStore};
use crate::transport::{Transport, TransportEvent};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// 传输错误没有描述时使用的消息
pub const GENERIC_TRANSPORT_ERROR: &str = "connection error";

type OpenCallback = Arc<dyn Fn(&str) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&HubError) + Send + Sync>;
type EventCallback = Arc<dyn Fn(&Arc<StreamEvent>) + Send + Sync>;

/// 宿主的生命周期回调
#[derive(Clone, Default)]
pub struct ConnectionCallbacks {
    on_open: Option<OpenCallback>,
    on_error: Option<ErrorCallback>,
    on_event: Option<EventCallback>,
}

impl fmt::Debug for ConnectionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCallbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_event", &self.on_event.is_some())
            .finish()
    }
}

impl ConnectionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 连接打开时调用，参数为连接 id
    pub fn on_open(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    /// 凭证或传输出错时调用
    pub fn on_error(mut self, f: impl Fn(&HubError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// 每条写入存储的事件都会调用
    pub fn on_event(mut self, f: impl Fn(&Arc<StreamEvent>) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Arc::new(f));
        self
    }

    fn open(&self, id: &str) {
        if let Some(f) = &self.on_open {
            f(id);
        }
    }

    fn error(&self, err: &HubError) {
        if let Some(f) = &self.on_error {
            f(err);
        }
    }

    fn event(&self, event: &Arc<StreamEvent>) {
        if let Some(f) = &self.on_event {
            f(event);
        }
    }
}

/// 连接任务写存储的闸门
///
/// `close` 返回后任务不会再写存储：写入在锁内检查取消状态。
#[derive(Clone)]
struct WriteGate {
    cancel: CancellationToken,
    lock: Arc<Mutex<()>>,
}

impl WriteGate {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn run<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancel.is_cancelled() {
            return None;
        }
        Some(f())
    }

    fn close(&self) {
        self.cancel.cancel();
        // 等待进行中的写入完成
        drop(self.lock.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

struct ConnectionHandle {
    generation: u64,
    gate: WriteGate,
}

type HandleMap = Arc<Mutex<HashMap<String, ConnectionHandle>>>;

/// 连接管理器
///
/// 存储的唯一写入者。`connect`/`disconnect` 可以在任意线程调用，
/// 但必须处于 tokio 运行时内才会真正建立连接。
///
/// 存储监听器在写入线程上同步执行。监听器里可以调用 `is_connected`、
/// `connection_ids` 等只读方法；`disconnect` 会等待连接任务的写入完成，
/// 不要在监听器中同步调用，需要时请 spawn 一个任务。
pub struct ConnectionManager {
    store: Arc<EventStore>,
    identity: Arc<IdentityProvider>,
    transport: Option<Arc<dyn Transport>>,
    callbacks: ConnectionCallbacks,
    handles: HandleMap,
    next_generation: AtomicU64,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("has_transport", &self.transport.is_some())
            .field("connections", &self.connection_ids())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// `transport` 为 None 时所有连接请求都被静默跳过
    pub fn new(
        store: Arc<EventStore>,
        identity: Arc<IdentityProvider>,
        transport: Option<Arc<dyn Transport>>,
    ) -> Self {
        Self {
            store,
            identity,
            transport,
            callbacks: ConnectionCallbacks::default(),
            handles: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// 设置宿主回调
    pub fn with_callbacks(mut self, callbacks: ConnectionCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// 建立连接；同一 id 已有连接时什么也不做
    pub fn connect(&self, descriptor: &ConnectionDescriptor) {
        let Some(transport) = self.transport.clone() else {
            debug!(id = %descriptor.id, "No transport available, skipping connect");
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(id = %descriptor.id, "No async runtime, skipping connect");
            return;
        };

        let mut handles = self.lock_handles();
        if handles.contains_key(&descriptor.id) {
            debug!(id = %descriptor.id, "Connection already registered");
            return;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let gate = WriteGate::new();
        handles.insert(
            descriptor.id.clone(),
            ConnectionHandle {
                generation,
                gate: gate.clone(),
            },
        );
        drop(handles);

        // 并发的 disconnect 已关闭闸门时不会写回被删除的状态
        let recorded = gate.run(|| {
            self.store.set_connection_state(ConnectionState::new(
                descriptor.id.clone(),
                descriptor.url.clone(),
                ConnectionStatus::Connecting,
            ))
        });
        if recorded.is_none() {
            debug!(id = %descriptor.id, "Disconnected before connecting");
            return;
        }

        info!(id = %descriptor.id, url = %descriptor.url, "Connecting");
        let task = ConnectionTask {
            descriptor: descriptor.clone(),
            store: self.store.clone(),
            identity: self.identity.clone(),
            transport,
            callbacks: self.callbacks.clone(),
            gate,
            handles: self.handles.clone(),
            generation,
        };
        runtime.spawn(task.run());
    }

    /// 断开连接并删除其状态；可重复调用
    ///
    /// 正在加载凭证的连接会被取消，之后到达的凭证不会再打开传输。
    pub fn disconnect(&self, id: &str) {
        let handle = self.lock_handles().remove(id);
        if let Some(handle) = handle {
            handle.gate.close();
            info!(id = %id, "Disconnected");
        }
        self.store.remove_connection_state(id);
    }

    /// 关闭所有连接，不逐个更新连接状态
    pub fn disconnect_all(&self) {
        let drained: Vec<ConnectionHandle> = self.lock_handles().drain().map(|(_, h)| h).collect();
        let count = drained.len();
        for handle in drained {
            handle.gate.close();
        }
        info!(count = count, "Disconnected all connections");
    }

    /// `id` 是否有活动的连接任务
    pub fn is_connected(&self, id: &str) -> bool {
        self.lock_handles().contains_key(id)
    }

    /// 所有活动连接的 id
    pub fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_handles().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConnectionHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

/// 单个连接的任务
struct ConnectionTask {
    descriptor: ConnectionDescriptor,
    store: Arc<EventStore>,
    identity: Arc<IdentityProvider>,
    transport: Arc<dyn Transport>,
    callbacks: ConnectionCallbacks,
    gate: WriteGate,
    handles: HandleMap,
    generation: u64,
}

impl ConnectionTask {
    async fn run(self) {
        self.pump().await;
        self.release();
    }

    async fn pump(&self) {
        let id = self.descriptor.id.as_str();

        let loaded = tokio::select! {
            biased;
            _ = self.gate.cancel.cancelled() => {
                debug!(id = %id, "Cancelled while loading credential");
                return;
            }
            loaded = self.descriptor.credential_loader.load() => loaded,
        };
        let credential = match loaded {
            Ok(credential) => credential,
            Err(e) => {
                warn!(id = %id, error = %e, "Failed to load credential");
                let message = format!("failed to load credential: {e}");
                if self.set_status(ConnectionStatus::Error, Some(message)) {
                    self.callbacks.error(&HubError::Credential {
                        id: id.to_string(),
                        source: e,
                    });
                }
                return;
            }
        };

        let url = build_stream_url(
            &self.descriptor.url,
            &self.identity.get(),
            &self.descriptor.credential_query_key,
            &credential,
        );
        let opened = self.gate.run(|| {
            self.store.update_connection_state(id, |state| state.url = url.clone());
        });
        if opened.is_none() {
            return;
        }

        debug!(id = %id, "Opening transport");
        let mut stream = self.transport.open(&url);
        let names = self.descriptor.effective_event_names();

        loop {
            let item = tokio::select! {
                biased;
                _ = self.gate.cancel.cancelled() => break,
                item = stream.next() => item,
            };

            match item {
                Some(TransportEvent::Open) => {
                    info!(id = %id, "Connection open");
                    if self.set_status(ConnectionStatus::Open, None) {
                        self.callbacks.open(id);
                    }
                }
                Some(TransportEvent::Error(message)) => {
                    let message = if message.is_empty() {
                        GENERIC_TRANSPORT_ERROR.to_string()
                    } else {
                        message
                    };
                    warn!(id = %id, error = %message, "Connection error");
                    if self.set_status(ConnectionStatus::Error, Some(message.clone())) {
                        self.callbacks.error(&HubError::Transport {
                            id: id.to_string(),
                            message,
                        });
                    }
                }
                Some(TransportEvent::Message(sse)) => {
                    if !names.iter().any(|name| name == sse.event_name()) {
                        trace!(id = %id, event = %sse.event_name(), "Ignoring unlistened event");
                        continue;
                    }
                    let event = StreamEvent::from_sse(id, sse).with_client_identity(self.identity.get());
                    let Some(event) = self.gate.run(|| self.store.append_event(event)) else {
                        break;
                    };
                    debug!(id = %id, event = %event.event_type, "Event received");
                    self.callbacks.event(&event);
                }
                None => {
                    info!(id = %id, "Transport stream ended");
                    self.gate.run(|| {
                        self.store.update_connection_state(id, |state| {
                            if state.status != ConnectionStatus::Error {
                                state.status = ConnectionStatus::Closed;
                            }
                        });
                    });
                    break;
                }
            }
        }
    }

    /// 更新状态；连接已被断开时返回 false
    fn set_status(&self, status: ConnectionStatus, error: Option<String>) -> bool {
        self.gate
            .run(|| {
                self.store.update_connection_state(&self.descriptor.id, |state| {
                    state.status = status;
                    state.error = error;
                })
            })
            .unwrap_or(false)
    }

    // 任务结束后释放自己的句柄，使同一 id 可以重新连接
    fn release(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if handles
            .get(&self.descriptor.id)
            .is_some_and(|h| h.generation == self.generation)
        {
            handles.remove(&self.descriptor.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::StaticCredential;
    use crate::error::CredentialError;
    use crate::event::SseEvent;
    use crate::transport::TransportStream;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};

    /// 由测试驱动的传输：每次 open 记录 URL 并交出一个发送端
    #[derive(Default)]
    struct ScriptedTransport {
        opened: Mutex<Vec<String>>,
        senders: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    }

    impl ScriptedTransport {
        fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }

        fn send(&self, index: usize, event: TransportEvent) {
            self.senders.lock().unwrap()[index].send(event).unwrap();
        }

        fn close(&self, index: usize) {
            let mut senders = self.senders.lock().unwrap();
            let (tx, _) = mpsc::unbounded_channel();
            senders[index] = tx;
        }
    }

    impl Transport for ScriptedTransport {
        fn open(&self, url: &str) -> TransportStream {
            let (tx, mut rx) = mpsc::unbounded_channel();
            self.opened.lock().unwrap().push(url.to_string());
            self.senders.lock().unwrap().push(tx);
            Box::pin(async_stream::stream! {
                while let Some(event) = rx.recv().await {
                    yield event;
                }
            })
        }
    }

    fn setup() -> (Arc<EventStore>, Arc<ScriptedTransport>, ConnectionManager) {
        let store = Arc::new(EventStore::default());
        let transport = Arc::new(ScriptedTransport::default());
        let manager = ConnectionManager::new(
            store.clone(),
            Arc::new(IdentityProvider::in_memory()),
            Some(transport.clone() as Arc<dyn Transport>),
        );
        (store, transport, manager)
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn status(store: &EventStore, id: &str) -> Option<ConnectionStatus> {
        store.connection_state(id).map(|s| s.status)
    }

    #[tokio::test]
    async fn test_connect_open_and_receive() {
        let (store, transport, manager) = setup();
        let opens = Arc::new(AtomicUsize::new(0));
        let counter = opens.clone();
        let manager = manager.with_callbacks(ConnectionCallbacks::new().on_open(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let descriptor = ConnectionDescriptor::new("a", "https://x/sse", StaticCredential("T1".into()));
        manager.connect(&descriptor);
        assert_eq!(status(&store, "a"), Some(ConnectionStatus::Connecting));

        wait_for(|| transport.opened().len() == 1).await;
        let opened = &transport.opened()[0];
        assert!(opened.starts_with("https://x/sse?uid="));
        assert!(opened.ends_with("&authToken=T1"));

        transport.send(0, TransportEvent::Open);
        wait_for(|| status(&store, "a") == Some(ConnectionStatus::Open)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(store.connection_state("a").unwrap().url, *opened);

        transport.send(0, TransportEvent::Message(SseEvent::new(r#"{"x":1}"#)));
        wait_for(|| store.events().len() == 1).await;
        let event = store.events()[0].clone();
        assert_eq!(event.parsed.as_ref().unwrap()["x"], 1);
        assert!(event.client_identity.is_some());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (_store, transport, manager) = setup();
        let descriptor = ConnectionDescriptor::new("a", "https://x/sse", StaticCredential("T".into()));
        manager.connect(&descriptor);
        manager.connect(&descriptor);

        wait_for(|| transport.opened().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.opened().len(), 1);
    }

    #[tokio::test]
    async fn test_credential_failure_sets_error_without_opening() {
        let (store, transport, manager) = setup();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let manager = manager.with_callbacks(ConnectionCallbacks::new().on_error(move |e| {
            sink.lock().unwrap().push(e.to_string());
        }));

        let descriptor = ConnectionDescriptor::new("a", "https://x/sse", || async {
            Err::<String, _>(CredentialError::msg("token service down"))
        });
        manager.connect(&descriptor);

        wait_for(|| status(&store, "a") == Some(ConnectionStatus::Error)).await;
        let state = store.connection_state("a").unwrap();
        assert!(state.error.unwrap().contains("token service down"));
        assert!(transport.opened().is_empty());
        assert_eq!(errors.lock().unwrap().len(), 1);

        wait_for(|| !manager.is_connected("a")).await;
    }

    #[tokio::test]
    async fn test_transport_error_uses_fallback_message() {
        let (store, transport, manager) = setup();
        manager.connect(&ConnectionDescriptor::new("a", "https://x/sse", StaticCredential("T".into())));
        wait_for(|| transport.opened().len() == 1).await;

        transport.send(0, TransportEvent::Error(String::new()));
        wait_for(|| status(&store, "a") == Some(ConnectionStatus::Error)).await;
        assert_eq!(store.connection_state("a").unwrap().error.as_deref(), Some(GENERIC_TRANSPORT_ERROR));

        // 传输自行恢复后再次收到事件
        transport.send(0, TransportEvent::Message(SseEvent::new("back")));
        wait_for(|| status(&store, "a") == Some(ConnectionStatus::Open)).await;
    }

    #[tokio::test]
    async fn test_only_listened_event_names_are_stored() {
        let (store, transport, manager) = setup();
        let descriptor = ConnectionDescriptor::new("a", "https://x/sse", StaticCredential("T".into()))
            .event_names(["update"]);
        manager.connect(&descriptor);
        wait_for(|| transport.opened().len() == 1).await;

        transport.send(0, TransportEvent::Message(SseEvent::new("plain")));
        transport.send(0, TransportEvent::Message(SseEvent::new("u").with_event("update")));
        wait_for(|| store.events().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "update");
    }

    #[tokio::test]
    async fn test_stream_end_marks_closed() {
        let (store, transport, manager) = setup();
        manager.connect(&ConnectionDescriptor::new("a", "https://x/sse", StaticCredential("T".into())));
        wait_for(|| transport.opened().len() == 1).await;
        transport.send(0, TransportEvent::Open);
        wait_for(|| status(&store, "a") == Some(ConnectionStatus::Open)).await;

        transport.close(0);
        wait_for(|| status(&store, "a") == Some(ConnectionStatus::Closed)).await;
        wait_for(|| !manager.is_connected("a")).await;
    }

    #[tokio::test]
    async fn test_disconnect_removes_state() {
        let (store, transport, manager) = setup();
        manager.connect(&ConnectionDescriptor::new("a", "https://x/sse", StaticCredential("T".into())));
        wait_for(|| transport.opened().len() == 1).await;
        transport.send(0, TransportEvent::Open);
        wait_for(|| status(&store, "a") == Some(ConnectionStatus::Open)).await;

        manager.disconnect("a");
        assert!(store.connection_state("a").is_none());
        assert!(!manager.is_connected("a"));

        // 断开后传输上的事件不再写入
        let _ = transport.senders.lock().unwrap()[0].send(TransportEvent::Message(SseEvent::new("late")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.events().is_empty());

        manager.disconnect("a");
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_credential() {
        let (store, transport, manager) = setup();
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        let descriptor = ConnectionDescriptor::new("a", "https://x/sse", move || {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok::<_, CredentialError>("late".to_string())
            }
        });

        manager.connect(&descriptor);
        manager.disconnect("a");
        release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(transport.opened().is_empty());
        assert!(store.connection_state("a").is_none());
    }

    #[tokio::test]
    async fn test_disconnect_all_keeps_state() {
        let (store, transport, manager) = setup();
        for id in ["a", "b"] {
            manager.connect(&ConnectionDescriptor::new(id, "https://x/sse", StaticCredential("T".into())));
        }
        wait_for(|| transport.opened().len() == 2).await;

        manager.disconnect_all();
        assert!(manager.connection_ids().is_empty());
        assert_eq!(store.connections().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listener_can_query_manager_during_connect_and_disconnect() {
        let (store, _transport, manager) = setup();
        let manager = Arc::new(manager);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&manager);
        let sink = seen.clone();
        let _sub = store.subscribe(move || {
            if let Some(manager) = weak.upgrade() {
                sink.lock().unwrap().push(manager.is_connected("a"));
            }
        });

        let descriptor = ConnectionDescriptor::new("a", "https://x/sse", move || async {
            futures_util::future::pending::<Result<String, CredentialError>>().await
        });
        let worker = manager.clone();
        let done = tokio::time::timeout(
            Duration::from_secs(3),
            tokio::task::spawn_blocking(move || {
                worker.connect(&descriptor);
                worker.disconnect("a");
            }),
        )
        .await;

        assert!(done.is_ok(), "connect/disconnect blocked on a listener");
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
        assert!(store.connection_state("a").is_none());
    }

    #[test]
    fn test_connect_without_runtime_is_noop() {
        let (store, _transport, manager) = setup();
        manager.connect(&ConnectionDescriptor::new("a", "https://x/sse", StaticCredential("T".into())));
        assert!(store.connection_state("a").is_none());
        assert!(!manager.is_connected("a"));
    }

    #[tokio::test]
    async fn test_connect_without_transport_is_noop() {
        let store = Arc::new(EventStore::default());
        let manager = ConnectionManager::new(store.clone(), Arc::new(IdentityProvider::in_memory()), None);
        manager.connect(&ConnectionDescriptor::new("a", "https://x/sse", StaticCredential("T".into())));
        assert!(store.connection_state("a").is_none());
    }
}
