//! 应用级入口：持有一个存储、一个标识提供者和一个连接管理器

use crate::descriptor::ConnectionDescriptor;
use crate::identity::IdentityProvider;
use crate::manager::{ConnectionCallbacks, ConnectionManager};
use crate::query::Query;
use crate::store::{ConnectionState, ConnectionStatus, EventStore, DEFAULT_MAX_EVENTS};
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Hub 配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// 事件日志容量
    pub max_events: usize,
    /// 为 false 时不建立任何连接
    pub enabled: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
            enabled: true,
        }
    }
}

impl HubConfig {
    pub fn max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// 构造 [`SseHub`]
pub struct SseHubBuilder {
    config: HubConfig,
    identity: Option<IdentityProvider>,
    transport: Option<Arc<dyn Transport>>,
    callbacks: ConnectionCallbacks,
}

impl SseHubBuilder {
    pub fn new() -> Self {
        Self {
            config: HubConfig::default(),
            identity: None,
            transport: None,
            callbacks: ConnectionCallbacks::default(),
        }
    }

    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    pub fn identity(mut self, identity: IdentityProvider) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn callbacks(mut self, callbacks: ConnectionCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// 未指定传输时（启用了 `client` 特性）使用 HTTP 传输
    pub fn build(self) -> SseHub {
        let store = Arc::new(EventStore::new(self.config.max_events));
        let identity = Arc::new(self.identity.unwrap_or_default());

        let transport = if self.config.enabled {
            self.transport.or_else(default_transport)
        } else {
            info!("SSE hub disabled, connections will be skipped");
            None
        };

        let manager = ConnectionManager::new(store.clone(), identity.clone(), transport)
            .with_callbacks(self.callbacks);

        SseHub {
            config: self.config,
            store,
            identity,
            manager,
            registry: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for SseHubBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "client")]
fn default_transport() -> Option<Arc<dyn Transport>> {
    Some(Arc::new(crate::transport::HttpTransport::new()))
}

#[cfg(not(feature = "client"))]
fn default_transport() -> Option<Arc<dyn Transport>> {
    None
}

/// 多个 SSE 连接共享的事件中心
///
/// drop 时关闭所有连接。
pub struct SseHub {
    config: HubConfig,
    store: Arc<EventStore>,
    identity: Arc<IdentityProvider>,
    manager: ConnectionManager,
    registry: Mutex<HashMap<String, ConnectionDescriptor>>,
}

impl std::fmt::Debug for SseHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseHub")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl SseHub {
    pub fn builder() -> SseHubBuilder {
        SseHubBuilder::new()
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn identity(&self) -> &Arc<IdentityProvider> {
        &self.identity
    }

    /// 创建一个新的查询句柄，挂载时刻为当前时间
    pub fn query(&self) -> Query {
        Query::new(self.store.clone())
    }

    /// 注册连接；`auto_connect` 的连接立即开始连接
    ///
    /// 尚未连接的连接以 idle 状态出现在存储中。已注册的 id 被忽略。
    pub fn register(&self, descriptors: impl IntoIterator<Item = ConnectionDescriptor>) {
        for descriptor in descriptors {
            let is_new = {
                let mut registry = self.lock_registry();
                if registry.contains_key(&descriptor.id) {
                    false
                } else {
                    registry.insert(descriptor.id.clone(), descriptor.clone());
                    true
                }
            };
            if !is_new {
                debug!(id = %descriptor.id, "Connection already registered");
                continue;
            }

            if self.store.connection_state(&descriptor.id).is_none() {
                self.store.set_connection_state(ConnectionState::new(
                    descriptor.id.clone(),
                    descriptor.url.clone(),
                    ConnectionStatus::Idle,
                ));
            }
            if descriptor.auto_connect && self.config.enabled {
                self.manager.connect(&descriptor);
            }
        }
    }

    /// 已注册的连接描述
    pub fn descriptor(&self, id: &str) -> Option<ConnectionDescriptor> {
        self.lock_registry().get(id).cloned()
    }

    /// 连接一个已注册的连接；未注册时返回 false
    pub fn connect(&self, id: &str) -> bool {
        let Some(descriptor) = self.descriptor(id) else {
            debug!(id = %id, "Connect requested for unknown connection");
            return false;
        };
        if self.config.enabled {
            self.manager.connect(&descriptor);
        }
        true
    }

    /// 直接连接一个描述（不加入注册表）
    pub fn connect_with(&self, descriptor: &ConnectionDescriptor) {
        if self.config.enabled {
            self.manager.connect(descriptor);
        }
    }

    pub fn disconnect(&self, id: &str) {
        self.manager.disconnect(id);
    }

    /// 关闭所有连接并清空存储
    pub fn shutdown(&self) {
        self.manager.disconnect_all();
        self.store.clear();
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.manager.is_connected(id)
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConnectionDescriptor>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
