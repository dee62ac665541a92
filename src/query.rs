//! 查询层：对存储快照的只读派生
//!
//! 每个 [`Query`] 相当于一个观察者实例，自带记忆槽：依赖的快照与参数
//! 不变时返回同一个 `Arc`，观察者可以用 `Arc::ptr_eq` 判断是否需要刷新。

use crate::event::{now_ms, StreamEvent};
use crate::store::{ConnectionMap, ConnectionState, EventLog, EventStore};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// 按 `Arc` 指针比较的快照键
pub struct ByPtr<T: ?Sized>(pub Arc<T>);

impl<T: ?Sized> PartialEq for ByPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T: ?Sized> Clone for ByPtr<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// 单槽记忆：依赖键不变时复用上次结果
pub struct Memo<K, T> {
    slot: Mutex<Option<(K, Arc<T>)>>,
}

impl<K, T> Default for Memo<K, T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<K: PartialEq, T> Memo<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 键与上次相同时返回缓存的 `Arc`，否则重新计算
    pub fn get_or_compute(&self, key: K, compute: impl FnOnce() -> T) -> Arc<T> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached_key, value)) = slot.as_ref() {
            if *cached_key == key {
                return value.clone();
            }
        }
        let value = Arc::new(compute());
        *slot = Some((key, value.clone()));
        value
    }
}

/// 一个或多个名字；`Any` 匹配所有
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Any,
    One(String),
    Many(Vec<String>),
}

impl Selection {
    pub fn contains(&self, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::One(one) => one == name,
            Self::Many(many) => many.iter().any(|n| n == name),
        }
    }
}

impl From<&str> for Selection {
    fn from(name: &str) -> Self {
        Self::One(name.to_string())
    }
}

impl From<String> for Selection {
    fn from(name: String) -> Self {
        Self::One(name)
    }
}

impl From<Vec<String>> for Selection {
    fn from(names: Vec<String>) -> Self {
        Self::Many(names)
    }
}

impl From<&[&str]> for Selection {
    fn from(names: &[&str]) -> Self {
        Self::Many(names.iter().map(|n| n.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Selection {
    fn from(names: [&str; N]) -> Self {
        Self::Many(names.iter().map(|n| n.to_string()).collect())
    }
}

/// 事件谓词；按 `Arc` 身份比较，同一个谓词才会命中缓存
#[derive(Clone)]
pub struct EventPredicate(Arc<dyn Fn(&StreamEvent) -> bool + Send + Sync>);

impl EventPredicate {
    pub fn new(f: impl Fn(&StreamEvent) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    fn test(&self, event: &StreamEvent) -> bool {
        (self.0)(event)
    }
}

impl PartialEq for EventPredicate {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for EventPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventPredicate(..)")
    }
}

/// 事件过滤条件，各条件之间为 AND
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub connection_ids: Option<BTreeSet<String>>,
    pub types: Option<BTreeSet<String>>,
    pub predicate: Option<EventPredicate>,
    /// 只保留时间戳 >= 该值的事件（Unix 毫秒）
    pub since_ms: Option<u64>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.connection_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn predicate(mut self, predicate: EventPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn since(mut self, since_ms: u64) -> Self {
        self.since_ms = Some(since_ms);
        self
    }

    /// 依次检查时间、连接、类型、谓词
    pub fn matches(&self, event: &StreamEvent) -> bool {
        if self.since_ms.is_some_and(|since| event.timestamp_ms < since) {
            return false;
        }
        if let Some(ids) = &self.connection_ids {
            if !ids.contains(&event.connection_id) {
                return false;
            }
        }
        if let Some(types) = &self.types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        self.predicate.as_ref().map_or(true, |p| p.test(event))
    }
}

/// 过滤事件，保持原有相对顺序
pub fn filter_events(log: &[Arc<StreamEvent>], filter: &EventFilter) -> Vec<Arc<StreamEvent>> {
    log.iter().filter(|e| filter.matches(e)).cloned().collect()
}

/// 从新到旧查找第一条匹配的事件
pub fn latest_matching(
    log: &[Arc<StreamEvent>],
    ids: &Selection,
    types: &Selection,
) -> Option<Arc<StreamEvent>> {
    log.iter()
        .rev()
        .find(|e| ids.contains(&e.connection_id) && types.contains(&e.event_type))
        .cloned()
}

/// 同 [`latest_matching`]，但遇到早于 `since_ms` 的事件立即停止
///
/// 日志按到达顺序追加，遇到更早的事件后不可能再有更新的匹配。
pub fn latest_matching_since(
    log: &[Arc<StreamEvent>],
    since_ms: u64,
    ids: &Selection,
    types: &Selection,
) -> Option<Arc<StreamEvent>> {
    for event in log.iter().rev() {
        if event.timestamp_ms < since_ms {
            return None;
        }
        if ids.contains(&event.connection_id) && types.contains(&event.event_type) {
            return Some(event.clone());
        }
    }
    None
}

type StatusKey = (ByPtr<HashMap<String, ConnectionState>>, Vec<String>);
type SingleStatusKey = (ByPtr<HashMap<String, ConnectionState>>, String);
type EventsKey = (ByPtr<Vec<Arc<StreamEvent>>>, EventFilter);

/// 观察者级的查询句柄
pub struct Query {
    store: Arc<EventStore>,
    mounted_at_ms: u64,
    status: Memo<SingleStatusKey, ConnectionState>,
    statuses: Memo<StatusKey, HashMap<String, ConnectionState>>,
    events: Memo<EventsKey, Vec<Arc<StreamEvent>>>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("mounted_at_ms", &self.mounted_at_ms)
            .finish_non_exhaustive()
    }
}

impl Query {
    /// 以当前时间作为挂载时刻
    pub fn new(store: Arc<EventStore>) -> Self {
        Self {
            store,
            mounted_at_ms: now_ms(),
            status: Memo::new(),
            statuses: Memo::new(),
            events: Memo::new(),
        }
    }

    /// 挂载时刻（Unix 毫秒）
    pub fn mounted_at(&self) -> u64 {
        self.mounted_at_ms
    }

    /// 单个连接的状态；连接快照不变时返回同一个 `Arc`
    pub fn connection_status(&self, id: &str) -> Option<Arc<ConnectionState>> {
        let all = self.store.connections();
        let state = all.get(id)?;
        Some(self.status.get_or_compute((ByPtr(all.clone()), id.to_string()), || state.clone()))
    }

    /// 全部或指定连接的状态；未知 id 被忽略
    pub fn connection_statuses(&self, ids: Option<&[&str]>) -> ConnectionMap {
        let all = self.store.connections();
        let Some(ids) = ids else {
            return all;
        };

        let wanted: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        self.statuses.get_or_compute((ByPtr(all.clone()), wanted.clone()), || {
            wanted
                .iter()
                .filter_map(|id| all.get(id).map(|state| (id.clone(), state.clone())))
                .collect()
        })
    }

    /// 无过滤时直接返回存储的事件日志；有过滤时返回缓存的过滤结果
    pub fn events(&self, filter: Option<&EventFilter>) -> EventLog {
        let log = self.store.events();
        let Some(filter) = filter else {
            return log;
        };

        self.events
            .get_or_compute((ByPtr(log.clone()), filter.clone()), || filter_events(&log, filter))
    }

    pub fn latest_matching(
        &self,
        ids: impl Into<Selection>,
        types: impl Into<Selection>,
    ) -> Option<Arc<StreamEvent>> {
        latest_matching(&self.store.events(), &ids.into(), &types.into())
    }

    pub fn latest_matching_since(
        &self,
        since_ms: u64,
        ids: impl Into<Selection>,
        types: impl Into<Selection>,
    ) -> Option<Arc<StreamEvent>> {
        latest_matching_since(&self.store.events(), since_ms, &ids.into(), &types.into())
    }

    /// 只看挂载之后到达的事件
    pub fn latest_since_mount(
        &self,
        ids: impl Into<Selection>,
        types: impl Into<Selection>,
    ) -> Option<Arc<StreamEvent>> {
        self.latest_matching_since(self.mounted_at_ms, ids, types)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ConnectionStatus;

    fn ev(conn: &str, ty: &str, raw: &str, ts: u64) -> StreamEvent {
        StreamEvent::new(conn, ty, raw).with_timestamp(ts)
    }

    fn raws(log: &[Arc<StreamEvent>]) -> Vec<&str> {
        log.iter().map(|e| e.raw.as_str()).collect()
    }

    fn seeded() -> Arc<EventStore> {
        let store = Arc::new(EventStore::default());
        store.append_event(ev("a", "message", "1", 100));
        store.append_event(ev("b", "update", "2", 110));
        store.append_event(ev("a", "update", "3", 120));
        store.append_event(ev("b", "message", "4", 130));
        store.append_event(ev("a", "message", "5", 140));
        store
    }

    #[test]
    fn test_unfiltered_events_is_store_log() {
        let store = seeded();
        let query = Query::new(store.clone());
        assert!(Arc::ptr_eq(&query.events(None), &store.events()));
        assert!(Arc::ptr_eq(&query.events(None), &query.events(None)));
    }

    #[test]
    fn test_filters_compose_conjunctively() {
        let query = Query::new(seeded());
        let only_odd = EventPredicate::new(|e| e.raw.parse::<u32>().map_or(false, |n| n % 2 == 1));

        let filter = EventFilter::new().connection_ids(["a"]);
        assert_eq!(raws(&query.events(Some(&filter))), vec!["1", "3", "5"]);

        let filter = EventFilter::new().connection_ids(["a", "b"]).types(["message"]).since(110);
        assert_eq!(raws(&query.events(Some(&filter))), vec!["4", "5"]);

        let filter = EventFilter::new().types(["message"]).predicate(only_odd);
        assert_eq!(raws(&query.events(Some(&filter))), vec!["1", "5"]);
    }

    #[test]
    fn test_filtered_result_is_memoized() {
        let store = seeded();
        let query = Query::new(store.clone());
        let filter = EventFilter::new().types(["update"]);

        let first = query.events(Some(&filter));
        let second = query.events(Some(&filter.clone()));
        assert!(Arc::ptr_eq(&first, &second));

        store.append_event(ev("a", "update", "6", 150));
        let third = query.events(Some(&filter));
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(raws(&third), vec!["2", "3", "6"]);
    }

    #[test]
    fn test_predicate_identity_controls_cache() {
        let query = Query::new(seeded());
        let a = EventFilter::new().predicate(EventPredicate::new(|_| true));
        let b = EventFilter::new().predicate(EventPredicate::new(|_| true));

        let first = query.events(Some(&a));
        assert!(!Arc::ptr_eq(&first, &query.events(Some(&b))));
    }

    #[test]
    fn test_latest_matching() {
        let query = Query::new(seeded());
        assert_eq!(query.latest_matching("a", Selection::Any).unwrap().raw, "5");
        assert_eq!(query.latest_matching("a", "update").unwrap().raw, "3");
        assert_eq!(query.latest_matching(["a", "b"], ["update"]).unwrap().raw, "3");
        assert_eq!(query.latest_matching("b", Selection::Any).unwrap().raw, "4");
        assert!(query.latest_matching("c", Selection::Any).is_none());
    }

    #[test]
    fn test_latest_matching_on_empty_log() {
        let query = Query::new(Arc::new(EventStore::default()));
        assert!(query.latest_matching("a", Selection::Any).is_none());
    }

    #[test]
    fn test_latest_matching_since_never_returns_older() {
        let query = Query::new(seeded());
        assert_eq!(query.latest_matching_since(125, "a", Selection::Any).unwrap().raw, "5");
        // 匹配的 "3" 早于 125，不返回
        assert!(query.latest_matching_since(125, "a", "update").is_none());
        assert!(query.latest_matching_since(200, "a", Selection::Any).is_none());
    }

    #[test]
    fn test_latest_since_mount_ignores_history() {
        let store = seeded();
        let query = Query::new(store.clone());
        assert!(query.latest_since_mount("a", Selection::Any).is_none());

        store.append_event(StreamEvent::new("a", "message", "live"));
        assert_eq!(query.latest_since_mount("a", Selection::Any).unwrap().raw, "live");
    }

    #[test]
    fn test_connection_statuses_subset() {
        let store = seeded();
        store.set_connection_state(ConnectionState::new("c", "u", ConnectionStatus::Connecting));
        let query = Query::new(store.clone());

        assert!(Arc::ptr_eq(&query.connection_statuses(None), &store.connections()));

        let subset = query.connection_statuses(Some(&["a", "c", "missing"][..]));
        assert_eq!(subset.len(), 2);
        assert_eq!(subset["c"].status, ConnectionStatus::Connecting);
        assert!(Arc::ptr_eq(&subset, &query.connection_statuses(Some(&["a", "c", "missing"][..]))));

        assert_eq!(query.connection_status("a").unwrap().status, ConnectionStatus::Open);
        assert!(query.connection_status("missing").is_none());
    }

    #[test]
    fn test_connection_status_is_stable_until_connections_change() {
        let store = seeded();
        let query = Query::new(store.clone());

        let first = query.connection_status("a").unwrap();
        assert!(Arc::ptr_eq(&first, &query.connection_status("a").unwrap()));

        store.set_connection_state(ConnectionState::new("a", "u", ConnectionStatus::Closed));
        let after = query.connection_status("a").unwrap();
        assert!(!Arc::ptr_eq(&first, &after));
        assert_eq!(after.status, ConnectionStatus::Closed);
    }
}
