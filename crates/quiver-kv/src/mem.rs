//! In-memory `MetaKv` backend with full revision, watch, and lease semantics.

use crate::kv::{KvEvent, KvEventType, LeaseId, MetaKv};
use async_trait::async_trait;
use parking_lot::Mutex;
use quiver_common::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const LEASE_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

struct Lease {
    deadline: Instant,
    ttl: Duration,
    keys: HashSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<KvEvent>,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    revision: i64,
    history: Vec<KvEvent>,
    watchers: Vec<Watcher>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
}

impl State {
    /// Apply puts and removals as one revision and fan the events out.
    fn commit(&mut self, saves: Vec<(String, String, Option<LeaseId>)>, removals: Vec<String>) -> i64 {
        self.revision += 1;
        let revision = self.revision;
        let mut events = Vec::with_capacity(saves.len() + removals.len());

        for (key, value, lease) in saves {
            if let Some(id) = lease {
                if let Some(l) = self.leases.get_mut(&id) {
                    l.keys.insert(key.clone());
                }
            }
            events.push(KvEvent {
                event_type: KvEventType::Put,
                key: key.clone(),
                value: value.clone(),
                revision,
            });
            self.entries.insert(key, Entry { value, lease });
        }

        for key in removals {
            if let Some(entry) = self.entries.remove(&key) {
                events.push(KvEvent {
                    event_type: KvEventType::Delete,
                    key,
                    value: entry.value,
                    revision,
                });
            }
        }

        for event in events {
            self.history.push(event.clone());
            self.watchers
                .retain(|w| !event.key.starts_with(&w.prefix) || w.tx.send(event.clone()).is_ok());
        }
        revision
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            let lease = self.leases.remove(&id).expect("lease present");
            let keys: Vec<String> = lease.keys.into_iter().collect();
            self.commit(Vec::new(), keys);
        }
    }
}

/// In-memory meta store. Clones share state.
pub struct MemoryMetaKv {
    state: Arc<Mutex<State>>,
}

impl MemoryMetaKv {
    pub fn new() -> Arc<Self> {
        let kv = Arc::new(Self { state: Arc::new(Mutex::new(State::default())) });
        let weak: Weak<Mutex<State>> = Arc::downgrade(&kv.state);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(LEASE_SWEEP_INTERVAL).await;
                match weak.upgrade() {
                    Some(state) => state.lock().expire_leases(Instant::now()),
                    None => return,
                }
            }
        });
        kv
    }

    /// Force lease expiry without waiting out the TTL. Test hook.
    pub fn expire_lease_now(&self, lease: LeaseId) {
        let mut state = self.state.lock();
        if let Some(l) = state.leases.get_mut(&lease) {
            l.deadline = Instant::now();
        }
        state.expire_leases(Instant::now());
    }
}

#[async_trait]
impl MetaKv for MemoryMetaKv {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().entries.get(key).map(|e| e.value.clone()))
    }

    async fn load_with_prefix(&self, prefix: &str) -> Result<(Vec<(String, String)>, i64)> {
        let state = self.state.lock();
        let pairs = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        Ok((pairs, state.revision))
    }

    async fn save(&self, key: &str, value: &str) -> Result<i64> {
        let mut state = self.state.lock();
        Ok(state.commit(vec![(key.to_string(), value.to_string(), None)], Vec::new()))
    }

    async fn multi_save(&self, kvs: HashMap<String, String>) -> Result<i64> {
        let mut state = self.state.lock();
        let saves = kvs.into_iter().map(|(k, v)| (k, v, None)).collect();
        Ok(state.commit(saves, Vec::new()))
    }

    async fn multi_save_and_remove(
        &self,
        saves: HashMap<String, String>,
        removals: Vec<String>,
    ) -> Result<i64> {
        let mut state = self.state.lock();
        let saves = saves.into_iter().map(|(k, v)| (k, v, None)).collect();
        Ok(state.commit(saves, removals))
    }

    async fn remove(&self, key: &str) -> Result<i64> {
        let mut state = self.state.lock();
        Ok(state.commit(Vec::new(), vec![key.to_string()]))
    }

    async fn remove_with_prefix(&self, prefix: &str) -> Result<i64> {
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(state.commit(Vec::new(), keys))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        let current = state.entries.get(key).map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }
        state.commit(vec![(key.to_string(), value.to_string(), None)], Vec::new());
        Ok(true)
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64> {
        let mut state = self.state.lock();
        let current = match state.entries.get(key) {
            Some(e) => e
                .value
                .parse::<i64>()
                .map_err(|_| Error::Unexpected(format!("counter {key} holds non-integer")))?,
            None => 0,
        };
        let next = current + by;
        state.commit(vec![(key.to_string(), next.to_string(), None)], Vec::new());
        Ok(next)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut state = self.state.lock();
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(id, Lease { deadline: Instant::now() + ttl, ttl, keys: HashSet::new() });
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock();
        match state.leases.get_mut(&lease) {
            Some(l) => {
                l.deadline = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(Error::LostPeer(format!("lease {lease} expired"))),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(l) = state.leases.remove(&lease) {
            let keys: Vec<String> = l.keys.into_iter().collect();
            state.commit(Vec::new(), keys);
        }
        Ok(())
    }

    async fn save_with_lease(&self, key: &str, value: &str, lease: LeaseId) -> Result<i64> {
        let mut state = self.state.lock();
        if !state.leases.contains_key(&lease) {
            return Err(Error::LostPeer(format!("lease {lease} expired")));
        }
        Ok(state.commit(vec![(key.to_string(), value.to_string(), Some(lease))], Vec::new()))
    }

    async fn save_with_lease_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: LeaseId,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.leases.contains_key(&lease) {
            return Err(Error::LostPeer(format!("lease {lease} expired")));
        }
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        state.commit(vec![(key.to_string(), value.to_string(), Some(lease))], Vec::new());
        Ok(true)
    }

    fn watch(&self, prefix: &str, from_revision: i64) -> mpsc::UnboundedReceiver<KvEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        for event in &state.history {
            if event.revision >= from_revision && event.key.starts_with(prefix) {
                let _ = tx.send(event.clone());
            }
        }
        state.watchers.push(Watcher { prefix: prefix.to_string(), tx });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multi_save_is_one_revision() {
        let kv = MemoryMetaKv::new();
        let mut kvs = HashMap::new();
        kvs.insert("a".to_string(), "1".to_string());
        kvs.insert("b".to_string(), "2".to_string());
        let rev = kv.multi_save(kvs).await.unwrap();

        let (pairs, snapshot_rev) = kv.load_with_prefix("").await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(snapshot_rev, rev);
    }

    #[tokio::test]
    async fn watch_replays_then_streams() {
        let kv = MemoryMetaKv::new();
        kv.save("p/1", "one").await.unwrap();
        let mut rx = kv.watch("p/", 0);
        kv.save("p/2", "two").await.unwrap();
        kv.save("q/ignored", "x").await.unwrap();
        kv.remove("p/1").await.unwrap();

        let e1 = rx.recv().await.unwrap();
        assert_eq!((e1.event_type, e1.key.as_str()), (KvEventType::Put, "p/1"));
        let e2 = rx.recv().await.unwrap();
        assert_eq!((e2.event_type, e2.key.as_str()), (KvEventType::Put, "p/2"));
        let e3 = rx.recv().await.unwrap();
        assert_eq!((e3.event_type, e3.key.as_str()), (KvEventType::Delete, "p/1"));
        assert_eq!(e3.value, "one");
    }

    #[tokio::test]
    async fn watch_resumes_from_revision() {
        let kv = MemoryMetaKv::new();
        kv.save("p/1", "one").await.unwrap();
        let (_, rev) = kv.load_with_prefix("p/").await.unwrap();
        kv.save("p/2", "two").await.unwrap();

        let mut rx = kv.watch("p/", rev + 1);
        let e = rx.recv().await.unwrap();
        assert_eq!(e.key, "p/2");
    }

    #[tokio::test]
    async fn cas_and_incr() {
        let kv = MemoryMetaKv::new();
        assert!(kv.compare_and_swap("hw", None, "100").await.unwrap());
        assert!(!kv.compare_and_swap("hw", Some("99"), "200").await.unwrap());
        assert!(kv.compare_and_swap("hw", Some("100"), "200").await.unwrap());
        assert_eq!(kv.load("hw").await.unwrap().as_deref(), Some("200"));

        assert_eq!(kv.incr("ctr", 1).await.unwrap(), 1);
        assert_eq!(kv.incr("ctr", 1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn lease_expiry_deletes_keys_and_notifies() {
        let kv = MemoryMetaKv::new();
        let lease = kv.grant_lease(Duration::from_secs(60)).await.unwrap();
        kv.save_with_lease("/sessions/datanode/7", "addr", lease).await.unwrap();

        let mut rx = kv.watch("/sessions/", 0);
        let put = rx.recv().await.unwrap();
        assert_eq!(put.event_type, KvEventType::Put);

        kv.expire_lease_now(lease);
        let del = rx.recv().await.unwrap();
        assert_eq!(del.event_type, KvEventType::Delete);
        assert_eq!(del.key, "/sessions/datanode/7");
        assert!(kv.load("/sessions/datanode/7").await.unwrap().is_none());

        assert!(kv.keep_alive(lease).await.is_err());
    }

    #[tokio::test]
    async fn keep_alive_extends_lease() {
        let kv = MemoryMetaKv::new();
        let lease = kv.grant_lease(Duration::from_millis(120)).await.unwrap();
        kv.save_with_lease("k", "v", lease).await.unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            kv.keep_alive(lease).await.unwrap();
        }
        assert_eq!(kv.load("k").await.unwrap().as_deref(), Some("v"));
    }
}
