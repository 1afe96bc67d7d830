//! Process-local store.
//!
//! Mirrors the Redis semantics the engine relies on (type checks, key
//! expiry, multi-key blocking pop) so coordination logic can run without a
//! server. Blocked pops are woken through a `Notify` whenever a list grows.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{KeyType, Namespace, Store, StoreError};

#[derive(Debug)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
}

impl Value {
    fn key_type(&self) -> KeyType {
        match self {
            Value::Str(_) => KeyType::String,
            Value::List(_) => KeyType::List,
            Value::Hash(_) => KeyType::Hash,
            Value::Set(_) => KeyType::Set,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::List(l) => l.is_empty(),
            Value::Hash(h) => h.is_empty(),
            Value::Set(s) => s.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Data {
    slots: HashMap<String, Slot>,
}

impl Data {
    fn purge(&mut self, key: &str) {
        let expired = self
            .slots
            .get(key)
            .and_then(|slot| slot.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            self.slots.remove(key);
        }
    }

    fn value(&mut self, key: &str) -> Option<&mut Value> {
        self.purge(key);
        self.slots.get_mut(key).map(|slot| &mut slot.value)
    }

    fn list(&mut self, key: &str) -> Result<Option<&mut VecDeque<String>>, StoreError> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::List(list)) => Ok(Some(list)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn list_or_create(&mut self, key: &str) -> Result<&mut VecDeque<String>, StoreError> {
        self.purge(key);
        let slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::List(list) => Ok(list),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn hash(&mut self, key: &str) -> Result<Option<&mut BTreeMap<String, String>>, StoreError> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(Some(hash)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn hash_or_create(&mut self, key: &str) -> Result<&mut BTreeMap<String, String>, StoreError> {
        self.purge(key);
        let slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Hash(BTreeMap::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::Hash(hash) => Ok(hash),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set(&mut self, key: &str) -> Result<Option<&mut BTreeSet<String>>, StoreError> {
        match self.value(key) {
            None => Ok(None),
            Some(Value::Set(set)) => Ok(Some(set)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn set_or_create(&mut self, key: &str) -> Result<&mut BTreeSet<String>, StoreError> {
        self.purge(key);
        let slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::Set(set) => Ok(set),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    /// Containers disappear once emptied, like in Redis.
    fn drop_if_empty(&mut self, key: &str) {
        if self.slots.get(key).is_some_and(|slot| slot.value.is_empty()) {
            self.slots.remove(key);
        }
    }
}

/// In-memory store.
#[derive(Debug)]
pub struct MemoryStore {
    data: Mutex<Data>,
    pushed: Notify,
    namespace: Namespace,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("workforge")
    }
}

impl MemoryStore {
    /// Creates an empty store using the given key namespace.
    pub fn new(namespace: &str) -> Self {
        Self {
            data: Mutex::new(Data::default()),
            pushed: Notify::new(),
            namespace: Namespace::new(namespace),
        }
    }

    fn data(&self) -> MutexGuard<'_, Data> {
        // Every mutation completes before the guard drops.
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn key(&self, key: &str) -> String {
        self.namespace.key(key)
    }

    fn try_pop_first(&self, keys: &[String]) -> Result<Option<(String, String)>, StoreError> {
        let mut data = self.data();
        for key in keys {
            let namespaced = self.key(key);
            let popped = data.list(&namespaced)?.and_then(|list| list.pop_front());
            if let Some(value) = popped {
                data.drop_if_empty(&namespaced);
                return Ok(Some((key.clone(), value)));
            }
        }
        Ok(None)
    }
}

/// Glob match supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

fn list_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl Store for MemoryStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let key = self.key(key);
        let mut data = self.data();
        let current = match data.value(&key) {
            None => 0,
            Some(Value::Str(s)) => s
                .parse::<i64>()
                .map_err(|_| StoreError::WrongType(key.clone()))?,
            Some(_) => return Err(StoreError::WrongType(key)),
        };
        let next = current + 1;
        let expires_at = data.slots.get(&key).and_then(|slot| slot.expires_at);
        data.slots.insert(
            key,
            Slot {
                value: Value::Str(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = self.key(key);
        match self.data().value(&key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType(key)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.data().slots.insert(
            self.key(key),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let key = self.key(key);
        let mut data = self.data();
        if data.value(&key).is_some() {
            return Ok(false);
        }
        data.slots.insert(
            key,
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let key = self.key(key);
        let mut data = self.data();
        data.purge(&key);
        Ok(data.slots.remove(&key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let key = self.key(key);
        Ok(self.data().value(&key).is_some())
    }

    async fn key_type(&self, key: &str) -> Result<KeyType, StoreError> {
        let key = self.key(key);
        Ok(self
            .data()
            .value(&key)
            .map(|v| v.key_type())
            .unwrap_or(KeyType::None))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let key = self.key(key);
        let mut data = self.data();
        data.purge(&key);
        match data.slots.get_mut(&key) {
            Some(slot) => {
                slot.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let pattern = self.key(pattern);
        let mut data = self.data();
        let candidates: Vec<String> = data.slots.keys().cloned().collect();
        let mut keys = Vec::new();
        for key in candidates {
            data.purge(&key);
            if data.slots.contains_key(&key) && glob_match(&pattern, &key) {
                keys.push(self.namespace.strip(&key).to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let len = {
            let mut data = self.data();
            let list = data.list_or_create(&self.key(key))?;
            list.push_back(value.to_string());
            list.len()
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let len = {
            let mut data = self.data();
            let list = data.list_or_create(&self.key(key))?;
            list.push_front(value.to_string());
            list.len()
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = self.key(key);
        let mut data = self.data();
        let popped = data.list(&key)?.and_then(|list| list.pop_front());
        data.drop_if_empty(&key);
        Ok(popped)
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = self.key(key);
        let mut data = self.data();
        let popped = data.list(&key)?.and_then(|list| list.pop_back());
        data.drop_if_empty(&key);
        Ok(popped)
    }

    async fn blpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        if keys.is_empty() {
            return Ok(None);
        }
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        loop {
            // Register interest before checking so a push between the
            // check and the wait is not missed.
            let pushed = self.pushed.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();

            if let Some(hit) = self.try_pop_first(keys)? {
                return Ok(Some(hit));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                        return Ok(None);
                    }
                }
                None => pushed.await,
            }
        }
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        let key = self.key(key);
        Ok(self.data().list(&key)?.map_or(0, |list| list.len()))
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let key = self.key(key);
        let mut data = self.data();
        let Some(list) = data.list(&key)? else {
            return Ok(Vec::new());
        };
        Ok(match list_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self.data();
        data.hash_or_create(&self.key(key))?
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let key = self.key(key);
        Ok(self
            .data()
            .hash(&key)?
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let key = self.key(key);
        let mut data = self.data();
        let removed = data
            .hash(&key)?
            .is_some_and(|hash| hash.remove(field).is_some());
        data.drop_if_empty(&key);
        Ok(removed)
    }

    async fn hlen(&self, key: &str) -> Result<usize, StoreError> {
        let key = self.key(key);
        Ok(self.data().hash(&key)?.map_or(0, |hash| hash.len()))
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let key = self.key(key);
        Ok(self
            .data()
            .hash(&key)?
            .is_some_and(|hash| hash.contains_key(field)))
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let key = self.key(key);
        Ok(self
            .data()
            .hash(&key)?
            .map(|hash| hash.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut data = self.data();
        Ok(data
            .set_or_create(&self.key(key))?
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let key = self.key(key);
        let mut data = self.data();
        let removed = data.set(&key)?.is_some_and(|set| set.remove(member));
        data.drop_if_empty(&key);
        Ok(removed)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let key = self.key(key);
        Ok(self
            .data()
            .set(&key)?
            .is_some_and(|set| set.contains(member)))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let key = self.key(key);
        Ok(self
            .data()
            .set(&key)?
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_list_fifo() {
        let store = MemoryStore::default();
        store.rpush("q", "a").await.unwrap();
        store.rpush("q", "b").await.unwrap();
        store.lpush("q", "z").await.unwrap();

        assert_eq!(store.llen("q").await.unwrap(), 3);
        assert_eq!(store.lrange("q", 0, -1).await.unwrap(), vec!["z", "a", "b"]);
        assert_eq!(store.lpop("q").await.unwrap().as_deref(), Some("z"));
        assert_eq!(store.rpop("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.lpop("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.lpop("q").await.unwrap(), None);
        assert_eq!(store.key_type("q").await.unwrap(), KeyType::None);
    }

    #[tokio::test]
    async fn test_blpop_respects_key_order() {
        let store = MemoryStore::default();
        store.rpush("low", "l1").await.unwrap();
        store.rpush("high", "h1").await.unwrap();

        let keys = vec!["high".to_string(), "low".to_string()];
        let first = store.blpop(&keys, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first, Some(("high".to_string(), "h1".to_string())));
        let second = store.blpop(&keys, Duration::from_millis(10)).await.unwrap();
        assert_eq!(second, Some(("low".to_string(), "l1".to_string())));
    }

    #[tokio::test]
    async fn test_blpop_times_out() {
        let store = MemoryStore::default();
        let started = std::time::Instant::now();
        let result = store
            .blpop(&["empty".to_string()], Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(result, None);
        assert!(started.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_blpop_wakes_on_push() {
        let store = Arc::new(MemoryStore::default());
        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .blpop(&["jobs".to_string()], Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.rpush("jobs", "payload").await.unwrap();

        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped, Some(("jobs".to_string(), "payload".to_string())));
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryStore::default();
        store.set("k", "v").await.unwrap();
        assert!(matches!(
            store.rpush("k", "x").await,
            Err(StoreError::WrongType(_))
        ));
        assert!(matches!(
            store.hset("k", "f", "x").await,
            Err(StoreError::WrongType(_))
        ));
    }

    #[tokio::test]
    async fn test_counter_and_set_nx() {
        let store = MemoryStore::default();
        assert_eq!(store.incr("seq").await.unwrap(), 1);
        assert_eq!(store.incr("seq").await.unwrap(), 2);
        store.set("seq", "0").await.unwrap();
        assert_eq!(store.incr("seq").await.unwrap(), 1);

        assert!(store.set_nx("pid", "10").await.unwrap());
        assert!(!store.set_nx("pid", "11").await.unwrap());
        assert_eq!(store.get("pid").await.unwrap().as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn test_hash_and_set() {
        let store = MemoryStore::default();
        store.hset("h", "a", "1").await.unwrap();
        store.hset("h", "b", "2").await.unwrap();
        assert_eq!(store.hlen("h").await.unwrap(), 2);
        assert!(store.hexists("h", "a").await.unwrap());
        assert_eq!(store.hkeys("h").await.unwrap(), vec!["a", "b"]);
        assert!(store.hdel("h", "a").await.unwrap());
        assert!(!store.hdel("h", "a").await.unwrap());
        assert_eq!(store.hget("h", "b").await.unwrap().as_deref(), Some("2"));

        assert!(store.sadd("s", "x").await.unwrap());
        assert!(!store.sadd("s", "x").await.unwrap());
        assert!(store.sismember("s", "x").await.unwrap());
        assert!(store.srem("s", "x").await.unwrap());
        assert!(store.smembers("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expire() {
        let store = MemoryStore::default();
        store.set("temp", "v").await.unwrap();
        assert!(store.expire("temp", Duration::from_millis(20)).await.unwrap());
        assert!(store.exists("temp").await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.exists("temp").await.unwrap());
        assert!(!store.expire("missing", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_and_delete_keys() {
        let store = MemoryStore::new("ns");
        store.set("queue:a", "1").await.unwrap();
        store.set("queue:b", "1").await.unwrap();
        store.set("other", "1").await.unwrap();

        assert_eq!(
            store.keys("queue:*").await.unwrap(),
            vec!["queue:a", "queue:b"]
        );
        assert_eq!(store.delete_keys("queue:*").await.unwrap(), 2);
        assert_eq!(store.keys("*").await.unwrap(), vec!["other"]);
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("a*", "abc"));
        assert!(glob_match("a?c", "abc"));
        assert!(glob_match("*:lock", "workers:h:job:lock"));
        assert!(!glob_match("a?c", "abbc"));
        assert!(!glob_match("b*", "abc"));
    }

    #[test]
    fn test_list_range() {
        assert_eq!(list_range(5, 0, -1), Some((0, 4)));
        assert_eq!(list_range(5, 1, 2), Some((1, 2)));
        assert_eq!(list_range(5, -2, -1), Some((3, 4)));
        assert_eq!(list_range(5, 3, 1), None);
        assert_eq!(list_range(0, 0, -1), None);
    }
}
