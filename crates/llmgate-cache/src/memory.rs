use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{CacheError, CacheResult, SharedCache};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Int(i64),
    ZSet(HashMap<String, f64>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process `SharedCache` with lazy expiry.
///
/// Single-replica only: state is lost on restart and not shared across
/// processes. Embedders that run multiple replicas should plug in a real
/// shared backend behind the same trait.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

fn type_error(key: &str) -> CacheError {
    CacheError::Backend(format!("wrong value type for key {key}"))
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = Instant::now();
        let guard = self.entries.read().await;
        match guard.get(key) {
            Some(entry) if !entry.expired(now) => match &entry.value {
                Value::Str(value) => Ok(Some(value.clone())),
                Value::Int(value) => Ok(Some(value.to_string())),
                _ => Err(type_error(key)),
            },
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut guard = self.entries.write().await;
        guard.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> CacheResult<i64> {
        let now = Instant::now();
        let mut guard = self.entries.write().await;
        match guard.get_mut(key).filter(|entry| !entry.expired(now)) {
            Some(entry) => match &mut entry.value {
                Value::Int(value) => {
                    *value += 1;
                    Ok(*value)
                }
                _ => Err(type_error(key)),
            },
            None => {
                guard.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Int(1),
                        expires_at: Some(now + ttl),
                    },
                );
                Ok(1)
            }
        }
    }

    async fn zscore(&self, key: &str, member: &str) -> CacheResult<Option<f64>> {
        let now = Instant::now();
        let guard = self.entries.read().await;
        match guard.get(key) {
            Some(entry) if !entry.expired(now) => match &entry.value {
                Value::ZSet(members) => Ok(members.get(member).copied()),
                _ => Err(type_error(key)),
            },
            _ => Ok(None),
        }
    }

    async fn zadd_if_absent(&self, key: &str, member: &str, score: f64) -> CacheResult<()> {
        let now = Instant::now();
        let mut guard = self.entries.write().await;
        let entry = guard
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.expired(now) {
                    entry.value = Value::ZSet(HashMap::new());
                    entry.expires_at = None;
                }
            })
            .or_insert_with(|| Entry {
                value: Value::ZSet(HashMap::new()),
                expires_at: None,
            });
        match &mut entry.value {
            Value::ZSet(members) => {
                members.entry(member.to_string()).or_insert(score);
                Ok(())
            }
            _ => Err(type_error(key)),
        }
    }

    async fn zincr_clamped(
        &self,
        key: &str,
        member: &str,
        delta: f64,
        min: f64,
        max: f64,
    ) -> CacheResult<f64> {
        let now = Instant::now();
        let mut guard = self.entries.write().await;
        let entry = guard
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.expired(now) {
                    entry.value = Value::ZSet(HashMap::new());
                    entry.expires_at = None;
                }
            })
            .or_insert_with(|| Entry {
                value: Value::ZSet(HashMap::new()),
                expires_at: None,
            });
        match &mut entry.value {
            Value::ZSet(members) => {
                let score = members.entry(member.to_string()).or_insert(0.0);
                *score = (*score + delta).clamp(min, max);
                Ok(*score)
            }
            _ => Err(type_error(key)),
        }
    }

    async fn list_push_capped(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let now = Instant::now();
        let mut guard = self.entries.write().await;
        let entry = guard
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.expired(now) {
                    entry.value = Value::List(VecDeque::new());
                }
            })
            .or_insert_with(|| Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            });
        entry.expires_at = ttl.map(|ttl| now + ttl);
        match &mut entry.value {
            Value::List(items) => {
                items.push_back(value.to_string());
                while items.len() > cap {
                    items.pop_front();
                }
                Ok(())
            }
            _ => Err(type_error(key)),
        }
    }

    async fn list_range(&self, key: &str) -> CacheResult<Vec<String>> {
        let now = Instant::now();
        let guard = self.entries.read().await;
        match guard.get(key) {
            Some(entry) if !entry.expired(now) => match &entry.value {
                Value::List(items) => Ok(items.iter().cloned().collect()),
                _ => Err(type_error(key)),
            },
            _ => Ok(Vec::new()),
        }
    }
}
