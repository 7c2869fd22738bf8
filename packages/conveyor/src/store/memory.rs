//! Embedded in-memory store.
//!
//! Behaves like a single-node Redis: one mutex guards all structures, so
//! every operation is atomic with respect to every other. Used by tests and
//! by deployments that accept process-lifetime durability.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{ScoredMember, Store, StoreError};

#[derive(Default)]
struct Inner {
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    scalars: HashMap<String, (String, Option<DateTime<Utc>>)>,
}

/// In-memory [`Store`] backed by mutex-held maps.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("mutex poisoned: {e}")))
    }
}

/// Resolve a Redis-style index (negative counts from the tail) to an
/// absolute offset, clamped to `[0, len]`.
fn resolve_index(idx: isize, len: usize) -> usize {
    if idx < 0 {
        len.saturating_sub(idx.unsigned_abs())
    } else {
        (idx as usize).min(len)
    }
}

fn sorted_members(zset: &HashMap<String, f64>) -> Vec<ScoredMember> {
    let mut members: Vec<ScoredMember> =
        zset.iter().map(|(m, s)| (m.clone(), *s)).collect();
    members.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    members
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_push_head(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn list_push_tail(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.lock()?;
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len();
        let start = resolve_index(start, len);
        // stop is inclusive; resolve then saturate to the last element
        let stop = if stop < 0 {
            let abs = stop.unsigned_abs();
            if abs > len {
                return Ok(Vec::new());
            }
            len - abs
        } else {
            (stop as usize).min(len.saturating_sub(1))
        };
        if start > stop || len == 0 {
            return Ok(Vec::new());
        }
        Ok(list.iter().skip(start).take(stop - start + 1).cloned().collect())
    }

    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError> {
        let kept = self.list_range(key, start, stop).await?;
        let mut inner = self.lock()?;
        if kept.is_empty() {
            inner.lists.remove(key);
        } else {
            inner.lists.insert(key.to_string(), kept.into());
        }
        Ok(())
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let mut inner = self.lock()?;
        let Some(list) = inner.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|v| v != value);
        let removed = (before - list.len()) as u64;
        if list.is_empty() {
            inner.lists.remove(key);
        }
        Ok(removed)
    }

    async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        let inner = self.lock()?;
        Ok(inner.lists.get(key).map_or(0, |l| l.len() as u64))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut inner = self.lock()?;
        let entry = inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert_with(|| "0".to_string());
        let current: i64 = entry.parse().map_err(|e| {
            StoreError::Backend(anyhow::anyhow!("hash field is not an integer: {e}"))
        })?;
        let next = current + delta;
        *entry = next.to_string();
        Ok(next)
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let Some(hash) = inner.hashes.get_mut(key) else {
            return Ok(false);
        };
        let existed = hash.remove(field).is_some();
        if hash.is_empty() {
            inner.hashes.remove(key);
        }
        Ok(existed)
    }

    async fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zset_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.lock()?;
        let Some(zset) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let members = sorted_members(zset)
            .into_iter()
            .filter(|(_, s)| *s >= min && *s <= max)
            .map(|(m, _)| m);
        Ok(match limit {
            Some(n) => members.take(n).collect(),
            None => members.collect(),
        })
    }

    async fn zset_pop_min(
        &self,
        key: &str,
        count: usize,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        let mut inner = self.lock()?;
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(Vec::new());
        };
        let popped: Vec<ScoredMember> =
            sorted_members(zset).into_iter().take(count).collect();
        for (member, _) in &popped {
            zset.remove(member);
        }
        if zset.is_empty() {
            inner.zsets.remove(key);
        }
        Ok(popped)
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(false);
        };
        let existed = zset.remove(member).is_some();
        if zset.is_empty() {
            inner.zsets.remove(key);
        }
        Ok(existed)
    }

    async fn zset_card(&self, key: &str) -> Result<u64, StoreError> {
        let inner = self.lock()?;
        Ok(inner.zsets.get(key).map_or(0, |z| z.len() as u64))
    }

    async fn zset_remove_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock()?;
        let Some(zset) = inner.zsets.get_mut(key) else {
            return Ok(0);
        };
        let before = zset.len();
        zset.retain(|_, s| *s < min || *s > max);
        let removed = (before - zset.len()) as u64;
        if zset.is_empty() {
            inner.zsets.remove(key);
        }
        Ok(removed)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Backend(anyhow::anyhow!("ttl out of range: {e}")))?;
        inner
            .scalars
            .insert(key.to_string(), (value.to_string(), Some(expires_at)));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock()?;
        match inner.scalars.get(key) {
            Some((_, Some(expires_at))) if *expires_at <= Utc::now() => {
                inner.scalars.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.lists.remove(key);
        inner.hashes.remove(key);
        inner.zsets.remove(key);
        inner.scalars.remove(key);
        Ok(())
    }
}
