use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::approvals::resolver::ApproverDirectory;
use crate::domain::directory::{Designation, DirectoryUser, UserId};
use crate::lookup::LookupError;

/// Bounded map whose entries expire `ttl` after insertion. When full, expired entries are
/// dropped first and then the oldest insertion.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, (Instant, V)>>,
    ttl: Duration,
    capacity: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self { entries: Mutex::new(HashMap::new()), ttl, capacity: capacity.max(1) }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some((inserted_at, value)) if inserted_at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.lock();
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            let ttl = self.ttl;
            entries.retain(|_, (inserted_at, _)| inserted_at.elapsed() < ttl);

            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, (inserted_at, _))| *inserted_at)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(key, (Instant::now(), value));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, (Instant, V)>> {
        match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Directory decorator that memoizes designation and user lookups. Errors are never cached.
#[derive(Debug)]
pub struct CachedDirectory<D> {
    inner: D,
    by_designation: TtlCache<String, Vec<DirectoryUser>>,
    by_user: TtlCache<UserId, Option<DirectoryUser>>,
}

impl<D> CachedDirectory<D> {
    pub fn new(inner: D, ttl: Duration, capacity: usize) -> Self {
        Self {
            inner,
            by_designation: TtlCache::new(ttl, capacity),
            by_user: TtlCache::new(ttl, capacity),
        }
    }

    pub fn invalidate(&self) {
        self.by_designation.clear();
        self.by_user.clear();
    }
}

#[async_trait]
impl<D> ApproverDirectory for CachedDirectory<D>
where
    D: ApproverDirectory,
{
    async fn users_with_designation(
        &self,
        designation: &Designation,
    ) -> Result<Vec<DirectoryUser>, LookupError> {
        let key = designation.key();
        if let Some(users) = self.by_designation.get(&key) {
            return Ok(users);
        }

        let users = self.inner.users_with_designation(designation).await?;
        self.by_designation.insert(key, users.clone());
        Ok(users)
    }

    async fn find_user(&self, user_id: &UserId) -> Result<Option<DirectoryUser>, LookupError> {
        if let Some(user) = self.by_user.get(user_id) {
            return Ok(user);
        }

        let user = self.inner.find_user(user_id).await?;
        self.by_user.insert(user_id.clone(), user.clone());
        Ok(user)
    }

    async fn count_active_users(&self) -> Result<u64, LookupError> {
        self.inner.count_active_users().await
    }
}
