//! Storage collaborator.
//!
//! The engine never owns records; it reads and writes them through
//! [`Storage`]. Writes made by the engine (applying remote changes) go
//! through [`Storage::insert`] / [`Storage::delete`] and are not observed.
//! Writes made by the application are staged and committed with
//! [`MemoryStorage::save`], which notifies every [`StorageObserver`] so local
//! changes can be captured.

use crate::value::Attributes;
use crate::{BucketName, Key};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Scoped critical section over a storage.
///
/// Held around every apply-and-persist step. Released on drop, so every exit
/// path (including `?`) releases it.
pub struct CriticalSection<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl<'a> CriticalSection<'a> {
    pub fn new(lock: &'a ReentrantMutex<()>) -> Self {
        Self {
            _guard: lock.lock(),
        }
    }
}

/// Record predicate for [`Storage::enumerate`].
pub type Predicate<'a> = &'a dyn Fn(&Key, &Attributes) -> bool;

/// Keyed record storage the engine syncs.
pub trait Storage: Send + Sync {
    fn fetch(&self, bucket: &str, key: &str) -> Option<Attributes>;

    /// Insert or overwrite a record.
    fn insert(&self, bucket: &str, key: &str, attrs: Attributes);

    /// Delete a record. Returns whether it existed.
    fn delete(&self, bucket: &str, key: &str) -> bool;

    fn enumerate(&self, bucket: &str, predicate: Option<Predicate<'_>>) -> Vec<(Key, Attributes)>;

    /// Enter the storage's critical section.
    ///
    /// Reentrant: the holder may call back into the storage.
    fn critical_section(&self) -> CriticalSection<'_>;

    fn contains(&self, bucket: &str, key: &str) -> bool {
        self.fetch(bucket, key).is_some()
    }
}

/// Observer of application saves.
pub trait StorageObserver: Send + Sync {
    /// Called before deleted records are removed.
    fn will_save(&self, bucket: &str, deleted: &[Key]);

    /// Called after inserted and updated records are committed.
    fn did_save(&self, bucket: &str, inserted: &[Key], updated: &[Key]);
}

#[derive(Debug, Default)]
struct Staged {
    upserts: BTreeMap<(BucketName, Key), Attributes>,
    deletes: BTreeSet<(BucketName, Key)>,
}

/// In-memory [`Storage`] with staged application writes.
#[derive(Default)]
pub struct MemoryStorage {
    records: RwLock<BTreeMap<BucketName, BTreeMap<Key, Attributes>>>,
    staged: Mutex<Staged>,
    observers: RwLock<Vec<Arc<dyn StorageObserver>>>,
    lock: ReentrantMutex<()>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&self, observer: Arc<dyn StorageObserver>) {
        self.observers.write().push(observer);
    }

    /// Stage an application write.
    pub fn put_local(&self, bucket: &str, key: &str, attrs: Attributes) {
        let id = (bucket.to_string(), key.to_string());
        let mut staged = self.staged.lock();
        staged.deletes.remove(&id);
        staged.upserts.insert(id, attrs);
    }

    /// Stage an application delete.
    pub fn remove_local(&self, bucket: &str, key: &str) {
        let id = (bucket.to_string(), key.to_string());
        let mut staged = self.staged.lock();
        staged.upserts.remove(&id);
        staged.deletes.insert(id);
    }

    /// Commit staged writes and notify observers, one call per bucket.
    pub fn save(&self) {
        let staged = std::mem::take(&mut *self.staged.lock());
        let observers = self.observers.read().clone();

        let mut deleted: BTreeMap<BucketName, Vec<Key>> = BTreeMap::new();
        for (bucket, key) in staged.deletes {
            if self.contains(&bucket, &key) {
                deleted.entry(bucket).or_default().push(key);
            }
        }
        for (bucket, keys) in &deleted {
            for observer in &observers {
                observer.will_save(bucket, keys);
            }
        }

        let mut inserted: BTreeMap<BucketName, Vec<Key>> = BTreeMap::new();
        let mut updated: BTreeMap<BucketName, Vec<Key>> = BTreeMap::new();
        {
            let _section = self.critical_section();
            for (bucket, keys) in &deleted {
                for key in keys {
                    self.delete(bucket, key);
                }
            }
            for ((bucket, key), attrs) in staged.upserts {
                let target = if self.contains(&bucket, &key) {
                    &mut updated
                } else {
                    &mut inserted
                };
                target.entry(bucket.clone()).or_default().push(key.clone());
                self.insert(&bucket, &key, attrs);
            }
        }

        let buckets: BTreeSet<&BucketName> = inserted.keys().chain(updated.keys()).collect();
        for bucket in buckets {
            let inserted = inserted.get(bucket).map(Vec::as_slice).unwrap_or_default();
            let updated = updated.get(bucket).map(Vec::as_slice).unwrap_or_default();
            for observer in &observers {
                observer.did_save(bucket, inserted, updated);
            }
        }
    }

    /// Number of records in a bucket.
    pub fn len(&self, bucket: &str) -> usize {
        self.records.read().get(bucket).map_or(0, BTreeMap::len)
    }
}

impl Storage for MemoryStorage {
    fn fetch(&self, bucket: &str, key: &str) -> Option<Attributes> {
        self.records.read().get(bucket)?.get(key).cloned()
    }

    fn insert(&self, bucket: &str, key: &str, attrs: Attributes) {
        self.records
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), attrs);
    }

    fn delete(&self, bucket: &str, key: &str) -> bool {
        self.records
            .write()
            .get_mut(bucket)
            .is_some_and(|records| records.remove(key).is_some())
    }

    fn enumerate(&self, bucket: &str, predicate: Option<Predicate<'_>>) -> Vec<(Key, Attributes)> {
        let records = self.records.read();
        let Some(records) = records.get(bucket) else {
            return Vec::new();
        };
        records
            .iter()
            .filter(|(key, attrs)| predicate.map_or(true, |p| p(key, attrs)))
            .map(|(key, attrs)| (key.clone(), attrs.clone()))
            .collect()
    }

    fn critical_section(&self) -> CriticalSection<'_> {
        CriticalSection::new(&self.lock)
    }
}
