//! Persistent entity caches bound to pipeline stages.

use std::fmt;

use ahash::HashMap;
use futures::future::BoxFuture;
use lodestone_core::Entity;
use parking_lot::Mutex;
use std::sync::Arc;
use tower::BoxError;

use crate::{pipeline::StageKey, resource::Resource};

/// Cache key: the implementation's resource key plus the stage the entry
/// was written from. One cache bound at several stages never collides with
/// itself because the stage discriminator is part of the key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntityCacheKey {
    pub resource_key: String,
    pub stage: StageKey,
}

impl fmt::Display for EntityCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.stage, self.resource_key)
    }
}

/// A persistent store for entities, keyed per resource.
///
/// Implementations own their work queue: the futures returned here are
/// expected to serialize access internally. The pipeline awaits reads but
/// fires writes and removals without waiting. Failures never fail a
/// request; the pipeline logs them and degrades to a cache miss.
pub trait EntityCache: Send + Sync + 'static {
    /// The key under which this resource's entities live, or `None` to
    /// disable caching for the resource entirely.
    fn key_for_resource(&self, resource: &Resource) -> Option<String>;

    fn read(&self, key: &EntityCacheKey) -> BoxFuture<'static, Result<Option<Entity>, BoxError>>;

    fn write(&self, key: &EntityCacheKey, entity: Entity) -> BoxFuture<'static, Result<(), BoxError>>;

    fn remove(&self, key: &EntityCacheKey) -> BoxFuture<'static, Result<(), BoxError>>;
}

/// Unbounded in-memory [`EntityCache`], keyed by resource URL.
///
/// The reference implementation: handy for tests and for apps that only
/// want warm-start behavior within one process lifetime.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<EntityCacheKey, Entity>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        InMemoryCache::default()
    }

    /// Preload an entry, as tests and warm-start paths do.
    pub fn insert(&self, key: EntityCacheKey, entity: Entity) {
        self.entries.lock().insert(key, entity);
    }

    pub fn get(&self, key: &EntityCacheKey) -> Option<Entity> {
        self.entries.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl EntityCache for InMemoryCache {
    fn key_for_resource(&self, resource: &Resource) -> Option<String> {
        Some(resource.url().to_string())
    }

    fn read(&self, key: &EntityCacheKey) -> BoxFuture<'static, Result<Option<Entity>, BoxError>> {
        let entry = self.get(key);
        Box::pin(async move { Ok(entry) })
    }

    fn write(&self, key: &EntityCacheKey, entity: Entity) -> BoxFuture<'static, Result<(), BoxError>> {
        self.entries.lock().insert(key.clone(), entity);
        Box::pin(async move { Ok(()) })
    }

    fn remove(&self, key: &EntityCacheKey) -> BoxFuture<'static, Result<(), BoxError>> {
        self.entries.lock().remove(key);
        Box::pin(async move { Ok(()) })
    }
}
