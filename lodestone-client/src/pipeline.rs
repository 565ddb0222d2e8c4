//! The staged transformer pipeline.
//!
//! A pipeline is an ordered sequence of named stages, each holding an
//! ordered transformer list and optionally a persistent cache binding.
//! Successful network responses run through every stage in order, with each
//! stage's output written behind to its cache; cache reads walk the stages
//! backwards and replay only the stages downstream of the hit.

use std::sync::Arc;

use lodestone_core::Entity;
use tracing::{debug, warn};

use crate::{
    cache::{EntityCache, EntityCacheKey},
    resource::Resource,
    response::Response,
    transformer::{json_transformer, text_transformer, ResponseTransformer},
};

/// Identifies one pipeline stage. Order lives in the pipeline, not here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageKey {
    RawData,
    Decoding,
    Parsing,
    Model,
    Cleanup,
    Custom(&'static str),
}

/// One ordered step: transformers plus an optional cache binding.
#[derive(Clone)]
pub struct PipelineStage {
    key: StageKey,
    transformers: Vec<Arc<dyn ResponseTransformer>>,
    cache: Option<Arc<dyn EntityCache>>,
}

impl PipelineStage {
    fn new(key: StageKey) -> Self {
        PipelineStage {
            key,
            transformers: Vec::new(),
            cache: None,
        }
    }

    pub fn key(&self) -> StageKey {
        self.key
    }

    /// Append a transformer after any already registered.
    pub fn add_transformer(&mut self, transformer: Arc<dyn ResponseTransformer>) {
        self.transformers.push(transformer);
    }

    /// Replace all transformers in this stage.
    pub fn set_transformer(&mut self, transformer: Arc<dyn ResponseTransformer>) {
        self.transformers = vec![transformer];
    }

    pub fn clear_transformers(&mut self) {
        self.transformers.clear();
    }

    /// Bind a persistent cache to this stage's output.
    pub fn set_cache(&mut self, cache: Arc<dyn EntityCache>) {
        self.cache = Some(cache);
    }

    pub fn remove_cache(&mut self) {
        self.cache = None;
    }

    fn cache_key(&self, resource: &Resource) -> Option<(Arc<dyn EntityCache>, EntityCacheKey)> {
        let cache = self.cache.clone()?;
        let resource_key = cache.key_for_resource(resource)?;
        Some((
            cache,
            EntityCacheKey {
                resource_key,
                stage: self.key,
            },
        ))
    }
}

/// The ordered stage sequence for one configuration.
///
/// Cloned freely: a resource's effective pipeline is a snapshot taken at
/// configuration-resolution time.
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<PipelineStage>,
}

impl Default for Pipeline {
    /// The standard stage order, all stages empty.
    fn default() -> Self {
        Pipeline {
            stages: [
                StageKey::RawData,
                StageKey::Decoding,
                StageKey::Parsing,
                StageKey::Model,
                StageKey::Cleanup,
            ]
            .into_iter()
            .map(PipelineStage::new)
            .collect(),
        }
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline::default()
    }

    /// The standard stages with the stock JSON and text transformers in
    /// `Parsing`.
    pub fn standard() -> Self {
        let mut pipeline = Pipeline::default();
        let parsing = pipeline.stage_mut(StageKey::Parsing);
        parsing.add_transformer(json_transformer());
        parsing.add_transformer(text_transformer());
        pipeline
    }

    pub fn stage(&self, key: StageKey) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.key == key)
    }

    /// The stage for `key`, appending a new empty stage for unknown keys.
    pub fn stage_mut(&mut self, key: StageKey) -> &mut PipelineStage {
        if let Some(i) = self.stages.iter().position(|s| s.key == key) {
            &mut self.stages[i]
        } else {
            self.stages.push(PipelineStage::new(key));
            let last = self.stages.len() - 1;
            &mut self.stages[last]
        }
    }

    pub fn order(&self) -> Vec<StageKey> {
        self.stages.iter().map(|s| s.key).collect()
    }

    /// Reorder the pipeline. Existing stages keep their contents; unknown
    /// keys become new empty stages; stages not listed are dropped.
    pub fn set_order(&mut self, keys: &[StageKey]) {
        let mut old = std::mem::take(&mut self.stages);
        for key in keys {
            match old.iter().position(|s| s.key == *key) {
                Some(i) => self.stages.push(old.remove(i)),
                None => self.stages.push(PipelineStage::new(*key)),
            }
        }
    }

    /// Strip every transformer, leaving raw responses untouched.
    pub fn clear_transformers(&mut self) {
        for stage in &mut self.stages {
            stage.clear_transformers();
        }
    }

    pub fn clear_caches(&mut self) {
        for stage in &mut self.stages {
            stage.remove_cache();
        }
    }

    pub(crate) fn has_caches(&self) -> bool {
        self.stages.iter().any(|s| s.cache.is_some())
    }

    /// Write path: run each stage's transformers in order, writing each
    /// stage's successful output behind to its bound cache. Errors abort
    /// caching from the failed stage on and are never cached themselves.
    pub(crate) fn process(&self, mut response: Response, resource: &Resource, now: f64) -> Response {
        for stage in &self.stages {
            for transformer in &stage.transformers {
                response = transformer.process(response, now);
            }
            if let Response::Success(entity) = &response {
                if let Some((cache, key)) = stage.cache_key(resource) {
                    let entity = entity.clone();
                    tokio::spawn(async move {
                        if let Err(error) = cache.write(&key, entity).await {
                            warn!(target: "lodestone::cache", %key, %error, "cache write failed");
                        }
                    });
                }
            }
        }
        response
    }

    /// Read path: from the latest cached stage backwards, look for a hit,
    /// replaying downstream transformers over it. A hit that fails
    /// downstream transformation degrades to a miss and the walk continues.
    pub(crate) async fn load_from_caches(&self, resource: &Resource, now: f64) -> Option<Entity> {
        for (index, stage) in self.stages.iter().enumerate().rev() {
            let Some((cache, key)) = stage.cache_key(resource) else {
                continue;
            };
            let hit = match cache.read(&key).await {
                Ok(Some(entity)) => entity,
                Ok(None) => continue,
                Err(error) => {
                    warn!(target: "lodestone::cache", %key, %error, "cache read failed");
                    continue;
                }
            };
            debug!(target: "lodestone::cache", %key, "cache hit");
            let mut response = Response::Success(hit);
            for later in &self.stages[index + 1..] {
                for transformer in &later.transformers {
                    response = transformer.process(response, now);
                }
            }
            match response {
                Response::Success(entity) => return Some(entity),
                Response::Failure(error) => {
                    debug!(target: "lodestone::cache", %key, %error, "cached entry no longer transforms; falling back");
                }
            }
        }
        None
    }

    /// 304 path: refresh the stored timestamp in every bound cache.
    pub(crate) fn touch_caches(&self, resource: &Resource, entity: &Entity) {
        for stage in &self.stages {
            if let Some((cache, key)) = stage.cache_key(resource) {
                let entity = entity.clone();
                tokio::spawn(async move {
                    if let Err(error) = cache.write(&key, entity).await {
                        warn!(target: "lodestone::cache", %key, %error, "cache touch failed");
                    }
                });
            }
        }
    }

    /// Local-override path: drop the resource from every bound cache.
    pub(crate) fn remove_from_caches(&self, resource: &Resource) {
        for stage in &self.stages {
            if let Some((cache, key)) = stage.cache_key(resource) {
                tokio::spawn(async move {
                    if let Err(error) = cache.remove(&key).await {
                        warn!(target: "lodestone::cache", %key, %error, "cache removal failed");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_order_is_stable() {
        let p = Pipeline::new();
        assert_eq!(
            p.order(),
            vec![
                StageKey::RawData,
                StageKey::Decoding,
                StageKey::Parsing,
                StageKey::Model,
                StageKey::Cleanup,
            ]
        );
    }

    #[test]
    fn unknown_keys_are_appended() {
        let mut p = Pipeline::new();
        p.stage_mut(StageKey::Custom("auth")).clear_transformers();
        assert_eq!(p.order().last(), Some(&StageKey::Custom("auth")));
    }

    #[test]
    fn set_order_reorders_keeps_and_drops() {
        let mut p = Pipeline::standard();
        p.set_order(&[StageKey::Parsing, StageKey::RawData, StageKey::Custom("x")]);
        assert_eq!(
            p.order(),
            vec![StageKey::Parsing, StageKey::RawData, StageKey::Custom("x")]
        );
        // Parsing kept its standard transformers through the reorder
        assert_eq!(p.stage(StageKey::Parsing).unwrap().transformers.len(), 2);
        assert!(p.stage(StageKey::Cleanup).is_none());
    }
}
