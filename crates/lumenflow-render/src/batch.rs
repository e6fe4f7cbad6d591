//! Persistent, incrementally maintained instance batches.
//!
//! A [`RenderBatch`] is a frame-scoped grouping of instance infos that share
//! a render setting and geometry source. The [`BatchContainer`] is the only
//! long-lived mutable aggregate in the engine: it tracks registered
//! instances across frames and rebuilds its batches whenever an instance is
//! added, removed, or dirtied, or at frame start.

use indexmap::IndexMap;
use lumenflow_core::profiling::profile_function;
use lumenflow_core::{KeyId, TaskPool};

use crate::flow::RenderFlowType;
use crate::instance::{GraphicsInstance, InstanceInfo};
use crate::setting::{BatchKey, RenderSetting, SourceId};
use crate::uniform::{UniformBatchGroup, group_by_snapshot};
use std::sync::Arc;

/// A group of instance infos issued with shared GPU state.
///
/// Invariant: every member's setting equals the batch's setting.
pub struct RenderBatch {
    setting: Arc<RenderSetting>,
    source: SourceId,
    members: Vec<InstanceInfo>,
    uniform_groups: Vec<UniformBatchGroup>,
}

impl RenderBatch {
    /// Build a batch and derive its uniform sub-groups.
    ///
    /// Sub-grouping samples the first member's shader provider; when the
    /// first member resolves no provider the batch proceeds ungrouped.
    pub fn new(key: BatchKey, members: Vec<InstanceInfo>) -> Self {
        let uniform_groups = match members.first().and_then(|m| m.shader()) {
            Some(provider) => {
                let provider = provider.clone();
                group_by_snapshot(
                    provider.as_ref(),
                    members.iter().map(|m| m.instance().as_ref()),
                )
            }
            None => Vec::new(),
        };

        Self {
            setting: key.setting,
            source: key.source,
            members,
            uniform_groups,
        }
    }

    pub fn setting(&self) -> &Arc<RenderSetting> {
        &self.setting
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn members(&self) -> &[InstanceInfo] {
        &self.members
    }

    pub fn uniform_groups(&self) -> &[UniformBatchGroup] {
        &self.uniform_groups
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Owns the full set of batches for one flow type.
///
/// Mutated through `register_instance` / `unregister_instance` /
/// `handle_dirty_instance`; reset once per frame via `prepare_for_frame`.
/// Single-writer: the owning driver on the render thread.
pub struct BatchContainer {
    flow: RenderFlowType,
    /// Registered infos in registration order; batch membership is derived
    /// from this on reorganize.
    instances: IndexMap<KeyId, InstanceInfo, ahash::RandomState>,
    batches: IndexMap<BatchKey, RenderBatch, ahash::RandomState>,
    organized: bool,
}

impl BatchContainer {
    pub fn new(flow: RenderFlowType) -> Self {
        Self {
            flow,
            instances: IndexMap::default(),
            batches: IndexMap::default(),
            organized: false,
        }
    }

    pub fn flow(&self) -> &RenderFlowType {
        &self.flow
    }

    pub fn contains(&self, id: &KeyId) -> bool {
        self.instances.contains_key(id)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn register_instance(&mut self, info: InstanceInfo) {
        self.instances.insert(info.id().clone(), info);
        self.organized = false;
    }

    pub fn unregister_instance(&mut self, id: &KeyId) {
        if self.instances.shift_remove(id).is_some() {
            self.organized = false;
        }
    }

    /// Replace a dirty instance's info with a freshly collected one.
    pub fn handle_dirty_instance(&mut self, info: InstanceInfo) {
        self.register_instance(info);
    }

    /// Per-frame reset: forces a reorganize before the next batch access so
    /// uniform groups are recomputed from live values.
    pub fn prepare_for_frame(&mut self) {
        self.organized = false;
    }

    /// Drop every registered instance whose `should_discard()` is true.
    /// Returns the removed identifiers.
    pub fn sweep_discarded(&mut self) -> Vec<KeyId> {
        let discarded: Vec<KeyId> = self
            .instances
            .iter()
            .filter(|(_, info)| info.instance().should_discard())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &discarded {
            self.instances.shift_remove(id);
        }
        if !discarded.is_empty() {
            self.organized = false;
        }
        discarded
    }

    fn group_members(&self) -> IndexMap<BatchKey, Vec<InstanceInfo>, ahash::RandomState> {
        let mut grouped: IndexMap<BatchKey, Vec<InstanceInfo>, ahash::RandomState> =
            IndexMap::default();
        for info in self.instances.values() {
            grouped
                .entry(info.batch_key())
                .or_default()
                .push(info.clone());
        }
        grouped
    }

    fn finish_organize(&mut self) {
        self.organized = true;
        tracing::trace!(
            flow = %self.flow,
            batches = self.batches.len(),
            instances = self.instances.len(),
            "reorganized batch container"
        );
    }

    /// Rebuild batches from the registered instances if anything changed.
    pub fn ensure_organized(&mut self) {
        if self.organized {
            return;
        }
        profile_function!();

        self.batches = self
            .group_members()
            .into_iter()
            .map(|(key, members)| (key.clone(), RenderBatch::new(key, members)))
            .collect();
        self.finish_organize();
    }

    /// Like [`Self::ensure_organized`], but derives each batch's uniform
    /// groups on the pool. Joined in key-discovery order, so batch order
    /// matches the inline path.
    pub fn ensure_organized_on(&mut self, pool: &TaskPool) {
        if self.organized {
            return;
        }
        profile_function!();

        let tasks: Vec<_> = self
            .group_members()
            .into_iter()
            .map(|(key, members)| {
                pool.spawn(async move { (key.clone(), RenderBatch::new(key, members)) })
            })
            .collect();
        self.batches = tasks.into_iter().map(TaskPool::join).collect();
        self.finish_organize();
    }

    /// Batches in key-discovery order. Call `ensure_organized` first.
    pub fn batches(&self) -> impl Iterator<Item = &RenderBatch> {
        self.batches.values()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// Clear everything; used by flows that do not batch persistently.
    pub fn clear(&mut self) {
        self.instances.clear();
        self.batches.clear();
        self.organized = false;
    }
}
