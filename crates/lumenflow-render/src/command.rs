//! Render commands and the stage-ordered execution queue.
//!
//! Commands are frame-scoped values: strategies produce them fresh every
//! frame, the queue executes them in stage order, and they are dropped in
//! bulk afterwards. Within a stage, commands sharing a vertex resource are
//! executed as one group with a single resource bind.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use lumenflow_core::KeyId;
use lumenflow_core::profiling::profile_function;

use crate::driver::GraphicsDriver;
use crate::indirect::IndirectBufferId;
use crate::instance::ComputeDispatch;
use crate::resource::VertexResourceId;
use crate::setting::{PrimitiveTopology, RenderSetting, ResourceBinding};
use crate::uniform::UniformBatchGroup;

/// A named ordering point in the frame that commands execute under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageId(KeyId);

impl StageId {
    pub fn new(id: impl Into<KeyId>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &KeyId {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Vertex/index interval a direct draw covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrawShard {
    pub vertex_offset: u32,
    pub vertex_count: u32,
    pub index_offset: u32,
    pub index_count: u32,
}

impl DrawShard {
    pub fn element_count(&self, indexed: bool) -> u32 {
        if indexed {
            self.index_count
        } else {
            self.vertex_count
        }
    }
}

/// Index interval into a shared indirect buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawRange {
    pub first: u32,
    pub count: u32,
}

/// State shared by every command kind.
pub struct CommandCommon {
    pub setting: Arc<RenderSetting>,
    pub binding: ResourceBinding,
    pub stage: StageId,
    pub uniform_groups: Vec<UniformBatchGroup>,
}

/// Type-specific command payload.
pub enum RenderCommandKind {
    /// One direct draw.
    Draw {
        resource: VertexResourceId,
        topology: PrimitiveTopology,
        shard: DrawShard,
        instance_count: u32,
        base_instance: u32,
        indexed: bool,
    },
    /// One multi-draw-indirect call over a command interval.
    MultiDraw {
        resource: VertexResourceId,
        buffer: IndirectBufferId,
        range: DrawRange,
        byte_offset: u64,
        stride: u32,
        indexed: bool,
    },
    /// One compute dispatch.
    Compute { dispatch: ComputeDispatch },
    /// A raw command closure (function flow).
    Function {
        run: Arc<dyn Fn(&mut dyn GraphicsDriver) + Send + Sync>,
    },
}

pub struct RenderCommand {
    pub common: CommandCommon,
    pub kind: RenderCommandKind,
}

impl core::fmt::Debug for RenderCommand {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match &self.kind {
            RenderCommandKind::Draw { .. } => "Draw",
            RenderCommandKind::MultiDraw { .. } => "MultiDraw",
            RenderCommandKind::Compute { .. } => "Compute",
            RenderCommandKind::Function { .. } => "Function",
        };
        f.debug_struct("RenderCommand")
            .field("kind", &kind)
            .finish_non_exhaustive()
    }
}

impl RenderCommand {
    /// Degenerate commands are skipped silently rather than issued.
    pub fn is_valid(&self) -> bool {
        match &self.kind {
            RenderCommandKind::Draw {
                shard,
                instance_count,
                indexed,
                ..
            } => *instance_count > 0 && shard.element_count(*indexed) > 0,
            RenderCommandKind::MultiDraw { range, .. } => range.count > 0,
            RenderCommandKind::Compute { dispatch } => {
                dispatch.workgroups.iter().all(|&count| count > 0)
            }
            RenderCommandKind::Function { .. } => true,
        }
    }

    /// The vertex resource this command draws from, when it has one.
    pub fn vertex_resource(&self) -> Option<VertexResourceId> {
        match &self.kind {
            RenderCommandKind::Draw { resource, .. }
            | RenderCommandKind::MultiDraw { resource, .. } => Some(*resource),
            RenderCommandKind::Compute { .. } | RenderCommandKind::Function { .. } => None,
        }
    }

    fn execute(&self, driver: &mut dyn GraphicsDriver) {
        driver.apply_setting(&self.common.setting, self.common.binding);
        for group in &self.common.uniform_groups {
            driver.apply_uniforms(group.snapshot());
        }

        match &self.kind {
            RenderCommandKind::Draw {
                topology,
                shard,
                instance_count,
                base_instance,
                indexed,
                ..
            } => {
                driver.draw(*topology, *shard, *instance_count, *base_instance, *indexed);
            }
            RenderCommandKind::MultiDraw {
                buffer,
                range,
                byte_offset,
                stride,
                indexed,
                ..
            } => {
                driver.multi_draw_indirect(*buffer, *byte_offset, range.count, *stride, *indexed);
            }
            RenderCommandKind::Compute { dispatch } => {
                (dispatch.run)(driver);
                driver.dispatch(dispatch.workgroups);
            }
            RenderCommandKind::Function { run } => {
                run(driver);
            }
        }
    }
}

/// Result of a queue run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueRunStats {
    pub executed: u32,
    pub skipped_invalid: u32,
    pub resource_binds: u32,
}

impl QueueRunStats {
    fn merge(&mut self, other: QueueRunStats) {
        self.executed += other.executed;
        self.skipped_invalid += other.skipped_invalid;
        self.resource_binds += other.resource_binds;
    }
}

/// Stage machine over an ordered list of discovered stage ids.
///
/// Stage order is discovery order: the order of first `add_command` per
/// stage. Range queries over unknown stage ids are no-ops.
pub struct RenderCommandQueue {
    stages: IndexMap<StageId, Vec<RenderCommand>, ahash::RandomState>,
}

impl RenderCommandQueue {
    pub fn new() -> Self {
        Self {
            stages: IndexMap::default(),
        }
    }

    pub fn add_command(&mut self, command: RenderCommand) {
        self.stages
            .entry(command.common.stage.clone())
            .or_default()
            .push(command);
    }

    pub fn stage_order(&self) -> impl Iterator<Item = &StageId> {
        self.stages.keys()
    }

    pub fn command_count(&self) -> usize {
        self.stages.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.values().all(Vec::is_empty)
    }

    /// Execute every stage in discovery order.
    pub fn execute_all(&self, driver: &mut dyn GraphicsDriver) -> QueueRunStats {
        profile_function!();
        let mut stats = QueueRunStats::default();
        for commands in self.stages.values() {
            stats.merge(Self::execute_commands(commands, driver));
        }
        stats
    }

    /// Execute a single stage; no-op for unknown stage ids.
    pub fn execute_stage(&self, stage: &StageId, driver: &mut dyn GraphicsDriver) -> QueueRunStats {
        match self.stages.get(stage) {
            Some(commands) => Self::execute_commands(commands, driver),
            None => QueueRunStats::default(),
        }
    }

    /// Execute the half-open stage interval `[from, to)`; no-op when either
    /// id is unknown.
    pub fn execute_stages_between(
        &self,
        from: &StageId,
        to: &StageId,
        driver: &mut dyn GraphicsDriver,
    ) -> QueueRunStats {
        let (Some(start), Some(end)) = (
            self.stages.get_index_of(from),
            self.stages.get_index_of(to),
        ) else {
            return QueueRunStats::default();
        };
        self.execute_index_range(start, end, driver)
    }

    /// Execute every stage before `stage` (exclusive); no-op when unknown.
    pub fn execute_stages_before(
        &self,
        stage: &StageId,
        driver: &mut dyn GraphicsDriver,
    ) -> QueueRunStats {
        match self.stages.get_index_of(stage) {
            Some(end) => self.execute_index_range(0, end, driver),
            None => QueueRunStats::default(),
        }
    }

    /// Execute every stage after `stage` (exclusive); no-op when unknown.
    pub fn execute_stages_after(
        &self,
        stage: &StageId,
        driver: &mut dyn GraphicsDriver,
    ) -> QueueRunStats {
        match self.stages.get_index_of(stage) {
            Some(start) => self.execute_index_range(start + 1, self.stages.len(), driver),
            None => QueueRunStats::default(),
        }
    }

    /// Drop all commands, keeping stage discovery order intact across
    /// frames.
    pub fn clear(&mut self) {
        for commands in self.stages.values_mut() {
            commands.clear();
        }
    }

    fn execute_index_range(
        &self,
        start: usize,
        end: usize,
        driver: &mut dyn GraphicsDriver,
    ) -> QueueRunStats {
        let mut stats = QueueRunStats::default();
        for index in start..end {
            if let Some((_, commands)) = self.stages.get_index(index) {
                stats.merge(Self::execute_commands(commands, driver));
            }
        }
        stats
    }

    /// Execute one stage's commands grouped by vertex resource, binding
    /// each resource once per group. Group order and in-group order are
    /// insertion order.
    fn execute_commands(commands: &[RenderCommand], driver: &mut dyn GraphicsDriver) -> QueueRunStats {
        let mut stats = QueueRunStats::default();

        let mut groups: IndexMap<Option<VertexResourceId>, Vec<&RenderCommand>, ahash::RandomState> =
            IndexMap::default();
        for command in commands {
            if !command.is_valid() {
                stats.skipped_invalid += 1;
                tracing::trace!("skipping invalid render command");
                continue;
            }
            groups
                .entry(command.vertex_resource())
                .or_default()
                .push(command);
        }

        for (resource, group) in groups {
            if let Some(resource) = resource {
                driver.bind_vertex_resource(resource);
                stats.resource_binds += 1;
            }
            for command in group {
                command.execute(driver);
                stats.executed += 1;
            }
        }

        stats
    }
}

impl Default for RenderCommandQueue {
    fn default() -> Self {
        Self::new()
    }
}
