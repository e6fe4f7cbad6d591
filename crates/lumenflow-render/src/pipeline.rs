//! Frame orchestration: the flow driver.
//!
//! Owns the frozen strategy registry, the per-flow batch containers, the
//! indirect buffer registry, and the command queue, and walks one frame
//! through its phases:
//!
//! 1. `begin_frame` - tick instances (on the task pool when the workload
//!    clears the configured threshold), sweep discarded instances,
//!    re-collect instance infos into the containers, and rebuild their
//!    batches.
//! 2. `generate_commands` - run every strategy; a strategy error drops that
//!    container's commands for the frame and is logged, never propagated.
//! 3. `execute` - flush post-processors and indirect uploads, then run the
//!    queue in stage order.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use indexmap::IndexMap;
use lumenflow_core::profiling::profile_function;
use lumenflow_core::{AsyncPrepConfig, KeyId, TaskPool};

use crate::batch::BatchContainer;
use crate::command::{QueueRunStats, RenderCommandQueue, StageId};
use crate::driver::GraphicsDriver;
use crate::flow::{CollectContext, RenderFlowContext, RenderFlowRegistry, RenderFlowType};
use crate::indirect::IndirectBufferRegistry;
use crate::instance::{GraphicsInstance, TickContext};
use crate::resource::{RenderPostProcessor, VertexResourceManager};
use crate::setting::RenderSetting;

#[derive(Debug)]
pub enum FlowDriverError {
    /// No strategy is registered for the requested flow type.
    UnknownFlow(RenderFlowType),
}

impl std::fmt::Display for FlowDriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownFlow(flow) => write!(f, "No strategy registered for flow {}", flow),
        }
    }
}

impl std::error::Error for FlowDriverError {}

/// Counters for one frame, reset at `begin_frame`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowFrameStats {
    pub frame: u64,
    /// Instances on the roster after the discard sweep.
    pub registered: usize,
    /// Instance infos collected into containers this frame.
    pub collected: usize,
    pub ticked: u32,
    pub tick_panics: u32,
    /// Commands queued after generation.
    pub commands: usize,
    pub indirect_uploads: u32,
    pub queue: QueueRunStats,
}

struct RegisteredInstance {
    flow: RenderFlowType,
    stage: StageId,
    instance: Arc<dyn GraphicsInstance>,
    setting: Arc<RenderSetting>,
}

/// Drives registered instances through collection, command generation, and
/// execution, frame after frame.
pub struct FlowDriver {
    registry: RenderFlowRegistry,
    roster: IndexMap<KeyId, RegisteredInstance, ahash::RandomState>,
    containers: IndexMap<(RenderFlowType, StageId), BatchContainer, ahash::RandomState>,
    queue: RenderCommandQueue,
    indirect: IndirectBufferRegistry,
    resources: Box<dyn VertexResourceManager>,
    post_processors: Vec<Box<dyn RenderPostProcessor>>,
    prep: AsyncPrepConfig,
    pool: Option<TaskPool>,
    frame: u64,
    stats: FlowFrameStats,
}

impl FlowDriver {
    /// Build a driver over a frozen registry.
    pub fn new(
        registry: RenderFlowRegistry,
        resources: Box<dyn VertexResourceManager>,
        prep: AsyncPrepConfig,
    ) -> Self {
        debug_assert!(registry.is_frozen(), "registry must be initialized first");
        let pool = if prep.enabled {
            Some(TaskPool::new(prep.threads.max(1)))
        } else {
            None
        };
        Self {
            registry,
            roster: IndexMap::default(),
            containers: IndexMap::default(),
            queue: RenderCommandQueue::new(),
            indirect: IndirectBufferRegistry::new(),
            resources,
            post_processors: Vec::new(),
            prep,
            pool,
            frame: 0,
            stats: FlowFrameStats::default(),
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn stats(&self) -> FlowFrameStats {
        self.stats
    }

    pub fn instance_count(&self) -> usize {
        self.roster.len()
    }

    /// Register an instance under a flow and stage.
    pub fn register(
        &mut self,
        flow: RenderFlowType,
        stage: StageId,
        instance: Arc<dyn GraphicsInstance>,
        setting: Arc<RenderSetting>,
    ) -> Result<(), FlowDriverError> {
        if !self.registry.has_strategy(&flow) {
            return Err(FlowDriverError::UnknownFlow(flow));
        }
        let id = instance.identifier();
        // Re-registration may move the instance to another flow or stage;
        // its info must not survive in the previous container.
        if self.roster.contains_key(&id) {
            for container in self.containers.values_mut() {
                container.unregister_instance(&id);
            }
        }
        tracing::debug!(instance = %id, flow = %flow, stage = %stage, "registered instance");
        self.roster.insert(
            id,
            RegisteredInstance {
                flow,
                stage,
                instance,
                setting,
            },
        );
        Ok(())
    }

    pub fn unregister(&mut self, id: &KeyId) {
        if self.roster.shift_remove(id).is_some() {
            for container in self.containers.values_mut() {
                container.unregister_instance(id);
            }
        }
    }

    /// Tick, sweep, re-collect, and reorganize. Call once at the top of
    /// every frame.
    pub fn begin_frame(&mut self, delta_seconds: f32) {
        profile_function!();
        lumenflow_core::profiling::new_frame();
        self.frame += 1;
        self.stats = FlowFrameStats {
            frame: self.frame,
            ..FlowFrameStats::default()
        };

        self.tick_instances(delta_seconds);
        self.sweep_discarded();
        self.collect_infos();
        self.organize_containers();
        self.stats.registered = self.roster.len();
    }

    fn tick_instances(&mut self, delta_seconds: f32) {
        let ctx = TickContext {
            frame: self.frame,
            delta_seconds,
        };
        let tickable: Vec<Arc<dyn GraphicsInstance>> = self
            .roster
            .values()
            .filter(|entry| entry.instance.should_tick())
            .map(|entry| entry.instance.clone())
            .collect();
        if tickable.is_empty() {
            return;
        }

        let use_pool = self.prep.use_pool(self.prep.tick, tickable.len());
        let results: Vec<bool> = match (&self.pool, use_pool) {
            (Some(pool), true) => {
                let tasks: Vec<_> = tickable
                    .into_iter()
                    .map(|instance| {
                        pool.spawn(async move {
                            catch_unwind(AssertUnwindSafe(|| instance.tick(&ctx))).is_ok()
                        })
                    })
                    .collect();
                tasks.into_iter().map(pollster::block_on).collect()
            }
            _ => tickable
                .into_iter()
                .map(|instance| catch_unwind(AssertUnwindSafe(|| instance.tick(&ctx))).is_ok())
                .collect(),
        };

        for ok in results {
            if ok {
                self.stats.ticked += 1;
            } else {
                self.stats.tick_panics += 1;
            }
        }
        if self.stats.tick_panics > 0 {
            tracing::error!(
                panics = self.stats.tick_panics,
                frame = self.frame,
                "instance tick panicked; instance state may be stale"
            );
        }
    }

    fn sweep_discarded(&mut self) {
        let discarded: Vec<KeyId> = self
            .roster
            .iter()
            .filter(|(_, entry)| entry.instance.should_discard())
            .map(|(id, _)| id.clone())
            .collect();
        for id in discarded {
            tracing::debug!(instance = %id, "discarding instance");
            self.unregister(&id);
        }
        for container in self.containers.values_mut() {
            container.sweep_discarded();
        }
    }

    fn collect_infos(&mut self) {
        profile_function!();
        let ctx = CollectContext { frame: self.frame };

        // Containers for flows that opt out of persistent batching are
        // rebuilt from scratch.
        for ((flow, _), container) in self.containers.iter_mut() {
            match self.registry.strategy(flow) {
                Some(strategy) if !strategy.supports_batching() => container.clear(),
                _ => container.prepare_for_frame(),
            }
        }

        let use_pool = self
            .prep
            .use_pool(self.prep.instance_update, self.roster.len());

        let collected: Vec<(KeyId, RenderFlowType, StageId, Option<crate::instance::InstanceInfo>)> =
            match (&self.pool, use_pool) {
                (Some(pool), true) => {
                    let tasks: Vec<_> = self
                        .roster
                        .iter()
                        .filter_map(|(id, entry)| {
                            let strategy = self.registry.strategy(&entry.flow)?.clone();
                            let id = id.clone();
                            let flow = entry.flow.clone();
                            let stage = entry.stage.clone();
                            let instance = entry.instance.clone();
                            let setting = entry.setting.clone();
                            Some(pool.spawn(async move {
                                let info =
                                    strategy.collect_instance_info(&instance, &setting, &ctx);
                                (id, flow, stage, info)
                            }))
                        })
                        .collect();
                    tasks.into_iter().map(pollster::block_on).collect()
                }
                _ => self
                    .roster
                    .iter()
                    .filter_map(|(id, entry)| {
                        let strategy = self.registry.strategy(&entry.flow)?;
                        let info =
                            strategy.collect_instance_info(&entry.instance, &entry.setting, &ctx);
                        Some((id.clone(), entry.flow.clone(), entry.stage.clone(), info))
                    })
                    .collect(),
            };

        for (id, flow, stage, info) in collected {
            let container = self
                .containers
                .entry((flow.clone(), stage))
                .or_insert_with(|| BatchContainer::new(flow));
            match info {
                Some(info) => {
                    container.register_instance(info);
                    self.stats.collected += 1;
                }
                // Invisible or incomplete this frame; stale info must not
                // linger in the container.
                None => container.unregister_instance(&id),
            }
        }
    }

    /// Rebuild every container's batches, deriving uniform groups on the
    /// pool when a parallel-capable flow's container clears the
    /// uniform-collect threshold.
    fn organize_containers(&mut self) {
        profile_function!();
        for ((flow, _), container) in self.containers.iter_mut() {
            let pooled = self.pool.as_ref().filter(|_| {
                self.registry
                    .strategy(flow)
                    .is_some_and(|strategy| strategy.supports_parallel())
                    && self
                        .prep
                        .use_pool(self.prep.uniform_collect, container.instance_count())
            });
            match pooled {
                Some(pool) => container.ensure_organized_on(pool),
                None => container.ensure_organized(),
            }
        }
    }

    /// Run every strategy and fill the command queue.
    ///
    /// A strategy error drops that container's commands for this frame; the
    /// error is logged and the remaining containers still run.
    pub fn generate_commands(&mut self) {
        profile_function!();
        self.queue.clear();
        self.indirect.clear_all();
        self.post_processors.clear();

        for ((flow, stage), container) in self.containers.iter_mut() {
            let Some(strategy) = self.registry.strategy(flow) else {
                continue;
            };
            let mut ctx = RenderFlowContext {
                resources: self.resources.as_mut(),
                indirect: &mut self.indirect,
                pool: self
                    .pool
                    .as_ref()
                    .filter(|_| strategy.supports_parallel()),
                prep: self.prep,
                frame: self.frame,
            };
            match strategy.create_render_commands(
                container,
                stage.clone(),
                &mut ctx,
                &mut self.post_processors,
            ) {
                Ok(by_setting) => {
                    for command in by_setting.into_values().flatten() {
                        self.queue.add_command(command);
                    }
                }
                Err(error) => {
                    tracing::error!(
                        flow = %flow,
                        stage = %stage,
                        %error,
                        "command generation failed; dropping this container's commands"
                    );
                }
            }
        }
        self.stats.commands = self.queue.command_count();
    }

    /// Flush uploads and execute the queue in stage order.
    pub fn execute(&mut self, driver: &mut dyn GraphicsDriver) -> FlowFrameStats {
        profile_function!();
        for processor in &mut self.post_processors {
            processor.run(driver);
        }
        self.post_processors.clear();
        self.stats.indirect_uploads = self.indirect.upload_touched(driver);
        self.stats.queue = self.queue.execute_all(driver);
        self.stats
    }

    /// Convenience: one whole frame.
    pub fn run_frame(&mut self, delta_seconds: f32, driver: &mut dyn GraphicsDriver) -> FlowFrameStats {
        self.begin_frame(delta_seconds);
        self.generate_commands();
        self.execute(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute_flow::ComputeFlowStrategy;
    use crate::function_flow::FunctionFlowStrategy;
    use crate::raster::RasterizationFlowStrategy;
    use crate::testing::{
        DriverCall, RecordingDriver, SimpleVertexResourceManager, TestInstance, test_setting,
    };

    fn driver_with_all_flows(prep: AsyncPrepConfig) -> FlowDriver {
        let mut registry = RenderFlowRegistry::new();
        registry
            .register(Arc::new(RasterizationFlowStrategy::new()))
            .unwrap();
        registry
            .register(Arc::new(ComputeFlowStrategy::new()))
            .unwrap();
        registry
            .register(Arc::new(FunctionFlowStrategy::new()))
            .unwrap();
        registry.init(&mut []).unwrap();
        FlowDriver::new(registry, Box::new(SimpleVertexResourceManager::new()), prep)
    }

    #[test]
    fn test_register_unknown_flow_fails() {
        let mut registry = RenderFlowRegistry::new();
        registry
            .register(Arc::new(RasterizationFlowStrategy::new()))
            .unwrap();
        registry.init(&mut []).unwrap();
        let mut driver = FlowDriver::new(
            registry,
            Box::new(SimpleVertexResourceManager::new()),
            AsyncPrepConfig::disabled(),
        );

        let err = driver
            .register(
                RenderFlowType::compute(),
                StageId::new("compute"),
                Arc::new(TestInstance::new("c").with_dispatch([1, 1, 1])),
                test_setting(false, false),
            )
            .unwrap_err();
        assert!(matches!(err, FlowDriverError::UnknownFlow(_)));
    }

    #[test]
    fn test_full_frame_draws_and_uploads() {
        let mut flow_driver = driver_with_all_flows(AsyncPrepConfig::disabled());
        let setting = test_setting(false, false);
        for name in ["a", "b"] {
            flow_driver
                .register(
                    RenderFlowType::rasterization(),
                    StageId::new("main"),
                    Arc::new(TestInstance::new(name).with_dynamic_mesh(6, 0)),
                    setting.clone(),
                )
                .unwrap();
        }

        let mut gpu = RecordingDriver::new();
        let stats = flow_driver.run_frame(0.016, &mut gpu);

        assert_eq!(stats.frame, 1);
        assert_eq!(stats.collected, 2);
        assert_eq!(stats.commands, 1);
        assert_eq!(stats.indirect_uploads, 1);
        assert_eq!(stats.queue.executed, 1);
        assert_eq!(gpu.count_draws(), 1);

        let vertex_uploads = gpu
            .calls()
            .iter()
            .filter(|call| matches!(call, DriverCall::UploadVertexData { .. }))
            .count();
        assert_eq!(vertex_uploads, 1);
    }

    #[test]
    fn test_ticking_and_discard_sweep() {
        let mut flow_driver = driver_with_all_flows(AsyncPrepConfig::disabled());
        let setting = test_setting(false, false);
        let kept = Arc::new(TestInstance::new("kept").with_dynamic_mesh(3, 0).tickable());
        let doomed = Arc::new(
            TestInstance::new("doomed")
                .with_dynamic_mesh(3, 0)
                .discarded(),
        );
        for instance in [kept.clone(), doomed] {
            flow_driver
                .register(
                    RenderFlowType::rasterization(),
                    StageId::new("main"),
                    instance,
                    setting.clone(),
                )
                .unwrap();
        }

        let mut gpu = RecordingDriver::new();
        let stats = flow_driver.run_frame(0.016, &mut gpu);
        assert_eq!(stats.ticked, 1);
        assert_eq!(kept.tick_count(), 1);
        assert_eq!(flow_driver.instance_count(), 1);
    }

    #[test]
    fn test_tick_panic_is_isolated() {
        let mut flow_driver = driver_with_all_flows(AsyncPrepConfig::disabled());
        let setting = test_setting(false, false);
        let healthy = Arc::new(TestInstance::new("ok").with_dynamic_mesh(3, 0).tickable());
        let broken = Arc::new(
            TestInstance::new("broken")
                .with_dynamic_mesh(3, 0)
                .panicking_tick(),
        );
        for instance in [healthy.clone() as Arc<dyn GraphicsInstance>, broken] {
            flow_driver
                .register(
                    RenderFlowType::rasterization(),
                    StageId::new("main"),
                    instance,
                    setting.clone(),
                )
                .unwrap();
        }

        let mut gpu = RecordingDriver::new();
        let stats = flow_driver.run_frame(0.016, &mut gpu);
        assert_eq!(stats.ticked, 1);
        assert_eq!(stats.tick_panics, 1);
        assert_eq!(healthy.tick_count(), 1);
        // Both still drew.
        assert_eq!(stats.queue.executed, 1);
    }

    #[test]
    fn test_visibility_toggles_across_frames() {
        let mut flow_driver = driver_with_all_flows(AsyncPrepConfig::disabled());
        let setting = test_setting(false, false);
        let blinker = Arc::new(TestInstance::new("blinker").with_dynamic_mesh(6, 0));
        flow_driver
            .register(
                RenderFlowType::rasterization(),
                StageId::new("main"),
                blinker.clone(),
                setting.clone(),
            )
            .unwrap();

        let mut gpu = RecordingDriver::new();
        assert_eq!(flow_driver.run_frame(0.016, &mut gpu).queue.executed, 1);

        blinker.set_visible(false);
        let mut gpu = RecordingDriver::new();
        assert_eq!(flow_driver.run_frame(0.016, &mut gpu).queue.executed, 0);

        blinker.set_visible(true);
        let mut gpu = RecordingDriver::new();
        assert_eq!(flow_driver.run_frame(0.016, &mut gpu).queue.executed, 1);
    }

    #[test]
    fn test_reregistered_instance_draws_once_in_new_stage() {
        let mut flow_driver = driver_with_all_flows(AsyncPrepConfig::disabled());
        let setting = test_setting(false, false);
        let mover = Arc::new(TestInstance::new("mover").with_dynamic_mesh(6, 0));
        flow_driver
            .register(
                RenderFlowType::rasterization(),
                StageId::new("early"),
                mover.clone(),
                setting.clone(),
            )
            .unwrap();

        let mut gpu = RecordingDriver::new();
        assert_eq!(flow_driver.run_frame(0.016, &mut gpu).queue.executed, 1);
        assert_eq!(gpu.count_draws(), 1);

        // Moving the instance to another stage must not leave its old info
        // behind in the "early" container.
        flow_driver
            .register(
                RenderFlowType::rasterization(),
                StageId::new("late"),
                mover.clone(),
                setting.clone(),
            )
            .unwrap();

        let mut gpu = RecordingDriver::new();
        let stats = flow_driver.run_frame(0.016, &mut gpu);
        assert_eq!(flow_driver.instance_count(), 1);
        assert_eq!(stats.collected, 1);
        assert_eq!(stats.queue.executed, 1);
        assert_eq!(gpu.count_draws(), 1);
    }

    #[test]
    fn test_pooled_prep_matches_inline_frame() {
        let pooled_prep = AsyncPrepConfig {
            enabled: true,
            threads: 2,
            tick: lumenflow_core::PrepCategory::new(true, 1),
            vertex_fill: lumenflow_core::PrepCategory::new(true, 1),
            uniform_collect: lumenflow_core::PrepCategory::new(true, 1),
            instance_update: lumenflow_core::PrepCategory::new(true, 1),
        };

        let run = |prep: AsyncPrepConfig| {
            let mut flow_driver = driver_with_all_flows(prep);
            let setting = test_setting(false, false);
            for i in 0..6 {
                flow_driver
                    .register(
                        RenderFlowType::rasterization(),
                        StageId::new("main"),
                        Arc::new(
                            TestInstance::new(&format!("i{}", i))
                                .with_dynamic_mesh(3, 0)
                                .tickable(),
                        ),
                        setting.clone(),
                    )
                    .unwrap();
            }
            let mut gpu = RecordingDriver::new();
            let stats = flow_driver.run_frame(0.016, &mut gpu);
            let uploaded: usize = gpu
                .calls()
                .iter()
                .filter_map(|call| match call {
                    DriverCall::UploadVertexData { bytes, .. } => Some(*bytes),
                    _ => None,
                })
                .sum();
            (stats.collected, stats.queue.executed, gpu.count_draws(), uploaded)
        };

        let inline = run(AsyncPrepConfig::disabled());
        let pooled = run(pooled_prep);
        assert_eq!(pooled, inline);
        assert_eq!(inline.0, 6);
        assert_eq!(inline.2, 1);
    }

    #[test]
    fn test_pooled_tick_matches_inline() {
        let prep = AsyncPrepConfig {
            enabled: true,
            threads: 2,
            tick: lumenflow_core::PrepCategory::new(true, 1),
            ..AsyncPrepConfig::default()
        };
        let mut flow_driver = driver_with_all_flows(prep);
        let setting = test_setting(false, false);
        let instances: Vec<Arc<TestInstance>> = (0..8)
            .map(|i| {
                Arc::new(
                    TestInstance::new(&format!("t{}", i))
                        .with_dynamic_mesh(3, 0)
                        .tickable(),
                )
            })
            .collect();
        for instance in &instances {
            flow_driver
                .register(
                    RenderFlowType::rasterization(),
                    StageId::new("main"),
                    instance.clone(),
                    setting.clone(),
                )
                .unwrap();
        }

        let mut gpu = RecordingDriver::new();
        let stats = flow_driver.run_frame(0.016, &mut gpu);
        assert_eq!(stats.ticked, 8);
        for instance in &instances {
            assert_eq!(instance.tick_count(), 1);
        }
    }
}
