//! Compute flow: dispatch commands without persistent batching.
//!
//! Compute instances carry their own bind closure and workgroup counts.
//! There is nothing to pack, so the flow opts out of persistent batch
//! maintenance; the container is rebuilt from live instances every frame and
//! each visible instance becomes one dispatch command.

use std::sync::Arc;

use crate::batch::BatchContainer;
use crate::command::{CommandCommon, RenderCommand, RenderCommandKind, StageId};
use crate::flow::{
    CollectContext, CommandsBySetting, FlowError, RenderFlowContext, RenderFlowStrategy,
    RenderFlowType,
};
use crate::instance::{ComputeInstanceInfo, GraphicsInstance, InstanceInfo};
use crate::resource::RenderPostProcessor;
use crate::setting::{RenderSetting, ResourceBinding};

pub struct ComputeFlowStrategy;

impl ComputeFlowStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ComputeFlowStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderFlowStrategy for ComputeFlowStrategy {
    fn flow_type(&self) -> RenderFlowType {
        RenderFlowType::compute()
    }

    fn collect_instance_info(
        &self,
        instance: &Arc<dyn GraphicsInstance>,
        setting: &Arc<RenderSetting>,
        _ctx: &CollectContext,
    ) -> Option<InstanceInfo> {
        if !instance.should_render() {
            return None;
        }
        let dispatch = instance.dispatch()?;
        let shader = instance.shader_provider();
        let binding = shader
            .as_ref()
            .map(|provider| provider.resource_binding())
            .filter(|binding| *binding != ResourceBinding::NONE)
            .unwrap_or(setting.binding);

        Some(InstanceInfo::Compute(ComputeInstanceInfo {
            id: instance.identifier(),
            instance: instance.clone(),
            setting: setting.clone(),
            binding,
            dispatch,
            shader,
        }))
    }

    fn create_render_commands(
        &self,
        container: &mut BatchContainer,
        stage: StageId,
        _ctx: &mut RenderFlowContext<'_>,
        _post_processors: &mut Vec<Box<dyn RenderPostProcessor>>,
    ) -> Result<CommandsBySetting, FlowError> {
        container.ensure_organized();

        let mut commands = CommandsBySetting::default();
        for batch in container.batches() {
            for member in batch.members() {
                let InstanceInfo::Compute(info) = member else {
                    continue;
                };
                if !info.instance.should_render() {
                    continue;
                }
                commands
                    .entry(info.setting.clone())
                    .or_default()
                    .push(RenderCommand {
                        common: CommandCommon {
                            setting: info.setting.clone(),
                            binding: info.binding,
                            stage: stage.clone(),
                            uniform_groups: batch.uniform_groups().to_vec(),
                        },
                        kind: RenderCommandKind::Compute {
                            dispatch: info.dispatch.clone(),
                        },
                    });
            }
        }
        Ok(commands)
    }

    fn supports_batching(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::GraphicsDriver;
    use crate::indirect::IndirectBufferRegistry;
    use crate::testing::{
        DriverCall, RecordingDriver, SimpleVertexResourceManager, TestInstance, test_setting,
    };

    fn collect(strategy: &ComputeFlowStrategy, instance: TestInstance) -> Option<InstanceInfo> {
        let instance: Arc<dyn GraphicsInstance> = Arc::new(instance);
        strategy.collect_instance_info(&instance, &test_setting(false, false), &CollectContext {
            frame: 1,
        })
    }

    #[test]
    fn test_collect_requires_dispatch() {
        let strategy = ComputeFlowStrategy::new();
        assert!(collect(&strategy, TestInstance::new("no-dispatch")).is_none());
        assert!(collect(&strategy, TestInstance::new("d").with_dispatch([4, 4, 1])).is_some());
    }

    #[test]
    fn test_one_command_per_visible_instance() {
        let strategy = ComputeFlowStrategy::new();
        let mut container = BatchContainer::new(RenderFlowType::compute());
        for name in ["a", "b"] {
            container.register_instance(
                collect(&strategy, TestInstance::new(name).with_dispatch([2, 2, 1])).unwrap(),
            );
        }

        let mut resources = SimpleVertexResourceManager::new();
        let mut indirect = IndirectBufferRegistry::new();
        let mut ctx = RenderFlowContext {
            resources: &mut resources,
            indirect: &mut indirect,
            pool: None,
            prep: lumenflow_core::AsyncPrepConfig::disabled(),
            frame: 1,
        };
        let mut post_processors = Vec::new();
        let commands = strategy
            .create_render_commands(
                &mut container,
                StageId::new("compute"),
                &mut ctx,
                &mut post_processors,
            )
            .unwrap();

        let list = commands.values().next().unwrap();
        assert_eq!(list.len(), 2);

        let mut driver = RecordingDriver::new();
        for command in list {
            assert!(command.is_valid());
        }
        for command in list {
            // Execute through the queue path indirectly: dispatch payloads
            // run their bind closure then the dispatch itself.
            match &command.kind {
                RenderCommandKind::Compute { dispatch } => {
                    (dispatch.run)(&mut driver);
                    driver.dispatch(dispatch.workgroups);
                }
                _ => panic!("expected compute command"),
            }
        }
        assert_eq!(driver.count_dispatches(), 2);
        assert!(matches!(driver.calls()[0], DriverCall::Dispatch([2, 2, 1])));
    }

    #[test]
    fn test_zero_workgroup_dispatch_is_invalid() {
        let strategy = ComputeFlowStrategy::new();
        let info = collect(&strategy, TestInstance::new("z").with_dispatch([0, 1, 1])).unwrap();
        let InstanceInfo::Compute(info) = info else {
            panic!("expected compute info");
        };
        let command = RenderCommand {
            common: CommandCommon {
                setting: info.setting.clone(),
                binding: info.binding,
                stage: StageId::new("compute"),
                uniform_groups: Vec::new(),
            },
            kind: RenderCommandKind::Compute {
                dispatch: info.dispatch,
            },
        };
        assert!(!command.is_valid());
    }
}
