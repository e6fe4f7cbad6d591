//! Function flow: raw command closures run against the driver facade.
//!
//! Escape hatch for work that fits neither rasterization nor compute
//! (blits, readbacks, one-off state scrubs). Instances supply a closure; the
//! flow wraps each visible one in a command, preserving registration order
//! within the stage. No batching, no packing.

use std::sync::Arc;

use crate::batch::BatchContainer;
use crate::command::{CommandCommon, RenderCommand, RenderCommandKind, StageId};
use crate::flow::{
    CollectContext, CommandsBySetting, FlowError, RenderFlowContext, RenderFlowStrategy,
    RenderFlowType,
};
use crate::instance::{FunctionInstanceInfo, GraphicsInstance, InstanceInfo};
use crate::resource::RenderPostProcessor;
use crate::setting::RenderSetting;

pub struct FunctionFlowStrategy;

impl FunctionFlowStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FunctionFlowStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderFlowStrategy for FunctionFlowStrategy {
    fn flow_type(&self) -> RenderFlowType {
        RenderFlowType::function()
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
        let run = instance.raw_commands()?;
        Some(InstanceInfo::Function(FunctionInstanceInfo {
            id: instance.identifier(),
            instance: instance.clone(),
            setting: setting.clone(),
            run,
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
                let InstanceInfo::Function(info) = member else {
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
                            binding: info.setting.binding,
                            stage: stage.clone(),
                            uniform_groups: Vec::new(),
                        },
                        kind: RenderCommandKind::Function {
                            run: info.run.clone(),
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
