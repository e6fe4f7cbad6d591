//! Rasterization flow: packs batches into vertex resources and indirect
//! draw lists.
//!
//! Command generation walks the organized batches once. Batches sharing a
//! [`VertexBufferKey`] pack into one vertex resource and one indirect
//! buffer; per-key cursors assign dynamic-mesh offsets in emission order, so
//! an instance that went invisible since collection consumes no offset
//! space. Non-instanced batches append one indirect command per visible
//! instance and draw the whole run with a single multi-draw; instanced
//! batches append exactly one command covering every visible instance.

use std::sync::Arc;

use indexmap::IndexMap;
use lumenflow_core::profiling::profile_function;

use crate::batch::{BatchContainer, RenderBatch};
use crate::command::{CommandCommon, RenderCommand, RenderCommandKind, StageId};
use crate::flow::{
    CollectContext, CommandsBySetting, FlowError, RenderFlowContext, RenderFlowStrategy,
    RenderFlowType,
};
use crate::instance::{GraphicsInstance, InstanceInfo, RasterizationInstanceInfo};
use crate::mesh::MeshSource;
use crate::resource::{
    RenderPostProcessor, VertexResourceId, VertexUploadProcessor, VertexWriter,
};
use crate::setting::{RenderSetting, ResourceBinding, VertexBufferKey};

/// Extract the per-frame rasterization info for one instance.
///
/// Returns `None` for instances that are invisible or meshless; both are
/// normal and logged at trace level only.
pub fn collect_rasterization_info(
    instance: &Arc<dyn GraphicsInstance>,
    setting: &Arc<RenderSetting>,
) -> Option<InstanceInfo> {
    if !instance.should_render() {
        return None;
    }
    let mesh = instance.mesh()?;
    let shader = instance.shader_provider();

    // The shader's binding wins over the setting's default when present.
    let binding = shader
        .as_ref()
        .map(|provider| provider.resource_binding())
        .filter(|binding| *binding != ResourceBinding::NONE)
        .unwrap_or(setting.binding);

    let (vertex_offset, index_offset) = mesh.baked_offsets().unwrap_or((0, 0));

    Some(InstanceInfo::Rasterization(RasterizationInstanceInfo {
        id: instance.identifier(),
        instance: instance.clone(),
        setting: setting.clone(),
        binding,
        transform: instance.world_transform(),
        vertex_count: mesh.vertex_count,
        index_count: mesh.index_count,
        vertex_offset,
        index_offset,
        writer: instance.instance_writer(),
        shader,
        mesh,
    }))
}

/// Per-key packing state shared by every batch under one vertex-buffer key.
struct KeyPack {
    resource: VertexResourceId,
    builder: Option<VertexWriter>,
    vertex_cursor: u32,
    index_cursor: u32,
    instance_cursor: u32,
}

impl KeyPack {
    fn new(resource: VertexResourceId) -> Self {
        Self {
            resource,
            builder: None,
            vertex_cursor: 0,
            index_cursor: 0,
            instance_cursor: 0,
        }
    }
}

fn fill_mismatch(info: &RasterizationInstanceInfo, written: u32) -> FlowError {
    FlowError::CommandGeneration {
        flow: RenderFlowType::rasterization(),
        message: format!(
            "dynamic mesh fill for {} wrote {} vertices, declared {}",
            info.id, written, info.vertex_count
        ),
    }
}

/// Run one batch's dynamic-mesh fills into the pack's builder, off-thread
/// when the workload clears the vertex-fill threshold.
///
/// Pooled fills write into per-instance scratch writers and are appended in
/// emission order, so the packed bytes match the inline path exactly.
fn fill_dynamic(
    fills: &[&RasterizationInstanceInfo],
    pack: &mut KeyPack,
    ctx: &mut RenderFlowContext<'_>,
    estimate: u32,
) -> Result<(), FlowError> {
    let Some(first) = fills.first() else {
        return Ok(());
    };
    let parameter = first.setting.parameter;
    let builder = pack
        .builder
        .get_or_insert_with(|| ctx.resources.create_builder(&parameter, estimate));

    let pooled = ctx
        .pool
        .filter(|_| ctx.prep.use_pool(ctx.prep.vertex_fill, fills.len()));
    match pooled {
        Some(pool) => {
            let stride = builder.stride();
            let tasks: Vec<_> = fills
                .iter()
                .map(|info| {
                    let mesh = info.mesh.clone();
                    let transform = info.transform;
                    let capacity = info.vertex_count;
                    pool.spawn(async move {
                        let mut scratch = VertexWriter::with_capacity(stride, capacity);
                        if let MeshSource::Dynamic { fill } = &mesh.source {
                            fill.fill(&mut scratch, &transform);
                        }
                        scratch
                    })
                })
                .collect();
            for (info, task) in fills.iter().zip(tasks) {
                let scratch = pollster::block_on(task);
                if scratch.element_count() != info.vertex_count {
                    return Err(fill_mismatch(info, scratch.element_count()));
                }
                builder.put_bytes(scratch.bytes());
            }
        }
        None => {
            for info in fills {
                let before = builder.element_count();
                if let MeshSource::Dynamic { fill } = &info.mesh.source {
                    fill.fill(builder, &info.transform);
                }
                let written = builder.element_count() - before;
                if written != info.vertex_count {
                    return Err(fill_mismatch(info, written));
                }
            }
        }
    }
    Ok(())
}

fn push_command(
    commands: &mut CommandsBySetting,
    batch: &RenderBatch,
    stage: &StageId,
    binding: ResourceBinding,
    kind: RenderCommandKind,
) {
    let setting = batch.setting().clone();
    commands.entry(setting.clone()).or_default().push(RenderCommand {
        common: CommandCommon {
            setting,
            binding,
            stage: stage.clone(),
            uniform_groups: batch.uniform_groups().to_vec(),
        },
        kind,
    });
}

/// Non-instanced batch: one indirect command per visible instance, drawn
/// with one multi-draw over the appended run.
fn emit_per_instance(
    batch: &RenderBatch,
    stage: &StageId,
    key: VertexBufferKey,
    pack: &mut KeyPack,
    ctx: &mut RenderFlowContext<'_>,
    commands: &mut CommandsBySetting,
) -> Result<(), FlowError> {
    let indexed = key.parameter.indexed;
    let estimate: u32 = batch
        .members()
        .iter()
        .filter_map(|member| match member {
            InstanceInfo::Rasterization(info) => Some(info.vertex_count),
            _ => None,
        })
        .sum();

    let mut binding = ResourceBinding::NONE;
    let mut packed = Vec::with_capacity(batch.len());
    let mut fills: Vec<&RasterizationInstanceInfo> = Vec::new();
    for member in batch.members() {
        let InstanceInfo::Rasterization(info) = member else {
            continue;
        };
        // Visibility re-checked at emission: instances that went invisible
        // since collection are skipped and consume no offset space.
        if !info.instance.should_render() {
            continue;
        }
        if packed.is_empty() {
            binding = info.binding;
        }
        let offsets = match info.mesh.baked_offsets() {
            Some(offsets) => offsets,
            None => {
                let offsets = (pack.vertex_cursor, pack.index_cursor);
                pack.vertex_cursor += info.vertex_count;
                pack.index_cursor += info.index_count;
                fills.push(info);
                offsets
            }
        };
        packed.push((info, offsets));
    }

    fill_dynamic(&fills, pack, ctx, estimate)?;

    let indirect = ctx.indirect.get_or_create(key);
    let mark = indirect.mark();
    for (info, (vertex_offset, index_offset)) in packed {
        if indexed {
            indirect.push_indexed(info.index_count, 1, index_offset, vertex_offset as i32, 0);
        } else {
            indirect.push_draw(info.vertex_count, 1, vertex_offset, 0);
        }
    }

    let range = indirect.range_since(mark);
    if range.count == 0 {
        return Ok(());
    }
    push_command(
        commands,
        batch,
        stage,
        binding,
        RenderCommandKind::MultiDraw {
            resource: pack.resource,
            buffer: indirect.id(),
            range,
            byte_offset: indirect.byte_offset(range.first),
            stride: indirect.stride(),
            indexed,
        },
    );
    Ok(())
}

/// Instanced batch: per-instance attribute data for every visible member,
/// covered by exactly one indirect command.
fn emit_instanced(
    batch: &RenderBatch,
    stage: &StageId,
    key: VertexBufferKey,
    pack: &mut KeyPack,
    ctx: &mut RenderFlowContext<'_>,
    commands: &mut CommandsBySetting,
) -> Result<(), FlowError> {
    let parameter = key.parameter;
    let estimate = batch.len() as u32;

    let mut lead: Option<&RasterizationInstanceInfo> = None;
    let mut instance_count = 0u32;
    for member in batch.members() {
        let InstanceInfo::Rasterization(info) = member else {
            continue;
        };
        if !info.instance.should_render() {
            continue;
        }
        if lead.is_none() {
            lead = Some(info);
        }
        if let Some(writer) = &info.writer {
            let builder = pack
                .builder
                .get_or_insert_with(|| ctx.resources.create_builder(&parameter, estimate));
            writer.write_instance(builder, &info.transform);
        }
        instance_count += 1;
    }
    let Some(lead) = lead else {
        return Ok(());
    };

    let base_instance = pack.instance_cursor;
    pack.instance_cursor += instance_count;

    // Dynamic template geometry owns its per-key resource; its draw starts
    // at offset zero. Baked templates keep their fixed offsets.
    let (vertex_offset, index_offset) = lead.mesh.baked_offsets().unwrap_or((0, 0));

    let indirect = ctx.indirect.get_or_create(key);
    let mark = indirect.mark();
    if parameter.indexed {
        indirect.push_indexed(
            lead.index_count,
            instance_count,
            index_offset,
            vertex_offset as i32,
            base_instance,
        );
    } else {
        indirect.push_draw(lead.vertex_count, instance_count, vertex_offset, base_instance);
    }

    let range = indirect.range_since(mark);
    push_command(
        commands,
        batch,
        stage,
        lead.binding,
        RenderCommandKind::MultiDraw {
            resource: pack.resource,
            buffer: indirect.id(),
            range,
            byte_offset: indirect.byte_offset(range.first),
            stride: indirect.stride(),
            indexed: parameter.indexed,
        },
    );
    Ok(())
}

/// Strategy for the rasterization flow.
pub struct RasterizationFlowStrategy;

impl RasterizationFlowStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RasterizationFlowStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderFlowStrategy for RasterizationFlowStrategy {
    fn flow_type(&self) -> RenderFlowType {
        RenderFlowType::rasterization()
    }

    fn collect_instance_info(
        &self,
        instance: &Arc<dyn GraphicsInstance>,
        setting: &Arc<RenderSetting>,
        _ctx: &CollectContext,
    ) -> Option<InstanceInfo> {
        collect_rasterization_info(instance, setting)
    }

    fn create_render_commands(
        &self,
        container: &mut BatchContainer,
        stage: StageId,
        ctx: &mut RenderFlowContext<'_>,
        post_processors: &mut Vec<Box<dyn RenderPostProcessor>>,
    ) -> Result<CommandsBySetting, FlowError> {
        profile_function!();
        container.ensure_organized();

        let mut packs: IndexMap<VertexBufferKey, KeyPack, ahash::RandomState> =
            IndexMap::default();
        let mut commands = CommandsBySetting::default();

        for batch in container.batches() {
            let key = VertexBufferKey::new(batch.setting().parameter, batch.source());
            if !packs.contains_key(&key) {
                let resource = ctx.resources.get(&key);
                packs.insert(key, KeyPack::new(resource));
            }
            let pack = &mut packs[&key];

            if key.parameter.instanced {
                emit_instanced(batch, &stage, key, pack, ctx, &mut commands)?;
            } else {
                emit_per_instance(batch, &stage, key, pack, ctx, &mut commands)?;
            }
        }

        for pack in packs.values_mut() {
            if let Some(builder) = &mut pack.builder {
                if builder.written() {
                    post_processors.push(Box::new(VertexUploadProcessor::new(
                        pack.resource,
                        builder.take(),
                    )));
                }
            }
        }

        tracing::trace!(
            batches = container.batch_count(),
            resources = packs.len(),
            "generated rasterization commands"
        );
        Ok(commands)
    }

    fn supports_parallel(&self) -> bool {
        true
    }
}
