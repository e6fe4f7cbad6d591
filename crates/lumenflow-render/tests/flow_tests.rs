//! End-to-end frame scenarios through the public API: registration,
//! collection, packing, upload, and stage-ordered execution against the
//! recording driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use glam::Vec4;
use lumenflow_core::AsyncPrepConfig;
use lumenflow_render::testing::{
    DriverCall, RecordingDriver, SimpleVertexResourceManager, TEST_STRIDE, TestInstance,
    TestShaderProvider, test_setting,
};
use lumenflow_render::{
    ComputeFlowStrategy, FlowDriver, FunctionFlowStrategy, GraphicsInstance,
    RasterizationFlowStrategy, RenderFlowRegistry, RenderFlowType, StageId, UniformHook,
    UniformValue,
};

fn new_driver() -> FlowDriver {
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
    FlowDriver::new(
        registry,
        Box::new(SimpleVertexResourceManager::new()),
        AsyncPrepConfig::disabled(),
    )
}

#[test]
fn test_instance_invisible_at_emission_leaves_no_gap() {
    let mut flow = new_driver();
    let setting = test_setting(false, false);

    let first = Arc::new(TestInstance::new("first").with_dynamic_mesh(6, 0));
    let hidden = Arc::new(TestInstance::new("hidden").with_dynamic_mesh(4, 0));
    let last = Arc::new(TestInstance::new("last").with_dynamic_mesh(5, 0));
    for instance in [first.clone(), hidden.clone(), last.clone()] {
        flow.register(
            RenderFlowType::rasterization(),
            StageId::new("main"),
            instance,
            setting.clone(),
        )
        .unwrap();
    }

    flow.begin_frame(0.016);
    // Visible at collection, invisible by the time commands are generated.
    hidden.set_visible(false);
    flow.generate_commands();

    let mut gpu = RecordingDriver::new();
    let stats = flow.execute(&mut gpu);

    // One multi-draw covering exactly the two visible instances.
    assert_eq!(stats.queue.executed, 1);
    let multi_draws: Vec<_> = gpu
        .calls()
        .iter()
        .filter_map(|call| match call {
            DriverCall::MultiDrawIndirect { count, stride, .. } => Some((*count, *stride)),
            _ => None,
        })
        .collect();
    assert_eq!(multi_draws, vec![(2, 16)]);

    // Indirect upload holds two 16-byte commands; vertex upload holds the
    // visible vertices only (6 + 5), no gap for the hidden instance.
    for call in gpu.calls() {
        match call {
            DriverCall::UploadIndirect { bytes, .. } => assert_eq!(*bytes, 2 * 16),
            DriverCall::UploadVertexData { bytes, .. } => {
                assert_eq!(*bytes, 11 * TEST_STRIDE as usize)
            }
            _ => {}
        }
    }
}

#[test]
fn test_uniform_groups_upload_once_per_group() {
    let mut flow = new_driver();
    let setting = test_setting(false, false);

    // Two snapshots across three instances: red, red, blue.
    let shader = Arc::new(TestShaderProvider::new(vec![UniformHook::new(
        "color",
        |instance: &dyn GraphicsInstance| {
            if instance.identifier().as_str().starts_with("red") {
                Some(UniformValue::Vec4(Vec4::new(1.0, 0.0, 0.0, 1.0)))
            } else {
                Some(UniformValue::Vec4(Vec4::new(0.0, 0.0, 1.0, 1.0)))
            }
        },
    )]));
    for name in ["red-1", "red-2", "blue-1"] {
        flow.register(
            RenderFlowType::rasterization(),
            StageId::new("main"),
            Arc::new(
                TestInstance::new(name)
                    .with_dynamic_mesh(6, 0)
                    .with_shader(shader.clone()),
            ),
            setting.clone(),
        )
        .unwrap();
    }

    let mut gpu = RecordingDriver::new();
    let stats = flow.run_frame(0.016, &mut gpu);

    // One batch, one multi-draw, two uniform snapshots applied before it.
    assert_eq!(stats.queue.executed, 1);
    let uniform_uploads = gpu
        .calls()
        .iter()
        .filter(|call| matches!(call, DriverCall::ApplyUniforms(_)))
        .count();
    assert_eq!(uniform_uploads, 2);
}

#[test]
fn test_stage_order_across_flows() {
    let mut flow = new_driver();
    let raster_setting = test_setting(false, false);
    let other_setting = test_setting(false, true);

    let function_ran = Arc::new(AtomicBool::new(false));
    let flag = function_ran.clone();

    // Stage discovery order follows registration order.
    flow.register(
        RenderFlowType::compute(),
        StageId::new("pre"),
        Arc::new(TestInstance::new("sim").with_dispatch([8, 8, 1])),
        other_setting.clone(),
    )
    .unwrap();
    flow.register(
        RenderFlowType::rasterization(),
        StageId::new("main"),
        Arc::new(TestInstance::new("mesh").with_dynamic_mesh(6, 0)),
        raster_setting,
    )
    .unwrap();
    flow.register(
        RenderFlowType::function(),
        StageId::new("post"),
        Arc::new(TestInstance::new("blit").with_raw(move |_driver| {
            flag.store(true, Ordering::SeqCst);
        })),
        other_setting,
    )
    .unwrap();

    let mut gpu = RecordingDriver::new();
    let stats = flow.run_frame(0.016, &mut gpu);
    assert_eq!(stats.queue.executed, 3);
    assert!(function_ran.load(Ordering::SeqCst));

    let dispatch_at = gpu
        .calls()
        .iter()
        .position(|call| matches!(call, DriverCall::Dispatch(_)))
        .unwrap();
    let draw_at = gpu
        .calls()
        .iter()
        .position(|call| matches!(call, DriverCall::MultiDrawIndirect { .. }))
        .unwrap();
    assert!(dispatch_at < draw_at, "compute stage must run before main");
}

#[test]
fn test_batches_split_by_setting_and_source() {
    let mut flow = new_driver();
    let setting_a = test_setting(false, false);
    let setting_b = test_setting(false, true);

    // Two settings and, within one setting, dynamic vs baked geometry.
    flow.register(
        RenderFlowType::rasterization(),
        StageId::new("main"),
        Arc::new(TestInstance::new("dyn-a").with_dynamic_mesh(6, 0)),
        setting_a.clone(),
    )
    .unwrap();
    flow.register(
        RenderFlowType::rasterization(),
        StageId::new("main"),
        Arc::new(
            TestInstance::new("baked-a")
                .with_baked_mesh(lumenflow_render::SourceId(7), 24, 0),
        ),
        setting_a,
    )
    .unwrap();
    flow.register(
        RenderFlowType::rasterization(),
        StageId::new("main"),
        Arc::new(TestInstance::new("dyn-b").with_dynamic_mesh(6, 0)),
        setting_b,
    )
    .unwrap();

    let mut gpu = RecordingDriver::new();
    let stats = flow.run_frame(0.016, &mut gpu);
    // Three batches, three multi-draws.
    assert_eq!(stats.queue.executed, 3);
    assert_eq!(gpu.count_draws(), 3);
}

#[test]
fn test_instances_persist_across_frames() {
    let mut flow = new_driver();
    let setting = test_setting(false, false);
    flow.register(
        RenderFlowType::rasterization(),
        StageId::new("main"),
        Arc::new(TestInstance::new("steady").with_dynamic_mesh(6, 0)),
        setting,
    )
    .unwrap();

    for frame in 1..=3 {
        let mut gpu = RecordingDriver::new();
        let stats = flow.run_frame(0.016, &mut gpu);
        assert_eq!(stats.frame, frame);
        assert_eq!(stats.queue.executed, 1);
        assert_eq!(gpu.count_draws(), 1);
    }
}
