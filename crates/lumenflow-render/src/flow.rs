//! Flow types, strategies, and the bootstrap registry.
//!
//! A *flow* is one category of render work (rasterization, compute, raw
//! functions). Each flow has exactly one [`RenderFlowStrategy`] that turns
//! its instances into executable commands. Strategies register during a
//! one-shot bootstrap pass, after which the registry freezes; mid-frame
//! strategy swaps would corrupt in-flight batches and are rejected outright.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lumenflow_core::{AsyncPrepConfig, KeyId, TaskPool};

use crate::batch::BatchContainer;
use crate::command::{RenderCommand, StageId};
use crate::indirect::IndirectBufferRegistry;
use crate::instance::{GraphicsInstance, InstanceInfo};
use crate::resource::{RenderPostProcessor, VertexResourceManager};
use crate::setting::RenderSetting;

/// Open, extensible flow identifier; equality and hash by id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderFlowType(KeyId);

impl RenderFlowType {
    pub fn new(id: impl Into<KeyId>) -> Self {
        Self(id.into())
    }

    pub fn rasterization() -> Self {
        Self::new("lumenflow:rasterization")
    }

    pub fn compute() -> Self {
        Self::new("lumenflow:compute")
    }

    pub fn function() -> Self {
        Self::new("lumenflow:function")
    }

    pub fn id(&self) -> &KeyId {
        &self.0
    }
}

impl fmt::Display for RenderFlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Context available while collecting instance infos.
#[derive(Debug, Clone, Copy)]
pub struct CollectContext {
    pub frame: u64,
}

/// Per-frame context bundle passed into strategies.
pub struct RenderFlowContext<'a> {
    pub resources: &'a mut dyn VertexResourceManager,
    pub indirect: &'a mut IndirectBufferRegistry,
    /// Pool for off-thread preparation; `None` for strategies that must run
    /// inline.
    pub pool: Option<&'a TaskPool>,
    pub prep: AsyncPrepConfig,
    pub frame: u64,
}

/// Commands produced by one strategy for one stage, keyed by setting.
pub type CommandsBySetting = HashMap<Arc<RenderSetting>, Vec<RenderCommand>, ahash::RandomState>;

/// Errors surfaced by command generation.
///
/// These abort the stage's commands for the frame (dropped and logged);
/// there is no retry.
#[derive(Debug)]
pub enum FlowError {
    /// A strategy could not produce commands for a stage.
    CommandGeneration {
        flow: RenderFlowType,
        message: String,
    },
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandGeneration { flow, message } => {
                write!(f, "Command generation failed for flow {}: {}", flow, message)
            }
        }
    }
}

impl std::error::Error for FlowError {}

/// Per-flow behavior. All methods are pure functions of their inputs.
pub trait RenderFlowStrategy: Send + Sync {
    fn flow_type(&self) -> RenderFlowType;

    /// Extract the per-frame info for one instance, or `None` when the
    /// instance should not render this frame or lacks required data. This is
    /// the only visibility filter before batching.
    fn collect_instance_info(
        &self,
        instance: &Arc<dyn GraphicsInstance>,
        setting: &Arc<RenderSetting>,
        ctx: &CollectContext,
    ) -> Option<InstanceInfo>;

    /// Turn the container's live batches into commands for one stage.
    fn create_render_commands(
        &self,
        container: &mut BatchContainer,
        stage: StageId,
        ctx: &mut RenderFlowContext<'_>,
        post_processors: &mut Vec<Box<dyn RenderPostProcessor>>,
    ) -> Result<CommandsBySetting, FlowError>;

    /// Whether instances of this flow go through persistent batch
    /// maintenance. Flows returning false get their container rebuilt from
    /// scratch every frame.
    fn supports_batching(&self) -> bool {
        true
    }

    /// Whether CPU preparation for this flow may run on the task pool.
    fn supports_parallel(&self) -> bool {
        false
    }
}

/// Errors raised by the registry at bootstrap. All of these are
/// configuration errors: callers fail fast rather than recover.
#[derive(Debug)]
pub enum RegistryError {
    /// A strategy for this flow type is already registered.
    DuplicateStrategy(RenderFlowType),
    /// `register` was called after the registry froze.
    Frozen(RenderFlowType),
    /// `init` ran a second time.
    AlreadyInitialized,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateStrategy(flow) => {
                write!(f, "A strategy for flow {} is already registered", flow)
            }
            Self::Frozen(flow) => write!(
                f,
                "Cannot register strategy for flow {}: registry is frozen",
                flow
            ),
            Self::AlreadyInitialized => write!(f, "Registry init() may only run once"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Called once during registry init so providers can register strategies.
pub trait FlowStrategyProvider {
    fn register_strategies(&mut self, registry: &mut RenderFlowRegistry)
    -> Result<(), RegistryError>;
}

/// One strategy per flow type, registered at a well-defined bootstrap point.
///
/// Explicitly constructed and owned by the pipeline driver; `init` runs the
/// registration pass exactly once and then freezes the set. Lookup is O(1)
/// before and after the freeze.
pub struct RenderFlowRegistry {
    strategies: HashMap<RenderFlowType, Arc<dyn RenderFlowStrategy>, ahash::RandomState>,
    frozen: bool,
    initialized: bool,
}

impl RenderFlowRegistry {
    pub fn new() -> Self {
        Self {
            strategies: HashMap::default(),
            frozen: false,
            initialized: false,
        }
    }

    /// Register a strategy for its flow type.
    ///
    /// Fails on a frozen registry, and always fails for a duplicate flow
    /// type regardless of frozen state.
    pub fn register(&mut self, strategy: Arc<dyn RenderFlowStrategy>) -> Result<(), RegistryError> {
        let flow = strategy.flow_type();
        if self.strategies.contains_key(&flow) {
            return Err(RegistryError::DuplicateStrategy(flow));
        }
        if self.frozen {
            return Err(RegistryError::Frozen(flow));
        }
        tracing::debug!(flow = %flow, "registered render flow strategy");
        self.strategies.insert(flow, strategy);
        Ok(())
    }

    /// Run the one-shot registration pass and freeze the registry.
    pub fn init(
        &mut self,
        providers: &mut [&mut dyn FlowStrategyProvider],
    ) -> Result<(), RegistryError> {
        if self.initialized {
            return Err(RegistryError::AlreadyInitialized);
        }
        self.initialized = true;

        for provider in providers.iter_mut() {
            provider.register_strategies(self)?;
        }

        self.frozen = true;
        tracing::info!(
            strategies = self.strategies.len(),
            "render flow registry frozen"
        );
        Ok(())
    }

    pub fn strategy(&self, flow: &RenderFlowType) -> Option<&Arc<dyn RenderFlowStrategy>> {
        self.strategies.get(flow)
    }

    pub fn has_strategy(&self, flow: &RenderFlowType) -> bool {
        self.strategies.contains_key(flow)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn flow_types(&self) -> impl Iterator<Item = &RenderFlowType> {
        self.strategies.keys()
    }
}

impl Default for RenderFlowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::RasterizationFlowStrategy;

    struct SingleProvider(Option<Arc<dyn RenderFlowStrategy>>);

    impl FlowStrategyProvider for SingleProvider {
        fn register_strategies(
            &mut self,
            registry: &mut RenderFlowRegistry,
        ) -> Result<(), RegistryError> {
            registry.register(self.0.take().expect("provider already consumed"))
        }
    }

    #[test]
    fn test_duplicate_registration_fails_before_init() {
        let mut registry = RenderFlowRegistry::new();
        registry
            .register(Arc::new(RasterizationFlowStrategy::new()))
            .unwrap();
        let err = registry
            .register(Arc::new(RasterizationFlowStrategy::new()))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateStrategy(_)));
    }

    #[test]
    fn test_registration_after_init_fails() {
        let mut registry = RenderFlowRegistry::new();
        let mut provider = SingleProvider(Some(Arc::new(RasterizationFlowStrategy::new())));
        registry.init(&mut [&mut provider]).unwrap();
        assert!(registry.is_frozen());

        let err = registry
            .register(Arc::new(crate::compute_flow::ComputeFlowStrategy::new()))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Frozen(_)));
    }

    #[test]
    fn test_init_runs_once() {
        let mut registry = RenderFlowRegistry::new();
        registry.init(&mut []).unwrap();
        let err = registry.init(&mut []).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyInitialized));
    }

    #[test]
    fn test_lookup_before_and_after_freeze() {
        let mut registry = RenderFlowRegistry::new();
        registry
            .register(Arc::new(RasterizationFlowStrategy::new()))
            .unwrap();
        assert!(registry.has_strategy(&RenderFlowType::rasterization()));

        registry.init(&mut []).unwrap();
        assert!(registry.has_strategy(&RenderFlowType::rasterization()));
        assert!(!registry.has_strategy(&RenderFlowType::compute()));
        assert!(
            registry
                .strategy(&RenderFlowType::rasterization())
                .is_some()
        );
    }

    #[test]
    fn test_flow_type_equality_by_id() {
        assert_eq!(
            RenderFlowType::new("lumenflow:rasterization"),
            RenderFlowType::rasterization()
        );
        assert_ne!(RenderFlowType::rasterization(), RenderFlowType::compute());
    }
}
