//! Uniform snapshots and uniform-based instance grouping.
//!
//! A [`UniformValueSnapshot`] captures the point-in-time uniform map an
//! instance requires; instances with equal snapshots can share one uniform
//! upload before being drawn together. Snapshot equality is full-map
//! equality with a precomputed, order-independent hash.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::{Arc, OnceLock};

use glam::{Mat4, Vec2, Vec3, Vec4};
use lumenflow_core::KeyId;

use crate::instance::GraphicsInstance;
use crate::setting::ResourceBinding;

/// A shader uniform value.
///
/// Floats compare with `f32` semantics but hash by bit pattern; providers
/// must not emit NaN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Int(i32),
    UInt(u32),
    Bool(bool),
    Mat4(Mat4),
}

impl Eq for UniformValue {}

impl Hash for UniformValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            UniformValue::Float(v) => v.to_bits().hash(state),
            UniformValue::Vec2(v) => v.to_array().map(f32::to_bits).hash(state),
            UniformValue::Vec3(v) => v.to_array().map(f32::to_bits).hash(state),
            UniformValue::Vec4(v) => v.to_array().map(f32::to_bits).hash(state),
            UniformValue::Int(v) => v.hash(state),
            UniformValue::UInt(v) => v.hash(state),
            UniformValue::Bool(v) => v.hash(state),
            UniformValue::Mat4(v) => v.to_cols_array().map(f32::to_bits).hash(state),
        }
    }
}

/// A named uniform sampling hook exposed by a shader provider.
///
/// The closure returns `None` when the hook has no value for the given
/// instance; such hooks contribute nothing to the snapshot.
#[derive(Clone)]
pub struct UniformHook {
    pub name: KeyId,
    pub sample: Arc<dyn Fn(&dyn GraphicsInstance) -> Option<UniformValue> + Send + Sync>,
}

impl UniformHook {
    pub fn new(
        name: impl Into<KeyId>,
        sample: impl Fn(&dyn GraphicsInstance) -> Option<UniformValue> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            sample: Arc::new(sample),
        }
    }
}

/// Shader/uniform provider contract (owned by the shader layer).
pub trait ShaderProvider: Send + Sync {
    /// The uniform hooks snapshots are sampled from.
    fn uniform_hooks(&self) -> &[UniformHook];

    /// Resource-binding metadata for commands drawn with this shader.
    fn resource_binding(&self) -> ResourceBinding {
        ResourceBinding::NONE
    }
}

type UniformMap = HashMap<KeyId, UniformValue, ahash::RandomState>;

// Fixed seeds so equal maps always produce equal combined hashes within
// one process.
const SNAPSHOT_SEED: ahash::RandomState =
    ahash::RandomState::with_seeds(0x6c75_6d65, 0x6e66_6c6f, 0x7375_6e69, 0x666f_726d);

fn combined_hash(values: &UniformMap) -> u64 {
    // XOR of per-entry hashes: order-independent, so iteration order of the
    // underlying map does not matter.
    let mut acc = 0u64;
    for (name, value) in values {
        let mut hasher = SNAPSHOT_SEED.build_hasher();
        name.hash(&mut hasher);
        value.hash(&mut hasher);
        acc ^= hasher.finish();
    }
    acc
}

/// Immutable name -> value uniform map with value equality.
///
/// The empty snapshot is a shared canonical instance; cloning a snapshot is
/// an `Arc` bump.
#[derive(Debug, Clone)]
pub struct UniformValueSnapshot {
    values: Arc<UniformMap>,
    hash: u64,
}

static EMPTY_SNAPSHOT: OnceLock<UniformValueSnapshot> = OnceLock::new();

impl UniformValueSnapshot {
    /// The shared empty snapshot.
    pub fn empty() -> Self {
        EMPTY_SNAPSHOT
            .get_or_init(|| Self {
                values: Arc::new(UniformMap::default()),
                hash: 0,
            })
            .clone()
    }

    pub fn from_values(values: UniformMap) -> Self {
        if values.is_empty() {
            return Self::empty();
        }
        let hash = combined_hash(&values);
        Self {
            values: Arc::new(values),
            hash,
        }
    }

    /// Capture a snapshot by sampling the provider's hooks against one
    /// instance.
    pub fn capture(provider: &dyn ShaderProvider, instance: &dyn GraphicsInstance) -> Self {
        let hooks = provider.uniform_hooks();
        if hooks.is_empty() {
            return Self::empty();
        }
        let mut values = UniformMap::default();
        for hook in hooks {
            if let Some(value) = (hook.sample)(instance) {
                values.insert(hook.name.clone(), value);
            }
        }
        Self::from_values(values)
    }

    pub fn get(&self, name: &KeyId) -> Option<&UniformValue> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KeyId, &UniformValue)> {
        self.values.iter()
    }
}

impl PartialEq for UniformValueSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && *self.values == *other.values
    }
}

impl Eq for UniformValueSnapshot {}

impl Hash for UniformValueSnapshot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// Instances guaranteed to require identical uniform values.
///
/// All members can share one uniform upload before being drawn together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBatchGroup {
    snapshot: UniformValueSnapshot,
    members: Vec<KeyId>,
}

impl UniformBatchGroup {
    pub fn new(snapshot: UniformValueSnapshot) -> Self {
        Self {
            snapshot,
            members: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> &UniformValueSnapshot {
        &self.snapshot
    }

    pub fn members(&self) -> &[KeyId] {
        &self.members
    }

    pub fn push(&mut self, member: KeyId) {
        self.members.push(member);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Partition instances into uniform groups in a single linear pass.
///
/// Group order is first-seen order; members keep their visitation order.
pub fn group_by_snapshot<'a>(
    provider: &dyn ShaderProvider,
    instances: impl Iterator<Item = &'a dyn GraphicsInstance>,
) -> Vec<UniformBatchGroup> {
    let mut index: HashMap<UniformValueSnapshot, usize, ahash::RandomState> = HashMap::default();
    let mut groups: Vec<UniformBatchGroup> = Vec::new();

    for instance in instances {
        let snapshot = UniformValueSnapshot::capture(provider, instance);
        let slot = *index.entry(snapshot.clone()).or_insert_with(|| {
            groups.push(UniformBatchGroup::new(snapshot));
            groups.len() - 1
        });
        groups[slot].push(instance.identifier());
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestInstance;

    struct HookProvider {
        hooks: Vec<UniformHook>,
    }

    impl ShaderProvider for HookProvider {
        fn uniform_hooks(&self) -> &[UniformHook] {
            &self.hooks
        }
    }

    fn color_by_name_provider() -> HookProvider {
        // Samples a "color" uniform keyed off the instance identifier.
        HookProvider {
            hooks: vec![UniformHook::new("color", |instance: &dyn GraphicsInstance| {
                if instance.identifier().as_str().starts_with("red") {
                    Some(UniformValue::Vec4(Vec4::new(1.0, 0.0, 0.0, 1.0)))
                } else {
                    Some(UniformValue::Vec4(Vec4::new(0.0, 0.0, 1.0, 1.0)))
                }
            })],
        }
    }

    #[test]
    fn test_snapshot_equality_full_map() {
        let mut a = UniformMap::default();
        a.insert(KeyId::new("tint"), UniformValue::Float(0.5));
        a.insert(KeyId::new("mode"), UniformValue::Int(2));

        let mut b = UniformMap::default();
        b.insert(KeyId::new("mode"), UniformValue::Int(2));
        b.insert(KeyId::new("tint"), UniformValue::Float(0.5));

        let sa = UniformValueSnapshot::from_values(a);
        let sb = UniformValueSnapshot::from_values(b);
        assert_eq!(sa, sb);

        let mut c = UniformMap::default();
        c.insert(KeyId::new("tint"), UniformValue::Float(0.6));
        c.insert(KeyId::new("mode"), UniformValue::Int(2));
        assert_ne!(sa, UniformValueSnapshot::from_values(c));
    }

    #[test]
    fn test_empty_snapshot_is_canonical() {
        let a = UniformValueSnapshot::empty();
        let b = UniformValueSnapshot::from_values(UniformMap::default());
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a.values, &b.values));
    }

    #[test]
    fn test_grouping_red_red_blue() {
        let provider = color_by_name_provider();
        let red1 = TestInstance::new("red-1");
        let red2 = TestInstance::new("red-2");
        let blue = TestInstance::new("blue-1");

        let instances: Vec<&dyn GraphicsInstance> = vec![&red1, &red2, &blue];
        let groups = group_by_snapshot(&provider, instances.into_iter());

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 1);
        assert_eq!(groups[1].members()[0], KeyId::new("blue-1"));
    }

    #[test]
    fn test_hooks_returning_none_contribute_nothing() {
        let provider = HookProvider {
            hooks: vec![UniformHook::new("absent", |_: &dyn GraphicsInstance| None)],
        };
        let instance = TestInstance::new("a");
        let snapshot = UniformValueSnapshot::capture(&provider, &instance);
        assert_eq!(snapshot, UniformValueSnapshot::empty());
    }

    #[test]
    fn test_uniform_value_hash_discriminates_types() {
        let state = ahash::RandomState::with_seeds(1, 2, 3, 4);
        let a = state.hash_one(UniformValue::Int(0));
        let b = state.hash_one(UniformValue::UInt(0));
        assert_ne!(a, b);
    }
}
