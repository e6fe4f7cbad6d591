//! Lumenflow Core
//!
//! Ambient utilities shared by the Lumenflow render-flow engine: keyed
//! identifiers, logging bootstrap, profiling hooks, and the async task pool
//! used for off-thread CPU preparation.

pub mod key;
pub mod logging;
pub mod profiling;
pub mod task_pool;

pub use key::KeyId;
pub use task_pool::{AsyncPrepConfig, PrepCategory, TaskPool};
