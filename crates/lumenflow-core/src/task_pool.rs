//! Async task execution pool and the CPU-preparation configuration.
//!
//! GPU-facing work always runs on the render thread. CPU-side preparation
//! (instance ticking, vertex fill, uniform collection, instance updates) may
//! run off-thread through this pool; [`AsyncPrepConfig`] decides, per work
//! category, whether a workload is large enough to be worth parallelizing.

use std::future::Future;
use std::sync::Arc;
use std::thread;

use async_executor::{Executor, Task};

/// A thread pool for executing async tasks.
///
/// Workers poll the shared executor until shutdown. Callers must join every
/// spawned task (via [`TaskPool::join`]) before the render thread touches GPU
/// buffers that the tasks may still be filling.
pub struct TaskPool {
    executor: Arc<Executor<'static>>,
    threads: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
}

impl TaskPool {
    /// Create a new task pool with the specified number of threads.
    ///
    /// # Panics
    ///
    /// Panics if `num_threads` is 0.
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0, "TaskPool must have at least one thread");

        let executor = Arc::new(Executor::new());
        let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut threads = Vec::with_capacity(num_threads);

        for i in 0..num_threads {
            let exec = executor.clone();
            let shutdown_flag = shutdown.clone();

            let handle = thread::Builder::new()
                .name(format!("lumenflow-prep-{}", i))
                .spawn(move || {
                    while !shutdown_flag.load(std::sync::atomic::Ordering::Relaxed) {
                        if !exec.try_tick() {
                            // No tasks ready, sleep briefly
                            thread::sleep(std::time::Duration::from_millis(1));
                        }
                    }
                })
                .expect("Failed to spawn task pool thread");

            threads.push(handle);
        }

        tracing::debug!("TaskPool created with {} threads", num_threads);

        Self {
            executor,
            threads,
            shutdown,
        }
    }

    /// Create a task pool with a default number of threads.
    ///
    /// Uses max(1, num_cpus - 1) to leave one core free for the render thread.
    pub fn default_threads() -> Self {
        let num_threads = (num_cpus::get().saturating_sub(1)).max(1);
        Self::new(num_threads)
    }

    /// Spawn an async task on the pool.
    pub fn spawn<T>(&self, future: impl Future<Output = T> + Send + 'static) -> Task<T>
    where
        T: Send + 'static,
    {
        self.executor.spawn(future)
    }

    /// Block the calling thread until the task completes.
    pub fn join<T>(task: Task<T>) -> T {
        futures_lite::future::block_on(task)
    }

    /// Get the number of threads in this pool.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Shutdown the task pool and wait for all threads to finish.
    pub fn shutdown(mut self) {
        tracing::debug!("Shutting down TaskPool with {} threads", self.threads.len());

        self.shutdown
            .store(true, std::sync::atomic::Ordering::Relaxed);

        let threads = std::mem::take(&mut self.threads);
        for handle in threads {
            if let Err(e) = handle.join() {
                tracing::error!("Task pool thread panicked: {:?}", e);
            }
        }
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::default_threads()
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

/// One category of off-thread CPU preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepCategory {
    /// Whether this category may run on the pool at all.
    pub enabled: bool,
    /// Minimum number of work items before the pool is used; below this the
    /// work runs inline on the calling thread.
    pub threshold: usize,
}

impl PrepCategory {
    pub const fn new(enabled: bool, threshold: usize) -> Self {
        Self { enabled, threshold }
    }
}

impl Default for PrepCategory {
    fn default() -> Self {
        Self::new(true, 64)
    }
}

/// Configuration for async CPU preparation.
///
/// Each work category has an independent enable flag and size threshold.
/// When `enabled` is false everything runs inline regardless of the
/// per-category settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncPrepConfig {
    /// Global switch; false forces all work inline.
    pub enabled: bool,
    /// Worker thread count for the pool.
    pub threads: usize,
    pub tick: PrepCategory,
    pub vertex_fill: PrepCategory,
    pub uniform_collect: PrepCategory,
    pub instance_update: PrepCategory,
}

impl AsyncPrepConfig {
    /// Returns true when `work_items` in the given category should be handed
    /// to the pool rather than run inline.
    pub fn use_pool(&self, category: PrepCategory, work_items: usize) -> bool {
        self.enabled && category.enabled && work_items >= category.threshold
    }

    /// A configuration that runs everything inline.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for AsyncPrepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threads: (num_cpus::get().saturating_sub(1)).max(1),
            tick: PrepCategory::default(),
            vertex_fill: PrepCategory::default(),
            uniform_collect: PrepCategory::default(),
            instance_update: PrepCategory::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_pool_creation() {
        let pool = TaskPool::new(2);
        assert_eq!(pool.thread_count(), 2);
    }

    #[test]
    fn test_spawn_and_await() {
        let pool = TaskPool::new(2);

        let task = pool.spawn(async { 42 });

        let result = pollster::block_on(task);
        assert_eq!(result, 42);
    }

    #[test]
    fn test_multiple_tasks() {
        let pool = TaskPool::new(4);

        let tasks: Vec<_> = (0..10).map(|i| pool.spawn(async move { i * 2 })).collect();

        let results: Vec<_> = tasks.into_iter().map(TaskPool::join).collect();

        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);
    }

    #[test]
    #[should_panic(expected = "TaskPool must have at least one thread")]
    fn test_zero_threads_panics() {
        TaskPool::new(0);
    }

    #[test]
    fn test_shutdown() {
        let pool = TaskPool::new(2);

        let _task1 = pool.spawn(async { 1 });
        let _task2 = pool.spawn(async { 2 });

        pool.shutdown();
    }

    #[test]
    fn test_prep_config_thresholds() {
        let config = AsyncPrepConfig {
            enabled: true,
            tick: PrepCategory::new(true, 16),
            ..Default::default()
        };
        assert!(!config.use_pool(config.tick, 15));
        assert!(config.use_pool(config.tick, 16));
    }

    #[test]
    fn test_prep_config_disabled_forces_inline() {
        let config = AsyncPrepConfig::disabled();
        assert!(!config.use_pool(config.vertex_fill, 1_000_000));
    }

    #[test]
    fn test_prep_category_disabled() {
        let config = AsyncPrepConfig {
            enabled: true,
            uniform_collect: PrepCategory::new(false, 0),
            ..Default::default()
        };
        assert!(!config.use_pool(config.uniform_collect, 1_000_000));
    }
}
