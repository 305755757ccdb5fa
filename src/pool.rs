//! Scheduling pools.
//!
//! A stage runs activation work (turns, activation hooks, the tick loop) on
//! its CPU pool and routing work (resolution, forwarding, inbound remote
//! calls) on its IO pool. Pools exist only between `start` and `stop`.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use crate::config::PoolPolicy;
use crate::error::StageError;

pub(crate) struct Pool {
	name: &'static str,
	policy: PoolPolicy,
	current: ArcSwapOption<PoolRuntime>,
}

struct PoolRuntime {
	handle: Handle,
	// None for shared pools, which borrow the caller's runtime
	owned: Mutex<Option<Runtime>>,
}

impl Drop for PoolRuntime {
	fn drop(&mut self) {
		// a runtime cannot be dropped from async context, let its threads wind down on their own
		if let Some(runtime) = self.owned.get_mut().take() {
			runtime.shutdown_background();
		}
	}
}

impl Pool {
	pub fn new(name: &'static str, policy: PoolPolicy) -> Arc<Self> {
		Arc::new(Self {
			name,
			policy,
			current: ArcSwapOption::empty(),
		})
	}

	pub fn name(&self) -> &'static str {
		self.name
	}

	/// Bring the pool up. Must be called from within a tokio runtime.
	pub fn start(&self) -> Result<(), StageError> {
		let runtime = match self.policy {
			PoolPolicy::Fixed(threads) => Some(self.build(threads)?),
			PoolPolicy::Cached => {
				let threads = std::thread::available_parallelism()
					.map(NonZeroUsize::get)
					.unwrap_or(2);
				Some(self.build((threads * 2).max(4))?)
			}
			PoolPolicy::Shared => None,
		};

		let handle = match &runtime {
			Some(runtime) => runtime.handle().clone(),
			None => Handle::try_current().map_err(|err| StageError::Pool {
				name: self.name,
				source: std::io::Error::other(err),
			})?,
		};

		tracing::debug!(pool = self.name, policy = ?self.policy, "pool started");
		self.current.store(Some(Arc::new(PoolRuntime {
			handle,
			owned: Mutex::new(runtime),
		})));
		Ok(())
	}

	fn build(&self, threads: usize) -> Result<Runtime, StageError> {
		tokio::runtime::Builder::new_multi_thread()
			.worker_threads(threads)
			.thread_name(format!("runy-{}", self.name))
			.enable_all()
			.build()
			.map_err(|source| StageError::Pool {
				name: self.name,
				source,
			})
	}

	/// Spawn onto the pool. `None` once the pool is shut down, in which case
	/// the future is dropped without being polled.
	pub fn spawn<F>(&self, future: F) -> Option<JoinHandle<F::Output>>
	where
		F: Future + Send + 'static,
		F::Output: Send + 'static,
	{
		let current = self.current.load();
		current.as_ref().map(|pool| pool.handle.spawn(future))
	}

	pub fn is_running(&self) -> bool {
		self.current.load().is_some()
	}

	pub fn shutdown(&self) {
		if self.current.swap(None).is_some() {
			tracing::debug!(pool = self.name, "pool stopped");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn dedicated_pool_runs_tasks_until_shutdown() {
		let pool = Pool::new("cpu", PoolPolicy::Fixed(2));
		assert!(pool.spawn(async {}).is_none());

		pool.start().unwrap();
		let name = pool
			.spawn(async { std::thread::current().name().map(str::to_string) })
			.unwrap()
			.await
			.unwrap();
		assert_eq!(name.as_deref(), Some("runy-cpu"));

		pool.shutdown();
		assert!(!pool.is_running());
		assert!(pool.spawn(async {}).is_none());
	}

	#[tokio::test]
	async fn shared_pool_uses_current_runtime() {
		let pool = Pool::new("io", PoolPolicy::Shared);
		pool.start().unwrap();
		assert_eq!(pool.spawn(async { 1 + 1 }).unwrap().await.unwrap(), 2);
		pool.shutdown();
	}
}
