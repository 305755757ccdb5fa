//! The stage: one node of the actor runtime.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;

use crate::actor::Actor;
use crate::cancel::CancelToken;
use crate::catalog::ActorCatalog;
use crate::cluster::ClusterBinding;
use crate::cluster::Membership;
use crate::config::StageConfig;
use crate::directory::Directory;
use crate::dispatcher::Dispatcher;
use crate::drop::DropHandle;
use crate::error::StageError;
use crate::identity::ClusterName;
use crate::identity::NodeIdentity;
use crate::pool::Pool;
use crate::proxy::ActorProxyFactory;
use crate::stats::ActivationStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
	Created,
	Starting,
	Running,
	Stopping,
	Stopped,
}

/// Why stage-owned work is being cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
	Stopped,
	/// Graceful drain timed out.
	Forced,
}

/// Periodic maintenance run by the tick loop after the idle sweep.
pub trait TickHook: Send + Sync + 'static {
	fn name(&self) -> &str {
		"tick hook"
	}

	fn tick(&self) -> BoxFuture<'_, anyhow::Result<()>>;
}

struct LeaseRenewal {
	membership: Arc<dyn Membership>,
	node: NodeIdentity,
}

impl TickHook for LeaseRenewal {
	fn name(&self) -> &str {
		"lease renewal"
	}

	fn tick(&self) -> BoxFuture<'_, anyhow::Result<()>> {
		futures::future::ready(self.membership.renew(&self.node)).boxed()
	}
}

pub struct StageBuilder {
	config: StageConfig,
	catalog: ActorCatalog,
	cluster: Option<ClusterBinding>,
	hooks: Vec<Arc<dyn TickHook>>,
	error: Option<StageError>,
}

impl StageBuilder {
	/// Host actor implementation `A` on this stage.
	pub fn register<A: Actor>(mut self) -> Self {
		if self.error.is_none() {
			self.error = self.catalog.register::<A>().err();
		}
		self
	}

	/// Join this cluster instead of a private single-node one.
	pub fn cluster(mut self, binding: ClusterBinding) -> Self {
		self.cluster = Some(binding);
		self
	}

	pub fn tick_hook(mut self, hook: Arc<dyn TickHook>) -> Self {
		self.hooks.push(hook);
		self
	}

	pub fn build(self) -> Result<Stage, StageError> {
		if let Some(error) = self.error {
			return Err(error);
		}

		let config = self.config;
		let cluster = self.cluster.unwrap_or_else(ClusterBinding::standalone);
		let catalog = Arc::new(self.catalog);
		let cpu = Pool::new("cpu", config.cpu_pool().clone());
		let io = Pool::new("io", config.io_pool().clone());
		let stats = Arc::new(ActivationStats::default());
		let token = CancelToken::new();

		let dispatcher = Arc::new_cyclic(|dispatcher: &Weak<Dispatcher>| {
			let directory = Directory::new(
				config.node_identity().clone(),
				config.cluster_name().clone(),
				catalog.clone(),
				cluster.clone(),
				ActorProxyFactory::new(dispatcher.clone(), catalog.clone()),
				stats.clone(),
				cpu.clone(),
				token.child(),
			);
			Dispatcher::new(&config, Arc::new(directory), cluster.clone(), io.clone())
		});

		let mut hooks: Vec<Arc<dyn TickHook>> = vec![Arc::new(LeaseRenewal {
			membership: cluster.membership.clone(),
			node: config.node_identity().clone(),
		})];
		hooks.extend(self.hooks);

		Ok(Stage {
			inner: Arc::new(StageInner {
				proxies: ActorProxyFactory::new(Arc::downgrade(&dispatcher), catalog),
				config,
				state: Mutex::new(StageState::Created),
				dispatcher,
				cluster,
				cpu,
				io,
				hooks,
				stats,
				token,
				tasks: Mutex::new(Vec::new()),
			}),
		})
	}
}

/// A node of the actor runtime: directory, dispatcher, pools and tick loop.
///
/// Cheap to clone; clones share the node.
#[derive(Clone)]
pub struct Stage {
	inner: Arc<StageInner>,
}

struct StageInner {
	config: StageConfig,
	state: Mutex<StageState>,
	dispatcher: Arc<Dispatcher>,
	proxies: ActorProxyFactory,
	cluster: ClusterBinding,
	cpu: Arc<Pool>,
	io: Arc<Pool>,
	hooks: Vec<Arc<dyn TickHook>>,
	stats: Arc<ActivationStats>,
	token: CancelToken<StopReason>,
	tasks: Mutex<Vec<DropHandle<()>>>,
}

impl fmt::Debug for Stage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Stage")
			.field("node", self.node_identity())
			.field("cluster", self.cluster_name())
			.field("state", &self.state())
			.finish()
	}
}

impl Stage {
	pub fn builder(config: StageConfig) -> StageBuilder {
		StageBuilder {
			config,
			catalog: ActorCatalog::default(),
			cluster: None,
			hooks: Vec::new(),
			error: None,
		}
	}

	pub fn config(&self) -> &StageConfig {
		&self.inner.config
	}

	pub fn node_identity(&self) -> &NodeIdentity {
		self.inner.config.node_identity()
	}

	pub fn cluster_name(&self) -> &ClusterName {
		self.inner.config.cluster_name()
	}

	pub fn state(&self) -> StageState {
		*self.inner.state.lock()
	}

	pub fn actor_proxy_factory(&self) -> &ActorProxyFactory {
		&self.inner.proxies
	}

	pub fn directory(&self) -> &Directory {
		self.inner.dispatcher.directory()
	}

	pub fn dispatcher(&self) -> &Dispatcher {
		&self.inner.dispatcher
	}

	pub fn stats(&self) -> &ActivationStats {
		&self.inner.stats
	}

	fn transition(&self, expected: StageState, next: StageState) -> Result<(), StageError> {
		let mut state = self.inner.state.lock();
		if *state != expected {
			return Err(StageError::InvalidState {
				expected,
				actual: *state,
			});
		}
		*state = next;
		Ok(())
	}

	fn set_state(&self, next: StageState) {
		*self.inner.state.lock() = next;
	}

	/// Bring the stage up. Resolves once it serves invocations.
	pub async fn start(&self) -> Result<(), StageError> {
		self.transition(StageState::Created, StageState::Starting)?;

		if let Err(error) = self.bring_up() {
			tracing::error!(node = %self.node_identity(), %error, "stage failed to start");
			self.inner.token.cancel(StopReason::Stopped);
			self.inner.cluster.membership.leave(self.node_identity());
			self.inner.cluster.transport.unbind(self.node_identity());
			self.inner.cpu.shutdown();
			self.inner.io.shutdown();
			self.set_state(StageState::Stopped);
			return Err(error);
		}

		self.set_state(StageState::Running);
		tracing::info!(node = %self.node_identity(), cluster = %self.cluster_name(), "stage started");
		Ok(())
	}

	fn bring_up(&self) -> Result<(), StageError> {
		let inner = &self.inner;
		let node = inner.config.node_identity();
		let cluster_name = inner.config.cluster_name();

		inner.cpu.start()?;
		inner.io.start()?;
		inner
			.cluster
			.transport
			.bind(node, cluster_name, inner.dispatcher.inbound())?;
		inner.cluster.membership.join(node, cluster_name);
		inner.dispatcher.open();

		let mut tasks = inner.tasks.lock();
		let ticks = tick_loop(
			inner.dispatcher.directory().clone(),
			inner.hooks.clone(),
			inner.config.tick_rate(),
			inner.config.actor_ttl(),
			inner.token.child(),
		);
		if let Some(handle) = inner.cpu.spawn(ticks) {
			tasks.push(DropHandle::new("tick loop", handle));
		}

		let watcher = inner.dispatcher.clone().watch_membership(inner.token.child());
		if let Some(handle) = inner.io.spawn(watcher) {
			tasks.push(DropHandle::new("membership watcher", handle));
		}
		Ok(())
	}

	/// Stop serving and deactivate every local activation.
	///
	/// Activations get `stop_timeout` to drain gracefully; whatever is left
	/// after that is dropped and its pending invocations fail.
	pub async fn stop(&self) -> Result<(), StageError> {
		self.transition(StageState::Running, StageState::Stopping)?;
		let inner = &self.inner;
		let node = inner.config.node_identity();
		tracing::info!(%node, live = inner.stats.live(), "stopping stage");

		inner.dispatcher.close();
		inner
			.dispatcher
			.directory()
			.deactivate_all(inner.config.stop_timeout())
			.await;

		inner.cluster.membership.leave(node);
		inner.cluster.transport.unbind(node);
		inner.token.cancel(StopReason::Stopped);
		for task in inner.tasks.lock().drain(..) {
			tracing::trace!(task = task.name(), finished = task.is_finished(), "releasing background task");
		}
		inner.cpu.shutdown();
		inner.io.shutdown();

		self.set_state(StageState::Stopped);
		tracing::info!(%node, "stage stopped");
		Ok(())
	}
}

impl Drop for StageInner {
	fn drop(&mut self) {
		let state = *self.state.get_mut();
		if matches!(state, StageState::Running | StageState::Starting | StageState::Stopping) {
			tracing::warn!(node = %self.config.node_identity(), ?state, "stage dropped without stop");
			self.dispatcher.close();
			self.token.cancel(StopReason::Stopped);
			self.cluster.membership.leave(self.config.node_identity());
			self.cluster.transport.unbind(self.config.node_identity());
			self.tasks.get_mut().clear();
			self.cpu.shutdown();
			self.io.shutdown();
		}
	}
}

async fn tick_loop(
	directory: Arc<Directory>,
	hooks: Vec<Arc<dyn TickHook>>,
	tick_rate: Duration,
	actor_ttl: Duration,
	token: CancelToken<StopReason>,
) {
	let mut interval = tokio::time::interval(tick_rate);
	interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
	// the first tick completes immediately
	interval.tick().await;

	loop {
		tokio::select! {
			_ = token.cancelled() => break,
			_ = interval.tick() => {}
		}

		let tick = AssertUnwindSafe(run_tick(&directory, &hooks, actor_ttl)).catch_unwind();
		if tick.await.is_err() {
			tracing::error!("tick panicked");
		}
	}
	tracing::debug!("tick loop stopped");
}

async fn run_tick(directory: &Directory, hooks: &[Arc<dyn TickHook>], actor_ttl: Duration) {
	let swept = directory.sweep_idle(Instant::now(), actor_ttl).await;
	if swept > 0 {
		tracing::debug!(swept, "idle activations swept");
	}

	// before the lease is renewed: an expired stage must not keep serving
	let fenced = directory.fence(directory.is_evicted()).await;
	if fenced > 0 {
		tracing::warn!(fenced, "dropped activations owned elsewhere");
	}

	for hook in hooks {
		if let Err(err) = hook.tick().await {
			tracing::warn!(hook = hook.name(), error = %format!("{err:#}"), "tick hook failed");
		}
	}
}
