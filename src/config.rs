use std::num::NonZeroUsize;
use std::time::Duration;

use crate::identity::ClusterName;
use crate::identity::NodeIdentity;
use crate::placement::PlacementStrategy;

/// How a scheduling pool is provided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolPolicy {
	/// Dedicated runtime with a fixed number of worker threads.
	Fixed(usize),
	/// Dedicated runtime sized for many concurrently waiting tasks.
	Cached,
	/// Spawn onto the runtime that started the stage.
	Shared,
}

impl PoolPolicy {
	pub fn cpu_default() -> Self {
		PoolPolicy::Fixed(
			std::thread::available_parallelism()
				.map(NonZeroUsize::get)
				.unwrap_or(4),
		)
	}
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
	#[error("cluster name must not be empty")]
	EmptyClusterName,

	#[error("node identity must not be empty")]
	EmptyNodeIdentity,

	#[error("{0} pool needs at least one worker")]
	EmptyPool(&'static str),

	#[error("{0} must be greater than zero")]
	ZeroDuration(&'static str),
}

/// Resolved configuration of a stage. Immutable once built.
#[derive(Debug, Clone)]
pub struct StageConfig {
	cluster_name: ClusterName,
	node_identity: NodeIdentity,
	cpu_pool: PoolPolicy,
	io_pool: PoolPolicy,
	tick_rate: Duration,
	actor_ttl: Duration,
	message_timeout: Duration,
	stop_timeout: Duration,
	placement: PlacementStrategy,
}

impl Default for StageConfig {
	fn default() -> Self {
		Self {
			cluster_name: ClusterName::default(),
			node_identity: NodeIdentity::random(),
			cpu_pool: PoolPolicy::cpu_default(),
			io_pool: PoolPolicy::Cached,
			tick_rate: Duration::from_millis(1000),
			actor_ttl: Duration::from_secs(10 * 60),
			message_timeout: Duration::from_secs(30),
			stop_timeout: Duration::from_secs(10),
			placement: PlacementStrategy::ConsistentHash,
		}
	}
}

impl StageConfig {
	pub fn builder() -> StageConfigBuilder {
		StageConfigBuilder {
			config: StageConfig::default(),
		}
	}

	pub fn cluster_name(&self) -> &ClusterName {
		&self.cluster_name
	}

	pub fn node_identity(&self) -> &NodeIdentity {
		&self.node_identity
	}

	pub fn cpu_pool(&self) -> &PoolPolicy {
		&self.cpu_pool
	}

	pub fn io_pool(&self) -> &PoolPolicy {
		&self.io_pool
	}

	/// Interval between maintenance ticks.
	pub fn tick_rate(&self) -> Duration {
		self.tick_rate
	}

	/// Idle time after which an activation is swept.
	pub fn actor_ttl(&self) -> Duration {
		self.actor_ttl
	}

	/// Deadline attached to forwarded invocations.
	pub fn message_timeout(&self) -> Duration {
		self.message_timeout
	}

	/// Upper bound for the graceful drain in `Stage::stop`.
	pub fn stop_timeout(&self) -> Duration {
		self.stop_timeout
	}

	pub fn placement(&self) -> &PlacementStrategy {
		&self.placement
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if self.cluster_name.as_str().is_empty() {
			return Err(ConfigError::EmptyClusterName);
		}
		if self.node_identity.as_str().is_empty() {
			return Err(ConfigError::EmptyNodeIdentity);
		}
		if self.cpu_pool == PoolPolicy::Fixed(0) {
			return Err(ConfigError::EmptyPool("cpu"));
		}
		if self.io_pool == PoolPolicy::Fixed(0) {
			return Err(ConfigError::EmptyPool("io"));
		}
		for (name, value) in [
			("tick rate", self.tick_rate),
			("actor ttl", self.actor_ttl),
			("message timeout", self.message_timeout),
		] {
			if value.is_zero() {
				return Err(ConfigError::ZeroDuration(name));
			}
		}
		Ok(())
	}
}

pub struct StageConfigBuilder {
	config: StageConfig,
}

impl StageConfigBuilder {
	pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
		self.config.cluster_name = ClusterName::new(name);
		self
	}

	pub fn node_identity(mut self, node: impl Into<String>) -> Self {
		self.config.node_identity = NodeIdentity::new(node);
		self
	}

	pub fn cpu_pool(mut self, policy: PoolPolicy) -> Self {
		self.config.cpu_pool = policy;
		self
	}

	pub fn io_pool(mut self, policy: PoolPolicy) -> Self {
		self.config.io_pool = policy;
		self
	}

	pub fn tick_rate(mut self, rate: Duration) -> Self {
		self.config.tick_rate = rate;
		self
	}

	pub fn actor_ttl(mut self, ttl: Duration) -> Self {
		self.config.actor_ttl = ttl;
		self
	}

	pub fn message_timeout(mut self, timeout: Duration) -> Self {
		self.config.message_timeout = timeout;
		self
	}

	pub fn stop_timeout(mut self, timeout: Duration) -> Self {
		self.config.stop_timeout = timeout;
		self
	}

	pub fn placement(mut self, placement: PlacementStrategy) -> Self {
		self.config.placement = placement;
		self
	}

	pub fn build(self) -> Result<StageConfig, ConfigError> {
		self.config.validate()?;
		Ok(self.config)
	}
}
