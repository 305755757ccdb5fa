mod actor;
mod cancel;
mod catalog;
pub mod cluster;
mod config;
mod directory;
mod dispatcher;
mod drop;
mod envelope;
mod error;
mod handler;
mod identity;
mod invocation;
mod placement;
mod pool;
mod proxy;
mod queue;
mod stage;
mod stats;

pub mod prelude {
	pub use super::actor::Actor;
	pub use super::actor::ActorContext;
	pub use super::actor::ActorInterface;
	pub use super::actor::Method;
	pub use super::handler::Call;
	pub use super::handler::Handler;
	pub use super::handler::Methods;
	pub use super::invocation::InvocationHandle;
	pub use super::proxy::ActorProxy;
	pub use super::proxy::ActorRef;
}

pub use actor::Actor;
pub use actor::ActorContext;
pub use actor::ActorInterface;
pub use actor::Method;
pub use cancel::CancelReason;
pub use cancel::CancelToken;
pub use cluster::ClusterBinding;
pub use cluster::LocalCluster;
pub use config::ConfigError;
pub use config::PoolPolicy;
pub use config::StageConfig;
pub use config::StageConfigBuilder;
pub use directory::Directory;
pub use dispatcher::Dispatcher;
pub use envelope::Payload;
pub use error::InvocationError;
pub use error::ProxyError;
pub use error::RoutingError;
pub use error::StageError;
pub use error::TransportError;
pub use handler::Call;
pub use handler::Handler;
pub use handler::Methods;
pub use identity::ActorIdentity;
pub use identity::ActorType;
pub use identity::ClusterName;
pub use identity::NodeIdentity;
pub use invocation::Invocation;
pub use invocation::InvocationHandle;
pub use invocation::InvocationState;
pub use invocation::MethodSignature;
pub use placement::PlacementStrategy;
pub use proxy::ActorProxy;
pub use proxy::ActorProxyFactory;
pub use proxy::ActorRef;
pub use queue::ActivationRecord;
pub use queue::ActivationState;
pub use stage::Stage;
pub use stage::StageBuilder;
pub use stage::StageState;
pub use stage::StopReason;
pub use stage::TickHook;
pub use stats::ActivationCounts;
pub use stats::ActivationStats;
pub use stats::Report;
