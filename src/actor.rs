use std::fmt;
use std::future::Future;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ProxyError;
use crate::handler::Methods;
use crate::identity::ActorIdentity;
use crate::identity::NodeIdentity;
use crate::proxy::ActorProxy;
use crate::proxy::ActorProxyFactory;
use crate::proxy::ActorRef;

/// A declared actor interface: the type tag shared by callers and the
/// implementation, plus the proxy callers get for it.
pub trait ActorInterface: Sized + Send + Sync + 'static {
	const ACTOR_TYPE: &'static str;

	/// What `create_proxy` hands out. `ActorRef<Self>` works when no typed
	/// adapter is wanted.
	type Proxy: ActorProxy<Self>;
}

/// A method of an actor interface. The value carries the arguments.
pub trait Method: Serialize + DeserializeOwned + Send + 'static {
	type Interface: ActorInterface;
	type Reply: Serialize + DeserializeOwned + Send + 'static;

	const NAME: &'static str;
}

/// An actor implementation.
///
/// Instances are created on demand when an invocation arrives for an identity
/// that has no activation, and dropped after they have been idle for the
/// stage's actor ttl. At most one turn runs on an instance at a time.
pub trait Actor: Sized + Send + 'static {
	type Interface: ActorInterface;

	fn create(ctx: &ActorContext) -> anyhow::Result<Self>;

	/// Methods this implementation answers.
	fn methods(methods: &mut Methods<Self>);

	fn span(identity: &ActorIdentity) -> tracing::Span {
		tracing::info_span!("activation", actor = %identity)
	}

	/// Runs before the first turn. An error fails the activation and every
	/// invocation waiting on it.
	fn on_activate(&mut self, _ctx: &ActorContext) -> impl Future<Output = anyhow::Result<()>> + Send {
		futures::future::ready(Ok(()))
	}

	/// Runs after the last turn of a graceful deactivation.
	fn on_deactivate(&mut self, _ctx: &ActorContext) -> impl Future<Output = ()> + Send {
		futures::future::ready(())
	}
}

/// What an activation knows about itself and its stage.
#[derive(Clone)]
pub struct ActorContext {
	identity: ActorIdentity,
	node: NodeIdentity,
	proxies: ActorProxyFactory,
}

impl fmt::Debug for ActorContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ActorContext")
			.field("identity", &self.identity)
			.field("node", &self.node)
			.finish()
	}
}

impl ActorContext {
	pub(crate) fn new(identity: ActorIdentity, node: NodeIdentity, proxies: ActorProxyFactory) -> Self {
		Self {
			identity,
			node,
			proxies,
		}
	}

	pub fn identity(&self) -> &ActorIdentity {
		&self.identity
	}

	/// Stage hosting this activation.
	pub fn node(&self) -> &NodeIdentity {
		&self.node
	}

	pub fn proxies(&self) -> &ActorProxyFactory {
		&self.proxies
	}

	pub fn create_proxy<I: ActorInterface>(&self, key: impl Into<String>) -> Result<I::Proxy, ProxyError> {
		self.proxies.create_proxy::<I>(key)
	}

	pub fn actor_ref<I: ActorInterface>(&self, key: impl Into<String>) -> Result<ActorRef<I>, ProxyError> {
		self.proxies.actor_ref::<I>(key)
	}
}
