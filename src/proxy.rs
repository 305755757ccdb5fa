use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Weak;

use crate::actor::ActorInterface;
use crate::actor::Method;
use crate::catalog::ActorCatalog;
use crate::dispatcher::Dispatcher;
use crate::error::InvocationError;
use crate::error::ProxyError;
use crate::identity::ActorIdentity;
use crate::identity::ActorType;
use crate::invocation::InvocationHandle;
use crate::invocation::MethodSignature;

/// Typed address of one actor identity.
///
/// Holding a ref does not keep the actor, or the stage, alive. Invoking never
/// blocks; the returned handle resolves once the turn has run somewhere in
/// the cluster.
pub struct ActorRef<I> {
	identity: ActorIdentity,
	dispatcher: Weak<Dispatcher>,
	_interface: PhantomData<fn() -> I>,
}

impl<I> Clone for ActorRef<I> {
	fn clone(&self) -> Self {
		Self {
			identity: self.identity.clone(),
			dispatcher: self.dispatcher.clone(),
			_interface: PhantomData,
		}
	}
}

impl<I> fmt::Debug for ActorRef<I> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("ActorRef").field(&self.identity).finish()
	}
}

impl<I> PartialEq for ActorRef<I> {
	fn eq(&self, other: &Self) -> bool {
		self.identity == other.identity && Weak::ptr_eq(&self.dispatcher, &other.dispatcher)
	}
}

impl<I: ActorInterface> ActorRef<I> {
	pub fn identity(&self) -> &ActorIdentity {
		&self.identity
	}

	pub fn key(&self) -> &str {
		&self.identity.key
	}

	pub fn invoke<M>(&self, message: M) -> InvocationHandle<M::Reply>
	where
		M: Method<Interface = I>,
	{
		let Some(dispatcher) = self.dispatcher.upgrade() else {
			return InvocationHandle::failed(InvocationError::StageStopped);
		};

		let arguments = match serde_json::to_value(&message) {
			Ok(arguments) => arguments,
			Err(err) => return InvocationHandle::failed(InvocationError::codec(err)),
		};

		dispatcher.dispatch(self.identity.clone(), MethodSignature::of::<M>(), arguments)
	}
}

/// Caller-side view of an actor interface, built from its [`ActorRef`].
///
/// Typed adapters wrap the ref and expose one method per interface method:
///
/// ```ignore
/// pub struct CounterProxy(ActorRef<Counter>);
///
/// impl ActorProxy<Counter> for CounterProxy {
///     fn from_ref(actor: ActorRef<Counter>) -> Self {
///         CounterProxy(actor)
///     }
/// }
///
/// impl CounterProxy {
///     pub fn increment(&self, by: i64) -> InvocationHandle<i64> {
///         self.0.invoke(Increment { by })
///     }
/// }
/// ```
pub trait ActorProxy<I: ActorInterface>: Sized {
	fn from_ref(actor: ActorRef<I>) -> Self;
}

impl<I: ActorInterface> ActorProxy<I> for ActorRef<I> {
	fn from_ref(actor: ActorRef<I>) -> Self {
		actor
	}
}

/// Hands out proxies for the interfaces declared on a stage.
#[derive(Clone)]
pub struct ActorProxyFactory {
	dispatcher: Weak<Dispatcher>,
	catalog: Arc<ActorCatalog>,
}

impl ActorProxyFactory {
	pub(crate) fn new(dispatcher: Weak<Dispatcher>, catalog: Arc<ActorCatalog>) -> Self {
		Self { dispatcher, catalog }
	}

	/// Proxy for the actor of interface `I` with the given key.
	///
	/// Fails unless some actor implementation registered on the stage
	/// declares `I`. No activation happens until the first invocation.
	pub fn create_proxy<I: ActorInterface>(&self, key: impl Into<String>) -> Result<I::Proxy, ProxyError> {
		self.actor_ref::<I>(key).map(I::Proxy::from_ref)
	}

	pub fn actor_ref<I: ActorInterface>(&self, key: impl Into<String>) -> Result<ActorRef<I>, ProxyError> {
		if !self.catalog.declares(I::ACTOR_TYPE) {
			return Err(ProxyError::UndeclaredInterface(I::ACTOR_TYPE));
		}
		if self.dispatcher.strong_count() == 0 {
			return Err(ProxyError::StageStopped);
		}

		Ok(ActorRef {
			identity: ActorIdentity::new(ActorType::new(I::ACTOR_TYPE), key),
			dispatcher: self.dispatcher.clone(),
			_interface: PhantomData,
		})
	}
}
