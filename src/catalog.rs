use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt as _;
use futures::future::BoxFuture;

use crate::actor::Actor;
use crate::actor::ActorContext;
use crate::actor::ActorInterface;
use crate::error::StageError;
use crate::handler::Hosted;
use crate::handler::Instance;
use crate::handler::Methods;
use crate::identity::ActorIdentity;
use crate::identity::ActorType;

/// Creates activations of one registered actor implementation.
pub(crate) trait ActorFactory: Send + Sync + 'static {
	fn span(&self, identity: &ActorIdentity) -> tracing::Span;

	/// Construct the instance and run its activation hook.
	fn activate<'a>(&'a self, ctx: &'a ActorContext) -> BoxFuture<'a, anyhow::Result<Box<dyn Instance>>>;
}

struct TypedFactory<A: Actor> {
	methods: Arc<Methods<A>>,
	_actor: PhantomData<fn() -> A>,
}

impl<A: Actor> ActorFactory for TypedFactory<A> {
	fn span(&self, identity: &ActorIdentity) -> tracing::Span {
		A::span(identity)
	}

	fn activate<'a>(&'a self, ctx: &'a ActorContext) -> BoxFuture<'a, anyhow::Result<Box<dyn Instance>>> {
		async move {
			let mut actor = A::create(ctx)?;
			actor.on_activate(ctx).await?;
			Ok(Box::new(Hosted::new(actor, self.methods.clone())) as Box<dyn Instance>)
		}
		.boxed()
	}
}

/// Actor implementations known to a stage, one per actor type.
#[derive(Default)]
pub(crate) struct ActorCatalog {
	factories: HashMap<ActorType, Arc<dyn ActorFactory>>,
}

impl ActorCatalog {
	pub fn register<A: Actor>(&mut self) -> Result<(), StageError> {
		let actor_type = ActorType::new(<A::Interface as ActorInterface>::ACTOR_TYPE);
		if self.factories.contains_key(&actor_type) {
			return Err(StageError::DuplicateActorType(actor_type));
		}

		let factory = TypedFactory::<A> {
			methods: Arc::new(Methods::collect()),
			_actor: PhantomData,
		};
		self.factories.insert(actor_type, Arc::new(factory));
		Ok(())
	}

	pub fn get(&self, actor_type: &ActorType) -> Option<Arc<dyn ActorFactory>> {
		self.factories.get(actor_type).cloned()
	}

	pub fn declares(&self, actor_type: &str) -> bool {
		self.factories.contains_key(actor_type)
	}

	pub fn actor_types(&self) -> impl Iterator<Item = &ActorType> {
		self.factories.keys()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::proxy::ActorRef;

	struct Echo;

	impl ActorInterface for Echo {
		const ACTOR_TYPE: &'static str = "Echo";
		type Proxy = ActorRef<Self>;
	}

	struct EchoActor;

	impl Actor for EchoActor {
		type Interface = Echo;

		fn create(_: &ActorContext) -> anyhow::Result<Self> {
			Ok(EchoActor)
		}

		fn methods(_: &mut Methods<Self>) {}
	}

	struct OtherEchoActor;

	impl Actor for OtherEchoActor {
		type Interface = Echo;

		fn create(_: &ActorContext) -> anyhow::Result<Self> {
			Ok(OtherEchoActor)
		}

		fn methods(_: &mut Methods<Self>) {}
	}

	#[test]
	fn one_implementation_per_actor_type() {
		let mut catalog = ActorCatalog::default();
		catalog.register::<EchoActor>().unwrap();
		assert!(catalog.declares("Echo"));
		assert!(!catalog.declares("echo"));

		match catalog.register::<OtherEchoActor>() {
			Err(StageError::DuplicateActorType(actor_type)) => assert_eq!(actor_type.as_str(), "Echo"),
			other => panic!("unexpected {other:?}"),
		}
		assert_eq!(catalog.actor_types().count(), 1);
	}
}
