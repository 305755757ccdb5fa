use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use futures::FutureExt as _;
use futures::future::BoxFuture;

use crate::actor::Actor;
use crate::actor::ActorContext;
use crate::actor::Method;
use crate::envelope::Payload;
use crate::error::InvocationError;
use crate::invocation::MethodSignature;

/// Implementation of one interface method.
pub trait Handler<M: Method>: Actor<Interface = M::Interface> {
	fn handle<'a>(
		&'a mut self,
		call: Call<'a>,
		message: M,
	) -> impl Future<Output = anyhow::Result<M::Reply>> + Send;
}

/// Context of the turn currently running. Derefs to the activation's
/// [`ActorContext`].
#[derive(Clone, Copy)]
pub struct Call<'a> {
	ctx: &'a ActorContext,
	method: &'a MethodSignature,
	correlation_id: u64,
}

impl<'a> Call<'a> {
	pub(crate) fn new(ctx: &'a ActorContext, method: &'a MethodSignature, correlation_id: u64) -> Self {
		Self {
			ctx,
			method,
			correlation_id,
		}
	}

	pub fn method(&self) -> &'a MethodSignature {
		self.method
	}

	pub fn correlation_id(&self) -> u64 {
		self.correlation_id
	}
}

impl Deref for Call<'_> {
	type Target = ActorContext;

	fn deref(&self) -> &Self::Target {
		self.ctx
	}
}

pub(crate) type MethodFn<A> =
	for<'a> fn(&'a mut A, Call<'a>, Payload) -> BoxFuture<'a, Result<Payload, InvocationError>>;

/// Method table of an actor implementation, keyed by method name.
pub struct Methods<A> {
	table: HashMap<&'static str, MethodFn<A>>,
}

impl<A: Actor> Methods<A> {
	pub(crate) fn collect() -> Self {
		let mut methods = Methods {
			table: HashMap::new(),
		};
		A::methods(&mut methods);
		methods
	}

	/// Answer `M` with `A`'s `Handler<M>` implementation.
	pub fn add<M>(&mut self) -> &mut Self
	where
		M: Method,
		A: Handler<M>,
	{
		self.table.insert(M::NAME, run_method::<A, M>);
		self
	}

	pub fn contains(&self, name: &str) -> bool {
		self.table.contains_key(name)
	}

	fn get(&self, name: &str) -> Option<MethodFn<A>> {
		self.table.get(name).copied()
	}
}

fn run_method<'a, A, M>(
	actor: &'a mut A,
	call: Call<'a>,
	arguments: Payload,
) -> BoxFuture<'a, Result<Payload, InvocationError>>
where
	A: Handler<M>,
	M: Method,
{
	async move {
		let message: M = serde_json::from_value(arguments).map_err(InvocationError::codec)?;
		match actor.handle(call, message).await {
			Ok(reply) => serde_json::to_value(reply).map_err(InvocationError::codec),
			Err(err) => Err(InvocationError::TurnExecution {
				identity: call.identity().clone(),
				method: M::NAME.to_string(),
				reason: format!("{err:#}"),
			}),
		}
	}
	.boxed()
}

/// Type-erased live actor instance driven by its turn worker.
pub(crate) trait Instance: Send + 'static {
	fn invoke<'a>(&'a mut self, call: Call<'a>, arguments: Payload) -> BoxFuture<'a, Result<Payload, InvocationError>>;

	fn deactivate<'a>(&'a mut self, ctx: &'a ActorContext) -> BoxFuture<'a, ()>;
}

pub(crate) struct Hosted<A> {
	actor: A,
	methods: Arc<Methods<A>>,
}

impl<A: Actor> Hosted<A> {
	pub(crate) fn new(actor: A, methods: Arc<Methods<A>>) -> Self {
		Self { actor, methods }
	}
}

impl<A: Actor> Instance for Hosted<A> {
	fn invoke<'a>(&'a mut self, call: Call<'a>, arguments: Payload) -> BoxFuture<'a, Result<Payload, InvocationError>> {
		match self.methods.get(&call.method().name) {
			Some(method) => method(&mut self.actor, call, arguments),
			None => futures::future::ready(Err(InvocationError::TurnExecution {
				identity: call.identity().clone(),
				method: call.method().name.clone(),
				reason: "no such method".to_string(),
			}))
			.boxed(),
		}
	}

	fn deactivate<'a>(&'a mut self, ctx: &'a ActorContext) -> BoxFuture<'a, ()> {
		self.actor.on_deactivate(ctx).boxed()
	}
}
