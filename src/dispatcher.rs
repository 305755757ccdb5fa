//! Routes invocations to the activation that owns their identity.
//!
//! Resolution order: a local activation, the cached location of a remote
//! one, the cluster directory, and finally placement. Stale routing
//! information is corrected by at most one retry.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::cancel::CancelToken;
use crate::cluster::ClusterBinding;
use crate::cluster::InboundHandler;
use crate::cluster::RemoteInvocation;
use crate::cluster::RemoteReply;
use crate::cluster::SerializedInvocation;
use crate::cluster::SerializedResult;
use crate::config::StageConfig;
use crate::directory::Directory;
use crate::envelope::Envelope;
use crate::envelope::Payload;
use crate::error::InvocationError;
use crate::error::RoutingError;
use crate::identity::ActorIdentity;
use crate::identity::ClusterName;
use crate::identity::NodeIdentity;
use crate::invocation::Invocation;
use crate::invocation::InvocationHandle;
use crate::invocation::MethodSignature;
use crate::placement::PlacementStrategy;
use crate::pool::Pool;
use crate::stage::StopReason;

enum Target {
	Local,
	Remote(NodeIdentity),
}

enum Routed {
	Done,
	/// Failed for a reason a fresh resolution may fix.
	Retry(Envelope, InvocationError),
}

pub struct Dispatcher {
	node: NodeIdentity,
	cluster_name: ClusterName,
	placement: PlacementStrategy,
	message_timeout: Duration,
	directory: Arc<Directory>,
	cluster: ClusterBinding,
	io: Arc<Pool>,
	locations: DashMap<ActorIdentity, NodeIdentity>,
	lanes: DashMap<ActorIdentity, mpsc::UnboundedSender<Envelope>>,
	correlation: AtomicU64,
	accepting: AtomicBool,
}

impl Dispatcher {
	pub(crate) fn new(config: &StageConfig, directory: Arc<Directory>, cluster: ClusterBinding, io: Arc<Pool>) -> Self {
		Self {
			node: config.node_identity().clone(),
			cluster_name: config.cluster_name().clone(),
			placement: config.placement().clone(),
			message_timeout: config.message_timeout(),
			directory,
			cluster,
			io,
			locations: DashMap::new(),
			lanes: DashMap::new(),
			correlation: AtomicU64::new(1),
			accepting: AtomicBool::new(false),
		}
	}

	pub fn node(&self) -> &NodeIdentity {
		&self.node
	}

	pub fn directory(&self) -> &Arc<Directory> {
		&self.directory
	}

	/// Last known remote owner of `identity`.
	pub fn cached_location(&self, identity: &ActorIdentity) -> Option<NodeIdentity> {
		self.locations.get(identity).map(|node| node.value().clone())
	}

	pub(crate) fn open(&self) {
		self.accepting.store(true, Ordering::Release);
	}

	pub(crate) fn close(&self) {
		self.accepting.store(false, Ordering::Release);
	}

	pub fn is_accepting(&self) -> bool {
		self.accepting.load(Ordering::Acquire)
	}

	pub(crate) fn inbound(self: &Arc<Self>) -> Arc<dyn InboundHandler> {
		Arc::new(Inbound(Arc::downgrade(self)))
	}

	/// Start an invocation. Never blocks.
	///
	/// Invocations on an identity that is Active on this stage are appended to
	/// its queue before returning. Everything else joins the identity's routing
	/// lane, which resolves and hands over one invocation at a time, so one
	/// caller's calls reach the actor in the order they were made.
	pub(crate) fn dispatch<R>(
		self: &Arc<Self>,
		identity: ActorIdentity,
		method: MethodSignature,
		arguments: Payload,
	) -> InvocationHandle<R> {
		if !self.is_accepting() {
			return InvocationHandle::failed(InvocationError::StageStopped);
		}

		let invocation = Invocation {
			identity,
			method,
			arguments,
			correlation_id: self.correlation.fetch_add(1, Ordering::Relaxed),
		};
		let (envelope, handle) = Envelope::new(invocation);
		let identity = envelope.invocation.identity.clone();

		// a lane still holding earlier calls must not be overtaken
		let envelope = match self.lanes.get(&identity) {
			Some(lane) => match lane.send(envelope) {
				Ok(()) => return handle,
				Err(err) => {
					err.0.fail(InvocationError::StageStopped);
					return handle;
				}
			},
			None => envelope,
		};

		let envelope = match self.directory.active(&identity) {
			Some(record) => {
				envelope.ticket.route();
				match record.submit(envelope) {
					Ok(()) => return handle,
					// deactivating, take the slow path
					Err(envelope) => envelope,
				}
			}
			None => envelope,
		};

		self.enqueue(identity, envelope);
		handle
	}

	fn enqueue(self: &Arc<Self>, identity: ActorIdentity, envelope: Envelope) {
		let rx = match self.lanes.entry(identity.clone()) {
			Entry::Occupied(lane) => {
				if let Err(err) = lane.get().send(envelope) {
					err.0.fail(InvocationError::StageStopped);
				}
				return;
			}
			Entry::Vacant(slot) => {
				let (tx, rx) = mpsc::unbounded_channel();
				// the receiver is alive, this cannot fail
				let _ = tx.send(envelope);
				slot.insert(tx);
				rx
			}
		};

		if self.io.spawn(self.clone().drain_lane(identity.clone(), rx)).is_none() {
			// the queued envelopes went down with the pool, their handles report StageStopped
			self.lanes.remove(&identity);
			tracing::debug!("io pool is down");
		}
	}

	/// Route the invocations of one identity strictly one after another.
	///
	/// A local invocation is done once it sits in the activation's queue, a
	/// forwarded one once its reply came back. The lane removes itself when it
	/// runs dry.
	async fn drain_lane(self: Arc<Self>, identity: ActorIdentity, mut rx: mpsc::UnboundedReceiver<Envelope>) {
		loop {
			match rx.try_recv() {
				Ok(envelope) => self.clone().route(envelope).await,
				Err(TryRecvError::Disconnected) => return,
				Err(TryRecvError::Empty) => {
					// senders hold the shard lock while sending, so nothing slips in here
					let closed = self
						.lanes
						.remove_if(&identity, |_, _| rx.is_empty())
						.is_some();
					if closed || !self.lanes.contains_key(&identity) {
						return;
					}
				}
			}
		}
	}

	async fn route(self: Arc<Self>, mut envelope: Envelope) {
		let mut retried = false;
		loop {
			match self.route_once(envelope).await {
				Routed::Done => return,
				Routed::Retry(again, error) if !retried => {
					retried = true;
					metrics::counter!("runy_stage.retries").increment(1);
					tracing::warn!(identity = %again.invocation.identity, %error, "retrying with fresh resolution");
					envelope = again;
				}
				Routed::Retry(envelope, error) => return envelope.fail(error),
			}
		}
	}

	async fn route_once(&self, envelope: Envelope) -> Routed {
		if envelope.is_cancelled() {
			envelope.fail(InvocationError::Cancelled);
			return Routed::Done;
		}
		envelope.ticket.route();

		let identity = envelope.invocation.identity.clone();
		match self.resolve(&identity).await {
			Target::Local => {
				tracing::debug!(%identity, "routing locally");
				self.execute_local(envelope).await
			}
			Target::Remote(node) => {
				tracing::debug!(%identity, %node, "forwarding");
				self.forward(node, envelope).await
			}
		}
	}

	async fn resolve(&self, identity: &ActorIdentity) -> Target {
		if self.directory.contains(identity) {
			return Target::Local;
		}
		if let Some(node) = self.cached_location(identity) {
			if node != self.node {
				return Target::Remote(node);
			}
		}

		let members = self.cluster.membership.current_membership(&self.cluster_name);
		if let Some(owner) = self.cluster.directory.lookup(&self.cluster_name, identity).await {
			if owner == self.node {
				return Target::Local;
			}
			if members.contains(&owner) {
				self.locations.insert(identity.clone(), owner.clone());
				return Target::Remote(owner);
			}
		}

		let candidate = self.placement.resolve(identity, &self.node, &members);
		if candidate == self.node {
			Target::Local
		} else {
			Target::Remote(candidate)
		}
	}

	async fn execute_local(&self, envelope: Envelope) -> Routed {
		let identity = envelope.invocation.identity.clone();
		match self.directory.get_or_activate(&identity).await {
			Ok(record) => match record.submit(envelope) {
				Ok(()) => Routed::Done,
				Err(envelope) => {
					record.removed().await;
					Routed::Retry(envelope, InvocationError::Reactivating { identity })
				}
			},
			Err(error @ InvocationError::Reactivating { .. }) => {
				self.directory.wait_removed(&identity).await;
				Routed::Retry(envelope, error)
			}
			Err(error) if error.is_transient() => {
				self.remember_owner(&identity, &error);
				Routed::Retry(envelope, error)
			}
			Err(error) => {
				envelope.fail(error);
				Routed::Done
			}
		}
	}

	async fn forward(&self, target: NodeIdentity, envelope: Envelope) -> Routed {
		if !envelope.ticket.forward() {
			envelope.fail(InvocationError::Cancelled);
			return Routed::Done;
		}

		let identity = envelope.invocation.identity.clone();
		let request = RemoteInvocation {
			cluster: self.cluster_name.clone(),
			source: self.node.clone(),
			invocation: envelope.invocation.clone(),
		};
		let bytes = match serde_json::to_vec(&request) {
			Ok(bytes) => bytes,
			Err(err) => {
				envelope.fail(InvocationError::codec(err));
				return Routed::Done;
			}
		};

		metrics::counter!("runy_stage.forwards").increment(1);
		let sent = tokio::time::timeout(
			self.message_timeout,
			self.cluster.transport.send_invocation(&target, bytes),
		)
		.await;

		let reply = match sent {
			Err(_) => {
				envelope.fail(InvocationError::Timeout {
					timeout: self.message_timeout,
				});
				return Routed::Done;
			}
			Ok(Err(err)) => {
				self.locations.remove(&identity);
				let error = InvocationError::Routing {
					identity,
					error: RoutingError::Unreachable {
						node: target,
						reason: err.to_string(),
					},
				};
				return Routed::Retry(envelope, error);
			}
			Ok(Ok(reply)) => reply,
		};

		match serde_json::from_slice::<RemoteReply>(&reply) {
			Ok(Ok(payload)) => {
				self.locations.insert(identity, target);
				envelope.complete(Ok(payload));
				Routed::Done
			}
			Ok(Err(InvocationError::StageStopped)) => {
				// the owner is shutting down, its claims are about to be released
				self.locations.remove(&identity);
				let error = InvocationError::Routing {
					identity,
					error: RoutingError::Unreachable {
						node: target,
						reason: "stage stopped".to_string(),
					},
				};
				Routed::Retry(envelope, error)
			}
			Ok(Err(error)) if error.is_transient() => {
				self.locations.remove(&identity);
				self.remember_owner(&identity, &error);
				Routed::Retry(envelope, error)
			}
			Ok(Err(error)) => {
				envelope.fail(error);
				Routed::Done
			}
			Err(err) => {
				envelope.fail(InvocationError::codec(err));
				Routed::Done
			}
		}
	}

	fn remember_owner(&self, identity: &ActorIdentity, error: &InvocationError) {
		if let InvocationError::Routing {
			error: RoutingError::NotOwner { owner: Some(owner), .. },
			..
		} = error
		{
			if owner != &self.node {
				self.locations.insert(identity.clone(), owner.clone());
			}
		}
	}

	/// Run an invocation forwarded by another stage.
	async fn serve_remote(self: Arc<Self>, bytes: SerializedInvocation) -> RemoteReply {
		let request: RemoteInvocation = serde_json::from_slice(&bytes).map_err(InvocationError::codec)?;
		let identity = request.invocation.identity.clone();

		if request.cluster != self.cluster_name {
			return Err(InvocationError::Routing {
				identity,
				error: RoutingError::ClusterMismatch {
					expected: self.cluster_name.clone(),
					actual: request.cluster,
				},
			});
		}
		if !self.is_accepting() {
			return Err(InvocationError::StageStopped);
		}
		tracing::debug!(%identity, source = %request.source, "serving forwarded invocation");

		// the caller resolved from a hint, make sure nobody else owns it
		if !self.directory.contains(&identity) {
			let owner = self.cluster.directory.lookup(&self.cluster_name, &identity).await;
			if let Some(owner) = owner.filter(|owner| owner != &self.node) {
				let members = self.cluster.membership.current_membership(&self.cluster_name);
				if members.contains(&owner) {
					return Err(InvocationError::Routing {
						identity,
						error: RoutingError::NotOwner {
							node: self.node.clone(),
							owner: Some(owner),
						},
					});
				}
			}
		}

		let (envelope, reply) = Envelope::detached(request.invocation);
		envelope.ticket.route();

		let mut envelope = envelope;
		let mut retried = false;
		loop {
			match self.execute_local(envelope).await {
				Routed::Done => break,
				Routed::Retry(again, InvocationError::Reactivating { .. }) if !retried => {
					retried = true;
					envelope = again;
				}
				Routed::Retry(envelope, error) => {
					envelope.fail(error);
					break;
				}
			}
		}

		reply.await.unwrap_or(Err(InvocationError::StageStopped))
	}

	/// Drop cached locations that point at departed nodes, and local
	/// activations whose claim moved elsewhere.
	pub(crate) async fn watch_membership(self: Arc<Self>, token: CancelToken<StopReason>) {
		let mut changes = self.cluster.membership.subscribe();
		loop {
			tokio::select! {
				_ = token.cancelled() => break,
				changed = changes.changed() => {
					if changed.is_err() {
						break;
					}
				}
			}

			let members = self.cluster.membership.current_membership(&self.cluster_name);
			let before = self.locations.len();
			self.locations.retain(|_, node| members.contains(node));
			tracing::debug!(
				members = members.len(),
				invalidated = before.saturating_sub(self.locations.len()),
				"membership changed"
			);

			let fenced = self.directory.fence(!members.contains(&self.node)).await;
			if fenced > 0 {
				tracing::warn!(fenced, "dropped activations owned elsewhere");
			}
		}
	}
}

/// Transport-facing side of a dispatcher. Weak, so a bound transport does not
/// keep a dropped stage alive.
struct Inbound(Weak<Dispatcher>);

impl InboundHandler for Inbound {
	fn handle(&self, invocation: SerializedInvocation) -> BoxFuture<'static, SerializedResult> {
		let Some(dispatcher) = self.0.upgrade() else {
			return futures::future::ready(encode_reply(&Err(InvocationError::StageStopped))).boxed();
		};

		// runs on this stage's io pool, so a caller giving up does not cancel it
		let io = dispatcher.io.clone();
		match io.spawn(dispatcher.serve_remote(invocation)) {
			Some(task) => task
				.map(|joined| {
					let reply = joined.unwrap_or(Err(InvocationError::StageStopped));
					encode_reply(&reply)
				})
				.boxed(),
			None => futures::future::ready(encode_reply(&Err(InvocationError::StageStopped))).boxed(),
		}
	}
}

fn encode_reply(reply: &RemoteReply) -> SerializedResult {
	serde_json::to_vec(reply)
		.or_else(|err| serde_json::to_vec(&RemoteReply::Err(InvocationError::codec(err))))
		.unwrap_or_default()
}
