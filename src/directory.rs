//! Local actor directory: which identities have an activation on this stage.
//!
//! At most one activation per identity exists here, and at most one
//! activation attempt is in flight per identity. Every caller that arrives
//! while an attempt is running observes that attempt's outcome.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt as _;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::Instrument;

use crate::actor::ActorContext;
use crate::cancel::CancelToken;
use crate::catalog::ActorCatalog;
use crate::cluster::Claim;
use crate::cluster::ClusterBinding;
use crate::error::InvocationError;
use crate::error::RoutingError;
use crate::identity::ActorIdentity;
use crate::identity::ClusterName;
use crate::identity::NodeIdentity;
use crate::pool::Pool;
use crate::proxy::ActorProxyFactory;
use crate::queue::ActivationRecord;
use crate::queue::ActivationState;
use crate::queue::TurnWorker;
use crate::queue::panic_message;
use crate::stage::StopReason;
use crate::stats::ActivationStats;

type Outcome = Option<Result<Arc<ActivationRecord>, InvocationError>>;

enum Slot {
	Activating(watch::Receiver<Outcome>),
	Ready(Arc<ActivationRecord>),
}

pub struct Directory {
	node: NodeIdentity,
	cluster_name: ClusterName,
	slots: DashMap<ActorIdentity, Slot>,
	catalog: Arc<ActorCatalog>,
	cluster: ClusterBinding,
	proxies: ActorProxyFactory,
	stats: Arc<ActivationStats>,
	cpu: Arc<Pool>,
	token: CancelToken<StopReason>,
	closed: AtomicBool,
}

impl Directory {
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn new(
		node: NodeIdentity,
		cluster_name: ClusterName,
		catalog: Arc<ActorCatalog>,
		cluster: ClusterBinding,
		proxies: ActorProxyFactory,
		stats: Arc<ActivationStats>,
		cpu: Arc<Pool>,
		token: CancelToken<StopReason>,
	) -> Self {
		Self {
			node,
			cluster_name,
			slots: DashMap::new(),
			catalog,
			cluster,
			proxies,
			stats,
			cpu,
			token,
			closed: AtomicBool::new(false),
		}
	}

	pub fn state(&self, identity: &ActorIdentity) -> ActivationState {
		match self.slots.get(identity).as_deref() {
			None => ActivationState::Absent,
			Some(Slot::Activating(_)) => ActivationState::Activating,
			Some(Slot::Ready(record)) => record.state(),
		}
	}

	/// Identities with a slot on this stage, in any state but Absent.
	pub fn identities(&self) -> BTreeSet<ActorIdentity> {
		self.slots.iter().map(|slot| slot.key().clone()).collect()
	}

	pub fn len(&self) -> usize {
		self.slots.len()
	}

	pub fn is_empty(&self) -> bool {
		self.slots.is_empty()
	}

	pub fn record(&self, identity: &ActorIdentity) -> Option<Arc<ActivationRecord>> {
		match self.slots.get(identity).as_deref() {
			Some(Slot::Ready(record)) => Some(record.clone()),
			_ => None,
		}
	}

	/// The record of an Active activation, if there is one right now.
	pub(crate) fn active(&self, identity: &ActorIdentity) -> Option<Arc<ActivationRecord>> {
		self.record(identity)
			.filter(|record| record.state() == ActivationState::Active)
	}

	pub(crate) fn contains(&self, identity: &ActorIdentity) -> bool {
		self.slots.contains_key(identity)
	}

	/// Return the Active record for `identity`, activating it here first if needed.
	pub async fn get_or_activate(
		self: &Arc<Self>,
		identity: &ActorIdentity,
	) -> Result<Arc<ActivationRecord>, InvocationError> {
		let mut outcome = match self.slots.entry(identity.clone()) {
			Entry::Occupied(slot) => match slot.get() {
				Slot::Ready(record) if record.state() == ActivationState::Active => {
					return Ok(record.clone());
				}
				Slot::Ready(_) => {
					return Err(InvocationError::Reactivating {
						identity: identity.clone(),
					});
				}
				Slot::Activating(outcome) => outcome.clone(),
			},
			Entry::Vacant(slot) => {
				if self.closed.load(Ordering::Acquire) {
					return Err(InvocationError::StageStopped);
				}
				let (tx, rx) = watch::channel(None);
				slot.insert(Slot::Activating(rx.clone()));
				self.spawn_activation(identity.clone(), tx);
				rx
			}
		};

		let result = match outcome.wait_for(Option::is_some).await {
			Ok(outcome) => (*outcome).clone(),
			Err(_) => None,
		};
		result.unwrap_or(Err(InvocationError::StageStopped))
	}

	fn spawn_activation(self: &Arc<Self>, identity: ActorIdentity, tx: watch::Sender<Outcome>) {
		let guard = ActivationGuard {
			directory: self.clone(),
			identity: identity.clone(),
			tx: Some(tx),
		};

		let directory = self.clone();
		let spawned = self.cpu.spawn(async move {
			let mut guard = guard;
			let result = match AssertUnwindSafe(directory.activate(&identity)).catch_unwind().await {
				Ok(result) => result,
				Err(panic) => {
					let reason = format!("activation panicked: {}", panic_message(panic));
					directory.stats.failed(&identity.actor_type);
					directory
						.cluster
						.directory
						.release(&directory.cluster_name, &identity, &directory.node)
						.await;
					tracing::error!(%identity, %reason, "activation failed");
					Err(InvocationError::Activation {
						identity: identity.clone(),
						reason,
					})
				}
			};
			guard.complete(result);
		});

		// a pool that is already gone dropped the future, and with it the guard
		if spawned.is_none() {
			tracing::debug!("cpu pool is down, activation abandoned");
		}
	}

	async fn activate(&self, identity: &ActorIdentity) -> Result<Arc<ActivationRecord>, InvocationError> {
		let factory = self
			.catalog
			.get(&identity.actor_type)
			.ok_or_else(|| InvocationError::Routing {
				identity: identity.clone(),
				error: RoutingError::UnknownActorType(identity.actor_type.clone()),
			})?;

		let members = self.cluster.membership.current_membership(&self.cluster_name);
		let claim = self
			.cluster
			.directory
			.claim(&self.cluster_name, identity, &self.node, &members)
			.await;
		if let Claim::Owned(owner) = claim {
			tracing::debug!(%identity, %owner, "activation claimed elsewhere");
			return Err(InvocationError::Routing {
				identity: identity.clone(),
				error: RoutingError::NotOwner {
					node: self.node.clone(),
					owner: Some(owner),
				},
			});
		}

		let span = factory.span(identity);
		let ctx = ActorContext::new(identity.clone(), self.node.clone(), self.proxies.clone());
		let instance = match factory.activate(&ctx).instrument(span.clone()).await {
			Ok(instance) => instance,
			Err(err) => {
				self.stats.failed(&identity.actor_type);
				self.cluster
					.directory
					.release(&self.cluster_name, identity, &self.node)
					.await;
				tracing::error!(%identity, error = %format!("{err:#}"), "activation failed");
				return Err(InvocationError::Activation {
					identity: identity.clone(),
					reason: format!("{err:#}"),
				});
			}
		};

		let (record, rx) = ActivationRecord::new(identity.clone(), self.node.clone(), self.token.child());
		let worker = TurnWorker::new(instance, ctx, record.clone(), rx);
		if self.cpu.spawn(worker.run().instrument(span)).is_none() {
			self.cluster
				.directory
				.release(&self.cluster_name, identity, &self.node)
				.await;
			return Err(InvocationError::StageStopped);
		}

		self.stats.activated(&identity.actor_type);
		tracing::info!(%identity, node = %self.node, "activated");
		Ok(record)
	}

	/// Wait until the current record of `identity`, if any, has left the directory.
	pub(crate) async fn wait_removed(&self, identity: &ActorIdentity) {
		if let Some(record) = self.record(identity) {
			record.removed().await;
		}
	}

	/// Deactivate the activation of `identity`, if it has one.
	///
	/// Turns admitted before the call still run. Returns once the record is gone.
	pub async fn deactivate(&self, identity: &ActorIdentity) -> bool {
		match self.record(identity) {
			Some(record) => {
				self.deactivate_record(&record).await;
				true
			}
			None => false,
		}
	}

	async fn deactivate_record(&self, record: &Arc<ActivationRecord>) {
		if !record.begin_deactivation() {
			// someone else is deactivating it
			record.removed().await;
			return;
		}

		record.drained().await;
		self.remove(record).await;
	}

	async fn remove(&self, record: &Arc<ActivationRecord>) {
		let identity = record.identity();
		let removed = self
			.slots
			.remove_if(identity, |_, slot| {
				matches!(slot, Slot::Ready(current) if Arc::ptr_eq(current, record))
			})
			.is_some();

		if removed {
			self.cluster
				.directory
				.release(&self.cluster_name, identity, &self.node)
				.await;
			self.stats.deactivated(&identity.actor_type);
			tracing::info!(%identity, "deactivated");
		}
		record.mark_absent();
	}

	/// Deactivate every Active activation idle for at least `threshold`.
	pub async fn sweep_idle(&self, now: Instant, threshold: Duration) -> usize {
		let idle: Vec<_> = self
			.slots
			.iter()
			.filter_map(|slot| match slot.value() {
				Slot::Ready(record) if record.is_idle(now, threshold) => Some(record.clone()),
				_ => None,
			})
			.collect();

		if !idle.is_empty() {
			tracing::debug!(count = idle.len(), "sweeping idle activations");
		}

		futures::future::join_all(idle.iter().map(|record| self.deactivate_record(record))).await;
		idle.len()
	}

	/// Whether this stage has dropped out of its cluster's membership view.
	pub(crate) fn is_evicted(&self) -> bool {
		!self
			.cluster
			.membership
			.current_membership(&self.cluster_name)
			.contains(&self.node)
	}

	/// Drop local activations whose cluster claim now belongs to another node.
	///
	/// With `evicted` set this stage has dropped out of membership and may have
	/// lost any claim, so every activation goes. Fenced activations are
	/// force-stopped: their running and queued turns fail and the deactivation
	/// hook is skipped.
	pub async fn fence(&self, evicted: bool) -> usize {
		let records: Vec<_> = self
			.slots
			.iter()
			.filter_map(|slot| match slot.value() {
				Slot::Ready(record) => Some(record.clone()),
				Slot::Activating(_) => None,
			})
			.collect();

		let mut fenced = 0;
		for record in records {
			let identity = record.identity();
			let owner = self.cluster.directory.lookup(&self.cluster_name, identity).await;
			let lost = owner.as_ref().is_some_and(|owner| owner != &self.node);
			if !evicted && !lost {
				continue;
			}

			tracing::warn!(%identity, ?owner, evicted, "activation lost its claim, dropping it");
			record.begin_deactivation();
			record.force_stop();
			self.remove(&record).await;
			fenced += 1;
		}
		fenced
	}

	/// Refuse new activations, then deactivate everything.
	///
	/// Whatever has not drained within `timeout` is force-stopped.
	pub async fn deactivate_all(&self, timeout: Duration) {
		self.closed.store(true, Ordering::Release);
		let deadline = Instant::now() + timeout;

		let pending: Vec<_> = self
			.slots
			.iter()
			.filter_map(|slot| match slot.value() {
				Slot::Activating(outcome) => Some(outcome.clone()),
				Slot::Ready(_) => None,
			})
			.collect();
		let settle = futures::future::join_all(pending.into_iter().map(|mut outcome| async move {
			let _ = outcome.wait_for(Option::is_some).await;
		}));
		let _ = tokio::time::timeout_at(deadline, settle).await;

		let records: Vec<_> = self
			.slots
			.iter()
			.filter_map(|slot| match slot.value() {
				Slot::Ready(record) => Some(record.clone()),
				Slot::Activating(_) => None,
			})
			.collect();

		let graceful = futures::future::join_all(records.iter().map(|record| self.deactivate_record(record)));
		if tokio::time::timeout_at(deadline, graceful).await.is_ok() {
			return;
		}

		tracing::warn!(?timeout, "graceful deactivation timed out, forcing");
		let remaining: Vec<_> = self
			.slots
			.iter()
			.filter_map(|slot| match slot.value() {
				Slot::Ready(record) => Some(record.clone()),
				Slot::Activating(_) => None,
			})
			.collect();
		for record in &remaining {
			record.begin_deactivation();
			record.force_stop();
			self.remove(record).await;
		}
	}
}

/// Settles a single-flight activation attempt exactly once, even if the
/// task running it is dropped before finishing.
struct ActivationGuard {
	directory: Arc<Directory>,
	identity: ActorIdentity,
	tx: Option<watch::Sender<Outcome>>,
}

impl ActivationGuard {
	fn complete(&mut self, result: Result<Arc<ActivationRecord>, InvocationError>) {
		let Some(tx) = self.tx.take() else {
			return;
		};

		match &result {
			Ok(record) => {
				self.directory
					.slots
					.insert(self.identity.clone(), Slot::Ready(record.clone()));
			}
			Err(_) => {
				self.directory
					.slots
					.remove_if(&self.identity, |_, slot| matches!(slot, Slot::Activating(_)));
			}
		}
		tx.send_replace(Some(result));
	}
}

impl Drop for ActivationGuard {
	fn drop(&mut self) {
		self.complete(Err(InvocationError::StageStopped));
	}
}
