use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use super::Claim;
use super::ClusterBinding;
use super::ClusterDirectory;
use super::InboundHandler;
use super::Membership;
use super::SerializedInvocation;
use super::SerializedResult;
use super::Transport;
use crate::error::TransportError;
use crate::identity::ActorIdentity;
use crate::identity::ClusterName;
use crate::identity::NodeIdentity;

/// In-process cluster: transport, membership and claim registry over shared
/// memory. Clones share state.
#[derive(Clone)]
pub struct LocalCluster {
	inner: Arc<Inner>,
}

struct Inner {
	lease: Option<Duration>,
	bindings: DashMap<NodeIdentity, Arc<dyn InboundHandler>>,
	members: DashMap<NodeIdentity, Member>,
	claims: DashMap<(ClusterName, ActorIdentity), NodeIdentity>,
	partitioned: Mutex<HashSet<NodeIdentity>>,
	version: watch::Sender<u64>,
}

struct Member {
	cluster: ClusterName,
	renewed: Instant,
	expired: bool,
}

impl Default for LocalCluster {
	fn default() -> Self {
		Self::new()
	}
}

impl LocalCluster {
	pub fn new() -> Self {
		Self::build(None)
	}

	/// Members whose lease is not renewed within `lease` drop out of membership.
	pub fn with_lease(lease: Duration) -> Self {
		Self::build(Some(lease))
	}

	fn build(lease: Option<Duration>) -> Self {
		Self {
			inner: Arc::new(Inner {
				lease,
				bindings: DashMap::new(),
				members: DashMap::new(),
				claims: DashMap::new(),
				partitioned: Mutex::new(HashSet::new()),
				version: watch::Sender::new(0),
			}),
		}
	}

	pub fn binding(&self) -> ClusterBinding {
		let this = Arc::new(self.clone());
		ClusterBinding::new(this.clone(), this.clone(), this)
	}

	/// Make every send to `node` fail until [`heal`](Self::heal).
	pub fn partition(&self, node: &NodeIdentity) {
		self.inner.partitioned.lock().insert(node.clone());
	}

	pub fn heal(&self, node: &NodeIdentity) {
		self.inner.partitioned.lock().remove(node);
	}

	/// Number of claims held in `cluster`.
	pub fn claims(&self, cluster: &ClusterName) -> usize {
		self.inner
			.claims
			.iter()
			.filter(|claim| &claim.key().0 == cluster)
			.count()
	}

	fn bump(&self) {
		self.inner.version.send_modify(|version| *version += 1);
	}

	fn is_live(&self, member: &Member, now: Instant) -> bool {
		match self.inner.lease {
			Some(lease) => !member.expired && now.saturating_duration_since(member.renewed) < lease,
			None => true,
		}
	}
}

impl Transport for LocalCluster {
	fn bind(
		&self,
		node: &NodeIdentity,
		cluster: &ClusterName,
		inbound: Arc<dyn InboundHandler>,
	) -> Result<(), TransportError> {
		match self.inner.bindings.entry(node.clone()) {
			Entry::Occupied(_) => Err(TransportError::Other(format!("{node} is already bound"))),
			Entry::Vacant(slot) => {
				slot.insert(inbound);
				tracing::debug!(%node, %cluster, "bound to local transport");
				Ok(())
			}
		}
	}

	fn unbind(&self, node: &NodeIdentity) {
		self.inner.bindings.remove(node);
	}

	fn send_invocation(
		&self,
		target: &NodeIdentity,
		invocation: SerializedInvocation,
	) -> BoxFuture<'static, Result<SerializedResult, TransportError>> {
		if self.inner.partitioned.lock().contains(target) {
			return futures::future::ready(Err(TransportError::Unreachable(target.clone()))).boxed();
		}

		let inbound = self.inner.bindings.get(target).map(|binding| binding.value().clone());
		match inbound {
			Some(inbound) => inbound.handle(invocation).map(Ok).boxed(),
			None => futures::future::ready(Err(TransportError::NotBound(target.clone()))).boxed(),
		}
	}
}

impl Membership for LocalCluster {
	fn join(&self, node: &NodeIdentity, cluster: &ClusterName) {
		self.inner.members.insert(
			node.clone(),
			Member {
				cluster: cluster.clone(),
				renewed: Instant::now(),
				expired: false,
			},
		);
		tracing::debug!(%node, %cluster, "joined");
		self.bump();
	}

	fn leave(&self, node: &NodeIdentity) {
		if self.inner.members.remove(node).is_some() {
			tracing::debug!(%node, "left");
			self.bump();
		}
	}

	fn current_membership(&self, cluster: &ClusterName) -> BTreeSet<NodeIdentity> {
		let now = Instant::now();
		self.inner
			.members
			.iter()
			.filter(|member| &member.cluster == cluster && self.is_live(member, now))
			.map(|member| member.key().clone())
			.collect()
	}

	fn subscribe(&self) -> watch::Receiver<u64> {
		self.inner.version.subscribe()
	}

	fn renew(&self, node: &NodeIdentity) -> anyhow::Result<()> {
		let Some(lease) = self.inner.lease else {
			return Ok(());
		};
		let now = Instant::now();
		let mut changed = false;

		for mut member in self.inner.members.iter_mut() {
			if member.key() == node {
				member.renewed = now;
				if member.expired {
					member.expired = false;
					changed = true;
				}
			} else if !member.expired && now.saturating_duration_since(member.renewed) >= lease {
				tracing::warn!(node = %member.key(), "membership lease expired");
				member.expired = true;
				changed = true;
			}
		}

		if !self.inner.members.contains_key(node) {
			anyhow::bail!("{node} renewed a lease without joining");
		}
		if changed {
			self.bump();
		}
		Ok(())
	}
}

impl ClusterDirectory for LocalCluster {
	fn lookup(&self, cluster: &ClusterName, identity: &ActorIdentity) -> BoxFuture<'static, Option<NodeIdentity>> {
		let owner = self
			.inner
			.claims
			.get(&(cluster.clone(), identity.clone()))
			.map(|owner| owner.value().clone());
		futures::future::ready(owner).boxed()
	}

	fn claim(
		&self,
		cluster: &ClusterName,
		identity: &ActorIdentity,
		node: &NodeIdentity,
		live: &BTreeSet<NodeIdentity>,
	) -> BoxFuture<'static, Claim> {
		let claim = match self.inner.claims.entry((cluster.clone(), identity.clone())) {
			Entry::Vacant(slot) => {
				slot.insert(node.clone());
				Claim::Granted
			}
			Entry::Occupied(mut slot) => {
				let owner = slot.get().clone();
				if &owner == node {
					Claim::Granted
				} else if !live.contains(&owner) {
					tracing::debug!(%identity, from = %owner, to = %node, "taking over claim of departed node");
					slot.insert(node.clone());
					Claim::Granted
				} else {
					Claim::Owned(owner)
				}
			}
		};
		futures::future::ready(claim).boxed()
	}

	fn release(&self, cluster: &ClusterName, identity: &ActorIdentity, node: &NodeIdentity) -> BoxFuture<'static, ()> {
		self.inner
			.claims
			.remove_if(&(cluster.clone(), identity.clone()), |_, owner| owner == node);
		futures::future::ready(()).boxed()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn node(name: &str) -> NodeIdentity {
		NodeIdentity::new(name)
	}

	#[test]
	fn membership_is_scoped_by_cluster() {
		let cluster = LocalCluster::new();
		let c1 = ClusterName::new("c1");
		let c2 = ClusterName::new("c2");
		cluster.join(&node("a"), &c1);
		cluster.join(&node("b"), &c1);
		cluster.join(&node("c"), &c2);

		assert_eq!(cluster.current_membership(&c1), [node("a"), node("b")].into_iter().collect());
		assert_eq!(cluster.current_membership(&c2), [node("c")].into_iter().collect());

		let rx = cluster.subscribe();
		cluster.leave(&node("a"));
		assert!(rx.has_changed().unwrap());
		assert_eq!(cluster.current_membership(&c1), [node("b")].into_iter().collect());
	}

	#[tokio::test]
	async fn claims_are_exclusive_among_live_nodes() {
		let cluster = LocalCluster::new();
		let c1 = ClusterName::new("c1");
		let id = ActorIdentity::new("Counter", "x");
		let live: BTreeSet<_> = [node("a"), node("b")].into_iter().collect();

		assert_eq!(cluster.claim(&c1, &id, &node("a"), &live).await, Claim::Granted);
		assert_eq!(cluster.claim(&c1, &id, &node("a"), &live).await, Claim::Granted);
		assert_eq!(cluster.claim(&c1, &id, &node("b"), &live).await, Claim::Owned(node("a")));
		assert_eq!(cluster.lookup(&c1, &id).await, Some(node("a")));

		// another cluster has its own namespace
		let c2 = ClusterName::new("c2");
		assert_eq!(cluster.claim(&c2, &id, &node("b"), &live).await, Claim::Granted);

		cluster.release(&c1, &id, &node("b")).await;
		assert_eq!(cluster.lookup(&c1, &id).await, Some(node("a")));
		cluster.release(&c1, &id, &node("a")).await;
		assert_eq!(cluster.lookup(&c1, &id).await, None);
		assert_eq!(cluster.claims(&c1), 0);
	}

	#[tokio::test]
	async fn claims_of_departed_nodes_are_taken_over() {
		let cluster = LocalCluster::new();
		let c1 = ClusterName::new("c1");
		let id = ActorIdentity::new("Counter", "x");
		let everyone: BTreeSet<_> = [node("a"), node("b")].into_iter().collect();
		let only_b: BTreeSet<_> = [node("b")].into_iter().collect();

		assert_eq!(cluster.claim(&c1, &id, &node("a"), &everyone).await, Claim::Granted);
		assert_eq!(cluster.claim(&c1, &id, &node("b"), &only_b).await, Claim::Granted);
		assert_eq!(cluster.lookup(&c1, &id).await, Some(node("b")));
	}

	#[tokio::test]
	async fn expired_lease_drops_member() {
		let cluster = LocalCluster::with_lease(Duration::from_millis(50));
		let c1 = ClusterName::new("c1");
		cluster.join(&node("a"), &c1);
		cluster.join(&node("b"), &c1);

		tokio::time::sleep(Duration::from_millis(80)).await;
		cluster.renew(&node("a")).unwrap();

		assert_eq!(cluster.current_membership(&c1), [node("a")].into_iter().collect());
		assert!(cluster.renew(&node("z")).is_err());
	}

	#[tokio::test]
	async fn partitioned_node_is_unreachable() {
		struct Echo;

		impl InboundHandler for Echo {
			fn handle(&self, invocation: SerializedInvocation) -> BoxFuture<'static, SerializedResult> {
				futures::future::ready(invocation).boxed()
			}
		}

		let cluster = LocalCluster::new();
		let c1 = ClusterName::new("c1");
		cluster.bind(&node("a"), &c1, Arc::new(Echo)).unwrap();
		assert!(cluster.bind(&node("a"), &c1, Arc::new(Echo)).is_err());

		assert_eq!(cluster.send_invocation(&node("a"), vec![1, 2]).await, Ok(vec![1, 2]));

		cluster.partition(&node("a"));
		assert_eq!(
			cluster.send_invocation(&node("a"), vec![1]).await,
			Err(TransportError::Unreachable(node("a")))
		);
		cluster.heal(&node("a"));

		cluster.unbind(&node("a"));
		assert_eq!(
			cluster.send_invocation(&node("a"), vec![1]).await,
			Err(TransportError::NotBound(node("a")))
		);
	}
}
