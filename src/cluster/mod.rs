//! Collaborators a stage needs from its cluster: a transport for forwarded
//! invocations, a membership view and a cluster-wide claim registry.
//!
//! [`LocalCluster`] implements all three in memory so that several stages in
//! one process form a cluster.

mod local;

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;

use crate::envelope::Payload;
use crate::error::InvocationError;
use crate::error::TransportError;
use crate::identity::ActorIdentity;
use crate::identity::ClusterName;
use crate::identity::NodeIdentity;
use crate::invocation::Invocation;

pub use local::LocalCluster;

pub type SerializedInvocation = Vec<u8>;
pub type SerializedResult = Vec<u8>;

/// Receives invocations forwarded to a bound node.
pub trait InboundHandler: Send + Sync + 'static {
	fn handle(&self, invocation: SerializedInvocation) -> BoxFuture<'static, SerializedResult>;
}

pub trait Transport: Send + Sync + 'static {
	fn bind(
		&self,
		node: &NodeIdentity,
		cluster: &ClusterName,
		inbound: Arc<dyn InboundHandler>,
	) -> Result<(), TransportError>;

	fn unbind(&self, node: &NodeIdentity);

	fn send_invocation(
		&self,
		target: &NodeIdentity,
		invocation: SerializedInvocation,
	) -> BoxFuture<'static, Result<SerializedResult, TransportError>>;
}

pub trait Membership: Send + Sync + 'static {
	fn join(&self, node: &NodeIdentity, cluster: &ClusterName);

	fn leave(&self, node: &NodeIdentity);

	fn current_membership(&self, cluster: &ClusterName) -> BTreeSet<NodeIdentity>;

	/// Ticks whenever the membership of any cluster changes.
	fn subscribe(&self) -> watch::Receiver<u64>;

	/// Keep `node`'s lease alive. Called from the stage tick loop.
	fn renew(&self, _node: &NodeIdentity) -> anyhow::Result<()> {
		Ok(())
	}
}

/// Outcome of claiming an identity for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
	Granted,
	/// A live node already owns the identity.
	Owned(NodeIdentity),
}

/// Cluster-wide registry of which node hosts which identity.
pub trait ClusterDirectory: Send + Sync + 'static {
	fn lookup(&self, cluster: &ClusterName, identity: &ActorIdentity) -> BoxFuture<'static, Option<NodeIdentity>>;

	/// Claim `identity` for `node`. Claims held by nodes outside `live` are taken over.
	fn claim(
		&self,
		cluster: &ClusterName,
		identity: &ActorIdentity,
		node: &NodeIdentity,
		live: &BTreeSet<NodeIdentity>,
	) -> BoxFuture<'static, Claim>;

	/// Drop `node`'s claim on `identity`. Claims of other nodes are left alone.
	fn release(&self, cluster: &ClusterName, identity: &ActorIdentity, node: &NodeIdentity) -> BoxFuture<'static, ()>;
}

/// The cluster a stage joins.
#[derive(Clone)]
pub struct ClusterBinding {
	pub transport: Arc<dyn Transport>,
	pub membership: Arc<dyn Membership>,
	pub directory: Arc<dyn ClusterDirectory>,
}

impl ClusterBinding {
	pub fn new(
		transport: Arc<dyn Transport>,
		membership: Arc<dyn Membership>,
		directory: Arc<dyn ClusterDirectory>,
	) -> Self {
		Self {
			transport,
			membership,
			directory,
		}
	}

	/// A private single-node cluster.
	pub fn standalone() -> Self {
		LocalCluster::new().binding()
	}
}

/// What travels to the owner of a forwarded invocation.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RemoteInvocation {
	pub cluster: ClusterName,
	pub source: NodeIdentity,
	pub invocation: Invocation,
}

pub(crate) type RemoteReply = Result<Payload, InvocationError>;
