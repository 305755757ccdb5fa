use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::config::ConfigError;
use crate::identity::ActorIdentity;
use crate::identity::ActorType;
use crate::identity::ClusterName;
use crate::identity::NodeIdentity;
use crate::stage::StageState;

/// Failure of a single invocation, as observed by its caller.
///
/// Cloneable so that one activation failure can be delivered to every caller
/// queued on it, and serializable so it can travel back from a remote stage.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationError {
	#[error("activation of {identity} failed: {reason}")]
	Activation {
		identity: ActorIdentity,
		reason: String,
	},

	#[error("routing of {identity} failed: {error}")]
	Routing {
		identity: ActorIdentity,
		#[source]
		error: RoutingError,
	},

	#[error("{identity}.{method} failed: {reason}")]
	TurnExecution {
		identity: ActorIdentity,
		method: String,
		reason: String,
	},

	#[error("no reply within {timeout:?}")]
	Timeout { timeout: Duration },

	#[error("invocation cancelled before it started")]
	Cancelled,

	#[error("{identity} is deactivating")]
	Reactivating { identity: ActorIdentity },

	#[error("stage is not accepting invocations")]
	StageStopped,

	#[error("codec error: {reason}")]
	Codec { reason: String },
}

impl InvocationError {
	/// Errors caused by a stale view of the cluster, worth one fresh resolution.
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			InvocationError::Routing { .. } | InvocationError::Reactivating { .. }
		)
	}

	pub(crate) fn codec(err: impl std::fmt::Display) -> Self {
		InvocationError::Codec {
			reason: err.to_string(),
		}
	}
}

/// Why an identity could not be routed to an owner.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingError {
	#[error("node {node} does not own the activation (owner hint: {owner:?})")]
	NotOwner {
		node: NodeIdentity,
		owner: Option<NodeIdentity>,
	},

	#[error("node {node} is unreachable: {reason}")]
	Unreachable { node: NodeIdentity, reason: String },

	#[error("cluster mismatch: expected {expected}, got {actual}")]
	ClusterMismatch {
		expected: ClusterName,
		actual: ClusterName,
	},

	#[error("no actor implementation registered for {0}")]
	UnknownActorType(ActorType),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
	#[error("node {0} is unreachable")]
	Unreachable(NodeIdentity),

	#[error("node {0} is not bound to the transport")]
	NotBound(NodeIdentity),

	#[error("transport failure: {0}")]
	Other(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("{0} is not a declared actor interface on this stage")]
	UndeclaredInterface(&'static str),

	#[error("stage is gone")]
	StageStopped,
}

#[derive(thiserror::Error, Debug)]
pub enum StageError {
	#[error("stage is {actual:?}, expected {expected:?}")]
	InvalidState {
		expected: StageState,
		actual: StageState,
	},

	#[error("two implementations registered for actor type {0}")]
	DuplicateActorType(ActorType),

	#[error("invalid configuration: {0}")]
	Config(#[from] ConfigError),

	#[error("failed to build {name} pool: {source}")]
	Pool {
		name: &'static str,
		#[source]
		source: std::io::Error,
	},

	#[error("cluster failure: {0}")]
	Cluster(#[from] TransportError),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn only_cluster_view_errors_are_transient() {
		let identity = ActorIdentity::new("Counter", "x");

		assert!(
			InvocationError::Reactivating {
				identity: identity.clone()
			}
			.is_transient()
		);
		assert!(
			InvocationError::Routing {
				identity: identity.clone(),
				error: RoutingError::NotOwner {
					node: NodeIdentity::new("a"),
					owner: None,
				},
			}
			.is_transient()
		);
		assert!(
			!InvocationError::TurnExecution {
				identity: identity.clone(),
				method: "get".into(),
				reason: "boom".into(),
			}
			.is_transient()
		);
		assert!(
			!InvocationError::Activation {
				identity,
				reason: "boom".into(),
			}
			.is_transient()
		);
		assert!(!InvocationError::Cancelled.is_transient());
	}

	#[test]
	fn errors_cross_the_wire_intact() {
		let err = InvocationError::Timeout {
			timeout: Duration::from_millis(250),
		};
		let json = serde_json::to_vec(&err).unwrap();
		let back: InvocationError = serde_json::from_slice(&json).unwrap();
		assert_eq!(back, err);
	}
}
