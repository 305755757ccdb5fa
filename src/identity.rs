use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

/// Type tag of an actor interface.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorType(Arc<str>);

impl ActorType {
	pub fn new(name: impl Into<Arc<str>>) -> Self {
		Self(name.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Borrow<str> for ActorType {
	fn borrow(&self) -> &str {
		&self.0
	}
}

impl From<&'static str> for ActorType {
	fn from(name: &'static str) -> Self {
		Self::new(name)
	}
}

impl fmt::Debug for ActorType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(&*self.0, f)
	}
}

impl fmt::Display for ActorType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Logical name of an actor: its type plus an opaque key.
///
/// Identities are compared exactly, keys are never normalized. Rendered as
/// `Type/key`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorIdentity {
	pub actor_type: ActorType,
	pub key: String,
}

impl ActorIdentity {
	pub fn new(actor_type: impl Into<ActorType>, key: impl Into<String>) -> Self {
		Self {
			actor_type: actor_type.into(),
			key: key.into(),
		}
	}
}

impl fmt::Debug for ActorIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ActorIdentity({}/{})", self.actor_type, self.key)
	}
}

impl fmt::Display for ActorIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.actor_type, self.key)
	}
}

/// Unique name of a stage within a cluster.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeIdentity(String);

impl NodeIdentity {
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	pub fn random() -> Self {
		Self(uuid::Uuid::new_v4().simple().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for NodeIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "NodeIdentity({})", self.0)
	}
}

impl fmt::Display for NodeIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Scopes which stages may talk to each other.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterName(String);

impl ClusterName {
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Default for ClusterName {
	fn default() -> Self {
		Self::new("orbit-cluster")
	}
}

impl fmt::Debug for ClusterName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ClusterName({})", self.0)
	}
}

impl fmt::Display for ClusterName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}
