//! Placement: picks the candidate owner of an identity that has no activation.
//!
//! A placement decision is only a hint. The candidate still has to win the
//! claim in the cluster directory and bring its activation to Active.

use std::collections::BTreeSet;

use rand::seq::IteratorRandom;

use crate::identity::ActorIdentity;
use crate::identity::NodeIdentity;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PlacementStrategy {
	/// Rendezvous hashing of the identity over the membership.
	#[default]
	ConsistentHash,
	/// Always the given node, or the resolving node when it is not a member.
	Pinned(NodeIdentity),
	/// Uniformly random member.
	Random,
	/// The node that resolves the identity.
	PreferLocal,
}

impl PlacementStrategy {
	/// Candidate owner for `identity` given the current membership.
	///
	/// An empty membership view always resolves to `local`.
	pub fn resolve(
		&self,
		identity: &ActorIdentity,
		local: &NodeIdentity,
		members: &BTreeSet<NodeIdentity>,
	) -> NodeIdentity {
		if members.is_empty() {
			return local.clone();
		}

		match self {
			PlacementStrategy::ConsistentHash => members
				.iter()
				.max_by_key(|node| (score(identity, node), *node))
				.cloned()
				.unwrap_or_else(|| local.clone()),
			PlacementStrategy::Pinned(node) if members.contains(node) => node.clone(),
			PlacementStrategy::Pinned(_) => local.clone(),
			PlacementStrategy::Random => members
				.iter()
				.choose(&mut rand::thread_rng())
				.cloned()
				.unwrap_or_else(|| local.clone()),
			PlacementStrategy::PreferLocal => local.clone(),
		}
	}
}

/// Highest-random-weight score of `node` for `identity`.
///
/// Must be identical on every stage, so it avoids the randomly keyed std hasher.
fn score(identity: &ActorIdentity, node: &NodeIdentity) -> u64 {
	let mut hash = FNV_OFFSET;
	hash = fnv1a(hash, identity.actor_type.as_str().as_bytes());
	hash = fnv1a(hash, &[0]);
	hash = fnv1a(hash, identity.key.as_bytes());
	hash = fnv1a(hash, &[0]);
	hash = fnv1a(hash, node.as_str().as_bytes());
	mix(hash)
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;

fn fnv1a(mut hash: u64, data: &[u8]) -> u64 {
	for &byte in data {
		hash ^= byte as u64;
		hash = hash.wrapping_mul(0x100000001b3);
	}
	hash
}

// splitmix64 finalizer, spreads the low-entropy fnv output
fn mix(mut z: u64) -> u64 {
	z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
	z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
	z ^ (z >> 31)
}
