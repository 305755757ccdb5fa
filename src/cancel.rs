use std::fmt::Debug;
use std::future::Future;
use std::ops::Deref;
use std::panic::Location;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch::Receiver;
use tokio::sync::watch::Sender;

/// Hierarchical cancellation signal carrying a reason.
///
/// Cancelling a token cancels every child created from it. The stage owns the
/// root; the tick loop, the membership watcher and each activation worker hold
/// children.
#[derive(Clone)]
pub struct CancelToken<T: Clone> {
	inner: Arc<TreeNode<T>>,
}

impl<T: Clone> Default for CancelToken<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: Clone + Debug> Debug for CancelToken<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CancelToken")
			.field("state", &*self.inner.state.borrow())
			.finish()
	}
}

impl<T: Clone> CancelToken<T> {
	pub fn new() -> Self {
		CancelToken {
			inner: TreeNode::new(),
		}
	}

	#[track_caller]
	pub fn cancel<V: Into<T>>(&self, reason: V) {
		self.inner
			.cancel_with_reason(CancelReason::new_with_loc(reason.into(), Location::caller()))
	}

	pub fn is_cancelled(&self) -> bool {
		matches!(&*self.inner.state.borrow(), State::Cancelled(_))
	}

	pub fn reason(&self) -> Option<CancelReason<T>> {
		match &*self.inner.state.borrow() {
			State::Running => None,
			State::Cancelled(reason) => Some(reason.clone()),
		}
	}

	/// Resolves once the token is cancelled.
	pub fn cancelled(&self) -> impl Future<Output = CancelReason<T>> + Send + 'static
	where
		T: Send + Sync + 'static,
	{
		TreeNode::cancelled(self.inner.state.subscribe())
	}

	pub fn child(&self) -> CancelToken<T> {
		CancelToken {
			inner: self.inner.child(),
		}
	}
}

#[derive(Debug)]
pub enum State<T> {
	Running,
	Cancelled(CancelReason<T>),
}

#[derive(Debug, PartialEq, Eq)]
pub struct CancelReason<T> {
	value: T,
	location: &'static Location<'static>,
}

impl<T> CancelReason<T> {
	pub fn new_with_loc(value: T, location: &'static Location<'static>) -> Self {
		Self { value, location }
	}

	pub fn value(&self) -> &T {
		&self.value
	}

	/// Where `cancel` was called.
	pub fn location(&self) -> &'static Location<'static> {
		self.location
	}
}

impl<T: Clone> Clone for CancelReason<T> {
	fn clone(&self) -> Self {
		CancelReason {
			value: self.value.clone(),
			location: self.location,
		}
	}
}

struct TreeNode<T: Clone> {
	state: Sender<State<T>>,
	children: Mutex<Vec<Arc<TreeNode<T>>>>,
}

impl<T: Clone> TreeNode<T> {
	fn new() -> Arc<Self> {
		Arc::new(Self {
			state: Sender::new(State::Running),
			children: Mutex::new(Vec::new()),
		})
	}

	fn child(self: &Arc<Self>) -> Arc<Self> {
		let mut children = self.children.lock();
		match *self.state.borrow() {
			State::Running => {
				// finished workers leave their nodes behind, drop them here
				children.retain(|child| Arc::strong_count(child) > 1);
				let node = TreeNode::new();
				children.push(node.clone());
				node
			}
			// already cancelled, the child is born cancelled
			State::Cancelled(_) => self.clone(),
		}
	}

	async fn cancelled(mut recv: Receiver<State<T>>) -> CancelReason<T> {
		{
			let result = recv
				.wait_for(|state| matches!(state, State::Cancelled(_)))
				.await;

			if let Ok(state) = result {
				if let State::Cancelled(reason) = &*state {
					return reason.clone();
				}
			}
		}

		// sender dropped without cancelling: never resolves
		std::future::pending().await
	}

	fn cancel_with_reason(&self, reason: CancelReason<T>) {
		// locking to prevent adding new children while we are cancelling
		let children = self.children.lock();

		let need_cancel = self.state.send_if_modified(|state| match state {
			State::Running => {
				*state = State::Cancelled(reason.clone());
				true
			}
			State::Cancelled(_) => false,
		});

		if need_cancel {
			for child in children.deref() {
				child.cancel_with_reason(reason.clone())
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	#[tokio::test]
	async fn cancelling_parent_reaches_children() {
		let root = CancelToken::<&'static str>::new();
		let child = root.child();
		let grandchild = child.child();

		root.cancel("stop");

		let reason = tokio::time::timeout(Duration::from_secs(1), grandchild.cancelled())
			.await
			.unwrap();
		assert_eq!(*reason.value(), "stop");
		assert!(child.is_cancelled());
	}

	#[tokio::test]
	async fn cancelling_child_leaves_parent_running() {
		let root = CancelToken::<()>::new();
		let child = root.child();
		child.cancel(());
		assert!(child.is_cancelled());
		assert!(!root.is_cancelled());
		assert!(root.reason().is_none());
	}

	#[test]
	fn child_of_cancelled_token_is_cancelled() {
		let root = CancelToken::<u8>::new();
		root.cancel(7u8);
		let child = root.child();
		assert_eq!(child.reason().map(|r| *r.value()), Some(7));
	}

	#[test]
	fn first_reason_wins() {
		let root = CancelToken::<u8>::new();
		root.cancel(1u8);
		root.cancel(2u8);
		assert_eq!(root.reason().map(|r| *r.value()), Some(1));
	}
}
