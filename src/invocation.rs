use std::fmt;
use std::future::IntoFuture;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::sync::watch;

use crate::actor::Method;
use crate::envelope::Payload;
use crate::error::InvocationError;
use crate::identity::ActorIdentity;

/// Interface and method name of an invoked method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodSignature {
	pub interface: String,
	pub name: String,
}

impl MethodSignature {
	pub fn of<M: Method>() -> Self {
		Self {
			interface: <M::Interface as crate::actor::ActorInterface>::ACTOR_TYPE.to_string(),
			name: M::NAME.to_string(),
		}
	}
}

impl fmt::Display for MethodSignature {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}", self.interface, self.name)
	}
}

/// One call on one actor. Created per call and gone once its reply is observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
	pub identity: ActorIdentity,
	pub method: MethodSignature,
	pub arguments: Payload,
	pub correlation_id: u64,
}

/// Progress of an invocation.
///
/// `Created → Routed → (Executing | Forwarded) → Completed | Failed`. A forwarded
/// invocation may fall back to `Routed` when its target turned out stale and
/// it is resolved again. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
	Created,
	Routed,
	Executing,
	Forwarded,
	Completed,
	Failed,
}

impl InvocationState {
	pub fn is_terminal(self) -> bool {
		matches!(self, InvocationState::Completed | InvocationState::Failed)
	}
}

#[derive(Debug, Clone, Copy)]
struct Progress {
	state: InvocationState,
	cancelled: bool,
}

/// Shared progress record of one invocation, seen by both the caller's handle
/// and whoever currently carries the invocation.
pub(crate) struct Ticket {
	correlation_id: u64,
	progress: watch::Sender<Progress>,
}

impl Ticket {
	pub(crate) fn new(correlation_id: u64) -> Arc<Self> {
		Arc::new(Self {
			correlation_id,
			progress: watch::Sender::new(Progress {
				state: InvocationState::Created,
				cancelled: false,
			}),
		})
	}

	pub(crate) fn correlation_id(&self) -> u64 {
		self.correlation_id
	}

	pub(crate) fn state(&self) -> InvocationState {
		self.progress.borrow().state
	}

	pub(crate) fn is_cancelled(&self) -> bool {
		self.progress.borrow().cancelled
	}

	fn transition(&self, from: &[InvocationState], to: InvocationState) -> bool {
		self.progress.send_if_modified(|progress| {
			if from.contains(&progress.state) {
				progress.state = to;
				true
			} else {
				false
			}
		})
	}

	pub(crate) fn route(&self) -> bool {
		self.transition(
			&[InvocationState::Created, InvocationState::Forwarded],
			InvocationState::Routed,
		)
	}

	/// Turn start. Fails when the caller cancelled first.
	pub(crate) fn start(&self) -> bool {
		self.transition(&[InvocationState::Routed], InvocationState::Executing)
	}

	pub(crate) fn forward(&self) -> bool {
		self.transition(&[InvocationState::Routed], InvocationState::Forwarded)
	}

	pub(crate) fn finish(&self, success: bool) -> bool {
		let to = if success {
			InvocationState::Completed
		} else {
			InvocationState::Failed
		};
		self.transition(
			&[
				InvocationState::Created,
				InvocationState::Routed,
				InvocationState::Executing,
				InvocationState::Forwarded,
			],
			to,
		)
	}

	pub(crate) fn cancel(&self) -> bool {
		self.progress.send_if_modified(|progress| match progress.state {
			InvocationState::Created | InvocationState::Routed => {
				progress.state = InvocationState::Failed;
				progress.cancelled = true;
				true
			}
			_ => false,
		})
	}

	async fn cancelled(&self) {
		let mut rx = self.progress.subscribe();
		if rx.wait_for(|progress| progress.cancelled).await.is_ok() {
			return;
		}
		std::future::pending::<()>().await
	}
}

pub(crate) type ReplySender = oneshot::Sender<Result<Payload, InvocationError>>;
type ReplyReceiver = oneshot::Receiver<Result<Payload, InvocationError>>;

enum Pending {
	Waiting { rx: ReplyReceiver, ticket: Arc<Ticket> },
	Failed(InvocationError),
	Consumed,
}

/// Completion handle of an invocation, returned to the caller immediately.
///
/// Resolves exactly once, with the decoded reply or the failure. Can be
/// `.await`ed directly.
pub struct InvocationHandle<R> {
	pending: Pending,
	timeout: Option<Duration>,
	_reply: PhantomData<fn() -> R>,
}

impl<R> fmt::Debug for InvocationHandle<R> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("InvocationHandle")
			.field("correlation_id", &self.correlation_id())
			.field("state", &self.state())
			.finish()
	}
}

impl<R> InvocationHandle<R> {
	pub(crate) fn pending(rx: ReplyReceiver, ticket: Arc<Ticket>) -> Self {
		Self {
			pending: Pending::Waiting { rx, ticket },
			timeout: None,
			_reply: PhantomData,
		}
	}

	pub(crate) fn failed(error: InvocationError) -> Self {
		Self {
			pending: Pending::Failed(error),
			timeout: None,
			_reply: PhantomData,
		}
	}

	/// Fail with `Timeout` if no reply arrives within `timeout`.
	///
	/// Only the wait is bounded; a turn that already started still runs.
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	/// Cancel the invocation if it has not started executing or been forwarded.
	pub fn cancel(&self) -> bool {
		match &self.pending {
			Pending::Waiting { ticket, .. } => ticket.cancel(),
			_ => false,
		}
	}

	pub fn state(&self) -> InvocationState {
		match &self.pending {
			Pending::Waiting { ticket, .. } => ticket.state(),
			Pending::Failed(_) => InvocationState::Failed,
			Pending::Consumed => InvocationState::Completed,
		}
	}

	pub fn correlation_id(&self) -> Option<u64> {
		match &self.pending {
			Pending::Waiting { ticket, .. } => Some(ticket.correlation_id()),
			_ => None,
		}
	}
}

impl<R: DeserializeOwned> InvocationHandle<R> {
	/// Wait for the reply.
	pub async fn reply(self) -> Result<R, InvocationError> {
		let (rx, ticket) = match self.pending {
			Pending::Waiting { rx, ticket } => (rx, ticket),
			Pending::Failed(error) => return Err(error),
			Pending::Consumed => return Err(InvocationError::codec("reply already taken")),
		};

		let wait = async {
			tokio::select! {
				biased;
				_ = ticket.cancelled() => Err(InvocationError::Cancelled),
				result = rx => match result {
					Ok(result) => result,
					// the carrier was dropped, which only happens when its pool is gone
					Err(_) => Err(InvocationError::StageStopped),
				},
			}
		};

		let payload = match self.timeout {
			Some(timeout) => tokio::time::timeout(timeout, wait)
				.await
				.unwrap_or(Err(InvocationError::Timeout { timeout }))?,
			None => wait.await?,
		};

		serde_json::from_value(payload).map_err(InvocationError::codec)
	}

	/// Take the reply if it is already there.
	pub fn try_reply(&mut self) -> Result<Option<R>, InvocationError> {
		let result = match &mut self.pending {
			Pending::Waiting { rx, ticket } => {
				if ticket.is_cancelled() {
					Err(InvocationError::Cancelled)
				} else {
					match rx.try_recv() {
						Ok(result) => result,
						Err(oneshot::error::TryRecvError::Empty) => return Ok(None),
						Err(oneshot::error::TryRecvError::Closed) => Err(InvocationError::StageStopped),
					}
				}
			}
			Pending::Failed(error) => Err(error.clone()),
			Pending::Consumed => return Err(InvocationError::codec("reply already taken")),
		};

		self.pending = Pending::Consumed;
		let payload = result?;
		serde_json::from_value(payload)
			.map(Some)
			.map_err(InvocationError::codec)
	}
}

impl<R> IntoFuture for InvocationHandle<R>
where
	R: DeserializeOwned + Send + 'static,
{
	type Output = Result<R, InvocationError>;
	type IntoFuture = BoxFuture<'static, Self::Output>;

	fn into_future(self) -> Self::IntoFuture {
		self.reply().boxed()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ticket_follows_the_state_machine() {
		let ticket = Ticket::new(1);
		assert_eq!(ticket.state(), InvocationState::Created);
		assert!(!ticket.start(), "cannot execute before routing");
		assert!(ticket.route());
		assert!(ticket.start());
		assert!(!ticket.forward(), "executing invocations are not forwarded");
		assert!(!ticket.cancel(), "started turns are not cancellable");
		assert!(ticket.finish(true));
		assert_eq!(ticket.state(), InvocationState::Completed);
		assert!(!ticket.finish(false), "terminal states are final");
		assert!(!ticket.route());
	}

	#[test]
	fn forwarded_invocation_can_be_rerouted() {
		let ticket = Ticket::new(2);
		assert!(ticket.route());
		assert!(ticket.forward());
		assert!(!ticket.cancel());
		assert!(ticket.route());
		assert_eq!(ticket.state(), InvocationState::Routed);
	}

	#[test]
	fn cancel_before_start_wins_over_start() {
		let ticket = Ticket::new(3);
		assert!(ticket.route());
		assert!(ticket.cancel());
		assert!(ticket.is_cancelled());
		assert!(!ticket.start());
		assert_eq!(ticket.state(), InvocationState::Failed);
	}

	#[tokio::test]
	async fn cancelled_handle_resolves_without_reply() {
		let ticket = Ticket::new(4);
		let (_tx, rx) = oneshot::channel();
		let handle = InvocationHandle::<u32>::pending(rx, ticket.clone());
		assert!(ticket.route());
		assert!(handle.cancel());
		assert_eq!(handle.await, Err(InvocationError::Cancelled));
	}

	#[tokio::test]
	async fn handle_times_out_while_waiting() {
		let ticket = Ticket::new(5);
		let (_tx, rx) = oneshot::channel();
		let handle = InvocationHandle::<u32>::pending(rx, ticket).timeout(Duration::from_millis(20));
		assert_eq!(
			handle.await,
			Err(InvocationError::Timeout {
				timeout: Duration::from_millis(20)
			})
		);
	}

	#[test]
	fn try_reply_decodes_ready_value() {
		let ticket = Ticket::new(6);
		let (tx, rx) = oneshot::channel();
		let mut handle = InvocationHandle::<u32>::pending(rx, ticket);
		assert_eq!(handle.try_reply(), Ok(None));
		tx.send(Ok(serde_json::json!(7))).unwrap();
		assert_eq!(handle.try_reply(), Ok(Some(7)));
		assert_eq!(handle.state(), InvocationState::Completed);
	}
}
