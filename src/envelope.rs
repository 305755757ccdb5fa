use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::InvocationError;
use crate::invocation::Invocation;
use crate::invocation::InvocationHandle;
use crate::invocation::InvocationState;
use crate::invocation::ReplySender;
use crate::invocation::Ticket;

/// Encoded arguments or reply of a method.
pub type Payload = serde_json::Value;

/// An invocation in flight together with the means to answer it.
///
/// Whoever holds the envelope owns the reply: it is completed exactly once,
/// either by the turn that runs it, by a remote reply, or by a failure.
pub(crate) struct Envelope {
	pub invocation: Invocation,
	pub ticket: Arc<Ticket>,
	reply: ReplySender,
}

impl Debug for Envelope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Envelope")
			.field("identity", &self.invocation.identity)
			.field("method", &self.invocation.method)
			.field("correlation_id", &self.invocation.correlation_id)
			.field("state", &self.ticket.state())
			.finish()
	}
}

impl Envelope {
	pub fn new<R>(invocation: Invocation) -> (Self, InvocationHandle<R>) {
		let (envelope, rx) = Self::detached(invocation);
		let handle = InvocationHandle::pending(rx, envelope.ticket.clone());
		(envelope, handle)
	}

	/// Envelope answered to a bare channel, used for inbound remote calls.
	pub fn detached(
		invocation: Invocation,
	) -> (Self, oneshot::Receiver<Result<Payload, InvocationError>>) {
		let (reply, rx) = oneshot::channel();
		let ticket = Ticket::new(invocation.correlation_id);
		(
			Self {
				invocation,
				ticket,
				reply,
			},
			rx,
		)
	}

	pub fn is_cancelled(&self) -> bool {
		self.ticket.is_cancelled()
	}

	pub fn state(&self) -> InvocationState {
		self.ticket.state()
	}

	/// Deliver the outcome. A caller that went away is not an error.
	pub fn complete(self, result: Result<Payload, InvocationError>) {
		self.ticket.finish(result.is_ok());
		let _ = self.reply.send(result);
	}

	pub fn fail(self, error: InvocationError) {
		self.complete(Err(error))
	}
}
