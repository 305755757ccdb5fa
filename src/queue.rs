//! Turn queue: one FIFO and one worker per activation.
//!
//! The worker owns the actor instance and runs at most one turn at a time,
//! in admission order. Admission closes when the activation starts
//! deactivating; what was admitted before that still runs.

use std::any::Any;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt as _;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::actor::ActorContext;
use crate::cancel::CancelToken;
use crate::envelope::Envelope;
use crate::error::InvocationError;
use crate::handler::Call;
use crate::handler::Instance;
use crate::identity::ActorIdentity;
use crate::identity::NodeIdentity;
use crate::stage::StopReason;

/// Lifecycle of an identity on one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
	Absent,
	Activating,
	Active,
	Deactivating,
}

/// The live activation of one identity on this stage.
pub struct ActivationRecord {
	identity: ActorIdentity,
	owner: NodeIdentity,
	activated_at: Instant,
	last_activity: Mutex<Instant>,
	admission: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
	state: watch::Sender<ActivationState>,
	drained: watch::Sender<bool>,
	token: CancelToken<StopReason>,
}

impl std::fmt::Debug for ActivationRecord {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ActivationRecord")
			.field("identity", &self.identity)
			.field("owner", &self.owner)
			.field("state", &self.state())
			.finish()
	}
}

impl ActivationRecord {
	pub(crate) fn new(
		identity: ActorIdentity,
		owner: NodeIdentity,
		token: CancelToken<StopReason>,
	) -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let now = Instant::now();
		let record = Arc::new(Self {
			identity,
			owner,
			activated_at: now,
			last_activity: Mutex::new(now),
			admission: Mutex::new(Some(tx)),
			state: watch::Sender::new(ActivationState::Active),
			drained: watch::Sender::new(false),
			token,
		});
		(record, rx)
	}

	pub fn identity(&self) -> &ActorIdentity {
		&self.identity
	}

	pub fn owner(&self) -> &NodeIdentity {
		&self.owner
	}

	pub fn state(&self) -> ActivationState {
		*self.state.borrow()
	}

	pub fn activated_at(&self) -> Instant {
		self.activated_at
	}

	/// Start of the most recent turn, or activation time before the first one.
	pub fn last_activity(&self) -> Instant {
		*self.last_activity.lock()
	}

	pub(crate) fn is_idle(&self, now: Instant, threshold: std::time::Duration) -> bool {
		self.state() == ActivationState::Active
			&& now.saturating_duration_since(self.last_activity()) >= threshold
	}

	fn touch(&self) {
		*self.last_activity.lock() = Instant::now();
	}

	/// Append to the turn queue. Hands the envelope back once admission closed.
	pub(crate) fn submit(&self, envelope: Envelope) -> Result<(), Envelope> {
		let admission = self.admission.lock();
		match admission.as_ref() {
			Some(tx) => tx.send(envelope).map_err(|err| err.0),
			None => Err(envelope),
		}
	}

	/// Active → Deactivating. Only the first call wins.
	pub(crate) fn begin_deactivation(&self) -> bool {
		let mut admission = self.admission.lock();
		if admission.take().is_some() {
			self.state.send_replace(ActivationState::Deactivating);
			true
		} else {
			false
		}
	}

	pub(crate) fn mark_absent(&self) {
		let mut admission = self.admission.lock();
		admission.take();
		self.state.send_replace(ActivationState::Absent);
	}

	/// Abort the worker: the running turn and everything queued fail with
	/// `StageStopped` and the deactivation hook is skipped.
	pub(crate) fn force_stop(&self) {
		self.token.cancel(StopReason::Forced);
	}

	/// Resolves once the record has left the directory.
	pub async fn removed(&self) {
		let mut rx = self.state.subscribe();
		let _ = rx.wait_for(|state| *state == ActivationState::Absent).await;
	}

	/// Resolves once the worker has finished, including the deactivation hook.
	pub(crate) async fn drained(&self) {
		let mut rx = self.drained.subscribe();
		let _ = rx.wait_for(|drained| *drained).await;
	}
}

struct DrainedGuard(Arc<ActivationRecord>);

impl Drop for DrainedGuard {
	fn drop(&mut self) {
		self.0.drained.send_replace(true);
	}
}

pub(crate) struct TurnWorker {
	instance: Box<dyn Instance>,
	ctx: ActorContext,
	record: Arc<ActivationRecord>,
	rx: mpsc::UnboundedReceiver<Envelope>,
}

impl TurnWorker {
	pub fn new(
		instance: Box<dyn Instance>,
		ctx: ActorContext,
		record: Arc<ActivationRecord>,
		rx: mpsc::UnboundedReceiver<Envelope>,
	) -> Self {
		Self {
			instance,
			ctx,
			record,
			rx,
		}
	}

	pub async fn run(mut self) {
		let _drained = DrainedGuard(self.record.clone());
		let token = self.record.token.clone();

		loop {
			let envelope = tokio::select! {
				biased;
				_ = token.cancelled() => return self.abort(),
				envelope = self.rx.recv() => envelope,
			};

			match envelope {
				Some(envelope) => {
					if self.turn(envelope, &token).await.is_break() {
						return self.abort();
					}
				}
				// admission closed and everything admitted has run
				None => break,
			}
		}

		let hook = AssertUnwindSafe(self.instance.deactivate(&self.ctx)).catch_unwind();
		tokio::select! {
			biased;
			_ = token.cancelled() => {}
			result = hook => {
				if let Err(panic) = result {
					tracing::error!(reason = %panic_message(panic), "deactivation hook panicked");
				}
			}
		}
		tracing::debug!("turn worker finished");
	}

	async fn turn(&mut self, mut envelope: Envelope, token: &CancelToken<StopReason>) -> ControlFlow<()> {
		if !envelope.ticket.start() {
			// cancelled while queued
			envelope.fail(InvocationError::Cancelled);
			return ControlFlow::Continue(());
		}

		self.record.touch();
		metrics::counter!("runy_stage.turns").increment(1);

		let method = envelope.invocation.method.clone();
		let arguments = std::mem::take(&mut envelope.invocation.arguments);
		let call = Call::new(&self.ctx, &method, envelope.invocation.correlation_id);
		let turn = AssertUnwindSafe(self.instance.invoke(call, arguments)).catch_unwind();

		let outcome = tokio::select! {
			biased;
			_ = token.cancelled() => None,
			result = turn => Some(result),
		};

		let result = match outcome {
			Some(Ok(result)) => result,
			Some(Err(panic)) => Err(InvocationError::TurnExecution {
				identity: self.record.identity.clone(),
				method: method.name.clone(),
				reason: format!("panicked: {}", panic_message(panic)),
			}),
			None => {
				envelope.fail(InvocationError::StageStopped);
				return ControlFlow::Break(());
			}
		};

		if let Err(err) = &result {
			metrics::counter!("runy_stage.turn_failures").increment(1);
			tracing::debug!(%method, error = %err, "turn failed");
		}
		envelope.complete(result);
		ControlFlow::Continue(())
	}

	fn abort(&mut self) {
		self.rx.close();
		let mut failed = 0usize;
		while let Ok(envelope) = self.rx.try_recv() {
			envelope.fail(InvocationError::StageStopped);
			failed += 1;
		}
		tracing::warn!(failed, "turn worker aborted");
	}
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
	if let Some(message) = panic.downcast_ref::<&str>() {
		message.to_string()
	} else if let Some(message) = panic.downcast_ref::<String>() {
		message.clone()
	} else {
		"unknown panic".to_string()
	}
}
