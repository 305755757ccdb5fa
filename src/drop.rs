use tokio::task::JoinHandle;

/// A stage-owned background task, aborted when the handle goes away.
#[derive(Debug)]
pub(crate) struct DropHandle<T> {
	name: &'static str,
	handle: JoinHandle<T>,
}

impl<T> DropHandle<T> {
	pub fn new(name: &'static str, handle: JoinHandle<T>) -> Self {
		Self { name, handle }
	}

	pub fn name(&self) -> &'static str {
		self.name
	}

	pub fn is_finished(&self) -> bool {
		self.handle.is_finished()
	}
}

impl<T> Drop for DropHandle<T> {
	fn drop(&mut self) {
		if !self.handle.is_finished() {
			tracing::trace!(task = self.name, "aborting background task");
			self.handle.abort();
		}
	}
}
