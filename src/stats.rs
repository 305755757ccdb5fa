use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use dashmap::DashMap;

use crate::identity::ActorType;

#[derive(Debug, Default)]
struct Counters {
	total: AtomicUsize,
	live: AtomicUsize,
	max_live: AtomicUsize,
	deactivations: AtomicUsize,
	failures: AtomicUsize,
}

impl Counters {
	fn snapshot(&self) -> ActivationCounts {
		ActivationCounts {
			total: self.total.load(Ordering::Relaxed),
			live: self.live.load(Ordering::Relaxed),
			max_live: self.max_live.load(Ordering::Relaxed),
			deactivations: self.deactivations.load(Ordering::Relaxed),
			failures: self.failures.load(Ordering::Relaxed),
		}
	}
}

/// Activation counts of one actor type on one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivationCounts {
	/// Activations that reached Active.
	pub total: usize,
	pub live: usize,
	pub max_live: usize,
	pub deactivations: usize,
	/// Activations whose construction or activation hook failed.
	pub failures: usize,
}

/// Per stage activation bookkeeping, keyed by actor type.
#[derive(Debug, Default)]
pub struct ActivationStats {
	by_type: DashMap<ActorType, Counters>,
}

impl ActivationStats {
	pub(crate) fn activated(&self, actor_type: &ActorType) {
		let entry = self.by_type.entry(actor_type.clone()).or_default();
		entry.total.fetch_add(1, Ordering::Relaxed);
		let live = entry.live.fetch_add(1, Ordering::Relaxed) + 1;
		entry.max_live.fetch_max(live, Ordering::Relaxed);

		metrics::counter!("runy_stage.activations").increment(1);
		metrics::gauge!("runy_stage.live_activations").increment(1.0);
	}

	pub(crate) fn deactivated(&self, actor_type: &ActorType) {
		if let Some(entry) = self.by_type.get(actor_type) {
			entry.live.fetch_sub(1, Ordering::Relaxed);
			entry.deactivations.fetch_add(1, Ordering::Relaxed);
		}

		metrics::counter!("runy_stage.deactivations").increment(1);
		metrics::gauge!("runy_stage.live_activations").decrement(1.0);
	}

	pub(crate) fn failed(&self, actor_type: &ActorType) {
		let entry = self.by_type.entry(actor_type.clone()).or_default();
		entry.failures.fetch_add(1, Ordering::Relaxed);

		metrics::counter!("runy_stage.activation_failures").increment(1);
	}

	pub fn counts(&self, actor_type: &str) -> ActivationCounts {
		self.by_type
			.get(actor_type)
			.map(|entry| entry.snapshot())
			.unwrap_or_default()
	}

	pub fn live(&self) -> usize {
		self.by_type
			.iter()
			.map(|entry| entry.live.load(Ordering::Relaxed))
			.sum()
	}

	pub fn report(&self) -> Report {
		Report {
			by_type: self
				.by_type
				.iter()
				.map(|entry| (entry.key().to_string(), entry.snapshot()))
				.collect(),
		}
	}
}

/// Sorted snapshot of [`ActivationStats`], printable as a table.
pub struct Report {
	by_type: BTreeMap<String, ActivationCounts>,
}

impl fmt::Display for Report {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name_width = self
			.by_type
			.keys()
			.map(|k| k.len())
			.max()
			.unwrap_or(0)
			.max(10);
		let width = 12;

		writeln!(
			f,
			"{:<name_width$} {:>width$} {:>width$} {:>width$} {:>width$} {:>width$}",
			"actor", "total", "live", "max_live", "deactivated", "failed"
		)?;

		for (name, counts) in &self.by_type {
			writeln!(
				f,
				"{name:<name_width$} {:>width$} {:>width$} {:>width$} {:>width$} {:>width$}",
				counts.total, counts.live, counts.max_live, counts.deactivations, counts.failures
			)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tracks_live_and_peak() {
		let stats = ActivationStats::default();
		let counter = ActorType::new("Counter");

		stats.activated(&counter);
		stats.activated(&counter);
		stats.deactivated(&counter);
		stats.activated(&counter);
		stats.failed(&counter);

		assert_eq!(
			stats.counts("Counter"),
			ActivationCounts {
				total: 3,
				live: 2,
				max_live: 2,
				deactivations: 1,
				failures: 1,
			}
		);
		assert_eq!(stats.live(), 2);
		assert_eq!(stats.counts("Missing"), ActivationCounts::default());
	}

	#[test]
	fn report_lists_every_type() {
		let stats = ActivationStats::default();
		stats.activated(&ActorType::new("Counter"));
		stats.failed(&ActorType::new("Greeter"));

		let report = stats.report().to_string();
		assert!(report.contains("Counter"));
		assert!(report.contains("Greeter"));
		assert_eq!(report.lines().count(), 3);
	}
}
