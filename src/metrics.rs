use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

use crate::{config::Role, Result};

/// Kind of change applied to a cache
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKind {
	Add,
	Update,
	Delete,
}

impl EventKind {
	pub const ALL: [EventKind; 3] = [EventKind::Add, EventKind::Update, EventKind::Delete];

	pub fn as_str(self) -> &'static str {
		match self {
			EventKind::Add => "add",
			EventKind::Update => "update",
			EventKind::Delete => "delete",
		}
	}
}

#[derive(Clone)]
pub struct Metrics {
	events: IntCounterVec,
	failures: IntCounter,
}

impl Metrics {
	pub fn new(registry: &Registry) -> Result<Self> {
		let events = IntCounterVec::new(
			Opts::new(
				"prometheus_sd_kubernetes_events_total",
				"The number of Kubernetes events handled.",
			),
			&["role", "event"],
		)?;
		let failures = IntCounter::new(
			"prometheus_sd_kubernetes_failures_total",
			"The number of failed WATCH/LIST requests.",
		)?;
		registry.register(Box::new(events.clone()))?;
		registry.register(Box::new(failures.clone()))?;

		for role in Role::ALL {
			for event in EventKind::ALL {
				events.with_label_values(&[role.as_str(), event.as_str()]);
			}
		}
		Ok(Self { events, failures })
	}

	pub fn event(&self, role: Role, event: EventKind) {
		self.events
			.with_label_values(&[role.as_str(), event.as_str()])
			.inc();
	}

	pub fn failure(&self) {
		self.failures.inc();
	}

	pub fn events(&self, role: Role, event: EventKind) -> u64 {
		self.events
			.with_label_values(&[role.as_str(), event.as_str()])
			.get()
	}

	pub fn failures(&self) -> u64 {
		self.failures.get()
	}
}
