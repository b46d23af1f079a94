use std::collections::BTreeMap;

use serde::Serialize;

pub type LabelSet = BTreeMap<String, String>;

/// Set of targets sharing a source and common labels
///
/// Emitting a group replaces whatever was previously known for the same
/// source, a group without targets retracts it.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize)]
pub struct TargetGroup {
	pub source: String,
	pub targets: Vec<LabelSet>,
	pub labels: LabelSet,
}

impl TargetGroup {
	pub fn new(source: impl Into<String>) -> Self {
		Self {
			source: source.into(),
			..Default::default()
		}
	}

	pub fn tombstone(source: impl Into<String>) -> Self {
		Self::new(source)
	}

	pub fn is_tombstone(&self) -> bool {
		self.targets.is_empty()
	}
}
