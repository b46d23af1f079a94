use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use futures::StreamExt;
use kube::api::WatchEvent;
use log::{debug, info, trace, warn};
use tokio_util::sync::CancellationToken;

use super::Cache;
use crate::{
	kubemodel::{Object, ObjectKey},
	Error, Result,
};

/// Delay between failed list/watch attempts
#[derive(Clone, Debug)]
pub struct RetryPolicy {
	pub initial_interval: Duration,
	pub multiplier: f64,
	pub max_interval: Duration,
	pub randomization_factor: f64,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			initial_interval: Duration::from_millis(800),
			multiplier: 2.0,
			max_interval: Duration::from_secs(30),
			randomization_factor: 0.5,
		}
	}
}

impl RetryPolicy {
	fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoffBuilder::new()
			.with_initial_interval(self.initial_interval)
			.with_multiplier(self.multiplier)
			.with_max_interval(self.max_interval)
			.with_randomization_factor(self.randomization_factor)
			.with_max_elapsed_time(None)
			.build()
	}
}

impl<K: Object> Cache<K> {
	/// Keeps the cache in sync with the cluster until cancelled
	///
	/// Failures are counted and retried with a fresh list, they never stop the loop.
	pub async fn run(self, token: CancellationToken, retry: RetryPolicy) {
		let mut backoff = retry.backoff();
		loop {
			let Err(error) = self.list_and_watch(&token, &mut backoff).await else {
				break;
			};
			self.shared.metrics.failure();
			let delay = backoff.next_backoff().unwrap_or(retry.max_interval);
			warn!(
				"{} list/watch in {:?} failed, retrying in {:?}: {}",
				K::KIND,
				self.scope(),
				delay,
				error
			);
			tokio::select! {
				_ = token.cancelled() => break,
				_ = tokio::time::sleep(delay) => {}
			}
		}
		if !self.is_synced() {
			debug!("{} cache in {:?} cancelled before sync", K::KIND, self.scope());
		}
	}

	/// Returns only on failure or once cancelled
	async fn list_and_watch(
		&self,
		token: &CancellationToken,
		backoff: &mut ExponentialBackoff,
	) -> Result<()> {
		let list_watch = &self.shared.list_watch;
		let selectors = &self.shared.selectors;

		let snapshot = tokio::select! {
			_ = token.cancelled() => return Ok(()),
			snapshot = list_watch.list(selectors) => snapshot?,
		};
		let count = snapshot.items.len();
		self.replace(snapshot.items);
		if self.mark_synced() {
			info!("{} cache in {:?} synced with {} objects", K::KIND, self.scope(), count);
		}
		backoff.reset();

		let mut version = snapshot.resource_version;
		loop {
			let mut stream = tokio::select! {
				_ = token.cancelled() => return Ok(()),
				stream = list_watch.watch(selectors, &version) => stream?,
			};
			loop {
				let event = tokio::select! {
					_ = token.cancelled() => return Ok(()),
					event = stream.next() => event,
				};
				let Some(event) = event else {
					trace!(
						"{} watch in {:?} ended, resuming from {}",
						K::KIND,
						self.scope(),
						version
					);
					break;
				};
				match event? {
					WatchEvent::Added(object) | WatchEvent::Modified(object) => {
						trace!("{} applied {}", K::KIND, ObjectKey::of(&object));
						if let Some(rv) = &object.meta().resource_version {
							version = rv.clone();
						}
						self.apply(object);
					}
					WatchEvent::Deleted(object) => {
						let key = ObjectKey::of(&object);
						trace!("{} deleted {}", K::KIND, key);
						if let Some(rv) = &object.meta().resource_version {
							version = rv.clone();
						}
						self.delete(&key);
					}
					WatchEvent::Bookmark(bookmark) => {
						version = bookmark.metadata.resource_version;
					}
					WatchEvent::Error(error) => {
						return Err(Error::Watch(format!(
							"{} ({} {})",
							error.message, error.code, error.reason
						)));
					}
				}
			}
		}
	}
}
