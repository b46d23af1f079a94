use std::{collections::VecDeque, hash::Hash};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct State<T> {
	queue: VecDeque<T>,
	pending: FxHashSet<T>,
}

/// FIFO of keys awaiting processing, a key waiting in the queue is never added twice
pub struct WorkQueue<T> {
	state: Mutex<State<T>>,
	notify: Notify,
}

impl<T: Clone + Eq + Hash> Default for WorkQueue<T> {
	fn default() -> Self {
		Self {
			state: Mutex::new(State {
				queue: VecDeque::new(),
				pending: FxHashSet::default(),
			}),
			notify: Notify::new(),
		}
	}
}

impl<T: Clone + Eq + Hash> WorkQueue<T> {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&self, item: T) {
		{
			let mut state = self.state.lock();
			if !state.pending.insert(item.clone()) {
				return;
			}
			state.queue.push_back(item);
		}
		self.notify.notify_one();
	}

	pub fn len(&self) -> usize {
		self.state.lock().queue.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn try_pop(&self) -> Option<T> {
		let mut state = self.state.lock();
		let item = state.queue.pop_front()?;
		state.pending.remove(&item);
		Some(item)
	}

	/// Waits for the next key, `None` once cancelled
	pub async fn pop(&self, token: &CancellationToken) -> Option<T> {
		loop {
			if token.is_cancelled() {
				return None;
			}
			if let Some(item) = self.try_pop() {
				return Some(item);
			}
			tokio::select! {
				_ = token.cancelled() => return None,
				_ = self.notify.notified() => {}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::{sync::Arc, time::Duration};

	#[test]
	fn dedup() {
		let queue = WorkQueue::new();
		queue.add("a");
		queue.add("b");
		queue.add("a");
		assert_eq!(queue.len(), 2);
		assert_eq!(queue.try_pop(), Some("a"));
		queue.add("a");
		assert_eq!(queue.try_pop(), Some("b"));
		assert_eq!(queue.try_pop(), Some("a"));
		assert!(queue.is_empty());
	}

	#[tokio::test]
	async fn wakeup() {
		let queue = Arc::new(WorkQueue::new());
		let token = CancellationToken::new();
		let consumer = tokio::spawn({
			let queue = queue.clone();
			let token = token.clone();
			async move { queue.pop(&token).await }
		});
		tokio::time::sleep(Duration::from_millis(10)).await;
		queue.add(7);
		assert_eq!(consumer.await.unwrap(), Some(7));

		token.cancel();
		assert_eq!(queue.pop(&token).await, None);
	}
}
