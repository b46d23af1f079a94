//! Local mirrors of cluster objects
//!
//! A [`Cache`] mirrors one kind in one scope. Its reflector task is the only
//! writer, discoverers read it and subscribe to its changes. Subscribers are
//! invoked after the store lock is released, in the order changes were applied.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
	client::{ListWatch, Selectors},
	index::IndexKind,
	kubemodel::{Object, ObjectKey},
	metrics::{EventKind, Metrics},
};

pub mod queue;
mod reflector;
pub mod store;

pub use queue::WorkQueue;
pub use reflector::RetryPolicy;
pub use store::{Event, Store};

/// Waits for every signal to report sync, `false` when cancelled first
pub async fn wait_synced(signals: &mut [watch::Receiver<bool>], token: &CancellationToken) -> bool {
	for signal in signals {
		let synced = tokio::select! {
			_ = token.cancelled() => return false,
			result = signal.wait_for(|synced| *synced) => result.is_ok(),
		};
		if !synced {
			return false;
		}
	}
	true
}

type Handler<K> = Box<dyn Fn(&Event<K>) + Send + Sync>;

struct Shared<K: Object> {
	store: RwLock<Store<K>>,
	handlers: RwLock<Vec<Handler<K>>>,
	synced: watch::Sender<bool>,
	list_watch: Arc<dyn ListWatch<K>>,
	selectors: Selectors,
	namespace: Option<String>,
	metrics: Metrics,
}

pub struct Cache<K: Object> {
	shared: Arc<Shared<K>>,
}

impl<K: Object> Clone for Cache<K> {
	fn clone(&self) -> Self {
		Self {
			shared: self.shared.clone(),
		}
	}
}

impl<K: Object> Cache<K> {
	pub fn new(
		list_watch: Arc<dyn ListWatch<K>>,
		selectors: Selectors,
		namespace: Option<&str>,
		indices: &[IndexKind],
		metrics: Metrics,
	) -> Self {
		let (synced, _) = watch::channel(false);
		Self {
			shared: Arc::new(Shared {
				store: RwLock::new(Store::new(indices)),
				handlers: RwLock::new(Vec::new()),
				synced,
				list_watch,
				selectors,
				namespace: namespace.map(str::to_owned),
				metrics,
			}),
		}
	}

	/// Scope this cache mirrors, empty for every namespace
	pub fn scope(&self) -> &str {
		self.shared.namespace.as_deref().unwrap_or_default()
	}

	pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
		self.shared.store.read().get(key)
	}

	pub fn keys(&self) -> Vec<ObjectKey> {
		self.shared.store.read().keys().cloned().collect()
	}

	/// Keys of objects currently producing `value` in the given index
	pub fn index_keys(&self, index: IndexKind, value: &str) -> Vec<ObjectKey> {
		self.shared.store.read().index_keys(index, value)
	}

	pub fn by_index(&self, index: IndexKind, value: &str) -> Vec<Arc<K>> {
		let store = self.shared.store.read();
		store
			.index_keys(index, value)
			.iter()
			.filter_map(|key| store.get(key))
			.collect()
	}

	/// Registers a change handler, handlers must not block
	pub fn subscribe(&self, handler: impl Fn(&Event<K>) + Send + Sync + 'static) {
		self.shared.handlers.write().push(Box::new(handler));
	}

	pub fn is_synced(&self) -> bool {
		*self.shared.synced.borrow()
	}

	/// Flips to `true` once the initial list is applied
	pub fn sync_signal(&self) -> watch::Receiver<bool> {
		self.shared.synced.subscribe()
	}

	/// Fills the store and marks it synced without a reflector
	#[cfg(test)]
	pub(crate) fn seed(&self, items: Vec<K>) {
		self.replace(items);
		self.mark_synced();
	}

	fn mark_synced(&self) -> bool {
		self.shared.synced.send_if_modified(|synced| !std::mem::replace(synced, true))
	}

	fn dispatch(&self, events: Vec<Event<K>>) {
		if events.is_empty() {
			return;
		}
		let role = K::KIND.role();
		let handlers = self.shared.handlers.read();
		for event in &events {
			if let Some(role) = role {
				let kind = match event {
					Event::Added(_) => EventKind::Add,
					Event::Updated { .. } => EventKind::Update,
					Event::Deleted(_) => EventKind::Delete,
				};
				self.shared.metrics.event(role, kind);
			}
			for handler in handlers.iter() {
				handler(event);
			}
		}
	}

	fn replace(&self, items: Vec<K>) {
		let events = self.shared.store.write().replace(items);
		self.dispatch(events);
	}

	fn apply(&self, object: K) {
		let event = self.shared.store.write().apply(object);
		self.dispatch(vec![event]);
	}

	fn delete(&self, key: &ObjectKey) {
		let event = self.shared.store.write().delete(key);
		self.dispatch(event.into_iter().collect());
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Role;
	use k8s_openapi::api::core::v1::Service;
	use prometheus::Registry;
	use serde_json::json;

	struct Unused;

	#[async_trait::async_trait]
	impl ListWatch<Service> for Unused {
		async fn list(&self, _: &Selectors) -> crate::Result<crate::client::Snapshot<Service>> {
			unreachable!()
		}
		async fn watch(
			&self,
			_: &Selectors,
			_: &str,
		) -> crate::Result<crate::client::EventStream<Service>> {
			unreachable!()
		}
	}

	fn service(name: &str, port: i32) -> Service {
		serde_json::from_value(json!({
			"metadata": {"name": name, "namespace": "default"},
			"spec": {"ports": [{"port": port}]},
		}))
		.unwrap()
	}

	#[test]
	fn handlers_and_metrics() {
		let metrics = Metrics::new(&Registry::new()).unwrap();
		let cache = Cache::new(
			Arc::new(Unused),
			Selectors::default(),
			Some("default"),
			&[IndexKind::Namespace],
			metrics.clone(),
		);
		let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
		cache.subscribe({
			let seen = seen.clone();
			let cache = cache.clone();
			move |event| {
				// the store is readable from inside a handler
				let present = cache.get(&ObjectKey::of(event.object().as_ref())).is_some();
				seen.lock().push(present);
			}
		});

		cache.replace(vec![service("a", 80), service("b", 80)]);
		cache.apply(service("a", 8080));
		cache.delete(&ObjectKey::new("default", "b"));
		cache.delete(&ObjectKey::new("default", "b"));

		assert_eq!(*seen.lock(), vec![true, true, true, false]);
		assert_eq!(metrics.events(Role::Service, EventKind::Add), 2);
		assert_eq!(metrics.events(Role::Service, EventKind::Update), 1);
		assert_eq!(metrics.events(Role::Service, EventKind::Delete), 1);
		assert_eq!(cache.by_index(IndexKind::Namespace, "default").len(), 1);
		assert_eq!(cache.scope(), "default");
	}

	#[tokio::test]
	async fn sync_signal() {
		let cache: Cache<Service> = Cache::new(
			Arc::new(Unused),
			Selectors::default(),
			None,
			&[],
			Metrics::new(&Registry::new()).unwrap(),
		);
		assert!(!cache.is_synced());
		let token = CancellationToken::new();
		assert!(cache.mark_synced());
		assert!(!cache.mark_synced());
		assert!(wait_synced(&mut [cache.sync_signal()], &token).await);

		let other: Cache<Service> = Cache::new(
			Arc::new(Unused),
			Selectors::default(),
			None,
			&[],
			Metrics::new(&Registry::new()).unwrap(),
		);
		token.cancel();
		assert!(!wait_synced(&mut [cache.sync_signal(), other.sync_signal()], &token).await);
	}
}
