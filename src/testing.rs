//! In-memory cluster for tests
//!
//! Keeps an event log per kind so watches resume from a resource version the
//! same way the API server does. Disconnects and expired watches can be
//! injected to exercise the reconnection path.

use std::{any::Any, collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use kube::{api::WatchEvent, core::ErrorResponse};
use parking_lot::Mutex;
use prometheus::Registry;
use rustc_hash::FxHashMap;
use selector::{FieldSelector, LabelSelector};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
	cache::{Cache, RetryPolicy},
	client::{ClusterClient, EventStream, ListWatch, Selectors, Snapshot},
	index::IndexKind,
	kubemodel::{Kind, Object, ObjectKey},
	metrics::Metrics,
	targetgroup::TargetGroup,
	Error, Result,
};

#[derive(Clone, Copy)]
enum Change {
	Added,
	Modified,
	Deleted,
}

struct Filter {
	namespace: Option<String>,
	labels: LabelSelector,
	fields: FieldSelector,
}

impl Filter {
	fn new(namespace: Option<&str>, selectors: &Selectors) -> Result<Self> {
		Ok(Self {
			namespace: namespace.map(str::to_owned),
			labels: selector::parse_labels(selectors.label.as_deref().unwrap_or_default())?,
			fields: selector::parse_fields(selectors.field.as_deref().unwrap_or_default())?,
		})
	}

	fn matches<K: Object>(&self, object: &K) -> bool {
		let meta = object.meta();
		if let Some(namespace) = &self.namespace {
			if meta.namespace.as_ref() != Some(namespace) {
				return false;
			}
		}
		let labels = meta.labels.clone().unwrap_or_default();
		self.labels.matches(&labels)
			&& (self.fields.is_empty()
				|| serde_json::to_value(object).map_or(false, |value| self.fields.matches(&value)))
	}
}

struct Watcher<K> {
	filter: Filter,
	tx: mpsc::UnboundedSender<Result<WatchEvent<K>>>,
}

struct State<K> {
	version: u64,
	objects: BTreeMap<ObjectKey, K>,
	log: Vec<(u64, Change, K)>,
	watchers: Vec<Watcher<K>>,
	lists: usize,
	watched_from: Vec<String>,
}

/// Objects of one kind
pub struct FakeApi<K> {
	state: Mutex<State<K>>,
}

impl<K: Object> Default for FakeApi<K> {
	fn default() -> Self {
		Self {
			state: Mutex::new(State {
				version: 0,
				objects: BTreeMap::new(),
				log: Vec::new(),
				watchers: Vec::new(),
				lists: 0,
				watched_from: Vec::new(),
			}),
		}
	}
}

fn watch_event<K>(change: Change, object: K) -> WatchEvent<K> {
	match change {
		Change::Added => WatchEvent::Added(object),
		Change::Modified => WatchEvent::Modified(object),
		Change::Deleted => WatchEvent::Deleted(object),
	}
}

impl<K: Object> FakeApi<K> {
	fn record(&self, change: Change, mut object: K) {
		let mut state = self.state.lock();
		state.version += 1;
		object.meta_mut().resource_version = Some(state.version.to_string());
		let version = state.version;
		state.log.push((version, change, object.clone()));
		state.watchers.retain(|watcher| !watcher.tx.is_closed());
		for watcher in &state.watchers {
			if watcher.filter.matches(&object) {
				let _ = watcher.tx.send(Ok(watch_event(change, object.clone())));
			}
		}
		let key = ObjectKey::of(&object);
		match change {
			Change::Deleted => state.objects.remove(&key),
			_ => state.objects.insert(key, object),
		};
	}

	pub fn apply(&self, object: K) {
		let exists = self
			.state
			.lock()
			.objects
			.contains_key(&ObjectKey::of(&object));
		let change = if exists { Change::Modified } else { Change::Added };
		self.record(change, object);
	}

	pub fn delete(&self, key: &ObjectKey) {
		let object = self.state.lock().objects.get(key).cloned();
		if let Some(object) = object {
			self.record(Change::Deleted, object);
		}
	}

	/// Breaks every open watch with a transport error
	pub fn disconnect(&self) {
		let watchers = std::mem::take(&mut self.state.lock().watchers);
		for watcher in watchers {
			let _ = watcher.tx.send(Err(Error::Watch("connection reset by peer".into())));
		}
	}

	/// Answers every open watch with an expired resource version
	pub fn expire(&self) {
		let watchers = std::mem::take(&mut self.state.lock().watchers);
		for watcher in watchers {
			let _ = watcher.tx.send(Ok(WatchEvent::Error(ErrorResponse {
				status: "Failure".into(),
				message: "too old resource version".into(),
				reason: "Expired".into(),
				code: 410,
			})));
		}
	}

	/// Sends a bookmark at the current resource version to every open watch
	pub fn bookmark(&self) {
		let mut state = self.state.lock();
		let bookmark = json!({
			"type": "BOOKMARK",
			"object": {
				"apiVersion": K::api_version(&()),
				"kind": K::kind(&()),
				"metadata": {"resourceVersion": state.version.to_string(), "annotations": {}},
			},
		});
		state.watchers.retain(|watcher| !watcher.tx.is_closed());
		for watcher in &state.watchers {
			let _ = watcher.tx.send(Ok(object(bookmark.clone())));
		}
	}

	/// Ends every open watch the way a server side timeout does
	pub fn close_watches(&self) {
		self.state.lock().watchers.clear();
	}

	pub fn lists(&self) -> usize {
		self.state.lock().lists
	}

	pub fn watches(&self) -> usize {
		self.state.lock().watched_from.len()
	}

	/// Resource versions every watch was opened from, oldest first
	pub fn watched_from(&self) -> Vec<String> {
		self.state.lock().watched_from.clone()
	}

	pub fn open_watches(&self) -> usize {
		let mut state = self.state.lock();
		state.watchers.retain(|watcher| !watcher.tx.is_closed());
		state.watchers.len()
	}
}

pub struct FakeListWatch<K> {
	api: Arc<FakeApi<K>>,
	namespace: Option<String>,
}

#[async_trait]
impl<K: Object> ListWatch<K> for FakeListWatch<K> {
	async fn list(&self, selectors: &Selectors) -> Result<Snapshot<K>> {
		let filter = Filter::new(self.namespace.as_deref(), selectors)?;
		let mut state = self.api.state.lock();
		state.lists += 1;
		Ok(Snapshot {
			items: state
				.objects
				.values()
				.filter(|object| filter.matches(*object))
				.cloned()
				.collect(),
			resource_version: state.version.to_string(),
		})
	}

	async fn watch(&self, selectors: &Selectors, resource_version: &str) -> Result<EventStream<K>> {
		let filter = Filter::new(self.namespace.as_deref(), selectors)?;
		let since: u64 = resource_version
			.parse()
			.map_err(|_| Error::Watch(format!("invalid resource version {:?}", resource_version)))?;
		let (tx, rx) = mpsc::unbounded_channel();
		let mut state = self.api.state.lock();
		state.watched_from.push(resource_version.to_owned());
		for (version, change, object) in &state.log {
			if *version > since && filter.matches(object) {
				let _ = tx.send(Ok(watch_event(*change, object.clone())));
			}
		}
		state.watchers.push(Watcher { filter, tx });
		Ok(UnboundedReceiverStream::new(rx).boxed())
	}
}

/// Every kind the discovery engine knows about, created on first use
#[derive(Clone, Default)]
pub struct FakeCluster {
	apis: Arc<Mutex<FxHashMap<Kind, Arc<dyn Any + Send + Sync>>>>,
}

impl FakeCluster {
	pub fn api<K: Object>(&self) -> Arc<FakeApi<K>> {
		let api = self
			.apis
			.lock()
			.entry(K::KIND)
			.or_insert_with(|| Arc::new(FakeApi::<K>::default()))
			.clone();
		api.downcast::<FakeApi<K>>()
			.unwrap_or_else(|_| panic!("{} api registered with another type", K::KIND))
	}

	pub fn apply<K: Object>(&self, object: K) {
		self.api::<K>().apply(object);
	}

	pub fn delete<K: Object>(&self, namespace: &str, name: &str) {
		self.api::<K>().delete(&ObjectKey::new(namespace, name));
	}
}

impl ClusterClient for FakeCluster {
	fn list_watch<K: Object>(&self, namespace: Option<&str>) -> Arc<dyn ListWatch<K>> {
		Arc::new(FakeListWatch {
			api: self.api::<K>(),
			namespace: namespace.map(str::to_owned),
		})
	}
}

pub fn object<K: DeserializeOwned>(value: serde_json::Value) -> K {
	serde_json::from_value(value).unwrap()
}

pub fn metrics() -> Metrics {
	Metrics::new(&Registry::new()).unwrap()
}

/// Immediate retries, keeps reconnection tests fast
pub fn retry() -> RetryPolicy {
	RetryPolicy {
		initial_interval: Duration::from_millis(5),
		multiplier: 1.0,
		max_interval: Duration::from_millis(5),
		randomization_factor: 0.0,
	}
}

/// Synced cache holding `items`, without a reflector behind it
pub fn cache<K: Object>(indices: &[IndexKind], items: Vec<K>) -> Cache<K> {
	let cache = Cache::new(
		FakeCluster::default().list_watch(None),
		Selectors::default(),
		None,
		indices,
		metrics(),
	);
	cache.seed(items);
	cache
}

pub async fn recv(output: &mut mpsc::Receiver<Vec<TargetGroup>>) -> TargetGroup {
	let mut batch = tokio::time::timeout(Duration::from_secs(5), output.recv())
		.await
		.expect("no target group in time")
		.expect("output closed");
	assert_eq!(batch.len(), 1);
	batch.remove(0)
}

pub async fn assert_idle(output: &mut mpsc::Receiver<Vec<TargetGroup>>) {
	if let Ok(batch) = tokio::time::timeout(Duration::from_millis(200), output.recv()).await {
		panic!("unexpected output: {:?}", batch);
	}
}

/// Polls until `condition` holds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
	for _ in 0..500 {
		if condition() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("condition not reached in time");
}
