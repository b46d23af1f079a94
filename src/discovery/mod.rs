//! Target discovery
//!
//! [`Discovery`] wires caches for the configured role, one primary cache per
//! namespace plus the auxiliary caches the role joins against, and runs a
//! discoverer on top of each primary cache. Discoverers share one output
//! channel.
//!
//! Every discoverer works off a queue of primary object keys. A change to the
//! primary object queues its key, a change to a joined object queues the keys
//! of primary objects that reference it, found through the primary cache
//! indices. Processing a key re-derives the whole target group from the
//! current cache state, or emits a tombstone when the object is gone.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use k8s_openapi::api::{
	core::v1::{Endpoints, Namespace, Node, Pod, Service},
	discovery::v1::EndpointSlice,
	networking::v1::Ingress,
};
use log::{debug, info};
use tokio::{
	sync::{mpsc, watch},
	task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
	cache::{self, Cache, Event, RetryPolicy, WorkQueue},
	client::{ClusterClient, Selectors},
	config::{Namespaces, Role, SdConfig},
	index::IndexKind,
	kubemodel::{Object, ObjectKey},
	labels,
	metrics::Metrics,
	targetgroup::{LabelSet, TargetGroup},
};

mod endpoints;
mod endpointslice;
mod ingress;
mod node;
mod pod;
mod service;

pub type Output = mpsc::Sender<Vec<TargetGroup>>;

#[async_trait]
pub trait Discoverer: Send {
	/// Emits target groups until cancelled
	async fn run(self: Box<Self>, token: CancellationToken, output: Output);
}

/// Derivation of target groups for one role
pub trait Builder: Send + Sync + 'static {
	type Object: Object;
	const ROLE: Role;

	fn primary(&self) -> &Cache<Self::Object>;

	/// `None` when the object currently yields nothing worth emitting
	fn build(&self, object: &Self::Object) -> Option<TargetGroup>;
}

pub fn source(role: Role, key: &ObjectKey) -> String {
	format!("{}/{}", role, key)
}

pub struct RoleDiscoverer<B> {
	builder: B,
	queue: Arc<WorkQueue<ObjectKey>>,
	synced: Vec<watch::Receiver<bool>>,
}

impl<B: Builder> RoleDiscoverer<B> {
	fn new(
		builder: B,
		queue: Arc<WorkQueue<ObjectKey>>,
		synced: Vec<watch::Receiver<bool>>,
	) -> Self {
		Self {
			builder,
			queue,
			synced,
		}
	}

	fn process(&self, key: &ObjectKey) -> Option<TargetGroup> {
		match self.builder.primary().get(key) {
			Some(object) => self.builder.build(&object),
			None => Some(TargetGroup::tombstone(source(B::ROLE, key))),
		}
	}
}

#[async_trait]
impl<B: Builder> Discoverer for RoleDiscoverer<B> {
	async fn run(mut self: Box<Self>, token: CancellationToken, output: Output) {
		if !cache::wait_synced(&mut self.synced, &token).await {
			debug!("{} discoverer cancelled before caches synced", B::ROLE);
			return;
		}
		while let Some(key) = self.queue.pop(&token).await {
			let Some(group) = self.process(&key) else {
				continue;
			};
			tokio::select! {
				_ = token.cancelled() => return,
				sent = output.send(vec![group]) => {
					if sent.is_err() {
						debug!("{} output closed, stopping", B::ROLE);
						return;
					}
				}
			}
		}
	}
}

/// Queues the key of every changed primary object
fn enqueue_own<K: Object>(primary: &Cache<K>, queue: &Arc<WorkQueue<ObjectKey>>) {
	let queue = queue.clone();
	primary.subscribe(move |event| queue.add(ObjectKey::of(event.object().as_ref())));
}

/// Queues primary objects whose `index` entry equals `value(changed)`
fn enqueue_by_index<A: Object, K: Object>(
	auxiliary: &Cache<A>,
	primary: &Cache<K>,
	queue: &Arc<WorkQueue<ObjectKey>>,
	index: IndexKind,
	updates_only: bool,
	value: fn(&A) -> String,
) {
	let primary = primary.clone();
	let queue = queue.clone();
	auxiliary.subscribe(move |event| {
		if updates_only && !matches!(event, Event::Updated { .. }) {
			return;
		}
		for key in primary.index_keys(index, &value(event.object().as_ref())) {
			queue.add(key);
		}
	});
}

fn name_of<K: Object>(object: &K) -> String {
	object.meta().name.clone().unwrap_or_default()
}

fn key_of<K: Object>(object: &K) -> String {
	ObjectKey::of(object).to_string()
}

/// Node and namespace caches shared by every namespace of a role
#[derive(Clone, Default)]
pub struct Attached {
	pub nodes: Option<Cache<Node>>,
	pub namespaces: Option<Cache<Namespace>>,
}

impl Attached {
	/// Re-derives primary objects when their node or namespace changes
	fn subscribe<K: Object>(&self, primary: &Cache<K>, queue: &Arc<WorkQueue<ObjectKey>>) {
		if let Some(nodes) = &self.nodes {
			enqueue_by_index(nodes, primary, queue, IndexKind::Node, false, name_of::<Node>);
		}
		if let Some(namespaces) = &self.namespaces {
			enqueue_by_index(
				namespaces,
				primary,
				queue,
				IndexKind::Namespace,
				true,
				name_of::<Namespace>,
			);
		}
	}

	fn signals(&self) -> Vec<watch::Receiver<bool>> {
		let nodes = self.nodes.iter().map(Cache::sync_signal);
		let namespaces = self.namespaces.iter().map(Cache::sync_signal);
		nodes.chain(namespaces).collect()
	}

	/// `node_name` and node labels of the named node, when it is known
	fn add_node_labels(&self, labels: &mut LabelSet, node_name: Option<&str>) {
		let (Some(nodes), Some(name)) = (&self.nodes, node_name.filter(|name| !name.is_empty()))
		else {
			return;
		};
		if let Some(node) = nodes.get(&ObjectKey::cluster(name)) {
			labels::add_node_labels(labels, &node);
		}
	}

	fn add_namespace_labels(&self, labels: &mut LabelSet, namespace: &str) {
		let Some(namespaces) = &self.namespaces else {
			return;
		};
		if let Some(namespace) = namespaces.get(&ObjectKey::cluster(namespace)) {
			labels::add_namespace_labels(labels, &namespace);
		}
	}
}

/// Creates caches and collects their reflectors, nothing runs until [`Wiring::start`]
struct Wiring<'a, C> {
	client: &'a C,
	metrics: &'a Metrics,
	reflectors: Vec<BoxFuture<'static, ()>>,
	token: CancellationToken,
	retry: RetryPolicy,
}

impl<'a, C: ClusterClient> Wiring<'a, C> {
	fn cache<K: Object>(
		&mut self,
		namespace: Option<&str>,
		selectors: Selectors,
		indices: &[IndexKind],
	) -> Cache<K> {
		let cache = Cache::new(
			self.client.list_watch::<K>(namespace),
			selectors,
			namespace,
			indices,
			self.metrics.clone(),
		);
		self.reflectors
			.push(cache.clone().run(self.token.clone(), self.retry.clone()).boxed());
		cache
	}

	fn start(self) -> JoinSet<()> {
		let mut tasks = JoinSet::new();
		for reflector in self.reflectors {
			tasks.spawn(reflector);
		}
		tasks
	}
}

/// Discovery of one configured role
pub struct Discovery<C> {
	client: C,
	config: SdConfig,
	namespaces: Namespaces,
	metrics: Metrics,
	retry: RetryPolicy,
}

impl<C: ClusterClient> Discovery<C> {
	pub fn new(client: C, config: SdConfig, own_namespace: Option<&str>, metrics: Metrics) -> Self {
		let namespaces = config.namespaces.resolve(own_namespace);
		Self {
			client,
			config,
			namespaces,
			metrics,
			retry: RetryPolicy::default(),
		}
	}

	pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	pub fn namespaces(&self) -> &Namespaces {
		&self.namespaces
	}

	fn discoverers(&self, wiring: &mut Wiring<'_, C>) -> Vec<Box<dyn Discoverer>> {
		let config = &self.config;
		let role = config.role;
		let auxiliary = config.auxiliary();
		let indices = auxiliary.primary_indices(role);

		let attached = Attached {
			nodes: auxiliary
				.node
				.then(|| wiring.cache::<Node>(None, config.selectors_for(Role::Node), &[])),
			namespaces: auxiliary
				.namespace
				.then(|| wiring.cache::<Namespace>(None, Selectors::default(), &[])),
		};

		let scopes = match role {
			Role::Node => vec![None],
			_ => self.namespaces.scopes(),
		};
		let mut discoverers: Vec<Box<dyn Discoverer>> = Vec::new();
		for namespace in scopes {
			let selectors = config.selectors_for(role);
			let discoverer: Box<dyn Discoverer> = match role {
				Role::Node => {
					let nodes = wiring.cache::<Node>(namespace, selectors, &indices);
					Box::new(node::discoverer(nodes))
				}
				Role::Pod => {
					let pods = wiring.cache::<Pod>(namespace, selectors, &indices);
					Box::new(pod::discoverer(pods, attached.clone()))
				}
				Role::Service => {
					let services = wiring.cache::<Service>(namespace, selectors, &indices);
					Box::new(service::discoverer(services, attached.clone()))
				}
				Role::Ingress => {
					let ingresses = wiring.cache::<Ingress>(namespace, selectors, &indices);
					Box::new(ingress::discoverer(ingresses, attached.clone()))
				}
				Role::Endpoints => {
					let endpoints = wiring.cache::<Endpoints>(namespace, selectors, &indices);
					let services = wiring.cache::<Service>(
						namespace,
						config.selectors_for(Role::Service),
						&[],
					);
					let pods = wiring.cache::<Pod>(namespace, config.selectors_for(Role::Pod), &[]);
					Box::new(endpoints::discoverer(
						endpoints,
						services,
						pods,
						attached.clone(),
					))
				}
				Role::EndpointSlice => {
					let slices = wiring.cache::<EndpointSlice>(namespace, selectors, &indices);
					let services = wiring.cache::<Service>(
						namespace,
						config.selectors_for(Role::Service),
						&[],
					);
					let pods = wiring.cache::<Pod>(namespace, config.selectors_for(Role::Pod), &[]);
					Box::new(endpointslice::discoverer(
						slices,
						services,
						pods,
						attached.clone(),
					))
				}
			};
			discoverers.push(discoverer);
		}
		discoverers
	}

	/// Runs until `token` is cancelled or every discoverer stopped, returns once
	/// every spawned task has exited
	pub async fn run(self, token: CancellationToken, output: Output) {
		let caches_token = token.child_token();
		let mut wiring = Wiring {
			client: &self.client,
			metrics: &self.metrics,
			reflectors: Vec::new(),
			token: caches_token.clone(),
			retry: self.retry.clone(),
		};
		let discoverers = self.discoverers(&mut wiring);
		info!(
			"starting {} discovery with {} discoverers and {} caches",
			self.config.role,
			discoverers.len(),
			wiring.reflectors.len()
		);
		let mut caches = wiring.start();

		let mut running = JoinSet::new();
		for discoverer in discoverers {
			running.spawn(discoverer.run(token.clone(), output.clone()));
		}
		drop(output);

		while running.join_next().await.is_some() {}
		caches_token.cancel();
		while caches.join_next().await.is_some() {}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{self, assert_idle, eventually, object, recv, FakeCluster};
	use serde_json::json;

	fn pod(name: &str, node: &str) -> Pod {
		object(json!({
			"metadata": {"name": name, "namespace": "default", "labels": {"app": "web"}},
			"spec": {"nodeName": node, "containers": [{"name": "app", "image": "web:1"}]},
			"status": {"podIP": "10.0.0.1"},
		}))
	}

	fn node(name: &str, zone: &str) -> Node {
		object(json!({
			"metadata": {"name": name, "labels": {"zone": zone}},
			"status": {"addresses": [{"type": "InternalIP", "address": "192.168.0.1"}]},
		}))
	}

	struct Running {
		cluster: FakeCluster,
		metrics: Metrics,
		token: CancellationToken,
		output: mpsc::Receiver<Vec<TargetGroup>>,
		task: tokio::task::JoinHandle<()>,
	}

	impl Running {
		fn start(cluster: FakeCluster, config: &str) -> Self {
			let config = SdConfig::from_yaml(config).unwrap();
			let metrics = testing::metrics();
			let discovery = Discovery::new(cluster.clone(), config, None, metrics.clone())
				.with_retry(testing::retry());
			let token = CancellationToken::new();
			let (tx, output) = mpsc::channel(16);
			let task = tokio::spawn(discovery.run(token.clone(), tx));
			Self {
				cluster,
				metrics,
				token,
				output,
				task,
			}
		}

		async fn stop(self) {
			self.token.cancel();
			tokio::time::timeout(std::time::Duration::from_secs(5), self.task)
				.await
				.expect("discovery did not stop")
				.unwrap();
		}
	}

	#[tokio::test]
	async fn pod_scenario() {
		let cluster = FakeCluster::default();
		cluster.apply(pod("web-0", "worker-1"));
		let mut running = Running::start(cluster, "{role: pod, namespaces: {names: [default]}}");

		let group = recv(&mut running.output).await;
		assert_eq!(group.source, "pod/default/web-0");
		assert_eq!(group.targets.len(), 1);
		assert_eq!(group.labels["__meta_kubernetes_namespace"], "default");
		assert_eq!(group.labels["__meta_kubernetes_pod_name"], "web-0");
		assert_eq!(group.labels["__meta_kubernetes_pod_label_app"], "web");
		assert_eq!(group.labels["__meta_kubernetes_pod_labelpresent_app"], "true");
		assert_idle(&mut running.output).await;
		running.stop().await;
	}

	#[tokio::test]
	async fn delete_emits_one_tombstone() {
		let cluster = FakeCluster::default();
		cluster.apply(pod("web-0", "worker-1"));
		let mut running = Running::start(cluster.clone(), "role: pod");
		recv(&mut running.output).await;

		cluster.delete::<Pod>("default", "web-0");
		let group = recv(&mut running.output).await;
		assert_eq!(group.source, "pod/default/web-0");
		assert!(group.targets.is_empty());
		assert_idle(&mut running.output).await;
		assert_eq!(
			running.metrics.events(Role::Pod, crate::metrics::EventKind::Delete),
			1
		);
		running.stop().await;
	}

	#[tokio::test]
	async fn node_update_rederives_joined_pods() {
		let cluster = FakeCluster::default();
		cluster.apply(node("worker-1", "a"));
		cluster.apply(node("worker-2", "a"));
		cluster.apply(pod("web-0", "worker-1"));
		cluster.apply(pod("web-1", "worker-1"));
		cluster.apply(pod("web-2", "worker-2"));
		let mut running = Running::start(cluster.clone(), "{role: pod, attach_metadata: {node: true}}");
		for _ in 0..3 {
			let group = recv(&mut running.output).await;
			assert_eq!(group.labels["__meta_kubernetes_node_label_zone"], "a");
		}
		assert_idle(&mut running.output).await;

		cluster.apply(node("worker-1", "b"));
		let mut sources = Vec::new();
		for _ in 0..2 {
			let group = recv(&mut running.output).await;
			assert_eq!(group.labels["__meta_kubernetes_node_label_zone"], "b");
			sources.push(group.source);
		}
		sources.sort();
		assert_eq!(sources, vec!["pod/default/web-0", "pod/default/web-1"]);
		assert_idle(&mut running.output).await;
		running.stop().await;
	}

	#[tokio::test]
	async fn service_without_slice_emits_nothing() {
		let cluster = FakeCluster::default();
		let mut running = Running::start(cluster.clone(), "role: endpointslice");
		cluster.apply::<Service>(object(json!({
			"metadata": {"name": "svc", "namespace": "default"},
			"spec": {"ports": [{"port": 80}]},
		})));
		assert_idle(&mut running.output).await;

		cluster.apply::<EndpointSlice>(object(json!({
			"metadata": {
				"name": "svc-abcde",
				"namespace": "default",
				"labels": {"kubernetes.io/service-name": "svc"},
			},
			"addressType": "IPv4",
			"endpoints": [{"addresses": ["10.0.0.1"]}],
			"ports": [{"port": 80}],
		})));
		let group = recv(&mut running.output).await;
		assert_eq!(group.source, "endpointslice/default/svc-abcde");
		assert_eq!(group.labels["__meta_kubernetes_service_name"], "svc");
		running.stop().await;
	}

	#[tokio::test]
	async fn pod_change_rederives_endpoints() {
		let cluster = FakeCluster::default();
		cluster.apply(pod("web-0", "worker-1"));
		cluster.apply::<Endpoints>(object(json!({
			"metadata": {"name": "web", "namespace": "default"},
			"subsets": [{
				"addresses": [{"ip": "10.0.0.1", "targetRef": {"kind": "Pod", "name": "web-0", "namespace": "default"}}],
				"ports": [{"port": 80}],
			}],
		})));
		let mut running = Running::start(cluster.clone(), "role: endpoints");
		let group = recv(&mut running.output).await;
		assert_eq!(group.source, "endpoints/default/web");
		assert_eq!(group.targets[0]["__meta_kubernetes_pod_label_app"], "web");
		assert_idle(&mut running.output).await;

		let mut relabeled = pod("web-0", "worker-1");
		relabeled.metadata.labels = Some([("app".to_owned(), "api".to_owned())].into());
		cluster.apply(relabeled);
		let group = recv(&mut running.output).await;
		assert_eq!(group.source, "endpoints/default/web");
		assert_eq!(group.targets[0]["__meta_kubernetes_pod_label_app"], "api");

		// a service with the same name joins its labels in
		cluster.apply::<Service>(object(json!({"metadata": {"name": "web", "namespace": "default"}})));
		let group = recv(&mut running.output).await;
		assert_eq!(group.labels["__meta_kubernetes_service_name"], "web");
		assert_idle(&mut running.output).await;
		running.stop().await;
	}

	#[tokio::test]
	async fn disconnect_recovers_without_reemitting() {
		let cluster = FakeCluster::default();
		cluster.apply(pod("web-0", "worker-1"));
		let mut running = Running::start(cluster.clone(), "role: pod");
		recv(&mut running.output).await;

		let api = cluster.api::<Pod>();
		eventually(|| api.open_watches() == 1).await;
		api.disconnect();
		eventually(|| api.lists() == 2 && api.open_watches() == 1).await;
		assert_eq!(running.metrics.failures(), 1);
		assert_idle(&mut running.output).await;

		cluster.apply(pod("web-1", "worker-1"));
		assert_eq!(recv(&mut running.output).await.source, "pod/default/web-1");
		running.stop().await;
	}

	#[tokio::test]
	async fn clean_watch_end_resumes_without_relist() {
		let cluster = FakeCluster::default();
		cluster.apply(pod("web-0", "worker-1"));
		let mut running = Running::start(cluster, "role: pod");
		recv(&mut running.output).await;

		let api = running.cluster.api::<Pod>();
		eventually(|| api.open_watches() == 1).await;
		api.close_watches();
		eventually(|| api.watches() == 2 && api.open_watches() == 1).await;
		assert_eq!(api.lists(), 1);
		assert_eq!(api.watched_from(), vec!["1", "1"]);
		assert_eq!(running.metrics.failures(), 0);
		assert_idle(&mut running.output).await;

		running.cluster.apply(pod("web-1", "worker-1"));
		assert_eq!(recv(&mut running.output).await.source, "pod/default/web-1");
		running.stop().await;
	}

	#[tokio::test]
	async fn expired_watch_relists() {
		let cluster = FakeCluster::default();
		cluster.apply(pod("web-0", "worker-1"));
		let mut running = Running::start(cluster, "role: pod");
		recv(&mut running.output).await;

		let api = running.cluster.api::<Pod>();
		eventually(|| api.open_watches() == 1).await;
		api.expire();
		eventually(|| api.lists() == 2 && api.open_watches() == 1).await;
		assert_eq!(api.watches(), 2);
		assert_eq!(running.metrics.failures(), 1);
		assert_idle(&mut running.output).await;
		running.stop().await;
	}

	#[tokio::test]
	async fn bookmark_moves_resume_version() {
		let cluster = FakeCluster::default();
		cluster.apply(pod("web-0", "worker-1"));
		let mut running = Running::start(cluster, "{role: pod, namespaces: {names: [default]}}");
		recv(&mut running.output).await;

		let api = running.cluster.api::<Pod>();
		eventually(|| api.open_watches() == 1).await;
		// filtered out of the watch, only the bookmark carries its version
		let mut elsewhere = pod("web-0", "worker-1");
		elsewhere.metadata.namespace = Some("other".to_owned());
		api.apply(elsewhere);
		api.bookmark();
		api.close_watches();
		eventually(|| api.watches() == 2).await;
		assert_eq!(api.watched_from(), vec!["1", "2"]);
		assert_eq!(api.lists(), 1);
		assert_eq!(running.metrics.failures(), 0);
		assert_idle(&mut running.output).await;
		running.stop().await;
	}

	#[tokio::test]
	async fn namespaces_get_separate_caches() {
		let cluster = FakeCluster::default();
		let mut running = Running::start(
			cluster.clone(),
			"{role: service, namespaces: {names: [a, b]}, attach_metadata: {namespace: true}}",
		);
		cluster.apply::<Namespace>(object(json!({"metadata": {"name": "a"}})));
		for namespace in ["a", "b", "c"] {
			cluster.apply::<Service>(object(json!({
				"metadata": {"name": "svc", "namespace": namespace},
				"spec": {"ports": [{"port": 80}]},
			})));
		}
		let mut sources = vec![
			recv(&mut running.output).await.source,
			recv(&mut running.output).await.source,
		];
		sources.sort();
		assert_eq!(sources, vec!["service/a/svc", "service/b/svc"]);
		assert_idle(&mut running.output).await;

		// a namespace update re-derives only the services inside it
		cluster.apply::<Namespace>(object(json!({
			"metadata": {"name": "a", "labels": {"team": "x"}},
		})));
		let group = recv(&mut running.output).await;
		assert_eq!(group.source, "service/a/svc");
		assert_eq!(group.labels["__meta_kubernetes_namespace_label_team"], "x");
		assert_idle(&mut running.output).await;

		// one shared namespace cache, one service cache per namespace
		assert_eq!(cluster.api::<Namespace>().lists(), 1);
		assert_eq!(cluster.api::<Service>().lists(), 2);
		running.stop().await;
	}

	#[tokio::test]
	async fn cancelled_before_sync() {
		let token = CancellationToken::new();
		token.cancel();
		let (tx, mut output) = mpsc::channel(1);
		let discovery = Discovery::new(
			FakeCluster::default(),
			SdConfig::new(Role::Node),
			None,
			testing::metrics(),
		);
		tokio::time::timeout(std::time::Duration::from_secs(5), discovery.run(token, tx))
			.await
			.unwrap();
		assert!(output.recv().await.is_none());
	}
}
