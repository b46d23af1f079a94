use std::{
	collections::{BTreeMap, BTreeSet},
	sync::Arc,
};

use k8s_openapi::api::core::v1::{
	EndpointAddress, EndpointPort, Endpoints, ObjectReference, Pod, Service,
};
use log::warn;

use super::{
	enqueue_by_index, enqueue_own, key_of,
	pod::{container_labels, container_port_labels, containers, pod_labels},
	service::service_labels,
	source, Attached, Builder, RoleDiscoverer,
};
use crate::{
	cache::{Cache, WorkQueue},
	config::Role,
	index::{self, IndexKind},
	kubemodel::ObjectKey,
	labels::{self, join_host_port, meta, ADDRESS_LABEL, NAMESPACE_LABEL},
	targetgroup::{LabelSet, TargetGroup},
};

const OVER_CAPACITY_ANNOTATION: &str = "endpoints.kubernetes.io/over-capacity";

/// Pods referenced by endpoint addresses, with the endpoint ports that already
/// produced a target for them
#[derive(Default)]
pub struct SeenPods {
	pods: BTreeMap<ObjectKey, (Arc<Pod>, BTreeSet<i32>)>,
}

impl SeenPods {
	/// Adds pod labels, and the labels of the container port serving `port`
	pub fn attach(&mut self, target: &mut LabelSet, pod: Arc<Pod>, port: Option<i32>) {
		target.extend(pod_labels(&pod));
		if let Some(port) = port {
			let serving = containers(&pod).find_map(|(container, init)| {
				let ports = container.ports.iter().flatten();
				ports
					.filter(|candidate| candidate.container_port == port)
					.map(|candidate| (container, candidate, init))
					.next()
			});
			if let Some((container, container_port, init)) = serving {
				container_labels(target, container, init);
				container_port_labels(target, container_port);
			}
		}
		let (_, ports) = self
			.pods
			.entry(ObjectKey::of(pod.as_ref()))
			.or_insert_with(|| (pod.clone(), BTreeSet::new()));
		ports.extend(port);
	}

	/// Targets for the container ports no endpoint port covered
	pub fn uncovered(self) -> Vec<LabelSet> {
		let mut targets = Vec::new();
		for (pod, ports) in self.pods.into_values() {
			let ip = pod
				.status
				.as_ref()
				.and_then(|status| status.pod_ip.as_deref())
				.filter(|ip| !ip.is_empty());
			let Some(ip) = ip else {
				continue;
			};
			for (container, init) in containers(&pod) {
				for port in container.ports.iter().flatten() {
					if ports.contains(&port.container_port) {
						continue;
					}
					let mut target = pod_labels(&pod);
					container_labels(&mut target, container, init);
					container_port_labels(&mut target, port);
					target.insert(
						ADDRESS_LABEL.to_owned(),
						join_host_port(ip, port.container_port),
					);
					targets.push(target);
				}
			}
		}
		targets
	}
}

/// Node named by a `Node` reference, otherwise the reported node name
pub fn endpoint_node<'a>(
	target: Option<&'a ObjectReference>,
	node_name: Option<&'a String>,
) -> Option<&'a str> {
	match target {
		Some(target) if target.kind.as_deref() == Some("Node") => target.name.as_deref(),
		_ => node_name.map(String::as_str),
	}
}

pub struct EndpointsBuilder {
	endpoints: Cache<Endpoints>,
	services: Cache<Service>,
	pods: Cache<Pod>,
	attached: Attached,
}

pub fn discoverer(
	endpoints: Cache<Endpoints>,
	services: Cache<Service>,
	pods: Cache<Pod>,
	attached: Attached,
) -> RoleDiscoverer<EndpointsBuilder> {
	let queue = Arc::new(WorkQueue::new());
	enqueue_own(&endpoints, &queue);
	attached.subscribe(&endpoints, &queue);
	{
		// endpoints share the name of their service
		let endpoints = endpoints.clone();
		let queue = queue.clone();
		services.subscribe(move |event| {
			let key = ObjectKey::of(event.object().as_ref());
			if endpoints.get(&key).is_some() {
				queue.add(key);
			}
		});
	}
	enqueue_by_index(&pods, &endpoints, &queue, IndexKind::Pod, false, key_of::<Pod>);

	let mut synced = vec![
		endpoints.sync_signal(),
		services.sync_signal(),
		pods.sync_signal(),
	];
	synced.extend(attached.signals());
	RoleDiscoverer::new(
		EndpointsBuilder {
			endpoints,
			services,
			pods,
			attached,
		},
		queue,
		synced,
	)
}

impl EndpointsBuilder {
	fn target(
		&self,
		namespace: &str,
		address: &EndpointAddress,
		port: &EndpointPort,
		ready: bool,
		seen: &mut SeenPods,
	) -> LabelSet {
		let mut target = LabelSet::from([
			(ADDRESS_LABEL.to_owned(), join_host_port(&address.ip, port.port)),
			(meta("endpoint_port_name"), port.name.clone().unwrap_or_default()),
			(
				meta("endpoint_port_protocol"),
				port.protocol.clone().unwrap_or_default(),
			),
			(meta("endpoint_ready"), ready.to_string()),
		]);
		if let Some(app_protocol) = &port.app_protocol {
			target.insert(meta("endpoint_port_app_protocol"), app_protocol.clone());
		}
		if let Some(target_ref) = &address.target_ref {
			target.insert(
				meta("endpoint_address_target_kind"),
				target_ref.kind.clone().unwrap_or_default(),
			);
			target.insert(
				meta("endpoint_address_target_name"),
				target_ref.name.clone().unwrap_or_default(),
			);
		}
		if let Some(node_name) = &address.node_name {
			target.insert(meta("endpoint_node_name"), node_name.clone());
		}
		if let Some(hostname) = address.hostname.as_ref().filter(|h| !h.is_empty()) {
			target.insert(meta("endpoint_hostname"), hostname.clone());
		}
		self.attached.add_node_labels(
			&mut target,
			endpoint_node(address.target_ref.as_ref(), address.node_name.as_ref()),
		);

		let pod = index::resolve_pod(address.target_ref.as_ref(), namespace)
			.and_then(|key| self.pods.get(&key));
		if let Some(pod) = pod {
			seen.attach(&mut target, pod, Some(port.port));
		}
		target
	}
}

impl Builder for EndpointsBuilder {
	type Object = Endpoints;
	const ROLE: Role = Role::Endpoints;

	fn primary(&self) -> &Cache<Endpoints> {
		&self.endpoints
	}

	fn build(&self, endpoints: &Endpoints) -> Option<TargetGroup> {
		let key = ObjectKey::of(endpoints);
		let mut group = TargetGroup::new(source(Role::Endpoints, &key));
		group
			.labels
			.insert(NAMESPACE_LABEL.to_owned(), key.namespace.clone());
		if let Some(service) = self.services.get(&key) {
			group.labels.extend(service_labels(&service));
		}
		labels::add_object_meta_labels(&mut group.labels, &endpoints.metadata, "endpoints");
		self.attached
			.add_namespace_labels(&mut group.labels, &key.namespace);

		let capacity = endpoints
			.metadata
			.annotations
			.as_ref()
			.and_then(|annotations| annotations.get(OVER_CAPACITY_ANNOTATION));
		match capacity.map(String::as_str) {
			Some("truncated") => warn!(
				"number of endpoints in {} exceeds the maximum capacity, some have been truncated, use endpointslice instead",
				key
			),
			Some("warning") => warn!(
				"number of endpoints in {} exceeds the maximum capacity and will be truncated, use endpointslice instead",
				key
			),
			_ => {}
		}

		let mut seen = SeenPods::default();
		for subset in endpoints.subsets.iter().flatten() {
			for port in subset.ports.iter().flatten() {
				for address in subset.addresses.iter().flatten() {
					let target = self.target(&key.namespace, address, port, true, &mut seen);
					group.targets.push(target);
				}
				for address in subset.not_ready_addresses.iter().flatten() {
					let target = self.target(&key.namespace, address, port, false, &mut seen);
					group.targets.push(target);
				}
			}
		}
		group.targets.extend(seen.uncovered());
		Some(group)
	}
}
