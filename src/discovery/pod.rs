use std::sync::Arc;

use k8s_openapi::api::core::v1::{Container, ContainerPort, Pod};
use log::debug;

use super::{enqueue_own, source, Attached, Builder, RoleDiscoverer};
use crate::{
	cache::{Cache, WorkQueue},
	config::Role,
	kubemodel::ObjectKey,
	labels::{self, join_host_port, meta, ADDRESS_LABEL, NAMESPACE_LABEL},
	targetgroup::{LabelSet, TargetGroup},
};

pub struct PodBuilder {
	pods: Cache<Pod>,
	attached: Attached,
}

pub fn discoverer(pods: Cache<Pod>, attached: Attached) -> RoleDiscoverer<PodBuilder> {
	let queue = Arc::new(WorkQueue::new());
	enqueue_own(&pods, &queue);
	attached.subscribe(&pods, &queue);
	let mut synced = vec![pods.sync_signal()];
	synced.extend(attached.signals());
	RoleDiscoverer::new(PodBuilder { pods, attached }, queue, synced)
}

/// Ready condition status lowercased, `unknown` without one
fn pod_ready(pod: &Pod) -> String {
	pod.status
		.iter()
		.flat_map(|status| status.conditions.iter().flatten())
		.find(|condition| condition.type_ == "Ready")
		.map(|condition| condition.status.to_lowercase())
		.unwrap_or_else(|| "unknown".to_owned())
}

/// Pod level labels shared by the pod and endpoint roles
pub fn pod_labels(pod: &Pod) -> LabelSet {
	let spec = pod.spec.as_ref();
	let status = pod.status.as_ref();
	let text = |value: Option<&String>| value.cloned().unwrap_or_default();

	let mut labels = LabelSet::from([
		(meta("pod_ip"), text(status.and_then(|s| s.pod_ip.as_ref()))),
		(meta("pod_ready"), pod_ready(pod)),
		(meta("pod_phase"), text(status.and_then(|s| s.phase.as_ref()))),
		(meta("pod_node_name"), text(spec.and_then(|s| s.node_name.as_ref()))),
		(meta("pod_host_ip"), text(status.and_then(|s| s.host_ip.as_ref()))),
		(meta("pod_uid"), text(pod.metadata.uid.as_ref())),
	]);
	labels::add_object_meta_labels(&mut labels, &pod.metadata, "pod");

	let controller = pod
		.metadata
		.owner_references
		.iter()
		.flatten()
		.find(|owner| owner.controller == Some(true));
	if let Some(controller) = controller {
		if !controller.kind.is_empty() {
			labels.insert(meta("pod_controller_kind"), controller.kind.clone());
		}
		if !controller.name.is_empty() {
			labels.insert(meta("pod_controller_name"), controller.name.clone());
		}
	}
	labels
}

/// Regular containers followed by init containers, flagged when init
pub fn containers(pod: &Pod) -> impl Iterator<Item = (&Container, bool)> {
	let spec = pod.spec.as_ref();
	let regular = spec.into_iter().flat_map(|spec| spec.containers.iter());
	let init = spec.into_iter().flat_map(|spec| spec.init_containers.iter().flatten());
	regular.map(|c| (c, false)).chain(init.map(|c| (c, true)))
}

pub fn container_labels(labels: &mut LabelSet, container: &Container, init: bool) {
	labels.insert(meta("pod_container_name"), container.name.clone());
	labels.insert(
		meta("pod_container_image"),
		container.image.clone().unwrap_or_default(),
	);
	labels.insert(meta("pod_container_init"), init.to_string());
}

pub fn container_port_labels(labels: &mut LabelSet, port: &ContainerPort) {
	labels.insert(
		meta("pod_container_port_name"),
		port.name.clone().unwrap_or_default(),
	);
	labels.insert(
		meta("pod_container_port_number"),
		port.container_port.to_string(),
	);
	labels.insert(
		meta("pod_container_port_protocol"),
		port.protocol.clone().unwrap_or_default(),
	);
}

fn container_id(pod: &Pod, container: &Container, init: bool) -> String {
	let status = pod.status.as_ref();
	let statuses = status.and_then(|status| match init {
		true => status.init_container_statuses.as_ref(),
		false => status.container_statuses.as_ref(),
	});
	let id = statuses
		.into_iter()
		.flatten()
		.find(|status| status.name == container.name)
		.and_then(|status| status.container_id.clone());
	if id.is_none() {
		debug!(
			"cannot get container ID for {} in pod {}",
			container.name,
			ObjectKey::of(pod)
		);
	}
	id.unwrap_or_default()
}

impl Builder for PodBuilder {
	type Object = Pod;
	const ROLE: Role = Role::Pod;

	fn primary(&self) -> &Cache<Pod> {
		&self.pods
	}

	fn build(&self, pod: &Pod) -> Option<TargetGroup> {
		let key = ObjectKey::of(pod);
		let mut group = TargetGroup::new(source(Role::Pod, &key));
		let ip = pod
			.status
			.as_ref()
			.and_then(|status| status.pod_ip.as_deref())
			.filter(|ip| !ip.is_empty());
		// starting or evicted pods have no address yet
		let Some(ip) = ip else {
			return Some(group);
		};

		group.labels = pod_labels(pod);
		group
			.labels
			.insert(NAMESPACE_LABEL.to_owned(), key.namespace.clone());
		let node_name = pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref());
		self.attached.add_node_labels(&mut group.labels, node_name);
		self.attached
			.add_namespace_labels(&mut group.labels, &key.namespace);

		for (container, init) in containers(pod) {
			let mut target = LabelSet::new();
			container_labels(&mut target, container, init);
			target.insert(
				meta("pod_container_id"),
				container_id(pod, container, init),
			);

			let ports = container.ports.as_deref().unwrap_or_default();
			if ports.is_empty() {
				// port-less target, the port has to be added by relabeling
				target.insert(ADDRESS_LABEL.to_owned(), ip.to_owned());
				group.targets.push(target);
				continue;
			}
			for port in ports {
				let mut target = target.clone();
				container_port_labels(&mut target, port);
				target.insert(
					ADDRESS_LABEL.to_owned(),
					join_host_port(ip, port.container_port),
				);
				group.targets.push(target);
			}
		}
		Some(group)
	}
}
