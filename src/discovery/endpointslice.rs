use std::sync::Arc;

use k8s_openapi::api::{
	core::v1::{Pod, Service},
	discovery::v1::{Endpoint, EndpointPort, EndpointSlice},
};

use super::{
	endpoints::{endpoint_node, SeenPods},
	enqueue_by_index, enqueue_own, key_of,
	service::service_labels,
	source, Attached, Builder, RoleDiscoverer,
};
use crate::{
	cache::{Cache, WorkQueue},
	config::Role,
	index::{self, IndexKind, SERVICE_NAME_LABEL},
	kubemodel::ObjectKey,
	labels::{
		self, join_host_port, meta, sanitize_label_name, ADDRESS_LABEL, NAMESPACE_LABEL,
		PRESENT_VALUE,
	},
	targetgroup::{LabelSet, TargetGroup},
};

pub struct EndpointSliceBuilder {
	slices: Cache<EndpointSlice>,
	services: Cache<Service>,
	pods: Cache<Pod>,
	attached: Attached,
}

pub fn discoverer(
	slices: Cache<EndpointSlice>,
	services: Cache<Service>,
	pods: Cache<Pod>,
	attached: Attached,
) -> RoleDiscoverer<EndpointSliceBuilder> {
	let queue = Arc::new(WorkQueue::new());
	enqueue_own(&slices, &queue);
	attached.subscribe(&slices, &queue);
	enqueue_by_index(&services, &slices, &queue, IndexKind::Service, false, key_of::<Service>);
	enqueue_by_index(&pods, &slices, &queue, IndexKind::Pod, false, key_of::<Pod>);

	let mut synced = vec![
		slices.sync_signal(),
		services.sync_signal(),
		pods.sync_signal(),
	];
	synced.extend(attached.signals());
	RoleDiscoverer::new(
		EndpointSliceBuilder {
			slices,
			services,
			pods,
			attached,
		},
		queue,
		synced,
	)
}

fn insert_some(target: &mut LabelSet, suffix: &str, value: Option<String>) {
	if let Some(value) = value {
		target.insert(meta(suffix), value);
	}
}

impl EndpointSliceBuilder {
	fn target(
		&self,
		namespace: &str,
		address: &str,
		endpoint: &Endpoint,
		port: &EndpointPort,
		seen: &mut SeenPods,
	) -> LabelSet {
		let address = match port.port {
			Some(number) => join_host_port(address, number),
			None => address.to_owned(),
		};
		let mut target = LabelSet::from([(ADDRESS_LABEL.to_owned(), address)]);
		insert_some(&mut target, "endpointslice_port_name", port.name.clone());
		insert_some(&mut target, "endpointslice_port_protocol", port.protocol.clone());
		insert_some(&mut target, "endpointslice_port", port.port.map(|p| p.to_string()));
		insert_some(
			&mut target,
			"endpointslice_port_app_protocol",
			port.app_protocol.clone(),
		);

		let conditions = endpoint.conditions.as_ref();
		let condition = |value: Option<bool>| value.map(|value| value.to_string());
		insert_some(
			&mut target,
			"endpointslice_endpoint_conditions_ready",
			condition(conditions.and_then(|c| c.ready)),
		);
		insert_some(
			&mut target,
			"endpointslice_endpoint_conditions_serving",
			condition(conditions.and_then(|c| c.serving)),
		);
		insert_some(
			&mut target,
			"endpointslice_endpoint_conditions_terminating",
			condition(conditions.and_then(|c| c.terminating)),
		);

		insert_some(&mut target, "endpointslice_endpoint_hostname", endpoint.hostname.clone());
		if let Some(target_ref) = &endpoint.target_ref {
			target.insert(
				meta("endpointslice_address_target_kind"),
				target_ref.kind.clone().unwrap_or_default(),
			);
			target.insert(
				meta("endpointslice_address_target_name"),
				target_ref.name.clone().unwrap_or_default(),
			);
		}
		insert_some(&mut target, "endpointslice_endpoint_node_name", endpoint.node_name.clone());
		insert_some(&mut target, "endpointslice_endpoint_zone", endpoint.zone.clone());
		for (key, value) in endpoint.deprecated_topology.iter().flatten() {
			let name = sanitize_label_name(key);
			target.insert(
				meta(&format!("endpointslice_endpoint_topology_{}", name)),
				value.clone(),
			);
			target.insert(
				meta(&format!("endpointslice_endpoint_topology_present_{}", name)),
				PRESENT_VALUE.to_owned(),
			);
		}

		self.attached.add_node_labels(
			&mut target,
			endpoint_node(endpoint.target_ref.as_ref(), endpoint.node_name.as_ref()),
		);
		let pod = index::resolve_pod(endpoint.target_ref.as_ref(), namespace)
			.and_then(|key| self.pods.get(&key));
		if let Some(pod) = pod {
			seen.attach(&mut target, pod, port.port);
		}
		target
	}
}

impl Builder for EndpointSliceBuilder {
	type Object = EndpointSlice;
	const ROLE: Role = Role::EndpointSlice;

	fn primary(&self) -> &Cache<EndpointSlice> {
		&self.slices
	}

	fn build(&self, slice: &EndpointSlice) -> Option<TargetGroup> {
		let key = ObjectKey::of(slice);
		let mut group = TargetGroup::new(source(Role::EndpointSlice, &key));
		group.labels = LabelSet::from([
			(NAMESPACE_LABEL.to_owned(), key.namespace.clone()),
			(meta("endpointslice_address_type"), slice.address_type.clone()),
		]);
		labels::add_object_meta_labels(&mut group.labels, &slice.metadata, "endpointslice");

		let service = slice
			.metadata
			.labels
			.as_ref()
			.and_then(|labels| labels.get(SERVICE_NAME_LABEL))
			.and_then(|name| {
				self.services
					.get(&ObjectKey::new(key.namespace.as_str(), name.as_str()))
			});
		if let Some(service) = service {
			group.labels.extend(service_labels(&service));
		}
		self.attached
			.add_namespace_labels(&mut group.labels, &key.namespace);

		let mut seen = SeenPods::default();
		for endpoint in &slice.endpoints {
			for port in slice.ports.iter().flatten() {
				for address in &endpoint.addresses {
					let target = self.target(&key.namespace, address, endpoint, port, &mut seen);
					group.targets.push(target);
				}
			}
		}
		group.targets.extend(seen.uncovered());
		Some(group)
	}
}
