use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;

use super::{enqueue_own, source, Attached, Builder, RoleDiscoverer};
use crate::{
	cache::{Cache, WorkQueue},
	config::Role,
	kubemodel::ObjectKey,
	labels::{self, join_host_port, meta, ADDRESS_LABEL, NAMESPACE_LABEL},
	targetgroup::{LabelSet, TargetGroup},
};

pub struct ServiceBuilder {
	services: Cache<Service>,
	attached: Attached,
}

pub fn discoverer(services: Cache<Service>, attached: Attached) -> RoleDiscoverer<ServiceBuilder> {
	let queue = Arc::new(WorkQueue::new());
	enqueue_own(&services, &queue);
	attached.subscribe(&services, &queue);
	let mut synced = vec![services.sync_signal()];
	synced.extend(attached.signals());
	RoleDiscoverer::new(ServiceBuilder { services, attached }, queue, synced)
}

/// Service name, labels and annotations, shared with the endpoint roles
pub fn service_labels(service: &Service) -> LabelSet {
	let mut labels = LabelSet::new();
	labels::add_object_meta_labels(&mut labels, &service.metadata, "service");
	labels
}

impl Builder for ServiceBuilder {
	type Object = Service;
	const ROLE: Role = Role::Service;

	fn primary(&self) -> &Cache<Service> {
		&self.services
	}

	fn build(&self, service: &Service) -> Option<TargetGroup> {
		let key = ObjectKey::of(service);
		let mut group = TargetGroup::new(source(Role::Service, &key));
		group.labels = service_labels(service);
		group
			.labels
			.insert(NAMESPACE_LABEL.to_owned(), key.namespace.clone());
		self.attached
			.add_namespace_labels(&mut group.labels, &key.namespace);

		let Some(spec) = &service.spec else {
			return Some(group);
		};
		let kind = spec.type_.clone().unwrap_or_default();
		let load_balancer_ip = service
			.status
			.as_ref()
			.and_then(|status| status.load_balancer.as_ref())
			.and_then(|lb| lb.ingress.as_ref())
			.and_then(|ingress| ingress.first())
			.and_then(|ingress| ingress.ip.clone());

		let host = format!("{}.{}.svc", key.name, key.namespace);
		for port in spec.ports.iter().flatten() {
			let mut target = LabelSet::from([
				(ADDRESS_LABEL.to_owned(), join_host_port(&host, port.port)),
				(meta("service_port_name"), port.name.clone().unwrap_or_default()),
				(meta("service_port_number"), port.port.to_string()),
				(
					meta("service_port_protocol"),
					port.protocol.clone().unwrap_or_default(),
				),
				(meta("service_type"), kind.clone()),
			]);
			if kind == "ExternalName" {
				target.insert(
					meta("service_external_name"),
					spec.external_name.clone().unwrap_or_default(),
				);
			} else {
				target.insert(
					meta("service_cluster_ip"),
					spec.cluster_ip.clone().unwrap_or_default(),
				);
			}
			if kind == "LoadBalancer" {
				if let Some(ip) = &load_balancer_ip {
					target.insert(meta("service_loadbalancer_ip"), ip.clone());
				}
			}
			group.targets.push(target);
		}
		Some(group)
	}
}
