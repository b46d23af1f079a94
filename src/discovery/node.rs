use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use log::warn;

use super::{enqueue_own, source, Builder, RoleDiscoverer};
use crate::{
	cache::{Cache, WorkQueue},
	config::Role,
	kubemodel::ObjectKey,
	labels::{self, join_host_port, meta, sanitize_label_name, ADDRESS_LABEL, INSTANCE_LABEL},
	targetgroup::{LabelSet, TargetGroup},
};

/// Address types in the order they are preferred for the scrape address
const ADDRESS_PRIORITY: [&str; 6] = [
	"InternalIP",
	"InternalDNS",
	"ExternalIP",
	"ExternalDNS",
	"LegacyHostIP",
	"Hostname",
];

pub struct NodeBuilder {
	nodes: Cache<Node>,
}

pub fn discoverer(nodes: Cache<Node>) -> RoleDiscoverer<NodeBuilder> {
	let queue = Arc::new(WorkQueue::new());
	enqueue_own(&nodes, &queue);
	let synced = vec![nodes.sync_signal()];
	RoleDiscoverer::new(NodeBuilder { nodes }, queue, synced)
}

/// First address of the most preferred type, with every type's first address
fn node_address(node: &Node) -> Option<(String, Vec<(String, String)>)> {
	let addresses = node.status.as_ref()?.addresses.as_ref()?;
	let mut by_type: Vec<(String, String)> = Vec::new();
	for address in addresses {
		if !by_type.iter().any(|(kind, _)| *kind == address.type_) {
			by_type.push((address.type_.clone(), address.address.clone()));
		}
	}
	let preferred = ADDRESS_PRIORITY.iter().find_map(|kind| {
		by_type
			.iter()
			.find(|(candidate, _)| candidate == kind)
			.map(|(_, address)| address.clone())
	})?;
	Some((preferred, by_type))
}

fn kubelet_port(node: &Node) -> i32 {
	node.status
		.as_ref()
		.and_then(|status| status.daemon_endpoints.as_ref())
		.and_then(|endpoints| endpoints.kubelet_endpoint.as_ref())
		.map_or(0, |endpoint| endpoint.port)
}

impl Builder for NodeBuilder {
	type Object = Node;
	const ROLE: Role = Role::Node;

	fn primary(&self) -> &Cache<Node> {
		&self.nodes
	}

	fn build(&self, node: &Node) -> Option<TargetGroup> {
		let key = ObjectKey::of(node);
		let Some((address, by_type)) = node_address(node) else {
			warn!("cannot get address of node {}, skipping", key);
			return None;
		};

		let mut group = TargetGroup::new(source(Role::Node, &key));
		labels::add_node_labels(&mut group.labels, node);
		group.labels.insert(
			meta("node_provider_id"),
			node.spec
				.as_ref()
				.and_then(|spec| spec.provider_id.clone())
				.unwrap_or_default(),
		);

		let mut target = LabelSet::from([
			(ADDRESS_LABEL.to_owned(), join_host_port(&address, kubelet_port(node))),
			(INSTANCE_LABEL.to_owned(), key.name.clone()),
		]);
		for (kind, address) in by_type {
			target.insert(
				meta(&format!("node_address_{}", sanitize_label_name(&kind))),
				address,
			);
		}
		group.targets.push(target);
		Some(group)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::{cache, object};
	use serde_json::json;

	fn builder() -> NodeBuilder {
		NodeBuilder {
			nodes: cache(&[], vec![]),
		}
	}

	#[test]
	fn preferred_address() {
		let node: Node = object(json!({
			"metadata": {"name": "worker-1", "labels": {"topology.kubernetes.io/zone": "a"}},
			"spec": {"providerID": "aws:///eu-west-1a/i-123"},
			"status": {
				"addresses": [
					{"type": "Hostname", "address": "worker-1"},
					{"type": "ExternalIP", "address": "203.0.113.7"},
					{"type": "InternalIP", "address": "192.168.0.1"},
					{"type": "InternalIP", "address": "192.168.0.2"},
				],
				"daemonEndpoints": {"kubeletEndpoint": {"Port": 10250}},
			},
		}));
		let group = builder().build(&node).unwrap();
		assert_eq!(group.source, "node/worker-1");
		assert_eq!(group.labels["__meta_kubernetes_node_name"], "worker-1");
		assert_eq!(
			group.labels["__meta_kubernetes_node_label_topology_kubernetes_io_zone"],
			"a"
		);
		assert_eq!(
			group.labels["__meta_kubernetes_node_provider_id"],
			"aws:///eu-west-1a/i-123"
		);

		let target = &group.targets[0];
		assert_eq!(target[ADDRESS_LABEL], "192.168.0.1:10250");
		assert_eq!(target[INSTANCE_LABEL], "worker-1");
		assert_eq!(target["__meta_kubernetes_node_address_InternalIP"], "192.168.0.1");
		assert_eq!(target["__meta_kubernetes_node_address_ExternalIP"], "203.0.113.7");
		assert_eq!(target["__meta_kubernetes_node_address_Hostname"], "worker-1");
	}

	#[test]
	fn hostname_only() {
		let node: Node = object(json!({
			"metadata": {"name": "edge"},
			"status": {"addresses": [{"type": "Hostname", "address": "edge.local"}]},
		}));
		let group = builder().build(&node).unwrap();
		assert_eq!(group.targets[0][ADDRESS_LABEL], "edge.local:0");
		assert_eq!(group.labels["__meta_kubernetes_node_provider_id"], "");
	}

	#[test]
	fn without_address() {
		let node: Node = object(json!({"metadata": {"name": "fresh"}}));
		assert!(builder().build(&node).is_none());
	}
}
