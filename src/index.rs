//! Secondary index derivation
//!
//! Every index is a pure function from an object to the keys it currently
//! produces. Cross references that are missing or point at an unexpected kind
//! contribute nothing, the rest of the object is still indexed.

use k8s_openapi::api::{
	core::v1::{Endpoints, ObjectReference, Pod},
	discovery::v1::EndpointSlice,
};
use kube::Resource;

use crate::kubemodel::ObjectKey;

/// Label linking an endpoint slice to the service it belongs to
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum IndexKind {
	/// Name of the node hosting the object
	Node,
	/// Namespace the object lives in
	Namespace,
	/// `namespace/name` of the owning service
	Service,
	/// `namespace/name` of every referenced pod
	Pod,
}

/// Node referenced by an endpoint: `Node` references name it directly, `Pod`
/// references are resolved through the node name reported alongside them
pub fn resolve_node<'a>(
	target: Option<&'a ObjectReference>,
	node_name: Option<&'a String>,
) -> Option<&'a str> {
	let node = match target?.kind.as_deref()? {
		"Node" => target?.name.as_deref(),
		"Pod" => node_name.map(String::as_str),
		_ => None,
	};
	node.filter(|name| !name.is_empty())
}

/// `namespace/name` of a referenced pod, reference namespace defaults to the referrer's
pub fn resolve_pod(target: Option<&ObjectReference>, namespace: &str) -> Option<ObjectKey> {
	let target = target?;
	if target.kind.as_deref() != Some("Pod") {
		return None;
	}
	let name = target.name.as_deref().filter(|name| !name.is_empty())?;
	let namespace = target
		.namespace
		.as_deref()
		.filter(|ns| !ns.is_empty())
		.unwrap_or(namespace);
	Some(ObjectKey::new(namespace, name))
}

pub fn namespace<K: Resource>(object: &K, index: IndexKind) -> Vec<String> {
	match index {
		IndexKind::Namespace => object
			.meta()
			.namespace
			.iter()
			.filter(|ns| !ns.is_empty())
			.cloned()
			.collect(),
		_ => Vec::new(),
	}
}

pub fn pod(pod: &Pod, index: IndexKind) -> Vec<String> {
	match index {
		IndexKind::Node => pod
			.spec
			.as_ref()
			.and_then(|spec| spec.node_name.clone())
			.filter(|name| !name.is_empty())
			.into_iter()
			.collect(),
		index => namespace(pod, index),
	}
}

pub fn endpoints(endpoints: &Endpoints, index: IndexKind) -> Vec<String> {
	let own_namespace = endpoints.meta().namespace.as_deref().unwrap_or_default();
	let addresses = endpoints.subsets.iter().flatten().flat_map(|subset| {
		subset
			.addresses
			.iter()
			.flatten()
			.chain(subset.not_ready_addresses.iter().flatten())
	});
	let mut keys: Vec<String> = match index {
		IndexKind::Pod => addresses
			.filter_map(|addr| resolve_pod(addr.target_ref.as_ref(), own_namespace))
			.map(|key| key.to_string())
			.collect(),
		IndexKind::Node => addresses
			.filter_map(|addr| resolve_node(addr.target_ref.as_ref(), addr.node_name.as_ref()))
			.map(str::to_owned)
			.collect(),
		index => return namespace(endpoints, index),
	};
	keys.sort();
	keys.dedup();
	keys
}

pub fn endpoint_slice(slice: &EndpointSlice, index: IndexKind) -> Vec<String> {
	let own_namespace = slice.meta().namespace.as_deref().unwrap_or_default();
	let mut keys: Vec<String> = match index {
		IndexKind::Service => slice
			.meta()
			.labels
			.as_ref()
			.and_then(|labels| labels.get(SERVICE_NAME_LABEL))
			.map(|service| ObjectKey::new(own_namespace, service.as_str()).to_string())
			.into_iter()
			.collect(),
		IndexKind::Pod => slice
			.endpoints
			.iter()
			.filter_map(|ep| resolve_pod(ep.target_ref.as_ref(), own_namespace))
			.map(|key| key.to_string())
			.collect(),
		IndexKind::Node => slice
			.endpoints
			.iter()
			.filter_map(|ep| resolve_node(ep.target_ref.as_ref(), ep.node_name.as_ref()))
			.map(str::to_owned)
			.collect(),
		IndexKind::Namespace => return namespace(slice, index),
	};
	keys.sort();
	keys.dedup();
	keys
}
