use std::fmt::{self, Debug, Display};

use duplicate::duplicate_item;
use k8s_openapi::api::{
	core::v1::{Endpoints, Namespace, Node, Pod, Service},
	discovery::v1::EndpointSlice,
	networking::v1::Ingress,
};
use kube::{Api, Client, Resource};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
	config::Role,
	index::{self, IndexKind},
};

/// Identifies object type in cluster
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Kind {
	Node,
	Pod,
	Service,
	Endpoints,
	EndpointSlice,
	Ingress,
	Namespace,
}

impl Kind {
	pub fn namespaced(self) -> bool {
		!matches!(self, Kind::Node | Kind::Namespace)
	}

	/// Role this kind is reported under in event metrics
	pub fn role(self) -> Option<Role> {
		Some(match self {
			Kind::Node => Role::Node,
			Kind::Pod => Role::Pod,
			Kind::Service => Role::Service,
			Kind::Endpoints => Role::Endpoints,
			Kind::EndpointSlice => Role::EndpointSlice,
			Kind::Ingress => Role::Ingress,
			Kind::Namespace => return None,
		})
	}
}

impl Display for Kind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Kind::Node => "node",
			Kind::Pod => "pod",
			Kind::Service => "service",
			Kind::Endpoints => "endpoints",
			Kind::EndpointSlice => "endpointslice",
			Kind::Ingress => "ingress",
			Kind::Namespace => "namespace",
		};
		f.write_str(name)
	}
}

/// Identifies object in cluster, namespace is empty for cluster-scoped kinds
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default)]
pub struct ObjectKey {
	pub namespace: String,
	pub name: String,
}

impl ObjectKey {
	pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
		Self {
			namespace: namespace.into(),
			name: name.into(),
		}
	}

	pub fn cluster(name: impl Into<String>) -> Self {
		Self::new(String::new(), name)
	}

	pub fn of<K: Resource>(object: &K) -> Self {
		let meta = object.meta();
		Self::new(
			meta.namespace.clone().unwrap_or_default(),
			meta.name.clone().unwrap_or_default(),
		)
	}
}

impl Display for ObjectKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if !self.namespace.is_empty() {
			write!(f, "{}/", self.namespace)?;
		}
		write!(f, "{}", self.name)
	}
}

/// Resource kind the discovery engine knows how to mirror and index
pub trait Object:
	Resource<DynamicType = ()>
	+ Clone
	+ PartialEq
	+ Debug
	+ DeserializeOwned
	+ Serialize
	+ Send
	+ Sync
	+ 'static
{
	const KIND: Kind;

	/// Keys this object currently contributes to the given index
	fn index_keys(&self, index: IndexKind) -> Vec<String>;

	/// List/watch endpoint, `None` means all namespaces
	fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

#[duplicate_item(
	object kind keys;
	[Pod] [Kind::Pod] [index::pod];
	[Service] [Kind::Service] [index::namespace];
	[Endpoints] [Kind::Endpoints] [index::endpoints];
	[EndpointSlice] [Kind::EndpointSlice] [index::endpoint_slice];
	[Ingress] [Kind::Ingress] [index::namespace];
)]
impl Object for object {
	const KIND: Kind = kind;

	fn index_keys(&self, index: IndexKind) -> Vec<String> {
		keys(self, index)
	}

	fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
		match namespace {
			Some(namespace) => Api::namespaced(client, namespace),
			None => Api::all(client),
		}
	}
}

#[duplicate_item(
	object kind;
	[Node] [Kind::Node];
	[Namespace] [Kind::Namespace];
)]
impl Object for object {
	const KIND: Kind = kind;

	fn index_keys(&self, _index: IndexKind) -> Vec<String> {
		Vec::new()
	}

	fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
		Api::all(client)
	}
}
