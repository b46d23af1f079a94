//! Discovery configuration
//!
//! Configuration is loaded from YAML and validated as a whole before anything
//! touches the cluster. Which auxiliary caches a role joins against is
//! decided in one place, [`Auxiliary::required`], and used both for selector
//! validation and for wiring caches at runtime.

use std::{
	fmt::{self, Display},
	fs,
	path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{client::Selectors, index::IndexKind, Error, Result};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	Node,
	Pod,
	Service,
	Endpoints,
	EndpointSlice,
	Ingress,
}

impl Role {
	pub const ALL: [Role; 6] = [
		Role::Node,
		Role::Pod,
		Role::Service,
		Role::Endpoints,
		Role::EndpointSlice,
		Role::Ingress,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			Role::Node => "node",
			Role::Pod => "pod",
			Role::Service => "service",
			Role::Endpoints => "endpoints",
			Role::EndpointSlice => "endpointslice",
			Role::Ingress => "ingress",
		}
	}
}

impl Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
	pub cert_file: Option<PathBuf>,
	pub key_file: Option<PathBuf>,
	pub insecure_skip_verify: bool,
}

/// Transport settings, only meaningful together with `api_server`
#[derive(Clone, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
	pub bearer_token_file: Option<PathBuf>,
	pub proxy_url: Option<Url>,
	pub tls_config: TlsConfig,
}

impl HttpClientConfig {
	pub fn is_default(&self) -> bool {
		*self == Self::default()
	}
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NamespaceDiscovery {
	pub names: Vec<String>,
	pub own_namespace: bool,
}

/// Namespaces discovery runs in
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Namespaces {
	All,
	Names(Vec<String>),
}

impl Namespaces {
	/// One entry per cache scope, `None` stands for every namespace
	pub fn scopes(&self) -> Vec<Option<&str>> {
		match self {
			Namespaces::All => vec![None],
			Namespaces::Names(names) => names.iter().map(|name| Some(name.as_str())).collect(),
		}
	}
}

impl NamespaceDiscovery {
	pub fn resolve(&self, own_namespace: Option<&str>) -> Namespaces {
		if self.names.is_empty() && !self.own_namespace {
			return Namespaces::All;
		}
		let mut names = self.names.clone();
		if self.own_namespace {
			if let Some(own) = own_namespace.filter(|own| !own.is_empty()) {
				names.push(own.to_owned());
			}
		}
		Namespaces::Names(names)
	}
}

#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct SelectorConfig {
	pub role: Role,
	#[serde(default)]
	pub label: String,
	#[serde(default)]
	pub field: String,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AttachMetadata {
	pub node: bool,
	pub namespace: bool,
}

/// Caches a role joins its primary objects against
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Auxiliary {
	pub node: bool,
	pub namespace: bool,
	pub service: bool,
	pub pod: bool,
}

impl Auxiliary {
	pub fn required(role: Role, attach: AttachMetadata) -> Self {
		match role {
			Role::Node => Self::default(),
			Role::Pod => Self {
				node: attach.node,
				namespace: attach.namespace,
				..Self::default()
			},
			Role::Service | Role::Ingress => Self {
				namespace: attach.namespace,
				..Self::default()
			},
			Role::Endpoints | Role::EndpointSlice => Self {
				node: attach.node,
				namespace: attach.namespace,
				service: true,
				pod: true,
			},
		}
	}

	/// Indices the primary cache maintains so joined changes can be traced back to it
	pub fn primary_indices(&self, role: Role) -> Vec<IndexKind> {
		let mut indices = Vec::new();
		match role {
			Role::EndpointSlice => indices.extend([IndexKind::Service, IndexKind::Pod]),
			Role::Endpoints => indices.push(IndexKind::Pod),
			_ => {}
		}
		if self.node {
			indices.push(IndexKind::Node);
		}
		if self.namespace {
			indices.push(IndexKind::Namespace);
		}
		indices
	}

	/// Roles whose selectors may be configured, joined namespaced kinds first
	pub fn selector_roles(&self, role: Role) -> Vec<Role> {
		let mut roles = Vec::new();
		if self.pod && role != Role::Pod {
			roles.push(Role::Pod);
		}
		if self.service && role != Role::Service {
			roles.push(Role::Service);
		}
		roles.push(role);
		roles
	}
}

#[derive(Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct SdConfig {
	pub role: Role,
	#[serde(default)]
	pub api_server: Option<Url>,
	#[serde(default)]
	pub kubeconfig_file: Option<PathBuf>,
	#[serde(flatten)]
	pub http_client: HttpClientConfig,
	#[serde(default)]
	pub namespaces: NamespaceDiscovery,
	#[serde(default)]
	pub selectors: Vec<SelectorConfig>,
	#[serde(default)]
	pub attach_metadata: AttachMetadata,
}

impl SdConfig {
	pub fn new(role: Role) -> Self {
		Self {
			role,
			api_server: None,
			kubeconfig_file: None,
			http_client: HttpClientConfig::default(),
			namespaces: NamespaceDiscovery::default(),
			selectors: Vec::new(),
			attach_metadata: AttachMetadata::default(),
		}
	}

	pub fn from_yaml(text: &str) -> Result<Self> {
		let config: Self = serde_yaml::from_str(text)?;
		config.validate()?;
		Ok(config)
	}

	pub fn load(path: &Path) -> Result<Self> {
		Self::from_yaml(&fs::read_to_string(path)?)
	}

	pub fn auxiliary(&self) -> Auxiliary {
		Auxiliary::required(self.role, self.attach_metadata)
	}

	/// Selectors configured for caches of the given kind, empty when none are set
	pub fn selectors_for(&self, role: Role) -> Selectors {
		self.selectors
			.iter()
			.find(|selector| selector.role == role)
			.map(|selector| Selectors::new(&selector.label, &selector.field))
			.unwrap_or_default()
	}

	pub fn validate(&self) -> Result<()> {
		if self.api_server.is_some() && self.kubeconfig_file.is_some() {
			return Err(Error::Config(
				"cannot use 'kubeconfig_file' and 'api_server' simultaneously".into(),
			));
		}
		if self.kubeconfig_file.is_some() && !self.http_client.is_default() {
			return Err(Error::Config(
				"cannot use a custom HTTP client configuration together with 'kubeconfig_file'"
					.into(),
			));
		}
		if self.api_server.is_none() && !self.http_client.is_default() {
			return Err(Error::Config(
				"to use custom HTTP client configuration please provide the 'api_server' URL explicitly"
					.into(),
			));
		}
		if self.api_server.is_some() && self.namespaces.own_namespace {
			return Err(Error::Config(
				"cannot use 'api_server' and 'namespaces.own_namespace' simultaneously".into(),
			));
		}
		if self.kubeconfig_file.is_some() && self.namespaces.own_namespace {
			return Err(Error::Config(
				"cannot use 'kubeconfig_file' and 'namespaces.own_namespace' simultaneously".into(),
			));
		}

		let allowed = self.auxiliary().selector_roles(self.role);
		let mut seen = Vec::with_capacity(self.selectors.len());
		for entry in &self.selectors {
			if seen.contains(&entry.role) {
				return Err(Error::Config(format!(
					"duplicated selector role: {}",
					entry.role
				)));
			}
			seen.push(entry.role);

			if !allowed.contains(&entry.role) {
				let allowed = allowed
					.iter()
					.map(|role| role.as_str())
					.collect::<Vec<_>>()
					.join(", ");
				return Err(Error::Config(format!(
					"{} role supports only {} selectors",
					self.role, allowed
				)));
			}
			selector::parse_fields(&entry.field)?;
			selector::parse_labels(&entry.label)?;
		}
		Ok(())
	}
}
