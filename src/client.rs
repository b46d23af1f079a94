//! List/Watch access to the cluster
//!
//! The discovery engine only ever lists and watches objects of one kind in one
//! scope. [`ListWatch`] is that capability, [`ClusterClient`] hands it out per
//! kind and namespace, [`KubeClient`] backs both with a real API server.

use std::{
	fs,
	path::{Path, PathBuf},
	sync::Arc,
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use kube::{
	api::{ListParams, WatchEvent, WatchParams},
	config::{KubeConfigOptions, Kubeconfig},
	Api, Client, Config,
};
use log::info;

use crate::{config::SdConfig, kubemodel::Object, Error, Result};

pub const OWN_NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Server side watch timeout, the stream is reopened after it ends
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Label and field selectors restricting which objects are listed and watched
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Selectors {
	pub label: Option<String>,
	pub field: Option<String>,
}

impl Selectors {
	pub fn new(label: &str, field: &str) -> Self {
		let non_empty = |s: &str| Some(s.to_owned()).filter(|s| !s.is_empty());
		Self {
			label: non_empty(label),
			field: non_empty(field),
		}
	}

	pub fn list_params(&self) -> ListParams {
		let mut params = ListParams::default();
		if let Some(label) = &self.label {
			params = params.labels(label);
		}
		if let Some(field) = &self.field {
			params = params.fields(field);
		}
		params
	}

	pub fn watch_params(&self) -> WatchParams {
		let mut params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
		if let Some(label) = &self.label {
			params = params.labels(label);
		}
		if let Some(field) = &self.field {
			params = params.fields(field);
		}
		params
	}
}

/// Result of a full list: every object plus the version to resume watching from
pub struct Snapshot<K> {
	pub items: Vec<K>,
	pub resource_version: String,
}

pub type EventStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

#[async_trait]
pub trait ListWatch<K: Object>: Send + Sync {
	async fn list(&self, selectors: &Selectors) -> Result<Snapshot<K>>;
	async fn watch(&self, selectors: &Selectors, resource_version: &str) -> Result<EventStream<K>>;
}

pub trait ClusterClient: Send + Sync + 'static {
	/// `None` namespace lists cluster scoped kinds, or every namespace for namespaced ones
	fn list_watch<K: Object>(&self, namespace: Option<&str>) -> Arc<dyn ListWatch<K>>;
}

pub struct KubeListWatch<K: Object> {
	api: Api<K>,
}

#[async_trait]
impl<K: Object> ListWatch<K> for KubeListWatch<K> {
	async fn list(&self, selectors: &Selectors) -> Result<Snapshot<K>> {
		let list = self.api.list(&selectors.list_params()).await?;
		Ok(Snapshot {
			items: list.items,
			resource_version: list.metadata.resource_version.unwrap_or_default(),
		})
	}

	async fn watch(&self, selectors: &Selectors, resource_version: &str) -> Result<EventStream<K>> {
		let stream = self
			.api
			.watch(&selectors.watch_params(), resource_version)
			.await?;
		Ok(stream.map_err(Error::from).boxed())
	}
}

#[derive(Clone)]
pub struct KubeClient(pub Client);

impl ClusterClient for KubeClient {
	fn list_watch<K: Object>(&self, namespace: Option<&str>) -> Arc<dyn ListWatch<K>> {
		Arc::new(KubeListWatch {
			api: K::api(self.0.clone(), namespace),
		})
	}
}

fn access_error(context: &str, e: impl std::fmt::Display) -> Error {
	Error::ClusterAccess(format!("{}: {}", context, e))
}

/// Reads the namespace this process runs in, surrounding whitespace is ignored
pub fn read_own_namespace(path: &Path) -> Result<String> {
	let contents = fs::read_to_string(path)
		.map_err(|e| access_error("could not determine the pod's namespace", e))?;
	let namespace = contents.trim();
	if namespace.is_empty() {
		return Err(Error::ClusterAccess(
			"could not read own namespace name (empty file)".into(),
		));
	}
	Ok(namespace.to_owned())
}

fn path_string(path: &Option<PathBuf>) -> Option<String> {
	path.as_ref().map(|path| path.display().to_string())
}

async fn client_config(config: &SdConfig) -> Result<(Config, Option<String>)> {
	if let Some(path) = &config.kubeconfig_file {
		let kubeconfig = Kubeconfig::read_from(path)
			.map_err(|e| access_error("failed to read kubeconfig", e))?;
		let client_config =
			Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
				.await
				.map_err(|e| access_error("invalid kubeconfig", e))?;
		return Ok((client_config, None));
	}

	let Some(api_server) = &config.api_server else {
		let client_config = Config::incluster()
			.map_err(|e| access_error("failed to load in-cluster config", e))?;
		let own_namespace = if config.namespaces.own_namespace {
			Some(read_own_namespace(Path::new(OWN_NAMESPACE_FILE))?)
		} else {
			None
		};
		info!("using pod service account via in-cluster config");
		return Ok((client_config, own_namespace));
	};

	let uri = api_server
		.as_str()
		.parse::<http::Uri>()
		.map_err(|e| access_error("invalid api_server", e))?;
	let mut client_config = Config::new(uri);
	let http = &config.http_client;
	client_config.accept_invalid_certs = http.tls_config.insecure_skip_verify;
	if let Some(proxy) = &http.proxy_url {
		client_config.proxy_url = Some(
			proxy
				.as_str()
				.parse::<http::Uri>()
				.map_err(|e| access_error("invalid proxy_url", e))?,
		);
	}
	client_config.auth_info.token_file = path_string(&http.bearer_token_file);
	client_config.auth_info.client_certificate = path_string(&http.tls_config.cert_file);
	client_config.auth_info.client_key = path_string(&http.tls_config.key_file);
	Ok((client_config, None))
}

/// Builds a client the way the configuration asks for, together with the own
/// namespace when it has to be discovered
pub async fn connect(config: &SdConfig) -> Result<(KubeClient, Option<String>)> {
	let (client_config, own_namespace) = client_config(config).await?;
	let client = Client::try_from(client_config)
		.map_err(|e| access_error("failed to create client", e))?;
	Ok((KubeClient(client), own_namespace))
}
