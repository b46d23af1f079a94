use std::sync::Arc;

use k8s_openapi::api::networking::v1::{Ingress, IngressRule};

use super::{enqueue_own, source, Attached, Builder, RoleDiscoverer};
use crate::{
	cache::{Cache, WorkQueue},
	config::Role,
	kubemodel::ObjectKey,
	labels::{self, meta, ADDRESS_LABEL, NAMESPACE_LABEL},
	targetgroup::{LabelSet, TargetGroup},
};

pub struct IngressBuilder {
	ingresses: Cache<Ingress>,
	attached: Attached,
}

pub fn discoverer(ingresses: Cache<Ingress>, attached: Attached) -> RoleDiscoverer<IngressBuilder> {
	let queue = Arc::new(WorkQueue::new());
	enqueue_own(&ingresses, &queue);
	attached.subscribe(&ingresses, &queue);
	let mut synced = vec![ingresses.sync_signal()];
	synced.extend(attached.signals());
	RoleDiscoverer::new(IngressBuilder { ingresses, attached }, queue, synced)
}

/// Exact match, or a `*.` wildcard covering exactly one leading label
fn matches_host(pattern: &str, host: &str) -> bool {
	if pattern == host {
		return true;
	}
	let pattern: Vec<&str> = pattern.split('.').collect();
	let host: Vec<&str> = host.split('.').collect();
	pattern.len() == host.len() && pattern[0] == "*" && pattern[1..] == host[1..]
}

/// Paths of a rule, `/` stands in for empty paths and rules without paths
fn rule_paths(rule: &IngressRule) -> Vec<String> {
	let paths: Vec<String> = rule
		.http
		.iter()
		.flat_map(|http| http.paths.iter())
		.map(|path| path.path.clone().filter(|p| !p.is_empty()).unwrap_or_else(|| "/".to_owned()))
		.collect();
	if paths.is_empty() {
		vec!["/".to_owned()]
	} else {
		paths
	}
}

impl Builder for IngressBuilder {
	type Object = Ingress;
	const ROLE: Role = Role::Ingress;

	fn primary(&self) -> &Cache<Ingress> {
		&self.ingresses
	}

	fn build(&self, ingress: &Ingress) -> Option<TargetGroup> {
		let key = ObjectKey::of(ingress);
		let mut group = TargetGroup::new(source(Role::Ingress, &key));
		labels::add_object_meta_labels(&mut group.labels, &ingress.metadata, "ingress");
		group
			.labels
			.insert(NAMESPACE_LABEL.to_owned(), key.namespace.clone());
		self.attached
			.add_namespace_labels(&mut group.labels, &key.namespace);

		let Some(spec) = &ingress.spec else {
			return Some(group);
		};
		if let Some(class) = &spec.ingress_class_name {
			group.labels.insert(meta("ingress_class_name"), class.clone());
		}

		let tls_hosts: Vec<&str> = spec
			.tls
			.iter()
			.flatten()
			.flat_map(|tls| tls.hosts.iter().flatten())
			.map(String::as_str)
			.collect();
		for rule in spec.rules.iter().flatten() {
			let host = rule.host.clone().unwrap_or_default();
			let scheme = match tls_hosts.iter().any(|pattern| matches_host(pattern, &host)) {
				true => "https",
				false => "http",
			};
			for path in rule_paths(rule) {
				group.targets.push(LabelSet::from([
					(ADDRESS_LABEL.to_owned(), host.clone()),
					(meta("ingress_scheme"), scheme.to_owned()),
					(meta("ingress_host"), host.clone()),
					(meta("ingress_path"), path),
				]));
			}
		}
		Some(group)
	}
}
