//! Translation of object metadata into target labels
//!
//! Every discovered label lives under the `__meta_kubernetes_` prefix. Object
//! labels and annotations are exposed twice: once with their value and once
//! as a `...present_` marker set to `true`, so that relabeling can tell an
//! empty value apart from a missing one.

use std::collections::BTreeMap;

use k8s_openapi::{
	api::core::v1::{Namespace, Node},
	apimachinery::pkg::apis::meta::v1::ObjectMeta,
};

use crate::targetgroup::LabelSet;

pub const META_LABEL_PREFIX: &str = "__meta_kubernetes_";
pub const NAMESPACE_LABEL: &str = "__meta_kubernetes_namespace";
pub const ADDRESS_LABEL: &str = "__address__";
pub const INSTANCE_LABEL: &str = "instance";
pub const PRESENT_VALUE: &str = "true";

/// Builds `__meta_kubernetes_<suffix>`
pub fn meta(suffix: &str) -> String {
	format!("{}{}", META_LABEL_PREFIX, suffix)
}

/// Replaces every character outside of `[A-Za-z0-9_]` with `_`
pub fn sanitize_label_name(name: &str) -> String {
	name.chars()
		.map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
		.collect()
}

/// Host and port joined the way scrape addresses expect, IPv6 hosts get brackets
pub fn join_host_port(host: &str, port: impl std::fmt::Display) -> String {
	if host.contains(':') {
		format!("[{}]:{}", host, port)
	} else {
		format!("{}:{}", host, port)
	}
}

fn add_map(
	labels: &mut LabelSet,
	resource: &str,
	kind: &str,
	values: Option<&BTreeMap<String, String>>,
) {
	for (key, value) in values.into_iter().flatten() {
		let name = sanitize_label_name(key);
		labels.insert(
			format!("{}{}_{}_{}", META_LABEL_PREFIX, resource, kind, name),
			value.clone(),
		);
		labels.insert(
			format!("{}{}_{}present_{}", META_LABEL_PREFIX, resource, kind, name),
			PRESENT_VALUE.to_owned(),
		);
	}
}

/// `<resource>_label_*`, `<resource>_annotation_*` and their presence markers
pub fn add_annotations_and_labels(labels: &mut LabelSet, meta: &ObjectMeta, resource: &str) {
	add_map(labels, resource, "label", meta.labels.as_ref());
	add_map(labels, resource, "annotation", meta.annotations.as_ref());
}

/// `<resource>_name` plus every label and annotation
pub fn add_object_meta_labels(labels: &mut LabelSet, meta: &ObjectMeta, resource: &str) {
	labels.insert(
		format!("{}{}_name", META_LABEL_PREFIX, resource),
		meta.name.clone().unwrap_or_default(),
	);
	add_annotations_and_labels(labels, meta, resource);
}

/// Namespace name is already carried by `__meta_kubernetes_namespace`
pub fn add_namespace_labels(labels: &mut LabelSet, namespace: &Namespace) {
	add_annotations_and_labels(labels, &namespace.metadata, "namespace");
}

pub fn add_node_labels(labels: &mut LabelSet, node: &Node) {
	add_object_meta_labels(labels, &node.metadata, "node");
}
