use std::{collections::BTreeSet, sync::Arc};

use rustc_hash::FxHashMap;

use crate::{
	index::IndexKind,
	kubemodel::{Object, ObjectKey},
};

/// Change applied to a store
#[derive(Debug)]
pub enum Event<K> {
	Added(Arc<K>),
	Updated { old: Arc<K>, new: Arc<K> },
	Deleted(Arc<K>),
}

impl<K> Event<K> {
	/// Latest known state, for deletions the last state before removal
	pub fn object(&self) -> &Arc<K> {
		match self {
			Event::Added(object) | Event::Deleted(object) => object,
			Event::Updated { new, .. } => new,
		}
	}
}

type Index = FxHashMap<String, BTreeSet<ObjectKey>>;

/// Objects of one kind together with their secondary indices
///
/// Every mutation updates objects and indices in one step, callers are
/// expected to hold the store behind a lock.
pub struct Store<K> {
	objects: FxHashMap<ObjectKey, Arc<K>>,
	indices: FxHashMap<IndexKind, Index>,
}

impl<K: Object> Store<K> {
	pub fn new(indices: &[IndexKind]) -> Self {
		Self {
			objects: FxHashMap::default(),
			indices: indices.iter().map(|kind| (*kind, Index::default())).collect(),
		}
	}

	pub fn len(&self) -> usize {
		self.objects.len()
	}

	pub fn is_empty(&self) -> bool {
		self.objects.is_empty()
	}

	pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
		self.objects.get(key).cloned()
	}

	pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> {
		self.objects.keys()
	}

	/// Keys of objects currently producing `value` in the given index
	pub fn index_keys(&self, index: IndexKind, value: &str) -> Vec<ObjectKey> {
		self.indices
			.get(&index)
			.and_then(|index| index.get(value))
			.map(|keys| keys.iter().cloned().collect())
			.unwrap_or_default()
	}

	fn index(&mut self, key: &ObjectKey, object: &K) {
		for (kind, index) in self.indices.iter_mut() {
			for value in object.index_keys(*kind) {
				index.entry(value).or_default().insert(key.clone());
			}
		}
	}

	fn unindex(&mut self, key: &ObjectKey, object: &K) {
		for (kind, index) in self.indices.iter_mut() {
			for value in object.index_keys(*kind) {
				if let Some(keys) = index.get_mut(&value) {
					keys.remove(key);
					if keys.is_empty() {
						index.remove(&value);
					}
				}
			}
		}
	}

	/// Inserts or replaces an object
	pub fn apply(&mut self, object: K) -> Event<K> {
		let key = ObjectKey::of(&object);
		let new = Arc::new(object);
		let old = self.objects.insert(key.clone(), new.clone());
		if let Some(old) = &old {
			self.unindex(&key, old);
		}
		self.index(&key, &new);
		match old {
			Some(old) => Event::Updated { old, new },
			None => Event::Added(new),
		}
	}

	pub fn delete(&mut self, key: &ObjectKey) -> Option<Event<K>> {
		let old = self.objects.remove(key)?;
		self.unindex(key, &old);
		Some(Event::Deleted(old))
	}

	/// Replaces the whole content, returning the difference to the previous one
	///
	/// Objects equal to their stored state produce no event.
	pub fn replace(&mut self, items: Vec<K>) -> Vec<Event<K>> {
		let mut events = Vec::new();
		let mut seen = BTreeSet::new();
		for object in items {
			let key = ObjectKey::of(&object);
			let unchanged = self
				.objects
				.get(&key)
				.map_or(false, |current| **current == object);
			if !unchanged {
				events.push(self.apply(object));
			}
			seen.insert(key);
		}
		let vanished: Vec<ObjectKey> = self
			.objects
			.keys()
			.filter(|key| !seen.contains(*key))
			.cloned()
			.collect();
		for key in vanished {
			events.extend(self.delete(&key));
		}
		events
	}
}
