//! Kubernetes service discovery
//!
//! Mirrors cluster objects through list/watch, joins them with related
//! objects and turns them into labeled scrape target groups.

pub mod cache;
pub mod client;
pub mod config;
pub mod discovery;
mod error;
pub mod index;
pub mod kubemodel;
pub mod labels;
pub mod metrics;
pub mod targetgroup;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
