//! Kubernetes label and field selectors
//!
//! Parses the textual selector syntax accepted by the API server
//! (`app=web,tier notin (cache),!legacy`, `metadata.name!=kube-proxy`) into
//! typed requirements, and evaluates them against label maps and objects.

mod error;
pub use error::*;
mod requirement;
pub use requirement::{FieldOperator, FieldRequirement, Operator, Requirement};
mod ext;
mod selector;
pub use ext::FieldsExt;
pub use selector::{FieldSelector, LabelSelector};
mod parse;
pub use parse::{parse_fields, parse_labels};
