use crate::{ext::FieldsExt, FieldOperator, FieldRequirement, Requirement};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    ops::Deref,
    str::FromStr,
};

/// Conjunction of label requirements, empty selector matches everything
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct LabelSelector(pub Vec<Requirement>);

impl LabelSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|r| r.matches(labels))
    }
}

/// Conjunction of field requirements, empty selector matches everything
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct FieldSelector(pub Vec<FieldRequirement>);

impl FieldSelector {
    /// Missing fields compare as empty strings, as the API server does
    pub fn matches(&self, object: &Value) -> bool {
        self.0.iter().all(|r| {
            let found = object.field(&r.field).unwrap_or_default();
            match r.operator {
                FieldOperator::Equals => found == r.value,
                FieldOperator::NotEquals => found != r.value,
            }
        })
    }
}

fn write_joined<T: Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (idx, item) in items.iter().enumerate() {
        if idx != 0 {
            write!(f, ",")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_joined(f, &self.0)
    }
}
impl Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_joined(f, &self.0)
    }
}

impl Deref for LabelSelector {
    type Target = [Requirement];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl Deref for FieldSelector {
    type Target = [FieldRequirement];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for LabelSelector {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        crate::parse_labels(s)
    }
}
impl FromStr for FieldSelector {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        crate::parse_fields(s)
    }
}
