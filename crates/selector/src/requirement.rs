use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

/// Label requirement operator
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Operator {
    Exists,
    DoesNotExist,
    Equals,
    NotEquals,
    In,
    NotIn,
    GreaterThan,
    LessThan,
}

/// Single term of a label selector, e.g. `tier in (web,api)`
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl Requirement {
    pub fn new(key: String, operator: Operator, values: Vec<String>) -> Self {
        Self {
            key,
            operator,
            values,
        }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let found = labels.get(&self.key);
        match self.operator {
            Operator::Exists => found.is_some(),
            Operator::DoesNotExist => found.is_none(),
            Operator::Equals => found == self.values.first(),
            Operator::NotEquals => found != self.values.first(),
            Operator::In => found.map(|v| self.values.contains(v)).unwrap_or(false),
            Operator::NotIn => !found.map(|v| self.values.contains(v)).unwrap_or(false),
            Operator::GreaterThan | Operator::LessThan => {
                let (Some(found), Some(bound)) = (
                    found.and_then(|v| v.parse::<i64>().ok()),
                    self.values.first().and_then(|v| v.parse::<i64>().ok()),
                ) else {
                    return false;
                };
                if self.operator == Operator::GreaterThan {
                    found > bound
                } else {
                    found < bound
                }
            }
        }
    }
}

impl Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
            Operator::Equals => write!(f, "{}={}", self.key, self.values[0]),
            Operator::NotEquals => write!(f, "{}!={}", self.key, self.values[0]),
            Operator::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, self.values.join(",")),
            Operator::GreaterThan => write!(f, "{}>{}", self.key, self.values[0]),
            Operator::LessThan => write!(f, "{}<{}", self.key, self.values[0]),
        }
    }
}

/// Field requirement operator, fields only support (in)equality
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FieldOperator {
    Equals,
    NotEquals,
}

/// Single term of a field selector, e.g. `spec.nodeName=worker-1`
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FieldRequirement {
    pub field: String,
    pub operator: FieldOperator,
    pub value: String,
}

fn write_escaped(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    for c in value.chars() {
        if matches!(c, '\\' | ',' | '=' | '!') {
            write!(f, "\\")?;
        }
        write!(f, "{}", c)?;
    }
    Ok(())
}

impl Display for FieldRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            FieldOperator::Equals => write!(f, "{}=", self.field)?,
            FieldOperator::NotEquals => write!(f, "{}!=", self.field)?,
        }
        write_escaped(f, &self.value)
    }
}
