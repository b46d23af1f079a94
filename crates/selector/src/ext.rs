use serde_json::Value;

/// Resolves dotted field paths (`spec.nodeName`) the way field selectors address objects
pub trait FieldsExt {
    fn field_value(&self, path: &str) -> Option<&Self>;
    fn field(&self, path: &str) -> Option<String>;
}

impl FieldsExt for Value {
    fn field_value(&self, path: &str) -> Option<&Self> {
        let mut found = self;
        for part in path.split('.') {
            found = match found {
                Value::Object(obj) => obj.get(part)?,
                _ => return None,
            };
        }
        Some(found)
    }

    fn field(&self, path: &str) -> Option<String> {
        match self.field_value(path)? {
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
