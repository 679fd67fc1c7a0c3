use crate::store::Value;
use std::collections::HashMap;

/// One row of attribute values backing a node.
///
/// Reference streams hold the referenced primary key as an integer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    /// Primary key; `None` until the frame is persisted
    pub id: Option<i64>,
    pub values: HashMap<String, Value>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: i64) -> Self {
        Self {
            id: Some(id),
            values: HashMap::new(),
        }
    }

    /// Value of a stream; absent streams read as `Null`
    pub fn get(&self, stream: &str) -> Value {
        self.values.get(stream).cloned().unwrap_or(Value::Null)
    }

    pub fn set(&mut self, stream: &str, value: Value) {
        self.values.insert(stream.to_string(), value);
    }

    /// Whether the stream holds a non-null value
    pub fn has(&self, stream: &str) -> bool {
        self.values.get(stream).map_or(false, |v| !v.is_null())
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_streams_read_null() {
        let mut frame = Frame::new();
        assert!(frame.get("name").is_null());
        frame.set("name", Value::from("a"));
        assert!(frame.has("name"));
        frame.set("name", Value::Null);
        assert!(!frame.has("name"));
        assert!(!frame.is_persisted());
    }
}
