use crate::store::Value;
use serde::{Deserialize, Serialize};

/// SQL column type of a scalar stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
    Timestamp,
}

impl SqlType {
    /// Declared type used in DDL
    pub fn declaration(&self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Text => "TEXT",
            SqlType::Blob => "BLOB",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Timestamp => "TIMESTAMP",
        }
    }

    /// Coerce a value read back from SQLite into this type's representation.
    pub(crate) fn coerce(&self, value: Value) -> Value {
        match (self, value) {
            (SqlType::Boolean, Value::Integer(i)) => Value::Boolean(i != 0),
            (SqlType::Real, Value::Integer(i)) => Value::Real(i as f64),
            (_, v) => v,
        }
    }
}

/// What a stream stores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamKind {
    /// A plain column
    Scalar(SqlType),
    /// A foreign key to the named node type
    Reference(String),
}

/// Whether a stream must be present when a frame is persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Presence {
    Optional,
    Required,
    /// Required, and the backing column defaults to this value
    Default(Value),
}

/// A declared field of a node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub name: String,
    pub kind: StreamKind,
    pub presence: Presence,
    /// Name of the invalidation handler run when this stream is invalidated remotely
    pub handler: Option<String>,
}

impl Stream {
    pub fn scalar(name: &str, sql_type: SqlType) -> Self {
        Self {
            name: name.to_string(),
            kind: StreamKind::Scalar(sql_type),
            presence: Presence::Optional,
            handler: None,
        }
    }

    pub fn text(name: &str) -> Self {
        Self::scalar(name, SqlType::Text)
    }

    pub fn integer(name: &str) -> Self {
        Self::scalar(name, SqlType::Integer)
    }

    pub fn real(name: &str) -> Self {
        Self::scalar(name, SqlType::Real)
    }

    pub fn boolean(name: &str) -> Self {
        Self::scalar(name, SqlType::Boolean)
    }

    /// A foreign-key stream referencing `node_type`
    pub fn reference(name: &str, node_type: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: StreamKind::Reference(node_type.to_string()),
            presence: Presence::Optional,
            handler: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.presence = Presence::Required;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.presence = Presence::Default(value.into());
        self
    }

    pub fn on_invalidate(mut self, handler: &str) -> Self {
        self.handler = Some(handler.to_string());
        self
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, StreamKind::Reference(_))
    }

    /// Referenced node type, for foreign-key streams
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            StreamKind::Reference(target) => Some(target),
            StreamKind::Scalar(_) => None,
        }
    }

    /// A reference stream is required when marked so; a scalar stream is
    /// required when it carries a default or is marked so.
    pub fn is_required(&self) -> bool {
        match (&self.kind, &self.presence) {
            (_, Presence::Optional) => false,
            (StreamKind::Reference(_), Presence::Required) => true,
            (StreamKind::Reference(_), Presence::Default(_)) => true,
            (StreamKind::Scalar(_), _) => true,
        }
    }

    pub fn default_value(&self) -> Option<&Value> {
        match &self.presence {
            Presence::Default(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requiredness_follows_presence() {
        assert!(!Stream::text("name").is_required());
        assert!(Stream::text("name").with_default("x").is_required());
        assert!(Stream::reference("owner", "Owner").required().is_required());
        assert!(!Stream::reference("owner", "Owner").is_required());
    }

    #[test]
    fn booleans_are_coerced_from_integers() {
        assert_eq!(SqlType::Boolean.coerce(Value::Integer(1)), Value::Boolean(true));
        assert_eq!(SqlType::Text.coerce(Value::Integer(1)), Value::Integer(1));
    }
}
