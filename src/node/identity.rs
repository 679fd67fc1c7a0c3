//! Content addresses of nodes.
//!
//! `infname` hashes a node's identity-stream values, with reference streams
//! contributing the referenced node's own `infname`. `infname_semantic`
//! hashes what a node searched for and keys discovery lookups.

use super::{Node, Origin};
use crate::context::Context;
use crate::error::{NodeError, NodeResult};
use crate::schema::NodeSchema;
use crate::store::{Frame, Value};
use serde_json::json;
use sha2::{Digest, Sha256};

/// How deep reference chains are followed before giving up
const MAX_IDENTITY_DEPTH: usize = 32;

fn digest(document: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash of a search intent
pub fn semantic_hash(context: &str, type_name: &str, index: &str, params: &[Value]) -> String {
    digest(&json!({
        "context": context,
        "type": type_name,
        "index": index,
        "params": params.iter().map(Value::canonical).collect::<Vec<_>>(),
    }))
}

fn frame_infname(ctx: &Context, schema: &NodeSchema, frame: &Frame, depth: usize) -> NodeResult<String> {
    if depth > MAX_IDENTITY_DEPTH {
        return Err(NodeError::Integrity(format!(
            "identity of {} references itself through more than {} levels",
            schema.name(),
            MAX_IDENTITY_DEPTH
        )));
    }
    let mut parts = Vec::with_capacity(schema.identity().len());
    for name in schema.identity() {
        let value = frame.get(name);
        let part = match schema.stream(name).and_then(|s| s.target()) {
            Some(target) if !value.is_null() => {
                let id = value.as_i64().ok_or_else(|| {
                    NodeError::Integrity(format!("reference '{}' holds {}", name, value))
                })?;
                let child_schema = ctx.registry().get(target)?;
                let child = Node::by_id(ctx, target, id)?;
                let child_frame = child.frame().ok_or_else(|| {
                    NodeError::Retrieval(format!("{} #{} has no row", target, id))
                })?;
                json!(frame_infname(ctx, &child_schema, &child_frame, depth + 1)?)
            }
            _ => value.canonical(),
        };
        parts.push(json!([name, part]));
    }
    Ok(digest(&json!({ "type": schema.name(), "identity": parts })))
}

impl Node {
    /// Content address of the node. Unique nodes hash their active frame;
    /// multi nodes hash the addresses of every row in the window.
    pub fn infname(&self) -> NodeResult<String> {
        let (schema, frames, unique) = {
            let state = self.state.borrow();
            if let Origin::Remote(url) = &state.origin {
                return Err(NodeError::Usage(format!("{} is a proxy; identity lives remotely", url)));
            }
            let frames: Vec<Frame> = if state.is_unique() {
                state.window.active().cloned().into_iter().collect()
            } else {
                state.window.frames().cloned().collect()
            };
            (state.schema.clone(), frames, state.is_unique())
        };
        if unique {
            let frame = frames.first().ok_or_else(|| {
                NodeError::Retrieval(format!("{} has no active row", schema.name()))
            })?;
            return frame_infname(&self.ctx, &schema, frame, 0);
        }
        let rows = frames
            .iter()
            .map(|f| frame_infname(&self.ctx, &schema, f, 0))
            .collect::<NodeResult<Vec<_>>>()?;
        Ok(digest(&json!({ "type": schema.name(), "rows": rows })))
    }

    /// Hash of (context, type, index, parameters) this node searched by.
    pub fn infname_semantic(&self) -> NodeResult<String> {
        let state = self.state.borrow();
        match &state.origin {
            Origin::Store(proxy) => Ok(semantic_hash(
                self.ctx.registry().context(),
                state.schema.name(),
                &proxy.index,
                &proxy.params,
            )),
            Origin::Memory => Err(NodeError::Usage(format!(
                "in-memory {} has no search identity",
                state.schema.name()
            ))),
            Origin::Remote(url) => Err(NodeError::Usage(format!(
                "{} is a proxy; search identity lives remotely",
                url
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semantic_hash_depends_on_every_part() {
        let base = semantic_hash("app", "Widget", "by_name", &[Value::from("a")]);
        assert_eq!(base, semantic_hash("app", "Widget", "by_name", &[Value::from("a")]));
        assert_ne!(base, semantic_hash("other", "Widget", "by_name", &[Value::from("a")]));
        assert_ne!(base, semantic_hash("app", "Widget", "by_name", &[Value::from("b")]));
        assert_ne!(base, semantic_hash("app", "Widget", "by_id", &[Value::from("a")]));
        assert_eq!(base.len(), 64);
    }
}
