//! Proxy nodes: local stand-ins for nodes hosted by another router.

use super::cache::Cached;
use super::{Attribute, Mode, Node, NodeState, Origin};
use crate::context::{Context, Outbound};
use crate::error::{NodeError, NodeResult};
use crate::rpc::address::NodeUrl;
use crate::rpc::client;
use crate::rpc::message::{Action, Args, WireValue};
use crate::store::Value;
use log::{debug, warn};

impl Node {
    /// Proxy of the node at `url`. The remote node learns about the proxy
    /// and keeps it informed of every change; writes through the proxy
    /// are rejected.
    pub async fn proxy(ctx: &Context, url: &str) -> NodeResult<Node> {
        let target: NodeUrl = url.parse()?;
        let id = ctx.allocate_id();
        let me = ctx.url_of(id).to_string();
        let payload = client::call(
            ctx,
            url,
            Action::RegisterProxy,
            Args {
                url: Some(me.clone()),
                ..Default::default()
            },
        )
        .await?;
        let type_name = match payload {
            Some(WireValue::Scalar(Value::Text(name))) => name,
            other => {
                return Err(NodeError::Codec(format!(
                    "register_proxy to {} answered {:?}",
                    url, other
                )))
            }
        };
        let schema = match ctx.registry().get(&type_name) {
            Ok(schema) => schema,
            Err(e) => {
                warn!("{} hosts unknown type {}; releasing the link", url, type_name);
                ctx.defer(Outbound {
                    sender: None,
                    target: url.to_string(),
                    action: Action::Deregister,
                    args: Args {
                        url: Some(me),
                        ..Default::default()
                    },
                });
                return Err(e);
            }
        };
        let node = ctx.adopt_as(
            id,
            NodeState::new(schema, Mode::Unique, Origin::Remote(target), Vec::new()),
        );
        node.remember_upstream(url);
        debug!("{} proxies {} ({})", me, url, type_name);
        Ok(node)
    }

    /// URL of the node a proxy stands in for
    pub fn remote_url(&self) -> Option<NodeUrl> {
        match &self.state.borrow().origin {
            Origin::Remote(url) => Some(url.clone()),
            _ => None,
        }
    }

    pub(crate) async fn fetch_remote(&self, name: &str) -> NodeResult<Attribute> {
        let remote = {
            let state = self.state.borrow();
            match state.cache.get(name) {
                Some(Cached::Value(v)) => return Ok(Attribute::Value(v.clone())),
                Some(Cached::Node(n)) => return Ok(Attribute::Node(n.clone())),
                Some(Cached::Absent) => return Ok(Attribute::Missing),
                None => {}
            }
            match &state.origin {
                Origin::Remote(url) => url.to_string(),
                _ => return Err(NodeError::Usage("not a proxy".into())),
            }
        };
        let result = client::call(
            &self.ctx,
            &remote,
            Action::Getstream,
            Args {
                stream: Some(name.to_string()),
                url: Some(self.url().to_string()),
                ..Default::default()
            },
        )
        .await;
        let payload = match result {
            Err(NodeError::Dead(reason)) => {
                self.lose_remote(&remote);
                return Err(NodeError::Dead(reason));
            }
            other => other?,
        };
        let (attribute, cached) = match payload {
            Some(WireValue::Scalar(value)) => (Attribute::Value(value.clone()), Cached::Value(value)),
            Some(WireValue::Node(url)) => {
                let child = Node::proxy(&self.ctx, &url).await?;
                self.depend_on(&child, name)?;
                (Attribute::Node(child.clone()), Cached::Node(child))
            }
            Some(WireValue::Missing) | None => (Attribute::Missing, Cached::Absent),
        };
        let replaced = self.state.borrow_mut().cache.insert(name, cached);
        drop(replaced);
        Ok(attribute)
    }

    /// The remote node is gone: forget everything learned from it.
    fn lose_remote(&self, url: &str) {
        let evicted = {
            let mut state = self.state.borrow_mut();
            state.rpc.upstream.retain(|u| u != url);
            state.cache.clear()
        };
        drop(evicted);
        debug!("{} lost its remote {}", self.url(), url);
    }
}
