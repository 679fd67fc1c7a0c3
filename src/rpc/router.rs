//! Inbound side of the node RPC protocol.
//!
//! The router accepts TCP connections on the context's endpoint, reads
//! framed requests, resolves the target node in the routing table and
//! replies. Requests addressed to this process's own endpoint never touch
//! the network: the client hands them straight to [`dispatch`].

use crate::context::{Context, WeakContext};
use crate::error::NodeError;
use crate::node::Node;
use crate::rpc::address::NodeId;
use crate::rpc::message::{self, Action, Reply, Request, WireValue};
use crate::rpc::registrants::Role;
use crate::store::Value;
use futures::future::{FutureExt, LocalBoxFuture};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};

/// Accept loop; stops once the context is gone.
pub(crate) async fn serve(ctx: WeakContext, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("router accept failed: {}", e);
                continue;
            }
        };
        if Context::upgrade(&ctx).is_none() {
            break;
        }
        debug!("router accepted {}", peer);
        tokio::task::spawn_local(connection(ctx.clone(), stream));
    }
}

async fn connection(ctx: WeakContext, mut stream: TcpStream) {
    loop {
        let frame = match message::read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!("dropping connection: {}", e);
                break;
            }
        };
        let reply = match message::decode::<Request>(&frame) {
            Ok(request) => match Context::upgrade(&ctx) {
                Some(ctx) => dispatch(ctx, request).await,
                None => Reply::dead(&request.conv_id, "context is shut down"),
            },
            Err(e) => Reply::fail("", format!("malformed request: {}", e)),
        };
        let written = match message::encode(&reply) {
            Ok(bytes) => message::write_frame(&mut stream, &bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!("could not answer peer: {}", e);
            break;
        }
    }
}

/// Route one request to its target node and build the reply.
pub(crate) fn dispatch(ctx: Context, request: Request) -> LocalBoxFuture<'static, Reply> {
    async move {
        let conv_id = request.conv_id.clone();
        let policy = ctx.config().rpc.access;
        if !policy.permits(&request.authtoken, ctx.environment_id()) {
            let denied = NodeError::AccessDenied(format!("{:?} on node {}", request.action, request.to));
            info!("{}", denied);
            return Reply::fail(&conv_id, denied.to_string());
        }
        let node = match ctx.handle(NodeId(request.to)) {
            Some(node) => node,
            None => return Reply::dead(&conv_id, format!("no node {} at {}", request.to, ctx.endpoint())),
        };
        match handle(&node, request).await {
            Ok(payload) => Reply::ok(&conv_id, payload),
            Err(NodeError::Dead(reason)) => Reply::dead(&conv_id, reason),
            Err(e) => Reply::fail(&conv_id, e.to_string()),
        }
    }
    .boxed_local()
}

fn required<'a>(value: &'a Option<String>, what: &str, action: Action) -> Result<&'a str, NodeError> {
    value
        .as_deref()
        .ok_or_else(|| NodeError::Usage(format!("{:?} needs a {}", action, what)))
}

async fn handle(node: &Node, request: Request) -> Result<Option<WireValue>, NodeError> {
    let args = request.args;
    match request.action {
        Action::Getstream => {
            let stream = required(&args.stream, "stream", request.action)?;
            Ok(Some(node.serve_attribute(stream)?))
        }
        Action::Register => {
            let url = required(&args.url, "url", request.action)?;
            let stream = required(&args.stream, "stream", request.action)?;
            node.add_registrant(url, Role::Attribute(stream.to_string()))?;
            Ok(None)
        }
        Action::RegisterProxy => {
            let url = required(&args.url, "url", request.action)?;
            node.add_registrant(url, Role::Proxy)?;
            Ok(Some(WireValue::Scalar(Value::Text(node.type_name()))))
        }
        Action::Deregister => {
            let url = required(&args.url, "url", request.action)?;
            node.remove_registrant(url)?;
            Ok(None)
        }
        Action::Invalidate => {
            let stream = required(&args.stream, "stream", request.action)?;
            node.invalidated(stream, &args.origin, args.trail).await?;
            Ok(None)
        }
        Action::UpdateBroadcast => {
            node.on_broadcast(args.trail).await?;
            Ok(None)
        }
    }
}
