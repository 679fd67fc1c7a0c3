//! Outbound side of the node RPC protocol.

use crate::context::Context;
use crate::error::{NodeError, NodeResult};
use crate::rpc::address::NodeUrl;
use crate::rpc::message::{self, Action, Args, Reply, Request, WireValue};
use crate::rpc::router;
use log::trace;
use tokio::net::TcpStream;

/// Send `action` to the node at `target` and wait for its reply.
///
/// Targets on this process's own endpoint are dispatched in process. A
/// `DEAD` reply surfaces as [`NodeError::Dead`], a `FAIL` reply as
/// [`NodeError::Remote`].
pub(crate) async fn call(ctx: &Context, target: &str, action: Action, args: Args) -> NodeResult<Option<WireValue>> {
    let url: NodeUrl = target.parse()?;
    let request = Request::new(action, url.node.0, ctx.environment_id(), args);
    trace!("{:?} -> {}", action, target);
    let reply = if ctx.is_own_endpoint(&url.endpoint) {
        router::dispatch(ctx.clone(), request).await
    } else {
        let conv_id = request.conv_id.clone();
        let timeout = ctx.config().request_timeout();
        let reply = tokio::time::timeout(timeout, exchange(&url.endpoint, &request))
            .await
            .map_err(|_| NodeError::Remote(format!("{:?} to {} timed out after {:?}", action, target, timeout)))??;
        if reply.conv_id != conv_id {
            return Err(NodeError::Codec(format!(
                "reply from {} answers conversation {} instead of {}",
                target, reply.conv_id, conv_id
            )));
        }
        reply
    };
    reply.into_result()
}

async fn exchange(endpoint: &str, request: &Request) -> NodeResult<Reply> {
    let mut stream = match TcpStream::connect(endpoint).await {
        Ok(stream) => stream,
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            return Err(NodeError::Dead(format!("{} refused the connection", endpoint)))
        }
        Err(e) => return Err(e.into()),
    };
    message::write_frame(&mut stream, &message::encode(request)?).await?;
    match message::read_frame(&mut stream).await? {
        Some(frame) => message::decode(&frame),
        None => Err(NodeError::Dead(format!("{} closed the connection", endpoint))),
    }
}
