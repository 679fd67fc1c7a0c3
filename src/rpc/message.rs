//! Wire format of the node RPC protocol.
//!
//! Messages are MessagePack maps framed by a 4-byte big-endian length
//! prefix. A request names the action, the target node id, the caller's
//! auth token and a conversation id echoed back in the reply.

use crate::error::{NodeError, NodeResult};
use crate::store::Value;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Read one attribute of the target
    Getstream,
    /// Record the caller's interest in one attribute of the target
    Register,
    /// Record a proxy of the target
    RegisterProxy,
    /// Forget every interest of the caller
    Deregister,
    /// An attribute the caller depends on changed
    Invalidate,
    /// A search the caller listens to was re-read elsewhere
    UpdateBroadcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    /// Target is not routable any more
    Dead,
    Fail,
}

/// Action arguments; which fields are set depends on the action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    /// Attribute name on the receiving side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    /// URL of the calling node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Streams that changed at the origin of an invalidation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub origin: Vec<String>,
    /// URLs an invalidation already passed through; never forwarded to again
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trail: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub action: Action,
    pub to: u64,
    pub authtoken: String,
    pub conv_id: String,
    #[serde(default)]
    pub args: Args,
}

/// Attribute value as it crosses the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WireValue {
    Scalar(Value),
    /// URL of a node; the receiver builds a proxy for it
    Node(String),
    /// Unset reference
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: Status,
    pub conv_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: Option<WireValue>,
}

impl Request {
    pub fn new(action: Action, to: u64, authtoken: &str, args: Args) -> Self {
        Self {
            action,
            to,
            authtoken: authtoken.to_string(),
            conv_id: uuid::Uuid::new_v4().to_string(),
            args,
        }
    }
}

impl Reply {
    pub fn ok(conv_id: &str, payload: Option<WireValue>) -> Self {
        Self {
            status: Status::Ok,
            conv_id: conv_id.to_string(),
            message: String::new(),
            payload,
        }
    }

    pub fn dead(conv_id: &str, message: impl Into<String>) -> Self {
        Self {
            status: Status::Dead,
            conv_id: conv_id.to_string(),
            message: message.into(),
            payload: None,
        }
    }

    pub fn fail(conv_id: &str, message: impl Into<String>) -> Self {
        Self {
            status: Status::Fail,
            conv_id: conv_id.to_string(),
            message: message.into(),
            payload: None,
        }
    }

    /// Turn a non-OK status into the matching error.
    pub fn into_result(self) -> NodeResult<Option<WireValue>> {
        match self.status {
            Status::Ok => Ok(self.payload),
            Status::Dead => Err(NodeError::Dead(self.message)),
            Status::Fail => Err(NodeError::Remote(self.message)),
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> NodeResult<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(message)?)
}

pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> NodeResult<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> NodeResult<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(NodeError::Codec(format!("frame of {} bytes is too large", payload.len())));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame; `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> NodeResult<Option<Vec<u8>>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NodeError::Codec(format!("peer announced a {} byte frame", len)));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_names_match_protocol() {
        let names: Vec<String> = [
            Action::Getstream,
            Action::Register,
            Action::RegisterProxy,
            Action::Deregister,
            Action::Invalidate,
            Action::UpdateBroadcast,
        ]
        .iter()
        .map(|a| serde_json::to_value(a).unwrap().as_str().unwrap().to_string())
        .collect();
        assert_eq!(
            names,
            ["getstream", "register", "register_proxy", "deregister", "invalidate", "update_broadcast"]
        );
        assert_eq!(serde_json::to_value(Status::Dead).unwrap(), "DEAD");
    }

    #[test]
    fn non_ok_replies_become_errors() {
        assert!(matches!(Reply::dead("c", "gone").into_result(), Err(NodeError::Dead(_))));
        assert!(matches!(Reply::fail("c", "boom").into_result(), Err(NodeError::Remote(m)) if m == "boom"));
    }

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let request = Request::new(
            Action::Invalidate,
            3,
            "env",
            Args {
                stream: Some("owner".into()),
                origin: vec!["name".into()],
                ..Default::default()
            },
        );
        write_frame(&mut a, &encode(&request).unwrap()).await.unwrap();
        drop(a);
        let bytes = read_frame(&mut b).await.unwrap().unwrap();
        let decoded: Request = decode(&bytes).unwrap();
        assert_eq!(decoded, request);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }
}
