use crate::error::{NodeError, NodeResult};
use std::fmt;
use std::str::FromStr;

/// Process-unique short identifier of a node instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// RPC address of a node: `tcp://<endpoint>/<node id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeUrl {
    pub endpoint: String,
    pub node: NodeId,
}

impl NodeUrl {
    pub fn new(endpoint: &str, node: NodeId) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            node,
        }
    }
}

impl fmt::Display for NodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}/{}", self.endpoint, self.node)
    }
}

impl FromStr for NodeUrl {
    type Err = NodeError;

    fn from_str(s: &str) -> NodeResult<Self> {
        let rest = s
            .strip_prefix("tcp://")
            .ok_or_else(|| NodeError::Usage(format!("'{}' is not a node url", s)))?;
        let (endpoint, node) = rest
            .rsplit_once('/')
            .ok_or_else(|| NodeError::Usage(format!("'{}' has no node id", s)))?;
        let node = node
            .parse::<u64>()
            .map_err(|_| NodeError::Usage(format!("'{}' has a malformed node id", s)))?;
        if endpoint.is_empty() {
            return Err(NodeError::Usage(format!("'{}' has no endpoint", s)));
        }
        Ok(NodeUrl::new(endpoint, NodeId(node)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_what_it_prints() {
        let url = NodeUrl::new("127.0.0.1:4100", NodeId(7));
        assert_eq!(url.to_string(), "tcp://127.0.0.1:4100/7");
        assert_eq!("tcp://127.0.0.1:4100/7".parse::<NodeUrl>().unwrap(), url);
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!("http://x/1".parse::<NodeUrl>().is_err());
        assert!("tcp://x/abc".parse::<NodeUrl>().is_err());
        assert!("tcp:///1".parse::<NodeUrl>().is_err());
    }
}
