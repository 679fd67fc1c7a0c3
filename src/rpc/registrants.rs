//! Interest bookkeeping.
//!
//! Every node keeps the set of nodes that depend on it: a registrant is the
//! dependent node's URL plus the attribute through which it reached this
//! node, or a proxy link. The set is mirrored into the `rpc_registration`
//! table so other tooling can see who listens to whom.

use crate::context::{Context, Outbound};
use crate::error::NodeResult;
use crate::node::Node;
use crate::rpc::address::NodeId;
use crate::rpc::message::{Action, Args};
use crate::schema::migrator::REGISTRATION_TABLE;
use crate::store::{Database, Value};
use log::{debug, warn};

/// How a registrant depends on a node
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    /// Through one of the registrant's attributes
    Attribute(String),
    /// As a proxy mirroring every stream
    Proxy,
}

impl Role {
    fn column_value(&self) -> String {
        match self {
            Role::Attribute(name) => format!("attr:{}", name),
            Role::Proxy => "proxy".to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Registrants {
    entries: Vec<(String, Role)>,
}

impl Registrants {
    /// Returns false if the entry was already present
    pub fn add(&mut self, url: &str, role: Role) -> bool {
        if self.entries.iter().any(|(u, r)| u == url && *r == role) {
            return false;
        }
        self.entries.push((url.to_string(), role));
        true
    }

    /// Drop every entry of `url`
    pub fn remove(&mut self, url: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(u, _)| u != url);
        before - self.entries.len()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.iter().any(|(u, _)| u == url)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Role)> {
        self.entries.iter()
    }

    /// (registrant url, attribute to clear there) for a change of `changed`.
    /// Proxies mirror stream names, so they receive one entry per stream.
    pub fn targets(&self, changed: &[String]) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (url, role) in &self.entries {
            match role {
                Role::Attribute(name) => out.push((url.clone(), name.clone())),
                Role::Proxy => out.extend(changed.iter().map(|s| (url.clone(), s.clone()))),
            }
        }
        out
    }
}

pub(crate) fn persist(db: &Database, registrant: &str, owner_class: &str, owner: &str, role: &Role) -> NodeResult<()> {
    let sql = format!(
        "INSERT OR IGNORE INTO {} (\"service\", \"owner_class\", \"owner_id\", \"role\") VALUES (?1, ?2, ?3, ?4)",
        db.qualified(REGISTRATION_TABLE)
    );
    db.execute(
        &sql,
        &[
            Value::from(registrant),
            Value::from(owner_class),
            Value::from(owner),
            Value::from(role.column_value()),
        ],
    )?;
    Ok(())
}

pub(crate) fn unpersist(db: &Database, registrant: &str, owner: &str) -> NodeResult<()> {
    let sql = format!(
        "DELETE FROM {} WHERE \"service\" = ?1 AND \"owner_id\" = ?2",
        db.qualified(REGISTRATION_TABLE)
    );
    db.execute(&sql, &[Value::from(registrant), Value::from(owner)])?;
    Ok(())
}

pub(crate) fn unpersist_owner(db: &Database, owner: &str) -> NodeResult<()> {
    let sql = format!(
        "DELETE FROM {} WHERE \"owner_id\" = ?1",
        db.qualified(REGISTRATION_TABLE)
    );
    db.execute(&sql, &[Value::from(owner)])?;
    Ok(())
}

/// Persisted (registrant, role) rows of a node
pub fn persisted(db: &Database, owner: &str) -> NodeResult<Vec<(String, String)>> {
    let sql = format!(
        "SELECT \"service\", \"role\" FROM {} WHERE \"owner_id\" = ?1 ORDER BY \"_rpc_registration_id\"",
        db.qualified(REGISTRATION_TABLE)
    );
    Ok(db
        .query(&sql, &[Value::from(owner)])?
        .into_iter()
        .filter_map(|row| {
            let service = row.get("service")?.as_str()?.to_string();
            let role = row.get("role")?.as_str()?.to_string();
            Some((service, role))
        })
        .collect())
}

/// Remove a dead registrant from a local node, if it is still alive.
pub(crate) fn drop_registrant(ctx: &Context, owner: NodeId, registrant: &str) {
    if let Some(node) = ctx.handle(owner) {
        if let Err(e) = node.remove_registrant(registrant) {
            warn!("could not drop registrant {}: {}", registrant, e);
        }
    }
}

impl Node {
    /// Record that `registrant` depends on this node. A node never
    /// registers with itself.
    pub(crate) fn add_registrant(&self, registrant: &str, role: Role) -> NodeResult<()> {
        let me = self.url().to_string();
        if registrant == me {
            return Ok(());
        }
        let added = self
            .state
            .borrow_mut()
            .rpc
            .registrants
            .add(registrant, role.clone());
        if added {
            persist(self.ctx.db(), registrant, &self.type_name(), &me, &role)?;
            debug!("{} registered with {} as {:?}", registrant, me, role);
        }
        Ok(())
    }

    pub(crate) fn remove_registrant(&self, registrant: &str) -> NodeResult<usize> {
        let removed = self.state.borrow_mut().rpc.registrants.remove(registrant);
        if removed > 0 {
            unpersist(self.ctx.db(), registrant, &self.url().to_string())?;
            debug!("{} deregistered from {}", registrant, self.url());
        }
        Ok(removed)
    }

    pub fn registrant_count(&self) -> usize {
        self.state.borrow().rpc.registrants.len()
    }

    pub fn has_registrant(&self, url: &str) -> bool {
        self.state.borrow().rpc.registrants.contains(url)
    }

    /// Register this node's interest in `target`, reached via `attribute`.
    pub(crate) fn depend_on(&self, target: &Node, attribute: &str) -> NodeResult<()> {
        if target.same_instance(self) {
            return Ok(());
        }
        target.add_registrant(&self.url().to_string(), Role::Attribute(attribute.to_string()))?;
        self.remember_upstream(&target.url().to_string());
        Ok(())
    }

    pub(crate) fn remember_upstream(&self, url: &str) {
        let mut state = self.state.borrow_mut();
        if !state.rpc.upstream.iter().any(|u| u == url) {
            state.rpc.upstream.push(url.to_string());
        }
    }

    /// Tell every registrant that `changed` streams of this node changed.
    /// `trail` lists URLs the change already passed through.
    pub(crate) async fn notify_registrants(&self, changed: &[String], mut trail: Vec<String>) -> NodeResult<()> {
        let me = self.url().to_string();
        if !trail.contains(&me) {
            trail.push(me.clone());
        }
        let targets = self.state.borrow().rpc.registrants.targets(changed);
        let outbound: Vec<Outbound> = targets
            .into_iter()
            .filter(|(url, _)| !trail.contains(url))
            .map(|(target, attribute)| Outbound {
                sender: Some(self.node_id()),
                target,
                action: Action::Invalidate,
                args: Args {
                    stream: Some(attribute),
                    url: Some(me.clone()),
                    origin: changed.to_vec(),
                    trail: trail.clone(),
                },
            })
            .collect();
        self.ctx.send(outbound).await
    }

    /// Handle an inbound invalidation of `attribute`: clear it, run its
    /// handler, then pass the change on to this node's own registrants.
    pub(crate) async fn invalidated(&self, attribute: &str, origin: &[String], trail: Vec<String>) -> NodeResult<()> {
        let (evicted, handler) = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let evicted = state.cache.invalidate(attribute, &state.schema);
            let handler = state
                .schema
                .stream(attribute)
                .and_then(|s| s.handler.as_deref())
                .and_then(|h| state.schema.handler(h))
                .cloned();
            (evicted, handler)
        };
        drop(evicted);
        debug!("{} invalidated '{}' (origin {:?})", self.url(), attribute, origin);
        if let Some(handler) = handler {
            handler(self, attribute);
        }
        self.notify_registrants(&[attribute.to_string()], trail).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxies_receive_every_changed_stream() {
        let mut set = Registrants::default();
        assert!(set.add("tcp://a/1", Role::Attribute("owner".into())));
        assert!(!set.add("tcp://a/1", Role::Attribute("owner".into())));
        set.add("tcp://b/2", Role::Proxy);
        let targets = set.targets(&["name".into(), "colour".into()]);
        assert_eq!(
            targets,
            vec![
                ("tcp://a/1".to_string(), "owner".to_string()),
                ("tcp://b/2".to_string(), "name".to_string()),
                ("tcp://b/2".to_string(), "colour".to_string()),
            ]
        );
        assert_eq!(set.remove("tcp://b/2"), 1);
        assert_eq!(set.len(), 1);
    }
}
