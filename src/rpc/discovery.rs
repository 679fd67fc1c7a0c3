//! Discoverability and listeners.
//!
//! A discoverable node advertises its URL in `rpc_discoverable` under its
//! semantic identity so that other processes can find it with
//! [`Node::discover`]. At most one live advertisement exists per identity;
//! stale rows (heartbeat older than the discovery timeout) are evicted when
//! a new node takes over.
//!
//! While advertised, a heartbeat task refreshes the row. If the row vanishes
//! or its environment id changes, the process's fatal handler runs. With a
//! discovery timeout configured, a second task withdraws the advertisement
//! once the timeout passes without any registrant.
//!
//! Listener rows (`listen = 1`) share the table and receive
//! `update_broadcast` when a node with the same semantic identity re-reads
//! with `broadcast` set.

use crate::context::{Context, Outbound, WeakContext};
use crate::error::{NodeError, NodeResult};
use crate::node::identity::semantic_hash;
use crate::node::Node;
use crate::rpc::address::NodeId;
use crate::rpc::message::{Action, Args};
use crate::schema::migrator::DISCOVERABLE_TABLE;
use crate::store::{Database, SearchKey, StoreProxy, Value};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Running advertisement of one node
#[derive(Debug)]
pub(crate) struct Discoverable {
    row_id: i64,
    heartbeat: JoinHandle<()>,
    timeout: Option<JoinHandle<()>>,
}

impl Discoverable {
    fn cancel(&self) {
        self.heartbeat.abort();
        if let Some(timeout) = &self.timeout {
            timeout.abort();
        }
    }
}

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn is_stale(heartbeat: f64, timeout: Option<Duration>) -> bool {
    timeout.map_or(false, |t| now_seconds() - heartbeat > t.as_secs_f64())
}

fn delete_row(db: &Database, row_id: i64) -> NodeResult<usize> {
    let sql = format!(
        "DELETE FROM {} WHERE \"_rpc_discoverable_id\" = ?1",
        db.qualified(DISCOVERABLE_TABLE)
    );
    db.execute(&sql, &[Value::Integer(row_id)])
}

fn insert_row(db: &Database, semantic: &str, url: &str, node_type: &str, envid: &str, listen: bool) -> NodeResult<i64> {
    let sql = format!(
        "INSERT INTO {} (\"infname_semantic\", \"stripe\", \"url\", \"type\", \"envid\", \"heartbeat\", \"listen\") \
         VALUES (?1, 0, ?2, ?3, ?4, ?5, ?6) RETURNING \"_rpc_discoverable_id\"",
        db.qualified(DISCOVERABLE_TABLE)
    );
    db.insert_returning(
        &sql,
        &[
            Value::from(semantic),
            Value::from(url),
            Value::from(node_type),
            Value::from(envid),
            Value::Real(now_seconds()),
            Value::Boolean(listen),
        ],
    )
}

/// Cancel an advertisement and remove its row; used on teardown.
pub(crate) fn withdraw(ctx: &Context, discoverable: Discoverable) {
    discoverable.cancel();
    if let Err(e) = delete_row(ctx.db(), discoverable.row_id) {
        warn!("could not withdraw discoverable row {}: {}", discoverable.row_id, e);
    }
}

/// Remove a listener row; used on teardown.
pub(crate) fn forget_row(ctx: &Context, row_id: i64) {
    if let Err(e) = delete_row(ctx.db(), row_id) {
        warn!("could not remove listener row {}: {}", row_id, e);
    }
}

/// URL of the live discoverable node for a semantic identity
pub fn lookup(ctx: &Context, semantic: &str) -> NodeResult<Option<String>> {
    let db = ctx.db();
    let sql = format!(
        "SELECT \"url\", \"heartbeat\" FROM {} WHERE \"infname_semantic\" = ?1 AND \"listen\" = 0",
        db.qualified(DISCOVERABLE_TABLE)
    );
    let timeout = ctx.config().discovery_timeout();
    Ok(db
        .query(&sql, &[Value::from(semantic)])?
        .into_iter()
        .filter(|row| {
            let heartbeat = row.get("heartbeat").and_then(Value::as_f64).unwrap_or(0.0);
            !is_stale(heartbeat, timeout)
        })
        .find_map(|row| row.get("url").and_then(Value::as_str).map(str::to_string)))
}

/// Refresh one heartbeat; `Err` carries the reason the process must stop.
fn beat(ctx: &Context, row_id: i64, envid: &str) -> Result<(), String> {
    let db = ctx.db();
    let table = db.qualified(DISCOVERABLE_TABLE);
    let update = format!(
        "UPDATE {} SET \"heartbeat\" = ?1 WHERE \"_rpc_discoverable_id\" = ?2",
        table
    );
    let select = format!(
        "SELECT \"envid\" FROM {} WHERE \"_rpc_discoverable_id\" = ?1",
        table
    );
    let outcome = db.execute(&update, &[Value::Real(now_seconds()), Value::Integer(row_id)]).and_then(|n| {
        let rows = db.query(&select, &[Value::Integer(row_id)])?;
        Ok((n, rows))
    });
    match outcome {
        Ok((0, _)) => Err(format!("discoverable row {} vanished", row_id)),
        Ok((_, rows)) => match rows.first().and_then(|r| r.get("envid")).and_then(Value::as_str) {
            Some(found) if found == envid => Ok(()),
            Some(found) => Err(format!(
                "discoverable row {} now belongs to environment {}",
                row_id, found
            )),
            None => Err(format!("discoverable row {} vanished", row_id)),
        },
        Err(e) => {
            warn!("heartbeat of row {} failed: {}", row_id, e);
            Ok(())
        }
    }
}

async fn heartbeat_loop(ctx: WeakContext, row_id: i64, envid: String, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let ctx = match Context::upgrade(&ctx) {
            Some(ctx) => ctx,
            None => break,
        };
        if let Err(reason) = beat(&ctx, row_id, &envid) {
            ctx.fatal(&reason);
            break;
        }
    }
}

async fn withdraw_when_idle(ctx: WeakContext, node: NodeId, after: Duration) {
    tokio::time::sleep(after).await;
    let Some(ctx) = Context::upgrade(&ctx) else {
        return;
    };
    let Some(node) = ctx.handle(node) else {
        return;
    };
    if node.registrant_count() > 0 {
        return;
    }
    match node.set_discoverable(false) {
        Ok(()) => info!("{} had no registrants after {:?}; no longer discoverable", node.url(), after),
        Err(e) => warn!("could not withdraw {}: {}", node.url(), e),
    }
}

impl Node {
    pub fn is_discoverable(&self) -> bool {
        self.state.borrow().rpc.discoverable.is_some()
    }

    /// Enter or leave the discoverable state.
    ///
    /// Entering fails with `DuplicateDiscoverable` while another live node
    /// advertises the same semantic identity. Needs a `LocalSet`.
    pub fn set_discoverable(&self, on: bool) -> NodeResult<()> {
        if on == self.is_discoverable() {
            return Ok(());
        }
        if !on {
            let discoverable = self.state.borrow_mut().rpc.discoverable.take();
            if let Some(discoverable) = discoverable {
                withdraw(&self.ctx, discoverable);
                debug!("{} left discovery", self.url());
            }
            return Ok(());
        }

        let semantic = self.infname_semantic()?;
        let url = self.url().to_string();
        let node_type = self.type_name();
        let config = self.ctx.config();
        let timeout = config.discovery_timeout();
        let envid = self.ctx.environment_id().to_string();

        let row_id = self.ctx.transaction(|db| {
            let sql = format!(
                "SELECT \"_rpc_discoverable_id\", \"url\", \"heartbeat\" FROM {} \
                 WHERE \"infname_semantic\" = ?1 AND \"listen\" = 0",
                db.qualified(DISCOVERABLE_TABLE)
            );
            for row in db.query(&sql, &[Value::from(semantic.as_str())])? {
                let heartbeat = row.get("heartbeat").and_then(Value::as_f64).unwrap_or(0.0);
                let existing = row.get("_rpc_discoverable_id").and_then(Value::as_i64).unwrap_or_default();
                let holder = row.get("url").and_then(Value::as_str).unwrap_or_default().to_string();
                if is_stale(heartbeat, timeout) {
                    delete_row(db, existing)?;
                    info!("evicted stale discoverable {} for {}", holder, node_type);
                } else {
                    return Err(NodeError::DuplicateDiscoverable(format!(
                        "{} is already discoverable at {}",
                        node_type, holder
                    )));
                }
            }
            insert_row(db, &semantic, &url, &node_type, &envid, false)
        })?;

        let heartbeat = tokio::task::spawn_local(heartbeat_loop(
            self.ctx.downgrade(),
            row_id,
            envid,
            config.heartbeat_interval(),
        ));
        let timeout = timeout.map(|after| {
            tokio::task::spawn_local(withdraw_when_idle(self.ctx.downgrade(), self.id, after))
        });
        self.state.borrow_mut().rpc.discoverable = Some(Discoverable {
            row_id,
            heartbeat,
            timeout,
        });
        info!("{} is discoverable as {}", url, node_type);
        Ok(())
    }

    /// Ask to be told when a node with this node's semantic identity
    /// re-reads with `broadcast`.
    pub fn listen(&self) -> NodeResult<()> {
        if self.state.borrow().rpc.listening.is_some() {
            return Ok(());
        }
        let semantic = self.infname_semantic()?;
        let url = self.url().to_string();
        let row_id = insert_row(
            self.ctx.db(),
            &semantic,
            &url,
            &self.type_name(),
            self.ctx.environment_id(),
            true,
        )?;
        self.state.borrow_mut().rpc.listening = Some(row_id);
        debug!("{} listens for broadcasts", url);
        Ok(())
    }

    pub fn unlisten(&self) -> NodeResult<()> {
        let row = self.state.borrow_mut().rpc.listening.take();
        if let Some(row) = row {
            delete_row(self.ctx.db(), row)?;
        }
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.state.borrow().rpc.listening.is_some()
    }

    /// Send `update_broadcast` to every listener of this search.
    pub(crate) async fn broadcast(&self) -> NodeResult<()> {
        let semantic = self.infname_semantic()?;
        let me = self.url().to_string();
        let db = self.ctx.db();
        let sql = format!(
            "SELECT \"url\" FROM {} WHERE \"infname_semantic\" = ?1 AND \"listen\" = 1",
            db.qualified(DISCOVERABLE_TABLE)
        );
        let outbound: Vec<Outbound> = db
            .query(&sql, &[Value::from(semantic.as_str())])?
            .into_iter()
            .filter_map(|row| row.get("url").and_then(Value::as_str).map(str::to_string))
            .filter(|url| *url != me)
            .map(|target| Outbound {
                sender: None,
                target,
                action: Action::UpdateBroadcast,
                args: Args {
                    url: Some(me.clone()),
                    trail: vec![me.clone()],
                    ..Default::default()
                },
            })
            .collect();
        debug!("{} broadcasts to {} listener(s)", me, outbound.len());
        self.ctx.send(outbound).await
    }

    /// Handle `update_broadcast`: re-read and tell registrants.
    pub(crate) async fn on_broadcast(&self, trail: Vec<String>) -> NodeResult<()> {
        self.reset()?;
        let streams: Vec<String> = self.schema().streams().iter().map(|s| s.name.clone()).collect();
        self.notify_registrants(&streams, trail).await
    }

    /// Proxy of the live discoverable node searched as `index` / `key`.
    pub async fn discover(
        ctx: &Context,
        type_name: &str,
        index: &str,
        key: impl Into<SearchKey>,
    ) -> NodeResult<Node> {
        let registry = ctx.registry();
        let proxy = StoreProxy::new(
            registry.get(type_name)?,
            registry.statements(type_name)?,
            index,
            key.into(),
        )?;
        let semantic = semantic_hash(registry.context(), type_name, index, &proxy.params);
        let url = lookup(ctx, &semantic)?.ok_or_else(|| {
            NodeError::Retrieval(format!("no live discoverable {} {} {:?}", type_name, index, proxy.params))
        })?;
        Node::proxy(ctx, &url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_needs_a_timeout() {
        let old = now_seconds() - 60.0;
        assert!(!is_stale(old, None));
        assert!(is_stale(old, Some(Duration::from_secs(10))));
        assert!(!is_stale(now_seconds(), Some(Duration::from_secs(10))));
    }
}
