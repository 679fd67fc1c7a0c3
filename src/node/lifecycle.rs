//! Writes, reads and window manipulation.

use super::{Mode, Node, Origin, Predicate};
use crate::error::{NodeError, NodeResult};
use crate::schema::BY_ID;
use crate::store::{ReadOptions, SearchKey, StoreProxy, Value};
use log::{debug, info};
use std::ops::Range;
use std::rc::Rc;

impl Node {
    fn store_proxy(&self, operation: &str) -> NodeResult<StoreProxy> {
        let state = self.state.borrow();
        match &state.origin {
            Origin::Store(proxy) => Ok(proxy.clone()),
            Origin::Memory => Err(NodeError::Usage(format!(
                "cannot {} an unpersisted {}; create it first",
                operation,
                state.schema.name()
            ))),
            Origin::Remote(url) => Err(NodeError::Integrity(format!(
                "cannot {} through a proxy of {}",
                operation, url
            ))),
        }
    }

    /// Persist the in-memory row and re-read it. With `fullhouse` every
    /// required stream must be set.
    pub fn create(&self, fullhouse: bool) -> NodeResult<()> {
        let (schema, frame) = {
            let state = self.state.borrow();
            match &state.origin {
                Origin::Memory => {}
                Origin::Store(_) => {
                    return Err(NodeError::Usage(format!(
                        "{} is already persisted",
                        state.schema.name()
                    )))
                }
                Origin::Remote(url) => {
                    return Err(NodeError::Integrity(format!("cannot create through a proxy of {}", url)))
                }
            }
            let frame = state.window.active().cloned().ok_or_else(|| {
                NodeError::Usage(format!("{} has no row to create", state.schema.name()))
            })?;
            (Rc::clone(&state.schema), frame)
        };
        let statements = self.ctx.registry().statements(schema.name())?;
        let mut proxy = StoreProxy::new(Rc::clone(&schema), statements, BY_ID, SearchKey::from(Value::Null))?;
        let frames = self.ctx.transaction(|db| {
            let id = proxy.insert(db, &frame, fullhouse)?;
            proxy.pin_to(id);
            proxy.read(db, ReadOptions::default())
        })?;
        let evicted = {
            let mut state = self.state.borrow_mut();
            state.origin = Origin::Store(proxy);
            state.mode = Mode::Unique;
            state.window.load(frames);
            state.cache.clear()
        };
        drop(evicted);
        info!("created {} #{}", schema.name(), self.id().unwrap_or_default());
        Ok(())
    }

    /// Persist `streams` of the active row (every stream when empty), re-read,
    /// and notify registrants of the change.
    ///
    /// A unique node writes through its search predicate and then re-derives
    /// its search parameters from the new values; a multi node writes only
    /// its active row.
    pub async fn update(&self, streams: &[&str]) -> NodeResult<()> {
        let proxy = self.store_proxy("update")?;
        let (schema, frame, unique) = {
            let state = self.state.borrow();
            let frame = state.window.active().cloned().ok_or_else(|| {
                NodeError::Retrieval(format!("{} has no active row", state.schema.name()))
            })?;
            (Rc::clone(&state.schema), frame, state.is_unique())
        };
        let names: Vec<String> = if streams.is_empty() {
            schema.streams().iter().map(|s| s.name.clone()).collect()
        } else {
            streams
                .iter()
                .map(|s| {
                    if schema.has_stream(s) {
                        Ok(s.to_string())
                    } else {
                        Err(NodeError::Usage(format!("{} has no stream '{}'", schema.name(), s)))
                    }
                })
                .collect::<NodeResult<_>>()?
        };
        let id = frame
            .id
            .ok_or_else(|| NodeError::Retrieval(format!("{} row has no primary key", schema.name())))?;
        let changes: Vec<(String, Value)> = names.iter().map(|n| (n.clone(), frame.get(n))).collect();

        let (resynced, frames) = self.ctx.transaction(|db| {
            if unique {
                proxy.update(db, &changes)?;
                let mut resynced = proxy.clone();
                resynced.resync_from(&frame)?;
                let frames = resynced.read(db, ReadOptions::default())?;
                Ok((Some(resynced), frames))
            } else {
                let mut pinned = proxy.clone();
                pinned.pin_to(id);
                pinned.update(db, &changes)?;
                Ok((None, pinned.read(db, ReadOptions::default())?))
            }
        })?;

        let evicted = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            match resynced {
                Some(proxy) => {
                    state.origin = Origin::Store(proxy);
                    state.window.load(frames);
                }
                None => {
                    if let Some(row) = frames.into_iter().next() {
                        state.window.replace_active(row);
                    }
                }
            }
            let mut evicted = Vec::new();
            for name in &names {
                evicted.extend(state.cache.invalidate(name, &state.schema));
            }
            evicted
        };
        drop(evicted);
        debug!("updated {} #{} {:?}", schema.name(), id, names);
        self.notify_registrants(&names, Vec::new()).await
    }

    /// Delete the backing row (every row in the window for a multi node),
    /// re-search without failing on the now empty result and notify
    /// registrants.
    pub async fn delete(&self) -> NodeResult<()> {
        let proxy = self.store_proxy("delete")?;
        let (ids, streams) = {
            let state = self.state.borrow();
            let ids: Vec<i64> = if state.is_unique() {
                state.window.active().and_then(|f| f.id).into_iter().collect()
            } else {
                state.window.frames().filter_map(|f| f.id).collect()
            };
            let streams: Vec<String> = state.schema.streams().iter().map(|s| s.name.clone()).collect();
            (ids, streams)
        };
        if ids.is_empty() {
            return Err(NodeError::Retrieval(format!(
                "{} has no row to delete",
                self.type_name()
            )));
        }
        self.ctx.transaction(|db| proxy.delete(db, &ids))?;
        info!("deleted {} {:?}", self.type_name(), ids);
        self.reload(ReadOptions {
            allow_empty: true,
            broadcast: false,
        })?;
        self.notify_registrants(&streams, Vec::new()).await
    }

    /// Re-run the search, clear the cache and re-apply filters.
    pub(crate) fn reload(&self, options: ReadOptions) -> NodeResult<()> {
        let proxy = match &self.state.borrow().origin {
            Origin::Store(proxy) => Some(proxy.clone()),
            _ => None,
        };
        let Some(proxy) = proxy else {
            let evicted = {
                let mut state = self.state.borrow_mut();
                state.window.rewind();
                state.cache.clear()
            };
            drop(evicted);
            return Ok(());
        };
        let frames = proxy.read(self.ctx.db(), options)?;
        let evicted = {
            let mut state = self.state.borrow_mut();
            state.window.load(frames);
            state.cache.clear()
        };
        drop(evicted);
        self.apply_filters()
    }

    /// Re-read from the store; with `broadcast`, listeners of this search
    /// are told to re-read too.
    pub async fn refresh(&self, options: ReadOptions) -> NodeResult<()> {
        self.reload(options)?;
        if options.broadcast {
            self.broadcast().await?;
        }
        Ok(())
    }

    /// Re-read without failing on an empty result and rewind iteration.
    pub fn reset(&self) -> NodeResult<()> {
        self.reload(ReadOptions {
            allow_empty: true,
            broadcast: false,
        })
    }

    fn with_window<T>(&self, f: impl FnOnce(&mut super::ResultWindow) -> T) -> T {
        let (out, evicted) = {
            let mut state = self.state.borrow_mut();
            let out = f(&mut state.window);
            (out, state.cache.clear())
        };
        drop(evicted);
        out
    }

    /// Activate the next row of the window; false once exhausted.
    ///
    /// ```ignore
    /// while node.advance() {
    ///     println!("{}", node.get("name")?);
    /// }
    /// node.reset()?;
    /// ```
    pub fn advance(&self) -> bool {
        self.with_window(|w| w.advance())
    }

    /// Make row `i` of the window active.
    pub fn select(&self, i: usize) -> NodeResult<()> {
        self.require_multi("index")?;
        self.with_window(|w| w.select(i))
    }

    /// Narrow the window to `range` and activate its first row.
    pub fn slice(&self, range: Range<usize>) -> NodeResult<()> {
        self.require_multi("slice")?;
        self.with_window(|w| w.slice(range))
    }

    /// Keep rows for which `predicate` holds. The predicate is remembered
    /// and re-applied after every read.
    pub fn filter(&self, predicate: impl Fn(&Node) -> bool + 'static) -> NodeResult<()> {
        self.require_multi("filter")?;
        self.state.borrow_mut().filters.push(Rc::new(predicate));
        self.apply_filters()
    }

    /// Forget every filter and restore the full result.
    pub fn clear_filters(&self) {
        self.state.borrow_mut().filters.clear();
        self.with_window(|w| w.rewind());
    }

    fn apply_filters(&self) -> NodeResult<()> {
        let filters: Vec<Predicate> = self.state.borrow().filters.clone();
        if filters.is_empty() {
            return Ok(());
        }
        let mut keep: Vec<usize> = (0..self.state.borrow().window.rdf().len()).collect();
        for predicate in &filters {
            keep.retain(|&position| {
                self.with_window(|w| w.activate_raw(position));
                predicate(self)
            });
        }
        self.with_window(|w| w.restrict(keep));
        Ok(())
    }

    /// Reorder the result by a scalar projection of each row. Filters are
    /// re-applied over the new order.
    pub fn sort_by(&self, key: impl Fn(&Node) -> Value) -> NodeResult<()> {
        self.require_multi("sort")?;
        let rows = self.state.borrow().window.rdf().len();
        let mut keyed: Vec<(usize, Value)> = (0..rows)
            .map(|position| {
                self.with_window(|w| w.activate_raw(position));
                (position, key(self))
            })
            .collect();
        keyed.sort_by(|a, b| a.1.sort_cmp(&b.1));
        self.with_window(|w| w.reorder(keyed.into_iter().map(|(p, _)| p).collect()));
        self.apply_filters()
    }
}
