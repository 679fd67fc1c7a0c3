//! Result window of a node instance.
//!
//! `rdf` holds every frame returned by the last read; the window is an
//! ordered subset of positions into it. The active frame is the row the
//! node's attributes currently project.

use crate::error::{NodeError, NodeResult};
use crate::store::Frame;
use std::ops::Range;

#[derive(Debug, Default)]
pub struct ResultWindow {
    rdf: Vec<Frame>,
    window: Vec<usize>,
    /// Next window position handed out by `advance`
    cursor: usize,
    active: Option<usize>,
}

impl ResultWindow {
    pub fn new(frames: Vec<Frame>) -> Self {
        let mut window = Self::default();
        window.load(frames);
        window
    }

    /// Replace the result and select its first row.
    pub fn load(&mut self, frames: Vec<Frame>) {
        self.window = (0..frames.len()).collect();
        self.rdf = frames;
        self.cursor = 0;
        self.active = self.window.first().copied();
    }

    pub fn rdf(&self) -> &[Frame] {
        &self.rdf
    }

    /// Frames currently in the window, in window order
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.window.iter().map(move |&i| &self.rdf[i])
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn active(&self) -> Option<&Frame> {
        self.active.map(|i| &self.rdf[i])
    }

    pub fn active_mut(&mut self) -> Option<&mut Frame> {
        self.active.map(move |i| &mut self.rdf[i])
    }

    /// Activate a row of `rdf` directly; used while evaluating filters.
    pub(crate) fn activate_raw(&mut self, position: usize) {
        if position < self.rdf.len() {
            self.active = Some(position);
        }
    }

    /// Make the `i`th row of the window active.
    pub fn select(&mut self, i: usize) -> NodeResult<()> {
        let position = *self.window.get(i).ok_or_else(|| {
            NodeError::Usage(format!("row {} is outside a window of {}", i, self.window.len()))
        })?;
        self.active = Some(position);
        Ok(())
    }

    /// Narrow the window and select its first row.
    pub fn slice(&mut self, range: Range<usize>) -> NodeResult<()> {
        if range.start > range.end || range.end > self.window.len() {
            return Err(NodeError::Usage(format!(
                "slice {:?} is outside a window of {}",
                range,
                self.window.len()
            )));
        }
        self.window = self.window[range].to_vec();
        self.cursor = 0;
        self.active = self.window.first().copied();
        Ok(())
    }

    /// Activate the next row of the window; false once exhausted.
    pub fn advance(&mut self) -> bool {
        match self.window.get(self.cursor) {
            Some(&position) => {
                self.active = Some(position);
                self.cursor += 1;
                true
            }
            None => false,
        }
    }

    /// Restore the whole `rdf` as the window and rewind the cursor.
    pub fn rewind(&mut self) {
        self.window = (0..self.rdf.len()).collect();
        self.cursor = 0;
        self.active = self.window.first().copied();
    }

    /// Keep only the given `rdf` positions, in `rdf` order.
    pub(crate) fn restrict(&mut self, keep: Vec<usize>) {
        self.window = keep;
        self.cursor = 0;
        self.active = self.window.first().copied();
    }

    /// Reorder `rdf` by `key`; resets window and cursor.
    pub(crate) fn reorder(&mut self, order: Vec<usize>) {
        let mut frames: Vec<Option<Frame>> = std::mem::take(&mut self.rdf).into_iter().map(Some).collect();
        self.rdf = order.into_iter().filter_map(|i| frames.get_mut(i).and_then(Option::take)).collect();
        self.rewind();
    }

    /// Replace the active row in place, e.g. after it was re-read.
    pub(crate) fn replace_active(&mut self, frame: Frame) {
        if let Some(i) = self.active {
            self.rdf[i] = frame;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Value;

    fn frames(n: i64) -> Vec<Frame> {
        (1..=n)
            .map(|i| {
                let mut f = Frame::with_id(i);
                f.set("n", Value::Integer(i));
                f
            })
            .collect()
    }

    #[test]
    fn advance_exhausts_then_rewinds() {
        let mut w = ResultWindow::new(frames(3));
        let mut seen = Vec::new();
        while w.advance() {
            seen.push(w.active().unwrap().id.unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(!w.advance());
        w.rewind();
        assert_eq!(std::iter::from_fn(|| w.advance().then_some(())).count(), 3);
    }

    #[test]
    fn slice_selects_first_row_of_new_window() {
        let mut w = ResultWindow::new(frames(5));
        w.slice(1..3).unwrap();
        assert_eq!(w.len(), 2);
        assert_eq!(w.active().unwrap().id, Some(2));
        assert!(w.select(2).is_err());
        assert!(w.slice(0..4).is_err());
    }

    #[test]
    fn reorder_resets_window() {
        let mut w = ResultWindow::new(frames(3));
        w.restrict(vec![0]);
        w.reorder(vec![2, 1, 0]);
        assert_eq!(w.len(), 3);
        assert_eq!(w.active().unwrap().id, Some(3));
    }
}
