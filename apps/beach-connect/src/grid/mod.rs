//! Row-addressed terminal buffer.
//!
//! The logical grid is an unbounded sequence of rows addressed by absolute
//! index. Only a window of at most `history_limit` rows is materialized:
//! writing past the end of the window evicts the oldest rows, and rows that
//! have not arrived yet are held as [`RowKind::Missing`] placeholders.
//!
//! ```
//! # use beach_connect::grid::{GridStore, IngestOutcome, RowKind};
//! let mut store = GridStore::new(3, 100);
//! assert_eq!(store.ingest(10, 1, "$ ls"), IngestOutcome::Written);
//! assert_eq!(store.ingest(12, 2, "README.md"), IngestOutcome::Written);
//!
//! let snapshot = store.snapshot();
//! assert_eq!(snapshot.row(11).map(|row| row.kind), Some(RowKind::Missing));
//! assert_eq!(snapshot.base_row, 10);
//! ```

mod follow_tail;

pub use follow_tail::{
    FollowTailDecision, FollowTailInput, REASON_ALREADY_FOLLOWING, REASON_EMPTY_GRID,
    REASON_FITS_VIEWPORT, REASON_NO_SNAPSHOT, REASON_PRESERVE_MANUAL_SCROLL,
    decide_follow_tail_restore,
};

use std::collections::VecDeque;
use tracing::{debug, trace};

/// Monotonic per-row update sequence supplied by the host.
pub type Seq = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Loaded,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalRow {
    pub kind: RowKind,
    pub absolute_index: u64,
    pub text: String,
    /// `None` for placeholders.
    pub seq: Option<Seq>,
}

impl TerminalRow {
    pub fn is_loaded(&self) -> bool {
        self.kind == RowKind::Loaded
    }
}

/// Immutable view of the grid handed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridSnapshot {
    pub follow_tail: bool,
    /// Absolute index of the first row in the viewport.
    pub base_row: u64,
    pub viewport_height: usize,
    /// Every materialized row, ordered by absolute index.
    pub rows: Vec<TerminalRow>,
}

impl GridSnapshot {
    pub fn row(&self, absolute_index: u64) -> Option<&TerminalRow> {
        let first = self.rows.first()?.absolute_index;
        let rel = absolute_index.checked_sub(first)?;
        self.rows.get(usize::try_from(rel).ok()?)
    }

    pub fn visible_rows(&self) -> impl Iterator<Item = &TerminalRow> {
        let end = self.base_row.saturating_add(self.viewport_height as u64);
        let base = self.base_row;
        self.rows
            .iter()
            .filter(move |row| row.absolute_index >= base && row.absolute_index < end)
    }

    pub fn loaded_count(&self) -> usize {
        self.rows.iter().filter(|row| row.is_loaded()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Written,
    /// The stored row carries a newer sequence.
    SkippedOlder,
    /// Backfill older than the materialized window.
    OutOfWindow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RowSlot {
    Loaded { text: String, seq: Seq },
    Missing,
}

#[derive(Debug)]
pub struct GridStore {
    /// Absolute index of `rows[0]`.
    origin: u64,
    rows: VecDeque<RowSlot>,
    viewport_height: usize,
    follow_tail: bool,
    /// Absolute top of the viewport while follow-tail is off.
    viewport_top: u64,
    history_limit: usize,
    received_any: bool,
}

impl GridStore {
    pub fn new(viewport_height: usize, history_limit: usize) -> Self {
        Self {
            origin: 0,
            rows: VecDeque::new(),
            viewport_height,
            follow_tail: true,
            viewport_top: 0,
            history_limit,
            received_any: false,
        }
    }

    pub fn viewport_height(&self) -> usize {
        self.viewport_height
    }

    pub fn is_following_tail(&self) -> bool {
        self.follow_tail
    }

    /// Materialized rows, placeholders included.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn loaded_count(&self) -> usize {
        self.rows
            .iter()
            .filter(|slot| matches!(slot, RowSlot::Loaded { .. }))
            .count()
    }

    fn capacity(&self) -> usize {
        self.history_limit.max(self.viewport_height).max(1)
    }

    fn end(&self) -> u64 {
        self.origin + self.rows.len() as u64
    }

    pub fn last_loaded_index(&self) -> Option<u64> {
        self.rows
            .iter()
            .rposition(|slot| matches!(slot, RowSlot::Loaded { .. }))
            .map(|rel| self.origin + rel as u64)
    }

    /// Top of a viewport whose last row is the newest loaded row.
    fn tail_top(&self) -> u64 {
        self.last_loaded_index()
            .map(|last| (last + 1).saturating_sub(self.viewport_height as u64))
            .unwrap_or(self.origin)
    }

    fn view_top(&self) -> u64 {
        if self.follow_tail {
            self.tail_top()
        } else {
            self.viewport_top
        }
    }

    /// Clear all rows ahead of a new connection.
    ///
    /// Returns the follow-tail decision computed from the state before the
    /// reset; the store adopts it.
    pub fn reset(&mut self) -> FollowTailDecision {
        let prior = self.received_any.then(|| FollowTailInput {
            follow_tail: self.follow_tail,
            row_count: self.rows.len(),
            viewport_height: self.viewport_height,
        });
        let decision = decide_follow_tail_restore(prior.as_ref());
        self.rows.clear();
        self.follow_tail = decision.enable;
        debug!(
            target = "connect::grid",
            follow_tail = decision.enable,
            reason = decision.reason,
            "grid reset"
        );
        decision
    }

    /// Returns whether the mode changed.
    pub fn set_follow_tail(&mut self, follow: bool) -> bool {
        if self.follow_tail == follow {
            return false;
        }
        if !follow {
            self.viewport_top = self.tail_top();
        }
        self.follow_tail = follow;
        trace!(
            target = "connect::grid",
            follow_tail = follow,
            viewport_top = self.viewport_top,
            "set_follow_tail"
        );
        true
    }

    pub fn apply_resize(&mut self, viewport_height: usize) -> bool {
        if viewport_height == self.viewport_height {
            return false;
        }
        self.viewport_height = viewport_height;
        if !self.follow_tail {
            self.viewport_top = self.viewport_top.min(self.tail_top().max(self.origin));
        }
        let top = self.view_top();
        if !self.rows.is_empty() && top < self.origin {
            let room = self.capacity().saturating_sub(self.rows.len()) as u64;
            let exposed = (self.origin - top).min(room);
            for _ in 0..exposed {
                self.rows.push_front(RowSlot::Missing);
            }
            self.origin -= exposed;
        }
        trace!(
            target = "connect::grid",
            viewport_height,
            origin = self.origin,
            rows = self.rows.len(),
            "apply_resize"
        );
        true
    }

    pub fn scroll_lines(&mut self, delta: isize) {
        if self.viewport_height == 0 || self.rows.is_empty() {
            return;
        }
        let tail = self.tail_top();
        let min_top = self.origin.min(tail);
        let top = self.view_top();
        let target = if delta.is_negative() {
            top.saturating_sub(delta.unsigned_abs() as u64)
        } else {
            top.saturating_add(delta as u64)
        };
        self.viewport_top = target.clamp(min_top, tail);
        self.follow_tail = self.viewport_top >= tail;
        trace!(
            target = "connect::grid",
            delta,
            viewport_top = self.viewport_top,
            follow_tail = self.follow_tail,
            "scroll_lines"
        );
    }

    /// Write a row at its absolute index.
    pub fn ingest(&mut self, absolute_index: u64, seq: Seq, text: &str) -> IngestOutcome {
        self.received_any = true;
        let capacity = self.capacity();
        if self.rows.is_empty() {
            self.origin = absolute_index;
        }

        if absolute_index < self.origin {
            let gap = self.origin - absolute_index;
            if self.rows.len() as u64 + gap > capacity as u64 {
                trace!(
                    target = "connect::grid",
                    absolute_index,
                    origin = self.origin,
                    "backfill outside window"
                );
                return IngestOutcome::OutOfWindow;
            }
            for _ in 0..gap {
                self.rows.push_front(RowSlot::Missing);
            }
            self.origin = absolute_index;
        } else if absolute_index >= self.end() {
            let Some(new_end) = absolute_index.checked_add(1) else {
                return IngestOutcome::OutOfWindow;
            };
            let floor = new_end.saturating_sub(capacity as u64);
            if floor > self.origin {
                self.advance_origin(floor);
            }
            while self.end() < absolute_index {
                self.rows.push_back(RowSlot::Missing);
            }
            self.rows.push_back(RowSlot::Missing);
        }

        let rel = (absolute_index - self.origin) as usize;
        let Some(slot) = self.rows.get_mut(rel) else {
            return IngestOutcome::OutOfWindow;
        };
        if let RowSlot::Loaded { seq: current, .. } = slot {
            if seq < *current {
                return IngestOutcome::SkippedOlder;
            }
        }
        *slot = RowSlot::Loaded {
            text: text.to_string(),
            seq,
        };
        IngestOutcome::Written
    }

    /// Drop rows below `floor`, keeping the window anchored at `floor`.
    fn advance_origin(&mut self, floor: u64) {
        let drop = floor - self.origin;
        if drop >= self.rows.len() as u64 {
            self.rows.clear();
        } else {
            self.rows.drain(..drop as usize);
        }
        self.origin = floor;
        trace!(
            target = "connect::grid",
            origin = self.origin,
            "history trimmed"
        );
    }

    pub fn snapshot(&self) -> GridSnapshot {
        let rows = self
            .rows
            .iter()
            .enumerate()
            .map(|(rel, slot)| {
                let absolute_index = self.origin + rel as u64;
                match slot {
                    RowSlot::Loaded { text, seq } => TerminalRow {
                        kind: RowKind::Loaded,
                        absolute_index,
                        text: text.clone(),
                        seq: Some(*seq),
                    },
                    RowSlot::Missing => TerminalRow {
                        kind: RowKind::Missing,
                        absolute_index,
                        text: String::new(),
                        seq: None,
                    },
                }
            })
            .collect();
        GridSnapshot {
            follow_tail: self.follow_tail,
            base_row: self.view_top(),
            viewport_height: self.viewport_height,
            rows,
        }
    }
}
