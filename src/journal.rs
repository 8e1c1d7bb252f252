// ============================================================================
// CHANGE JOURNAL — bounded undo/redo of local single-pixel edits
// ============================================================================

use std::collections::VecDeque;

use crate::color::Color;
use crate::grid::GridStore;

/// One journaled edit: the color a cell had *before* the edit (on the undo
/// stack) or before the undo (on the redo stack).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub x: u32,
    pub y: u32,
    pub color: Color,
}

/// Instruction produced by undo/redo: set `(x, y)` to `color`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reversal {
    pub x: u32,
    pub y: u32,
    pub color: Color,
}

/// Undo/redo stacks with a step limit.
///
/// The journal never mutates the grid itself; callers apply the returned
/// [`Reversal`] and the journal only reads the grid to capture the opposite
/// entry.
#[derive(Clone, Debug)]
pub struct ChangeJournal {
    undo_stack: VecDeque<HistoryEntry>,
    redo_stack: VecDeque<HistoryEntry>,
    max_history_size: usize,
}

impl Default for ChangeJournal {
    fn default() -> Self {
        Self::new(50)
    }
}

impl ChangeJournal {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            max_history_size: max_history_size.max(1),
        }
    }

    /// Record the prior color of a cell about to be edited.
    pub fn record_edit(&mut self, x: u32, y: u32, prior: Color) {
        // A new edit invalidates everything that was undone
        self.redo_stack.clear();
        self.undo_stack.push_back(HistoryEntry { x, y, color: prior });
        self.prune();
    }

    pub fn undo(&mut self, grid: &GridStore) -> Option<Reversal> {
        let entry = self.undo_stack.pop_back()?;
        let current = grid.get(entry.x, entry.y)?.color;
        self.redo_stack.push_back(HistoryEntry { x: entry.x, y: entry.y, color: current });
        Some(Reversal { x: entry.x, y: entry.y, color: entry.color })
    }

    pub fn redo(&mut self, grid: &GridStore) -> Option<Reversal> {
        let entry = self.redo_stack.pop_back()?;
        let current = grid.get(entry.x, entry.y)?.color;
        self.undo_stack.push_back(HistoryEntry { x: entry.x, y: entry.y, color: current });
        self.prune();
        Some(Reversal { x: entry.x, y: entry.y, color: entry.color })
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Undo entries, most recent first.
    pub fn undo_history(&self) -> Vec<HistoryEntry> {
        self.undo_stack.iter().rev().copied().collect()
    }

    /// Drop the oldest entries beyond the step limit.
    fn prune(&mut self) {
        while self.undo_stack.len() > self.max_history_size {
            self.undo_stack.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn max_history_size(&self) -> usize {
        self.max_history_size
    }
}
