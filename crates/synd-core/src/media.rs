//! Ordered media list and the index remaps its mutations induce.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::MediaRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("media index {index} out of range (len {len})")]
    InvalidIndex { index: usize, len: usize },
}

/// How positions in a [`MediaSet`] moved after one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexRemap {
    Moved { from: usize, to: usize },
    Removed { at: usize },
}

impl IndexRemap {
    /// New position of the item previously at `index`, or `None` if it was removed.
    pub fn apply(&self, index: usize) -> Option<usize> {
        match *self {
            IndexRemap::Moved { from, to } => Some(if index == from {
                to
            } else if from < to && from < index && index <= to {
                index - 1
            } else if from > to && to <= index && index < from {
                index + 1
            } else {
                index
            }),
            IndexRemap::Removed { at } => match index.cmp(&at) {
                std::cmp::Ordering::Equal => None,
                std::cmp::Ordering::Greater => Some(index - 1),
                std::cmp::Ordering::Less => Some(index),
            },
        }
    }

    /// Rewrites a selection in place, keeping its order and dropping removed entries.
    pub fn apply_to(&self, selection: &mut Vec<usize>) {
        let remapped = selection
            .iter()
            .filter_map(|&index| self.apply(index))
            .collect();
        *selection = remapped;
    }
}

/// Canonical media, addressed by position.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaSet {
    items: Vec<MediaRef>,
}

impl MediaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_refs(items: Vec<MediaRef>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MediaRef> {
        self.items.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MediaRef> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[MediaRef] {
        &self.items
    }

    pub fn check_index(&self, index: usize) -> Result<(), MediaError> {
        if index < self.items.len() {
            Ok(())
        } else {
            Err(MediaError::InvalidIndex {
                index,
                len: self.items.len(),
            })
        }
    }

    /// Appends at the end; existing indices are untouched so no remap is needed.
    pub(crate) fn append(&mut self, refs: Vec<MediaRef>) -> Range<usize> {
        let start = self.items.len();
        self.items.extend(refs);
        start..self.items.len()
    }

    pub(crate) fn reorder(&mut self, from: usize, to: usize) -> Result<IndexRemap, MediaError> {
        self.check_index(from)?;
        self.check_index(to)?;
        if from != to {
            let item = self.items.remove(from);
            self.items.insert(to, item);
        }
        Ok(IndexRemap::Moved { from, to })
    }

    pub(crate) fn remove(&mut self, at: usize) -> Result<(MediaRef, IndexRemap), MediaError> {
        self.check_index(at)?;
        let removed = self.items.remove(at);
        Ok((removed, IndexRemap::Removed { at }))
    }
}

/// Moves `index` to the front of `selection`, adding it if it was not selected.
pub fn set_cover(selection: &mut Vec<usize>, index: usize) {
    selection.retain(|&i| i != index);
    selection.insert(0, index);
}
