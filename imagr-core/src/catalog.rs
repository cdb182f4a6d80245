//! The ordered list of candidate targets.

use std::io;

use tracing::debug;

use crate::backend::{DeviceBackend, ScanOptions};
use crate::device::DeviceEntry;

/// Hard cap on catalog size; discovery past this is dropped.
pub const MAX_TARGETS: usize = 128;

/// An ordered snapshot of discovered targets.
///
/// Selection is by index. Indices are only meaningful until the next
/// [`DeviceCatalog::refresh`], which rebuilds the list from scratch;
/// entries are never mutated in place.
#[derive(Default)]
pub struct DeviceCatalog {
    entries: Vec<DeviceEntry>,
}

impl DeviceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the list and rebuilds it from a fresh platform scan.
    pub fn refresh(
        &mut self,
        backend: &mut dyn DeviceBackend,
        opts: &ScanOptions,
    ) -> io::Result<&[DeviceEntry]> {
        self.entries.clear();
        let mut found = backend.scan(opts)?;
        if found.len() > MAX_TARGETS {
            debug!(found = found.len(), "capping catalog at {MAX_TARGETS}");
            found.truncate(MAX_TARGETS);
        }
        self.entries = found;
        debug!(targets = self.entries.len(), "catalog refreshed");
        Ok(&self.entries)
    }

    pub fn entries(&self) -> &[DeviceEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&DeviceEntry> {
        self.entries.get(index)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
