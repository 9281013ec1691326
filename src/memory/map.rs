//! Disjoint map of tagged address ranges.
//!
//! Keyed on page-rounded start address. Lookups are O(log n); the map is only
//! consulted for diagnostics and at setup, never on the gate path.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::compartment::CompartmentId;
use crate::error::{MapError, MapResult};
use crate::hardware::{PAGE_SIZE, page_ceil, page_floor};

/// Who may touch a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    /// Tagged with the owner's key.
    Private,
    /// Untagged, writable by every compartment.
    SharedRw,
    /// Untagged, read-only for everyone.
    SharedRo,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Private => write!(f, "private"),
            Classification::SharedRw => write!(f, "shared-rw"),
            Classification::SharedRo => write!(f, "shared-ro"),
        }
    }
}

/// One address range with a single owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Region {
    pub start: usize,
    pub len: usize,
    pub owner: CompartmentId,
    pub class: Classification,
    /// `PROT_*` bits.
    pub prot: i32,
    /// What the range holds, for diagnostics.
    pub label: String,
}

impl Region {
    pub fn new(
        start: usize,
        len: usize,
        owner: CompartmentId,
        class: Classification,
        prot: i32,
        label: impl Into<String>,
    ) -> Self {
        Self {
            start,
            len,
            owner,
            class,
            prot,
            label: label.into(),
        }
    }

    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// The protection key the pages carry.
    pub fn key(&self) -> u8 {
        match self.class {
            Classification::Private => self.owner.get(),
            Classification::SharedRw | Classification::SharedRo => 0,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#014x}-{:#014x} {:<9} {} ({})",
            self.start,
            self.end(),
            self.class,
            self.owner,
            self.label
        )
    }
}

/// The region map.
#[derive(Debug, Clone, Default)]
pub struct MemoryMap {
    regions: BTreeMap<usize, Region>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a region, rounded out to whole pages.
    pub fn add(&mut self, mut region: Region) -> MapResult<()> {
        if region.len == 0 {
            return Err(MapError::Empty {
                start: region.start,
            });
        }
        let start = page_floor(region.start);
        let end = page_ceil(region.end());
        region.start = start;
        region.len = end - start;

        if let Some(existing) = self.overlapping(start, end - start).next() {
            return Err(MapError::Overlap {
                start,
                len: end - start,
                existing_start: existing.start,
                existing_len: existing.len,
            });
        }
        self.regions.insert(start, region);
        Ok(())
    }

    /// The region containing `addr`.
    pub fn find_containing(&self, addr: usize) -> Option<&Region> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(addr))
    }

    /// The region that exactly covers `start..start + len` after page rounding.
    pub fn find_exact(&self, start: usize, len: usize) -> Option<&Region> {
        let rounded = page_floor(start);
        let end = page_ceil(start + len);
        self.regions
            .get(&rounded)
            .filter(|r| r.end() == end)
    }

    /// Remove the region starting at `start`.
    pub fn remove(&mut self, start: usize) -> Option<Region> {
        self.regions.remove(&page_floor(start))
    }

    /// Split the region containing `addr` into `[start, addr)` and `[addr, end)`.
    pub fn split(&mut self, addr: usize) -> MapResult<()> {
        if addr % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned { addr });
        }
        let region = self
            .find_containing(addr)
            .cloned()
            .ok_or(MapError::NotFound { addr })?;
        if region.start == addr {
            return Ok(());
        }
        let mut upper = region.clone();
        upper.start = addr;
        upper.len = region.end() - addr;
        if let Some(lower) = self.regions.get_mut(&region.start) {
            lower.len = addr - region.start;
        }
        self.regions.insert(addr, upper);
        Ok(())
    }

    /// Regions intersecting `start..start + len`, in address order.
    pub fn overlapping(&self, start: usize, len: usize) -> impl Iterator<Item = &Region> {
        let end = start.saturating_add(len);
        let first = self
            .regions
            .range(..start)
            .next_back()
            .filter(|(_, r)| r.end() > start)
            .map(|(_, r)| r);
        first
            .into_iter()
            .chain(self.regions.range(start..end).map(|(_, r)| r))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
