//! Compartment identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hardware::{MAX_KEYS, Pkru};

/// Index of a compartment, equal to its protection key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct CompartmentId(u8);

impl CompartmentId {
    /// The shared domain (key 0).
    pub const SHARED: CompartmentId = CompartmentId(0);

    /// Highest usable id.
    pub const MAX: CompartmentId = CompartmentId(MAX_KEYS as u8 - 1);

    /// Create an id, rejecting values past the last protection key.
    pub const fn new(id: u8) -> Option<Self> {
        if (id as usize) < MAX_KEYS {
            Some(Self(id))
        } else {
            None
        }
    }

    /// Raw id.
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Array index for per-compartment tables.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether this is the shared domain.
    pub const fn is_shared(self) -> bool {
        self.0 == 0
    }

    /// PKRU value granting this compartment and the shared key only.
    pub const fn pkru(self) -> Pkru {
        Pkru::for_key(self.0)
    }

    /// The compartment a PKRU value belongs to. Unrecognised values are shared.
    pub fn from_pkru(pkru: Pkru) -> Self {
        Self(pkru.key())
    }

    /// Iterate over `1..=count`.
    pub fn range(count: u8) -> impl Iterator<Item = CompartmentId> {
        (1..=count.min(Self::MAX.0)).map(Self)
    }
}

impl TryFrom<u8> for CompartmentId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("compartment id {value} is out of range 0..=15"))
    }
}

impl From<CompartmentId> for u8 {
    fn from(id: CompartmentId) -> u8 {
        id.0
    }
}

impl fmt::Debug for CompartmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompartmentId({})", self.0)
    }
}

impl fmt::Display for CompartmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_shared() {
            write!(f, "shared")
        } else {
            write!(f, "compartment {}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ids_past_last_key() {
        assert!(CompartmentId::new(15).is_some());
        assert!(CompartmentId::new(16).is_none());
    }

    #[test]
    fn pkru_roundtrip() {
        for id in CompartmentId::range(15) {
            assert_eq!(CompartmentId::from_pkru(id.pkru()), id);
        }
        assert_eq!(CompartmentId::from_pkru(Pkru::ALL_ACCESS), CompartmentId::SHARED);
    }

    #[test]
    fn range_is_dense_from_one() {
        let ids: Vec<u8> = CompartmentId::range(3).map(CompartmentId::get).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn deserializes_from_integer() {
        #[derive(Deserialize)]
        struct Wrapper {
            id: CompartmentId,
        }
        let w: Wrapper = toml::from_str("id = 2").unwrap();
        assert_eq!(w.id.get(), 2);
        assert!(toml::from_str::<Wrapper>("id = 20").is_err());
    }
}
