//! Compartment registry: which module owns which protection key.
//!
//! Populated once at startup, then frozen inside [`crate::runtime::Runtime`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::{ConfigError, ConfigResult};
use super::id::CompartmentId;

/// How the loader finds a compartment's code and data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderInfo {
    /// Shared-object name prefixes whose segments belong to the compartment.
    /// Prefix matching absorbs version suffixes (`libfoo.so` matches `libfoo.so.1`).
    #[serde(default)]
    pub libraries: Vec<String>,
    /// Tag the libraries' writable segments at init.
    #[serde(default)]
    pub protect_segments: bool,
}

impl LoaderInfo {
    /// Parse a `;`-separated library list.
    pub fn from_library_list(list: &str) -> Self {
        Self {
            libraries: list
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            protect_segments: false,
        }
    }

    /// Whether `so_name` (a path or file name) is one of this compartment's libraries.
    pub fn claims(&self, so_name: &str) -> bool {
        let file = so_name.rsplit('/').next().unwrap_or(so_name);
        self.libraries.iter().any(|lib| file.starts_with(lib.as_str()))
    }
}

/// A registered compartment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompartmentInfo {
    pub id: CompartmentId,
    pub name: String,
    pub loader: LoaderInfo,
}

/// The set of compartments declared for this process.
#[derive(Debug, Clone)]
pub struct CompartmentRegistry {
    count: u8,
    modules: BTreeMap<CompartmentId, CompartmentInfo>,
}

impl CompartmentRegistry {
    /// Create a registry for `count` compartments (1..=15).
    pub fn new(count: usize) -> ConfigResult<Self> {
        if count == 0 || count > CompartmentId::MAX.index() {
            return Err(ConfigError::InvalidCount { count });
        }
        Ok(Self {
            count: count as u8,
            modules: BTreeMap::new(),
        })
    }

    /// Bind `name` to compartment `id`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        id: u8,
        loader: LoaderInfo,
    ) -> ConfigResult<CompartmentId> {
        let name = name.into();
        if id == 0 {
            return Err(ConfigError::ReservedId { name });
        }
        let cid = CompartmentId::new(id)
            .filter(|c| c.get() <= self.count)
            .ok_or_else(|| ConfigError::IdOutOfRange {
                name: name.clone(),
                id,
                count: self.count,
            })?;
        if let Some(existing) = self.modules.get(&cid) {
            return Err(ConfigError::DuplicateId {
                id,
                existing: existing.name.clone(),
                name,
            });
        }
        tracing::debug!(id, module = %name, "registered compartment");
        self.modules.insert(
            cid,
            CompartmentInfo {
                id: cid,
                name,
                loader,
            },
        );
        Ok(cid)
    }

    /// Every id from 1 to the count must have a module.
    pub fn ensure_complete(&self) -> ConfigResult<()> {
        for id in CompartmentId::range(self.count) {
            if !self.modules.contains_key(&id) {
                return Err(ConfigError::MissingRegistration { id: id.get() });
            }
        }
        Ok(())
    }

    /// Number of configured compartments, not counting the shared domain.
    pub fn count(&self) -> u8 {
        self.count
    }

    /// Whether `id` is shared or one of the configured compartments.
    pub fn contains(&self, id: CompartmentId) -> bool {
        id.get() <= self.count
    }

    pub fn get(&self, id: CompartmentId) -> Option<&CompartmentInfo> {
        self.modules.get(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&CompartmentInfo> {
        self.modules.values().find(|m| m.name == name)
    }

    /// The compartment claiming a shared object, by library prefix.
    pub fn find_library(&self, so_name: &str) -> Option<CompartmentId> {
        self.modules
            .values()
            .find(|m| m.loader.claims(so_name))
            .map(|m| m.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompartmentInfo> {
        self.modules.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CompartmentRegistry {
        let mut reg = CompartmentRegistry::new(2).unwrap();
        reg.register("main", 1, LoaderInfo::default()).unwrap();
        reg.register("plugin", 2, LoaderInfo::from_library_list("libplugin.so; libz.so"))
            .unwrap();
        reg
    }

    #[test]
    fn count_bounds() {
        assert!(matches!(
            CompartmentRegistry::new(0),
            Err(ConfigError::InvalidCount { count: 0 })
        ));
        assert!(CompartmentRegistry::new(15).is_ok());
        assert!(CompartmentRegistry::new(16).is_err());
    }

    #[test]
    fn rejects_shared_id() {
        let mut reg = CompartmentRegistry::new(1).unwrap();
        let err = reg.register("bad", 0, LoaderInfo::default()).unwrap_err();
        assert!(matches!(err, ConfigError::ReservedId { .. }));
    }

    #[test]
    fn rejects_duplicates_and_out_of_range() {
        let mut reg = registry();
        assert!(matches!(
            reg.register("again", 2, LoaderInfo::default()),
            Err(ConfigError::DuplicateId { id: 2, .. })
        ));
        assert!(matches!(
            reg.register("far", 3, LoaderInfo::default()),
            Err(ConfigError::IdOutOfRange { id: 3, count: 2, .. })
        ));
    }

    #[test]
    fn detects_missing_ids() {
        let mut reg = CompartmentRegistry::new(3).unwrap();
        reg.register("a", 1, LoaderInfo::default()).unwrap();
        reg.register("c", 3, LoaderInfo::default()).unwrap();
        assert!(matches!(
            reg.ensure_complete(),
            Err(ConfigError::MissingRegistration { id: 2 })
        ));
        assert!(registry().ensure_complete().is_ok());
    }

    #[test]
    fn library_prefixes_absorb_versions() {
        let reg = registry();
        assert_eq!(
            reg.find_library("/usr/lib/libz.so.1.3").map(CompartmentId::get),
            Some(2)
        );
        assert_eq!(reg.find_library("libplugin.so"), CompartmentId::new(2));
        assert_eq!(reg.find_library("libc.so.6"), None);
    }

    #[test]
    fn lookup_by_name() {
        let reg = registry();
        assert_eq!(reg.find_by_name("plugin").unwrap().id.get(), 2);
        assert!(reg.find_by_name("nope").is_none());
    }
}
