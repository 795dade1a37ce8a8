use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Hash,
    Array,
    PerCpuArray,
    LruHash,
    RingBuf,
    PerfEventArray,
    Other(u32),
}

impl MapKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MapKind::Hash => "hash",
            MapKind::Array => "array",
            MapKind::PerCpuArray => "percpu_array",
            MapKind::LruHash => "lru_hash",
            MapKind::RingBuf => "ringbuf",
            MapKind::PerfEventArray => "perf_event_array",
            MapKind::Other(_) => "other",
        }
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKind::Other(raw) => write!(f, "other({})", raw),
            kind => write!(f, "{}", kind.as_str()),
        }
    }
}

/// Map definition as declared by the bundle, editable until load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapSpec {
    pub name: String,
    pub kind: MapKind,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
}

impl MapSpec {
    pub fn new(name: impl Into<String>, kind: MapKind) -> Self {
        Self {
            name: name.into(),
            kind,
            key_size: 0,
            value_size: 0,
            max_entries: 0,
        }
    }
}

/// A map that lives outside the collection, e.g. owned by the caller or by
/// the socket enricher, and is shared with the program instead of creating
/// its own.
pub trait ExternalMap: Send + Sync {
    fn name(&self) -> &str;

    /// Kernel file descriptor of the map
    fn fd(&self) -> i32;
}

/// Maps to substitute at collection load, keyed by the bundle's map name
#[derive(Clone, Default)]
pub struct MapReplacements {
    inner: BTreeMap<String, Arc<dyn ExternalMap>>,
}

impl MapReplacements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, map: Arc<dyn ExternalMap>) {
        self.inner.insert(name.into(), map);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ExternalMap>> {
        self.inner.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for MapReplacements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.inner.iter().map(|(k, v)| (k, v.fd())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedMap(&'static str, i32);

    impl ExternalMap for FixedMap {
        fn name(&self) -> &str {
            self.0
        }

        fn fd(&self) -> i32 {
            self.1
        }
    }

    #[test]
    fn test_map_replacements() {
        let mut replacements = MapReplacements::new();
        assert!(replacements.is_empty());

        replacements.insert("pk_sockets", Arc::new(FixedMap("sockets", 7)));
        replacements.insert("pk_mntns_filter_map", Arc::new(FixedMap("filter", 9)));

        assert_eq!(replacements.len(), 2);
        assert_eq!(
            replacements.names().collect::<Vec<_>>(),
            vec!["pk_mntns_filter_map", "pk_sockets"]
        );
        assert_eq!(replacements.get("pk_sockets").map(|m| m.fd()), Some(7));
        assert!(replacements.get("missing").is_none());
    }

    #[test]
    fn test_map_kind_display() {
        assert_eq!(MapKind::RingBuf.to_string(), "ringbuf");
        assert_eq!(MapKind::Other(42).to_string(), "other(42)");
    }
}
