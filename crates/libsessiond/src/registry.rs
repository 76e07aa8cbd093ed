use serde_json::{Map, Value};
use tracing::{debug, warn};

use sessiond_protocol::{
    Descriptor, DescriptorApiLevel, PathInternal, PathPublic, RESERVED_DESCRIPTOR_KEYS,
};

use crate::ledger::{Binding, BindingState};

/// One enumerated device slot.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub internal: PathInternal,
    pub public: PathPublic,
    pub metadata: Map<String, Value>,
}

impl RegistryEntry {
    /// Public descriptor with the given ownership overlaid. A session still
    /// waiting for its acquire done is not published.
    pub fn to_descriptor(&self, binding: Option<&Binding>) -> Descriptor {
        let binding = binding.filter(|b| b.state != BindingState::Acquiring);
        Descriptor {
            path: self.public.clone(),
            session: binding.map(|b| b.session.clone()),
            session_owner: binding.and_then(|b| b.owner.clone()),
            metadata: self.metadata.clone(),
        }
    }
}

/// Paths that appeared or vanished between two enumeration snapshots.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EnumerationDiff {
    pub connected: Vec<PathInternal>,
    pub disconnected: Vec<PathInternal>,
}

impl EnumerationDiff {
    pub fn is_empty(&self) -> bool {
        self.connected.is_empty() && self.disconnected.is_empty()
    }
}

/// Latest known descriptor set, replaced wholesale on every enumeration.
///
/// Owns the internal/public path mapping: a device keeps its public path for
/// as long as it stays enumerated, and public paths are never handed to a
/// different device.
pub struct DescriptorRegistry {
    entries: Vec<RegistryEntry>,
    last_public: u64,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_public: 0,
        }
    }

    /// Replace the known device set with a fresh enumeration snapshot.
    pub fn set_descriptors(&mut self, descriptors: Vec<DescriptorApiLevel>) -> EnumerationDiff {
        let mut diff = EnumerationDiff::default();
        let mut next: Vec<RegistryEntry> = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            if next.iter().any(|e| e.internal == descriptor.path) {
                warn!(path = %descriptor.path, "duplicate path in enumeration, keeping first");
                continue;
            }

            let public = match self.resolve_internal(&descriptor.path) {
                Some(existing) => existing.public.clone(),
                None => {
                    diff.connected.push(descriptor.path.clone());
                    self.next_public()
                }
            };

            let mut metadata = descriptor.metadata;
            for key in RESERVED_DESCRIPTOR_KEYS {
                metadata.remove(key);
            }

            next.push(RegistryEntry {
                internal: descriptor.path,
                public,
                metadata,
            });
        }

        diff.disconnected = self
            .entries
            .iter()
            .filter(|old| !next.iter().any(|e| e.internal == old.internal))
            .map(|old| old.internal.clone())
            .collect();

        if !diff.is_empty() {
            debug!(
                connected = diff.connected.len(),
                disconnected = diff.disconnected.len(),
                "enumeration changed"
            );
        }

        self.entries = next;
        diff
    }

    fn next_public(&mut self) -> PathPublic {
        self.last_public = self.last_public.saturating_add(1);
        PathPublic(self.last_public.to_string())
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn resolve_public(&self, public: &PathPublic) -> Option<&RegistryEntry> {
        self.entries.iter().find(|e| &e.public == public)
    }

    pub fn resolve_internal(&self, internal: &PathInternal) -> Option<&RegistryEntry> {
        self.entries.iter().find(|e| &e.internal == internal)
    }

    pub fn contains(&self, internal: &PathInternal) -> bool {
        self.resolve_internal(internal).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DescriptorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
