//! Service index negotiated at connect time.
//!
//! The server assigns each namespace, service and method name a small integer so
//! binary call envelopes carry three `u16`s instead of three strings. Names are
//! numbered per category in sorted order starting at 0, which makes the table
//! deterministic for a given set of services.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// One category of the index (namespaces, services or methods).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameTable {
    by_name: HashMap<String, u16>,
    by_index: Vec<String>,
}

impl NameTable {
    fn from_names<I>(names: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = String>,
    {
        let sorted: BTreeSet<String> = names.into_iter().collect();
        if sorted.len() > usize::from(u16::MAX) + 1 {
            return Err(ProtocolError::InvalidHandshake(format!(
                "{} names exceed the 16-bit index space",
                sorted.len()
            )));
        }
        let mut table = NameTable::default();
        for (i, name) in sorted.into_iter().enumerate() {
            table.by_name.insert(name.clone(), i as u16);
            table.by_index.push(name);
        }
        Ok(table)
    }

    /// Index assigned to `name`.
    pub fn index_of(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    /// Name assigned to `index`.
    pub fn name_of(&self, index: u16) -> Option<&str> {
        self.by_index.get(usize::from(index)).map(String::as_str)
    }

    /// Number of names in this category.
    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    /// Returns true if the category is empty.
    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    fn forward_map(&self) -> BTreeMap<String, u16> {
        self.by_name.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    fn reverse_map(&self) -> BTreeMap<String, String> {
        self.by_index
            .iter()
            .enumerate()
            .map(|(i, name)| (i.to_string(), name.clone()))
            .collect()
    }

    fn from_maps(
        kind: &str,
        forward: BTreeMap<String, u16>,
        reverse: BTreeMap<String, String>,
    ) -> Result<Self, ProtocolError> {
        let mut by_index = vec![None; forward.len()];
        for (name, index) in &forward {
            let slot = by_index.get_mut(usize::from(*index)).ok_or_else(|| {
                ProtocolError::InvalidHandshake(format!(
                    "{kind} index {index} out of range for {} names",
                    forward.len()
                ))
            })?;
            if slot.replace(name.clone()).is_some() {
                return Err(ProtocolError::InvalidHandshake(format!(
                    "{kind} index {index} assigned twice"
                )));
            }
        }
        let by_index: Vec<String> = by_index.into_iter().flatten().collect();
        for (key, name) in &reverse {
            let consistent = key
                .parse::<usize>()
                .ok()
                .and_then(|i| by_index.get(i))
                .is_some_and(|n| n == name);
            if !consistent {
                return Err(ProtocolError::InvalidHandshake(format!(
                    "{kind} reverse entry {key} -> {name} disagrees with forward table"
                )));
            }
        }
        Ok(NameTable {
            by_name: forward.into_iter().collect(),
            by_index,
        })
    }
}

/// Wire shape of the handshake: three forward maps then three reverse maps.
#[derive(Debug, Serialize, Deserialize)]
struct HandshakeTables(
    BTreeMap<String, u16>,
    BTreeMap<String, u16>,
    BTreeMap<String, u16>,
    BTreeMap<String, String>,
    BTreeMap<String, String>,
    BTreeMap<String, String>,
);

/// Bidirectional name/index mapping for namespaces, services and methods.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceIndex {
    namespaces: NameTable,
    services: NameTable,
    methods: NameTable,
}

/// Identifies one remotely callable method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodPath {
    /// Namespace the service lives in (for example `sys` or `user`).
    pub namespace: String,
    /// Service name.
    pub service: String,
    /// Method name.
    pub method: String,
}

impl MethodPath {
    /// Creates a method path.
    pub fn new(
        namespace: impl Into<String>,
        service: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            service: service.into(),
            method: method.into(),
        }
    }
}

impl ServiceIndex {
    /// Builds the index for the given set of callable methods.
    pub fn from_methods<'a, I>(methods: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = &'a MethodPath>,
    {
        let mut namespaces = Vec::new();
        let mut services = Vec::new();
        let mut names = Vec::new();
        for path in methods {
            namespaces.push(path.namespace.clone());
            services.push(path.service.clone());
            names.push(path.method.clone());
        }
        Ok(Self {
            namespaces: NameTable::from_names(namespaces)?,
            services: NameTable::from_names(services)?,
            methods: NameTable::from_names(names)?,
        })
    }

    /// Namespace table.
    pub fn namespaces(&self) -> &NameTable {
        &self.namespaces
    }

    /// Service table.
    pub fn services(&self) -> &NameTable {
        &self.services
    }

    /// Method table.
    pub fn methods(&self) -> &NameTable {
        &self.methods
    }

    /// Resolves names to the `(namespace, service, method)` index triple.
    pub fn encode_path(
        &self,
        namespace: &str,
        service: &str,
        method: &str,
    ) -> Result<(u16, u16, u16), ProtocolError> {
        let lookup = |table: &NameTable, kind: &'static str, name: &str| {
            table.index_of(name).ok_or_else(|| ProtocolError::UnknownService {
                kind,
                name: name.to_string(),
            })
        };
        Ok((
            lookup(&self.namespaces, "namespace", namespace)?,
            lookup(&self.services, "service", service)?,
            lookup(&self.methods, "method", method)?,
        ))
    }

    /// Resolves an index triple back to names.
    pub fn decode_path(&self, ns: u16, svc: u16, method: u16) -> Result<MethodPath, ProtocolError> {
        let lookup = |table: &NameTable, kind: &'static str, index: u16| {
            table
                .name_of(index)
                .map(str::to_string)
                .ok_or(ProtocolError::UnknownIndex { kind, index })
        };
        Ok(MethodPath {
            namespace: lookup(&self.namespaces, "namespace", ns)?,
            service: lookup(&self.services, "service", svc)?,
            method: lookup(&self.methods, "method", method)?,
        })
    }

    /// Serializes the index into the JSON handshake payload.
    pub fn to_handshake(&self) -> Result<Vec<u8>, ProtocolError> {
        let tables = HandshakeTables(
            self.namespaces.forward_map(),
            self.services.forward_map(),
            self.methods.forward_map(),
            self.namespaces.reverse_map(),
            self.services.reverse_map(),
            self.methods.reverse_map(),
        );
        serde_json::to_vec(&tables).map_err(|e| ProtocolError::InvalidHandshake(e.to_string()))
    }

    /// Parses and validates a JSON handshake payload.
    pub fn from_handshake(payload: &[u8]) -> Result<Self, ProtocolError> {
        let HandshakeTables(ns, svc, method, ns_rev, svc_rev, method_rev) =
            serde_json::from_slice(payload)
                .map_err(|e| ProtocolError::InvalidHandshake(e.to_string()))?;
        Ok(Self {
            namespaces: NameTable::from_maps("namespace", ns, ns_rev)?,
            services: NameTable::from_maps("service", svc, svc_rev)?,
            methods: NameTable::from_maps("method", method, method_rev)?,
        })
    }
}
