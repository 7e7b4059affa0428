//! Namespace Merger: maintains the unified view of exported capabilities
//! and enforces name uniqueness per the configured conflict strategy.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::ConflictStrategy;
use crate::session::{CapabilityKind, Capabilities};

#[derive(Debug, Clone)]
pub struct NamespaceEntry {
    pub public_name: String,
    pub session_name: String,
    pub original_name: String,
    pub kind: CapabilityKind,
    pub descriptor: Value,
}

/// An immutable, publishable snapshot of the merged namespace. A fresh one
/// is built and swapped in on every rebuild; readers never see a
/// half-updated index across kinds.
#[derive(Debug, Default)]
pub struct NamespaceIndex {
    by_public: IndexMap<(CapabilityKind, String), NamespaceEntry>,
    by_session: HashMap<String, Vec<(CapabilityKind, String)>>,
}

impl NamespaceIndex {
    pub fn resolve(&self, kind: CapabilityKind, public_name: &str) -> Option<&NamespaceEntry> {
        self.by_public.get(&(kind, public_name.to_string()))
    }

    /// Entries of one kind, ordered deterministically by public name.
    pub fn list(&self, kind: CapabilityKind) -> Vec<Value> {
        let mut entries: Vec<&NamespaceEntry> = self
            .by_public
            .values()
            .filter(|e| e.kind == kind)
            .collect();
        entries.sort_by(|a, b| a.public_name.cmp(&b.public_name));
        entries.into_iter().map(|e| e.descriptor.clone()).collect()
    }

    pub fn session_entry_count(&self, session_name: &str) -> usize {
        self.by_session.get(session_name).map(Vec::len).unwrap_or(0)
    }
}

/// Single-writer, many-reader publisher of [`NamespaceIndex`] snapshots.
pub struct Merger {
    strategy: ConflictStrategy,
    sources: Mutex<IndexMap<String, Arc<Capabilities>>>,
    snapshot: ArcSwap<NamespaceIndex>,
}

impl Merger {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self {
            strategy,
            sources: Mutex::new(IndexMap::new()),
            snapshot: ArcSwap::from_pointee(NamespaceIndex::default()),
        }
    }

    pub fn snapshot(&self) -> Arc<NamespaceIndex> {
        self.snapshot.load_full()
    }

    /// Registers (or replaces) one session's declared capabilities and
    /// rebuilds. Returns the names of sessions whose entries were rejected
    /// by the Reject conflict strategy this rebuild, for the caller to mark
    /// Degraded.
    pub fn update_session(&self, session_name: &str, capabilities: Arc<Capabilities>) -> Vec<String> {
        self.sources.lock().insert(session_name.to_string(), capabilities);
        self.rebuild()
    }

    /// Drops a session's entries entirely (on loss/stop) and rebuilds.
    pub fn remove_session(&self, session_name: &str) -> Vec<String> {
        self.sources.lock().remove(session_name);
        self.rebuild()
    }

    fn rebuild(&self) -> Vec<String> {
        let sources = self.sources.lock().clone();
        let (index, rejected) = build_index(&sources, self.strategy);
        self.snapshot.store(Arc::new(index));
        rejected
    }
}

fn build_index(
    sources: &IndexMap<String, Arc<Capabilities>>,
    strategy: ConflictStrategy,
) -> (NamespaceIndex, Vec<String>) {
    let mut session_names: Vec<&String> = sources.keys().collect();
    session_names.sort();

    let mut by_public: IndexMap<(CapabilityKind, String), NamespaceEntry> = IndexMap::new();
    let mut by_session: HashMap<String, Vec<(CapabilityKind, String)>> = HashMap::new();
    // original-name ownership, used by FirstWins/Reject for tie-breaking.
    let mut owners: HashMap<(CapabilityKind, String), String> = HashMap::new();
    let mut rejected_sessions: Vec<String> = Vec::new();

    for kind in [CapabilityKind::Tool, CapabilityKind::Resource, CapabilityKind::Prompt] {
        for &session_name in &session_names {
            let capabilities = &sources[session_name];
            for descriptor in capabilities.kind(kind) {
                let Some(original_name) = original_name_of(kind, descriptor) else {
                    continue;
                };

                let public_name = match strategy {
                    ConflictStrategy::PrefixWithServerName => {
                        Some(build_public_name(kind, session_name, &original_name))
                    }
                    ConflictStrategy::FirstWins => {
                        let key = (kind, original_name.clone());
                        if owners.contains_key(&key) {
                            None
                        } else {
                            owners.insert(key, session_name.clone());
                            Some(original_name.clone())
                        }
                    }
                    ConflictStrategy::Reject => {
                        let key = (kind, original_name.clone());
                        if owners.contains_key(&key) {
                            rejected_sessions.push(session_name.clone());
                            None
                        } else {
                            owners.insert(key, session_name.clone());
                            Some(original_name.clone())
                        }
                    }
                };

                let Some(public_name) = public_name else {
                    continue;
                };

                let descriptor = rewrite_descriptor(kind, descriptor, &public_name);
                let index_key = (kind, public_name.clone());
                by_session
                    .entry(session_name.clone())
                    .or_default()
                    .push(index_key.clone());
                by_public.insert(
                    index_key,
                    NamespaceEntry {
                        public_name,
                        session_name: session_name.clone(),
                        original_name,
                        kind,
                        descriptor,
                    },
                );
            }
        }
    }

    (NamespaceIndex { by_public, by_session }, rejected_sessions)
}

fn original_name_of(kind: CapabilityKind, descriptor: &Value) -> Option<String> {
    let field = match kind {
        CapabilityKind::Tool | CapabilityKind::Prompt => "name",
        CapabilityKind::Resource => "uri",
    };
    descriptor.get(field)?.as_str().map(str::to_string)
}

fn build_public_name(kind: CapabilityKind, session_name: &str, original_name: &str) -> String {
    match kind {
        CapabilityKind::Tool | CapabilityKind::Prompt => format!("{session_name}__{original_name}"),
        CapabilityKind::Resource => prefix_resource_uri(session_name, original_name),
    }
}

fn rewrite_descriptor(kind: CapabilityKind, descriptor: &Value, public_name: &str) -> Value {
    let mut descriptor = descriptor.clone();
    let field = match kind {
        CapabilityKind::Tool | CapabilityKind::Prompt => "name",
        CapabilityKind::Resource => "uri",
    };
    if let Some(obj) = descriptor.as_object_mut() {
        obj.insert(field.to_string(), Value::String(public_name.to_string()));
    }
    descriptor
}

/// Inserts `session_name` as the first path segment after the scheme:
/// `file:///x` → `file:///{session_name}/x`.
pub fn prefix_resource_uri(session_name: &str, uri: &str) -> String {
    match url::Url::parse(uri) {
        Ok(mut parsed) => {
            let path = parsed.path().to_string();
            parsed.set_path(&format!("/{session_name}{path}"));
            parsed.to_string()
        }
        Err(_) => format!("{session_name}/{uri}"),
    }
}

/// Reverses [`prefix_resource_uri`]. Returns `None` if `uri` doesn't carry
/// the expected prefix for `session_name`.
pub fn strip_resource_uri_prefix(session_name: &str, uri: &str) -> Option<String> {
    match url::Url::parse(uri) {
        Ok(mut parsed) => {
            let prefix = format!("/{session_name}");
            let rest = parsed.path().strip_prefix(&prefix)?.to_string();
            parsed.set_path(&rest);
            Some(parsed.to_string())
        }
        Err(_) => uri.strip_prefix(&format!("{session_name}/")).map(str::to_string),
    }
}
