//! The local keyspace mirror.
//!
//! A `Tree` is a hierarchical projection of store keys, keyed by the escaped path segments of
//! each key below the layout root (`items` → item → member). It is built from a full snapshot
//! and then kept current by applying watch events strictly in revision order. Every patch is
//! checked against the prior state it implies; a mismatch means the event stream was not gap
//! free and the mirror must be discarded.

use std::collections::BTreeMap;

use shardkeeper_core::keyspace::Layout;

use crate::store::{Event, EventKind, KeyValue, Revision};

/// An error applying a snapshot or patch to a tree.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("inconsistent revision applying {kind:?} of {key} at revision {revision}: {detail}")]
    InconsistentRevision {
        key: String,
        kind: EventKind,
        revision: Revision,
        detail: String,
    },
    #[error("key {0} is outside of the mirrored key space")]
    ForeignKey(String),
}

/// A node of the tree, optionally holding the value of the key at its path.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Node {
    kv: Option<KeyValue>,
    children: BTreeMap<String, Node>,
}

impl Node {
    /// The value of the key at this node's path, if the key exists.
    pub fn kv(&self) -> Option<&KeyValue> {
        self.kv.as_ref()
    }

    /// Get the child with the given escaped segment.
    pub fn child(&self, segment: &str) -> Option<&Node> {
        self.children.get(segment)
    }

    /// Iterate over all children in segment order.
    pub fn children(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.children.iter().map(|(segment, node)| (segment.as_str(), node))
    }

    fn is_empty(&self) -> bool {
        self.kv.is_none() && self.children.is_empty()
    }
}

/// A mirror of the keys below a layout root as of some store revision.
#[derive(Clone, Debug, PartialEq)]
pub struct Tree {
    layout: Layout,
    revision: Revision,
    root: Node,
}

impl Tree {
    /// Create an empty tree at revision 0.
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            revision: 0,
            root: Node::default(),
        }
    }

    /// Build a tree from a full listing of keys taken at the given revision.
    pub fn from_snapshot(layout: Layout, kvs: Vec<KeyValue>, revision: Revision) -> Result<Self, PatchError> {
        let mut tree = Self::new(layout);
        tree.revision = revision;
        for kv in kvs {
            if kv.mod_revision > revision {
                return Err(inconsistent(&kv.key, EventKind::Put, kv.mod_revision, "listed key is newer than its snapshot"));
            }
            let segments = tree.segments(&kv.key)?;
            if tree.lookup(&segments).and_then(Node::kv).is_some() {
                return Err(inconsistent(&kv.key, EventKind::Put, kv.mod_revision, "key listed more than once"));
            }
            tree.insert(segments, kv);
        }
        Ok(tree)
    }

    /// The revision of the store which this tree reflects.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Get the value of the given key.
    pub fn get(&self, key: &str) -> Option<&KeyValue> {
        self.node(key).and_then(Node::kv)
    }

    /// Get the node at the path of the given key, which may be a directory without a value.
    pub fn node(&self, key: &str) -> Option<&Node> {
        let segments = self.layout.segments(key)?;
        self.lookup(&segments)
    }

    /// Apply a single watch event.
    ///
    /// On error the tree is left untouched.
    pub fn apply_patch(&mut self, event: &Event) -> Result<(), PatchError> {
        let (key, kind, revision) = (event.kv.key.as_str(), event.kind, event.revision);
        if revision < self.revision {
            return Err(inconsistent(key, kind, revision, &format!("event precedes tree revision {}", self.revision)));
        }
        let segments = self.segments(key)?;
        let existing = self.lookup(&segments).and_then(Node::kv);

        match kind {
            EventKind::Put => {
                if event.kv.mod_revision != revision {
                    return Err(inconsistent(key, kind, revision, "value mod revision differs from event revision"));
                }
                let creating = event.kv.create_revision == event.kv.mod_revision;
                match existing {
                    Some(_) if creating => return Err(inconsistent(key, kind, revision, "created key already exists")),
                    None if !creating => return Err(inconsistent(key, kind, revision, "modified key does not exist")),
                    Some(prev) if prev.create_revision != event.kv.create_revision => {
                        return Err(inconsistent(key, kind, revision, "modified key has a different create revision"))
                    }
                    Some(prev) if prev.mod_revision >= revision => {
                        return Err(inconsistent(key, kind, revision, "modified key is already at or beyond the event revision"))
                    }
                    _ => (),
                }
                self.insert(segments, event.kv.clone());
            }
            EventKind::Delete => {
                match existing {
                    None => return Err(inconsistent(key, kind, revision, "deleted key does not exist")),
                    Some(prev) if prev.mod_revision != event.kv.mod_revision => {
                        return Err(inconsistent(key, kind, revision, "deleted key revision differs from the mirror"))
                    }
                    Some(_) => (),
                }
                remove(&mut self.root, &segments);
            }
        }
        self.revision = revision;
        Ok(())
    }

    fn segments(&self, key: &str) -> Result<Vec<String>, PatchError> {
        self.layout
            .segments(key)
            .map(|segments| segments.into_iter().map(String::from).collect())
            .ok_or_else(|| PatchError::ForeignKey(key.to_string()))
    }

    fn lookup<S: AsRef<str>>(&self, segments: &[S]) -> Option<&Node> {
        segments.iter().try_fold(&self.root, |node, segment| node.children.get(segment.as_ref()))
    }

    fn insert(&mut self, segments: Vec<String>, kv: KeyValue) {
        let node = segments
            .into_iter()
            .fold(&mut self.root, |node, segment| node.children.entry(segment).or_default());
        node.kv = Some(kv);
    }
}

/// Remove the value at the given path, pruning any nodes left empty.
fn remove(node: &mut Node, segments: &[String]) {
    if let Some((first, rest)) = segments.split_first() {
        if let Some(child) = node.children.get_mut(first) {
            if rest.is_empty() {
                child.kv = None;
            } else {
                remove(child, rest);
            }
            if child.is_empty() {
                node.children.remove(first);
            }
        }
    }
}

fn inconsistent(key: &str, kind: EventKind, revision: Revision, detail: &str) -> PatchError {
    PatchError::InconsistentRevision {
        key: key.to_string(),
        kind,
        revision,
        detail: detail.to_string(),
    }
}
