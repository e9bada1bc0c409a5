//! A decoded view of items, members & assignments as of a single tree revision.

use shardkeeper_core::keyspace::unescape;
use shardkeeper_core::models::{AssignmentValue, ItemSpec, MemberSpec};

use crate::store::Revision;
use crate::tree::{Node, Tree};

/// A live member.
#[derive(Clone, Debug, PartialEq)]
pub struct MemberState {
    pub id: String,
    pub spec: MemberSpec,
    pub mod_revision: Revision,
}

/// A realized assignment of an item to a member.
#[derive(Clone, Debug, PartialEq)]
pub struct AssignmentState {
    pub member: String,
    pub key: String,
    pub value: AssignmentValue,
    pub mod_revision: Revision,
}

/// A declared item along with its realized assignments, ordered by slot.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemState {
    pub id: String,
    pub spec: ItemSpec,
    pub mod_revision: Revision,
    pub assignments: Vec<AssignmentState>,
}

/// Assignments whose item no longer exists.
#[derive(Clone, Debug, PartialEq)]
pub struct OrphanState {
    pub item: String,
    pub assignments: Vec<AssignmentState>,
}

/// The full allocation state of a key space.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterState {
    pub revision: Revision,
    /// Items in key order.
    pub items: Vec<ItemState>,
    /// Members in key order.
    pub members: Vec<MemberState>,
    pub orphans: Vec<OrphanState>,
}

impl ClusterState {
    /// Decode the given tree.
    ///
    /// Malformed values are logged & skipped. An item whose spec can not be decoded is skipped
    /// along with its assignments, so that they are left untouched.
    pub fn from_tree(tree: &Tree) -> Self {
        let layout = tree.layout();
        let mut state = ClusterState {
            revision: tree.revision(),
            ..Default::default()
        };

        if let Some(members) = tree.node(layout.members_prefix().trim_end_matches('/')) {
            for (segment, node) in members.children() {
                let (id, kv) = match (unescape(segment), node.kv()) {
                    (Some(id), Some(kv)) => (id, kv),
                    _ => continue,
                };
                match MemberSpec::decode(&kv.value) {
                    Ok(spec) => state.members.push(MemberState {
                        id,
                        spec,
                        mod_revision: kv.mod_revision,
                    }),
                    Err(err) => tracing::warn!(error = ?err, member = %id, "skipping member with malformed spec"),
                }
            }
        }

        if let Some(items) = tree.node(layout.items_prefix().trim_end_matches('/')) {
            for (segment, node) in items.children() {
                let id = match unescape(segment) {
                    Some(id) => id,
                    None => continue,
                };
                let assignments = decode_assignments(&id, node);
                let kv = match node.kv() {
                    Some(kv) => kv,
                    None => {
                        if !assignments.is_empty() {
                            state.orphans.push(OrphanState { item: id, assignments });
                        }
                        continue;
                    }
                };
                match ItemSpec::decode(&kv.value) {
                    Ok(spec) => state.items.push(ItemState {
                        id,
                        spec,
                        mod_revision: kv.mod_revision,
                        assignments,
                    }),
                    Err(err) => tracing::warn!(error = ?err, item = %id, "skipping item with malformed spec"),
                }
            }
        }
        state
    }

    /// The total number of desired replication slots across all items.
    pub fn desired_slots(&self) -> usize {
        self.items.iter().map(|item| item.spec.desired_replicas()).sum()
    }
}

fn decode_assignments(item: &str, node: &Node) -> Vec<AssignmentState> {
    let mut assignments = vec![];
    for (segment, child) in node.children() {
        let (member, kv) = match (unescape(segment), child.kv()) {
            (Some(member), Some(kv)) => (member, kv),
            _ => continue,
        };
        match AssignmentValue::decode(&kv.value) {
            Ok(value) => assignments.push(AssignmentState {
                member,
                key: kv.key.clone(),
                value,
                mod_revision: kv.mod_revision,
            }),
            Err(err) => tracing::warn!(error = ?err, item, member = %member, "skipping malformed assignment"),
        }
    }
    assignments.sort_by(|a, b| a.value.slot.cmp(&b.value.slot).then_with(|| a.member.cmp(&b.member)));
    assignments
}
