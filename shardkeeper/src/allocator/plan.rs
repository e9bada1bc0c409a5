//! Translation of a solved placement into per-item conditional transactions.

use anyhow::Result;

use shardkeeper_core::keyspace::Layout;
use shardkeeper_core::models::{AssignmentStatus, AssignmentValue};

use crate::allocator::solver::{Demand, Placement, Supply};
use crate::allocator::state::{AssignmentState, ClusterState};
use crate::allocator::PlacementPredicate;
use crate::store::{Compare, Op, Revision, Txn};

/// A new assignment to be created.
#[derive(Clone, Debug, PartialEq)]
pub struct Addition {
    pub member: String,
    /// The mod revision of the member key, which must still hold at commit.
    pub member_revision: Revision,
    pub slot: u32,
}

/// The changes required to bring one item to its solved placement.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemPlan {
    pub item: String,
    /// The mod revision of the item key, or `None` if the item must remain absent.
    pub item_revision: Option<Revision>,
    pub removals: Vec<AssignmentState>,
    /// Retained assignments moving to a new slot.
    pub updates: Vec<(AssignmentState, u32)>,
    pub additions: Vec<Addition>,
}

impl ItemPlan {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.updates.is_empty() && self.additions.is_empty()
    }

    /// The number of assignments which moved between members without changing the item's
    /// replica count.
    pub fn packed(&self) -> usize {
        self.additions.len().min(self.removals.len())
    }

    pub fn ops(&self) -> usize {
        self.removals.len() + self.updates.len() + self.additions.len()
    }

    /// Build the conditional transaction realizing this plan.
    pub fn txn(&self, layout: &Layout, fence: Option<&Compare>) -> Result<Txn> {
        let mut txn = Txn::new();
        if let Some(fence) = fence {
            txn = txn.when(fence.clone());
        }
        let item_key = layout.item_key(&self.item);
        txn = txn.when(match self.item_revision {
            Some(revision) => Compare::at(item_key, revision),
            None => Compare::absent(item_key),
        });

        for removal in self.removals.iter() {
            txn = txn
                .when(Compare::at(&removal.key, removal.mod_revision))
                .then(Op::delete(&removal.key));
        }
        for (assignment, slot) in self.updates.iter() {
            let value = AssignmentValue {
                slot: *slot,
                status: assignment.value.status,
            };
            txn = txn
                .when(Compare::at(&assignment.key, assignment.mod_revision))
                .then(Op::put(&assignment.key, value.encode()?));
        }
        for addition in self.additions.iter() {
            let key = layout.assignment_key(&self.item, &addition.member);
            let value = AssignmentValue {
                slot: addition.slot,
                status: AssignmentStatus::NotReady,
            };
            txn = txn
                .when(Compare::absent(&key))
                .when(Compare::at(layout.member_key(&addition.member), addition.member_revision))
                .then(Op::put(key, value.encode()?));
        }
        Ok(txn)
    }
}

/// Build the placement problem of the given state.
pub fn problem(state: &ClusterState, predicate: &dyn PlacementPredicate) -> (Vec<Demand>, Vec<Supply>) {
    let supplies = state
        .members
        .iter()
        .map(|member| Supply {
            zone: member.spec.zone.clone(),
            limit: member.spec.item_limit as usize,
        })
        .collect();
    let demands = state
        .items
        .iter()
        .map(|item| Demand {
            replicas: item.spec.desired_replicas(),
            current: item
                .assignments
                .iter()
                .filter_map(|assignment| state.members.iter().position(|member| member.id == assignment.member))
                .collect(),
            eligible: state
                .members
                .iter()
                .enumerate()
                .filter(|(_, member)| predicate.is_eligible(item, member))
                .map(|(idx, _)| idx)
                .collect(),
        })
        .collect();
    (demands, supplies)
}

/// Compare the solved placement with realized assignments, producing a plan for every item
/// which requires changes. Orphaned assignments are planned for removal.
pub fn plan(state: &ClusterState, placement: &Placement) -> Vec<ItemPlan> {
    let mut plans = vec![];
    for (idx, item) in state.items.iter().enumerate() {
        let desired: Vec<&str> = placement
            .members
            .get(idx)
            .map(|members| members.iter().map(|member| state.members[*member].id.as_str()).collect())
            .unwrap_or_default();

        let (kept, removals): (Vec<&AssignmentState>, Vec<&AssignmentState>) = item
            .assignments
            .iter()
            .partition(|assignment| desired.contains(&assignment.member.as_str()));

        let updates = kept
            .iter()
            .enumerate()
            .filter(|(slot, assignment)| assignment.value.slot != *slot as u32)
            .map(|(slot, assignment)| ((*assignment).clone(), slot as u32))
            .collect();
        let additions = desired
            .iter()
            .filter(|member| !kept.iter().any(|assignment| assignment.member == **member))
            .enumerate()
            .filter_map(|(offset, member)| {
                let member = state.members.iter().find(|candidate| candidate.id == *member)?;
                Some(Addition {
                    member: member.id.clone(),
                    member_revision: member.mod_revision,
                    slot: (kept.len() + offset) as u32,
                })
            })
            .collect();

        let plan = ItemPlan {
            item: item.id.clone(),
            item_revision: Some(item.mod_revision),
            removals: removals.into_iter().cloned().collect(),
            updates,
            additions,
        };
        if !plan.is_empty() {
            plans.push(plan);
        }
    }

    for orphan in state.orphans.iter() {
        plans.push(ItemPlan {
            item: orphan.item.clone(),
            item_revision: None,
            removals: orphan.assignments.clone(),
            updates: vec![],
            additions: vec![],
        });
    }
    plans
}
