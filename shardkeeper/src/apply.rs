//! Batch apply of item declarations.
//!
//! An apply request is a list of declarations, each carrying the revision at which its item was
//! last read. The list is validated as a whole, checked for references to missing underlying
//! resources, and then committed as a sequence of size-bounded conditional transactions. Each
//! transaction is atomic; a failed compare aborts the apply without rolling back transactions
//! which already committed.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use shardkeeper_core::keyspace::{KeyKind, Layout};
use shardkeeper_core::models::{validate_decls, ItemDecl, ItemSpec};

use crate::error::AppError;
use crate::sink::MetricsSink;
use crate::store::{translate_error, Compare, Op, Revision, Store, StoreRef, Txn};

/// A collaborator able to report which underlying resources do not exist.
#[async_trait]
pub trait ResourceValidator: Send + Sync + 'static {
    /// Return the subset of the given resource names which do not exist.
    async fn missing(&self, names: &[String]) -> Result<Vec<String>>;
}

/// A shared handle to a resource validator.
pub type ValidatorRef = Arc<dyn ResourceValidator>;

/// A validator backed by resources registered under the keyspace `resources` prefix.
pub struct RegisteredResources {
    store: StoreRef,
    layout: Layout,
}

impl RegisteredResources {
    pub fn new(store: StoreRef, layout: Layout) -> Self {
        Self { store, layout }
    }
}

#[async_trait]
impl ResourceValidator for RegisteredResources {
    async fn missing(&self, names: &[String]) -> Result<Vec<String>> {
        let (kvs, _) = self
            .store
            .get(&self.layout.resources_prefix())
            .await
            .map_err(translate_error)
            .context("error listing registered resources")?;
        let registered: HashSet<String> = kvs
            .iter()
            .filter_map(|kv| match self.layout.parse(&kv.key) {
                Some(KeyKind::Resource(name)) => Some(name),
                _ => None,
            })
            .collect();
        Ok(names.iter().filter(|name| !registered.contains(*name)).cloned().collect())
    }
}

/// A single validated change of an apply request.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    /// Create the item if `expected_revision` is 0, else update it in place.
    Upsert { expected_revision: Revision, spec: ItemSpec },
    /// Delete the item.
    Delete { id: String, expected_revision: Revision },
    /// The declaration matches the stored item exactly, and is only checked.
    Unchanged { id: String, revision: Revision },
}

impl Change {
    /// The id of the item this change applies to.
    pub fn id(&self) -> &str {
        match self {
            Change::Upsert { spec, .. } => &spec.id,
            Change::Delete { id, .. } | Change::Unchanged { id, .. } => id,
        }
    }

    /// The revision the item must currently be at for this change to apply.
    pub fn expected_revision(&self) -> Revision {
        match self {
            Change::Upsert { expected_revision, .. } | Change::Delete { expected_revision, .. } => *expected_revision,
            Change::Unchanged { revision, .. } => *revision,
        }
    }

    fn compare(&self, layout: &Layout) -> Compare {
        Compare::at(layout.item_key(self.id()), self.expected_revision())
    }

    fn op(&self, layout: &Layout) -> Result<Option<Op>> {
        Ok(match self {
            Change::Upsert { spec, .. } => Some(Op::put(layout.item_key(&spec.id), spec.encode()?)),
            Change::Delete { id, .. } => Some(Op::delete(layout.item_key(id))),
            Change::Unchanged { .. } => None,
        })
    }
}

/// A fully constructed apply request, partitioned into transactions.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApplyRequest {
    pub max_txn_size: usize,
    pub transactions: Vec<Vec<Change>>,
}

/// The outcome of a committed apply request.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ApplyOutcome {
    /// The store revision following the final transaction, or 0 if none were submitted.
    pub revision: Revision,
    /// The number of transactions committed.
    pub transactions: usize,
    /// The number of declarations which matched their stored item exactly.
    pub unchanged: usize,
}

/// The result of an apply call.
#[derive(Clone, Debug, PartialEq)]
pub enum Applied {
    /// The request which would have been submitted.
    DryRun(ApplyRequest),
    Committed(ApplyOutcome),
}

/// Options of an apply call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApplyOptions {
    pub dry_run: bool,
    /// The maximum number of changes per transaction.
    pub max_txn_size: usize,
}

/// Validate & apply the given declarations.
#[tracing::instrument(level = "debug", skip(store, layout, validator, sink, decls), fields(decls = decls.len()), err)]
pub async fn apply(
    store: &dyn Store, layout: &Layout, validator: &dyn ResourceValidator, sink: &dyn MetricsSink, decls: Vec<ItemDecl>, opts: ApplyOptions,
) -> Result<Applied> {
    validate_decls(&decls)?;
    if opts.max_txn_size == 0 || opts.max_txn_size > store.max_txn_ops() {
        return Err(AppError::InvalidInput(format!(
            "max transaction size must be within 1..={}, got {}",
            store.max_txn_ops(),
            opts.max_txn_size
        ))
        .into());
    }

    let mut references: Vec<String> = decls
        .iter()
        .filter(|decl| !decl.delete)
        .flat_map(|decl| decl.spec.references.iter().cloned())
        .collect();
    references.sort_unstable();
    references.dedup();
    if !references.is_empty() {
        let missing = validator.missing(&references).await?;
        if !missing.is_empty() {
            return Err(AppError::MissingResources(missing).into());
        }
    }

    let changes = build_changes(store, layout, decls).await?;
    let request = ApplyRequest {
        max_txn_size: opts.max_txn_size,
        transactions: changes.chunks(opts.max_txn_size).map(|chunk| chunk.to_vec()).collect(),
    };
    if opts.dry_run {
        return Ok(Applied::DryRun(request));
    }
    commit(store, layout, sink, &request).await.map(Applied::Committed)
}

/// Convert declarations to changes, detecting declarations identical to their stored item.
async fn build_changes(store: &dyn Store, layout: &Layout, decls: Vec<ItemDecl>) -> Result<Vec<Change>> {
    let mut changes = Vec::with_capacity(decls.len());
    for decl in decls {
        if decl.delete {
            changes.push(Change::Delete {
                id: decl.spec.id,
                expected_revision: decl.revision,
            });
            continue;
        }
        if decl.revision != 0 {
            let stored = store.get_key(&layout.item_key(&decl.spec.id)).await.map_err(translate_error)?;
            if let Some(kv) = stored {
                if kv.mod_revision == decl.revision && kv.value == decl.spec.encode()? {
                    changes.push(Change::Unchanged {
                        id: decl.spec.id,
                        revision: decl.revision,
                    });
                    continue;
                }
            }
        }
        changes.push(Change::Upsert {
            expected_revision: decl.revision,
            spec: decl.spec,
        });
    }
    Ok(changes)
}

/// Submit each transaction of the given request in order, stopping at the first conflict.
async fn commit(store: &dyn Store, layout: &Layout, sink: &dyn MetricsSink, request: &ApplyRequest) -> Result<ApplyOutcome> {
    let mut outcome = ApplyOutcome::default();
    for (idx, changes) in request.transactions.iter().enumerate() {
        let mut txn = Txn::new();
        for change in changes {
            txn = txn.when(change.compare(layout));
            if let Some(op) = change.op(layout)? {
                txn = txn.then(op);
            }
        }

        let res = store
            .txn(txn)
            .await
            .map_err(translate_error)
            .with_context(|| format!("error submitting apply transaction {} of {}", idx + 1, request.transactions.len()))?;
        if !res.succeeded {
            let change = res.failed_compare.and_then(|offset| changes.get(offset)).or_else(|| changes.first());
            let (id, expected) = change
                .map(|change| (change.id().to_string(), change.expected_revision()))
                .unwrap_or_default();
            tracing::warn!(txn = idx + 1, committed = outcome.transactions, item = %id, expected, "apply aborted on concurrent modification");
            return Err(AppError::ConcurrentModification { id, expected }.into());
        }

        let applied = changes.iter().filter(|change| !matches!(change, Change::Unchanged { .. })).count();
        sink.changes_applied(applied as u64);
        outcome.revision = res.revision;
        outcome.transactions += 1;
        outcome.unchanged += changes.len() - applied;
    }
    tracing::debug!(revision = outcome.revision, transactions = outcome.transactions, "apply committed");
    Ok(outcome)
}

/// List all declared items in the shape accepted by `apply`, along with the store revision of
/// the listing.
pub async fn list_items(store: &dyn Store, layout: &Layout) -> Result<(Vec<ItemDecl>, Revision)> {
    let (kvs, revision) = store
        .get(&layout.items_prefix())
        .await
        .map_err(translate_error)
        .context("error listing items")?;
    let mut decls = vec![];
    for kv in kvs {
        if !matches!(layout.parse(&kv.key), Some(KeyKind::Item(_))) {
            continue;
        }
        let spec = ItemSpec::decode(&kv.value).with_context(|| format!("error decoding item at {}", kv.key))?;
        decls.push(ItemDecl {
            revision: kv.mod_revision,
            delete: false,
            spec,
        });
    }
    Ok((decls, revision))
}
