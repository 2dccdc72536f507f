use crate::entity::{Entity, EntityRef};
use std::collections::{BTreeSet, HashMap};

/// Operations needed to move the catalog from `prior` to a new snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityDiff {
    pub to_create: Vec<Entity>,
    /// Entities present on both sides whose mapped fields changed
    pub to_update: Vec<Entity>,
    pub to_delete: Vec<EntityRef>,
}

impl EntityDiff {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    /// Creates and updates, in snapshot order.
    pub fn writes(&self) -> impl Iterator<Item = &Entity> {
        self.to_create.iter().chain(self.to_update.iter())
    }
}

/// Compare a snapshot against the entities currently owned by the same scope.
///
/// Entities are matched by (blueprint, identifier). `to_delete` stays empty
/// unless `delete_dependent` is set; it is sorted so repeated runs issue the
/// same calls.
pub fn compute_diff(prior: &[Entity], snapshot: &[Entity], delete_dependent: bool) -> EntityDiff {
    let prior_by_ref: HashMap<EntityRef, &Entity> =
        prior.iter().map(|e| (e.entity_ref(), e)).collect();

    let mut diff = EntityDiff::default();
    let mut seen = BTreeSet::new();

    for entity in snapshot {
        let key = entity.entity_ref();
        match prior_by_ref.get(&key) {
            None => diff.to_create.push(entity.clone()),
            Some(current) if entity.has_mapped_changes(current) => {
                diff.to_update.push(entity.clone())
            }
            Some(_) => {}
        }
        seen.insert(key);
    }

    if delete_dependent {
        let mut stale: Vec<EntityRef> = prior_by_ref
            .into_keys()
            .filter(|key| !seen.contains(key))
            .collect();
        stale.sort();
        diff.to_delete = stale;
    }

    diff
}
