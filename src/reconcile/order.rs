use crate::entity::{Entity, EntityRef};
use std::collections::{HashMap, HashSet};

/// Write order for one set of creates and updates.
#[derive(Debug, Default)]
pub struct WritePlan {
    /// Relation-less copies of entities caught in a dependency cycle,
    /// written before everything else
    pub placeholders: Vec<Entity>,
    /// Topological levels; every relation inside the set points to an
    /// earlier level (or to a placeholder)
    pub levels: Vec<Vec<Entity>>,
    /// Full versions of the placeholder entities, written last
    pub backfill: Vec<Entity>,
}

impl WritePlan {
    /// Order `writes` so relation targets are written before the entities
    /// that point at them.
    ///
    /// `dependencies` lists, per entity, the relation targets it points at.
    /// Targets outside `writes` are assumed to exist already.
    pub fn build(writes: Vec<Entity>, dependencies: &HashMap<EntityRef, Vec<EntityRef>>) -> Self {
        let index: HashMap<EntityRef, usize> = writes
            .iter()
            .enumerate()
            .map(|(i, e)| (e.entity_ref(), i))
            .collect();

        let n = writes.len();
        let mut indegree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, entity) in writes.iter().enumerate() {
            let Some(targets) = dependencies.get(&entity.entity_ref()) else {
                continue;
            };
            let unique: HashSet<usize> = targets
                .iter()
                .filter_map(|t| index.get(t).copied())
                .filter(|&j| j != i)
                .collect();
            indegree[i] = unique.len();
            for j in unique {
                dependents[j].push(i);
            }
        }

        let mut placed = vec![false; n];
        let mut level_indices: Vec<Vec<usize>> = Vec::new();
        let mut frontier: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for &i in &frontier {
                placed[i] = true;
                for &k in &dependents[i] {
                    indegree[k] -= 1;
                    if indegree[k] == 0 {
                        next.push(k);
                    }
                }
            }
            next.sort_unstable();
            level_indices.push(std::mem::replace(&mut frontier, next));
        }

        let mut slots: Vec<Option<Entity>> = writes.into_iter().map(Some).collect();
        let mut plan = WritePlan::default();

        // Whatever Kahn could not place sits on or behind a cycle
        for (i, slot) in slots.iter_mut().enumerate() {
            if !placed[i] {
                if let Some(entity) = slot.take() {
                    plan.placeholders.push(entity.placeholder());
                    plan.backfill.push(entity);
                }
            }
        }
        for indices in level_indices {
            let level: Vec<Entity> = indices.into_iter().filter_map(|i| slots[i].take()).collect();
            if !level.is_empty() {
                plan.levels.push(level);
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.placeholders.is_empty() && self.levels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::RelationTarget;

    fn service(id: &str, depends_on: &[&str]) -> Entity {
        let mut e = Entity::new(id, "service");
        if !depends_on.is_empty() {
            e.relations.insert(
                "dependsOn".to_string(),
                RelationTarget::Many(depends_on.iter().map(|s| s.to_string()).collect()),
            );
        }
        e
    }

    fn deps(entities: &[Entity]) -> HashMap<EntityRef, Vec<EntityRef>> {
        entities
            .iter()
            .map(|e| {
                let targets = e
                    .relations
                    .values()
                    .flat_map(|t| t.identifiers())
                    .map(|id| EntityRef::new("service", id))
                    .collect();
                (e.entity_ref(), targets)
            })
            .collect()
    }

    fn ids(entities: &[Entity]) -> Vec<&str> {
        entities.iter().map(|e| e.identifier.as_str()).collect()
    }

    #[test]
    fn test_targets_come_first() {
        let writes = vec![service("web", &["api"]), service("api", &["db"]), service("db", &[])];
        let dependencies = deps(&writes);
        let plan = WritePlan::build(writes, &dependencies);

        assert!(plan.placeholders.is_empty());
        let levels: Vec<Vec<&str>> = plan.levels.iter().map(|l| ids(l)).collect();
        assert_eq!(levels, vec![vec!["db"], vec!["api"], vec!["web"]]);
    }

    #[test]
    fn test_independent_entities_share_a_level() {
        let writes = vec![service("a", &[]), service("b", &[]), service("c", &["a", "b"])];
        let dependencies = deps(&writes);
        let plan = WritePlan::build(writes, &dependencies);
        assert_eq!(plan.levels.len(), 2);
        assert_eq!(ids(&plan.levels[0]), vec!["a", "b"]);
    }

    #[test]
    fn test_cycle_is_broken_with_placeholders() {
        let writes = vec![
            service("a", &["b"]),
            service("b", &["a"]),
            service("c", &["a"]),
            service("d", &[]),
        ];
        let dependencies = deps(&writes);
        let plan = WritePlan::build(writes, &dependencies);

        assert_eq!(ids(&plan.placeholders), vec!["a", "b", "c"]);
        assert!(plan.placeholders.iter().all(|e| e.relations.is_empty()));
        assert_eq!(ids(&plan.backfill), vec!["a", "b", "c"]);
        assert!(plan.backfill.iter().all(|e| !e.relations.is_empty()));
        assert_eq!(plan.levels.len(), 1);
        assert_eq!(ids(&plan.levels[0]), vec!["d"]);
    }

    #[test]
    fn test_self_relation_is_not_a_cycle() {
        let writes = vec![service("a", &["a"])];
        let dependencies = deps(&writes);
        let plan = WritePlan::build(writes, &dependencies);
        assert!(plan.placeholders.is_empty());
        assert_eq!(plan.levels.len(), 1);
    }
}
