use std::collections::{BTreeMap, BTreeSet};

use tidemark_common::{Error, MigrationKey, Result};
use tracing::debug;

use crate::migrations::{Dependency, Migration};
use crate::state::ProjectState;

/// Dependency graph over a set of migrations, keyed by identity.
///
/// Building the graph resolves `__first__` references and rejects
/// dependencies on migrations that are not in the set. Cycles are reported
/// when ordering.
#[derive(Debug, Clone)]
pub struct MigrationGraph {
    nodes: BTreeMap<MigrationKey, Migration>,
    /// Resolved dependencies of each node.
    parents: BTreeMap<MigrationKey, Vec<MigrationKey>>,
}

impl MigrationGraph {
    pub fn build(migrations: impl IntoIterator<Item = Migration>) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for migration in migrations {
            let key = migration.key.clone();
            if nodes.insert(key.clone(), migration).is_some() {
                return Err(Error::InvalidMigration {
                    migration: key,
                    reason: "defined more than once".into(),
                });
            }
        }

        let mut parents = BTreeMap::new();
        for (key, migration) in &nodes {
            let mut resolved = Vec::new();
            for dependency in migration.dependency_keys()? {
                let target = if dependency.is_first_placeholder() {
                    first_of_app(&nodes, &dependency.app)
                } else if nodes.contains_key(&dependency) {
                    Some(dependency.clone())
                } else {
                    None
                };
                let target = target.ok_or_else(|| Error::MissingDependency {
                    migration: key.clone(),
                    dependency: dependency.clone(),
                })?;
                if !resolved.contains(&target) {
                    resolved.push(target);
                }
            }
            parents.insert(key.clone(), resolved);
        }

        debug!("built migration graph with {} nodes", nodes.len());
        Ok(Self { nodes, parents })
    }

    pub fn get(&self, key: &MigrationKey) -> Option<&Migration> {
        self.nodes.get(key)
    }

    pub fn contains(&self, key: &MigrationKey) -> bool {
        self.nodes.contains_key(key)
    }

    /// Direct, resolved dependencies of `key`.
    pub fn dependencies(&self, key: &MigrationKey) -> &[MigrationKey] {
        self.parents.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every migration, dependencies first. Independent migrations are
    /// ordered by `(app, name)`.
    pub fn ordered(&self) -> Result<Vec<&Migration>> {
        let mut remaining: BTreeMap<&MigrationKey, usize> = self
            .parents
            .iter()
            .map(|(key, parents)| (key, parents.len()))
            .collect();
        let mut children: BTreeMap<&MigrationKey, Vec<&MigrationKey>> = BTreeMap::new();
        for (key, parents) in &self.parents {
            for parent in parents {
                children.entry(parent).or_default().push(key);
            }
        }

        let mut ready: BTreeSet<&MigrationKey> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(key, _)| *key)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(key) = ready.pop_first() {
            remaining.remove(key);
            order.push(&self.nodes[key]);
            for child in children.get(key).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(*child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }

        if !remaining.is_empty() {
            let stuck: BTreeSet<&MigrationKey> = remaining.keys().copied().collect();
            return Err(Error::Cycle(self.find_cycle(&stuck)));
        }
        Ok(order)
    }

    /// Migrations not yet applied, dependencies first.
    ///
    /// With a `target`, only the target and its transitive dependencies are
    /// considered. Fails if the ledger records a migration as applied while
    /// one of its dependencies is not.
    pub fn plan(
        &self,
        applied: &BTreeSet<MigrationKey>,
        target: Option<&MigrationKey>,
    ) -> Result<Vec<&Migration>> {
        let order = self.ordered()?;
        self.check_consistency(applied)?;

        let scope = match target {
            Some(target) => {
                if !self.contains(target) {
                    return Err(Error::NotFound(format!("migration {target}")));
                }
                Some(self.ancestors(target))
            }
            None => None,
        };

        Ok(order
            .into_iter()
            .filter(|m| !applied.contains(&m.key))
            .filter(|m| scope.as_ref().is_none_or(|s| s.contains(&m.key)))
            .collect())
    }

    /// `key` and everything it transitively depends on.
    pub fn ancestors(&self, key: &MigrationKey) -> BTreeSet<MigrationKey> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![key.clone()];
        while let Some(current) = stack.pop() {
            if seen.insert(current.clone()) {
                stack.extend(self.dependencies(&current).iter().cloned());
            }
        }
        seen
    }

    /// Snapshot produced by replaying `applied` migrations in order.
    pub fn state_for(&self, applied: &BTreeSet<MigrationKey>) -> Result<ProjectState> {
        let mut state = ProjectState::new();
        for migration in self.ordered()? {
            if applied.contains(&migration.key) {
                state.replay(migration)?;
            }
        }
        Ok(state)
    }

    /// Snapshot just before `key` is applied, assuming all its ancestors are.
    pub fn state_before(&self, key: &MigrationKey) -> Result<ProjectState> {
        let mut ancestors = self.ancestors(key);
        ancestors.remove(key);
        self.state_for(&ancestors)
    }

    fn check_consistency(&self, applied: &BTreeSet<MigrationKey>) -> Result<()> {
        for key in applied.iter().filter(|k| self.contains(k)) {
            if let Some(missing) = self
                .dependencies(key)
                .iter()
                .find(|dep| !applied.contains(*dep))
            {
                return Err(Error::InconsistentHistory {
                    migration: key.clone(),
                    dependency: missing.clone(),
                });
            }
        }
        Ok(())
    }

    /// A closed path through `stuck`, the nodes Kahn's walk could not free.
    /// Every stuck node has a stuck parent, so following parents from any
    /// of them must revisit a node.
    fn find_cycle(&self, stuck: &BTreeSet<&MigrationKey>) -> Vec<MigrationKey> {
        let Some(&start) = stuck.first() else {
            return Vec::new();
        };
        let mut path: Vec<&MigrationKey> = vec![start];
        loop {
            let current = path[path.len() - 1];
            let Some(next) = self
                .dependencies(current)
                .iter()
                .find(|p| stuck.contains(p))
            else {
                return path.into_iter().cloned().collect();
            };
            if let Some(pos) = path.iter().position(|k| *k == next) {
                let mut cycle: Vec<MigrationKey> = path[pos..].iter().map(|k| (*k).clone()).collect();
                cycle.push(next.clone());
                // Report in dependency order: each node is needed by the one before it.
                cycle.reverse();
                return cycle;
            }
            path.push(next);
        }
    }
}

/// The root migration of `app`: the one with no dependency inside its own
/// app. With several roots the lowest name wins.
fn first_of_app(nodes: &BTreeMap<MigrationKey, Migration>, app: &str) -> Option<MigrationKey> {
    nodes
        .values()
        .filter(|m| m.key.app == app)
        .find(|m| {
            m.dependencies.iter().all(|d| match d {
                Dependency::Migration(k) => k.app != app,
                Dependency::Swappable { .. } => true,
            })
        })
        .map(|m| m.key.clone())
}

/// Convenience form of [`MigrationGraph::plan`]: builds the graph and
/// returns the pending migrations, owned.
pub fn plan(migrations: Vec<Migration>, applied: &BTreeSet<MigrationKey>) -> Result<Vec<Migration>> {
    let graph = MigrationGraph::build(migrations)?;
    Ok(graph.plan(applied, None)?.into_iter().cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(app: &str, name: &str) -> MigrationKey {
        MigrationKey::new(app, name)
    }

    fn m(app: &str, name: &str, deps: &[(&str, &str)]) -> Migration {
        deps.iter()
            .fold(Migration::new(app, name), |m, (a, n)| m.depends_on(key(a, n)))
    }

    fn keys(plan: &[&Migration]) -> Vec<String> {
        plan.iter().map(|m| m.key.to_string()).collect()
    }

    fn sample() -> Vec<Migration> {
        vec![
            m("myapp", "0005", &[("myapp", "0004"), ("auth", "0001")]),
            m("myapp", "0004", &[("myapp", "0001")]),
            m("myapp", "0001", &[("auth", "0001")]),
            m("auth", "0001", &[]),
            m("myapp", "0011", &[("myapp", "0010")]),
            m("myapp", "0010", &[("myapp", "0005")]),
        ]
    }

    #[test]
    fn plan_orders_dependencies_first() {
        let graph = MigrationGraph::build(sample()).unwrap();
        let plan = graph.plan(&BTreeSet::new(), None).unwrap();
        assert_eq!(
            keys(&plan),
            vec![
                "auth.0001",
                "myapp.0001",
                "myapp.0004",
                "myapp.0005",
                "myapp.0010",
                "myapp.0011"
            ]
        );
    }

    #[test]
    fn plan_is_topological_for_every_node() {
        let graph = MigrationGraph::build(sample()).unwrap();
        let plan = graph.plan(&BTreeSet::new(), None).unwrap();
        for (i, migration) in plan.iter().enumerate() {
            for dep in graph.dependencies(&migration.key) {
                let pos = plan.iter().position(|m| &m.key == dep).unwrap();
                assert!(pos < i, "{dep} must precede {}", migration.key);
            }
        }
    }

    #[test]
    fn plan_skips_applied_migrations() {
        let graph = MigrationGraph::build(sample()).unwrap();
        let applied: BTreeSet<_> = [key("auth", "0001"), key("myapp", "0001")].into();
        let plan = graph.plan(&applied, None).unwrap();
        assert_eq!(keys(&plan)[0], "myapp.0004");
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn fully_applied_plan_is_empty() {
        let graph = MigrationGraph::build(sample()).unwrap();
        let applied: BTreeSet<_> = sample().into_iter().map(|m| m.key).collect();
        assert!(graph.plan(&applied, None).unwrap().is_empty());
    }

    #[test]
    fn plan_to_target_limits_to_ancestors() {
        let graph = MigrationGraph::build(sample()).unwrap();
        let plan = graph
            .plan(&BTreeSet::new(), Some(&key("myapp", "0004")))
            .unwrap();
        assert_eq!(keys(&plan), vec!["auth.0001", "myapp.0001", "myapp.0004"]);
    }

    #[test]
    fn unknown_target_is_not_found() {
        let graph = MigrationGraph::build(sample()).unwrap();
        let err = graph
            .plan(&BTreeSet::new(), Some(&key("myapp", "0099")))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn cycle_is_reported() {
        let graph = MigrationGraph::build(vec![
            m("a", "0001", &[("b", "0001")]),
            m("b", "0001", &[("c", "0001")]),
            m("c", "0001", &[("a", "0001")]),
            m("d", "0001", &[]),
        ])
        .unwrap();
        match graph.plan(&BTreeSet::new(), None) {
            Err(Error::Cycle(path)) => {
                assert_eq!(path.len(), 4);
                assert_eq!(path.first(), path.last());
                for key in ["a", "b", "c"] {
                    assert!(path.iter().any(|k| k.app == key));
                }
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let graph = MigrationGraph::build(vec![m("a", "0001", &[("a", "0001")])]).unwrap();
        assert!(matches!(graph.ordered(), Err(Error::Cycle(_))));
    }

    #[test]
    fn missing_dependency_is_reported() {
        let err = MigrationGraph::build(vec![m("myapp", "0005", &[("myapp", "0004")])]).unwrap_err();
        match err {
            Error::MissingDependency {
                migration,
                dependency,
            } => {
                assert_eq!(migration, key("myapp", "0005"));
                assert_eq!(dependency, key("myapp", "0004"));
            }
            other => panic!("expected missing dependency, got {other:?}"),
        }
    }

    #[test]
    fn first_placeholder_resolves_to_app_root() {
        let graph = MigrationGraph::build(vec![
            m("auth", "0002", &[("auth", "0001")]),
            m("auth", "0001", &[]),
            Migration::new("myapp", "0001").depends_on(MigrationKey::first("auth")),
        ])
        .unwrap();
        assert_eq!(
            graph.dependencies(&key("myapp", "0001")),
            &[key("auth", "0001")]
        );
    }

    #[test]
    fn first_placeholder_for_unknown_app_is_missing() {
        let err = MigrationGraph::build(vec![
            Migration::new("myapp", "0001").depends_on(MigrationKey::first("auth")),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::MissingDependency { .. }));
    }

    #[test]
    fn unresolved_swappable_dependency_is_invalid() {
        let err = MigrationGraph::build(vec![
            Migration::new("myapp", "0001").depends_on(Dependency::swappable("AUTH_USER_MODEL")),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::InvalidMigration { .. }));
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let err = MigrationGraph::build(vec![m("a", "0001", &[]), m("a", "0001", &[])]).unwrap_err();
        assert!(matches!(err, Error::InvalidMigration { .. }));
    }

    #[test]
    fn applied_child_of_unapplied_parent_is_inconsistent() {
        let graph = MigrationGraph::build(sample()).unwrap();
        let applied: BTreeSet<_> = [key("auth", "0001"), key("myapp", "0004")].into();
        match graph.plan(&applied, None) {
            Err(Error::InconsistentHistory {
                migration,
                dependency,
            }) => {
                assert_eq!(migration, key("myapp", "0004"));
                assert_eq!(dependency, key("myapp", "0001"));
            }
            other => panic!("expected inconsistent history, got {other:?}"),
        }
    }

    #[test]
    fn convenience_plan_returns_owned_migrations() {
        let pending = plan(sample(), &BTreeSet::new()).unwrap();
        assert_eq!(pending.len(), 6);
        assert_eq!(pending[0].key, key("auth", "0001"));
    }
}
