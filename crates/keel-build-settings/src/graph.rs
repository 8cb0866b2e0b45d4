use std::collections::{BTreeMap, BTreeSet, VecDeque};

use keel_build_model::{BuildTarget, BuildTargetIdentifier};

/// A build target with the graph properties derived from the full target list.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildTargetInfo {
    pub target: BuildTarget,
    /// Longest distance (in dependency edges) from a target nothing depends on.
    pub depth: usize,
    /// Targets that list this target as a dependency.
    pub dependents: BTreeSet<BuildTargetIdentifier>,
}

/// Dependency graph over one snapshot of the backend's targets.
///
/// Built once per target list and never patched; a target change produces a new graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildTargetGraph {
    targets: BTreeMap<BuildTargetIdentifier, BuildTargetInfo>,
}

impl BuildTargetGraph {
    pub fn new(targets: Vec<BuildTarget>) -> Self {
        let mut infos: BTreeMap<BuildTargetIdentifier, BuildTargetInfo> = BTreeMap::new();
        for target in targets {
            if infos.contains_key(&target.id) {
                tracing::warn!(
                    target = "keel.build_settings",
                    build_target = %target.id,
                    "duplicate build target; keeping the first occurrence"
                );
                continue;
            }
            infos.insert(
                target.id.clone(),
                BuildTargetInfo {
                    target,
                    depth: 0,
                    dependents: BTreeSet::new(),
                },
            );
        }

        let edges: Vec<(BuildTargetIdentifier, BuildTargetIdentifier)> = infos
            .values()
            .flat_map(|info| {
                info.target
                    .dependencies
                    .iter()
                    .map(|dependency| (info.target.id.clone(), dependency.clone()))
            })
            .collect();
        for (dependent, dependency) in &edges {
            if let Some(info) = infos.get_mut(dependency) {
                info.dependents.insert(dependent.clone());
            }
        }

        let non_roots: BTreeSet<&BuildTargetIdentifier> =
            edges.iter().map(|(_, dependency)| dependency).collect();
        let mut worklist: VecDeque<(BuildTargetIdentifier, usize)> = infos
            .keys()
            .filter(|id| !non_roots.contains(id))
            .map(|id| (id.clone(), 0))
            .collect();

        // Depths above the target count only occur on cycles.
        let max_depth = infos.len();
        let mut depths: BTreeMap<BuildTargetIdentifier, usize> = BTreeMap::new();
        while let Some((id, depth)) = worklist.pop_front() {
            if depths.get(&id).is_some_and(|known| *known >= depth) {
                continue;
            }
            depths.insert(id.clone(), depth);
            if depth >= max_depth {
                continue;
            }
            let Some(info) = infos.get(&id) else {
                continue;
            };
            for dependency in &info.target.dependencies {
                if !infos.contains_key(dependency) {
                    continue;
                }
                if depths
                    .get(dependency)
                    .map_or(true, |known| *known < depth + 1)
                {
                    worklist.push_back((dependency.clone(), depth + 1));
                }
            }
        }

        for (id, depth) in depths {
            if let Some(info) = infos.get_mut(&id) {
                info.depth = depth;
            }
        }

        Self { targets: infos }
    }

    pub fn get(&self, id: &BuildTargetIdentifier) -> Option<&BuildTargetInfo> {
        self.targets.get(id)
    }

    pub fn contains(&self, id: &BuildTargetIdentifier) -> bool {
        self.targets.contains_key(id)
    }

    pub fn targets(&self) -> impl Iterator<Item = &BuildTargetInfo> {
        self.targets.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &BuildTargetIdentifier> {
        self.targets.keys()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Orders `targets` so that dependencies come before their dependents: descending depth,
    /// ties broken by identifier. Unknown targets sort as depth 0.
    pub fn topological_sort(
        &self,
        targets: impl IntoIterator<Item = BuildTargetIdentifier>,
    ) -> Vec<BuildTargetIdentifier> {
        let mut targets: Vec<_> = targets
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|id| (self.get(&id).map_or(0, |info| info.depth), id))
            .collect();
        targets.sort_by(|(a_depth, a), (b_depth, b)| {
            b_depth.cmp(a_depth).then_with(|| a.cmp(b))
        });
        targets.into_iter().map(|(_, id)| id).collect()
    }

    /// Every target that transitively depends on one of `seeds`. The seeds themselves are
    /// only included when they depend on another seed.
    pub fn targets_depending_on<'a>(
        &self,
        seeds: impl IntoIterator<Item = &'a BuildTargetIdentifier>,
    ) -> BTreeSet<BuildTargetIdentifier> {
        let mut result = BTreeSet::new();
        let mut worklist: Vec<&BuildTargetIdentifier> = seeds.into_iter().collect();
        while let Some(id) = worklist.pop() {
            let Some(info) = self.targets.get(id) else {
                continue;
            };
            for dependent in &info.dependents {
                if result.insert(dependent.clone()) {
                    worklist.push(dependent);
                }
            }
        }
        result
    }
}
