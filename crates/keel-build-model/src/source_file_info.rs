use std::collections::{BTreeMap, BTreeSet};

use url::Url;

use crate::{BuildTargetIdentifier, Language};

/// Everything known about one source file (or source directory) across all targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFileInfo {
    /// Owning targets and the output path each one reported for this file.
    pub targets_to_output_path: BTreeMap<BuildTargetIdentifier, Option<String>>,
    /// At least one owning target is not a dependency of the root project.
    pub is_part_of_root_project: bool,
    /// At least one owning target is a test target.
    pub may_contain_tests: bool,
    /// At least one owning target is buildable and lists this file as a source.
    pub is_buildable: bool,
    pub copy_destinations: BTreeSet<Url>,
    /// Language reported by the backend, if any.
    pub language: Option<Language>,
}

impl SourceFileInfo {
    pub fn targets(&self) -> impl Iterator<Item = &BuildTargetIdentifier> {
        self.targets_to_output_path.keys()
    }

    /// Merges two partial records for the same URI.
    ///
    /// Flags are OR-ed and copy destinations unioned. When two targets report different
    /// output paths for the same file, a known path wins over an unknown one and otherwise
    /// the lexicographically smaller path is kept.
    pub fn merging(mut self, other: Option<SourceFileInfo>) -> SourceFileInfo {
        let Some(other) = other else {
            return self;
        };

        for (target, output_path) in other.targets_to_output_path {
            match self.targets_to_output_path.get_mut(&target) {
                None => {
                    self.targets_to_output_path.insert(target, output_path);
                }
                Some(existing) => {
                    let merged = merge_output_paths(&target, existing.take(), output_path);
                    *existing = merged;
                }
            }
        }

        self.is_part_of_root_project |= other.is_part_of_root_project;
        self.may_contain_tests |= other.may_contain_tests;
        self.is_buildable |= other.is_buildable;
        self.copy_destinations.extend(other.copy_destinations);
        self.language = match (self.language, other.language) {
            (Some(lhs), Some(rhs)) if lhs != rhs => {
                tracing::warn!(
                    target = "keel.build_model",
                    first = %lhs,
                    second = %rhs,
                    "source file reported with conflicting languages; keeping the first"
                );
                Some(lhs)
            }
            (lhs, rhs) => lhs.or(rhs),
        };
        self
    }
}

fn merge_output_paths(
    target: &BuildTargetIdentifier,
    lhs: Option<String>,
    rhs: Option<String>,
) -> Option<String> {
    match (lhs, rhs) {
        (Some(lhs), Some(rhs)) if lhs != rhs => {
            let (kept, dropped) = if lhs <= rhs { (lhs, rhs) } else { (rhs, lhs) };
            tracing::warn!(
                target = "keel.build_model",
                build_target = %target,
                kept = %kept,
                dropped = %dropped,
                "conflicting output paths for the same source file"
            );
            Some(kept)
        }
        (lhs, rhs) => lhs.or(rhs),
    }
}
