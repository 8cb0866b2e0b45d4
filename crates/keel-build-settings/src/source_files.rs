use std::collections::{BTreeMap, BTreeSet};

use keel_build_model::{
    BuildTargetIdentifier, Language, SourceFileInfo, SourceItemKind, SourceKitSourceItemKind,
    SourcesItem,
};
use url::Url;

use crate::BuildTargetGraph;

/// Snapshot of every source file and source directory the backend reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceFilesAndDirectories {
    files: BTreeMap<Url, SourceFileInfo>,
    directories: BTreeMap<Url, SourceFileInfo>,
}

impl SourceFilesAndDirectories {
    /// Builds the snapshot from the sources of the targets in `graph`. Items for targets
    /// the graph does not know are skipped.
    pub fn new(graph: &BuildTargetGraph, items: Vec<SourcesItem>) -> Self {
        let mut snapshot = Self::default();
        for item in items {
            let Some(info) = graph.get(&item.target) else {
                tracing::error!(
                    target = "keel.build_settings",
                    build_target = %item.target,
                    "sources reported for an unknown build target"
                );
                continue;
            };
            let target = &info.target;

            for source in item.sources {
                let data = source.source_kit_data().unwrap_or_default();
                let is_source_kind =
                    matches!(data.kind, None | Some(SourceKitSourceItemKind::Source));
                let language = data.language();
                let info = SourceFileInfo {
                    targets_to_output_path: BTreeMap::from([(
                        target.id.clone(),
                        data.output_path,
                    )]),
                    is_part_of_root_project: !target.is_dependency(),
                    may_contain_tests: target.is_test(),
                    is_buildable: target.is_buildable() && is_source_kind,
                    copy_destinations: data
                        .copy_destinations
                        .unwrap_or_default()
                        .into_iter()
                        .collect(),
                    language,
                };
                let map = match source.kind {
                    SourceItemKind::File => &mut snapshot.files,
                    SourceItemKind::Directory => &mut snapshot.directories,
                };
                let existing = map.remove(&source.uri);
                map.insert(source.uri, info.merging(existing));
            }
        }
        snapshot
    }

    /// Files listed explicitly by some target. Directories are not expanded.
    pub fn source_files(&self, include_non_buildable: bool) -> BTreeMap<Url, SourceFileInfo> {
        self.files
            .iter()
            .filter(|(_, info)| include_non_buildable || info.is_buildable)
            .map(|(uri, info)| (uri.clone(), info.clone()))
            .collect()
    }

    pub fn buildable_source_files(&self) -> BTreeSet<Url> {
        self.files
            .iter()
            .filter(|(_, info)| info.is_buildable)
            .map(|(uri, _)| uri.clone())
            .collect()
    }

    pub fn directories(&self) -> impl Iterator<Item = (&Url, &SourceFileInfo)> {
        self.directories.iter()
    }

    /// Everything known about `uri`, either as a listed file or through the source
    /// directories containing it.
    pub fn info(&self, uri: &Url) -> Option<SourceFileInfo> {
        let mut result = self.files.get(uri).cloned();
        for (directory, info) in &self.directories {
            if is_descendant(uri, directory) {
                result = Some(match result {
                    Some(existing) => existing.merging(Some(info.clone())),
                    None => info.clone(),
                });
            }
        }
        result
    }

    pub fn is_known_source(&self, uri: &Url) -> bool {
        self.files.contains_key(uri)
            || self
                .directories
                .keys()
                .any(|directory| is_descendant(uri, directory))
    }

    pub fn targets_for(&self, uri: &Url) -> BTreeSet<BuildTargetIdentifier> {
        self.info(uri)
            .map(|info| info.targets().cloned().collect())
            .unwrap_or_default()
    }

    /// The target whose settings are used for `uri` when the caller names none: the
    /// smallest identifier among its owning targets.
    pub fn canonical_target(&self, uri: &Url) -> Option<BuildTargetIdentifier> {
        self.targets_for(uri).into_iter().next()
    }

    /// Language the backend reported for `uri`, if any.
    pub fn language(&self, uri: &Url) -> Option<Language> {
        self.info(uri).and_then(|info| info.language)
    }

    /// Output paths of all files in `target`, sorted and deduplicated.
    pub fn output_paths(&self, target: &BuildTargetIdentifier) -> Vec<String> {
        self.files
            .values()
            .filter_map(|info| info.targets_to_output_path.get(target).cloned().flatten())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Maps every copy destination back to the source file it was copied from.
    pub fn copied_file_map(&self) -> BTreeMap<Url, Url> {
        self.files
            .iter()
            .flat_map(|(uri, info)| {
                info.copy_destinations
                    .iter()
                    .map(move |destination| (destination.clone(), uri.clone()))
            })
            .collect()
    }

    /// Known source files in the same directory as `uri` (excluding `uri`) whose language
    /// is `language`.
    pub fn siblings(&self, uri: &Url, language: Language) -> Vec<Url> {
        let Some(parent) = parent_of(uri) else {
            return Vec::new();
        };
        self.files
            .iter()
            .filter(|(candidate, info)| {
                *candidate != uri
                    && info.is_buildable
                    && parent_of(candidate).as_deref() == Some(parent.as_str())
                    && info
                        .language
                        .or_else(|| Language::infer_from_uri(candidate))
                        == Some(language)
            })
            .map(|(candidate, _)| candidate.clone())
            .collect()
    }
}

fn is_descendant(uri: &Url, directory: &Url) -> bool {
    let directory = directory.as_str().trim_end_matches('/');
    uri.as_str()
        .strip_prefix(directory)
        .is_some_and(|rest| rest.starts_with('/'))
}

fn parent_of(uri: &Url) -> Option<String> {
    let (parent, _) = uri.as_str().rsplit_once('/')?;
    Some(parent.to_owned())
}
