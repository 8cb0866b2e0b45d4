use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use keel_build_model::Language;
use keel_config::PathStandardization;
use url::Url;

/// Knows which compilable files include a given file (typically backed by the index).
#[async_trait]
pub trait MainFilesProvider: Send + Sync {
    /// Files that directly or transitively include `uri`. May contain `uri` itself.
    async fn main_files_containing(&self, uri: &Url) -> BTreeSet<Url>;
}

/// Maps a symlink-resolved path to the spelling the build graph uses.
pub trait PathStandardizer: Send + Sync {
    /// The standardized form of `uri`, or `None` if it is already standard.
    fn standardize(&self, uri: &Url) -> Option<Url>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoPathStandardization;

impl PathStandardizer for NoPathStandardization {
    fn standardize(&self, _uri: &Url) -> Option<Url> {
        None
    }
}

/// Undoes macOS's `/private` aliasing of `/var`, `/tmp` and `/etc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StripPrivatePrefix;

impl PathStandardizer for StripPrivatePrefix {
    fn standardize(&self, uri: &Url) -> Option<Url> {
        if uri.scheme() != "file" {
            return None;
        }
        let path = uri.path();
        let stripped = ["/private/var/", "/private/tmp/", "/private/etc/"]
            .iter()
            .find(|prefix| path.starts_with(*prefix))
            .map(|_| &path["/private".len()..])?;
        let mut standardized = uri.clone();
        standardized.set_path(stripped);
        Some(standardized)
    }
}

pub fn path_standardizer(policy: PathStandardization) -> Arc<dyn PathStandardizer> {
    match policy {
        PathStandardization::None => Arc::new(NoPathStandardization),
        PathStandardization::StripPrivatePrefix => Arc::new(StripPrivatePrefix),
    }
}

/// Picks the file whose settings `document` borrows: the document itself when it is one of
/// its own main files, otherwise the smallest candidate. No candidates means the document
/// stands alone.
pub fn select_main_file(document: &Url, candidates: &BTreeSet<Url>) -> Url {
    if candidates.contains(document) {
        return document.clone();
    }
    candidates
        .iter()
        .min_by(|a, b| a.as_str().cmp(b.as_str()))
        .cloned()
        .unwrap_or_else(|| document.clone())
}

/// Main files of `document` with standardized spellings substituted where only the
/// standardized form is a known source file. `document` itself is never substituted.
pub(crate) async fn main_files_for(
    document: &Url,
    language: Option<Language>,
    provider: Option<&dyn MainFilesProvider>,
    standardizer: &dyn PathStandardizer,
    is_known_source: impl Fn(&Url) -> bool,
) -> BTreeSet<Url> {
    if language.is_some_and(Language::is_self_compilable) {
        return BTreeSet::from([document.clone()]);
    }
    let Some(provider) = provider else {
        return BTreeSet::from([document.clone()]);
    };

    provider
        .main_files_containing(document)
        .await
        .into_iter()
        .map(|candidate| {
            if candidate == *document || is_known_source(&candidate) {
                return candidate;
            }
            match standardizer.standardize(&candidate) {
                Some(standardized) if is_known_source(&standardized) => standardized,
                _ => candidate,
            }
        })
        .collect()
}
