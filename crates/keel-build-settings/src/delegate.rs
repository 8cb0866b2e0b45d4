use std::collections::BTreeSet;

use async_trait::async_trait;
use keel_build_model::protocol::{FileSystemWatcher, MessageType};
use keel_build_model::BuildTargetIdentifier;
use url::Url;

/// Receives the manager's change notifications. Calls are delivered one at a time, in
/// the order they were produced.
#[async_trait]
pub trait BuildSystemManagerDelegate: Send + Sync {
    /// Settings of these files may differ from what was last returned.
    async fn file_build_settings_changed(&self, changed_files: BTreeSet<Url>);

    /// Dependencies of these files were rebuilt or changed. An empty set means every
    /// watched file may be affected.
    async fn files_dependencies_updated(&self, changed_files: BTreeSet<Url>);

    /// `None` means any target may have changed.
    async fn build_targets_changed(&self, changed_targets: Option<BTreeSet<BuildTargetIdentifier>>);
}

/// Additional subscriber to target changes.
#[async_trait]
pub trait BuildTargetsChangedListener: Send + Sync {
    async fn build_targets_changed(&self, changed_targets: Option<BTreeSet<BuildTargetIdentifier>>);
}

/// Channel back to the editor, usable before a delegate is installed.
#[async_trait]
pub trait EditorConnection: Send + Sync {
    /// Resolves once the editor finished initialization; nothing is sent before that.
    async fn wait_until_initialized(&self);

    fn supports_work_done_progress(&self) -> bool {
        false
    }

    async fn watch_files(&self, watchers: Vec<FileSystemWatcher>);

    /// Shows `message` to the user.
    async fn log_message(&self, kind: MessageType, message: String);
}
