//! Build settings arbitration.
//!
//! [`BuildSystemManager`] sits between the editor-facing layer and one build backend
//! (reached through [`keel_bsp::BuildServerAdapter`]). It answers "which compiler arguments
//! does this file use" with bounded latency: slow answers are replaced by fallback settings
//! and re-announced once the real answer arrives. Build graph queries are memoized in
//! [`AsyncCache`]s and invalidated when the backend reports target changes.

pub mod adjust;
mod cache;
mod delegate;
mod fallback;
mod graph;
mod main_files;
mod manager;
mod source_files;

pub use cache::{AsyncCache, ComputeAbandoned};
pub use delegate::{BuildSystemManagerDelegate, BuildTargetsChangedListener, EditorConnection};
pub use fallback::fallback_build_settings;
pub use graph::{BuildTargetGraph, BuildTargetInfo};
pub use main_files::{
    path_standardizer, select_main_file, MainFilesProvider, NoPathStandardization,
    PathStandardizer, StripPrivatePrefix,
};
pub use manager::{
    BuildServerSpec, BuildSettingsOptions, BuildSystemManager, ListenerId, ManagerState,
    TargetsChangedCause,
};
pub use source_files::SourceFilesAndDirectories;
