//! Shared build-settings model types used across Keel crates.
//!
//! The wire types follow the Build Server Protocol shape (camelCase JSON) with the
//! `sourceKit` extensions for compiler options, source item metadata and the initialize
//! response data.

mod error;
mod language;
pub mod protocol;
mod settings;
mod source_file_info;
mod sources;
mod target;

pub use error::ResponseError;
pub use language::Language;
pub use settings::{pseudo_path, FileBuildSettings};
pub use source_file_info::SourceFileInfo;
pub use sources::{
    SourceItem, SourceItemKind, SourceKitSourceItemData, SourceKitSourceItemKind, SourcesItem,
};
pub use target::{BuildTarget, BuildTargetIdentifier, BuildTargetTag, SourceKitBuildTarget};
