use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Opaque build target identifier, stable for the lifetime of one backend session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildTargetIdentifier {
    pub uri: String,
}

impl BuildTargetIdentifier {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

impl fmt::Display for BuildTargetIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

/// Free-form target tag; the well-known values are associated constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildTargetTag(pub String);

impl BuildTargetTag {
    pub const TEST: &'static str = "test";
    pub const DEPENDENCY: &'static str = "dependency";
    pub const NOT_BUILDABLE: &'static str = "not-buildable";
    pub const LIBRARY: &'static str = "library";
    pub const APPLICATION: &'static str = "application";

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildTarget {
    pub id: BuildTargetIdentifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_directory: Option<Url>,
    #[serde(default)]
    pub tags: Vec<BuildTargetTag>,
    #[serde(default)]
    pub language_ids: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<BuildTargetIdentifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl BuildTarget {
    pub const SOURCE_KIT_DATA_KIND: &'static str = "sourceKit";

    /// Creates a target with no tags, languages or backend payload.
    pub fn new(id: BuildTargetIdentifier, dependencies: Vec<BuildTargetIdentifier>) -> Self {
        Self {
            id,
            display_name: None,
            base_directory: None,
            tags: Vec::new(),
            language_ids: Vec::new(),
            dependencies,
            data_kind: None,
            data: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(BuildTargetTag::new).collect();
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.as_str() == tag)
    }

    pub fn is_test(&self) -> bool {
        self.has_tag(BuildTargetTag::TEST)
    }

    pub fn is_dependency(&self) -> bool {
        self.has_tag(BuildTargetTag::DEPENDENCY)
    }

    pub fn is_buildable(&self) -> bool {
        !self.has_tag(BuildTargetTag::NOT_BUILDABLE)
    }

    /// Decodes the `sourceKit` payload (toolchain reference), if present.
    pub fn source_kit_data(&self) -> Option<SourceKitBuildTarget> {
        if self.data_kind.as_deref() != Some(Self::SOURCE_KIT_DATA_KIND) {
            return None;
        }
        self.data
            .clone()
            .and_then(|data| serde_json::from_value(data).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceKitBuildTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolchain: Option<Url>,
}
