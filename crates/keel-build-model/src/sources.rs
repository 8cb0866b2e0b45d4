use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::{BuildTargetIdentifier, Language};

/// BSP `SourceItemKind`: `1` for files, `2` for directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SourceItemKind {
    File,
    Directory,
}

impl TryFrom<u8> for SourceItemKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::File),
            2 => Ok(Self::Directory),
            other => Err(format!("unknown source item kind {other}")),
        }
    }
}

impl From<SourceItemKind> for u8 {
    fn from(kind: SourceItemKind) -> Self {
        match kind {
            SourceItemKind::File => 1,
            SourceItemKind::Directory => 2,
        }
    }
}

/// Role of a source item within its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKitSourceItemKind {
    Source,
    Header,
    Doc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceItem {
    pub uri: Url,
    pub kind: SourceItemKind,
    #[serde(default)]
    pub generated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl SourceItem {
    pub const SOURCE_KIT_DATA_KIND: &'static str = "sourceKit";

    pub fn file(uri: Url) -> Self {
        Self {
            uri,
            kind: SourceItemKind::File,
            generated: false,
            data_kind: None,
            data: None,
        }
    }

    pub fn directory(uri: Url) -> Self {
        Self {
            kind: SourceItemKind::Directory,
            ..Self::file(uri)
        }
    }

    pub fn with_source_kit_data(mut self, data: SourceKitSourceItemData) -> Self {
        self.data_kind = Some(Self::SOURCE_KIT_DATA_KIND.to_owned());
        self.data = serde_json::to_value(data).ok();
        self
    }

    /// Decodes the `sourceKit` metadata attached to this item.
    ///
    /// Items without metadata (or with a different `dataKind`) decode to `None`.
    pub fn source_kit_data(&self) -> Option<SourceKitSourceItemData> {
        if self.data_kind.as_deref() != Some(Self::SOURCE_KIT_DATA_KIND) {
            return None;
        }
        match self.data.clone().map(serde_json::from_value) {
            Some(Ok(data)) => Some(data),
            Some(Err(err)) => {
                tracing::error!(
                    target = "keel.build_model",
                    uri = %self.uri,
                    error = %err,
                    "malformed sourceKit source item data"
                );
                None
            }
            None => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceKitSourceItemData {
    /// LSP language identifier; unknown identifiers are kept verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SourceKitSourceItemKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_destinations: Option<Vec<Url>>,
}

impl SourceKitSourceItemData {
    pub fn language(&self) -> Option<Language> {
        self.language.as_deref().and_then(Language::from_language_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourcesItem {
    pub target: BuildTargetIdentifier,
    #[serde(default)]
    pub sources: Vec<SourceItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<Vec<Url>>,
}
