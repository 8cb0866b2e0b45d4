use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Source languages Keel brokers build settings for.
///
/// Serialized with the LSP language identifiers (`c`, `cpp`, `objective-c`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Language {
    C,
    Cpp,
    ObjectiveC,
    ObjectiveCpp,
    Swift,
}

impl Language {
    /// Parses an LSP language identifier. Unknown identifiers yield `None`.
    pub fn from_language_id(id: &str) -> Option<Self> {
        match id {
            "c" => Some(Self::C),
            "cpp" | "c++" => Some(Self::Cpp),
            "objective-c" | "objc" => Some(Self::ObjectiveC),
            "objective-cpp" | "objective-c++" | "objcpp" => Some(Self::ObjectiveCpp),
            "swift" => Some(Self::Swift),
            _ => None,
        }
    }

    pub fn language_id(self) -> &'static str {
        match self {
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::ObjectiveC => "objective-c",
            Self::ObjectiveCpp => "objective-cpp",
            Self::Swift => "swift",
        }
    }

    /// Infers a language from a file extension (without the leading dot).
    ///
    /// Plain `.h` headers are treated as C; callers that know the including file's
    /// language should prefer that instead (see [`Language::is_ambiguous_header_extension`]).
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "c" | "h" => Some(Self::C),
            "cpp" | "cc" | "cxx" | "c++" | "cp" | "ii" | "hpp" | "hh" | "hxx" | "h++" | "ipp"
            | "inl" => Some(Self::Cpp),
            "m" => Some(Self::ObjectiveC),
            "mm" => Some(Self::ObjectiveCpp),
            "swift" => Some(Self::Swift),
            _ => None,
        }
    }

    /// Infers a language from the last path segment of `uri`.
    ///
    /// Works for non-file schemes too (e.g. `untitled:scratch.cpp`).
    pub fn infer_from_uri(uri: &Url) -> Option<Self> {
        extension_of(uri).and_then(Self::from_extension)
    }

    /// `.h` headers are shared by every C-family language.
    pub fn is_ambiguous_header_extension(extension: &str) -> bool {
        extension == "h"
    }

    /// Swift files carry their own build settings; every other language may be a
    /// header-like file that borrows settings from a main file.
    pub fn is_self_compilable(self) -> bool {
        matches!(self, Self::Swift)
    }

    pub fn is_clang_family(self) -> bool {
        !matches!(self, Self::Swift)
    }

    /// The value passed to clang's `-x` flag, if this is a clang-family language.
    pub fn clang_language_flag(self) -> Option<&'static str> {
        match self {
            Self::C => Some("c"),
            Self::Cpp => Some("c++"),
            Self::ObjectiveC => Some("objective-c"),
            Self::ObjectiveCpp => Some("objective-c++"),
            Self::Swift => None,
        }
    }

    /// Whether the language is a C++ dialect (selects C++ default flags).
    pub fn is_cxx(self) -> bool {
        matches!(self, Self::Cpp | Self::ObjectiveCpp)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.language_id())
    }
}

pub(crate) fn extension_of(uri: &Url) -> Option<&str> {
    let last = uri.path().rsplit('/').next()?;
    let (stem, extension) = last.rsplit_once('.')?;
    if stem.is_empty() || extension.is_empty() {
        return None;
    }
    Some(extension)
}
