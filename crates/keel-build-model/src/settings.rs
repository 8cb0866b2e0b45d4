use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::language::extension_of;
use crate::Language;

/// Build settings for a single file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileBuildSettings {
    pub compiler_arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Synthesized defaults rather than a backend-confirmed answer.
    #[serde(default)]
    pub is_fallback: bool,
}

impl FileBuildSettings {
    pub fn new(compiler_arguments: Vec<String>, working_directory: Option<String>) -> Self {
        Self {
            compiler_arguments,
            working_directory,
            language: None,
            data: None,
            is_fallback: false,
        }
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = Some(language);
        self
    }

    pub fn marked_fallback(mut self, is_fallback: bool) -> Self {
        self.is_fallback = is_fallback;
        self
    }

    /// Rewrites settings computed for `original_file` so they apply to `new_file`.
    ///
    /// The last argument equal to the original file's path is replaced by the new file's
    /// path. For clang-family languages a `-x<language>` flag is put in front of all other
    /// arguments so a header is parsed in the right dialect even though its extension may
    /// be ambiguous; the flag has to precede a possible `-c <file>` for clang to honor it.
    /// Patching twice with the same pair yields the same arguments.
    pub fn patching(&self, new_file: &Url, original_file: &Url) -> Self {
        let mut arguments = self.compiler_arguments.clone();
        let original_path = pseudo_path(original_file);
        if let Some(index) = arguments.iter().rposition(|arg| *arg == original_path) {
            arguments[index] = pseudo_path(new_file);
        }

        let language = self.language_for_patched_file(new_file);
        if let Some(flag) = language.and_then(Language::clang_language_flag) {
            let flag = format!("-x{flag}");
            if arguments.first() != Some(&flag) {
                arguments.insert(0, flag);
            }
        }

        Self {
            compiler_arguments: arguments,
            working_directory: self.working_directory.clone(),
            language: language.or(self.language),
            data: self.data.clone(),
            is_fallback: self.is_fallback,
        }
    }

    fn language_for_patched_file(&self, new_file: &Url) -> Option<Language> {
        match extension_of(new_file) {
            Some(ext) if Language::is_ambiguous_header_extension(ext) => self
                .language
                .filter(|language| language.is_clang_family())
                .or_else(|| Language::from_extension(ext)),
            Some(ext) => Language::from_extension(ext).or(self.language),
            None => self.language,
        }
    }
}

/// The path a compiler sees for `uri`: a filesystem path for `file:` URIs, the URI text
/// otherwise.
pub fn pseudo_path(uri: &Url) -> String {
    if uri.scheme() == "file" {
        if let Ok(path) = uri.to_file_path() {
            return path.to_string_lossy().into_owned();
        }
    }
    uri.to_string()
}
