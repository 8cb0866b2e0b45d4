use keel_build_model::{pseudo_path, FileBuildSettings, Language};
use keel_config::FallbackConfig;
use url::Url;

/// Generic settings for `uri` when no backend answer is available.
///
/// The result is marked as fallback; callers that know no better answer will ever arrive
/// clear the flag.
pub fn fallback_build_settings(
    uri: &Url,
    language: Language,
    config: &FallbackConfig,
) -> FileBuildSettings {
    let mut arguments = Vec::new();
    if language.is_clang_family() {
        let flags = if language.is_cxx() {
            &config.cxx_flags
        } else {
            &config.c_flags
        };
        arguments.extend(flags.iter().cloned());
        if let Some(sdk) = &config.sdk {
            arguments.push("-isysroot".to_owned());
            arguments.push(sdk.display().to_string());
        }
        if let Some(flag) = language.clang_language_flag() {
            arguments.push(format!("-x{flag}"));
        }
    } else {
        arguments.extend(config.swift_flags.iter().cloned());
        if let Some(sdk) = &config.sdk {
            arguments.push("-sdk".to_owned());
            arguments.push(sdk.display().to_string());
        }
    }
    arguments.push(pseudo_path(uri));

    FileBuildSettings::new(arguments, None)
        .with_language(language)
        .marked_fallback(true)
}
