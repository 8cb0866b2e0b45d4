use std::path::Path;

use serde::Deserialize;

pub const ENV_BSP_PROGRAM: &str = "KEEL_BSP_PROGRAM";
pub const ENV_BSP_ARGS: &str = "KEEL_BSP_ARGS";

/// How to launch an external build server.
///
/// Usually read from a BSP connection file (`.bsp/<name>.json`) in the workspace root, with
/// `KEEL_BSP_PROGRAM` / `KEEL_BSP_ARGS` overrides applied on top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BspConnectionConfig {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub languages: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ConnectionFile {
    #[serde(default)]
    name: Option<String>,
    argv: Vec<String>,
    #[serde(default)]
    languages: Vec<String>,
}

impl BspConnectionConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        Self {
            name: program.clone(),
            program,
            args,
            languages: Vec::new(),
        }
    }

    /// Discovers the build server for `workspace_root`.
    ///
    /// Discovery sources, in order:
    /// 1. `.bsp/*.json` connection files (the first one by file name with a non-empty `argv`)
    /// 2. `KEEL_BSP_PROGRAM` / `KEEL_BSP_ARGS` environment variables (override)
    pub fn discover(workspace_root: &Path) -> Option<Self> {
        Self::discover_with_env(workspace_root, |key| std::env::var(key).ok())
    }

    /// Like [`BspConnectionConfig::discover`] with an explicit environment lookup.
    pub fn discover_with_env(
        workspace_root: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Option<Self> {
        let mut config = discover_from_dot_bsp(workspace_root)
            .unwrap_or_else(|| Self::new(String::new(), Vec::new()));

        if let Some(program) = env(ENV_BSP_PROGRAM) {
            let program = program.trim();
            if !program.is_empty() {
                config.program = program.to_owned();
                if config.name.is_empty() {
                    config.name = config.program.clone();
                }
            }
        }
        if let Some(args_raw) = env(ENV_BSP_ARGS) {
            let args_raw = args_raw.trim();
            if !args_raw.is_empty() {
                config.args = parse_args_env(args_raw);
            }
        }

        (!config.program.trim().is_empty()).then_some(config)
    }
}

/// Reads `.bsp/*.json` in file name order and returns the first usable connection.
pub fn discover_from_dot_bsp(workspace_root: &Path) -> Option<BspConnectionConfig> {
    let dir = workspace_root.join(".bsp");
    let entries = std::fs::read_dir(&dir).ok()?;

    let mut files: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    for path in files {
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                tracing::debug!(target = "keel.bsp", path = %path.display(), error = %err, "failed to read BSP connection file");
                continue;
            }
        };
        let file: ConnectionFile = match serde_json::from_str(&text) {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!(target = "keel.bsp", path = %path.display(), error = %err, "ignoring malformed BSP connection file");
                continue;
            }
        };
        let mut argv = file.argv.into_iter();
        let Some(program) = argv.next().filter(|program| !program.trim().is_empty()) else {
            continue;
        };
        let name = file
            .name
            .or_else(|| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| program.clone());
        return Some(BspConnectionConfig {
            name,
            program,
            args: argv.collect(),
            languages: file.languages,
        });
    }
    None
}

/// Parses `KEEL_BSP_ARGS`: either a JSON string array or whitespace separated words with
/// single/double quote grouping (quotes are removed, escapes are not interpreted).
fn parse_args_env(args_raw: &str) -> Vec<String> {
    let args_raw = args_raw.trim();
    if args_raw.is_empty() {
        return Vec::new();
    }
    if args_raw.starts_with('[') {
        serde_json::from_str::<Vec<String>>(args_raw)
            .unwrap_or_else(|_| split_args_whitespace(args_raw))
    } else {
        split_args_whitespace(args_raw)
    }
}

fn split_args_whitespace(args_raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in args_raw.chars() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => current.push(ch),
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        args.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}
