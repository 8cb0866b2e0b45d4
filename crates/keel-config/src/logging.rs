use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriter, MakeWriterExt};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
#[schemars(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A simple level (`info`, `debug`, ...) or a full `EnvFilter` directive string such
    /// as `info,keel.bsp=trace`.
    pub level: String,

    /// Emit logs as JSON lines.
    pub json: bool,

    /// Write logs to stderr.
    pub stderr: bool,

    /// Append logs to the given file as well. If the file cannot be opened, file logging is
    /// disabled while other sinks stay active.
    #[schemars(with = "Option<String>")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: true,
            file: None,
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective filter: the configured level merged with `RUST_LOG`, if set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

struct SharedFileMakeWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl<'a> MakeWriter<'a> for SharedFileMakeWriter {
    type Writer = SharedFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileWriter {
            file: Arc::clone(&self.file),
        }
    }
}

struct SharedFileWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl Write for SharedFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.lock() {
            Ok(mut file) => file.write(buf),
            Err(poisoned) => poisoned.into_inner().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock() {
            Ok(mut file) => file.flush(),
            Err(poisoned) => poisoned.into_inner().flush(),
        }
    }
}

static TRACING_INIT: Once = Once::new();

/// Installs the global `tracing` subscriber.
///
/// Safe to call multiple times; only the first call has an effect. Returns `false` when a
/// subscriber was already installed (by an earlier call or by someone else).
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let mut installed = false;
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();

        let file = config
            .file
            .as_ref()
            .and_then(|path| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .ok()
            })
            .map(|file| Arc::new(Mutex::new(file)));

        let make_writer = match (config.stderr, file) {
            (true, Some(file)) => {
                BoxMakeWriter::new(io::stderr.and(SharedFileMakeWriter { file }))
            }
            (true, None) => BoxMakeWriter::new(io::stderr),
            (false, Some(file)) => BoxMakeWriter::new(SharedFileMakeWriter { file }),
            (false, None) => BoxMakeWriter::new(io::sink),
        };

        let registry = tracing_subscriber::registry().with(filter);
        installed = if config.json {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(make_writer)
                        .with_ansi(false),
                )
                .try_init()
                .is_ok()
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(make_writer)
                        .with_ansi(false),
                )
                .try_init()
                .is_ok()
        };
    });
    installed
}
