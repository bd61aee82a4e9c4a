// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    env,
    io::IsTerminal,
    sync::{Mutex, Once},
};

use bon::Builder;
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, de};
use smart_default::SmartDefault;
use snafu::{ResultExt, Snafu};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter,
    layer::{Layered, SubscriberExt},
};

/// Deserializes a string value, using `Default::default()` if the string is
/// empty.
///
/// # Errors
/// Returns an error if deserialization fails.
pub fn empty_string_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        Ok(T::default())
    } else {
        T::deserialize(de::value::StrDeserializer::new(&s)).map_err(|e: de::value::Error| {
            de::Error::custom(format!("invalid value, expect empty string, err: {e}"))
        })
    }
}

/// The default directory name for log files when file logging is enabled.
pub const DEFAULT_LOGGING_DIR: &str = "logs";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LoggingError {
    #[snafu(display("Invalid log level filter {filter:?}"))]
    InvalidFilter {
        filter: String,
        source: filter::ParseError,
    },

    #[snafu(display("Failed to create rolling log file in {dir}"))]
    RollingAppender {
        dir:    String,
        source: tracing_appender::rolling::InitError,
    },

    #[snafu(display("Failed to install global subscriber"))]
    SetGlobalDefault {
        source: tracing::subscriber::SetGlobalDefaultError,
    },

    #[snafu(display("Failed to bridge log records"))]
    LogBridge { source: tracing_log::log::SetLoggerError },
}

/// Configuration options for the logging system.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for log files.
    ///
    /// When non-empty, an hourly rotated log and an error-only log are
    /// written there. If empty, only stdout logging is used.
    #[default = ""]
    #[builder(default)]
    pub dir: String,

    /// Level filter such as "info" or "info,roost_server=debug". If None,
    /// falls back to `RUST_LOG`, then "info".
    pub level: Option<String>,

    /// Output format for log messages.
    #[serde(default, deserialize_with = "empty_string_as_default")]
    #[builder(default)]
    pub log_format: LogFormat,

    /// Maximum number of rotated log files to retain (720 = 30 days of
    /// hourly logs).
    #[default = 720]
    #[builder(default = 720)]
    pub max_log_files: usize,

    /// Whether to output logs to stdout in addition to files.
    #[default = true]
    #[builder(default = true)]
    pub append_stdout: bool,
}

/// Available log output formats.
#[derive(
    Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event, with the current span and span list.
    #[display("json")]
    Json,

    /// Human-readable text format.
    ///
    /// ```text
    /// 2024-01-01T12:00:00.123Z  INFO conn{peer=127.0.0.1:50412}: roost_server::memcache: Connection opened
    /// ```
    #[default]
    #[display("text")]
    Text,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Initialize logging specifically designed for unit tests.
///
/// # Environment Variables
///
/// * `UNITTEST_LOG_DIR` - Directory for test logs (default:
///   "/tmp/__unittest_logs")
/// * `UNITTEST_LOG_LEVEL` - Log level filter (default: "debug")
///
/// Safe to call from many tests; only the first call installs anything.
pub fn init_default_ut_logging() {
    static START: Once = Once::new();

    START.call_once(|| {
        let dir =
            env::var("UNITTEST_LOG_DIR").unwrap_or_else(|_| "/tmp/__unittest_logs".to_string());
        let level = env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let opts = LoggingOptions {
            dir: dir.clone(),
            level: Some(level),
            ..Default::default()
        };

        match init_global_logging("unittest", &opts) {
            Ok(guards) => {
                if let Ok(mut g) = GLOBAL_UT_LOG_GUARD.lock() {
                    *g = Some(guards);
                }
                tracing::info!("logs dir = {}", dir);
            }
            Err(e) => eprintln!("unit test logging disabled: {e}"),
        }
    });
}

/// Keeps the unit test writer threads alive for the whole test binary.
static GLOBAL_UT_LOG_GUARD: Lazy<Mutex<Option<Vec<WorkerGuard>>>> = Lazy::new(|| Mutex::new(None));

/// Default log level filter when no specific configuration is provided.
const DEFAULT_LOG_TARGETS: &str = "info";

/// The registry with the level filter applied first.
type FilteredRegistry = Layered<filter::Targets, Registry>;

type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

/// Installs the global subscriber.
///
/// Layers, depending on `opts`:
///
/// - **Stdout Layer**: if `append_stdout` is true
/// - **File Layer**: `<app_name>.*` files with hourly rotation, if `dir` is
///   set
/// - **Error File Layer**: `<app_name>-err.*`, errors only, if `dir` is set
///
/// Returns the `WorkerGuard`s that keep the non-blocking writers running;
/// hold them for the lifetime of the process. Only the first call in a
/// process installs anything; later calls return no guards.
///
/// # Errors
/// Returns an error for an invalid level filter, an unusable log directory,
/// or when another global subscriber is already installed.
pub fn init_global_logging(
    app_name: &str,
    opts: &LoggingOptions,
) -> Result<Vec<WorkerGuard>, LoggingError> {
    static START: Once = Once::new();
    let mut result = Ok(Vec::new());
    START.call_once(|| result = install(app_name, opts));
    result
}

fn install(app_name: &str, opts: &LoggingOptions) -> Result<Vec<WorkerGuard>, LoggingError> {
    let mut guards = vec![];

    let filter_str = opts
        .level
        .clone()
        .or_else(|| env::var(EnvFilter::DEFAULT_ENV).ok())
        .unwrap_or_else(|| DEFAULT_LOG_TARGETS.to_string());
    let filter = filter_str
        .parse::<filter::Targets>()
        .context(InvalidFilterSnafu { filter: filter_str })?;

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if opts.append_stdout {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        guards.push(guard);
        let ansi = std::io::stdout().is_terminal();
        layers.push(if opts.log_format == LogFormat::Json {
            tracing_subscriber::fmt::Layer::new()
                .json()
                .with_writer(writer)
                .with_ansi(ansi)
                .with_current_span(true)
                .with_span_list(true)
                .boxed()
        } else {
            tracing_subscriber::fmt::Layer::new()
                .with_writer(writer)
                .with_ansi(ansi)
                .boxed()
        });
    }

    if !opts.dir.is_empty() {
        for (prefix, errors_only) in [(app_name.to_string(), false), (format!("{app_name}-err"), true)]
        {
            let rolling_appender = RollingFileAppender::builder()
                .rotation(Rotation::HOURLY)
                .filename_prefix(prefix)
                .max_log_files(opts.max_log_files)
                .build(&opts.dir)
                .context(RollingAppenderSnafu {
                    dir: opts.dir.clone(),
                })?;
            let (writer, guard) = tracing_appender::non_blocking(rolling_appender);
            guards.push(guard);

            let layer: BoxedLayer = if opts.log_format == LogFormat::Json {
                tracing_subscriber::fmt::Layer::new()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_current_span(true)
                    .with_span_list(true)
                    .boxed()
            } else {
                tracing_subscriber::fmt::Layer::new()
                    .with_writer(writer)
                    .with_ansi(false)
                    .boxed()
            };
            layers.push(if errors_only {
                layer.with_filter(filter::LevelFilter::ERROR).boxed()
            } else {
                layer
            });
        }
    }

    let subscriber = Registry::default().with(filter).with(layers);
    tracing::subscriber::set_global_default(subscriber).context(SetGlobalDefaultSnafu)?;
    LogTracer::init().context(LogBridgeSnafu)?;

    Ok(guards)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_default_options() {
        let opts = LoggingOptions::default();
        assert!(opts.dir.is_empty());
        assert_eq!(opts.max_log_files, 720);
        assert!(opts.append_stdout);
        assert_eq!(opts.log_format, LogFormat::Text);
        assert_eq!(opts, LoggingOptions::builder().build());
    }

    #[test_case("json", LogFormat::Json ; "json")]
    #[test_case("TEXT", LogFormat::Text ; "upper case text")]
    fn test_log_format_from_str(input: &str, expected: LogFormat) {
        assert_eq!(input.parse::<LogFormat>().unwrap(), expected);
    }

    #[test]
    fn test_empty_log_format_deserializes_to_default() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(deserialize_with = "empty_string_as_default")]
            format: LogFormat,
        }
        let wrapper: Wrapper =
            serde::Deserialize::deserialize(de::value::MapDeserializer::<_, de::value::Error>::new(
                [("format", "")].into_iter(),
            ))
            .unwrap();
        assert_eq!(wrapper.format, LogFormat::Text);
    }

    #[test]
    fn test_invalid_level_is_rejected_before_install() {
        let opts = LoggingOptions::builder().level("roost=loud".to_string()).build();
        let err = install("roost-test", &opts).unwrap_err();
        assert!(matches!(err, LoggingError::InvalidFilter { .. }), "{err}");
    }
}
