//! Provider configuration parsing and environment-driven startup.
//!
//! ## Grammar
//!
//! A provider configuration string is a comma-separated list of entries, each
//! `Name:Keywords:Level:Args`. Fields after `Name` are optional:
//!
//! * `Keywords` is a hexadecimal `u64` (an optional `0x` prefix is accepted).
//!   When absent the entry matches every keyword.
//! * `Level` is a decimal `u32`, clamped into [`EventLevel`]. When absent the
//!   entry uses the most verbose level.
//! * `Args` is passed through verbatim to the provider callback. It cannot
//!   contain `:` or `,`.
//!
//! An entry with an empty name fails the whole parse; a single trailing comma
//! is tolerated.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::sampler::SAMPLE_PROFILER_PROVIDER_NAME;
use crate::types::{
    EventLevel, DEFAULT_BUFFER_SIZE_MB, DEFAULT_OUTPUT_PATH, DEFAULT_RUNTIME_KEYWORDS,
    DEFAULT_RUNTIME_PRIVATE_KEYWORDS,
};

/// Name of the built-in public runtime provider.
pub const RUNTIME_PROVIDER_NAME: &str = "Tracemux-Runtime";

/// Name of the built-in private runtime provider.
pub const RUNTIME_PRIVATE_PROVIDER_NAME: &str = "Tracemux-RuntimePrivate";

/// Name of the provider that carries rundown events while a session drains.
pub const RUNTIME_RUNDOWN_PROVIDER_NAME: &str = "Tracemux-RuntimeRundown";

/// Keyword mask meaning "no filtering by keyword".
///
/// This is what an entry gets when its `Keywords` field is absent. Note that it
/// is a sentinel for "nothing was supplied", not a literal mask the caller typed.
pub const ALL_KEYWORDS: u64 = u64::MAX;

/// Environment variable that turns the startup session on (`1` or `true`).
pub const ENV_ENABLE: &str = "TRACEMUX_ENABLE";
/// Environment variable holding the provider configuration string.
pub const ENV_CONFIG: &str = "TRACEMUX_CONFIG";
/// Environment variable holding the output path; `{pid}` expands to the process id.
pub const ENV_OUTPUT_PATH: &str = "TRACEMUX_OUTPUT_PATH";
/// Environment variable holding the buffer budget in megabytes.
pub const ENV_BUFFER_MB: &str = "TRACEMUX_BUFFER_MB";
/// Environment variable selecting streaming (`FileStream`) output.
pub const ENV_STREAMING: &str = "TRACEMUX_STREAMING";

/// One provider entry inside a session's filter list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name the entry applies to.
    pub name: String,
    /// Keyword mask; [`ALL_KEYWORDS`] when no filtering was requested.
    pub keywords: u64,
    /// Maximum level admitted for this provider.
    pub level: EventLevel,
    /// Opaque argument string forwarded to the provider callback.
    pub filter_data: Option<String>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, keywords: u64, level: EventLevel) -> Self {
        ProviderConfig {
            name: name.into(),
            keywords,
            level,
            filter_data: None,
        }
    }

    pub fn with_filter_data(mut self, filter_data: impl Into<String>) -> Self {
        self.filter_data = Some(filter_data.into());
        self
    }
}

/// Parses a comma-separated provider configuration string.
///
/// Returns every entry or nothing: a single malformed entry fails the parse so
/// a session is never enabled with half of what the caller asked for.
pub fn parse_provider_config(spec: &str) -> Result<Vec<ProviderConfig>, EngineError> {
    let mut configs = Vec::new();
    let segments: Vec<&str> = spec.split(',').collect();
    let last = segments.len() - 1;
    for (index, entry) in segments.iter().enumerate() {
        // A trailing comma leaves one empty segment at the end; skip it.
        if entry.is_empty() && index == last && index > 0 {
            continue;
        }
        let mut fields = entry.splitn(4, ':');
        let name = fields.next().unwrap_or("");
        if name.is_empty() {
            return Err(EngineError::InvalidProviderConfig {
                index,
                reason: "empty provider name",
            });
        }
        let keywords = match fields.next() {
            None | Some("") => ALL_KEYWORDS,
            Some(raw) => parse_hex_u64(raw),
        };
        let level = match fields.next() {
            None | Some("") => EventLevel::Verbose,
            Some(raw) => EventLevel::from_u32(raw.parse::<u32>().unwrap_or(0)),
        };
        let filter_data = match fields.next() {
            None | Some("") => None,
            Some(raw) => Some(raw.to_string()),
        };
        configs.push(ProviderConfig {
            name: name.to_string(),
            keywords,
            level,
            filter_data,
        });
    }
    Ok(configs)
}

fn parse_hex_u64(raw: &str) -> u64 {
    let stripped = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    u64::from_str_radix(stripped, 16).unwrap_or(0)
}

/// The provider set used when a session is requested with an empty
/// configuration string: both runtime providers plus the sample profiler.
pub fn default_provider_configs() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig::new(
            RUNTIME_PROVIDER_NAME,
            DEFAULT_RUNTIME_KEYWORDS,
            EventLevel::Verbose,
        ),
        ProviderConfig::new(
            RUNTIME_PRIVATE_PROVIDER_NAME,
            DEFAULT_RUNTIME_PRIVATE_KEYWORDS,
            EventLevel::Verbose,
        ),
        ProviderConfig::new(SAMPLE_PROFILER_PROVIDER_NAME, 0x0, EventLevel::Verbose),
    ]
}

/// Description of the file session the engine opens on its own during
/// [`init`](crate::engine::TraceEngine::init), typically sourced from the
/// `TRACEMUX_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupSession {
    /// Provider configuration string; `None` or empty selects the default set.
    pub config: Option<String>,
    /// Output path; every `{pid}` occurrence expands to the process id.
    pub output_path: String,
    /// Buffer budget in megabytes.
    pub buffer_size_mb: u32,
    /// When set the session streams as it fills instead of flushing at the end.
    pub streaming: bool,
}

impl Default for StartupSession {
    fn default() -> Self {
        StartupSession {
            config: None,
            output_path: DEFAULT_OUTPUT_PATH.to_string(),
            buffer_size_mb: DEFAULT_BUFFER_SIZE_MB,
            streaming: false,
        }
    }
}

/// Reads the `TRACEMUX_*` variables; `None` when tracing is not requested.
pub(crate) fn startup_session_from_env() -> Option<StartupSession> {
    startup_session_from_vars(
        std::env::var(ENV_ENABLE).ok().as_deref(),
        std::env::var(ENV_CONFIG).ok().as_deref(),
        std::env::var(ENV_OUTPUT_PATH).ok().as_deref(),
        std::env::var(ENV_BUFFER_MB).ok().as_deref(),
        std::env::var(ENV_STREAMING).ok().as_deref(),
    )
}

fn startup_session_from_vars(
    enable: Option<&str>,
    config: Option<&str>,
    output_path: Option<&str>,
    buffer_mb: Option<&str>,
    streaming: Option<&str>,
) -> Option<StartupSession> {
    if !truthy(enable) {
        return None;
    }
    Some(StartupSession {
        config: config.map(str::to_string),
        output_path: output_path.unwrap_or(DEFAULT_OUTPUT_PATH).to_string(),
        buffer_size_mb: buffer_mb
            .and_then(|raw| raw.parse::<u32>().ok())
            .unwrap_or(DEFAULT_BUFFER_SIZE_MB),
        streaming: truthy(streaming),
    })
}

fn truthy(value: Option<&str>) -> bool {
    matches!(value, Some(v) if v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Replaces every `{pid}` occurrence in `path` with the given process id.
pub(crate) fn expand_pid_template(path: &str, pid: u32) -> String {
    path.replace("{pid}", &pid.to_string())
}
