//! Shared helper functions used across CLI subcommands.
//!
//! Includes tracing initialization, configuration file loading, and event
//! input handling.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wasmbridge_core::{BridgeConfig, ExportNames, InvocationModel, SandboxConfig};

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Contents of a wasmbridge TOML configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub sandbox: SandboxConfig,
    pub bridge: BridgeConfig,
}

impl FileConfig {
    /// Read `path`, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Bridge settings for `model`. Command-style guests use their own
    /// export names unless the file chose names explicitly.
    pub fn bridge_for(&self, model: InvocationModel, allow_partial: bool) -> BridgeConfig {
        let mut bridge = self.bridge.clone();
        if model == InvocationModel::ArgumentVector && bridge.exports == ExportNames::default() {
            bridge.exports = ExportNames::argument_vector();
        }
        if allow_partial {
            bridge.allow_partial = true;
        }
        bridge
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Requests parsed when no events are given.
pub fn sample_events() -> Vec<Vec<u8>> {
    [
        "GET /api/v1/bpf HTTP/1.1\r\nHost: tricorder.dev\r\nCookie: cookie\r\n\r\n",
        "PUT /api/v2/wasm HTTP/1.1\r\nHost: tricorder.dev\r\n\r\n",
        "GET /wp-content/uploads/2010/03/hello-kitty-darth-vader-pink.jpg HTTP/1.1\r\n\
         Host: www.kittyhell.com\r\n\
         User-Agent: Mozilla/5.0 (Macintosh; U; Intel Mac OS X 10.6; ja-JP-mac; rv:1.9.2.3) \
         Gecko/20100401 Firefox/3.6.3 Pathtraq/0.9\r\n\
         Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8\r\n\
         Accept-Language: ja,en-us;q=0.7,en;q=0.3\r\n\
         Accept-Encoding: gzip,deflate\r\n\
         Accept-Charset: Shift_JIS,utf-8;q=0.7,*;q=0.7\r\n\
         Keep-Alive: 115\r\n\
         Connection: keep-alive\r\n\r\n",
    ]
    .iter()
    .map(|event| event.as_bytes().to_vec())
    .collect()
}

/// Pick the batch: the events file, then inline events, then the sample.
pub fn collect_events(file: Option<&Path>, inline: &[String]) -> Result<Vec<Vec<u8>>> {
    if let Some(path) = file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read events file {}", path.display()))?;
        let events: Vec<String> = serde_json::from_str(&text).with_context(|| {
            format!(
                "events file {} must be a JSON array of strings",
                path.display()
            )
        })?;
        return Ok(events.into_iter().map(String::into_bytes).collect());
    }
    if !inline.is_empty() {
        return Ok(inline.iter().map(|e| e.as_bytes().to_vec()).collect());
    }
    info!("no events given, using built-in sample");
    Ok(sample_events())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_gives_defaults() {
        let config = FileConfig::load(None).unwrap();
        assert_eq!(config.bridge.max_event_size, 4096);
        assert_eq!(config.sandbox.max_memory, 16 * 1024 * 1024);
    }

    #[test]
    fn load_sandbox_and_bridge_tables() {
        let tmp = tempfile::tempdir().expect("tempdir creation must succeed in tests");
        let path = tmp.path().join("wasmbridge.toml");
        std::fs::write(
            &path,
            r#"
[sandbox]
max_fuel = 5000

[bridge]
max_events = 16
allow_partial = true

[bridge.exports]
parse = "pico_parse_events"
"#,
        )
        .unwrap();

        let config = FileConfig::load(Some(&path)).unwrap();
        assert_eq!(config.sandbox.max_fuel, 5000);
        assert_eq!(config.bridge.max_events, 16);
        assert!(config.bridge.allow_partial);
        assert_eq!(config.bridge.exports.parse, "pico_parse_events");
        assert_eq!(
            config.bridge.exports.allocate,
            "allocate_input_output_bufs"
        );
    }

    #[test]
    fn bad_config_names_the_file() {
        let tmp = tempfile::tempdir().expect("tempdir creation must succeed in tests");
        let path = tmp.path().join("broken.toml");
        std::fs::write(&path, "[bridge]\nmax_events = \"many\"\n").unwrap();
        let err = FileConfig::load(Some(&path)).unwrap_err();
        assert!(format!("{err:#}").contains("broken.toml"));
    }

    #[test]
    fn argv_model_switches_default_export_names() {
        let config = FileConfig::default();
        let bridge = config.bridge_for(InvocationModel::ArgumentVector, false);
        assert_eq!(bridge.exports, ExportNames::argument_vector());
        let bridge = config.bridge_for(InvocationModel::GuestAllocated, true);
        assert_eq!(bridge.exports, ExportNames::default());
        assert!(bridge.allow_partial);
    }

    #[test]
    fn explicit_export_names_are_kept() {
        let config = FileConfig {
            bridge: BridgeConfig::new().with_exports(ExportNames::default().with_name(
                wasmbridge_core::GuestOp::Parse,
                "main",
            )),
            ..FileConfig::default()
        };
        let bridge = config.bridge_for(InvocationModel::ArgumentVector, false);
        assert_eq!(bridge.exports.parse, "main");
    }

    #[test]
    fn events_from_json_file() {
        let tmp = tempfile::tempdir().expect("tempdir creation must succeed in tests");
        let path = tmp.path().join("events.json");
        std::fs::write(&path, r#"["GET /a HTTP/1.1\r\n\r\n", "PUT /b HTTP/1.1\r\n\r\n"]"#)
            .unwrap();
        let events = collect_events(Some(&path), &[]).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], b"GET /a HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn events_file_must_be_string_array() {
        let tmp = tempfile::tempdir().expect("tempdir creation must succeed in tests");
        let path = tmp.path().join("events.json");
        std::fs::write(&path, r#"{"events": 3}"#).unwrap();
        assert!(collect_events(Some(&path), &[]).is_err());
    }

    #[test]
    fn inline_events_then_sample() {
        let events = collect_events(None, &["GET /x".to_owned()]).unwrap();
        assert_eq!(events, vec![b"GET /x".to_vec()]);

        let events = collect_events(None, &[]).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.ends_with(b"\r\n\r\n")));
    }
}
