//! Service and process configuration.
//!
//! The runtime consumes an already-structured tree; this module defines the
//! shape, the defaults, and a loader keyed on file extension (JSON or TOML).

use std::path::Path;

use anyhow::{bail, Context};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::{DEFAULT_MAX_PACKET, HEADER_LEN};
use crate::error::{AnyResult, CoreResult, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Per-service settings. Everything except `name` has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    /// Target ticks per second, 1..=1000.
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Listener endpoint, e.g. `"127.0.0.1:7400"`. None for client-only or
    /// internal services.
    #[serde(default)]
    pub listen_addr: Option<String>,

    /// Peers to connect to during startup.
    #[serde(default)]
    pub connect_peers: Vec<String>,

    /// Codec layer names applied inside the frame, in decode order.
    #[serde(default)]
    pub codec_chain: Vec<String>,

    /// Per-session send buffer high-water mark in bytes.
    #[serde(default = "default_max_session_send_buf")]
    pub max_session_send_buf: usize,

    /// Envelope drain bound per tick.
    #[serde(default = "default_frame_drain_cap")]
    pub frame_drain_cap: usize,

    /// Max framed packet length (everything after the length prefix).
    #[serde(default = "default_max_packet")]
    pub max_packet: usize,

    #[serde(default)]
    pub log_level: LogLevel,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        ServiceConfig {
            name: name.into(),
            fps: default_fps(),
            listen_addr: None,
            connect_peers: Vec::new(),
            codec_chain: Vec::new(),
            max_session_send_buf: default_max_session_send_buf(),
            frame_drain_cap: default_frame_drain_cap(),
            max_packet: default_max_packet(),
            log_level: LogLevel::default(),
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() {
            return Err(Error::Arg("service name must be non-empty".into()));
        }
        if !(1..=1000).contains(&self.fps) {
            return Err(Error::Arg(format!(
                "service '{}': fps {} outside 1..=1000",
                self.name, self.fps
            )));
        }
        if self.frame_drain_cap == 0 {
            return Err(Error::Arg(format!(
                "service '{}': frame_drain_cap must be positive",
                self.name
            )));
        }
        if self.max_packet < HEADER_LEN {
            return Err(Error::Arg(format!(
                "service '{}': max_packet {} below header size",
                self.name, self.max_packet
            )));
        }
        Ok(())
    }

    pub fn frame_interval_ms(&self) -> u64 {
        (1000 / self.fps.max(1)) as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ManagerConfig {
    /// Tear the process down when any service dies of a panic.
    #[serde(default)]
    pub abort_on_service_fatal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub manager: ManagerConfig,
    pub services: Vec<ServiceConfig>,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> AnyResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let config: AppConfig = parse(extension, &raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AnyResult<()> {
        let mut names = std::collections::HashSet::new();
        for service in &self.services {
            service.validate()?;
            if !names.insert(service.name.as_str()) {
                crate::bail_into!("duplicate service name '{}'", service.name);
            }
        }
        Ok(())
    }
}

fn parse<T: DeserializeOwned>(extension: &str, raw: &[u8]) -> AnyResult<T> {
    match extension.to_ascii_lowercase().as_str() {
        "json" => serde_json::from_slice(raw).map_err(Into::into),
        "toml" => {
            let content = std::str::from_utf8(raw)?;
            toml::from_str(content).map_err(Into::into)
        }
        other => bail!("no parser available for config format '{other}'"),
    }
}

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

define_const!(default_fps, 30, u32);
define_const!(default_max_session_send_buf, 256 * 1024, usize);
define_const!(default_frame_drain_cap, 128, usize);
define_const!(default_max_packet, DEFAULT_MAX_PACKET, usize);
