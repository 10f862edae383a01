//! Environment configuration, read once at startup.
//!
//! - `PORT` (default 4860)
//! - `TIMELINE_SNAPSHOT_DIR` (default `~/tickets`)
//! - `TIMELINE_STATIC_DIR` (default `static`)
//! - `TIMELINE_UTC_OFFSET_MINUTES` (default 0): offset for naive timestamps and day dividers

use crate::error::{TimelineError, TimelineResult};
use crate::pipeline::AssembleOptions;
use chrono::{FixedOffset, Offset, Utc};
use std::path::PathBuf;

const DEFAULT_PORT: u16 = 4860;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Directory of `{ticket_id}.json` snapshot files
    pub snapshot_dir: PathBuf,
    pub static_dir: PathBuf,
    pub utc_offset: FixedOffset,
}

impl ServerConfig {
    pub fn from_env() -> TimelineResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> TimelineResult<Self> {
        let home = lookup("HOME").unwrap_or_else(|| "/home/user".to_string());

        let port = match lookup("PORT") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                TimelineError::InvalidConfig(format!("PORT is not a port number: {}", raw))
            })?,
            None => DEFAULT_PORT,
        };

        let snapshot_dir = lookup("TIMELINE_SNAPSHOT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&home).join("tickets"));

        let static_dir = lookup("TIMELINE_STATIC_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("static"));

        let utc_offset = match lookup("TIMELINE_UTC_OFFSET_MINUTES") {
            Some(raw) => parse_offset_minutes(&raw)?,
            None => Utc.fix(),
        };

        Ok(Self {
            port,
            snapshot_dir,
            static_dir,
            utc_offset,
        })
    }

    pub fn assemble_options(&self) -> AssembleOptions {
        AssembleOptions {
            utc_offset: self.utc_offset,
        }
    }
}

fn parse_offset_minutes(raw: &str) -> TimelineResult<FixedOffset> {
    let minutes: i32 = raw.trim().parse().map_err(|_| {
        TimelineError::InvalidConfig(format!(
            "TIMELINE_UTC_OFFSET_MINUTES is not an integer: {}",
            raw
        ))
    })?;
    minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| {
            TimelineError::InvalidConfig(format!("UTC offset out of range: {} minutes", minutes))
        })
}
