//! Startup configuration of a core.
//!
//! Read once when a core starts and immutable afterwards.

use std::env;

use stackarena::placement::{CACHE_LINE, OFFSET_WINDOW};
use stackarena::utils::is_page_multiple;
use stackarena::page_size;
use thiserror::Error;

/// Default usable stack size of a worker.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Usable bytes per worker stack, excluding the guard pages.
    pub stack_size: usize,
    /// Distance between the starting points of consecutively spawned stacks.
    pub stack_offset: usize,
    /// Arm `PROT_NONE` guard pages around every stack.
    pub guard_pages: bool,
    /// Keep the stacks of workers that are not running read-only.
    pub protect_idle_stacks: bool,
    /// How many freed default-sized stacks the arena keeps for reuse.
    pub region_cache: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("stack size {size} must be a positive multiple of the page size {page}")]
    StackSize { size: usize, page: usize },

    #[error("stack offset {0} must be a multiple of 16 below {window}", window = OFFSET_WINDOW)]
    StackOffset(usize),

    #[error("{key}={value:?} is not a valid {expected}")]
    Parse {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            stack_offset: CACHE_LINE,
            guard_pages: true,
            protect_idle_stacks: false,
            region_cache: 0,
        }
    }
}

impl Config {
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_stack_offset(mut self, stack_offset: usize) -> Self {
        self.stack_offset = stack_offset;
        self
    }

    pub fn with_guard_pages(mut self, enabled: bool) -> Self {
        self.guard_pages = enabled;
        self
    }

    pub fn with_protect_idle_stacks(mut self, enabled: bool) -> Self {
        self.protect_idle_stacks = enabled;
        self
    }

    pub fn with_region_cache(mut self, regions: usize) -> Self {
        self.region_cache = regions;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_page_multiple(self.stack_size) {
            return Err(ConfigError::StackSize {
                size: self.stack_size,
                page: page_size(),
            });
        }
        if self.stack_offset % 16 != 0 || self.stack_offset >= OFFSET_WINDOW {
            return Err(ConfigError::StackOffset(self.stack_offset));
        }
        Ok(())
    }

    /// Reads `FIBERLOOM_*` variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`from_env`](Config::from_env), with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup("FIBERLOOM_STACK_SIZE") {
            config.stack_size = parse_size("FIBERLOOM_STACK_SIZE", &value)?;
        }
        if let Some(value) = lookup("FIBERLOOM_STACK_OFFSET") {
            config.stack_offset = parse_size("FIBERLOOM_STACK_OFFSET", &value)?;
        }
        if let Some(value) = lookup("FIBERLOOM_GUARD_PAGES") {
            config.guard_pages = parse_flag("FIBERLOOM_GUARD_PAGES", &value)?;
        }
        if let Some(value) = lookup("FIBERLOOM_PROTECT_IDLE_STACKS") {
            config.protect_idle_stacks = parse_flag("FIBERLOOM_PROTECT_IDLE_STACKS", &value)?;
        }
        if let Some(value) = lookup("FIBERLOOM_REGION_CACHE") {
            config.region_cache = parse_size("FIBERLOOM_REGION_CACHE", &value)?;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Accepts plain byte counts and `k`/`m` suffixes (`64k`, `1M`).
fn parse_size(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    let invalid = || ConfigError::Parse {
        key,
        value: value.to_string(),
        expected: "size",
    };
    let trimmed = value.trim();
    let (digits, scale) = match trimmed.chars().last() {
        Some('k') | Some('K') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('m') | Some('M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        _ => (trimmed, 1),
    };
    digits
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .ok_or_else(invalid)
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Parse {
            key,
            value: value.to_string(),
            expected: "flag",
        }),
    }
}
