// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    clock::DEFAULT_CALIBRATE_MS,
    fail::Fail,
};
use ::std::{
    fs::File,
    io::Read,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Substrate tunables. All fields have working defaults; a YAML file overrides them under the
/// `zenedge` key, for example:
///
/// ```yaml
/// zenedge:
///   ring_size: 1024
///   spin_budget_us: 100000
///   deadline_ms: 5000
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of entries in each transport ring (power of two).
    pub ring_size: u32,
    /// Spin budget of the adaptive poll, in microseconds.
    pub spin_budget_us: u64,
    /// Total deadline of the adaptive poll, in milliseconds.
    pub deadline_ms: u64,
    /// Calibration window of the time source, in milliseconds.
    pub calibrate_ms: u64,
    /// Capacity of the flight-recorder ring (power of two).
    pub trace_capacity: usize,
    /// Busy-loop iterations used to simulate non-offloaded steps.
    pub sim_spin_iters: u32,
    /// Halt a job when an offloaded step times out, instead of continuing.
    pub abort_on_timeout: bool,
    /// Name of the shared memory region; empty selects an anonymous in-process segment.
    pub shm_name: String,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Config {
    /// Reads a configuration file.
    pub fn load(path: &str) -> Result<Self, Fail> {
        let mut text: String = String::new();
        File::open(path)?.read_to_string(&mut text)?;
        Self::parse(&text)
    }

    /// Parses a configuration document.
    pub fn parse(text: &str) -> Result<Self, Fail> {
        let docs: Vec<Yaml> = match YamlLoader::load_from_str(text) {
            Ok(docs) => docs,
            Err(e) => {
                let cause: String = format!("malformed configuration file ({})", e);
                error!("parse(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let root: &Yaml = match docs.first() {
            Some(root) => root,
            None => return Ok(Self::default()),
        };

        let section: &Yaml = &root["zenedge"];
        let mut config: Config = Self::default();

        if let Some(n) = section["ring_size"].as_i64() {
            if n <= 0 || !(n as u64).is_power_of_two() {
                return Err(Fail::new(libc::EINVAL, "ring_size must be a positive power of two"));
            }
            config.ring_size = n as u32;
        }
        if let Some(n) = section["spin_budget_us"].as_i64() {
            config.spin_budget_us = n as u64;
        }
        if let Some(n) = section["deadline_ms"].as_i64() {
            config.deadline_ms = n as u64;
        }
        if let Some(n) = section["calibrate_ms"].as_i64() {
            config.calibrate_ms = n as u64;
        }
        if let Some(n) = section["trace_capacity"].as_i64() {
            if n <= 0 || !(n as u64).is_power_of_two() {
                return Err(Fail::new(libc::EINVAL, "trace_capacity must be a positive power of two"));
            }
            config.trace_capacity = n as usize;
        }
        if let Some(n) = section["sim_spin_iters"].as_i64() {
            config.sim_spin_iters = n as u32;
        }
        if let Some(b) = section["abort_on_timeout"].as_bool() {
            config.abort_on_timeout = b;
        }
        if let Some(s) = section["shm_name"].as_str() {
            config.shm_name = s.to_string();
        }

        Ok(config)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Config {
    fn default() -> Self {
        Self {
            ring_size: 1024,
            spin_budget_us: 100_000,
            deadline_ms: 5_000,
            calibrate_ms: DEFAULT_CALIBRATE_MS,
            trace_capacity: 256,
            sim_spin_iters: 100_000,
            abort_on_timeout: false,
            shm_name: String::new(),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::Config;
    use ::anyhow::Result;

    /// Tests if overrides in a configuration document land in the right fields.
    #[test]
    fn parse_overrides() -> Result<()> {
        let text: &str = "zenedge:\n  ring_size: 64\n  deadline_ms: 250\n  abort_on_timeout: true\n";
        let config: Config = match Config::parse(text) {
            Ok(config) => config,
            Err(e) => anyhow::bail!("parsing a valid configuration should be possible: {:?}", e),
        };
        crate::ensure_eq!(config.ring_size, 64);
        crate::ensure_eq!(config.deadline_ms, 250);
        crate::ensure_eq!(config.abort_on_timeout, true);
        // Untouched fields keep their defaults.
        crate::ensure_eq!(config.spin_budget_us, 100_000);
        Ok(())
    }

    /// Tests if a non-power-of-two ring size is refused.
    #[test]
    fn parse_bad_ring_size() -> Result<()> {
        let text: &str = "zenedge:\n  ring_size: 1000\n";
        match Config::parse(text) {
            Ok(_) => anyhow::bail!("parsing a bad ring size should fail"),
            Err(_) => Ok(()),
        }
    }
}
