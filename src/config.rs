// SPDX-License-Identifier: GPL-2.0
//
// epyc-pve - Configuration Management
//
// Loads defaults for detection, strategy choice and the qm client from TOML.
//
// Copyright (C) 2025-2026 ghostkellz <ckelley@ghostkellz.sh>

use crate::affinity::Strategy;
use crate::sysfs::{CPUINFO_PATH, SYSFS_CPU_PATH, TopologyReader};
use crate::topology::{DEFAULT_CORES_PER_GROUP, DetectOptions};
use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PveConfig {
    /// Where and how to read CPU topology
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Affinity defaults for --apply
    #[serde(default)]
    pub affinity: AffinityConfig,

    /// Proxmox `qm` settings
    #[serde(default)]
    pub pve: QmConfig,
}

/// Topology detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// sysfs CPU directory
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    /// File holding the vendor_id line
    #[serde(default = "default_cpuinfo_path")]
    pub cpuinfo_path: PathBuf,

    /// Cores per CCD when grouping has to be inferred from core_id
    #[serde(default = "default_cores_per_group")]
    pub cores_per_group: u32,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            sysfs_root: default_sysfs_root(),
            cpuinfo_path: default_cpuinfo_path(),
            cores_per_group: default_cores_per_group(),
        }
    }
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from(SYSFS_CPU_PATH)
}

fn default_cpuinfo_path() -> PathBuf {
    PathBuf::from(CPUINFO_PATH)
}

fn default_cores_per_group() -> u32 {
    DEFAULT_CORES_PER_GROUP
}

/// Affinity defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityConfig {
    /// Strategy used by --apply when --strategy is not given
    #[serde(default = "default_strategy")]
    pub default_strategy: Strategy,

    /// Count physical cores only (no SMT siblings) by default
    #[serde(default)]
    pub physical_only: bool,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy(),
            physical_only: false,
        }
    }
}

fn default_strategy() -> Strategy {
    Strategy::Random
}

/// qm client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QmConfig {
    /// Path or name of the qm binary
    #[serde(default = "default_qm_binary")]
    pub qm_binary: String,
}

impl Default for QmConfig {
    fn default() -> Self {
        Self {
            qm_binary: default_qm_binary(),
        }
    }
}

fn default_qm_binary() -> String {
    "qm".to_string()
}

/// Standard config file locations (in priority order)
const CONFIG_PATHS: &[&str] = &["/etc/epyc-pve/config.toml", "~/.config/epyc-pve/config.toml"];

impl PveConfig {
    /// Load configuration from standard paths
    pub fn load() -> Result<Self> {
        for path in CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            let path = PathBuf::from(expanded.as_ref());

            if path.exists() {
                return Self::load_from_path(&path);
            }
        }

        // XDG config dir when it differs from ~/.config
        if let Some(path) = dirs::config_dir().map(|dir| dir.join("epyc-pve/config.toml"))
            && path.exists()
        {
            return Self::load_from_path(&path);
        }

        debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: PveConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        info!("Loaded config from {:?}", path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn reader(&self) -> TopologyReader {
        TopologyReader::new(&self.topology.sysfs_root, &self.topology.cpuinfo_path)
    }

    pub fn detect_options(&self) -> DetectOptions {
        DetectOptions {
            cores_per_group: self.topology.cores_per_group,
        }
    }
}
