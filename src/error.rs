// SPDX-License-Identifier: GPL-2.0
//
// epyc-pve - Error types for topology detection and affinity generation
//
// Copyright (C) 2025-2026 ghostkellz <ckelley@ghostkellz.sh>

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Topology detection failures. Detection never returns a partial topology.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// sysfs is missing, unreadable, or has no CPUs
    #[error("topology unavailable: {0}")]
    Unavailable(String),

    /// A per-CPU attribute exists but we may not read it
    #[error("permission denied reading {}", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Rejected affinity requests. Strategies that merely can't satisfy a request
/// are reported as unavailable options instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AffinityError {
    #[error("topology is required")]
    MissingTopology,

    #[error("cores needed must be greater than zero")]
    InvalidCount,

    #[error(
        "not enough cores: need {needed} physical cores for {requested} CPUs, but only {available} available"
    )]
    CapacityExceeded {
        needed: usize,
        requested: usize,
        available: usize,
    },

    #[error("no CCDs selected")]
    EmptySelection,

    #[error("selected CCDs only have {available} cores, need {needed} ({} short)", .needed - .available)]
    InsufficientSelection { available: usize, needed: usize },
}
