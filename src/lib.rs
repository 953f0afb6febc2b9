// SPDX-License-Identifier: GPL-2.0
//
// epyc-pve - CPU topology detection and VM affinity planning
//
// Copyright (C) 2025-2026 ghostkellz <ckelley@ghostkellz.sh>

pub mod affinity;
pub mod cli;
pub mod config;
pub mod cpulist;
pub mod display;
pub mod error;
pub mod intel;
pub mod pve;
pub mod sysfs;
pub mod topology;

pub use crate::affinity::{AffinityOption, Request, Strategy, generate, generate_manual};
pub use crate::topology::{CpuTopology, detect_topology};
