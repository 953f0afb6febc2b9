// SPDX-License-Identifier: GPL-2.0
//
// epyc-pve - Command-line arguments, validation and the apply flow
//
// Copyright (C) 2025-2026 ghostkellz <ckelley@ghostkellz.sh>

use crate::affinity::{self, AffinityOption, Request, Strategy};
use crate::config::PveConfig;
use crate::cpulist::parse_cpu_list_bounded;
use crate::display;
use crate::error::{AffinityError, TopologyError};
use crate::pve::{PveError, VmManager};
use crate::topology::CpuTopology;
use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// epyc-pve - CCD-aware CPU affinity for Proxmox VE virtual machines
#[derive(Parser, Debug, Default)]
#[command(name = "epyc-pve")]
#[command(author = "ghostkellz <ckelley@ghostkellz.sh>")]
#[command(version)]
#[command(about = "Plan and apply CCD / P-core aware CPU affinity for Proxmox VE VMs")]
pub struct Args {
    /// Show CPU topology and exit
    #[arg(long)]
    pub topology: bool,

    /// List Proxmox VMs (qm list) and exit
    #[arg(long)]
    pub list_vms: bool,

    /// Number of vCPUs to allocate (physical cores with --physical)
    #[arg(long, default_value_t = 0)]
    pub cores: usize,

    /// Target VM ID
    #[arg(long, default_value_t = 0)]
    pub vmid: u32,

    /// Strategy: single-ccd, distributed, sequential, random, manual, p-cores, e-cores, all-cores
    #[arg(long)]
    pub strategy: Option<String>,

    /// Core group indices for --strategy manual, e.g. "0,2" or "0-1"
    #[arg(long)]
    pub groups: Option<String>,

    /// Apply affinity in CLI mode (non-interactive)
    #[arg(long)]
    pub apply: bool,

    /// Show the qm command without executing it
    #[arg(long)]
    pub dry_run: bool,

    /// Use physical cores only (no SMT siblings)
    #[arg(long)]
    pub physical: bool,

    /// Output JSON (with --topology, --list-vms or --cores)
    #[arg(long)]
    pub json: bool,

    /// Config file (defaults to /etc/epyc-pve/config.toml, ~/.config/epyc-pve/config.toml)
    #[arg(short, long, env = "EPYC_PVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Generate shell completions and exit
    #[arg(long, value_enum)]
    pub completions: Option<clap_complete::Shell>,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Debug logging (very verbose)
    #[arg(short, long)]
    pub debug: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}

fn invalid(msg: impl Into<String>) -> CliError {
    CliError::InvalidArguments(msg.into())
}

/// What the validated arguments ask for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Topology tree (or JSON) and exit
    Topology { json: bool },
    /// Print every strategy for a request without touching any VM
    List {
        cores: usize,
        physical: bool,
        json: bool,
    },
    Apply(ApplyPlan),
    /// VMs known to qm
    Vms { json: bool },
    /// No mode flags: topology plus usage hint
    Overview,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyPlan {
    pub cores: usize,
    pub vmid: u32,
    pub strategy: Strategy,
    /// Group indices for the manual strategy
    pub groups: Vec<usize>,
    pub physical: bool,
    pub dry_run: bool,
}

/// Check flag combinations and bounds against the detected topology
pub fn validate(args: &Args, topo: &CpuTopology, config: &PveConfig) -> Result<Mode, CliError> {
    if args.topology && args.apply {
        return Err(invalid("--topology cannot be used with --apply"));
    }
    if args.topology && args.cores > 0 {
        return Err(invalid("--topology cannot be used with --cores"));
    }
    if args.list_vms && (args.topology || args.apply || args.cores > 0) {
        return Err(invalid(
            "--list-vms cannot be used with --topology, --apply or --cores",
        ));
    }
    if args.json && !args.topology && !args.list_vms && (args.apply || args.cores == 0) {
        return Err(invalid("--json requires --topology, --list-vms or --cores"));
    }
    if args.dry_run && !args.apply {
        return Err(invalid("--dry-run requires --apply"));
    }

    let physical = args.physical || config.affinity.physical_only;

    if args.apply {
        if args.cores == 0 {
            return Err(invalid("--cores is required for --apply mode"));
        }
        if args.vmid == 0 {
            return Err(invalid("--vmid is required for --apply mode"));
        }
        check_core_bounds(args.cores, physical, topo)?;

        let strategy = match &args.strategy {
            Some(s) => s.parse::<Strategy>().map_err(CliError::InvalidArguments)?,
            None => config.affinity.default_strategy,
        };

        let groups = match (&args.groups, strategy) {
            (Some(list), Strategy::Manual) => parse_group_indices(list, topo)?,
            (None, Strategy::Manual) => {
                return Err(invalid("--strategy manual requires --groups"));
            }
            (Some(_), _) => return Err(invalid("--groups requires --strategy manual")),
            (None, _) => Vec::new(),
        };

        return Ok(Mode::Apply(ApplyPlan {
            cores: args.cores,
            vmid: args.vmid,
            strategy,
            groups,
            physical,
            dry_run: args.dry_run,
        }));
    }

    if args.vmid != 0 || args.strategy.is_some() || args.groups.is_some() {
        return Err(invalid(
            "use --apply for CLI mode, or --cores alone to list options",
        ));
    }

    if args.cores > 0 {
        check_core_bounds(args.cores, physical, topo)?;
        return Ok(Mode::List {
            cores: args.cores,
            physical,
            json: args.json,
        });
    }

    if args.physical {
        return Err(invalid("--physical requires --cores"));
    }

    if args.topology {
        return Ok(Mode::Topology { json: args.json });
    }

    if args.list_vms {
        return Ok(Mode::Vms { json: args.json });
    }

    Ok(Mode::Overview)
}

fn check_core_bounds(cores: usize, physical: bool, topo: &CpuTopology) -> Result<(), CliError> {
    let (max, what) = if physical {
        (topo.total_cores, "physical cores")
    } else {
        (topo.total_cpus, "vCPUs")
    };
    if cores > max {
        return Err(invalid(format!(
            "requested {} {}, but only {} available",
            cores, what, max
        )));
    }
    Ok(())
}

fn parse_group_indices(list: &str, topo: &CpuTopology) -> Result<Vec<usize>, CliError> {
    let count = u32::try_from(topo.core_groups.len()).unwrap_or(u32::MAX);
    let indices = parse_cpu_list_bounded(list, count).map_err(|e| {
        invalid(format!(
            "--groups: {:#} (valid indices 0-{})",
            e,
            count.saturating_sub(1)
        ))
    })?;
    if indices.is_empty() {
        return Err(invalid("--groups is empty"));
    }
    Ok(indices.into_iter().map(|i| i as usize).collect())
}

/// Compute the option a plan selects
pub fn select_option(plan: &ApplyPlan, topo: &CpuTopology) -> Result<AffinityOption> {
    let req = Request::new(topo, plan.cores, !plan.physical);

    let option = if plan.strategy == Strategy::Manual {
        affinity::generate_manual(&req, &plan.groups)?
    } else {
        affinity::generate(&req)?
            .into_iter()
            .find(|o| o.strategy == plan.strategy)
            .ok_or_else(|| {
                invalid(format!(
                    "strategy {} is not available for {} topology",
                    plan.strategy, topo.architecture
                ))
            })?
    };

    if !option.is_available() {
        return Err(invalid(option.description).into());
    }
    debug!("Selected {}: {}", option.strategy, option.affinity);
    Ok(option)
}

/// Run the apply flow against a VM manager; returns the text to print
pub fn run_apply(plan: &ApplyPlan, topo: &CpuTopology, manager: &dyn VmManager) -> Result<String> {
    let option = select_option(plan, topo)?;
    let vm = manager.ensure_exists(plan.vmid)?;

    if plan.dry_run {
        return Ok(display::render_dry_run(&vm, &option.affinity));
    }

    info!(
        "Applying {} ({}) to VM {} ({})",
        option.affinity, option.strategy, vm.vmid, vm.name
    );
    manager.set_affinity(vm.vmid, &option.affinity)?;
    Ok(display::render_success(&vm, &option.affinity))
}

/// List VMs as a table or JSON
pub fn run_list_vms(manager: &dyn VmManager, json: bool) -> Result<String> {
    let vms = manager.list_vms()?;
    if json {
        return serde_json::to_string_pretty(&vms).context("Failed to serialize VMs");
    }
    Ok(display::render_vms(&vms))
}

/// Process exit code for an error
///
/// 2 invalid arguments, 3 topology unavailable, 4 VM not found,
/// 5 permission denied, 1 anything else.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.is::<CliError>() || cause.is::<AffinityError>() {
            return 2;
        }
        if let Some(e) = cause.downcast_ref::<TopologyError>() {
            return match e {
                TopologyError::PermissionDenied { .. } => 5,
                TopologyError::Unavailable(_) => 3,
            };
        }
        if let Some(e) = cause.downcast_ref::<PveError>() {
            match e {
                PveError::PermissionDenied(_) => return 5,
                PveError::VmNotFound { .. } => return 4,
                _ => {}
            }
        }
        if let Some(e) = cause.downcast_ref::<io::Error>()
            && e.kind() == io::ErrorKind::PermissionDenied
        {
            return 5;
        }
    }
    1
}

/// User-facing message for an error
pub fn error_message(err: &anyhow::Error) -> String {
    match exit_code(err) {
        5 => "Permission denied. Try running with sudo.".to_string(),
        3 => format!(
            "Cannot read CPU topology. Are you running on a Linux system? ({})",
            err
        ),
        _ => format!("{:#}", err),
    }
}
