// SPDX-License-Identifier: GPL-2.0
//
// epyc-pve - Plain-text output
//
// Copyright (C) 2025-2026 ghostkellz <ckelley@ghostkellz.sh>

use crate::affinity::AffinityOption;
use crate::cpulist::format_cpus;
use crate::pve::Vm;
use crate::topology::CpuTopology;
use std::fmt::Write;

/// Render the package / core-group tree
pub fn render_topology(topo: &CpuTopology) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "CPU Topology ({})", topo.architecture);
    let _ = writeln!(
        out,
        "  Cores: {}    vCPUs: {}    SMT: {}    Method: {}",
        topo.total_cores,
        topo.total_cpus,
        if topo.has_smt { "Yes" } else { "No" },
        topo.detect_method
    );
    out.push('\n');

    for pkg in &topo.packages {
        let cores: usize = pkg.core_groups.iter().map(|g| g.physical_cpus.len()).sum();
        let threads: usize = pkg.core_groups.iter().map(|g| g.all_cpus.len()).sum();
        let _ = writeln!(out, "  Package {}  ({} cores, {} threads)", pkg.id, cores, threads);

        for (i, group) in pkg.core_groups.iter().enumerate() {
            let prefix = if i + 1 == pkg.core_groups.len() {
                "└─"
            } else {
                "├─"
            };
            let l3 = group
                .l3_cache_id
                .map(|id| format!(" [L3#{}]", id))
                .unwrap_or_default();
            let note = if group.best_effort { " (best-effort)" } else { "" };
            let _ = writeln!(
                out,
                "     {} {}{}{}  {} / {}",
                prefix,
                group.name,
                l3,
                note,
                format_cpus(&group.physical_cpus),
                format_cpus(&group.all_cpus)
            );
        }
    }

    out
}

/// Render the numbered option menu
pub fn render_options(options: &[AffinityOption], physical_only: bool) -> String {
    let unit = if physical_only { "Physical Cores" } else { "vCPUs" };
    let mut out = String::from("Affinity Options\n\n");

    for (i, option) in options.iter().enumerate() {
        let mark = if option.is_available() { "✓" } else { "✗" };
        let _ = writeln!(out, "  {} [{}] {} ({})", mark, i + 1, option.name, option.strategy);
        let _ = writeln!(out, "      {}", option.description);
        if option.is_available() {
            let _ = writeln!(
                out,
                "      {}: {}  Groups: {}",
                unit, option.affinity, option.groups_used
            );
        } else {
            let _ = writeln!(out, "      {}: unavailable", unit);
        }
        out.push('\n');
    }

    out
}

/// Render the `qm list` VMs as a table
pub fn render_vms(vms: &[Vm]) -> String {
    if vms.is_empty() {
        return "No VMs found\n".to_string();
    }

    let width = vms.iter().map(|vm| vm.name.len()).max().unwrap_or(0).max(4);
    let mut out = format!("  {:>6}  {:<width$}  STATUS\n", "VMID", "NAME");
    for vm in vms {
        let _ = writeln!(out, "  {:>6}  {:<width$}  {}", vm.vmid, vm.name, vm.status);
    }
    out
}

pub fn render_dry_run(vm: &Vm, affinity: &str) -> String {
    format!(
        "DRY RUN - Would apply:\n\n  VM: {} ({})\n  Affinity: {}\n  Command: qm set {} --affinity {}",
        vm.name, vm.vmid, affinity, vm.vmid, affinity
    )
}

pub fn render_success(vm: &Vm, affinity: &str) -> String {
    format!(
        "✓ Successfully applied affinity to VM {} ({})\n\n  Affinity: {}",
        vm.vmid, vm.name, affinity
    )
}
