// SPDX-License-Identifier: GPL-2.0
//
// epyc-pve - Intel Hybrid (P-core/E-core) Detection
//
// Hybrid parts (12th gen and later) expose per-CPU cpu_capacity: P-cores
// report 1024, E-cores somewhere around 400-800.
//
// Copyright (C) 2025-2026 ghostkellz <ckelley@ghostkellz.sh>

use crate::topology::{CoreGroup, CoreType, CpuRecord};
use log::{debug, warn};
use std::collections::BTreeSet;

/// Capacity at or above which a CPU is a P-core
const PCORE_CAPACITY_MIN: u32 = 1000;

/// Capacity below which a non-zero CPU is an E-core
const ECORE_CAPACITY_MAX: u32 = 900;

/// Classify a CPU from its cpu_capacity value
pub fn classify_capacity(capacity: Option<u32>) -> CoreType {
    match capacity {
        Some(c) if c >= PCORE_CAPACITY_MIN => CoreType::Performance,
        Some(c) if c > 0 && c < ECORE_CAPACITY_MAX => CoreType::Efficiency,
        _ => CoreType::Unknown,
    }
}

/// At least two distinct non-zero capacities means mixed core types
pub fn has_hybrid_capacities(records: &[CpuRecord]) -> bool {
    let capacities: BTreeSet<u32> = records
        .iter()
        .filter_map(|r| r.capacity)
        .filter(|&c| c > 0)
        .collect();
    debug!("Distinct CPU capacities: {:?}", capacities);
    capacities.len() > 1
}

/// Split CPUs into a P-core group and an E-core group
///
/// CPUs with no usable capacity fall back to the sibling count: SMT cores are
/// treated as P-cores, single-thread cores as E-cores. Groups that end up with
/// no physical cores are dropped.
pub fn group_by_core_type(records: &[CpuRecord]) -> Vec<CoreGroup> {
    let mut pcores = CoreGroup::new(0, 0, CoreType::Performance, "P-Cores");
    let mut ecores = CoreGroup::new(1, 0, CoreType::Efficiency, "E-Cores");
    let mut pcore_pkgs = BTreeSet::new();
    let mut ecore_pkgs = BTreeSet::new();

    for cpu in records {
        let is_pcore = match cpu.core_type {
            CoreType::Performance => true,
            CoreType::Efficiency => false,
            CoreType::Unknown => {
                let guess = cpu.siblings.len() > 1;
                warn!(
                    "CPU {}: capacity {:?} is ambiguous, guessing {} from {} sibling(s)",
                    cpu.id,
                    cpu.capacity,
                    if guess { "P-core" } else { "E-core" },
                    cpu.siblings.len()
                );
                if guess {
                    pcores.best_effort = true;
                } else {
                    ecores.best_effort = true;
                }
                guess
            }
        };

        if is_pcore {
            pcores.push(cpu);
            pcore_pkgs.insert(cpu.package_id);
        } else {
            ecores.push(cpu);
            ecore_pkgs.insert(cpu.package_id);
        }
    }

    pcores.package_id = pcore_pkgs.first().copied().unwrap_or(0);
    ecores.package_id = ecore_pkgs.first().copied().unwrap_or(0);

    let mut groups = Vec::with_capacity(2);
    for mut group in [pcores, ecores] {
        group.finish();
        if group.physical_cpus.is_empty() {
            debug!("{}: no physical cores, omitted", group.name);
            continue;
        }
        debug!(
            "{}: {} cores, {} threads",
            group.name,
            group.physical_cpus.len(),
            group.all_cpus.len()
        );
        groups.push(group);
    }
    groups
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::topology::{CpuArch, DetectMethod, DetectOptions, build_topology};

    /// 8 P-cores with SMT (CPUs 0-15, sibling at +1) and `ecores` E-cores after them
    pub(crate) fn hybrid_records(ecores: u32) -> Vec<CpuRecord> {
        let mut records = Vec::new();
        for id in 0..16u32 {
            let first = id & !1;
            records.push(CpuRecord {
                id,
                package_id: 0,
                core_id: id / 2,
                cluster_id: None,
                die_id: None,
                l3_id: Some(0),
                siblings: vec![first, first + 1],
                is_first_thread: id == first,
                capacity: Some(1024),
                core_type: classify_capacity(Some(1024)),
            });
        }
        for id in 16..16 + ecores {
            records.push(CpuRecord {
                id,
                package_id: 0,
                core_id: id,
                cluster_id: None,
                die_id: None,
                l3_id: Some(0),
                siblings: vec![id],
                is_first_thread: true,
                capacity: Some(768),
                core_type: classify_capacity(Some(768)),
            });
        }
        records
    }

    #[test]
    fn test_classify_capacity() {
        assert_eq!(classify_capacity(Some(1024)), CoreType::Performance);
        assert_eq!(classify_capacity(Some(1000)), CoreType::Performance);
        assert_eq!(classify_capacity(Some(768)), CoreType::Efficiency);
        assert_eq!(classify_capacity(Some(950)), CoreType::Unknown);
        assert_eq!(classify_capacity(Some(0)), CoreType::Unknown);
        assert_eq!(classify_capacity(None), CoreType::Unknown);
    }

    #[test]
    fn test_hybrid_capacities() {
        assert!(has_hybrid_capacities(&hybrid_records(16)));
        assert!(!has_hybrid_capacities(&hybrid_records(0)));
    }

    #[test]
    fn test_hybrid_topology() {
        let records = hybrid_records(16);
        let topo = build_topology(&records, "GenuineIntel", &DetectOptions::default()).unwrap();

        assert_eq!(topo.architecture, CpuArch::IntelHybrid);
        assert_eq!(topo.detect_method, DetectMethod::IntelHybrid);
        assert_eq!(topo.total_cpus, 32);
        assert_eq!(topo.total_cores, 24);
        assert!(topo.has_smt);
        assert_eq!(topo.total_pcores(), 8);
        assert_eq!(topo.total_ecores(), 16);

        let p = &topo.core_groups[0];
        assert_eq!(p.name, "P-Cores");
        assert_eq!(p.physical_cpus, vec![0, 2, 4, 6, 8, 10, 12, 14]);
        assert_eq!(p.all_cpus, (0..16).collect::<Vec<_>>());
        assert!(!p.best_effort);
        assert_eq!(topo.core_groups[1].physical_cpus, (16..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_unknown_capacity_uses_siblings() {
        let mut records = hybrid_records(4);
        // one P-core thread pair and one E-core lose their capacity reading
        for r in records.iter_mut().filter(|r| [2, 3, 17].contains(&r.id)) {
            r.capacity = Some(950);
            r.core_type = classify_capacity(r.capacity);
        }

        let groups = group_by_core_type(&records);
        assert_eq!(groups.len(), 2);
        assert!(groups[0].all_cpus.contains(&2) && groups[0].all_cpus.contains(&3));
        assert!(groups[1].all_cpus.contains(&17));
        assert!(groups[0].best_effort);
        assert!(groups[1].best_effort);
    }

    #[test]
    fn test_empty_group_omitted() {
        let records: Vec<CpuRecord> = hybrid_records(0);
        let groups = group_by_core_type(&records);
        assert_eq!(groups.len(), 1);
        assert!(groups[0].is_pcore());
    }
}
