// SPDX-License-Identifier: GPL-2.0
//
// epyc-pve - CPU Topology Detection for AMD chiplet and Intel Hybrid processors
//
// Copyright (C) 2025-2026 ghostkellz <ckelley@ghostkellz.sh>

use crate::error::TopologyError;
use crate::intel;
use crate::sysfs::TopologyReader;
use log::{debug, info};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Assumed cores per CCD when no sysfs signal identifies the chiplets
pub const DEFAULT_CORES_PER_GROUP: u32 = 8;

/// Vendor ids that get chiplet (CCD) grouping
const AMD_VENDORS: &[&str] = &["AuthenticAMD", "AMD"];

const INTEL_VENDOR: &str = "GenuineIntel";

/// CPU architecture family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuArch {
    /// AMD chiplet design (CCDs sharing an L3 each)
    Amd,
    /// Intel hybrid architecture (P-cores and E-cores)
    IntelHybrid,
    /// Anything else; one group with every CPU
    Generic,
}

impl fmt::Display for CpuArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuArch::Amd => write!(f, "amd"),
            CpuArch::IntelHybrid => write!(f, "intel_hybrid"),
            CpuArch::Generic => write!(f, "generic"),
        }
    }
}

/// Which signal was used to form core groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectMethod {
    /// Shared L3 cache id
    L3Cache,
    /// topology/cluster_id
    ClusterId,
    /// topology/die_id
    DieId,
    /// core_id / cores-per-group
    Inferred,
    /// cpu_capacity based P/E split
    IntelHybrid,
    Generic,
}

impl fmt::Display for DetectMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DetectMethod::L3Cache => "l3_cache",
            DetectMethod::ClusterId => "cluster_id",
            DetectMethod::DieId => "die_id",
            DetectMethod::Inferred => "inferred",
            DetectMethod::IntelHybrid => "intel_hybrid",
            DetectMethod::Generic => "generic",
        };
        f.write_str(s)
    }
}

/// Core type of a CPU or group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreType {
    Performance,
    Efficiency,
    Unknown,
}

/// Raw per-CPU attributes from one detection pass
#[derive(Debug, Clone, PartialEq)]
pub struct CpuRecord {
    pub id: u32,
    pub package_id: u32,
    pub core_id: u32,
    pub cluster_id: Option<u32>,
    pub die_id: Option<u32>,
    pub l3_id: Option<u32>,
    /// Sorted, unique thread siblings (includes this CPU)
    pub siblings: Vec<u32>,
    /// Lowest-numbered thread of its physical core
    pub is_first_thread: bool,
    /// cpu_capacity; `Some(0)` is an observed zero, `None` is unreadable
    pub capacity: Option<u32>,
    pub core_type: CoreType,
}

/// A set of physical cores sharing a cache domain or core type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoreGroup {
    /// Display id, numbered from 0 within the package
    pub id: u32,
    /// Grouping key before renumbering (L3 id, cluster id, ...)
    pub raw_id: u32,
    pub package_id: u32,
    #[serde(rename = "type")]
    pub core_type: CoreType,
    pub name: String,
    pub l3_cache_id: Option<u32>,
    /// First thread of each physical core
    pub physical_cpus: Vec<u32>,
    /// Every thread
    pub all_cpus: Vec<u32>,
    /// Membership partly guessed from sibling counts
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub best_effort: bool,
}

impl CoreGroup {
    pub(crate) fn new(
        id: u32,
        package_id: u32,
        core_type: CoreType,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            raw_id: id,
            package_id,
            core_type,
            name: name.into(),
            l3_cache_id: None,
            physical_cpus: Vec::new(),
            all_cpus: Vec::new(),
            best_effort: false,
        }
    }

    pub(crate) fn push(&mut self, cpu: &CpuRecord) {
        self.all_cpus.push(cpu.id);
        if cpu.is_first_thread {
            self.physical_cpus.push(cpu.id);
        }
    }

    pub(crate) fn finish(&mut self) {
        self.all_cpus.sort_unstable();
        self.all_cpus.dedup();
        self.physical_cpus.sort_unstable();
        self.physical_cpus.dedup();
    }

    pub fn is_pcore(&self) -> bool {
        self.core_type == CoreType::Performance
    }

    pub fn is_ecore(&self) -> bool {
        self.core_type == CoreType::Efficiency
    }
}

/// Core groups sharing a physical package (socket)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Package {
    pub id: u32,
    pub core_groups: Vec<CoreGroup>,
}

/// CPU topology snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuTopology {
    pub architecture: CpuArch,
    /// Logical CPUs
    pub total_cpus: usize,
    /// Physical cores
    pub total_cores: usize,
    pub has_smt: bool,
    pub detect_method: DetectMethod,
    pub packages: Vec<Package>,
    pub core_groups: Vec<CoreGroup>,
}

impl CpuTopology {
    /// Groups in (package, id) order
    pub fn sorted_groups(&self) -> Vec<&CoreGroup> {
        let mut groups: Vec<&CoreGroup> = self.core_groups.iter().collect();
        groups.sort_by_key(|g| (g.package_id, g.id));
        groups
    }

    pub fn pcore_groups(&self) -> impl Iterator<Item = &CoreGroup> {
        self.core_groups.iter().filter(|g| g.is_pcore())
    }

    pub fn ecore_groups(&self) -> impl Iterator<Item = &CoreGroup> {
        self.core_groups.iter().filter(|g| g.is_ecore())
    }

    pub fn total_pcores(&self) -> usize {
        self.pcore_groups().map(|g| g.physical_cpus.len()).sum()
    }

    pub fn total_ecores(&self) -> usize {
        self.ecore_groups().map(|g| g.physical_cpus.len()).sum()
    }

    /// Every physical core id, ascending
    pub fn physical_cpus(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = self
            .core_groups
            .iter()
            .flat_map(|g| g.physical_cpus.iter().copied())
            .collect();
        set.into_iter().collect()
    }

    pub fn is_hybrid(&self) -> bool {
        self.architecture == CpuArch::IntelHybrid
    }
}

/// Tunables for topology grouping
#[derive(Debug, Clone, Copy)]
pub struct DetectOptions {
    /// Group size for positional (core_id based) CCD inference
    pub cores_per_group: u32,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            cores_per_group: DEFAULT_CORES_PER_GROUP,
        }
    }
}

/// Detect CPU topology from sysfs
pub fn detect_topology(
    reader: &TopologyReader,
    options: &DetectOptions,
) -> Result<CpuTopology, TopologyError> {
    debug!("Reading topology from {}", reader.sysfs_root().display());
    let records = reader.read_records()?;
    let vendor = reader.read_vendor();
    debug!("CPU vendor: {:?}", vendor);

    let topology = build_topology(&records, &vendor, options)?;
    info!(
        "Detected {} CPUs, {} cores, {} groups ({} via {})",
        topology.total_cpus,
        topology.total_cores,
        topology.core_groups.len(),
        topology.architecture,
        topology.detect_method
    );
    Ok(topology)
}

/// Build a topology snapshot from already-read CPU records
pub fn build_topology(
    records: &[CpuRecord],
    vendor: &str,
    options: &DetectOptions,
) -> Result<CpuTopology, TopologyError> {
    if records.is_empty() {
        return Err(TopologyError::Unavailable("no CPUs found".to_string()));
    }

    let total_cpus = records.len();
    let total_cores = records.iter().filter(|r| r.is_first_thread).count();
    let has_smt = total_cpus > total_cores;
    debug!("SMT enabled: {}", has_smt);

    let architecture = classify_architecture(records, vendor);
    let (detect_method, core_groups) = match architecture {
        CpuArch::Amd => {
            let method = detect_ccd_method(records);
            (method, group_by_ccd(records, method, options.cores_per_group))
        }
        CpuArch::IntelHybrid => (DetectMethod::IntelHybrid, intel::group_by_core_type(records)),
        CpuArch::Generic => {
            info!("No CCD or hybrid signal found, using a single core group");
            (DetectMethod::Generic, vec![generic_group(records)])
        }
    };

    for group in &core_groups {
        debug!(
            "{} (pkg {}, raw id {}): physical {:?}, all {:?}",
            group.name, group.package_id, group.raw_id, group.physical_cpus, group.all_cpus
        );
    }

    Ok(CpuTopology {
        architecture,
        total_cpus,
        total_cores,
        has_smt,
        detect_method,
        packages: build_packages(&core_groups),
        core_groups,
    })
}

/// Classify the architecture family from vendor and per-CPU signals
pub fn classify_architecture(records: &[CpuRecord], vendor: &str) -> CpuArch {
    if AMD_VENDORS.contains(&vendor) {
        return CpuArch::Amd;
    }

    if vendor == INTEL_VENDOR {
        return if intel::has_hybrid_capacities(records) {
            CpuArch::IntelHybrid
        } else {
            CpuArch::Generic
        };
    }

    // Unknown vendor, but several L3 domains look like chiplets
    if distinct_l3_count(records) > 1 {
        debug!("Unknown vendor {:?} with multiple L3 domains", vendor);
        return CpuArch::Amd;
    }

    CpuArch::Generic
}

fn distinct_l3_count(records: &[CpuRecord]) -> usize {
    records
        .iter()
        .filter_map(|r| r.l3_id)
        .collect::<BTreeSet<_>>()
        .len()
}

/// Pick the strongest CCD signal every CPU agrees on
pub fn detect_ccd_method(records: &[CpuRecord]) -> DetectMethod {
    if records.is_empty() {
        return DetectMethod::Inferred;
    }

    if records.iter().all(|r| r.l3_id.is_some()) && distinct_l3_count(records) > 1 {
        return DetectMethod::L3Cache;
    }
    if records.iter().all(|r| r.cluster_id.is_some()) {
        return DetectMethod::ClusterId;
    }
    if records.iter().all(|r| r.die_id.is_some()) {
        return DetectMethod::DieId;
    }

    DetectMethod::Inferred
}

/// Bucket CPUs into CCDs by (package, key) and renumber per package
fn group_by_ccd(records: &[CpuRecord], method: DetectMethod, cores_per_group: u32) -> Vec<CoreGroup> {
    let mut buckets: BTreeMap<(u32, u32), CoreGroup> = BTreeMap::new();

    for cpu in records {
        let key = match method {
            DetectMethod::L3Cache => cpu.l3_id,
            DetectMethod::ClusterId => cpu.cluster_id,
            DetectMethod::DieId => cpu.die_id,
            _ => None,
        }
        .unwrap_or_else(|| cpu.core_id / cores_per_group.max(1));

        let group = buckets.entry((cpu.package_id, key)).or_insert_with(|| {
            let mut group = CoreGroup::new(key, cpu.package_id, CoreType::Unknown, "");
            group.l3_cache_id = cpu.l3_id;
            group
        });
        group.push(cpu);
    }

    // BTreeMap iteration is already (package, key) ordered
    let mut next_id: HashMap<u32, u32> = HashMap::new();
    buckets
        .into_values()
        .map(|mut group| {
            let id = next_id.entry(group.package_id).or_insert(0);
            group.id = *id;
            group.name = format!("CCD {}", *id);
            *id += 1;
            group.finish();
            group
        })
        .collect()
}

fn generic_group(records: &[CpuRecord]) -> CoreGroup {
    let package_id = records.iter().map(|r| r.package_id).min().unwrap_or(0);
    let mut group = CoreGroup::new(0, package_id, CoreType::Unknown, "All Cores");
    for cpu in records {
        group.push(cpu);
    }
    group.finish();
    group
}

/// Gather groups under their packages; P-cores first, then by id
fn build_packages(groups: &[CoreGroup]) -> Vec<Package> {
    let mut by_package: BTreeMap<u32, Vec<CoreGroup>> = BTreeMap::new();
    for group in groups {
        by_package
            .entry(group.package_id)
            .or_default()
            .push(group.clone());
    }

    by_package
        .into_iter()
        .map(|(id, mut core_groups)| {
            core_groups.sort_by_key(|g| (!g.is_pcore(), g.id));
            Package { id, core_groups }
        })
        .collect()
}
