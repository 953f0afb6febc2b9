// SPDX-License-Identifier: GPL-2.0
//
// epyc-pve - sysfs / procfs readers for per-CPU topology attributes
//
// Copyright (C) 2025-2026 ghostkellz <ckelley@ghostkellz.sh>

use crate::cpulist::parse_cpu_list;
use crate::error::TopologyError;
use crate::intel;
use crate::topology::CpuRecord;
use log::debug;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default sysfs CPU directory
pub const SYSFS_CPU_PATH: &str = "/sys/devices/system/cpu";

/// Default cpuinfo location (vendor string)
pub const CPUINFO_PATH: &str = "/proc/cpuinfo";

/// Reads raw per-CPU topology records from a sysfs-shaped directory tree
#[derive(Debug, Clone)]
pub struct TopologyReader {
    sysfs_root: PathBuf,
    cpuinfo_path: PathBuf,
}

impl Default for TopologyReader {
    fn default() -> Self {
        Self::new(SYSFS_CPU_PATH, CPUINFO_PATH)
    }
}

impl TopologyReader {
    pub fn new(sysfs_root: impl Into<PathBuf>, cpuinfo_path: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            cpuinfo_path: cpuinfo_path.into(),
        }
    }

    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }

    /// Read a record for every logical CPU, sorted by CPU id
    pub fn read_records(&self) -> Result<Vec<CpuRecord>, TopologyError> {
        let cpu_ids = self.list_cpus()?;
        if cpu_ids.is_empty() {
            return Err(TopologyError::Unavailable("no CPUs found".to_string()));
        }

        cpu_ids.into_iter().map(|cpu| self.read_cpu(cpu)).collect()
    }

    /// Enumerate `cpuN` directories under the sysfs root
    pub fn list_cpus(&self) -> Result<Vec<u32>, TopologyError> {
        let root = &self.sysfs_root;
        let meta = fs::metadata(root).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TopologyError::Unavailable(format!(
                "sysfs base path {} not found",
                root.display()
            )),
            io::ErrorKind::PermissionDenied => TopologyError::PermissionDenied {
                path: root.clone(),
                source: e,
            },
            _ => TopologyError::Unavailable(format!("{}: {}", root.display(), e)),
        })?;
        if !meta.is_dir() {
            return Err(TopologyError::Unavailable(format!(
                "sysfs base path {} is not a directory",
                root.display()
            )));
        }

        let entries = fs::read_dir(root).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => TopologyError::PermissionDenied {
                path: root.clone(),
                source: e,
            },
            _ => TopologyError::Unavailable(format!("{}: {}", root.display(), e)),
        })?;

        let mut cpus: Vec<u32> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name();
                let suffix = name.to_str()?.strip_prefix("cpu")?.to_string();
                // cpufreq, cpuidle and friends fail here
                if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                suffix.parse::<u32>().ok()
            })
            .collect();

        cpus.sort_unstable();
        debug!("Found {} CPU directories under {}", cpus.len(), root.display());
        Ok(cpus)
    }

    /// Read all topology attributes of one logical CPU
    pub fn read_cpu(&self, cpu: u32) -> Result<CpuRecord, TopologyError> {
        let topo = self.cpu_dir(cpu).join("topology");

        let package_id = read_optional_u32(&topo.join("physical_package_id"))?.unwrap_or(0);
        let core_id = read_optional_u32(&topo.join("core_id"))?.unwrap_or(cpu);
        let cluster_id = read_optional_u32(&topo.join("cluster_id"))?;
        let die_id = read_optional_u32(&topo.join("die_id"))?;
        let l3_id = self.read_l3_id(cpu)?;

        let mut siblings = match read_attr(&topo.join("thread_siblings_list"))? {
            Some(content) => parse_cpu_list(&content).unwrap_or_else(|e| {
                debug!("CPU {}: bad thread_siblings_list: {:#}", cpu, e);
                vec![cpu]
            }),
            None => vec![cpu],
        };
        siblings.sort_unstable();
        siblings.dedup();

        let capacity = self.read_capacity(cpu);
        let is_first_thread = siblings.first().is_none_or(|&first| first == cpu);

        let record = CpuRecord {
            id: cpu,
            package_id,
            core_id,
            cluster_id,
            die_id,
            l3_id,
            siblings,
            is_first_thread,
            capacity,
            core_type: intel::classify_capacity(capacity),
        };

        debug!(
            "CPU {}: pkg={}, core={}, cluster={:?}, die={:?}, l3={:?}, siblings={:?}, capacity={:?}",
            cpu,
            record.package_id,
            record.core_id,
            record.cluster_id,
            record.die_id,
            record.l3_id,
            record.siblings,
            record.capacity
        );

        Ok(record)
    }

    /// Find the cache index whose level is 3 and return its id
    pub fn read_l3_id(&self, cpu: u32) -> Result<Option<u32>, TopologyError> {
        let cache_dir = self.cpu_dir(cpu).join("cache");
        let entries = match fs::read_dir(&cache_dir) {
            Ok(entries) => entries,
            Err(e) => {
                let e = check_permission(&cache_dir, e)?;
                debug!("CPU {}: no cache info ({})", cpu, e);
                return Ok(None);
            }
        };

        let mut indices: Vec<PathBuf> = entries
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("index"))
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        indices.sort();

        for index in indices {
            if read_optional_u32(&index.join("level"))? == Some(3) {
                return read_optional_u32(&index.join("id"));
            }
        }

        debug!("CPU {}: L3 cache not found", cpu);
        Ok(None)
    }

    /// Relative performance capacity (1024 on P-cores); best-effort
    pub fn read_capacity(&self, cpu: u32) -> Option<u32> {
        let path = self.cpu_dir(cpu).join("cpu_capacity");
        fs::read_to_string(&path)
            .ok()
            .and_then(|content| content.trim().parse().ok())
    }

    /// CPU vendor from cpuinfo ("AuthenticAMD", "GenuineIntel", ...); empty if unknown
    pub fn read_vendor(&self) -> String {
        let Ok(cpuinfo) = fs::read_to_string(&self.cpuinfo_path) else {
            debug!("Could not read {}", self.cpuinfo_path.display());
            return String::new();
        };
        parse_vendor(&cpuinfo)
    }

    fn cpu_dir(&self, cpu: u32) -> PathBuf {
        self.sysfs_root.join(format!("cpu{}", cpu))
    }
}

/// Extract the first `vendor_id` value from cpuinfo text
pub fn parse_vendor(cpuinfo: &str) -> String {
    for line in cpuinfo.lines() {
        if line.starts_with("vendor_id")
            && let Some((_, vendor)) = line.split_once(':')
        {
            return vendor.trim().to_string();
        }
    }
    String::new()
}

/// Read a sysfs attribute. Only permission errors are fatal; anything else is "absent".
fn read_attr(path: &Path) -> Result<Option<String>, TopologyError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) => {
            let e = check_permission(path, e)?;
            debug!("{}: {}", path.display(), e);
            Ok(None)
        }
    }
}

/// Turn a permission error into `PermissionDenied`; hand any other error back
fn check_permission(path: &Path, e: io::Error) -> Result<io::Error, TopologyError> {
    if e.kind() == io::ErrorKind::PermissionDenied {
        return Err(TopologyError::PermissionDenied {
            path: path.to_path_buf(),
            source: e,
        });
    }
    Ok(e)
}

fn read_optional_u32(path: &Path) -> Result<Option<u32>, TopologyError> {
    let Some(content) = read_attr(path)? else {
        return Ok(None);
    };
    match content.trim().parse() {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            debug!("Failed to parse {}: {}", path.display(), e);
            Ok(None)
        }
    }
}
