// SPDX-License-Identifier: GPL-2.0
//
// epyc-pve - CPU list encoding ("0-3,8,10-11")
//
// Copyright (C) 2025-2026 ghostkellz <ckelley@ghostkellz.sh>

use anyhow::{Context, Result, bail};

/// Encode a set of CPU ids as a compact range string like "0-2,5,7-8"
///
/// Input order and duplicates don't matter; the output is always ascending.
pub fn format_cpus(cpus: &[u32]) -> String {
    let mut sorted = cpus.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let Some((&first, rest)) = sorted.split_first() else {
        return String::new();
    };

    let mut parts = Vec::new();
    let mut start = first;
    let mut prev = first;
    for &cpu in rest {
        if cpu == prev + 1 {
            prev = cpu;
            continue;
        }
        parts.push(format_range(start, prev));
        start = cpu;
        prev = cpu;
    }
    parts.push(format_range(start, prev));

    parts.join(",")
}

fn format_range(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}-{}", start, end)
    }
}

/// Upper bound (exclusive) on ids accepted by `parse_cpu_list`
pub const MAX_CPU_ID: u32 = 65536;

/// Parse a CPU list string like "0,16" or "0-3,16-19" into sorted, unique CPU ids
pub fn parse_cpu_list(list: &str) -> Result<Vec<u32>> {
    parse_cpu_list_bounded(list, MAX_CPU_ID)
}

/// Like `parse_cpu_list`, but every id must be below `limit`. Checked before any
/// range is expanded.
pub fn parse_cpu_list_bounded(list: &str, limit: u32) -> Result<Vec<u32>> {
    let mut cpus = Vec::new();

    for part in list.trim().split(',') {
        let item = part.trim();
        if item.is_empty() {
            continue;
        }

        if let Some((start, end)) = item.split_once('-') {
            let s: u32 = start
                .trim()
                .parse()
                .with_context(|| format!("Invalid range start in {:?}", item))?;
            let e: u32 = end
                .trim()
                .parse()
                .with_context(|| format!("Invalid range end in {:?}", item))?;
            if e < s {
                bail!("Range end before start in {:?}", item);
            }
            if e >= limit {
                bail!("{} in {:?} is out of range (limit {})", e, item, limit);
            }
            cpus.extend(s..=e);
        } else {
            let cpu: u32 = item
                .parse()
                .with_context(|| format!("Invalid CPU id {:?}", item))?;
            if cpu >= limit {
                bail!("{} is out of range (limit {})", cpu, limit);
            }
            cpus.push(cpu);
        }
    }

    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}
