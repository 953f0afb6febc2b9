// SPDX-License-Identifier: GPL-2.0
//
// epyc-pve - Affinity strategy generation
//
// Turns "N vCPUs, with or without SMT siblings" into candidate CPU sets:
// single CCD, round-robin across CCDs, sequential, random, and P/E-core
// variants on Intel hybrid parts.
//
// Copyright (C) 2025-2026 ghostkellz <ckelley@ghostkellz.sh>

use crate::cpulist::format_cpus;
use crate::error::AffinityError;
use crate::topology::{CoreGroup, CpuTopology};
use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    SingleCcd,
    Distributed,
    Sequential,
    Random,
    Manual,
    PCores,
    ECores,
    AllCores,
}

impl Strategy {
    pub const ALL: &'static [Strategy] = &[
        Strategy::SingleCcd,
        Strategy::Distributed,
        Strategy::Sequential,
        Strategy::Random,
        Strategy::Manual,
        Strategy::PCores,
        Strategy::ECores,
        Strategy::AllCores,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::SingleCcd => "single-ccd",
            Strategy::Distributed => "distributed",
            Strategy::Sequential => "sequential",
            Strategy::Random => "random",
            Strategy::Manual => "manual",
            Strategy::PCores => "p-cores",
            Strategy::ECores => "e-cores",
            Strategy::AllCores => "all-cores",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Strategy::ALL
            .iter()
            .copied()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| {
                let valid: Vec<&str> = Strategy::ALL.iter().map(|s| s.as_str()).collect();
                format!("invalid strategy {:?} (valid: {})", s, valid.join(", "))
            })
    }
}

/// A request for `cores_needed` CPUs against a detected topology
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    /// vCPUs wanted (physical cores when SMT is excluded)
    pub cores_needed: usize,
    /// Hand out SMT siblings alongside their physical cores
    pub include_smt: bool,
    pub topology: Option<&'a CpuTopology>,
}

impl<'a> Request<'a> {
    pub fn new(topology: &'a CpuTopology, cores_needed: usize, include_smt: bool) -> Self {
        Self {
            cores_needed,
            include_smt,
            topology: Some(topology),
        }
    }
}

/// One candidate CPU set. An empty `cpus` means the strategy could not satisfy
/// the request and `description` says why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AffinityOption {
    pub strategy: Strategy,
    pub name: String,
    pub description: String,
    pub cpus: Vec<u32>,
    /// `cpus` as a range string, ready for `qm set --affinity`
    pub affinity: String,
    pub groups_used: usize,
}

impl AffinityOption {
    fn new(strategy: Strategy, name: &str, description: impl Into<String>) -> Self {
        Self {
            strategy,
            name: name.to_string(),
            description: description.into(),
            cpus: Vec::new(),
            affinity: String::new(),
            groups_used: 0,
        }
    }

    fn unavailable(mut self, reason: impl fmt::Display) -> Self {
        self.description = format!("Unavailable: {}", reason);
        self.cpus.clear();
        self.affinity.clear();
        self
    }

    pub fn is_available(&self) -> bool {
        !self.cpus.is_empty()
    }
}

/// Physical cores required to satisfy a request
///
/// With SMT siblings included every core supplies two vCPUs.
pub fn physical_cores_needed(req: &Request) -> Result<usize, AffinityError> {
    let topology = req.topology.ok_or(AffinityError::MissingTopology)?;
    if req.cores_needed == 0 {
        return Err(AffinityError::InvalidCount);
    }

    let needed = if req.include_smt && topology.has_smt {
        req.cores_needed.div_ceil(2)
    } else {
        req.cores_needed
    };

    if needed > topology.total_cores {
        return Err(AffinityError::CapacityExceeded {
            needed,
            requested: req.cores_needed,
            available: topology.total_cores,
        });
    }

    Ok(needed)
}

/// Minimum number of groups that can hold `physical_needed` cores, assuming
/// every group is the size of the first one
pub fn min_groups_needed(topology: &CpuTopology, physical_needed: usize) -> usize {
    let groups = topology.sorted_groups();
    let Some(first) = groups.first() else {
        return 0;
    };
    let per_group = first.physical_cpus.len().max(1);
    physical_needed.div_ceil(per_group).min(groups.len())
}

/// Generate every strategy for a request. The random strategy is seeded from
/// the clock, so repeated calls may differ.
pub fn generate(req: &Request) -> Result<Vec<AffinityOption>, AffinityError> {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let mut rng = StdRng::seed_from_u64(seed);
    generate_with_rng(req, &mut rng)
}

/// Generate every strategy using the supplied RNG for the random strategy
pub fn generate_with_rng<R: Rng + ?Sized>(
    req: &Request,
    rng: &mut R,
) -> Result<Vec<AffinityOption>, AffinityError> {
    let plan = Plan::new(req)?;
    debug!(
        "Generating options: {} CPUs -> {} physical cores (SMT: {})",
        req.cores_needed,
        plan.needed,
        plan.expand_smt()
    );

    let options = if plan.topology.is_hybrid() {
        vec![
            plan.pcores_only(),
            plan.ecores_only(),
            plan.all_cores(),
            plan.sequential(),
            plan.random(rng),
            plan.manual_placeholder(),
        ]
    } else {
        vec![
            plan.single_ccd(),
            plan.distributed(),
            plan.sequential(),
            plan.random(rng),
            plan.manual_placeholder(),
        ]
    };

    for option in &options {
        debug!(
            "{}: {} ({} groups)",
            option.strategy,
            if option.is_available() {
                option.affinity.as_str()
            } else {
                option.description.as_str()
            },
            option.groups_used
        );
    }

    Ok(options)
}

/// Build an option from an explicit list of group indices (in `sorted_groups`
/// order). Fails if the chosen groups can't hold the request.
pub fn generate_manual(
    req: &Request,
    group_indices: &[usize],
) -> Result<AffinityOption, AffinityError> {
    let plan = Plan::new(req)?;
    if group_indices.is_empty() {
        return Err(AffinityError::EmptySelection);
    }

    let mut indices = group_indices.to_vec();
    indices.sort_unstable();
    indices.dedup();

    let chosen: Vec<&CoreGroup> = indices
        .iter()
        .filter_map(|&i| {
            let group = plan.groups.get(i).copied();
            if group.is_none() {
                debug!("Ignoring out-of-range group index {}", i);
            }
            group
        })
        .collect();

    let selected = take_from_groups(&chosen, plan.needed);
    if selected.len() < plan.needed {
        return Err(AffinityError::InsufficientSelection {
            available: selected.len(),
            needed: plan.needed,
        });
    }

    let option = AffinityOption::new(
        Strategy::Manual,
        "Manual",
        format!("Manually selected {} {}", chosen.len(), plan.group_noun()),
    );
    let groups_used = groups_touched(&selected, &plan.groups);
    Ok(plan.fill(option, selected, groups_used))
}

/// Expand physical cores to their SMT siblings, sorted and unique
///
/// Returns the physical ids unchanged (sorted) when SMT is not requested or
/// the topology has none.
pub fn expand_to_vcpus(physical: &[u32], include_smt: bool, topology: &CpuTopology) -> Vec<u32> {
    let siblings = if include_smt && topology.has_smt {
        Some(sibling_map(&topology.core_groups))
    } else {
        None
    };
    expand_with(physical, siblings.as_ref())
}

fn expand_with(physical: &[u32], siblings: Option<&HashMap<u32, Vec<u32>>>) -> Vec<u32> {
    let mut cpus: Vec<u32> = match siblings {
        Some(map) => physical
            .iter()
            .flat_map(|phys| map.get(phys).cloned().unwrap_or_else(|| vec![*phys]))
            .collect(),
        None => physical.to_vec(),
    };
    cpus.sort_unstable();
    cpus.dedup();
    cpus
}

/// Pair the i-th physical core of each group with the i-th remaining thread
fn sibling_map(groups: &[CoreGroup]) -> HashMap<u32, Vec<u32>> {
    let mut map = HashMap::new();
    for group in groups {
        let physical: BTreeSet<u32> = group.physical_cpus.iter().copied().collect();
        let mut threads = group.all_cpus.iter().filter(|cpu| !physical.contains(cpu));
        for &phys in &group.physical_cpus {
            let mut siblings = vec![phys];
            if let Some(&thread) = threads.next() {
                siblings.push(thread);
            }
            map.insert(phys, siblings);
        }
    }
    map
}

/// Take physical cores from each group in turn until `needed` is reached
fn take_from_groups(groups: &[&CoreGroup], needed: usize) -> Vec<u32> {
    groups
        .iter()
        .flat_map(|g| g.physical_cpus.iter().copied())
        .take(needed)
        .collect()
}

/// Number of groups owning at least one of the selected physical cores
fn groups_touched(selected: &[u32], groups: &[&CoreGroup]) -> usize {
    let selected: BTreeSet<u32> = selected.iter().copied().collect();
    groups
        .iter()
        .filter(|g| g.physical_cpus.iter().any(|cpu| selected.contains(cpu)))
        .count()
}

/// A validated request plus lookups shared by all strategies
struct Plan<'a> {
    topology: &'a CpuTopology,
    needed: usize,
    /// Groups in (package, id) order
    groups: Vec<&'a CoreGroup>,
    siblings: Option<HashMap<u32, Vec<u32>>>,
}

impl<'a> Plan<'a> {
    fn new(req: &Request<'a>) -> Result<Self, AffinityError> {
        let needed = physical_cores_needed(req)?;
        let topology = req.topology.ok_or(AffinityError::MissingTopology)?;
        let siblings = if req.include_smt && topology.has_smt {
            Some(sibling_map(&topology.core_groups))
        } else {
            None
        };

        Ok(Self {
            topology,
            needed,
            groups: topology.sorted_groups(),
            siblings,
        })
    }

    fn expand_smt(&self) -> bool {
        self.siblings.is_some()
    }

    fn group_noun(&self) -> &'static str {
        if self.topology.is_hybrid() {
            "core groups"
        } else {
            "CCDs"
        }
    }

    fn fill(&self, mut option: AffinityOption, physical: Vec<u32>, groups_used: usize) -> AffinityOption {
        option.cpus = expand_with(&physical, self.siblings.as_ref());
        option.affinity = format_cpus(&option.cpus);
        option.groups_used = groups_used;
        option
    }

    /// First N cores from the first CCD large enough
    fn single_ccd(&self) -> AffinityOption {
        let option = AffinityOption::new(
            Strategy::SingleCcd,
            "Single CCD",
            "All cores from one CCD (best cache locality)",
        );

        match self
            .groups
            .iter()
            .find(|g| g.physical_cpus.len() >= self.needed)
        {
            Some(group) => {
                let physical = group.physical_cpus[..self.needed].to_vec();
                self.fill(option, physical, 1)
            }
            None => option.unavailable(format!("no single CCD has {} cores", self.needed)),
        }
    }

    /// Round-robin one core at a time across CCDs
    fn distributed(&self) -> AffinityOption {
        let option = AffinityOption::new(
            Strategy::Distributed,
            "Distributed",
            "Spread cores across CCDs",
        );

        let mut selected = Vec::with_capacity(self.needed);
        let mut used = BTreeSet::new();
        let mut positions = vec![0usize; self.groups.len()];

        while selected.len() < self.needed {
            let mut progress = false;
            for (i, group) in self.groups.iter().enumerate() {
                if selected.len() >= self.needed {
                    break;
                }
                if let Some(&cpu) = group.physical_cpus.get(positions[i]) {
                    selected.push(cpu);
                    positions[i] += 1;
                    used.insert(i);
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }

        if selected.len() < self.needed {
            return option.unavailable(format!(
                "only {} of {} cores found across CCDs",
                selected.len(),
                self.needed
            ));
        }
        self.fill(option, selected, used.len())
    }

    /// Lowest N physical core ids, ignoring group boundaries
    fn sequential(&self) -> AffinityOption {
        let option = AffinityOption::new(
            Strategy::Sequential,
            "Sequential",
            "First N cores in CPU order",
        );

        let selected: Vec<u32> = self
            .topology
            .physical_cpus()
            .into_iter()
            .take(self.needed)
            .collect();
        if selected.len() < self.needed {
            return option.unavailable(format!("only {} cores available", selected.len()));
        }

        let groups_used = groups_touched(&selected, &self.groups);
        self.fill(option, selected, groups_used)
    }

    /// Cores from a random choice of the minimum number of groups
    fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> AffinityOption {
        let option = AffinityOption::new(
            Strategy::Random,
            "Random",
            format!("Randomly select from minimum {} needed", self.group_noun()),
        );

        if self.groups.is_empty() {
            return option.unavailable("no core groups detected");
        }

        let min_groups = min_groups_needed(self.topology, self.needed);
        let mut order: Vec<usize> = (0..self.groups.len()).collect();
        order.shuffle(rng);

        let (head, tail) = order.split_at(min_groups);
        let mut chosen = head.to_vec();
        chosen.sort_unstable();

        let mut selected = self.take_indices(&chosen);
        // Uneven groups: the first group's size was optimistic, keep drawing
        for &extra in tail {
            if selected.len() >= self.needed {
                break;
            }
            chosen.push(extra);
            chosen.sort_unstable();
            selected = self.take_indices(&chosen);
        }

        if selected.len() < self.needed {
            return option.unavailable(format!("only {} cores available", selected.len()));
        }

        let groups_used = groups_touched(&selected, &self.groups);
        self.fill(option, selected, groups_used)
    }

    fn take_indices(&self, indices: &[usize]) -> Vec<u32> {
        let groups: Vec<&CoreGroup> = indices.iter().map(|&i| self.groups[i]).collect();
        take_from_groups(&groups, self.needed)
    }

    /// Carries only the group count a manual picker needs to ask for
    fn manual_placeholder(&self) -> AffinityOption {
        let min_groups = min_groups_needed(self.topology, self.needed);
        let mut option = AffinityOption::new(
            Strategy::Manual,
            "Manual",
            format!("Select {} {} manually", min_groups, self.group_noun()),
        );
        option.groups_used = min_groups;
        option
    }

    fn pcores_only(&self) -> AffinityOption {
        let option = AffinityOption::new(
            Strategy::PCores,
            "P-Cores Only",
            "Performance cores only (highest single-thread speed)",
        );
        let groups: Vec<&CoreGroup> = self.groups.iter().copied().filter(|g| g.is_pcore()).collect();
        self.from_pool(option, &groups, "P-cores")
    }

    fn ecores_only(&self) -> AffinityOption {
        let option = AffinityOption::new(
            Strategy::ECores,
            "E-Cores Only",
            "Efficiency cores only (background workloads)",
        );
        let groups: Vec<&CoreGroup> = self.groups.iter().copied().filter(|g| g.is_ecore()).collect();
        self.from_pool(option, &groups, "E-cores")
    }

    /// P-cores and E-cores merged by CPU id
    fn all_cores(&self) -> AffinityOption {
        let option = AffinityOption::new(
            Strategy::AllCores,
            "All Cores",
            "P-cores and E-cores in CPU order",
        );
        let groups: Vec<&CoreGroup> = self
            .groups
            .iter()
            .copied()
            .filter(|g| g.is_pcore() || g.is_ecore())
            .collect();
        self.from_pool(option, &groups, "P-cores and E-cores")
    }

    /// Lowest N physical ids among `groups`
    fn from_pool(&self, option: AffinityOption, groups: &[&CoreGroup], what: &str) -> AffinityOption {
        let pool: BTreeSet<u32> = groups
            .iter()
            .flat_map(|g| g.physical_cpus.iter().copied())
            .collect();
        if pool.len() < self.needed {
            return option.unavailable(format!(
                "need {} {}, only {} available",
                self.needed,
                what,
                pool.len()
            ));
        }

        let selected: Vec<u32> = pool.into_iter().take(self.needed).collect();
        let groups_used = groups_touched(&selected, groups);
        self.fill(option, selected, groups_used)
    }
}
