// SPDX-License-Identifier: GPL-2.0
//
// epyc-pve Integration Tests
//
// Detection runs against fake sysfs trees built in a temp dir; the binary is
// driven through --config so it never touches the host's /sys or qm.
//
// Run with: cargo test --test integration_tests
//
// Copyright (C) 2025-2026 ghostkellz <ckelley@ghostkellz.sh>

use epyc_pve::affinity::{self, Request, Strategy};
use epyc_pve::cli::{self, ApplyPlan};
use epyc_pve::error::TopologyError;
use epyc_pve::pve::{PveError, Vm, VmManager};
use epyc_pve::sysfs::TopologyReader;
use epyc_pve::topology::{CpuArch, CpuTopology, DetectMethod, DetectOptions, detect_topology};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// Per-CPU attributes written into the fake tree
struct FakeCpu {
    id: u32,
    package: u32,
    core: u32,
    siblings: String,
    l3: Option<u32>,
    cluster: Option<u32>,
    die: Option<u32>,
    capacity: Option<u32>,
}

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, format!("{}\n", content)).unwrap();
}

/// Lay out `cpuN/topology` (optional cluster and die ids), `cpuN/cache`,
/// `cpuN/cpu_capacity` and a cpuinfo file
fn fake_sysfs(vendor: &str, cpus: &[FakeCpu]) -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("cpu");

    for cpu in cpus {
        let cpu_dir = root.join(format!("cpu{}", cpu.id));
        let topo = cpu_dir.join("topology");
        write(&topo.join("physical_package_id"), &cpu.package.to_string());
        write(&topo.join("core_id"), &cpu.core.to_string());
        write(&topo.join("thread_siblings_list"), &cpu.siblings);
        if let Some(cluster) = cpu.cluster {
            write(&topo.join("cluster_id"), &cluster.to_string());
        }
        if let Some(die) = cpu.die {
            write(&topo.join("die_id"), &die.to_string());
        }

        // L1 first so the reader has to look for level 3
        let index0 = cpu_dir.join("cache/index0");
        write(&index0.join("level"), "1");
        write(&index0.join("id"), &cpu.core.to_string());
        if let Some(l3) = cpu.l3 {
            let index3 = cpu_dir.join("cache/index3");
            write(&index3.join("level"), "3");
            write(&index3.join("id"), &l3.to_string());
        }
        if let Some(capacity) = cpu.capacity {
            write(&cpu_dir.join("cpu_capacity"), &capacity.to_string());
        }
    }

    // Non-CPU entries that must be ignored
    fs::create_dir_all(root.join("cpufreq")).unwrap();
    fs::create_dir_all(root.join("cpuidle")).unwrap();
    write(&root.join("online"), "0-63");

    write(
        &dir.path().join("cpuinfo"),
        &format!("processor\t: 0\nvendor_id\t: {}\ncpu family\t: 25\n", vendor),
    );
    dir
}

fn reader(dir: &TempDir) -> TopologyReader {
    TopologyReader::new(dir.path().join("cpu"), dir.path().join("cpuinfo"))
}

/// 16 cores / 32 threads in two L3 domains, siblings at +16
fn zen_cpus() -> Vec<FakeCpu> {
    (0..32)
        .map(|id| {
            let core = id % 16;
            FakeCpu {
                id,
                package: 0,
                core,
                siblings: format!("{},{}", core, core + 16),
                l3: Some(core / 8),
                cluster: None,
                die: None,
                capacity: None,
            }
        })
        .collect()
}

/// 8 P-cores with adjacent SMT siblings (0-15) and 8 E-cores (16-23)
fn hybrid_cpus() -> Vec<FakeCpu> {
    let mut cpus: Vec<FakeCpu> = (0..16)
        .map(|id| {
            let first = id & !1;
            FakeCpu {
                id,
                package: 0,
                core: id / 2,
                siblings: format!("{}-{}", first, first + 1),
                l3: Some(0),
                cluster: None,
                die: None,
                capacity: Some(1024),
            }
        })
        .collect();
    cpus.extend((16..24).map(|id| FakeCpu {
        id,
        package: 0,
        core: id,
        siblings: id.to_string(),
        l3: Some(0),
        cluster: None,
        die: None,
        capacity: Some(768),
    }));
    cpus
}

fn detect(dir: &TempDir) -> CpuTopology {
    detect_topology(&reader(dir), &DetectOptions::default()).unwrap()
}

#[test]
fn test_detect_amd_two_ccds() {
    let dir = fake_sysfs("AuthenticAMD", &zen_cpus());
    let topo = detect(&dir);

    assert_eq!(topo.architecture, CpuArch::Amd);
    assert_eq!(topo.detect_method, DetectMethod::L3Cache);
    assert_eq!(topo.total_cpus, 32);
    assert_eq!(topo.total_cores, 16);
    assert!(topo.has_smt);
    assert_eq!(topo.packages.len(), 1);
    assert_eq!(topo.core_groups.len(), 2);

    let ccd1 = &topo.core_groups[1];
    assert_eq!(ccd1.name, "CCD 1");
    assert_eq!(ccd1.l3_cache_id, Some(1));
    assert_eq!(ccd1.physical_cpus, (8..16).collect::<Vec<u32>>());
    assert_eq!(
        ccd1.all_cpus,
        (8..16).chain(24..32).collect::<Vec<u32>>()
    );
}

#[test]
fn test_detect_dual_socket_renumbers_per_package() {
    // two packages, each with two L3 domains of 4 cores; L3 ids are global
    let cpus: Vec<FakeCpu> = (0..16)
        .map(|id| FakeCpu {
            id,
            package: id / 8,
            core: id % 8,
            siblings: id.to_string(),
            l3: Some(id / 4),
            cluster: None,
            die: None,
            capacity: None,
        })
        .collect();
    let dir = fake_sysfs("AuthenticAMD", &cpus);
    let topo = detect(&dir);

    assert_eq!(topo.packages.len(), 2);
    assert!(!topo.has_smt);
    let second = &topo.packages[1].core_groups;
    assert_eq!(second.len(), 2);
    assert_eq!(second[0].id, 0);
    assert_eq!(second[0].raw_id, 2);
    assert_eq!(second[1].physical_cpus, vec![12, 13, 14, 15]);
}

#[test]
fn test_detect_intel_hybrid() {
    let dir = fake_sysfs("GenuineIntel", &hybrid_cpus());
    let topo = detect(&dir);

    assert_eq!(topo.architecture, CpuArch::IntelHybrid);
    assert_eq!(topo.detect_method, DetectMethod::IntelHybrid);
    assert_eq!(topo.total_pcores(), 8);
    assert_eq!(topo.total_ecores(), 8);
    assert_eq!(topo.total_cpus, 24);

    let pcores = topo.pcore_groups().next().unwrap();
    assert_eq!(pcores.physical_cpus, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    assert_eq!(pcores.all_cpus.len(), 16);
    assert!(!pcores.best_effort);
}

#[test]
fn test_detect_intel_without_capacity_is_generic() {
    let mut cpus = hybrid_cpus();
    for cpu in &mut cpus {
        cpu.capacity = None;
    }
    let dir = fake_sysfs("GenuineIntel", &cpus);
    let topo = detect(&dir);

    assert_eq!(topo.architecture, CpuArch::Generic);
    assert_eq!(topo.core_groups.len(), 1);
    assert_eq!(topo.core_groups[0].physical_cpus.len(), 16);
}

#[test]
fn test_detect_inferred_groups() {
    // no L3 info at all: fall back to core_id / cores_per_group
    let cpus: Vec<FakeCpu> = (0..12)
        .map(|id| FakeCpu {
            id,
            package: 0,
            core: id,
            siblings: id.to_string(),
            l3: None,
            cluster: None,
            die: None,
            capacity: None,
        })
        .collect();
    let dir = fake_sysfs("AuthenticAMD", &cpus);

    let options = DetectOptions { cores_per_group: 6 };
    let topo = detect_topology(&reader(&dir), &options).unwrap();
    assert_eq!(topo.detect_method, DetectMethod::Inferred);
    assert_eq!(topo.core_groups.len(), 2);
    assert_eq!(topo.core_groups[1].physical_cpus, (6..12).collect::<Vec<u32>>());
}

#[test]
fn test_detect_cluster_groups_without_l3() {
    // no L3 entries, but every CPU carries a cluster id; ids are global across packages
    let cpus: Vec<FakeCpu> = (0..16)
        .map(|id| FakeCpu {
            id,
            package: id / 8,
            core: id % 8,
            siblings: id.to_string(),
            l3: None,
            cluster: Some(10 + id / 4),
            die: Some(id / 8),
            capacity: None,
        })
        .collect();
    let dir = fake_sysfs("AuthenticAMD", &cpus);
    let topo = detect(&dir);

    assert_eq!(topo.detect_method, DetectMethod::ClusterId);
    assert_eq!(topo.core_groups.len(), 4);
    let raw: Vec<u32> = topo.core_groups.iter().map(|g| g.raw_id).collect();
    assert_eq!(raw, vec![10, 11, 12, 13]);

    let second = &topo.packages[1].core_groups;
    assert_eq!(second[0].id, 0);
    assert_eq!(second[1].id, 1);
    assert_eq!(second[1].raw_id, 13);
    assert_eq!(second[1].physical_cpus, vec![12, 13, 14, 15]);
}

#[test]
fn test_missing_sysfs_is_unavailable() {
    let dir = TempDir::new().unwrap();
    let reader = TopologyReader::new(dir.path().join("nope"), dir.path().join("cpuinfo"));
    let err = detect_topology(&reader, &DetectOptions::default()).unwrap_err();
    assert!(matches!(err, TopologyError::Unavailable(_)));

    // exists but holds no cpuN directories
    fs::create_dir_all(dir.path().join("empty/cpufreq")).unwrap();
    let reader = TopologyReader::new(dir.path().join("empty"), dir.path().join("cpuinfo"));
    let err = detect_topology(&reader, &DetectOptions::default()).unwrap_err();
    assert!(matches!(err, TopologyError::Unavailable(_)));
}

#[test]
fn test_unreadable_attribute_is_permission_denied() {
    use std::os::unix::fs::PermissionsExt;

    // root reads through mode 000
    if nix::unistd::Uid::effective().is_root() {
        eprintln!("Skipping: running as root");
        return;
    }

    let dir = fake_sysfs("AuthenticAMD", &zen_cpus());
    let path = dir.path().join("cpu/cpu3/topology/core_id");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o000)).unwrap();

    let err = detect_topology(&reader(&dir), &DetectOptions::default()).unwrap_err();
    match err {
        TopologyError::PermissionDenied { path: denied, .. } => assert_eq!(denied, path),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_options_from_detected_topology() {
    let dir = fake_sysfs("AuthenticAMD", &zen_cpus());
    let topo = detect(&dir);

    let options = affinity::generate(&Request::new(&topo, 8, true)).unwrap();
    let single = options
        .iter()
        .find(|o| o.strategy == Strategy::SingleCcd)
        .unwrap();
    assert_eq!(single.affinity, "0-3,16-19");

    // every option stays inside the host's CPUs and matches its count
    for option in options.iter().filter(|o| o.is_available()) {
        assert_eq!(option.cpus.len(), 8, "{}", option.strategy);
        assert!(option.cpus.iter().all(|&cpu| cpu < 32));
    }
}

#[derive(Default)]
struct RecordingManager {
    applied: RefCell<Vec<(u32, String)>>,
}

impl VmManager for RecordingManager {
    fn list_vms(&self) -> Result<Vec<Vm>, PveError> {
        Ok(vec![Vm {
            vmid: 200,
            name: "gaming".to_string(),
            status: "stopped".to_string(),
        }])
    }

    fn set_affinity(&self, vmid: u32, affinity: &str) -> Result<(), PveError> {
        self.applied.borrow_mut().push((vmid, affinity.to_string()));
        Ok(())
    }
}

#[test]
fn test_apply_pcores_on_hybrid() {
    let dir = fake_sysfs("GenuineIntel", &hybrid_cpus());
    let topo = detect(&dir);
    let manager = RecordingManager::default();

    let plan = ApplyPlan {
        cores: 8,
        vmid: 200,
        strategy: Strategy::PCores,
        groups: Vec::new(),
        physical: false,
        dry_run: false,
    };
    cli::run_apply(&plan, &topo, &manager).unwrap();
    assert_eq!(
        manager.applied.borrow().as_slice(),
        &[(200, "0-7".to_string())]
    );
}

// Binary tests

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_epyc-pve"))
}

/// Write a config pointing the binary at the fake tree
fn config_for(dir: &TempDir, qm_binary: &str) -> PathBuf {
    let path = dir.path().join("config.toml");
    let content = format!(
        "[topology]\nsysfs_root = {:?}\ncpuinfo_path = {:?}\n\n[pve]\nqm_binary = {:?}\n",
        dir.path().join("cpu"),
        dir.path().join("cpuinfo"),
        qm_binary
    );
    fs::write(&path, content).unwrap();
    path
}

fn run(config: &Path, args: &[&str]) -> Output {
    Command::new(binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run binary")
}

#[test]
fn test_help() {
    let output = Command::new(binary())
        .arg("--help")
        .output()
        .expect("Failed to run binary");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--apply"), "Help should mention --apply");
    assert!(stdout.contains("--dry-run"), "Help should mention --dry-run");
}

#[test]
fn test_completions_generation() {
    for shell in ["bash", "zsh", "fish"] {
        let output = Command::new(binary())
            .args(["--completions", shell])
            .output()
            .expect("Failed to run binary");

        assert!(output.status.success(), "Completions for {} should succeed", shell);
        assert!(!output.stdout.is_empty(), "{} completions should not be empty", shell);
    }
}

#[test]
fn test_topology_json() {
    let dir = fake_sysfs("AuthenticAMD", &zen_cpus());
    let config = config_for(&dir, "qm");

    let output = run(&config, &["--topology", "--json"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["architecture"], "amd");
    assert_eq!(json["detect_method"], "l3_cache");
    assert_eq!(json["total_cores"], 16);
    assert_eq!(json["core_groups"].as_array().unwrap().len(), 2);
    assert_eq!(json["core_groups"][0]["type"], "unknown");
}

#[test]
fn test_list_options_text() {
    let dir = fake_sysfs("AuthenticAMD", &zen_cpus());
    let config = config_for(&dir, "qm");

    let output = run(&config, &["--cores", "10", "--physical"]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("✗ [1] Single CCD"));
    assert!(stdout.contains("Physical Cores: 0-9  Groups: 2"));
}

#[test]
fn test_apply_unknown_vm_exit_code() {
    let dir = fake_sysfs("AuthenticAMD", &zen_cpus());
    // `echo list` prints no VM rows
    let config = config_for(&dir, "echo");

    let output = run(
        &config,
        &["--apply", "--cores", "4", "--vmid", "100", "--dry-run"],
    );
    assert_eq!(output.status.code(), Some(4));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("VM 100 not found"), "{}", stderr);
}

#[test]
fn test_invalid_arguments_exit_code() {
    let dir = fake_sysfs("AuthenticAMD", &zen_cpus());
    let config = config_for(&dir, "qm");

    let output = run(&config, &["--apply", "--cores", "4"]);
    assert_eq!(output.status.code(), Some(2));

    let output = run(&config, &["--cores", "64"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_missing_topology_exit_code() {
    let dir = TempDir::new().unwrap();
    let config = config_for(&dir, "qm");

    let output = run(&config, &["--topology"]);
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn test_list_vms_empty() {
    let dir = fake_sysfs("AuthenticAMD", &zen_cpus());
    let config = config_for(&dir, "echo");

    let output = run(&config, &["--list-vms"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("No VMs found"));

    let output = run(&config, &["--list-vms", "--json"]);
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json, serde_json::json!([]));
}
