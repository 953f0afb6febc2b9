// SPDX-License-Identifier: GPL-2.0
//
// epyc-pve - Proxmox VE (qm) integration
//
// Copyright (C) 2025-2026 ghostkellz <ckelley@ghostkellz.sh>

use log::{debug, info};
use serde::Serialize;
use std::io;
use std::process::Command;
use thiserror::Error;

/// A Proxmox virtual machine as listed by `qm list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Vm {
    pub vmid: u32,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Error)]
pub enum PveError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("VM {vmid} not found. Available VMs: {available}")]
    VmNotFound { vmid: u32, available: String },

    #[error("affinity string is empty")]
    EmptyAffinity,

    #[error("{command} failed: {message}")]
    Command { command: String, message: String },
}

/// Lists VMs and applies CPU affinity to them
pub trait VmManager {
    fn list_vms(&self) -> Result<Vec<Vm>, PveError>;

    fn set_affinity(&self, vmid: u32, affinity: &str) -> Result<(), PveError>;

    /// Look up `vmid` among the listed VMs
    fn ensure_exists(&self, vmid: u32) -> Result<Vm, PveError> {
        let vms = self.list_vms()?;
        let available = format_vmids(&vms);
        vms.into_iter()
            .find(|vm| vm.vmid == vmid)
            .ok_or(PveError::VmNotFound { vmid, available })
    }
}

/// `qm` command-line client
#[derive(Debug, Clone)]
pub struct QmClient {
    binary: String,
}

impl Default for QmClient {
    fn default() -> Self {
        Self::new("qm")
    }
}

impl QmClient {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, PveError> {
        let command = format!("{} {}", self.binary, args.join(" "));
        debug!("Running: {}", command);

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| wrap_command_error(&command, Some(&e), ""))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(wrap_command_error(&command, None, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl VmManager for QmClient {
    fn list_vms(&self) -> Result<Vec<Vm>, PveError> {
        let stdout = self.run(&["list"])?;
        let vms = parse_qm_list(&stdout);
        debug!("qm list: {} VMs", vms.len());
        Ok(vms)
    }

    fn set_affinity(&self, vmid: u32, affinity: &str) -> Result<(), PveError> {
        if affinity.trim().is_empty() {
            return Err(PveError::EmptyAffinity);
        }
        let vmid_str = vmid.to_string();
        self.run(&["set", &vmid_str, "--affinity", affinity])?;
        info!("Applied affinity {} to VM {}", affinity, vmid);
        Ok(())
    }
}

/// Parse `qm list` output; malformed rows are skipped, result sorted by VMID
pub fn parse_qm_list(output: &str) -> Vec<Vm> {
    let mut vms: Vec<Vm> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("VMID"))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return None;
            }
            Some(Vm {
                vmid: fields[0].parse().ok()?,
                name: fields[1].to_string(),
                status: fields[2].to_string(),
            })
        })
        .collect();

    vms.sort_by_key(|vm| vm.vmid);
    vms
}

/// Comma-separated VMIDs, or "none"
pub fn format_vmids(vms: &[Vm]) -> String {
    if vms.is_empty() {
        return "none".to_string();
    }
    vms.iter()
        .map(|vm| vm.vmid.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn wrap_command_error(command: &str, err: Option<&io::Error>, stderr: &str) -> PveError {
    let stderr = stderr.trim();

    if let Some(e) = err
        && e.kind() == io::ErrorKind::PermissionDenied
    {
        return PveError::PermissionDenied(format!("{}: {}", command, e));
    }
    if stderr.to_lowercase().contains("permission denied") {
        return PveError::PermissionDenied(stderr.to_string());
    }

    let message = match err {
        Some(e) => e.to_string(),
        None if !stderr.is_empty() => stderr.to_string(),
        None => "exited with an error".to_string(),
    };
    PveError::Command {
        command: command.to_string(),
        message,
    }
}
