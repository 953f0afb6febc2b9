// SPDX-License-Identifier: GPL-2.0
//
// epyc-pve - CCD-aware CPU affinity for Proxmox VE virtual machines
//
// Copyright (C) 2025-2026 ghostkellz <ckelley@ghostkellz.sh>

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use epyc_pve::affinity::{self, Request};
use epyc_pve::cli::{self, Args, Mode};
use epyc_pve::config::PveConfig;
use epyc_pve::display;
use epyc_pve::pve::QmClient;
use epyc_pve::topology::{self, CpuTopology};
use log::{debug, info, warn};
use std::io;
use std::process;

fn main() {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    if let Err(e) = run(args) {
        eprintln!("✗ Error: {}", cli::error_message(&e));
        debug!("{:?}", e);
        process::exit(cli::exit_code(&e));
    }
}

fn run(args: Args) -> Result<()> {
    if let Some(shell) = args.completions {
        let mut cmd = Args::command();
        clap_complete::generate(shell, &mut cmd, "epyc-pve", &mut io::stdout());
        return Ok(());
    }

    info!("epyc-pve v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => PveConfig::load_from_path(path)?,
        None => PveConfig::load()?,
    };

    let topo = topology::detect_topology(&config.reader(), &config.detect_options())?;

    match cli::validate(&args, &topo, &config)? {
        Mode::Topology { json: true } => print_json(&topo),
        Mode::Topology { json: false } => {
            print!("{}", display::render_topology(&topo));
            Ok(())
        }
        Mode::List {
            cores,
            physical,
            json,
        } => list_options(&topo, cores, physical, json),
        Mode::Apply(plan) => {
            if !plan.dry_run && !nix::unistd::Uid::effective().is_root() {
                warn!("Not running as root; qm set will likely be refused");
            }
            let client = QmClient::new(config.pve.qm_binary.as_str());
            let text = cli::run_apply(&plan, &topo, &client)?;
            println!("{}", text);
            Ok(())
        }
        Mode::Vms { json } => {
            let client = QmClient::new(config.pve.qm_binary.as_str());
            print!("{}", cli::run_list_vms(&client, json)?);
            if json {
                println!();
            }
            Ok(())
        }
        Mode::Overview => {
            print!("{}", display::render_topology(&topo));
            println!();
            println!("Use --cores N to list affinity options, --list-vms to see VMs, or --apply --cores N --vmid ID to apply.");
            Ok(())
        }
    }
}

fn list_options(topo: &CpuTopology, cores: usize, physical: bool, json: bool) -> Result<()> {
    let options = affinity::generate(&Request::new(topo, cores, !physical))?;
    if json {
        let out = serde_json::to_string_pretty(&options).context("Failed to serialize options")?;
        println!("{}", out);
    } else {
        print!("{}", display::render_options(&options, physical));
    }
    Ok(())
}

fn print_json(topo: &CpuTopology) -> Result<()> {
    let out = serde_json::to_string_pretty(topo).context("Failed to serialize topology")?;
    println!("{}", out);
    Ok(())
}
