use std::process::ExitCode;

use clap::Parser;

use qemu_compose::cli::{Cli, Command, ImageCommand, InspectFormat, NetworkCommand};
use qemu_compose::{config, console, doctor, image, lifecycle, logging, paths, sshkeys};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.debug);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> miette::Result<ExitCode> {
    if matches!(cli.command, Command::Version) {
        println!("qemu-compose {}", env!("CARGO_PKG_VERSION"));
        return Ok(ExitCode::SUCCESS);
    }

    if matches!(cli.command, Command::Doctor) {
        let results = doctor::run_checks();
        for r in &results {
            let mark = if r.ok { "ok" } else { "FAIL" };
            println!("[{mark}] {} - {}", r.name, r.detail);
        }
        return Ok(if doctor::all_ok(&results) {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    let compose_path = paths::resolve_compose_file(cli.file.as_deref()).ok_or_else(|| {
        qemu_compose::error::ComposeError::ConfigLoad {
            path: "qemu-compose.yaml".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no compose file found"),
        }
    })?;

    let project = config::load_project(&compose_path)?;

    match cli.command {
        Command::Version | Command::Doctor => unreachable!(),

        Command::Up { vms } => {
            let outcomes = lifecycle::up(&project, &vms).await?;
            let mut failed = false;
            for o in &outcomes {
                match &o.result {
                    Ok(()) => println!("{}: up", o.vm),
                    Err(e) => {
                        failed = true;
                        eprintln!("{}: failed - {e}", o.vm);
                    }
                }
            }
            Ok(exit_code(failed))
        }

        Command::Stop { vms } => {
            let outcomes = lifecycle::stop(&project, &vms).await?;
            let mut failed = false;
            for o in &outcomes {
                match &o.result {
                    Ok(()) => println!("{}: stopped", o.vm),
                    Err(e) => {
                        failed = true;
                        eprintln!("{}: failed - {e}", o.vm);
                    }
                }
            }
            Ok(exit_code(failed))
        }

        Command::Destroy { vms } => {
            let outcomes = lifecycle::destroy(&project, &vms).await?;
            let mut failed = false;
            for o in &outcomes {
                match &o.result {
                    Ok(()) => println!("{}: destroyed", o.vm),
                    Err(e) => {
                        failed = true;
                        eprintln!("{}: failed - {e}", o.vm);
                    }
                }
            }
            Ok(exit_code(failed))
        }

        Command::Ps { wait } => {
            let mut vms: Vec<_> = project.vms.values().collect();
            vms.sort_by(|a, b| a.name.cmp(&b.name));
            let mut failed = false;
            for vm in vms {
                let status = if wait {
                    match lifecycle::wait_until_ready(&project, vm).await {
                        Ok(s) => s,
                        Err(e) => {
                            failed = true;
                            eprintln!("{}: failed - {e}", vm.name);
                            continue;
                        }
                    }
                } else {
                    lifecycle::status(&project, vm).await
                };
                println!("{}\t{status}", vm.name);
            }
            Ok(exit_code(failed))
        }

        Command::Inspect { vm, format } => {
            let vm_cfg = project
                .vms
                .get(&vm)
                .ok_or_else(|| qemu_compose::error::ComposeError::VmNotFound { name: vm.clone() })?;
            let inspection = lifecycle::inspect(&project, vm_cfg).await?;
            match format {
                InspectFormat::Text => {
                    println!("vm:        {vm}");
                    println!("status:    {}", inspection.status);
                    println!("image:     {}", inspection.image);
                    println!("overlay:   {}", inspection.overlay_path.display());
                    println!("macs:      {}", inspection.macs.join(", "));
                    for (net, ip) in &inspection.ips {
                        match ip {
                            Some(ip) => println!("ip:        {net} -> {ip}"),
                            None => println!("ip:        {net} -> (none)"),
                        }
                    }
                    for net in &inspection.networks {
                        println!("network:   {} ({})", net.name, net.driver);
                    }
                    if !inspection.recent_logs.is_empty() {
                        println!("logs:");
                        for line in &inspection.recent_logs {
                            println!("  {line}");
                        }
                    }
                }
                InspectFormat::Json => {
                    let json = serde_json::json!({
                        "vm": vm,
                        "status": inspection.status.to_string(),
                        "image": inspection.image,
                        "overlay": inspection.overlay_path.display().to_string(),
                        "macs": inspection.macs,
                        "ips": inspection.ips.iter().map(|(net, ip)| serde_json::json!({
                            "network": net,
                            "ip": ip.map(|ip| ip.to_string()),
                        })).collect::<Vec<_>>(),
                        "networks": inspection.networks.iter().map(|n| n.name.clone()).collect::<Vec<_>>(),
                        "recent_logs": inspection.recent_logs,
                    });
                    println!("{}", serde_json::to_string_pretty(&json).expect("valid JSON"));
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Pull { vms, force } => {
            let targets: Vec<_> = if vms.is_empty() {
                project.vms.values().collect()
            } else {
                vms.iter().filter_map(|n| project.vms.get(n)).collect()
            };
            let cache_dir = paths::cache_dir();
            let mut failed = false;
            for vm in targets {
                match image::ensure_base_image(&vm.image, &cache_dir, force, &image::NullProgress).await {
                    Ok(path) => println!("{}: {}", vm.name, path.display()),
                    Err(e) => {
                        failed = true;
                        eprintln!("{}: failed - {e}", vm.name);
                    }
                }
            }
            Ok(exit_code(failed))
        }

        Command::Console { vm } => {
            if !project.vms.contains_key(&vm) {
                return Err(qemu_compose::error::ComposeError::VmNotFound { name: vm }.into());
            }
            let socket = paths::console_socket_path(&project.workspace, &vm);
            console::attach(&socket).await?;
            Ok(ExitCode::SUCCESS)
        }

        Command::Ssh { vm, args } => {
            let vm_cfg = project
                .vms
                .get(&vm)
                .ok_or_else(|| qemu_compose::error::ComposeError::VmNotFound { name: vm.clone() })?;
            let ports_path = paths::ports_path(&project.workspace, &vm);
            let port = sshkeys::ensure_port(&ports_path, vm_cfg.ssh_port, &std::collections::HashSet::new())?;
            let ssh_dir = paths::ssh_dir(&project.workspace);
            let identity = sshkeys::private_key_path(&ssh_dir);
            let identity_str = identity.display().to_string();
            let port_str = port.to_string();
            let mut full_args = vec![
                "-o", "StrictHostKeyChecking=no",
                "-o", "UserKnownHostsFile=/dev/null",
                "-i", &identity_str,
                "-p", &port_str,
            ];
            let target = "root@127.0.0.1".to_string();
            full_args.push(&target);
            let extra: Vec<&str> = args.iter().map(String::as_str).collect();
            full_args.extend(extra);

            let status = tokio::process::Command::new("ssh")
                .args(&full_args)
                .status()
                .await
                .map_err(|e| qemu_compose::error::ComposeError::Io {
                    context: "spawning ssh".into(),
                    source: e,
                })?;
            Ok(if status.success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Command::Image { command } => match command {
            ImageCommand::Ls => {
                let cache_dir = paths::cache_dir();
                for path in image::list_cached(&cache_dir) {
                    println!("{}", path.display());
                }
                Ok(ExitCode::SUCCESS)
            }
        },

        Command::Network { command } => match command {
            NetworkCommand::Ls => {
                let mut names: Vec<_> = project.networks.keys().cloned().collect();
                names.sort();
                for name in names {
                    println!("{name}");
                }
                Ok(ExitCode::SUCCESS)
            }
            NetworkCommand::Down { networks, force } => {
                let state_path = paths::networks_state_path(&project.workspace);
                let targets: Vec<String> = if networks.is_empty() {
                    project.networks.keys().cloned().collect()
                } else {
                    networks
                };
                let mut failed = false;
                for net in targets {
                    if let Err(e) = qemu_compose::network::teardown_network(&project.name, &net, &state_path).await {
                        if !force {
                            failed = true;
                        }
                        eprintln!("{net}: failed - {e}");
                    } else {
                        println!("{net}: down");
                    }
                }
                Ok(exit_code(failed))
            }
        },
    }
}

fn exit_code(failed: bool) -> ExitCode {
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
