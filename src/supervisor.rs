//! Registers VM and DHCP processes as transient service units with the
//! session manager, so their lifetime is supervised rather than owned by
//! this process.

use crate::error::ComposeError;
use crate::subprocess;

fn vm_unit_name(project: &str, vm: &str) -> String {
    format!("qemu-compose-{project}-{vm}")
}

/// Start a VM under the invoking user's systemd session, `--collect`ed so
/// the unit is reaped once it exits.
pub async fn start_vm_unit(project: &str, vm: &str, argv: &[String]) -> Result<String, ComposeError> {
    let unit = vm_unit_name(project, vm);
    let mut args = vec![
        "--user".to_string(),
        "--collect".to_string(),
        "--unit".to_string(),
        unit.clone(),
        "--property=KillMode=mixed".to_string(),
        "--".to_string(),
    ];
    args.extend(argv.iter().cloned());
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    subprocess::run("systemd-run", &arg_refs).await?;
    tracing::info!(unit = %unit, "registered vm supervisor unit");
    Ok(unit)
}

pub async fn stop_vm_unit(project: &str, vm: &str) -> Result<(), ComposeError> {
    let unit = vm_unit_name(project, vm);
    subprocess::run("systemctl", &["--user", "stop", &format!("{unit}.service")]).await?;
    Ok(())
}

/// Start a privileged side-car (currently: the per-network DHCP server)
/// under the system session.
pub async fn start_system_unit(unit: &str, argv: &[String]) -> Result<(), ComposeError> {
    let mut args = vec![
        "--collect".to_string(),
        "--unit".to_string(),
        unit.to_string(),
        "--".to_string(),
    ];
    args.extend(argv.iter().cloned());
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    subprocess::run("systemd-run", &arg_refs).await?;
    tracing::info!(unit, "registered system supervisor unit");
    Ok(())
}

pub async fn stop_system_unit(unit: &str) {
    subprocess::run_best_effort("systemctl", &["stop", &format!("{unit}.service")]).await;
}

pub async fn is_active(unit: &str, user_session: bool) -> bool {
    let unit_service = format!("{unit}.service");
    let mut args = Vec::new();
    if user_session {
        args.push("--user");
    }
    args.push("is-active");
    args.push(&unit_service);
    subprocess::run("systemctl", &args)
        .await
        .map(|out| String::from_utf8_lossy(&out.stdout).trim() == "active")
        .unwrap_or(false)
}

pub async fn recent_logs(unit: &str, lines: usize) -> Vec<String> {
    let service = format!("{unit}.service");
    let n = lines.to_string();
    let args = ["--unit", &service, "--no-pager", "-n", &n];
    subprocess::run("journalctl", &args)
        .await
        .map(|out| {
            String::from_utf8_lossy(&out.stdout)
                .lines()
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn vm_unit(project: &str, vm: &str) -> String {
    vm_unit_name(project, vm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_unit_name_is_deterministic() {
        assert_eq!(vm_unit_name("proj", "web"), "qemu-compose-proj-web");
    }
}
