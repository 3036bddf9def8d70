use std::process::Output;

use tokio::process::Command;

use crate::error::ComposeError;

/// Redacts argv before it is logged — strips anything that looks like a
/// password/token flag value. None of the binaries this adapter wraps
/// currently take secrets on argv, but a future one might.
fn redact_args(args: &[&str]) -> String {
    args.iter()
        .map(|a| {
            if a.to_ascii_lowercase().contains("password") || a.to_ascii_lowercase().contains("token") {
                "<redacted>"
            } else {
                a
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run `command` with `args`, capturing stdout/stderr. Distinguishes "binary
/// missing" (`ComposeError::MissingBinary`) from "binary ran and failed"
/// (`ComposeError::ExternalCommand`).
pub async fn run(command: &str, args: &[&str]) -> Result<Output, ComposeError> {
    tracing::debug!(command, args = %redact_args(args), "running subprocess");

    let output = Command::new(command)
        .args(args)
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ComposeError::MissingBinary {
                    command: command.to_string(),
                }
            } else {
                ComposeError::Io {
                    context: format!("running {command}"),
                    source: e,
                }
            }
        })?;

    if !output.status.success() {
        return Err(ComposeError::ExternalCommand {
            command: command.to_string(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(output)
}

/// Like [`run`], but a non-zero exit is only logged, never returned as an
/// error — for idempotent teardown steps (deleting a rule or device that
/// may already be gone) where the caller has already decided to treat
/// failure as non-fatal.
pub async fn run_best_effort(command: &str, args: &[&str]) {
    match run(command, args).await {
        Ok(_) => {}
        Err(e) => tracing::warn!(command, error = %e, "best-effort subprocess step failed"),
    }
}

/// Returns true if `command` resolves on `PATH`.
pub fn is_on_path(command: &str) -> bool {
    let Ok(path_var) = std::env::var("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(command).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_password_like_args() {
        let s = redact_args(&["--user", "bob", "--password", "hunter2"]);
        assert!(s.contains("<redacted>"));
        assert!(!s.contains("hunter2"));
    }

    #[tokio::test]
    async fn missing_binary_is_classified() {
        let result = run("qemu-compose-definitely-not-a-real-binary", &[]).await;
        assert!(matches!(result, Err(ComposeError::MissingBinary { .. })));
    }

    #[test]
    fn is_on_path_finds_sh() {
        assert!(is_on_path("sh"));
    }
}
