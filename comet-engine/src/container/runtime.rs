//! Container runtime invocations
//!
//! Thin wrappers around the runtime CLI (podman or docker, same argument
//! surface): probing, launching a stage container, listing, killing and
//! removing containers.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::container::ExecutionOptions;
use crate::error::ExecutorError;

/// Label put on every container launched by the executor
pub(crate) const MANAGED_LABEL: &str = "comet.managed=true";

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Checks whether the runtime answers `info`
///
/// `--version` succeeds even when the daemon/socket is unreachable, so the
/// probe asks the runtime for host information instead.
pub(crate) async fn probe(binary: &str) -> bool {
    let status = Command::new(binary)
        .arg("info")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();

    match tokio::time::timeout(PROBE_TIMEOUT, status).await {
        Ok(Ok(status)) if status.success() => {
            info!("Container runtime `{}` is available", binary);
            true
        }
        Ok(Ok(status)) => {
            debug!("`{} info` exited with {}", binary, status);
            false
        }
        Ok(Err(e)) => {
            debug!("Failed to execute `{} info`: {}", binary, e);
            false
        }
        Err(_) => {
            debug!("`{} info` did not answer within {:?}", binary, PROBE_TIMEOUT);
            false
        }
    }
}

/// Joins the command list into a single shell script
///
/// Commands are chained with `&&` so the first failing command stops the stage.
pub(crate) fn build_script(commands: &[String]) -> String {
    let commands: Vec<&str> = commands
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect();

    if commands.is_empty() {
        "true".to_string()
    } else {
        commands.join(" && ")
    }
}

/// Arguments of `run` for a stage container
///
/// The container is auto-removed on exit and runs the script through
/// `/bin/sh -c`, overriding any image entrypoint.
pub(crate) fn run_args(name: &str, options: &ExecutionOptions) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--label".to_string(),
        MANAGED_LABEL.to_string(),
    ];

    // Sorted for stable command lines in logs
    let env: BTreeMap<&String, &String> = options.env.iter().collect();
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    if let Some(dir) = options.working_dir.as_deref().filter(|d| !d.is_empty()) {
        args.push("-w".to_string());
        args.push(dir.to_string());
    }

    args.push("--entrypoint".to_string());
    args.push("/bin/sh".to_string());
    args.push(options.image.clone());
    args.push("-c".to_string());
    args.push(build_script(&options.commands));

    args
}

/// Lists container names (running or not) that start with `prefix-`
pub(crate) async fn list_managed(binary: &str, prefix: &str) -> Result<Vec<String>, ExecutorError> {
    let output = Command::new(binary)
        .arg("ps")
        .arg("-a")
        .arg("--filter")
        .arg(format!("name={}-", prefix))
        .arg("--format")
        .arg("{{.Names}}")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| ExecutorError::Runtime {
            binary: binary.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(ExecutorError::Command {
            binary: binary.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    // The runtime filter is a substring match; keep only real prefix matches
    let marker = format!("{}-", prefix);
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|name| name.starts_with(&marker))
        .map(str::to_string)
        .collect())
}

/// Sends SIGKILL to a container; errors are expected when it already exited
pub(crate) async fn kill(binary: &str, name: &str) {
    let result = Command::new(binary)
        .arg("kill")
        .arg(name)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    if let Err(e) = result {
        debug!("Failed to execute `{} kill {}`: {}", binary, name, e);
    }
}

/// Force-removes a container
pub(crate) async fn force_remove(binary: &str, name: &str) -> Result<(), ExecutorError> {
    let output = Command::new(binary)
        .arg("rm")
        .arg("-f")
        .arg(name)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| ExecutorError::Runtime {
            binary: binary.to_string(),
            source,
        })?;

    if output.status.success() {
        debug!("Container {} removed", name);
        Ok(())
    } else {
        Err(ExecutorError::Command {
            binary: binary.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
