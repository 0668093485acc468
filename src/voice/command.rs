//! Helpers for running local speech engines as subprocesses

use std::path::PathBuf;
use std::process::{Output, Stdio};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Substitute `{name}` placeholders in an argument template
#[must_use]
pub fn render_args(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}

/// Whether any template argument uses `{name}`
#[must_use]
pub fn uses_placeholder(template: &[String], name: &str) -> bool {
    let needle = format!("{{{name}}}");
    template.iter().any(|arg| arg.contains(&needle))
}

/// Resolve a program on `PATH`, or accept it as a path
#[must_use]
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

/// Run a program to completion, optionally feeding `stdin`
///
/// The child is killed if the returned future is dropped, which is how stage
/// timeouts cancel a running engine.
///
/// # Errors
///
/// Returns a description of the failure if the program cannot be spawned or
/// exits unsuccessfully
pub async fn run(program: &str, args: &[String], stdin: Option<&str>) -> Result<Output, String> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| format!("failed to start {program}: {e}"))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        match pipe.write_all(input.as_bytes()).await {
            // The program may exit without reading its input
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                return Err(format!("failed to write to {program}: {e}"));
            }
            _ => {}
        }
        drop(pipe);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("{program} failed: {e}"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        ));
    }

    Ok(output)
}
