//! Helpers for driving external binaries (`ip`, `tc`, `iptables`, `ipset`,
//! `wg`, ...). All kernel configuration in this engine goes through these.
//!
//! Errors carry the full argv and the combined output of the failed command,
//! which is usually the only way to debug a misbehaving tc or iptables rule.

use std::fmt;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug)]
pub enum CommandError {
    /// The binary could not be spawned (usually: not installed).
    Spawn { argv: String, source: std::io::Error },
    /// The command ran and exited non-zero.
    Failed { argv: String, output: String },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Spawn { argv, source } => {
                write!(f, "could not run {argv}: {source}")
            }
            CommandError::Failed { argv, output } => {
                write!(f, "{argv}: output: {output}")
            }
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Spawn { source, .. } => Some(source),
            CommandError::Failed { .. } => None,
        }
    }
}

fn argv_string(bin: &str, args: &[&str]) -> String {
    let mut s = String::from(bin);
    for a in args {
        s.push(' ');
        s.push_str(a);
    }
    s
}

/// Run a command to completion, failing on non-zero exit.
pub async fn run(bin: &str, args: &[&str]) -> Result<(), CommandError> {
    output(bin, args).await.map(|_| ())
}

/// Run a command and discard the result. Used for cleanup of kernel objects
/// that may or may not exist.
pub async fn run_ignore(bin: &str, args: &[&str]) {
    let _ = output(bin, args).await;
}

/// Run a command and return its trimmed stdout.
pub async fn output(bin: &str, args: &[&str]) -> Result<String, CommandError> {
    let out = Command::new(bin)
        .args(args)
        .output()
        .await
        .map_err(|source| CommandError::Spawn {
            argv: argv_string(bin, args),
            source,
        })?;

    if !out.status.success() {
        let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&out.stderr));
        return Err(CommandError::Failed {
            argv: argv_string(bin, args),
            output: combined,
        });
    }

    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Run a command with the given stdin and return its trimmed stdout.
pub async fn output_with_stdin(
    bin: &str,
    args: &[&str],
    stdin: &str,
) -> Result<String, CommandError> {
    let mut child = Command::new(bin)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| CommandError::Spawn {
            argv: argv_string(bin, args),
            source,
        })?;

    if let Some(mut pipe) = child.stdin.take() {
        pipe.write_all(stdin.as_bytes())
            .await
            .map_err(|source| CommandError::Spawn {
                argv: argv_string(bin, args),
                source,
            })?;
    }

    let out = child
        .wait_with_output()
        .await
        .map_err(|source| CommandError::Spawn {
            argv: argv_string(bin, args),
            source,
        })?;

    if !out.status.success() {
        let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&out.stderr));
        return Err(CommandError::Failed {
            argv: argv_string(bin, args),
            output: combined,
        });
    }

    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}
