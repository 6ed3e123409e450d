//! Shell command run once per node.
//!
//! The command template is rendered for each node and run through `sh -c`.
//! Placeholders:
//!
//! - `{host}`: hostname
//! - `{address}`: address, the hostname when unset
//! - `{cluster}`: cluster tag, empty when unset
//! - `{args}`: the leaf arguments, space separated
//!
//! Substituted values are shell-quoted, so each one reaches the command as a
//! single word. The template itself is trusted and run as written.
//!
//! Every node is raised as soon as its process exits: ok on status 0, ko
//! otherwise with the exit status and the last line of stderr.

use crate::automata::{Microstep, TaskContext};
use crate::node::{Node, NodeSet};
use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::process::Stdio;
use tokio::process::Command;

pub struct CommandMicrostep {
    name: String,
    template: String,
    parallelism: usize,
}

impl CommandMicrostep {
    /// Concurrent processes when not configured
    pub const DEFAULT_PARALLELISM: usize = 32;

    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            parallelism: Self::DEFAULT_PARALLELISM,
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Command line for one node. `args` comes quoted from `render_args`.
    pub fn render(&self, node: &Node, args: &str) -> String {
        self.template
            .replace("{host}", &shell_quote(&node.hostname))
            .replace("{address}", &shell_quote(node.address()))
            .replace("{cluster}", &shell_quote(node.cluster.as_deref().unwrap_or("")))
            .replace("{args}", args)
    }
}

/// Quote scalar arguments and join them with spaces
fn render_args(args: &[serde_json::Value]) -> Result<String> {
    let mut rendered = Vec::with_capacity(args.len());
    for arg in args {
        let word = match arg {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            other => bail!("arguments must be strings, numbers or booleans, got {}", other),
        };
        rendered.push(shell_quote(&word));
    }
    Ok(rendered.join(" "))
}

/// Quote `value` as one POSIX shell word. Plain words are left as they are.
fn shell_quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

/// Run one command line. `Err` carries a description of the failure.
async fn run_command(command: &str) -> std::result::Result<(), String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("failed to spawn: {}", e))?;

    if output.status.success() {
        return Ok(());
    }

    let status = match output.status.code() {
        Some(code) => format!("exit status {}", code),
        None => "killed by signal".to_string(),
    };
    let stderr = String::from_utf8_lossy(&output.stderr);
    match stderr.lines().rev().find(|l| !l.trim().is_empty()) {
        Some(line) => Err(format!("{}: {}", status, line.trim())),
        None => Err(status),
    }
}

#[async_trait]
impl Microstep for CommandMicrostep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &TaskContext) -> Result<bool> {
        let args = render_args(ctx.args())?;
        let commands: Vec<(Node, String)> = ctx
            .nodes()
            .iter()
            .map(|node| (node.clone(), self.render(node, &args)))
            .collect();

        let mut runs = stream::iter(commands)
            .map(|(node, command)| async move {
                let result = run_command(&command).await;
                (node, result)
            })
            .buffer_unordered(self.parallelism);

        loop {
            tokio::select! {
                _ = ctx.cancellation().cancelled() => {
                    // Dropping the stream kills the remaining processes
                    tracing::debug!("{}: cancelled", ctx.step());
                    return Ok(false);
                }
                next = runs.next() => {
                    match next {
                        Some((node, Ok(()))) => {
                            ctx.raise_ok(NodeSet::from(vec![node]));
                        }
                        Some((node, Err(message))) => {
                            tracing::warn!("{} failed on {}: {}", ctx.step(), node.hostname, message);
                            ctx.raiser().ko_with(NodeSet::from(vec![node]), message);
                        }
                        None => break,
                    }
                }
            }
        }

        Ok(true)
    }

    fn validate_args(&self, args: &[serde_json::Value]) -> Result<()> {
        if !self.template.contains("{host}") && !self.template.contains("{address}") {
            bail!("command template must reference {{host}} or {{address}}");
        }
        if self.parallelism == 0 {
            bail!("parallelism must be at least 1");
        }
        render_args(args)?;
        Ok(())
    }
}
