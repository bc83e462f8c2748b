use std::process::Stdio;

use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::capture::CaptureEvent;

use super::{RunnerError, StepHandle};

const DEFAULT_SHELL: &str = "sh";

pub struct ExecRunner;

#[derive(Debug, Clone)]
pub struct ExecCommand {
    pub command: String,
    pub stdin: Option<String>,
    pub shell: String,
}

pub fn parse_exec_command(m: &Map<String, Value>) -> Result<ExecCommand, RunnerError> {
    let command = m
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| RunnerError::invalid("exec", "missing command"))?;
    let stdin = match m.get("stdin") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(RunnerError::invalid(
                "exec",
                format!("stdin must be a string, got {other}"),
            ))
        }
        None => None,
    };
    let shell = m
        .get("shell")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_SHELL)
        .to_string();
    Ok(ExecCommand {
        command: command.to_string(),
        stdin,
        shell,
    })
}

impl ExecRunner {
    pub async fn run(&self, h: &mut StepHandle<'_>, c: ExecCommand) -> Result<(), RunnerError> {
        h.capturers
            .capture(CaptureEvent::ExecCommand {
                command: c.command.clone(),
            })
            .await;

        let mut cmd = Command::new(&c.shell);
        cmd.arg("-c")
            .arg(&c.command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.stdin(if c.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn()?;
        if let (Some(text), Some(mut stdin)) = (&c.stdin, child.stdin.take()) {
            stdin.write_all(text.as_bytes()).await?;
            // Dropping the handle closes the pipe so the child sees EOF.
            drop(stdin);
        }
        let output = child.wait_with_output().await?;

        let mut result = Map::new();
        result.insert(
            "stdout".to_string(),
            Value::String(String::from_utf8_lossy(&output.stdout).into_owned()),
        );
        result.insert(
            "stderr".to_string(),
            Value::String(String::from_utf8_lossy(&output.stderr).into_owned()),
        );
        result.insert(
            "exit_code".to_string(),
            Value::from(output.status.code().unwrap_or(-1)),
        );
        h.store.record(result);
        Ok(())
    }
}
