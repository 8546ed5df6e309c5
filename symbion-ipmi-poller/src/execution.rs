//! ipmitool execution for the IPMI poller
//!
//! Handles:
//! - Sensor readings (`sensor reading <name>`), parsed and classified
//! - Chassis power commands and raw requests
//! - Timeouts and failure classification (link, configuration, unsupported)
//! - Per-host session statistics, dropped on cleanup notices

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

use symbion_ipmi_manager::models::{ErrorClass, HostAddress};

/// Command execution result, sent back verbatim as the command payload
#[derive(Debug, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub execution_time_ms: u128,
}

/// Outcome of a single ipmitool invocation
#[derive(Debug)]
enum RunOutcome {
    Completed { ok: bool, stdout: String, stderr: String },
    TimedOut,
    SpawnFailed(String),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionStats {
    pub requests: u64,
    pub failures: u64,
    pub last_success: Option<OffsetDateTime>,
}

pub struct IpmiExecutor {
    /// ipmitool invocation, e.g. `["sudo", "ipmitool"]`
    program: Vec<String>,
    timeout: Duration,
    sessions: HashMap<String, SessionStats>,
}

/// Connection arguments; the password travels through `IPMI_PASSWORD` (`-E`)
pub fn connection_args(host: &HostAddress) -> Vec<String> {
    let mut args = vec![
        "-I".to_string(),
        "lanplus".to_string(),
        "-H".to_string(),
        host.address.clone(),
        "-p".to_string(),
        host.port.to_string(),
        "-L".to_string(),
        host.privilege.clone(),
    ];
    if !host.username.is_empty() {
        args.push("-U".to_string());
        args.push(host.username.clone());
    }
    if let Some(authtype) = &host.authtype {
        args.push("-A".to_string());
        args.push(authtype.clone());
    }
    args.push("-E".to_string());
    args
}

/// Classify an ipmitool failure from its stderr
pub fn classify_failure(stderr: &str) -> ErrorClass {
    let msg = stderr.to_lowercase();
    if msg.contains("not found") || msg.contains("not present") || msg.contains("invalid sensor") {
        ErrorClass::NotSupported
    } else if msg.contains("unauthorized name")
        || msg.contains("invalid user name")
        || msg.contains("hmac is invalid")
        || msg.contains("insufficient privilege")
        || msg.contains("invalid authentication type")
        || msg.contains("invalid privilege level")
        || msg.contains("usage:")
    {
        ErrorClass::ConfigError
    } else if msg.contains("node busy") || msg.contains("bmc busy") || msg.contains("command failed") {
        ErrorClass::GatewayError
    } else if msg.contains("timeout") || msg.contains("timed out") {
        ErrorClass::TimeoutError
    } else {
        ErrorClass::NetworkError
    }
}

/// Extract the reading of `sensor` from `ipmitool sensor reading` output.
/// Lines look like `CPU Temp         | 41`. A single row is taken as the
/// answer even when ipmitool printed the name differently (truncated names);
/// with several rows only an exact name match counts.
pub fn parse_sensor_reading(stdout: &str, sensor: &str) -> Result<String, (ErrorClass, String)> {
    let rows: Vec<(&str, &str)> = stdout
        .lines()
        .filter_map(|line| line.split_once('|'))
        .map(|(name, value)| (name.trim(), value.trim()))
        .collect();

    let value = rows
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(sensor))
        .or_else(|| match rows.as_slice() {
            [only] => Some(only),
            _ => None,
        })
        .map(|(_, value)| *value)
        .ok_or_else(|| (ErrorClass::NotSupported, format!("no reading for sensor '{}'", sensor)))?;

    if value.is_empty() || value.eq_ignore_ascii_case("na") {
        return Err((ErrorClass::NotSupported, format!("sensor '{}' has no reading", sensor)));
    }
    Ok(value.to_string())
}

/// ipmitool arguments for a command payload
/// `{"action": "power_on" | ... | "raw", "args": [...]}`
pub fn command_args(payload: &Value) -> Result<Vec<String>, String> {
    let action = payload
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing 'action'".to_string())?;

    let power = |op: &str| -> Result<Vec<String>, String> {
        Ok(vec!["chassis".to_string(), "power".to_string(), op.to_string()])
    };
    match action {
        "power_on" => power("on"),
        "power_off" => power("off"),
        "power_cycle" => power("cycle"),
        "power_reset" => power("reset"),
        "power_status" => power("status"),
        "raw" => {
            let bytes: Vec<String> = payload
                .get("args")
                .and_then(Value::as_array)
                .map(|args| args.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            if bytes.len() < 2 {
                return Err("raw needs at least netfn and cmd".to_string());
            }
            if let Some(bad) = bytes.iter().find(|b| !is_hex_byte(b)) {
                return Err(format!("invalid raw byte '{}'", bad));
            }
            let mut args = vec!["raw".to_string()];
            args.extend(bytes);
            Ok(args)
        }
        other => Err(format!("unknown action '{}'", other)),
    }
}

fn is_hex_byte(s: &str) -> bool {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    !digits.is_empty() && digits.len() <= 2 && digits.chars().all(|c| c.is_ascii_hexdigit())
}

impl IpmiExecutor {
    pub fn new(program: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            timeout,
            sessions: HashMap::new(),
        }
    }

    async fn run(&self, host: &HostAddress, tail: &[String]) -> RunOutcome {
        let Some((bin, prefix)) = self.program.split_first() else {
            return RunOutcome::SpawnFailed("empty ipmitool command".to_string());
        };

        let mut cmd = AsyncCommand::new(bin);
        cmd.args(prefix)
            .args(connection_args(host))
            .args(tail)
            .env("IPMI_PASSWORD", &host.password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running ipmitool against {}: {:?}", host.address, tail);
        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => RunOutcome::Completed {
                ok: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            },
            Ok(Err(e)) => RunOutcome::SpawnFailed(e.to_string()),
            Err(_) => RunOutcome::TimedOut,
        }
    }

    fn record(&mut self, host: &HostAddress, ok: bool) {
        let stats = self.sessions.entry(host.address.clone()).or_default();
        stats.requests += 1;
        if ok {
            stats.last_success = Some(OffsetDateTime::now_utc());
        } else {
            stats.failures += 1;
        }
    }

    /// Read one sensor; returns the error class and the value (or error text)
    pub async fn read_sensor(&mut self, host: &HostAddress, sensor: &str) -> (ErrorClass, String) {
        let tail = vec!["sensor".to_string(), "reading".to_string(), sensor.to_string()];
        let (class, text) = match self.run(host, &tail).await {
            RunOutcome::Completed { ok: true, stdout, .. } => match parse_sensor_reading(&stdout, sensor) {
                Ok(value) => (ErrorClass::Success, value),
                Err((class, text)) => (class, text),
            },
            RunOutcome::Completed { ok: false, stderr, .. } => (classify_failure(&stderr), stderr),
            RunOutcome::TimedOut => (
                ErrorClass::TimeoutError,
                format!("ipmitool timed out after {}s", self.timeout.as_secs()),
            ),
            RunOutcome::SpawnFailed(e) => (ErrorClass::ConfigError, format!("cannot run ipmitool: {}", e)),
        };
        self.record(host, !class.is_link_error());
        (class, text)
    }

    /// Execute a command payload against the host
    pub async fn execute_command(&mut self, host: &HostAddress, payload: &Value) -> ExecutionResult {
        let start_time = Instant::now();
        let tail = match command_args(payload) {
            Ok(tail) => tail,
            Err(e) => {
                return ExecutionResult {
                    success: false,
                    output: String::new(),
                    error: Some(e),
                    execution_time_ms: start_time.elapsed().as_millis(),
                }
            }
        };

        info!("Executing IPMI command on {}: {}", host.address, tail.join(" "));
        let (success, output, error) = match self.run(host, &tail).await {
            RunOutcome::Completed { ok: true, stdout, .. } => (true, stdout.trim().to_string(), None),
            RunOutcome::Completed { ok: false, stdout, stderr } => (false, stdout.trim().to_string(), Some(stderr)),
            RunOutcome::TimedOut => (
                false,
                String::new(),
                Some(format!("ipmitool timed out after {}s", self.timeout.as_secs())),
            ),
            RunOutcome::SpawnFailed(e) => (false, String::new(), Some(format!("cannot run ipmitool: {}", e))),
        };
        self.record(host, success);

        ExecutionResult {
            success,
            output,
            error,
            execution_time_ms: start_time.elapsed().as_millis(),
        }
    }

    pub fn session_stats(&self, address: &str) -> Option<&SessionStats> {
        self.sessions.get(address)
    }

    /// Cleanup notice from the manager
    pub fn cleanup(&mut self) {
        if !self.sessions.is_empty() {
            info!("Dropping session statistics for {} hosts", self.sessions.len());
        }
        self.sessions.clear();
    }
}
