//! Playwright-backed [`BrowserSession`]: a long-lived `node` child process
//! driven over a line-delimited JSON protocol on stdin/stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::harvest::{AutomationError, BrowserLauncher, BrowserSession};

const DRIVER_SCRIPT: &str = include_str!("../driver/playwright_driver.js");
const READY_ID: i64 = 0;

#[derive(Debug, Clone)]
pub struct PlaywrightLauncher {
    node_bin: String,
    headless: bool,
    startup_timeout: Duration,
    query_timeout: Duration,
    command_slack: Duration,
}

impl PlaywrightLauncher {
    pub fn new(node_bin: impl Into<String>, headless: bool) -> Self {
        Self {
            node_bin: node_bin.into(),
            headless,
            startup_timeout: Duration::from_secs(60),
            query_timeout: Duration::from_secs(15),
            command_slack: Duration::from_secs(5),
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.node_bin);
        command
            .arg("-e")
            .arg(DRIVER_SCRIPT)
            .env("TRIALWATCH_HEADLESS", if self.headless { "1" } else { "0" });
        command
    }
}

#[async_trait]
impl BrowserLauncher for PlaywrightLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, AutomationError> {
        let session = PlaywrightSession::spawn(
            self.command(),
            self.startup_timeout,
            self.query_timeout,
            self.command_slack,
        )
        .await?;
        info!(node = %self.node_bin, headless = self.headless, "browser session started");
        Ok(Box::new(session))
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum DriverCommand<'a> {
    Goto { url: &'a str, timeout_ms: u64 },
    Count { selector: &'a str },
    Click { selector: &'a str, timeout_ms: u64 },
    Fill { selector: &'a str, value: &'a str, timeout_ms: u64 },
    Press { selector: &'a str, key: &'a str, timeout_ms: u64 },
    CaptureRequests,
    CapturedRequests,
    ArmDownload { timeout_ms: u64 },
    AwaitDownload { path: String },
    Close,
}

impl DriverCommand<'_> {
    fn step(&self) -> &'static str {
        match self {
            DriverCommand::Goto { .. } => "goto",
            DriverCommand::Count { .. } => "count",
            DriverCommand::Click { .. } => "click",
            DriverCommand::Fill { .. } => "fill",
            DriverCommand::Press { .. } => "press",
            DriverCommand::CaptureRequests => "capture_requests",
            DriverCommand::CapturedRequests => "captured_requests",
            DriverCommand::ArmDownload { .. } => "arm_download",
            DriverCommand::AwaitDownload { .. } => "await_download",
            DriverCommand::Close => "close",
        }
    }

    fn envelope(&self, id: i64) -> Result<String, AutomationError> {
        let mut value =
            serde_json::to_value(self).map_err(|e| AutomationError::Protocol(e.to_string()))?;
        let JsonValue::Object(fields) = &mut value else {
            return Err(AutomationError::Protocol("command is not an object".to_string()));
        };
        fields.insert("id".to_string(), JsonValue::from(id));
        Ok(value.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct DriverReply {
    id: i64,
    ok: bool,
    #[serde(default)]
    value: JsonValue,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    timeout: bool,
}

impl DriverReply {
    fn into_result(self, step: &str, budget: Duration) -> Result<JsonValue, AutomationError> {
        if self.ok {
            return Ok(self.value);
        }
        if self.timeout {
            return Err(AutomationError::Timeout {
                step: step.to_string(),
                timeout: budget,
            });
        }
        Err(AutomationError::Step {
            step: step.to_string(),
            message: self.error.unwrap_or_else(|| "unknown driver error".to_string()),
        })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

struct DriverIo {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl DriverIo {
    /// Read lines until the reply for `id` arrives. Other output is logged and skipped.
    async fn read_reply(&mut self, id: i64) -> Result<DriverReply, AutomationError> {
        loop {
            let Some(line) = self.stdout.next_line().await? else {
                return Err(AutomationError::DriverExited);
            };
            match serde_json::from_str::<DriverReply>(&line) {
                Ok(reply) if reply.id == id => return Ok(reply),
                Ok(reply) => debug!(id = reply.id, expected = id, "discarding stale driver reply"),
                Err(_) => debug!(line = %line, "driver output"),
            }
        }
    }
}

pub struct PlaywrightSession {
    io: Mutex<DriverIo>,
    next_id: AtomicI64,
    download_timeout_ms: AtomicU64,
    query_timeout: Duration,
    command_slack: Duration,
}

impl PlaywrightSession {
    async fn spawn(
        mut command: Command,
        startup_timeout: Duration,
        query_timeout: Duration,
        command_slack: Duration,
    ) -> Result<Self, AutomationError> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AutomationError::Launch(format!("spawning driver: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AutomationError::Launch("driver stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AutomationError::Launch("driver stdout unavailable".to_string()))?;

        let mut io = DriverIo {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
        };

        let ready = tokio::time::timeout(startup_timeout, io.read_reply(READY_ID))
            .await
            .map_err(|_| AutomationError::Timeout {
                step: "launch".to_string(),
                timeout: startup_timeout,
            })??;
        if !ready.ok {
            return Err(AutomationError::Launch(
                ready.error.unwrap_or_else(|| "driver failed to start".to_string()),
            ));
        }

        Ok(Self {
            io: Mutex::new(io),
            next_id: AtomicI64::new(READY_ID + 1),
            download_timeout_ms: AtomicU64::new(90_000),
            query_timeout,
            command_slack,
        })
    }

    async fn call(&self, command: DriverCommand<'_>, budget: Duration) -> Result<JsonValue, AutomationError> {
        let step = command.step();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = command.envelope(id)?;

        let mut io = self.io.lock().await;
        let exchange = async {
            let stdin = io.stdin.as_mut().ok_or(AutomationError::DriverExited)?;
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
            io.read_reply(id).await
        };

        let reply = tokio::time::timeout(budget + self.command_slack, exchange)
            .await
            .map_err(|_| AutomationError::Timeout {
                step: step.to_string(),
                timeout: budget,
            })??;
        reply.into_result(step, budget)
    }
}

#[async_trait]
impl BrowserSession for PlaywrightSession {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), AutomationError> {
        let timeout_ms = millis(timeout);
        self.call(DriverCommand::Goto { url, timeout_ms }, timeout).await?;
        Ok(())
    }

    async fn count(&self, selector: &str) -> Result<usize, AutomationError> {
        let value = self.call(DriverCommand::Count { selector }, self.query_timeout).await?;
        value
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| AutomationError::Protocol(format!("count returned {value}")))
    }

    async fn click(&self, selector: &str, timeout: Duration) -> Result<(), AutomationError> {
        let timeout_ms = millis(timeout);
        self.call(DriverCommand::Click { selector, timeout_ms }, timeout).await?;
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str, timeout: Duration) -> Result<(), AutomationError> {
        let timeout_ms = millis(timeout);
        self.call(DriverCommand::Fill { selector, value, timeout_ms }, timeout)
            .await?;
        Ok(())
    }

    async fn press(&self, selector: &str, key: &str, timeout: Duration) -> Result<(), AutomationError> {
        let timeout_ms = millis(timeout);
        self.call(DriverCommand::Press { selector, key, timeout_ms }, timeout)
            .await?;
        Ok(())
    }

    async fn capture_requests(&self) -> Result<(), AutomationError> {
        self.call(DriverCommand::CaptureRequests, self.query_timeout).await?;
        Ok(())
    }

    async fn captured_requests(&self) -> Result<Vec<String>, AutomationError> {
        let value = self.call(DriverCommand::CapturedRequests, self.query_timeout).await?;
        serde_json::from_value(value).map_err(|e| AutomationError::Protocol(e.to_string()))
    }

    async fn arm_download(&self, timeout: Duration) -> Result<(), AutomationError> {
        let timeout_ms = millis(timeout);
        self.download_timeout_ms.store(timeout_ms, Ordering::SeqCst);
        self.call(DriverCommand::ArmDownload { timeout_ms }, self.query_timeout)
            .await?;
        Ok(())
    }

    async fn await_download(&self, save_to: &Path) -> Result<PathBuf, AutomationError> {
        let budget = Duration::from_millis(self.download_timeout_ms.load(Ordering::SeqCst));
        let path = save_to.to_string_lossy().into_owned();
        self.call(DriverCommand::AwaitDownload { path }, budget).await?;
        Ok(save_to.to_path_buf())
    }

    async fn close(&self) -> Result<(), AutomationError> {
        let result = self.call(DriverCommand::Close, self.query_timeout).await;

        let mut io = self.io.lock().await;
        io.stdin.take();
        match tokio::time::timeout(self.command_slack, io.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "browser driver exited"),
            Ok(Err(err)) => warn!(error = %err, "waiting for browser driver failed"),
            Err(_) => {
                warn!("browser driver did not exit, killing it");
                io.child.kill().await?;
            }
        }

        match result {
            Ok(_) | Err(AutomationError::DriverExited) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_serialize_with_op_tag_and_id() {
        let line = DriverCommand::Fill {
            selector: "input",
            value: "15/10/2026",
            timeout_ms: 1500,
        }
        .envelope(7)
        .unwrap();
        let value: JsonValue = serde_json::from_str(&line).unwrap();
        assert_eq!(value["op"], "fill");
        assert_eq!(value["id"], 7);
        assert_eq!(value["value"], "15/10/2026");
        assert_eq!(value["timeout_ms"], 1500);

        let unit: JsonValue =
            serde_json::from_str(&DriverCommand::CaptureRequests.envelope(1).unwrap()).unwrap();
        assert_eq!(unit["op"], "capture_requests");
    }

    #[test]
    fn driver_timeouts_map_to_timeout_errors() {
        let reply: DriverReply =
            serde_json::from_str(r#"{"id":3,"ok":false,"error":"Timeout 100ms exceeded","timeout":true}"#)
                .unwrap();
        let err = reply.into_result("click", Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, AutomationError::Timeout { ref step, .. } if step == "click"));

        let reply: DriverReply =
            serde_json::from_str(r#"{"id":4,"ok":false,"error":"strict mode violation"}"#).unwrap();
        let err = reply.into_result("fill", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, AutomationError::Step { ref message, .. } if message == "strict mode violation"));
    }

    #[test]
    fn driver_script_handles_every_command() {
        for op in [
            "goto",
            "count",
            "click",
            "fill",
            "press",
            "capture_requests",
            "captured_requests",
            "arm_download",
            "await_download",
            "close",
        ] {
            assert!(DRIVER_SCRIPT.contains(&format!("{op}: async")), "missing handler for {op}");
        }
    }

    #[tokio::test]
    async fn missing_node_binary_is_a_launch_error() {
        let launcher = PlaywrightLauncher::new("/nonexistent/trialwatch-node", true);
        let err = launcher.launch().await.err().expect("launch should fail");
        assert!(matches!(err, AutomationError::Launch(_)));
    }

    #[cfg(unix)]
    fn scripted_driver(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn session_round_trips_over_stdio() {
        let script = r#"
printf '{"id":0,"ok":true,"value":"ready"}\n'
while read -r line; do
  id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/')
  printf 'log noise\n{"id":%s,"ok":true,"value":3}\n' "$id"
done
"#;
        let session = PlaywrightSession::spawn(
            scripted_driver(script),
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(session.count("button").await.unwrap(), 3);
        assert_eq!(session.count("label").await.unwrap(), 3);
        session.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_driver_times_out() {
        let script = r#"
printf '{"id":0,"ok":true,"value":"ready"}\n'
cat > /dev/null
"#;
        let session = PlaywrightSession::spawn(
            scripted_driver(script),
            Duration::from_secs(5),
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        let err = session.count("button").await.unwrap_err();
        assert!(matches!(err, AutomationError::Timeout { ref step, .. } if step == "count"));
        session.close().await.unwrap_err();
    }
}
