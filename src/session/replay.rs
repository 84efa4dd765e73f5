use super::*;
use std::collections::HashMap;
use std::sync::Mutex;

/// One recorded transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TranscriptEntry {
    #[serde(default)]
    pub ts_ms: u64,
    pub event: TranscriptEvent,
}

/// Transcript event types, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptEvent {
    ConnectionEstablished {
        device_addr: String,
        prompt: String,
    },
    ConnectFailed {
        error: ErrorKind,
        detail: String,
    },
    CommandOutput {
        command: String,
        success: bool,
        content: String,
        #[serde(default)]
        error_line: Option<String>,
    },
    CommandFailed {
        command: String,
        error: ErrorKind,
        detail: String,
    },
    ConnectionClosed {
        reason: String,
    },
}

/// Parses a JSONL transcript, ordering entries by timestamp.
pub fn parse_transcript(jsonl: &str) -> Result<Vec<TranscriptEntry>> {
    let mut entries = Vec::new();
    for (idx, line) in jsonl.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: TranscriptEntry = serde_json::from_str(line).map_err(|e| {
            BackupError::InvalidConfig(format!("transcript line {}: {e}", idx + 1))
        })?;
        entries.push((idx, entry));
    }
    entries.sort_by(|(ia, a), (ib, b)| a.ts_ms.cmp(&b.ts_ms).then_with(|| ia.cmp(ib)));
    Ok(entries.into_iter().map(|(_, e)| e).collect())
}

type Response = std::result::Result<Output, BackupError>;

/// Scripted behaviour of one device.
///
/// Connect outcomes are consumed one per connection attempt; once exhausted,
/// connections succeed. Each command answers with its recorded responses in
/// order and repeats the last one after that.
#[derive(Debug, Clone, Default)]
pub struct DeviceScript {
    connects: Vec<Option<BackupError>>,
    responses: HashMap<String, Vec<Response>>,
    connect_delay: Duration,
    command_delay: Duration,
}

impl DeviceScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_connect(mut self, err: BackupError) -> Self {
        self.connects.push(Some(err));
        self
    }

    pub fn connect_ok(mut self) -> Self {
        self.connects.push(None);
        self
    }

    pub fn respond(mut self, command: &str, content: &str) -> Self {
        self.push(command, Ok(Output::ok(content)));
        self
    }

    /// The device prints an error line for this command.
    pub fn reject(mut self, command: &str, error_line: &str) -> Self {
        self.push(command, Ok(Output::rejected(error_line)));
        self
    }

    /// The session fails while running this command.
    pub fn fail(mut self, command: &str, err: BackupError) -> Self {
        self.push(command, Err(err));
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Every command takes this long to return.
    pub fn with_command_delay(mut self, delay: Duration) -> Self {
        self.command_delay = delay;
        self
    }

    fn push(&mut self, command: &str, response: Response) {
        self.responses
            .entry(command.to_string())
            .or_default()
            .push(response);
    }

    /// Builds a script from a recorded JSONL transcript.
    pub fn from_transcript(jsonl: &str) -> Result<Self> {
        let mut script = Self::new();
        for entry in parse_transcript(jsonl)? {
            match entry.event {
                TranscriptEvent::ConnectionEstablished { .. } => script.connects.push(None),
                TranscriptEvent::ConnectFailed { error, detail } => script
                    .connects
                    .push(Some(BackupError::from_kind(error, detail))),
                TranscriptEvent::CommandOutput {
                    command,
                    success,
                    content,
                    error_line,
                } => script.push(
                    &command,
                    Ok(Output {
                        success,
                        content,
                        error_line,
                    }),
                ),
                TranscriptEvent::CommandFailed {
                    command,
                    error,
                    detail,
                } => script.push(&command, Err(BackupError::from_kind(error, detail))),
                TranscriptEvent::ConnectionClosed { .. } => {}
            }
        }
        Ok(script)
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    script: DeviceScript,
    connect_cursor: usize,
    command_cursor: HashMap<String, usize>,
    connect_log: Vec<Protocol>,
    commands: Vec<String>,
    in_flight: usize,
    peak: usize,
}

#[derive(Debug, Default)]
struct ReplayState {
    devices: HashMap<DeviceId, DeviceState>,
    in_flight: usize,
    peak: usize,
}

/// Connector that plays scripted device behaviour instead of opening sockets.
///
/// It also records what the engine did: connection attempts, issued
/// commands and how many sessions were open at once.
#[derive(Debug, Clone, Default)]
pub struct ReplayConnector {
    state: Arc<Mutex<ReplayState>>,
}

impl ReplayConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, device: impl Into<String>, script: DeviceScript) {
        if let Ok(mut state) = self.state.lock() {
            state.devices.insert(
                DeviceId::new(device),
                DeviceState {
                    script,
                    ..Default::default()
                },
            );
        }
    }

    /// Appends a response for the next run without resetting counters.
    pub fn push_response(&self, device: &DeviceId, command: &str, content: &str) {
        if let Ok(mut state) = self.state.lock()
            && let Some(device) = state.devices.get_mut(device)
        {
            device.script.push(command, Ok(Output::ok(content)));
        }
    }

    fn with_device<T: Default>(&self, device: &DeviceId, f: impl FnOnce(&DeviceState) -> T) -> T {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.devices.get(device).map(f))
            .unwrap_or_default()
    }

    /// Protocols of every connection attempt, in order.
    pub fn connect_log(&self, device: &DeviceId) -> Vec<Protocol> {
        self.with_device(device, |d| d.connect_log.clone())
    }

    pub fn connect_attempts(&self, device: &DeviceId) -> usize {
        self.with_device(device, |d| d.connect_log.len())
    }

    /// Every command issued to the device, escalation included.
    pub fn commands(&self, device: &DeviceId) -> Vec<String> {
        self.with_device(device, |d| d.commands.clone())
    }

    /// Highest number of simultaneously open sessions on one device.
    pub fn max_in_flight(&self, device: &DeviceId) -> usize {
        self.with_device(device, |d| d.peak)
    }

    /// Highest number of simultaneously open sessions overall.
    pub fn max_in_flight_total(&self) -> usize {
        self.state.lock().map(|s| s.peak).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ReplayState>> {
        self.state
            .lock()
            .map_err(|e| BackupError::ProtocolError(format!("replay state poisoned: {e}")))
    }
}

#[async_trait]
impl Connector for ReplayConnector {
    async fn connect(&self, request: &SessionRequest) -> Result<Box<dyn DeviceSession>> {
        let device_id = request.device.id.clone();
        let delay = {
            let mut state = self.lock()?;
            let Some(device) = state.devices.get_mut(&device_id) else {
                return Err(BackupError::ConnectRefused(format!(
                    "{} has no replay script",
                    request.peer()
                )));
            };
            device.connect_log.push(request.protocol);
            device.script.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock()?;
        let outcome = {
            let Some(device) = state.devices.get_mut(&device_id) else {
                return Err(BackupError::ConnectRefused(request.peer()));
            };
            let outcome = device
                .script
                .connects
                .get(device.connect_cursor)
                .cloned()
                .flatten();
            device.connect_cursor += 1;
            if outcome.is_none() {
                device.in_flight += 1;
                device.peak = device.peak.max(device.in_flight);
            }
            outcome
        };
        if let Some(err) = outcome {
            debug!("replay {} connect fails with {}", device_id, err.kind());
            return Err(err);
        }
        state.in_flight += 1;
        state.peak = state.peak.max(state.in_flight);
        trace!("replay session opened for {}", device_id);

        Ok(Box::new(ReplaySession {
            device: device_id,
            state: self.state.clone(),
        }))
    }
}

struct ReplaySession {
    device: DeviceId,
    state: Arc<Mutex<ReplayState>>,
}

impl ReplaySession {
    fn next_response(&self, command: &str) -> Result<(Option<Response>, Duration)> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| BackupError::ProtocolError(format!("replay state poisoned: {e}")))?;
        let Some(device) = state.devices.get_mut(&self.device) else {
            return Ok((None, Duration::ZERO));
        };
        device.commands.push(command.to_string());
        let delay = device.script.command_delay;
        let Some(responses) = device.script.responses.get(command) else {
            return Ok((None, delay));
        };
        let cursor = device.command_cursor.entry(command.to_string()).or_insert(0);
        let idx = (*cursor).min(responses.len().saturating_sub(1));
        *cursor += 1;
        Ok((responses.get(idx).cloned(), delay))
    }
}

#[async_trait]
impl DeviceSession for ReplaySession {
    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<Output> {
        let (response, delay) = self.next_response(command)?;
        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(BackupError::CommandTimeout(format!(
                "'{command}' on {} did not finish within {}s",
                self.device,
                timeout.as_secs()
            )));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match response {
            Some(response) => response,
            None => Ok(Output::rejected(format!(
                "% Invalid input detected (no recorded output for '{command}')"
            ))),
        }
    }

    async fn escalate(&mut self, command: &str, _timeout: Duration) -> Result<()> {
        match self.next_response(command)?.0 {
            Some(Ok(output)) if !output.success => Err(BackupError::AuthFailed(format!(
                "{} rejected '{command}'",
                self.device
            ))),
            Some(Err(err)) => Err(err),
            _ => Ok(()),
        }
    }

    async fn close(&mut self) {
        trace!("replay session closed for {}", self.device);
    }
}

impl Drop for ReplaySession {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.in_flight = state.in_flight.saturating_sub(1);
            if let Some(device) = state.devices.get_mut(&self.device) {
                device.in_flight = device.in_flight.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::PromptPatterns;

    const TRANSCRIPT: &str = r#"{"ts_ms":2,"event":{"kind":"connection_established","device_addr":"backup@10.0.0.1:22","prompt":"r1#"}}
{"ts_ms":1,"event":{"kind":"connect_failed","error":"connect_timeout","detail":"no answer"}}
{"ts_ms":3,"event":{"kind":"command_output","command":"show running-config","success":true,"content":"hostname r1"}}
{"ts_ms":4,"event":{"kind":"command_failed","command":"show version","error":"command_timeout","detail":"stalled"}}
"#;

    fn request(id: &str) -> SessionRequest {
        let handler = PromptHandler::new(&PromptPatterns {
            prompts: vec![r"\S+#\s*$".to_string()],
            ..Default::default()
        })
        .expect("handler");
        SessionRequest::new(
            Arc::new(Device::new(id, "10.0.0.1", "cisco_ios", "ro")),
            CredentialView::new("backup", "pw"),
            handler,
            TimeoutConfig::default(),
        )
    }

    #[tokio::test]
    async fn transcript_drives_connects_and_commands() {
        let replay = ReplayConnector::new();
        replay.script(
            "r1",
            DeviceScript::from_transcript(TRANSCRIPT).expect("transcript"),
        );

        let err = replay.connect(&request("r1")).await.err().expect("first connect fails");
        assert_eq!(err.kind(), ErrorKind::ConnectTimeout);

        let mut session = replay.connect(&request("r1")).await.expect("second connect");
        let output = session
            .execute("show running-config", Duration::from_secs(5))
            .await
            .expect("config");
        assert_eq!(output.content, "hostname r1");

        let err = session
            .execute("show version", Duration::from_secs(5))
            .await
            .expect_err("scripted failure");
        assert_eq!(err.kind(), ErrorKind::CommandTimeout);

        let output = session
            .execute("show clock", Duration::from_secs(5))
            .await
            .expect("unknown command");
        assert!(!output.success);
        assert_eq!(replay.connect_attempts(&DeviceId::from("r1")), 2);
    }

    #[tokio::test]
    async fn responses_advance_and_last_one_repeats() {
        let replay = ReplayConnector::new();
        replay.script(
            "r1",
            DeviceScript::new()
                .respond("show run", "v1")
                .respond("show run", "v2"),
        );
        let mut session = replay.connect(&request("r1")).await.expect("connect");
        let timeout = Duration::from_secs(1);
        assert_eq!(session.execute("show run", timeout).await.expect("1").content, "v1");
        assert_eq!(session.execute("show run", timeout).await.expect("2").content, "v2");
        assert_eq!(session.execute("show run", timeout).await.expect("3").content, "v2");
    }

    #[tokio::test]
    async fn in_flight_gauge_tracks_open_sessions() {
        let replay = ReplayConnector::new();
        replay.script("r1", DeviceScript::new());
        let first = replay.connect(&request("r1")).await.expect("first");
        let second = replay.connect(&request("r1")).await.expect("second");
        drop(first);
        drop(second);
        let _third = replay.connect(&request("r1")).await.expect("third");
        assert_eq!(replay.max_in_flight(&DeviceId::from("r1")), 2);
        assert_eq!(replay.max_in_flight_total(), 2);
    }

    #[test]
    fn malformed_transcript_is_rejected() {
        let err = parse_transcript("{not json}\n").expect_err("bad line");
        assert!(matches!(err, BackupError::InvalidConfig(_)));
    }
}
