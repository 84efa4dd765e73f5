use super::*;

/// Interactive shell shared by the SSH and Telnet transports.
///
/// The transport owns an IO task that moves bytes between the wire and the
/// two channels held here; the shell only sees text.
pub(super) struct Shell {
    peer: String,
    sender: Sender<Vec<u8>>,
    recv: Receiver<String>,
    handler: PromptHandler,
    prompt: String,
    io_task: JoinHandle<()>,
}

#[derive(Clone, Copy)]
enum Phase<'a> {
    Command,
    Escalate(&'a Secret),
}

impl Shell {
    pub(super) fn new(
        peer: String,
        sender: Sender<Vec<u8>>,
        recv: Receiver<String>,
        handler: PromptHandler,
        io_task: JoinHandle<()>,
    ) -> Self {
        Self {
            peer,
            sender,
            recv,
            handler,
            prompt: String::new(),
            io_task,
        }
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        self.sender.send(data.to_vec()).await.map_err(|_| {
            BackupError::ProtocolError(format!("{} shell input channel closed", self.peer))
        })
    }

    /// Waits for the first prompt, answering in-band login prompts.
    ///
    /// A repeated username or password prompt, or an authentication failure
    /// line, means the credentials were rejected.
    pub(super) async fn login(
        &mut self,
        credential: &CredentialView,
        timeout: Duration,
    ) -> Result<()> {
        let mut buffer = String::new();
        let mut sent_username = false;
        let mut sent_password = false;

        let result = tokio::time::timeout(timeout, async {
            loop {
                let Some(data) = self.recv.recv().await else {
                    return Err(BackupError::ProtocolError(format!(
                        "{} closed the session before the first prompt",
                        self.peer
                    )));
                };
                trace!("{:?}", data);
                buffer.push_str(&data);

                while let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer.drain(..=newline_pos).collect::<String>();
                    let line = clean_line(&line);
                    if self.handler.is_auth_failure(line.trim_end()) {
                        return Err(BackupError::AuthFailed(format!(
                            "{} rejected the login",
                            self.peer
                        )));
                    }
                }

                if buffer.is_empty() {
                    continue;
                }
                let tail = clean_line(&buffer);
                if self.handler.is_auth_failure(&tail) {
                    return Err(BackupError::AuthFailed(format!(
                        "{} rejected the login",
                        self.peer
                    )));
                }
                if self.handler.read_prompt(&tail) {
                    self.prompt = tail.trim_end().to_string();
                    return Ok(());
                }
                match self.handler.input_required(&tail) {
                    Some(InputKind::Username) => {
                        if sent_username {
                            return Err(BackupError::AuthFailed(format!(
                                "{} asked for the username again",
                                self.peer
                            )));
                        }
                        sent_username = true;
                        buffer.clear();
                        self.send(format!("{}\n", credential.username).as_bytes())
                            .await?;
                    }
                    Some(InputKind::Password) => {
                        if sent_password {
                            return Err(BackupError::AuthFailed(format!(
                                "{} asked for the password again",
                                self.peer
                            )));
                        }
                        sent_password = true;
                        buffer.clear();
                        self.send(format!("{}\n", credential.secret.expose()).as_bytes())
                            .await?;
                    }
                    Some(InputKind::More) => {
                        buffer.clear();
                        self.send(b" ").await?;
                    }
                    None => {}
                }
            }
        })
        .await;

        match result {
            Ok(res) => {
                if res.is_ok() {
                    debug!("{} logged in, prompt {:?}", self.peer, self.prompt);
                }
                res
            }
            Err(_) => Err(BackupError::ConnectTimeout(format!(
                "no prompt from {} within {}s",
                self.peer,
                timeout.as_secs()
            ))),
        }
    }

    /// Sends a command and collects output until the prompt returns.
    pub(super) async fn run(&mut self, command: &str, timeout: Duration) -> Result<Output> {
        self.write(command, timeout, Phase::Command).await
    }

    /// Runs the escalation command; the enable prompt is answered once.
    pub(super) async fn escalate(
        &mut self,
        command: &str,
        enable_secret: &Secret,
        timeout: Duration,
    ) -> Result<()> {
        let output = self
            .write(command, timeout, Phase::Escalate(enable_secret))
            .await?;
        if !output.success {
            return Err(BackupError::AuthFailed(format!(
                "{} rejected '{command}': {}",
                self.peer,
                output.error_line.unwrap_or_default()
            )));
        }
        // IOS-style CLIs keep the `>` prompt when the enable secret is wrong.
        if self.prompt.ends_with('>') {
            return Err(BackupError::AuthFailed(format!(
                "{} is still unprivileged after '{command}'",
                self.peer
            )));
        }
        Ok(())
    }

    async fn write(&mut self, command: &str, timeout: Duration, phase: Phase<'_>) -> Result<Output> {
        // Drop anything left over from the previous command.
        while self.recv.try_recv().is_ok() {}

        self.send(format!("{command}\n").as_bytes()).await?;

        let mut lines: Vec<String> = Vec::new();
        let mut line_buffer = String::new();
        let mut error_line: Option<String> = None;
        let mut secret_sent = false;

        let result = tokio::time::timeout(timeout, async {
            loop {
                let Some(data) = self.recv.recv().await else {
                    return Err(BackupError::ProtocolError(format!(
                        "{} closed the session during '{command}'",
                        self.peer
                    )));
                };
                line_buffer.push_str(&data);

                while let Some(newline_pos) = line_buffer.find('\n') {
                    let raw = line_buffer.drain(..=newline_pos).collect::<String>();
                    let cleaned = clean_line(&raw);
                    let line = self.handler.scrub_more(cleaned.trim_end()).into_owned();
                    match self.handler.classify(&line) {
                        LineClass::Error if error_line.is_none() => {
                            error_line = Some(line.trim().to_string());
                        }
                        LineClass::AuthFailure if matches!(phase, Phase::Escalate(_)) => {
                            return Err(BackupError::AuthFailed(format!(
                                "{} rejected '{command}'",
                                self.peer
                            )));
                        }
                        _ => {}
                    }
                    lines.push(line);
                }

                // The prompt and input requests arrive without a newline.
                if line_buffer.is_empty() {
                    continue;
                }
                let tail = clean_line(&line_buffer);
                if self.handler.read_prompt(&tail) {
                    self.prompt = tail.trim_end().to_string();
                    return Ok(());
                }
                match self.handler.input_required(&tail) {
                    Some(InputKind::More) => {
                        trace!("{} paging", self.peer);
                        line_buffer.clear();
                        self.send(b" ").await?;
                    }
                    Some(InputKind::Password) => match phase {
                        Phase::Escalate(secret) if !secret_sent => {
                            secret_sent = true;
                            line_buffer.clear();
                            self.send(format!("{}\n", secret.expose()).as_bytes())
                                .await?;
                        }
                        Phase::Escalate(_) => {
                            return Err(BackupError::AuthFailed(format!(
                                "{} asked for the enable secret again",
                                self.peer
                            )));
                        }
                        Phase::Command => {
                            return Err(BackupError::ProtocolError(format!(
                                "{} asked for a password during '{command}'",
                                self.peer
                            )));
                        }
                    },
                    Some(InputKind::Username) => {
                        return Err(BackupError::ProtocolError(format!(
                            "{} asked for a username during '{command}'",
                            self.peer
                        )));
                    }
                    None => {}
                }
            }
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                let received: usize = lines.iter().map(|l| l.len() + 1).sum();
                return Err(BackupError::CommandTimeout(format!(
                    "'{command}' on {} did not finish within {}s ({received} bytes received)",
                    self.peer,
                    timeout.as_secs()
                )));
            }
        }

        // Remove the echoed command.
        if lines
            .first()
            .map(|first| first.trim_end().ends_with(command.trim()))
            .unwrap_or(false)
        {
            lines.remove(0);
        }

        Ok(Output {
            success: error_line.is_none(),
            content: lines.join("\n"),
            error_line,
        })
    }

    /// Sends `exit` and stops the IO task.
    pub(super) async fn close(&mut self) {
        self.recv.close();
        if let Err(e) = self.send(b"exit\n").await {
            debug!("{} exit not sent: {}", self.peer, e);
        } else {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.io_task.abort();
    }

    pub(super) fn peer(&self) -> &str {
        &self.peer
    }
}

impl Drop for Shell {
    fn drop(&mut self) {
        self.io_task.abort();
    }
}

/// Turns a byte stream into text without splitting multi-byte characters.
///
/// A sequence cut short at the end of a read is held back until the next
/// read completes it; bytes that can never be valid UTF-8 become U+FFFD.
#[derive(Debug, Default)]
pub(super) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(super) fn decode(&mut self, input: &[u8]) -> String {
        self.pending.extend_from_slice(input);
        let mut text = String::with_capacity(self.pending.len());
        let mut rest = &self.pending[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::PromptPatterns;

    fn handler() -> PromptHandler {
        PromptHandler::new(&PromptPatterns {
            prompts: vec![r"[\w.-]+[>#]\s*$".to_string()],
            more: vec![r"\s*--More--\s*".to_string()],
            errors: vec![r"^% Invalid input".to_string()],
            auth_failures: vec![r"(?i)% (bad secrets|access denied)".to_string()],
            username: vec![r"(?i)username:\s*$".to_string()],
            password: vec![r"(?i)password:\s*$".to_string()],
            ..Default::default()
        })
        .expect("handler")
    }

    /// Shell wired to an in-process fake device; the returned channels are
    /// the device side.
    fn fake_shell() -> (Shell, Receiver<Vec<u8>>, Sender<String>) {
        let (to_device, from_shell) = mpsc::channel::<Vec<u8>>(64);
        let (to_shell, from_device) = mpsc::channel::<String>(64);
        let task = tokio::spawn(async {});
        let shell = Shell::new("test@r1:22".to_string(), to_device, from_device, handler(), task);
        (shell, from_shell, to_shell)
    }

    async fn expect_sent(rx: &mut Receiver<Vec<u8>>, expected: &str) {
        let data = rx.recv().await.expect("shell wrote");
        assert_eq!(String::from_utf8_lossy(&data), expected);
    }

    #[tokio::test]
    async fn login_answers_username_and_password() {
        let (mut shell, mut device_rx, device_tx) = fake_shell();
        let credential = CredentialView::new("backup", "pw");

        let device = tokio::spawn(async move {
            device_tx.send("\r\nUser Access Verification\r\n\r\nUsername: ".into()).await.expect("send");
            expect_sent(&mut device_rx, "backup\n").await;
            device_tx.send("\r\nPassword: ".into()).await.expect("send");
            expect_sent(&mut device_rx, "pw\n").await;
            device_tx.send("\r\nr1>".into()).await.expect("send");
            (device_rx, device_tx)
        });

        shell
            .login(&credential, Duration::from_secs(5))
            .await
            .expect("login");
        assert_eq!(shell.prompt, "r1>");
        device.await.expect("device task");
    }

    #[tokio::test]
    async fn repeated_password_prompt_is_auth_failure() {
        let (mut shell, mut device_rx, device_tx) = fake_shell();
        let credential = CredentialView::new("backup", "wrong");

        tokio::spawn(async move {
            device_tx.send("Password: ".into()).await.expect("send");
            expect_sent(&mut device_rx, "wrong\n").await;
            device_tx.send("\r\nPassword: ".into()).await.expect("send");
            let _ = device_rx.recv().await;
        });

        let err = shell
            .login(&credential, Duration::from_secs(5))
            .await
            .expect_err("auth failure");
        assert!(matches!(err, BackupError::AuthFailed(_)));
    }

    #[tokio::test]
    async fn run_strips_echo_pages_and_prompt() {
        let (mut shell, mut device_rx, device_tx) = fake_shell();

        tokio::spawn(async move {
            expect_sent(&mut device_rx, "show running-config\n").await;
            device_tx
                .send("show running-config\r\nhostname r1\r\n --More-- ".into())
                .await
                .expect("send");
            expect_sent(&mut device_rx, " ").await;
            device_tx
                .send("\u{8}\u{8}\u{8}\u{8}\u{8}\u{8}\u{8}\u{8}\u{8}\u{8}          \u{8}\u{8}\u{8}\u{8}\u{8}\u{8}\u{8}\u{8}\u{8}\u{8}interface Gi0/1\r\nr1#".into())
                .await
                .expect("send");
            let _ = device_rx.recv().await;
        });

        let output = shell
            .run("show running-config", Duration::from_secs(5))
            .await
            .expect("run");
        assert!(output.success);
        assert_eq!(output.content, "hostname r1\ninterface Gi0/1");
    }

    #[tokio::test]
    async fn error_line_marks_output_failed() {
        let (mut shell, mut device_rx, device_tx) = fake_shell();

        tokio::spawn(async move {
            expect_sent(&mut device_rx, "show bogus\n").await;
            device_tx
                .send("show bogus\r\n% Invalid input detected at '^' marker.\r\nr1#".into())
                .await
                .expect("send");
            let _ = device_rx.recv().await;
        });

        let output = shell
            .run("show bogus", Duration::from_secs(5))
            .await
            .expect("run");
        assert!(!output.success);
        assert_eq!(
            output.error_line.as_deref(),
            Some("% Invalid input detected at '^' marker.")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_is_command_timeout() {
        let (mut shell, _device_rx, _device_tx) = fake_shell();
        let err = shell
            .run("show running-config", Duration::from_secs(2))
            .await
            .expect_err("timeout");
        assert!(matches!(err, BackupError::CommandTimeout(_)));
    }

    #[tokio::test]
    async fn escalation_answers_enable_secret() {
        let (mut shell, mut device_rx, device_tx) = fake_shell();
        let secret = Secret::new("en");

        tokio::spawn(async move {
            expect_sent(&mut device_rx, "enable\n").await;
            device_tx.send("enable\r\nPassword: ".into()).await.expect("send");
            expect_sent(&mut device_rx, "en\n").await;
            device_tx.send("\r\nr1#".into()).await.expect("send");
            let _ = device_rx.recv().await;
        });

        shell
            .escalate("enable", &secret, Duration::from_secs(5))
            .await
            .expect("escalate");
        assert_eq!(shell.prompt, "r1#");
    }

    #[tokio::test]
    async fn wrong_enable_secret_is_auth_failure() {
        let (mut shell, mut device_rx, device_tx) = fake_shell();
        let secret = Secret::new("bad");

        tokio::spawn(async move {
            expect_sent(&mut device_rx, "enable\n").await;
            device_tx.send("enable\r\nPassword: ".into()).await.expect("send");
            expect_sent(&mut device_rx, "bad\n").await;
            device_tx.send("\r\n% Bad secrets\r\n\r\nr1>".into()).await.expect("send");
            let _ = device_rx.recv().await;
        });

        let err = shell
            .escalate("enable", &secret, Duration::from_secs(5))
            .await
            .expect_err("bad secret");
        assert!(matches!(err, BackupError::AuthFailed(_)));
    }

    #[test]
    fn split_multibyte_character_is_reassembled() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"description caf\xC3"), "description caf");
        assert_eq!(decoder.decode(b"\xA9\r\nr1#"), "\u{e9}\r\nr1#");
    }

    #[test]
    fn invalid_bytes_are_replaced_once() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xFFb"), "a\u{fffd}b");
        assert_eq!(decoder.decode(b"\xE2\x82"), "");
        assert_eq!(decoder.decode(b"\xAC!"), "\u{20ac}!");
    }
}
