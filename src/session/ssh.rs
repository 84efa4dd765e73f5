use super::*;
use super::shell::{Shell, Utf8Decoder};

/// SSH session: an async-ssh2-tokio client with one PTY shell channel.
pub(super) struct SshSession {
    client: Client,
    shell: Shell,
    enable_secret: Option<Secret>,
}

/// Connects, authenticates and waits for the first prompt.
pub(super) async fn open(
    request: &SessionRequest,
    security: &ConnectionSecurityOptions,
) -> Result<Box<dyn DeviceSession>> {
    let peer = request.peer();

    let config = Config {
        preferred: security.preferred(),
        inactivity_timeout: Some(request.timeouts.session()),
        ..Default::default()
    };

    let client = Client::connect_with_config(
        (request.device.address.clone(), request.port),
        &request.credential.username,
        AuthMethod::with_password(request.credential.secret.expose()),
        security.server_check.clone(),
        config,
    )
    .await?;
    debug!("{} SSH transport established", peer);

    let mut channel = client.get_channel().await?;
    channel
        .request_pty(false, "xterm", 800, 600, 0, 0, &[])
        .await?;
    channel.request_shell(false).await?;
    debug!("{} shell request successful", peer);

    let (sender_to_shell, mut receiver_from_user) = mpsc::channel::<Vec<u8>>(256);
    let (sender_to_user, receiver_from_shell) = mpsc::channel::<String>(256);

    let io_peer = peer.clone();
    let io_task = tokio::spawn(async move {
        let mut utf8 = Utf8Decoder::default();
        loop {
            tokio::select! {
                Some(data) = receiver_from_user.recv() => {
                    if let Err(e) = channel.data(&data[..]).await {
                        debug!("{} failed to send data to shell: {:?}", io_peer, e);
                        break;
                    }
                },
                Some(msg) = channel.wait() => {
                    match msg {
                        ChannelMsg::Data { ref data } => {
                            let text = utf8.decode(data);
                            if !text.is_empty() && sender_to_user.send(text).await.is_err() {
                                debug!("{} shell output receiver dropped", io_peer);
                                break;
                            }
                        }
                        ChannelMsg::ExitStatus { exit_status } => {
                            debug!("{} shell exited with status {}", io_peer, exit_status);
                            let _ = channel.eof().await;
                            break;
                        }
                        ChannelMsg::Eof => {
                            debug!("{} shell sent EOF", io_peer);
                            break;
                        }
                        _ => {}
                    }
                }
                else => break,
            }
        }
        debug!("{} SSH I/O task ended", io_peer);
    });

    let mut shell = Shell::new(
        peer,
        sender_to_shell,
        receiver_from_shell,
        request.handler.clone(),
        io_task,
    );
    shell
        .login(&request.credential, request.timeouts.auth())
        .await?;

    Ok(Box::new(SshSession {
        client,
        shell,
        enable_secret: request.credential.enable_secret.clone(),
    }))
}

#[async_trait]
impl DeviceSession for SshSession {
    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<Output> {
        if self.client.is_closed() {
            return Err(BackupError::ProtocolError(format!(
                "{} SSH connection is closed",
                self.shell.peer()
            )));
        }
        self.shell.run(command, timeout).await
    }

    async fn escalate(&mut self, command: &str, timeout: Duration) -> Result<()> {
        let Some(secret) = self.enable_secret.clone() else {
            return Err(BackupError::AuthFailed(format!(
                "{} escalation requested without an enable secret",
                self.shell.peer()
            )));
        };
        self.shell.escalate(command, &secret, timeout).await
    }

    async fn close(&mut self) {
        self.shell.close().await;
        if let Err(e) = self.client.disconnect().await {
            debug!("{} disconnect: {}", self.shell.peer(), e);
        }
        debug!("{} SSH session closed", self.shell.peer());
    }
}
