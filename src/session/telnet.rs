use super::*;
use super::shell::{Shell, Utf8Decoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum DecodeState {
    #[default]
    Data,
    Iac,
    Negotiate(u8),
    Subnegotiation,
    SubnegotiationIac,
}

/// Strips Telnet commands from the byte stream and refuses every option.
///
/// `DO x` is answered with `WONT x` and `WILL x` with `DONT x`; the session
/// stays in plain NVT mode.
#[derive(Debug, Default)]
pub(super) struct TelnetDecoder {
    state: DecodeState,
}

impl TelnetDecoder {
    pub(super) fn feed(&mut self, input: &[u8], data: &mut Vec<u8>, replies: &mut Vec<u8>) {
        for &byte in input {
            self.state = match (self.state, byte) {
                (DecodeState::Data, IAC) => DecodeState::Iac,
                (DecodeState::Data, b) => {
                    data.push(b);
                    DecodeState::Data
                }
                (DecodeState::Iac, IAC) => {
                    data.push(IAC);
                    DecodeState::Data
                }
                (DecodeState::Iac, DO | DONT | WILL | WONT) => DecodeState::Negotiate(byte),
                (DecodeState::Iac, SB) => DecodeState::Subnegotiation,
                (DecodeState::Iac, _) => DecodeState::Data,
                (DecodeState::Negotiate(verb), option) => {
                    match verb {
                        DO => replies.extend_from_slice(&[IAC, WONT, option]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, option]),
                        _ => {}
                    }
                    DecodeState::Data
                }
                (DecodeState::Subnegotiation, IAC) => DecodeState::SubnegotiationIac,
                (DecodeState::Subnegotiation, _) => DecodeState::Subnegotiation,
                (DecodeState::SubnegotiationIac, SE) => DecodeState::Data,
                (DecodeState::SubnegotiationIac, _) => DecodeState::Subnegotiation,
            };
        }
    }
}

/// Line endings go out as CR LF; a literal 0xFF is doubled.
fn encode_outgoing(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + 2);
    for &byte in input {
        match byte {
            b'\n' => out.extend_from_slice(b"\r\n"),
            IAC => out.extend_from_slice(&[IAC, IAC]),
            b => out.push(b),
        }
    }
    out
}

pub(super) struct TelnetSession {
    shell: Shell,
    enable_secret: Option<Secret>,
}

/// Connects over plain TCP and logs in through the in-band prompts.
pub(super) async fn open(request: &SessionRequest) -> Result<Box<dyn DeviceSession>> {
    let peer = request.peer();
    let stream = TcpStream::connect((request.device.address.as_str(), request.port)).await?;
    debug!("{} Telnet TCP connection established", peer);

    let (mut reader, mut writer) = stream.into_split();
    let (sender_to_shell, mut receiver_from_user) = mpsc::channel::<Vec<u8>>(256);
    let (sender_to_user, receiver_from_shell) = mpsc::channel::<String>(256);

    let io_peer = peer.clone();
    let io_task = tokio::spawn(async move {
        let mut decoder = TelnetDecoder::default();
        let mut utf8 = Utf8Decoder::default();
        let mut buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                Some(data) = receiver_from_user.recv() => {
                    if let Err(e) = writer.write_all(&encode_outgoing(&data)).await {
                        debug!("{} failed to write to socket: {}", io_peer, e);
                        break;
                    }
                },
                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => {
                            debug!("{} closed the Telnet connection", io_peer);
                            break;
                        }
                        Ok(n) => n,
                        Err(e) => {
                            debug!("{} socket read failed: {}", io_peer, e);
                            break;
                        }
                    };
                    let mut data = Vec::with_capacity(n);
                    let mut replies = Vec::new();
                    decoder.feed(&buf[..n], &mut data, &mut replies);
                    if !replies.is_empty() && writer.write_all(&replies).await.is_err() {
                        break;
                    }
                    let text = utf8.decode(&data);
                    if !text.is_empty() && sender_to_user.send(text).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("{} Telnet I/O task ended", io_peer);
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

    Ok(Box::new(TelnetSession {
        shell,
        enable_secret: request.credential.enable_secret.clone(),
    }))
}

#[async_trait]
impl DeviceSession for TelnetSession {
    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<Output> {
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
        debug!("{} Telnet session closed", self.shell.peer());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_is_refused_and_stripped() {
        let mut decoder = TelnetDecoder::default();
        let mut data = Vec::new();
        let mut replies = Vec::new();
        // IAC DO ECHO, IAC WILL SGA, then text.
        decoder.feed(&[IAC, DO, 1, IAC, WILL, 3, b'o', b'k'], &mut data, &mut replies);
        assert_eq!(data, b"ok");
        assert_eq!(replies, vec![IAC, WONT, 1, IAC, DONT, 3]);
    }

    #[test]
    fn commands_split_across_reads_are_decoded() {
        let mut decoder = TelnetDecoder::default();
        let mut data = Vec::new();
        let mut replies = Vec::new();
        decoder.feed(&[b'a', IAC], &mut data, &mut replies);
        decoder.feed(&[DO], &mut data, &mut replies);
        decoder.feed(&[24, b'b'], &mut data, &mut replies);
        assert_eq!(data, b"ab");
        assert_eq!(replies, vec![IAC, WONT, 24]);
    }

    #[test]
    fn subnegotiation_and_escaped_iac() {
        let mut decoder = TelnetDecoder::default();
        let mut data = Vec::new();
        let mut replies = Vec::new();
        decoder.feed(
            &[IAC, SB, 24, 1, IAC, SE, b'x', IAC, IAC, b'y'],
            &mut data,
            &mut replies,
        );
        assert_eq!(data, vec![b'x', IAC, b'y']);
        assert!(replies.is_empty());
    }

    #[test]
    fn outgoing_newlines_become_crlf() {
        assert_eq!(encode_outgoing(b"show run\n"), b"show run\r\n".to_vec());
    }

    #[tokio::test]
    async fn multibyte_text_split_across_segments_is_preserved() {
        use crate::config::TimeoutConfig;
        use crate::prompt::PromptPatterns;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            socket.write_all(b"\r\nr1#").await.expect("write");
            let mut buf = [0u8; 64];
            let mut seen = Vec::new();
            while !seen.ends_with(b"\r\n") {
                let n = socket.read(&mut buf).await.expect("read");
                assert!(n > 0, "client closed early");
                seen.extend_from_slice(&buf[..n]);
            }
            socket
                .write_all(b"show run\r\ndescription caf\xC3")
                .await
                .expect("write");
            socket.flush().await.expect("flush");
            tokio::time::sleep(Duration::from_millis(100)).await;
            socket.write_all(b"\xA9\r\nr1#").await.expect("write");
            let _ = socket.read(&mut buf).await;
        });

        let handler = PromptHandler::new(&PromptPatterns {
            prompts: vec![r"[\w.-]+[>#]\s*$".to_string()],
            ..Default::default()
        })
        .expect("handler");
        let device = Device::new("r1", "127.0.0.1", "cisco_ios", "ro")
            .with_protocol(Protocol::Telnet)
            .with_port(port);
        let request = SessionRequest::new(
            Arc::new(device),
            CredentialView::new("backup", "pw"),
            handler,
            TimeoutConfig::default(),
        );

        let mut session = open(&request).await.expect("open");
        let output = session
            .execute("show run", Duration::from_secs(5))
            .await
            .expect("execute");
        assert_eq!(output.content, "description caf\u{e9}");
        session.close().await;
    }
}
