use super::*;

/// Connector for real devices over SSH or Telnet.
#[derive(Debug, Clone, Default)]
pub struct NetworkConnector {
    security: ConnectionSecurityOptions,
}

impl NetworkConnector {
    pub fn new(security: ConnectionSecurityOptions) -> Self {
        Self { security }
    }
}

#[async_trait]
impl Connector for NetworkConnector {
    async fn connect(&self, request: &SessionRequest) -> Result<Box<dyn DeviceSession>> {
        match request.protocol {
            Protocol::Ssh => super::ssh::open(request, &self.security).await,
            Protocol::Telnet => super::telnet::open(request).await,
        }
    }
}

/// Opens one session per attempt.
///
/// Connection establishment is bounded by the connect plus auth timeouts.
/// When a device allows it, an unreachable SSH endpoint is retried once over
/// Telnet inside the same attempt.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Manager backed by [`NetworkConnector`].
    pub fn network(security: ConnectionSecurityOptions) -> Self {
        Self::new(Arc::new(NetworkConnector::new(security)))
    }

    pub async fn open(&self, request: SessionRequest) -> Result<Box<dyn DeviceSession>> {
        let device_id = request.device.id.clone();
        match self.open_once(&request).await {
            Ok(session) => Ok(session),
            Err(err) if Self::should_fall_back(&request, &err) => {
                warn!(
                    "{} SSH unreachable ({}), falling back to Telnet",
                    device_id,
                    err.kind()
                );
                let fallback = SessionRequest {
                    protocol: Protocol::Telnet,
                    port: Protocol::Telnet.default_port(),
                    ..request
                };
                self.open_once(&fallback).await
            }
            Err(err) => Err(err),
        }
    }

    fn should_fall_back(request: &SessionRequest, err: &BackupError) -> bool {
        request.protocol == Protocol::Ssh
            && request.device.telnet_fallback
            && matches!(
                err.kind(),
                ErrorKind::ConnectRefused | ErrorKind::ConnectTimeout
            )
    }

    async fn open_once(&self, request: &SessionRequest) -> Result<Box<dyn DeviceSession>> {
        let peer = request.peer();
        let budget = request.timeouts.connect() + request.timeouts.auth();
        debug!("opening {:?} session to {}", request.protocol, peer);
        match tokio::time::timeout(budget, self.connector.connect(request)).await {
            Ok(Ok(session)) => {
                info!("{} session established over {:?}", peer, request.protocol);
                Ok(session)
            }
            Ok(Err(err)) => {
                debug!("{} connect failed: {}", peer, err);
                Err(err)
            }
            Err(_) => Err(BackupError::ConnectTimeout(format!(
                "{} did not answer within {}s",
                peer,
                budget.as_secs()
            ))),
        }
    }
}
