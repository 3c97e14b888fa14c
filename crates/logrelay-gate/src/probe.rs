use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use logrelay_types::{Credential, Endpoint, FailureClass, ProbeKind};

use crate::gate::GateError;

/// Default per-attempt bound on connecting and answering
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("no answer within {0:?}")]
    Timeout(Duration),

    #[error("credential rejected (HTTP {0})")]
    Auth(u16),

    #[error("unexpected answer: {0}")]
    Protocol(String),
}

impl ProbeError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Connect(_) => FailureClass::Connect,
            Self::Timeout(_) => FailureClass::Timeout,
            Self::Auth(_) => FailureClass::Auth,
            Self::Protocol(_) => FailureClass::Protocol,
        }
    }
}

/// A single lightweight connectivity check
///
/// Implementations must release whatever connection they open before
/// returning, whatever the outcome.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> Result<(), ProbeError>;
}

/// Build the probe matching the endpoint's kind
pub fn probe_for(endpoint: &Endpoint, timeout: Duration) -> Result<Box<dyn Probe>, GateError> {
    let probe: Box<dyn Probe> = match endpoint.probe {
        ProbeKind::Tcp => Box::new(TcpProbe::new(timeout)),
        ProbeKind::Http { .. } => Box::new(HttpProbe::new(timeout)?),
    };
    Ok(probe)
}

/// Connects and immediately closes
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, endpoint: &Endpoint) -> Result<(), ProbeError> {
        let connect = TcpStream::connect(endpoint.authority());
        let mut stream = match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ProbeError::Connect(e.to_string())),
            Err(_) => return Err(ProbeError::Timeout(self.timeout)),
        };
        // The peer may already have hung up; that still counts as reachable
        let _ = stream.shutdown().await;
        Ok(())
    }
}

/// Issues `GET <path>` with the endpoint's credential attached
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, GateError> {
        // No idle pool: each attempt's connection is closed once it finishes
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self { client, timeout })
    }

    fn url(endpoint: &Endpoint) -> String {
        let path = match &endpoint.probe {
            ProbeKind::Http { path } if path.starts_with('/') => path.clone(),
            ProbeKind::Http { path } => format!("/{}", path),
            ProbeKind::Tcp => "/".to_string(),
        };
        format!("http://{}{}", endpoint.authority(), path)
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, endpoint: &Endpoint) -> Result<(), ProbeError> {
        let mut request = self.client.get(Self::url(endpoint));
        request = match &endpoint.credential {
            Some(Credential::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            Some(Credential::Bearer { token }) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(self.timeout)
            } else if e.is_connect() {
                ProbeError::Connect(e.to_string())
            } else {
                ProbeError::Protocol(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            Err(ProbeError::Auth(status.as_u16()))
        } else {
            Err(ProbeError::Protocol(format!("HTTP {}", status.as_u16())))
        }
    }
}
