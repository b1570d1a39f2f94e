use crate::config::DeviceAddress;
use crate::dtu::{DtuClient, DtuConnector, TransportError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// Delay between a successful handshake and the first data request;
/// the DTU silently drops requests while it switches protocol state.
pub const SETTLE_DELAY_SECS: u64 = 5;

#[derive(Clone, PartialEq, Eq)]
pub enum EncryptionConfig {
    NoEncryption,
    AutoNegotiate,
    PresharedKey(Vec<u8>),
}

impl fmt::Debug for EncryptionConfig {
    //never print key material
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EncryptionConfig::NoEncryption => write!(f, "NoEncryption"),
            EncryptionConfig::AutoNegotiate => write!(f, "AutoNegotiate"),
            EncryptionConfig::PresharedKey(key) => write!(f, "PresharedKey({} bytes)", key.len()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Unestablished,
    Handshaking,
    Ready,
    Invalid,
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct EncryptionState {
    pub is_encrypted: bool,
    pub key: Vec<u8>,
}

impl fmt::Debug for EncryptionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "EncryptionState {{ is_encrypted: {}, key: {} bytes }}",
            self.is_encrypted,
            self.key.len()
        )
    }
}

#[derive(Debug, Error)]
pub enum EstablishError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
}

impl From<TransportError> for EstablishError {
    fn from(e: TransportError) -> Self {
        EstablishError::HandshakeFailed(e.to_string())
    }
}

/// A protocol session with the DTU. Every lifecycle transition consumes the
/// session and returns the new one; an `Invalid` session is never revived.
pub struct Session<C> {
    id: u64,
    status: SessionStatus,
    encryption: EncryptionState,
    negotiated: bool,
    client: C,
}

impl<C: DtuClient> Session<C> {
    fn new(id: u64, client: C) -> Self {
        Self {
            id,
            status: SessionStatus::Unestablished,
            encryption: EncryptionState::default(),
            negotiated: false,
            client,
        }
    }

    fn begin_handshake(self) -> Self {
        Self {
            status: SessionStatus::Handshaking,
            negotiated: true,
            ..self
        }
    }

    fn ready(mut self, encryption: EncryptionState) -> Self {
        self.client
            .set_encryption(encryption.is_encrypted, &encryption.key);
        Self {
            status: SessionStatus::Ready,
            encryption,
            ..self
        }
    }

    pub fn invalidate(self) -> Self {
        Self {
            status: SessionStatus::Invalid,
            ..self
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_ready(&self) -> bool {
        self.status == SessionStatus::Ready
    }

    #[cfg(test)]
    pub fn encryption(&self) -> &EncryptionState {
        &self.encryption
    }

    /// True when the session was set up through a handshake.
    pub fn negotiated(&self) -> bool {
        self.negotiated
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }
}

impl<C> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("encryption", &self.encryption)
            .field("negotiated", &self.negotiated)
            .finish()
    }
}

pub enum Obtained<C> {
    Reused(Session<C>),
    Established(Session<C>),
}

#[cfg(test)]
impl<C> Obtained<C> {
    pub fn into_session(self) -> Session<C> {
        match self {
            Obtained::Reused(s) | Obtained::Established(s) => s,
        }
    }
}

pub struct SessionManager<K: DtuConnector> {
    pub name: String,
    connector: K,
    address: DeviceAddress,
    encryption: EncryptionConfig,
    sessions_created: u64,
}

impl<K: DtuConnector> SessionManager<K> {
    pub fn new(name: String, connector: K, address: DeviceAddress, encryption: EncryptionConfig) -> Self {
        Self {
            name,
            connector,
            address,
            encryption,
            sessions_created: 0,
        }
    }

    pub fn sessions_created(&self) -> u64 {
        self.sessions_created
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(SETTLE_DELAY_SECS)
    }

    /// Returns `current` while it is usable, otherwise builds a new session.
    pub async fn obtain(
        &mut self,
        current: Option<Session<K::Client>>,
    ) -> Result<Obtained<K::Client>, EstablishError> {
        match current {
            Some(session) if session.status() != SessionStatus::Invalid => {
                Ok(Obtained::Reused(session))
            }
            _ => self.establish().await.map(Obtained::Established),
        }
    }

    pub async fn establish(&mut self) -> Result<Session<K::Client>, EstablishError> {
        self.sessions_created += 1;
        let session = Session::new(self.sessions_created, self.connector.connect(&self.address));

        match &self.encryption {
            EncryptionConfig::NoEncryption => {
                info!("{}: session #{}: unencrypted", self.name, session.id());
                Ok(session.ready(EncryptionState::default()))
            }
            EncryptionConfig::PresharedKey(key) => {
                info!("{}: session #{}: using preshared key", self.name, session.id());
                let key = key.clone();
                Ok(session.ready(EncryptionState {
                    is_encrypted: true,
                    key,
                }))
            }
            EncryptionConfig::AutoNegotiate => self.negotiate(session).await,
        }
    }

    async fn negotiate(
        &self,
        session: Session<K::Client>,
    ) -> Result<Session<K::Client>, EstablishError> {
        let mut session = session.begin_handshake();
        info!(
            "{}: session #{}: handshake with {}:{}...",
            self.name,
            session.id(),
            self.address.host,
            self.address.dtu_port
        );

        let limit = self.address.timeout;
        let info = match timeout(limit, session.client_mut().handshake(limit)).await {
            Ok(res) => res?,
            Err(_) => return Err(TransportError::Timeout(limit).into()),
        };
        let info = info.ok_or_else(|| {
            EstablishError::HandshakeFailed("no device info in response".into())
        })?;

        let encryption = if info.is_encrypted() {
            let key = info.enc_rand.clone().unwrap_or_default();
            if key.is_empty() {
                return Err(EstablishError::HandshakeFailed(
                    "device requires encryption but sent no key".into(),
                ));
            }
            EncryptionState {
                is_encrypted: true,
                key,
            }
        } else {
            EncryptionState::default()
        };

        info!(
            "{}: session #{}: DTU {} ready, encrypted: {}",
            self.name,
            session.id(),
            info.serial_number.as_deref().unwrap_or("<unknown>"),
            encryption.is_encrypted
        );
        Ok(session.ready(encryption))
    }

    pub fn invalidate(&self, session: Session<K::Client>) -> Session<K::Client> {
        warn!("{}: session #{}: invalidated", self.name, session.id());
        session.invalidate()
    }
}
