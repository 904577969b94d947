//! Signature-provider facade.
//!
//! The narrow boundary the authentication layer talks to: get the public key,
//! sign a challenge. Behind it sits one cached [`SessionManager`], created
//! lazily and pinned to the port that was configured or discovered when it
//! was created. A session whose last attempt failed at the device level is
//! shut down and replaced, re-running discovery, before it is used again.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use crate::adapters::transport::{PortDiscovery, TransportFactory};
use crate::domain::constants::{DEFAULT_SERIAL_SPEED, IDLE_DISCONNECT};
use crate::domain::{AppBinary, PublicKey, SignOptions, SignedMessage};
use crate::infra::error::{SessionError, SessionResult};
use crate::services::secret_source::SecretSource;
use crate::services::session::{default_discovery, resolve_port, SessionManager};

/// Process-wide provider used by [`get_public_key`] and [`sign`].
static GLOBAL: OnceLock<SignatureProvider> = OnceLock::new();

/// Caches one session and hands out public keys and signatures.
pub struct SignatureProvider {
    new_transport: TransportFactory,
    app: AppBinary,
    port: Option<String>,
    speed: u32,
    idle_disconnect: Duration,
    discovery: Arc<dyn PortDiscovery>,
    secret_source: SecretSource,
    cached: Mutex<Cached>,
}

#[derive(Default)]
struct Cached {
    session: Option<Arc<SessionManager>>,
    shut_down: bool,
}

impl SignatureProvider {
    /// Provider that opens tokens through transports made by `new_transport`
    /// and loads `app` onto tokens found in firmware mode.
    #[must_use]
    pub fn new(new_transport: TransportFactory, app: AppBinary) -> Self {
        Self {
            new_transport,
            app,
            port: None,
            speed: DEFAULT_SERIAL_SPEED,
            idle_disconnect: IDLE_DISCONNECT,
            discovery: default_discovery(),
            secret_source: SecretSource::None,
            cached: Mutex::new(Cached::default()),
        }
    }

    /// Pin all sessions to `port`; `None` or empty auto-discovers per session.
    #[must_use]
    pub fn with_port(mut self, port: Option<String>) -> Self {
        self.port = port.filter(|p| !p.is_empty());
        self
    }

    #[must_use]
    pub fn with_speed(mut self, speed: u32) -> Self {
        self.speed = speed;
        self
    }

    #[must_use]
    pub fn with_idle_disconnect(mut self, delay: Duration) -> Self {
        self.idle_disconnect = delay;
        self
    }

    #[must_use]
    pub fn with_discovery(mut self, discovery: Arc<dyn PortDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    #[must_use]
    pub fn with_secret_source(mut self, source: SecretSource) -> Self {
        self.secret_source = source;
        self
    }

    /// Public key of the token's signer app.
    pub fn get_public_key(&self) -> SessionResult<PublicKey> {
        self.session()?.get_public_key()
    }

    /// Sign the unhashed `message`.
    pub fn sign(&self, message: &[u8]) -> SessionResult<Vec<u8>> {
        self.sign_with_options(message, SignOptions::unhashed())
    }

    pub fn sign_with_options(
        &self,
        message: &[u8],
        options: SignOptions,
    ) -> SessionResult<Vec<u8>> {
        self.session()?.sign(message, options)
    }

    /// Sign `message` and return the key that signed it.
    pub fn sign_with_key(&self, message: &[u8]) -> SessionResult<SignedMessage> {
        self.session()?.sign_with_key(message, SignOptions::unhashed())
    }

    /// Close the cached session and refuse further requests.
    pub fn shutdown(&self) {
        let mut cached = self.lock();
        cached.shut_down = true;
        if let Some(session) = &cached.session {
            session.shutdown();
        }
    }

    /// The cached session, if one has been created.
    #[must_use]
    pub fn current_session(&self) -> Option<Arc<SessionManager>> {
        self.lock().session.clone()
    }

    /// The cached session, replacing it first if it went stale.
    ///
    /// The old session is shut down before its replacement exists, so two
    /// sessions never hold the device at once.
    pub fn session(&self) -> SessionResult<Arc<SessionManager>> {
        let mut cached = self.lock();
        if cached.shut_down {
            return Err(SessionError::ShuttingDown);
        }

        if let Some(session) = &cached.session {
            if !session.is_stale() {
                return Ok(Arc::clone(session));
            }
            log::info!("Cached TKey session is stale, starting a new one");
            session.shutdown();
            cached.session = None;
        }

        let session = Arc::new(self.new_session()?);
        cached.session = Some(Arc::clone(&session));
        Ok(session)
    }

    fn new_session(&self) -> SessionResult<SessionManager> {
        let port = resolve_port(self.port.as_deref(), self.discovery.as_ref())?;
        Ok(
            SessionManager::builder((self.new_transport)(), self.app.clone())
                .port(Some(port))
                .speed(self.speed)
                .idle_disconnect(self.idle_disconnect)
                .discovery(Arc::clone(&self.discovery))
                .secret_source(self.secret_source.clone())
                .build(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, Cached> {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Install `provider` as the process-wide provider.
///
/// Fails if one is already installed; the first one stays in place.
pub fn install(provider: SignatureProvider) -> SessionResult<&'static SignatureProvider> {
    GLOBAL
        .set(provider)
        .map_err(|_| SessionError::Configuration("signature provider already installed".into()))?;
    global()
}

/// The process-wide provider.
pub fn global() -> SessionResult<&'static SignatureProvider> {
    GLOBAL
        .get()
        .ok_or_else(|| SessionError::Configuration("no signature provider installed".into()))
}

/// Public key from the process-wide provider.
pub fn get_public_key() -> SessionResult<PublicKey> {
    global()?.get_public_key()
}

/// Signature over the unhashed `message` from the process-wide provider.
pub fn sign(message: &[u8]) -> SessionResult<Vec<u8>> {
    global()?.sign(message)
}
