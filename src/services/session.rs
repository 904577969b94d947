//! Token session manager.
//!
//! Owns one transport and drives it through
//! `Disconnected -> Connecting -> (FirmwareDetected -> Loading -> VerifyingApp)
//! -> Connected -> Disconnected`. All transitions and all device calls happen
//! under a single mutex, so at most one command is in flight on the device
//! and concurrent callers queue up behind each other.
//!
//! Releasing the device is debounced: every operation ends by (re)arming an
//! idle timer instead of closing the port, and the next operation cancels
//! that timer while holding the same lock. A timer that has been superseded
//! never closes anything because it must still be the armed timer when it
//! takes the lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use crate::adapters::transport::{PortDiscovery, TokenTransport};
use crate::domain::constants::{DEFAULT_SERIAL_SPEED, IDLE_DISCONNECT, SIGNATURE_LEN};
use crate::domain::{AppBinary, PublicKey, SignOptions, SignedMessage, TokenMode};
use crate::infra::error::{SessionError, SessionResult, TransportError};
use crate::services::secret_source::SecretSource;

/// Externally visible session state.
///
/// Intermediate connect phases only exist while the session lock is held, so
/// observers only ever see one of these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
}

/// Connect phases, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    FirmwareDetected,
    Loading,
    VerifyingApp,
    Connected,
}

/// Builder for a [`SessionManager`].
pub struct SessionBuilder {
    transport: Box<dyn TokenTransport>,
    app: AppBinary,
    port: Option<String>,
    speed: u32,
    idle_disconnect: Duration,
    discovery: Option<Arc<dyn PortDiscovery>>,
    secret_source: SecretSource,
}

impl SessionBuilder {
    /// Pin the session to a serial port; `None` or empty means auto-discover.
    #[must_use]
    pub fn port(mut self, port: Option<String>) -> Self {
        self.port = port.filter(|p| !p.is_empty());
        self
    }

    #[must_use]
    pub fn speed(mut self, speed: u32) -> Self {
        self.speed = speed;
        self
    }

    #[must_use]
    pub fn idle_disconnect(mut self, delay: Duration) -> Self {
        self.idle_disconnect = delay;
        self
    }

    #[must_use]
    pub fn discovery(mut self, discovery: Arc<dyn PortDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    #[must_use]
    pub fn secret_source(mut self, source: SecretSource) -> Self {
        self.secret_source = source;
        self
    }

    #[must_use]
    pub fn build(self) -> SessionManager {
        let discovery = self.discovery.unwrap_or_else(default_discovery);
        SessionManager {
            inner: Arc::new(Inner {
                port: self.port,
                speed: self.speed,
                idle_disconnect: self.idle_disconnect,
                discovery,
                secret_source: self.secret_source,
                app: self.app,
                shutdown_requested: AtomicBool::new(false),
                state: Mutex::new(State {
                    transport: self.transport,
                    connected: false,
                    stale: false,
                    idle_timer: None,
                    next_timer_id: 0,
                }),
            }),
        }
    }
}

#[cfg(feature = "serial-discovery")]
pub(crate) fn default_discovery() -> Arc<dyn PortDiscovery> {
    Arc::new(crate::adapters::serial::SerialPortDiscovery)
}

#[cfg(not(feature = "serial-discovery"))]
pub(crate) fn default_discovery() -> Arc<dyn PortDiscovery> {
    Arc::new(crate::adapters::transport::StaticDiscovery::default())
}

/// One logical connection to a token, shared by all callers.
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    port: Option<String>,
    speed: u32,
    idle_disconnect: Duration,
    discovery: Arc<dyn PortDiscovery>,
    secret_source: SecretSource,
    app: AppBinary,
    shutdown_requested: AtomicBool,
    state: Mutex<State>,
}

struct State {
    transport: Box<dyn TokenTransport>,
    connected: bool,
    /// Last connect or device call failed in a way a new session might fix.
    stale: bool,
    idle_timer: Option<IdleTimer>,
    next_timer_id: u64,
}

/// A pending idle disconnect. Dropping it cancels the timer thread.
struct IdleTimer {
    id: u64,
    _cancel: mpsc::Sender<()>,
}

impl SessionManager {
    /// Start building a session around `transport` that loads `app` when the
    /// token is found in firmware mode.
    #[must_use]
    pub fn builder(transport: Box<dyn TokenTransport>, app: AppBinary) -> SessionBuilder {
        SessionBuilder {
            transport,
            app,
            port: None,
            speed: DEFAULT_SERIAL_SPEED,
            idle_disconnect: IDLE_DISCONNECT,
            discovery: None,
            secret_source: SecretSource::None,
        }
    }

    /// Make sure the token is open and running the signer app.
    ///
    /// Cancels any pending idle disconnect. Pair with [`Self::disconnect`].
    pub fn connect(&self) -> SessionResult<()> {
        let mut state = self.inner.lock();
        self.inner.connect_locked(&mut state)
    }

    /// Schedule the connection to close after the idle delay.
    ///
    /// Does nothing when not connected. A later [`Self::connect`] within the
    /// delay keeps the connection.
    pub fn disconnect(&self) {
        let mut state = self.inner.lock();
        if state.connected {
            self.arm_idle_timer(&mut state);
        }
    }

    /// Close the transport immediately, bypassing the idle delay.
    pub fn close_now(&self) {
        let mut state = self.inner.lock();
        Inner::close_locked(&mut state);
    }

    /// Close the transport and refuse all further work.
    ///
    /// New operations fail with [`SessionError::ShuttingDown`] as soon as this
    /// is called; the close itself waits for an in-flight device call.
    pub fn shutdown(&self) {
        self.inner.shutdown_requested.store(true, Ordering::SeqCst);
        let mut state = self.inner.lock();
        log::info!("Closing TKey connection for shutdown");
        Inner::close_locked(&mut state);
    }

    /// Public key of the signer app.
    pub fn get_public_key(&self) -> SessionResult<PublicKey> {
        self.with_device(|transport| {
            let raw = transport
                .public_key()
                .map_err(|e| SessionError::DeviceOperationFailed(format!("GetPubkey: {e}")))?;
            PublicKey::from_slice(&raw)
        })
    }

    /// Sign the unhashed `message`.
    ///
    /// Any `prehash` in `options` is rejected before the device is touched.
    pub fn sign(&self, message: &[u8], options: SignOptions) -> SessionResult<Vec<u8>> {
        check_unhashed(options)?;
        self.with_device(|transport| sign_on(transport, message))
    }

    /// Sign the unhashed `message` and fetch the public key over the same
    /// connection.
    pub fn sign_with_key(
        &self,
        message: &[u8],
        options: SignOptions,
    ) -> SessionResult<SignedMessage> {
        check_unhashed(options)?;
        self.with_device(|transport| {
            let raw = transport
                .public_key()
                .map_err(|e| SessionError::DeviceOperationFailed(format!("GetPubkey: {e}")))?;
            let public_key = PublicKey::from_slice(&raw)?;
            let signature = sign_on(transport, message)?;
            Ok(SignedMessage {
                signature,
                public_key,
            })
        })
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.inner.lock().connected {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Whether the last attempt failed in a way that calls for a new session.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.inner.lock().stale
    }

    /// Whether a shutdown has been requested.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown_requested.load(Ordering::SeqCst)
    }

    /// The pinned port, if any.
    #[must_use]
    pub fn port(&self) -> Option<&str> {
        self.inner.port.as_deref()
    }

    /// Connect, run `op` on the device, then schedule the disconnect. The
    /// lock is held throughout, so the whole sequence is one device turn.
    fn with_device<T, F>(&self, op: F) -> SessionResult<T>
    where
        F: FnOnce(&mut dyn TokenTransport) -> SessionResult<T>,
    {
        let mut state = self.inner.lock();
        self.inner.connect_locked(&mut state)?;

        match op(state.transport.as_mut()) {
            Ok(value) => {
                self.arm_idle_timer(&mut state);
                Ok(value)
            }
            Err(e) => {
                log::warn!("Device operation failed: {e}");
                Inner::close_locked(&mut state);
                if e.invalidates_session() {
                    state.stale = true;
                }
                Err(e)
            }
        }
    }

    fn arm_idle_timer(&self, state: &mut State) {
        state.next_timer_id += 1;
        let id = state.next_timer_id;
        let (cancel, cancelled) = mpsc::channel::<()>();
        let delay = self.inner.idle_disconnect;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        let spawned = thread::Builder::new()
            .name("tkey-idle-disconnect".to_string())
            .spawn(move || {
                // A dropped sender means the timer was cancelled or replaced.
                if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(delay) {
                    if let Some(inner) = weak.upgrade() {
                        inner.idle_expired(id);
                    }
                }
            });

        match spawned {
            // Replacing the previous timer drops its sender and cancels it.
            Ok(_) => state.idle_timer = Some(IdleTimer { id, _cancel: cancel }),
            Err(e) => {
                log::warn!("Could not start idle timer, disconnecting now: {e}");
                Inner::close_locked(state);
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // State is only mutated in short, non-panicking sections.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn idle_expired(&self, id: u64) {
        let mut state = self.lock();
        if state.idle_timer.as_ref().map(|t| t.id) != Some(id) {
            return;
        }
        Self::close_locked(&mut state);
        log::info!("Disconnected from TKey");
    }

    fn close_locked(state: &mut State) {
        state.idle_timer = None;
        if let Err(e) = state.transport.close() {
            log::warn!("Close failed: {e}");
        }
        state.connected = false;
    }

    fn connect_locked(&self, state: &mut State) -> SessionResult<()> {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return Err(SessionError::ShuttingDown);
        }

        state.idle_timer = None;
        if state.connected {
            return Ok(());
        }

        let result = self.establish(state);
        match &result {
            Ok(()) => {
                state.connected = true;
                state.stale = false;
                log::debug!("Session phase: {:?}", Phase::Connected);
            }
            Err(e) if e.invalidates_session() => state.stale = true,
            Err(_) => {}
        }
        result
    }

    /// Full connect sequence. On error the transport is left closed.
    fn establish(&self, state: &mut State) -> SessionResult<()> {
        log::debug!("Session phase: {:?}", Phase::Connecting);
        let port = self.resolve_port()?;

        log::info!("Connecting to TKey on serial port {port}");
        state
            .transport
            .open(&port, self.speed)
            .map_err(|e| SessionError::ConnectFailed {
                port: port.clone(),
                reason: e.to_string(),
            })?;

        let transport = state.transport.as_mut();
        let outcome = match classify(transport) {
            TokenMode::CorrectApp => Ok(()),
            TokenMode::Firmware => {
                log::info!("TKey is in firmware mode");
                log::debug!("Session phase: {:?}", Phase::FirmwareDetected);
                self.load_app(transport)
                    .and_then(|()| verify_loaded_app(transport))
            }
            TokenMode::WrongApp(found) => {
                log::warn!("TKey is running {found}, not the signer app");
                Err(SessionError::WrongApplication)
            }
            TokenMode::Unreachable => Err(SessionError::ConnectFailed {
                port,
                reason: "no answer to identity queries".to_string(),
            }),
        };

        if outcome.is_err() {
            Self::close_locked(state);
        }
        outcome
    }

    fn resolve_port(&self) -> SessionResult<String> {
        resolve_port(self.port.as_deref(), self.discovery.as_ref())
    }

    fn load_app(&self, transport: &mut dyn TokenTransport) -> SessionResult<()> {
        let secret = self.secret_source.acquire(|| {
            transport.udi().map_err(|e| {
                SessionError::SecretAcquisitionFailed(format!("failed to get UDI: {e}"))
            })
        })?;

        log::debug!("Session phase: {:?}", Phase::Loading);
        log::info!("Loading signer app {}...", self.app.name());
        transport
            .load_app(self.app.as_bytes(), secret.as_ref())
            .map_err(|e| SessionError::AppLoadFailed(e.to_string()))?;
        log::info!("Signer app loaded");
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.connected {
            Self::close_locked(state);
        }
    }
}

/// The configured port, or the single token found by `discovery`.
pub(crate) fn resolve_port(
    configured: Option<&str>,
    discovery: &dyn PortDiscovery,
) -> SessionResult<String> {
    if let Some(port) = configured {
        return Ok(port.to_string());
    }

    let mut candidates = discovery
        .candidates()
        .map_err(|e| SessionError::ConnectFailed {
            port: "<auto-detect>".to_string(),
            reason: e.to_string(),
        })?;

    match candidates.len() {
        0 => Err(SessionError::DeviceNotFound),
        1 => {
            let port = candidates.remove(0);
            log::info!("Auto-detected serial port {port}");
            Ok(port)
        }
        n => Err(SessionError::AmbiguousDevice(n)),
    }
}

/// Classify what the token is running with at most two identity queries.
fn classify(transport: &mut dyn TokenTransport) -> TokenMode {
    let firmware = match transport.firmware_name_version() {
        Ok(name) => Some(name),
        Err(e) => {
            log::debug!("Firmware identity query failed: {e}");
            None
        }
    };
    if firmware.as_ref().is_some_and(|name| name.is_firmware()) {
        return TokenMode::Firmware;
    }
    TokenMode::from_identities(firmware.as_ref(), query_app(transport).as_ref())
}

fn verify_loaded_app(transport: &mut dyn TokenTransport) -> SessionResult<()> {
    log::debug!("Session phase: {:?}", Phase::VerifyingApp);
    match TokenMode::from_identities(None, query_app(transport).as_ref()) {
        TokenMode::CorrectApp => Ok(()),
        other => {
            log::warn!("After loading, TKey reports {other:?}");
            Err(SessionError::WrongApplication)
        }
    }
}

fn query_app(transport: &mut dyn TokenTransport) -> Option<crate::domain::NameVersion> {
    match transport.app_name_version() {
        Ok(name) => Some(name),
        Err(TransportError::Eof) => None,
        Err(e) => {
            log::warn!("GetAppNameVersion: {e}");
            None
        }
    }
}

fn check_unhashed(options: SignOptions) -> SessionResult<()> {
    match options.prehash {
        None => Ok(()),
        Some(algorithm) => Err(SessionError::PreconditionViolated(format!(
            "message must not be hashed (got {})",
            algorithm.as_str()
        ))),
    }
}

fn sign_on(transport: &mut dyn TokenTransport, message: &[u8]) -> SessionResult<Vec<u8>> {
    let signature = transport
        .sign(message)
        .map_err(|e| SessionError::DeviceOperationFailed(format!("Sign: {e}")))?;
    if signature.len() != SIGNATURE_LEN {
        return Err(SessionError::DeviceOperationFailed(format!(
            "signature must be {SIGNATURE_LEN} bytes, got {}",
            signature.len()
        )));
    }
    Ok(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::transport::StaticDiscovery;
    use crate::domain::{HashAlgorithm, NameVersion, Secret, Udi};
    use crate::infra::error::TransportResult;

    /// Transport stuck in one mode that records nothing.
    struct FixedTransport {
        app: Option<NameVersion>,
    }

    impl TokenTransport for FixedTransport {
        fn open(&mut self, _port: &str, _speed: u32) -> TransportResult<()> {
            Ok(())
        }
        fn close(&mut self) -> TransportResult<()> {
            Ok(())
        }
        fn firmware_name_version(&mut self) -> TransportResult<NameVersion> {
            Err(TransportError::Eof)
        }
        fn app_name_version(&mut self) -> TransportResult<NameVersion> {
            self.app.clone().ok_or(TransportError::Eof)
        }
        fn udi(&mut self) -> TransportResult<Udi> {
            Err(TransportError::Unsupported("udi".into()))
        }
        fn load_app(&mut self, _: &[u8], _: Option<&Secret>) -> TransportResult<()> {
            Err(TransportError::Unsupported("load".into()))
        }
        fn public_key(&mut self) -> TransportResult<Vec<u8>> {
            Ok(vec![9; 32])
        }
        fn sign(&mut self, _message: &[u8]) -> TransportResult<Vec<u8>> {
            Ok(vec![1; 10])
        }
    }

    fn session(app: Option<NameVersion>) -> SessionManager {
        SessionManager::builder(
            Box::new(FixedTransport { app }),
            AppBinary::from_bytes(vec![0u8; 4]),
        )
        .port(Some("/dev/ttyACM0".to_string()))
        .build()
    }

    #[test]
    fn test_empty_port_means_auto_detect() {
        let session = SessionManager::builder(
            Box::new(FixedTransport { app: None }),
            AppBinary::from_bytes(vec![0u8; 4]),
        )
        .port(Some(String::new()))
        .discovery(Arc::new(StaticDiscovery::default()))
        .build();
        assert_eq!(session.port(), None);
        assert_eq!(session.connect(), Err(SessionError::DeviceNotFound));
    }

    #[test]
    fn test_unreachable_token_is_connect_failure() {
        let session = session(None);
        assert!(matches!(
            session.connect(),
            Err(SessionError::ConnectFailed { .. })
        ));
        assert!(session.is_stale());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_short_signature_is_rejected_and_disconnects() {
        let session = session(Some(NameVersion::new("tk1 ", "sign", 1)));
        let result = session.sign(b"msg", SignOptions::unhashed());
        assert!(matches!(result, Err(SessionError::DeviceOperationFailed(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_prehashed_sign_is_rejected() {
        let session = session(Some(NameVersion::new("tk1 ", "sign", 1)));
        let result = session.sign(b"msg", SignOptions::prehashed(HashAlgorithm::Sha512));
        assert!(matches!(result, Err(SessionError::PreconditionViolated(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_shutdown_refuses_new_work() {
        let session = session(Some(NameVersion::new("tk1 ", "sign", 1)));
        session.connect().unwrap();
        session.shutdown();
        assert!(session.is_shut_down());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.get_public_key(), Err(SessionError::ShuttingDown));
    }
}
