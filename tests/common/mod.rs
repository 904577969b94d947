//! Shared test doubles for the integration tests.
//!
//! `FakeToken` is a scripted TKey. It counts every call, remembers the
//! secrets it was loaded with and flags any call that arrives while another
//! one is still running on the same device.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ed25519_dalek::{Signer, SigningKey};
use tkey_session::{
    NameVersion, PublicKey, Secret, TokenTransport, TransportError, TransportFactory,
    TransportResult, Udi,
};

pub const TEST_PORT: &str = "/dev/ttyACM0";
pub const TEST_UDI: [u8; 8] = [0x01, 0x33, 0x70, 0x22, 0x00, 0x00, 0x01, 0x2a];

/// What the fake device is currently running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Running {
    Firmware,
    Signer,
    Other(NameVersion),
    Silent,
}

/// Call counters, one per transport method.
#[derive(Debug, Default)]
pub struct Counters {
    pub opens: AtomicUsize,
    pub close_calls: AtomicUsize,
    /// Closes of a port that was actually open.
    pub closes: AtomicUsize,
    pub firmware_queries: AtomicUsize,
    pub app_queries: AtomicUsize,
    pub udi_queries: AtomicUsize,
    pub loads: AtomicUsize,
    pub public_keys: AtomicUsize,
    pub signs: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// All calls that talk to the device, excluding open and close.
    pub fn device_calls(&self) -> usize {
        [
            &self.firmware_queries,
            &self.app_queries,
            &self.udi_queries,
            &self.loads,
            &self.public_keys,
            &self.signs,
        ]
        .iter()
        .map(|c| c.load(Ordering::SeqCst))
        .sum()
    }

    pub fn identity_queries(&self) -> usize {
        Self::get(&self.firmware_queries) + Self::get(&self.app_queries)
    }
}

struct DeviceState {
    open: bool,
    running: Running,
    /// What the device runs after a successful load.
    after_load: Running,
    fail_open: bool,
    fail_load: bool,
    fail_sign: bool,
    ports: Vec<String>,
    secrets: Vec<Option<Vec<u8>>>,
}

struct Shared {
    state: Mutex<DeviceState>,
    counters: Counters,
    busy: AtomicBool,
    overlaps: AtomicUsize,
    call_delay: Mutex<Duration>,
    key: SigningKey,
}

/// Handle on a scripted token, shared by all transports made from it.
#[derive(Clone)]
pub struct FakeToken {
    shared: Arc<Shared>,
}

impl FakeToken {
    pub fn new(running: Running) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DeviceState {
                    open: false,
                    running,
                    after_load: Running::Signer,
                    fail_open: false,
                    fail_load: false,
                    fail_sign: false,
                    ports: Vec::new(),
                    secrets: Vec::new(),
                }),
                counters: Counters::default(),
                busy: AtomicBool::new(false),
                overlaps: AtomicUsize::new(0),
                call_delay: Mutex::new(Duration::ZERO),
                key: SigningKey::from_bytes(&[0x5a; 32]),
            }),
        }
    }

    /// A token with the signer app already running.
    pub fn signer() -> Self {
        Self::new(Running::Signer)
    }

    /// A freshly plugged token waiting for an app.
    pub fn firmware() -> Self {
        Self::new(Running::Firmware)
    }

    pub fn transport(&self) -> Box<dyn TokenTransport> {
        Box::new(FakeTransport {
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn factory(&self) -> TransportFactory {
        let token = self.clone();
        Box::new(move || token.transport())
    }

    pub fn counters(&self) -> &Counters {
        &self.shared.counters
    }

    pub fn opens(&self) -> usize {
        Counters::get(&self.shared.counters.opens)
    }

    pub fn closes(&self) -> usize {
        Counters::get(&self.shared.counters.closes)
    }

    pub fn overlaps(&self) -> usize {
        self.shared.overlaps.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }

    pub fn opened_ports(&self) -> Vec<String> {
        self.state().ports.clone()
    }

    pub fn loaded_secrets(&self) -> Vec<Option<Vec<u8>>> {
        self.state().secrets.clone()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::new(self.shared.key.verifying_key().to_bytes())
    }

    pub fn set_running(&self, running: Running) {
        self.state().running = running;
    }

    pub fn set_after_load(&self, running: Running) {
        self.state().after_load = running;
    }

    pub fn fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    pub fn fail_load(&self, fail: bool) {
        self.state().fail_load = fail;
    }

    pub fn fail_sign(&self, fail: bool) {
        self.state().fail_sign = fail;
    }

    /// Make every transport call, close included, take `delay`, to widen
    /// race windows.
    pub fn set_call_delay(&self, delay: Duration) {
        *self.shared.call_delay.lock().unwrap() = delay;
    }

    /// Simulate unplugging and replugging: the token restarts in firmware.
    pub fn replug(&self) {
        let mut state = self.state();
        state.open = false;
        state.running = Running::Firmware;
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.shared.state.lock().unwrap()
    }
}

struct FakeTransport {
    shared: Arc<Shared>,
}

impl FakeTransport {
    /// Run one device call, recording any overlap with another call.
    fn call<T>(
        &self,
        counter: &AtomicUsize,
        f: impl FnOnce(&mut DeviceState, &SigningKey) -> TransportResult<T>,
    ) -> TransportResult<T> {
        counter.fetch_add(1, Ordering::SeqCst);
        if self.shared.busy.swap(true, Ordering::SeqCst) {
            self.shared.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        let delay = *self.shared.call_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let result = {
            let mut state = self.shared.state.lock().unwrap();
            f(&mut *state, &self.shared.key)
        };
        self.shared.busy.store(false, Ordering::SeqCst);
        result
    }
}

fn require_open(state: &DeviceState) -> TransportResult<()> {
    if state.open {
        Ok(())
    } else {
        Err(TransportError::Io("port not open".to_string()))
    }
}

impl TokenTransport for FakeTransport {
    fn open(&mut self, port: &str, _speed: u32) -> TransportResult<()> {
        self.call(&self.shared.counters.opens, |state, _| {
            if state.fail_open {
                return Err(TransportError::Io(format!("{port}: device busy")));
            }
            state.open = true;
            state.ports.push(port.to_string());
            Ok(())
        })
    }

    fn close(&mut self) -> TransportResult<()> {
        let closes = &self.shared.counters.closes;
        self.call(&self.shared.counters.close_calls, |state, _| {
            if state.open {
                closes.fetch_add(1, Ordering::SeqCst);
                state.open = false;
            }
            Ok(())
        })
    }

    fn firmware_name_version(&mut self) -> TransportResult<NameVersion> {
        self.call(&self.shared.counters.firmware_queries, |state, _| {
            require_open(state)?;
            match state.running {
                Running::Firmware => Ok(NameVersion::new("tk1 ", "mkdf", 5)),
                _ => Err(TransportError::Eof),
            }
        })
    }

    fn app_name_version(&mut self) -> TransportResult<NameVersion> {
        self.call(&self.shared.counters.app_queries, |state, _| {
            require_open(state)?;
            match &state.running {
                Running::Signer => Ok(NameVersion::new("tk1 ", "sign", 1)),
                Running::Other(name) => Ok(name.clone()),
                Running::Firmware | Running::Silent => Err(TransportError::Eof),
            }
        })
    }

    fn udi(&mut self) -> TransportResult<Udi> {
        self.call(&self.shared.counters.udi_queries, |state, _| {
            require_open(state)?;
            match state.running {
                Running::Firmware => Ok(Udi::new(TEST_UDI)),
                _ => Err(TransportError::Protocol("UDI only available in firmware".into())),
            }
        })
    }

    fn load_app(&mut self, binary: &[u8], secret: Option<&Secret>) -> TransportResult<()> {
        self.call(&self.shared.counters.loads, |state, _| {
            require_open(state)?;
            if state.running != Running::Firmware {
                return Err(TransportError::Protocol("not in firmware mode".into()));
            }
            if binary.is_empty() || state.fail_load {
                return Err(TransportError::Protocol("load rejected".into()));
            }
            state.secrets.push(secret.map(|s| s.as_bytes().to_vec()));
            state.running = state.after_load.clone();
            Ok(())
        })
    }

    fn public_key(&mut self) -> TransportResult<Vec<u8>> {
        self.call(&self.shared.counters.public_keys, |state, key| {
            require_open(state)?;
            match state.running {
                Running::Signer => Ok(key.verifying_key().to_bytes().to_vec()),
                _ => Err(TransportError::Eof),
            }
        })
    }

    fn sign(&mut self, message: &[u8]) -> TransportResult<Vec<u8>> {
        self.call(&self.shared.counters.signs, |state, key| {
            require_open(state)?;
            if state.running != Running::Signer || state.fail_sign {
                return Err(TransportError::Eof);
            }
            Ok(key.sign(message).to_bytes().to_vec())
        })
    }
}
