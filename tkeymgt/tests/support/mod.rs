//! A simulated TKey for workflow tests.
//!
//! The simulator speaks the framing protocol of the verifier app and the
//! firmware's app loader. A reset bumps the port generation: ports opened
//! before the reset read EOF once their pending output is drained, exactly
//! like a USB serial device dropping off the bus.

#![allow(dead_code)]

use {
    std::{
        collections::VecDeque,
        io::{ErrorKind, Read, Write},
        sync::{Arc, Mutex, MutexGuard},
        thread,
        time::Duration,
    },
    tkeymgt::{
        Connector, Error, Locator, Port, PresenceConfirmation, ProvisionConfig, PublicKey, Result,
        ResetSync, Signature,
        protocol::{
            Command, Endpoint, FrameHeader, FrameLen, TransactionId,
            catalog::{
                RSP_ERASE_AREAS, RSP_GET_PUBKEY, RSP_LOAD_APP,
                RSP_LOAD_APP_DATA, RSP_LOAD_APP_DATA_READY, RSP_SET_PUBKEY, RSP_STORE_PUBKEY,
                RSP_UPDATE_APP_CHUNK, RSP_UPDATE_APP_INIT, RSP_VERIFY,
            },
            encode,
        },
        signature::{Digest, Seed, public_key_from_seed, sign, verify_digest},
    },
};

/// Signing seed of the key the simulated device trusts by default.
pub const VENDOR_SEED: Seed = [0x11; 32];
/// A different signing seed.
pub const OTHER_SEED: Seed = [0x22; 32];

/// What is running on the simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The verifier in command mode.
    Verifier,
    /// The firmware waiting for an app.
    Firmware,
    /// Some other app is running and ignores everything.
    App,
}

/// Shared simulator state.
#[derive(Debug)]
pub struct SimState {
    pub present: bool,
    pub mode: Mode,
    pub generation: u64,
    pub keep_port_on_reset: bool,
    pub vanish_on_reset: bool,
    pub stored_key: [u8; 32],
    pub session_key: Option<[u8; 32]>,
    pub verifier_image: Vec<u8>,
    pub confirm_touches: bool,
    pub verifier_accepts: bool,
    pub verify_replies: bool,
    pub reject_silently: bool,
    pub corrupt_store: bool,
    pub reject_chunk: Option<usize>,
    pub firmware_digest_override: Option<[u8; 32]>,

    pub events: Vec<String>,
    pub opened: usize,
    pub closed: usize,
    pub resets: Vec<[u8; 2]>,
    pub init_size: Option<u32>,
    pub chunk_payloads: Vec<Vec<u8>>,
    pub flash: Vec<u8>,
    pub loaded_apps: Vec<Vec<u8>>,

    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    outbox_generation: u64,
    upload_remaining: usize,
    load_expected: usize,
    load_buffer: Vec<u8>,
}

impl SimState {
    fn new(verifier_image: Vec<u8>) -> Self {
        Self {
            present: true,
            mode: Mode::Verifier,
            generation: 0,
            keep_port_on_reset: false,
            vanish_on_reset: false,
            stored_key: public_key_from_seed(&VENDOR_SEED).bytes,
            session_key: None,
            verifier_image,
            confirm_touches: true,
            verifier_accepts: true,
            verify_replies: true,
            reject_silently: false,
            corrupt_store: false,
            reject_chunk: None,
            firmware_digest_override: None,
            events: Vec::new(),
            opened: 0,
            closed: 0,
            resets: Vec::new(),
            init_size: None,
            chunk_payloads: Vec::new(),
            flash: Vec::new(),
            loaded_apps: Vec::new(),
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            outbox_generation: 0,
            upload_remaining: 0,
            load_expected: 0,
            load_buffer: Vec::new(),
        }
    }

    /// Position of the first event equal to `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.events.iter().position(|e| e == name)
    }

    /// All positions of events equal to `name`.
    pub fn positions(&self, name: &str) -> Vec<usize> {
        self.events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.as_str() == name)
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of events equal to `name`.
    pub fn count(&self, name: &str) -> usize {
        self.positions(name).len()
    }

    fn reply(&mut self, command: Command, id: TransactionId, payload: &[u8]) {
        if let Ok(frame) = encode(command, id, payload) {
            self.outbox.extend(frame.as_bytes());
            self.outbox_generation = self.generation;
        }
    }

    fn reset_into(&mut self, mode: Mode) {
        self.events.push("device reset".to_string());
        self.mode = mode;
        self.session_key = None;
        if self.vanish_on_reset {
            self.present = false;
        }
        if !self.keep_port_on_reset {
            self.generation += 1;
        }
    }

    fn handle(&mut self, raw: &[u8]) {
        let Ok(header) = FrameHeader::parse(raw[0]) else {
            return;
        };
        let opcode = raw[1];
        let data = &raw[2..];
        let id = header.id;

        let listening = match self.mode {
            Mode::Verifier => Some(Endpoint::App),
            Mode::Firmware => Some(Endpoint::Firmware),
            Mode::App => None,
        };
        if listening != Some(header.endpoint) {
            self.events.push(format!("ignored {opcode:#04x}"));
            return;
        }

        match (self.mode, opcode) {
            (Mode::Verifier, 0xfe) => {
                self.events.push("reset".to_string());
                self.resets.push([data[0], data[1]]);
                let mode = match data[0] {
                    5 | 6 => Mode::Firmware,
                    1 => Mode::Verifier,
                    _ => Mode::App,
                };
                self.reset_into(mode);
            },
            (Mode::Verifier, 0x05) => {
                self.events.push("get pubkey".to_string());
                let mut payload = vec![0u8];
                payload.extend_from_slice(&self.stored_key);
                self.reply(RSP_GET_PUBKEY, id, &payload);
            },
            (Mode::Verifier, 0x03) => {
                self.events.push("update app init".to_string());
                let size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                self.init_size = Some(size);
                self.upload_remaining = size as usize;
                self.flash.clear();
                if self.confirm_touches {
                    self.reply(RSP_UPDATE_APP_INIT, id, &[0]);
                }
            },
            (Mode::Verifier, 0x04) => {
                let index = self.chunk_payloads.len();
                self.events.push("update app chunk".to_string());
                self.chunk_payloads.push(data.to_vec());
                if self.reject_chunk == Some(index) {
                    self.reply(RSP_UPDATE_APP_CHUNK, id, &[1]);
                    return;
                }
                let n = self.upload_remaining.min(127);
                self.flash.extend_from_slice(&data[..n]);
                self.upload_remaining -= n;
                self.reply(RSP_UPDATE_APP_CHUNK, id, &[0]);
            },
            (Mode::Verifier, 0x06) => {
                self.events.push("store pubkey".to_string());
                if self.confirm_touches {
                    let mut key = [0u8; 32];
                    key.copy_from_slice(&data[..32]);
                    if self.corrupt_store {
                        key[0] ^= 0xff;
                    }
                    self.stored_key = key;
                    self.reply(RSP_STORE_PUBKEY, id, &[0]);
                }
            },
            (Mode::Verifier, 0x07) => {
                self.events.push("set pubkey".to_string());
                let mut key = [0u8; 32];
                key.copy_from_slice(&data[..32]);
                self.session_key = Some(key);
                self.reply(RSP_SET_PUBKEY, id, &[0]);
            },
            (Mode::Verifier, 0x08) => {
                self.events.push("erase areas".to_string());
                if self.confirm_touches {
                    self.reply(RSP_ERASE_AREAS, id, &[0]);
                }
            },
            (Mode::Verifier, 0x01) => {
                self.events.push("verify".to_string());
                let key = PublicKey::from_bytes(self.session_key.unwrap_or(self.stored_key));
                let mut digest = [0u8; 32];
                digest.copy_from_slice(&data[..32]);
                let mut sig = [0u8; 64];
                sig.copy_from_slice(&data[32..96]);
                let digest = Digest::from_bytes(digest);
                let ok = self.verifier_accepts
                    && verify_digest(&key, &digest, &Signature::from_bytes(sig));
                if ok {
                    if self.verify_replies {
                        self.reply(RSP_VERIFY, id, &[0]);
                    }
                    self.reset_into(Mode::Firmware);
                } else if self.reject_silently {
                    self.events.push("verify rejected".to_string());
                } else {
                    self.reply(RSP_VERIFY, id, &[1]);
                }
            },
            (Mode::Firmware, 0x03) => {
                self.events.push("load app".to_string());
                let size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                self.load_expected = size as usize;
                self.load_buffer.clear();
                self.reply(RSP_LOAD_APP, id, &[0]);
            },
            (Mode::Firmware, 0x05) => {
                self.events.push("load app data".to_string());
                let n = (self.load_expected - self.load_buffer.len()).min(127);
                self.load_buffer.extend_from_slice(&data[..n]);
                if self.load_buffer.len() < self.load_expected {
                    self.reply(RSP_LOAD_APP_DATA, id, &[0]);
                    return;
                }

                let app = std::mem::take(&mut self.load_buffer);
                let digest = self
                    .firmware_digest_override
                    .unwrap_or(*Digest::compute(&app).as_bytes());
                let mut payload = vec![0u8];
                payload.extend_from_slice(&digest);
                self.reply(RSP_LOAD_APP_DATA_READY, id, &payload);

                self.mode = if app == self.verifier_image {
                    Mode::Verifier
                } else {
                    Mode::App
                };
                self.events.push(if self.mode == Mode::Verifier {
                    "verifier started".to_string()
                } else {
                    "app started".to_string()
                });
                self.loaded_apps.push(app);
            },
            _ => {
                self.events.push(format!("ignored {opcode:#04x}"));
            },
        }
    }

    fn receive(&mut self, bytes: &[u8]) {
        self.inbox.extend_from_slice(bytes);
        loop {
            let Some(&first) = self.inbox.first() else {
                return;
            };
            let len = FrameLen::from_code(first).size();
            if self.inbox.len() < 1 + len {
                return;
            }
            let raw: Vec<u8> = self.inbox.drain(..=len).collect();
            self.handle(&raw);
        }
    }
}

/// Handle on a simulated device.
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    /// A device running its verifier in command mode, trusting [`VENDOR_SEED`]'s key, that
    /// recognizes `verifier_image` as its verifier.
    pub fn new(verifier_image: Vec<u8>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(verifier_image))),
        }
    }

    /// Lock the state for setup or inspection.
    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    /// Connector handing out ports to this device.
    pub fn connector(&self) -> SimConnector {
        SimConnector {
            state: Arc::clone(&self.state),
        }
    }
}

/// Connector for [`SimDevice`].
pub struct SimConnector {
    state: Arc<Mutex<SimState>>,
}

impl Connector for SimConnector {
    type Port = SimPort;

    fn open(&mut self, _locator: &Locator) -> Result<SimPort> {
        let mut state = self.state.lock().unwrap();
        if !state.present {
            return Err(Error::DeviceNotFound);
        }
        state.opened += 1;
        state.events.push("open".to_string());
        if state.outbox_generation != state.generation {
            state.outbox.clear();
        }
        Ok(SimPort {
            state: Arc::clone(&self.state),
            generation: state.generation,
            closed: false,
        })
    }
}

/// Port to a [`SimDevice`].
pub struct SimPort {
    state: Arc<Mutex<SimState>>,
    generation: u64,
    closed: bool,
}

impl Read for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(ErrorKind::NotConnected.into());
        }
        let mut state = self.state.lock().unwrap();
        if state.outbox_generation == self.generation && !state.outbox.is_empty() {
            let n = buf.len().min(state.outbox.len());
            for (slot, byte) in buf.iter_mut().zip(state.outbox.drain(..n)) {
                *slot = byte;
            }
            return Ok(n);
        }
        if state.generation != self.generation {
            return Ok(0);
        }
        drop(state);
        thread::sleep(Duration::from_millis(1));
        Err(ErrorKind::TimedOut.into())
    }
}

impl Write for SimPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(ErrorKind::NotConnected.into());
        }
        let mut state = self.state.lock().unwrap();
        if state.generation != self.generation {
            return Err(ErrorKind::BrokenPipe.into());
        }
        state.receive(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Port for SimPort {
    fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(1)
    }

    fn clear_buffers(&mut self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "sim"
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            let mut state = self.state.lock().unwrap();
            state.closed += 1;
            state.events.push("close".to_string());
        }
        Ok(())
    }
}

/// Configuration with timings small enough for tests.
pub fn fast_config() -> ProvisionConfig {
    ProvisionConfig {
        settle_delay: Duration::ZERO,
        reset_sync: ResetSync::ExpectClose,
        disconnect_timeout: Duration::from_secs(2),
        confirmation: PresenceConfirmation {
            presence_timeout: Duration::from_millis(100),
            repeat_delay: Duration::ZERO,
            repeat_count: 1,
            margin: Duration::from_millis(50),
        },
        response_timeout: Some(Duration::from_millis(500)),
        verify_timeout: Duration::from_millis(300),
        ..ProvisionConfig::default()
    }
}

/// Deterministic test image.
pub fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Signature of `image` by `seed`.
pub fn signed(seed: &Seed, image: &[u8]) -> Signature {
    sign(seed, image)
}
