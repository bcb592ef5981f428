//! Device session: one open transport to a TKey and its lifecycle.
//!
//! A session owns at most one port handle. Resetting the device makes the
//! USB serial port vanish, so the session models that explicitly:
//!
//! ```text
//!   Disconnected --connect--> Connected --expect_disconnect--> AwaitingReset
//!        ^                        ^                                 |
//!        |                        |                           port closes
//!        |                    reconnect                             |
//!        +------------------ Reconnecting <------- Disconnected <---+
//! ```
//!
//! Ports are produced by a [`Connector`], which keeps the session testable
//! without hardware.

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::{
            Command,
            frame::{self, Frame, FrameHeader, Reply, TransactionId},
        },
    },
    log::{debug, trace, warn},
    std::{
        io::ErrorKind,
        thread,
        time::{Duration, Instant},
    },
};

#[cfg(feature = "native")]
use crate::{
    device,
    port::{NativePort, SerialConfig},
};

/// Where to find the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// A specific port path.
    Path(String),
    /// The single attached TKey, found by USB IDs.
    Auto,
}

impl Locator {
    /// `Path` if a name is given, `Auto` otherwise.
    pub fn from_option(port: Option<String>) -> Self {
        port.map_or(Self::Auto, Self::Path)
    }
}

/// Opens ports for a session.
pub trait Connector {
    /// Port type produced.
    type Port: Port;

    /// Find and open the device.
    ///
    /// Returns [`Error::DeviceNotFound`] when no device is attached and
    /// [`Error::OpenFailed`] when it is present but cannot be opened.
    fn open(&mut self, locator: &Locator) -> Result<Self::Port>;
}

/// Connector for real hardware through the `serialport` crate.
#[cfg(feature = "native")]
#[derive(Debug, Clone, Default)]
pub struct NativeConnector {
    config: SerialConfig,
}

#[cfg(feature = "native")]
impl NativeConnector {
    /// Connector using `config` for baud rate and poll timeout. The port
    /// name in `config` is ignored; it comes from the locator.
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }
}

#[cfg(feature = "native")]
impl Connector for NativeConnector {
    type Port = NativePort;

    fn open(&mut self, locator: &Locator) -> Result<NativePort> {
        let name = match locator {
            Locator::Path(path) => path.clone(),
            Locator::Auto => device::auto_detect_port()?.name,
        };

        let config = SerialConfig {
            port_name: name.clone(),
            ..self.config.clone()
        };
        NativePort::open(&config).map_err(|e| match e {
            Error::Serial(ref se)
                if matches!(
                    se.kind,
                    serialport::ErrorKind::NoDevice
                        | serialport::ErrorKind::Io(ErrorKind::NotFound)
                ) =>
            {
                Error::DeviceNotFound
            },
            other => Error::OpenFailed {
                port: name,
                reason: other.to_string(),
            },
        })
    }
}

/// Lifecycle state of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handle held.
    Disconnected,
    /// Handle open and usable.
    Connected,
    /// Waiting for the device to drop off after a reset.
    AwaitingReset,
    /// Waiting for the device to come back.
    Reconnecting,
}

/// An open transport to a TKey.
pub struct DeviceSession<P: Port> {
    port: Option<P>,
    state: SessionState,
    id: TransactionId,
}

impl<P: Port> DeviceSession<P> {
    /// Open a session through `connector`.
    pub fn connect<C>(connector: &mut C, locator: &Locator) -> Result<Self>
    where
        C: Connector<Port = P>,
    {
        let port = connector.open(locator)?;
        debug!("Connected to {}", port.name());
        Ok(Self::from_port(port))
    }

    /// Wrap an already open port.
    pub fn from_port(port: P) -> Self {
        Self {
            port: Some(port),
            state: SessionState::Connected,
            id: TransactionId::default(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Name of the open port, if any.
    pub fn port_name(&self) -> Option<&str> {
        self.port.as_ref().map(Port::name)
    }

    /// Transaction id used by [`exchange`](Self::exchange) and
    /// [`send`](Self::send).
    pub fn transaction_id(&self) -> TransactionId {
        self.id
    }

    /// Set the transaction id for subsequent frames.
    pub fn set_transaction_id(&mut self, id: TransactionId) {
        self.id = id;
    }

    fn port_mut(&mut self) -> Result<&mut P> {
        match self.state {
            SessionState::Connected => self
                .port
                .as_mut()
                .ok_or_else(|| Error::Io(ErrorKind::NotConnected.into())),
            _ => Err(Error::Io(ErrorKind::NotConnected.into())),
        }
    }

    /// Write one frame.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        trace!(
            "tx {} (id {}): {:02x?}",
            frame.command().name,
            frame.id(),
            frame.as_bytes()
        );
        self.port_mut()?.write_all_bytes(frame.as_bytes())
    }

    /// Read one response frame and decode it as `expected` with `id`.
    ///
    /// `timeout` of `None` waits indefinitely. Running out of time is
    /// [`Error::Timeout`]; the transport closing is [`Error::Io`].
    pub fn read_frame(
        &mut self,
        expected: Command,
        id: TransactionId,
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut header = [0u8; 1];
        self.read_until(&mut header, deadline, expected.name)?;
        let len = FrameHeader::parse(header[0])?.len;

        let mut raw = vec![0u8; 1 + len.size()];
        raw[0] = header[0];
        self.read_until(&mut raw[1..], deadline, expected.name)?;
        trace!("rx {} (id {id}): {raw:02x?}", expected.name);

        frame::decode(expected, id, &raw)
    }

    fn read_until(&mut self, buf: &mut [u8], deadline: Option<Instant>, what: &str) -> Result<()> {
        let port = self.port_mut()?;
        let mut filled = 0;
        while filled < buf.len() {
            match port.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(Error::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        format!("port closed while reading {what}"),
                    )));
                },
                Ok(n) => filled += n,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(Error::Timeout(format!("no response to {what}")));
                    }
                },
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Encode and send `command` without waiting for a response.
    pub fn send(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        let frame = frame::encode(command, self.id, payload)?;
        self.write_frame(&frame)
    }

    /// Send `command` and read the `response` to it.
    pub fn exchange(
        &mut self,
        command: Command,
        response: Command,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        let frame = frame::encode(command, self.id, payload)?;
        self.write_frame(&frame)?;
        self.read_frame(response, self.id, timeout)
    }

    /// Block until the device drops the transport, then release the handle.
    ///
    /// Anything the device sends meanwhile is discarded. Fails with
    /// [`Error::Timeout`] if the port is still open after `budget`.
    pub fn expect_disconnect(&mut self, budget: Duration) -> Result<()> {
        if self.port.is_none() {
            self.state = SessionState::Disconnected;
            return Ok(());
        }
        self.state = SessionState::AwaitingReset;
        let Some(port) = self.port.as_mut() else {
            return Ok(());
        };
        debug!("Waiting for {} to close", port.name());

        let deadline = Instant::now() + budget;
        let mut scratch = [0u8; 128];
        loop {
            match port.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => trace!("discarding {n} bytes while awaiting reset"),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout(format!(
                            "device did not disconnect within {budget:?}"
                        )));
                    }
                },
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => {
                    trace!("port closed: {e}");
                    break;
                },
            }
        }

        self.close();
        Ok(())
    }

    /// Wait `settle`, then find and open the device again.
    pub fn reconnect<C>(
        &mut self,
        connector: &mut C,
        locator: &Locator,
        settle: Duration,
    ) -> Result<()>
    where
        C: Connector<Port = P>,
    {
        self.close();
        self.state = SessionState::Reconnecting;
        debug!("Reconnecting in {settle:?}");
        thread::sleep(settle);

        match connector.open(locator) {
            Ok(port) => {
                debug!("Reconnected to {}", port.name());
                self.port = Some(port);
                self.state = SessionState::Connected;
                Ok(())
            },
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(e)
            },
        }
    }

    /// Release the handle. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.close() {
                warn!("Failed to close {}: {e}", port.name());
            }
        }
        self.state = SessionState::Disconnected;
    }
}

impl<P: Port> Drop for DeviceSession<P> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::protocol::{
            CMD_GET_PUBKEY, RSP_GET_PUBKEY, RSP_VERIFY,
            frame::{STATUS_OK, encode},
        },
        std::{
            collections::VecDeque,
            io::{Read, Write},
            sync::{
                Arc,
                atomic::{AtomicBool, Ordering},
            },
        },
    };

    /// Port that replays scripted reads, then reports timeouts or EOF.
    struct ScriptPort {
        rx: VecDeque<std::io::Result<Vec<u8>>>,
        tx: Vec<u8>,
        eof_when_drained: bool,
        closed: Arc<AtomicBool>,
    }

    impl ScriptPort {
        fn new(rx: Vec<std::io::Result<Vec<u8>>>, eof_when_drained: bool) -> Self {
            Self {
                rx: rx.into(),
                tx: Vec::new(),
                eof_when_drained,
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl Read for ScriptPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.rx.pop_front() {
                Some(Ok(mut chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.rx.push_front(Ok(chunk.split_off(n)));
                    }
                    Ok(n)
                },
                Some(Err(e)) => Err(e),
                None if self.eof_when_drained => Ok(0),
                None => Err(ErrorKind::TimedOut.into()),
            }
        }
    }

    impl Write for ScriptPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Port for ScriptPort {
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
            "script"
        }

        fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pubkey_reply(id: u8) -> Vec<u8> {
        let mut payload = vec![STATUS_OK];
        payload.extend_from_slice(&[9u8; 32]);
        encode(RSP_GET_PUBKEY, TransactionId::new(id).unwrap(), &payload)
            .unwrap()
            .as_bytes()
            .to_vec()
    }

    #[test]
    fn test_exchange_reads_split_frame() {
        let reply = pubkey_reply(0);
        let (head, tail) = reply.split_at(40);
        let port = ScriptPort::new(
            vec![
                Ok(head.to_vec()),
                Err(ErrorKind::TimedOut.into()),
                Ok(tail.to_vec()),
            ],
            false,
        );
        let mut session = DeviceSession::from_port(port);
        let reply = session
            .exchange(CMD_GET_PUBKEY, RSP_GET_PUBKEY, &[], Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(&reply.body()[..32], &[9u8; 32]);
    }

    #[test]
    fn test_read_frame_times_out() {
        let port = ScriptPort::new(Vec::new(), false);
        let mut session = DeviceSession::from_port(port);
        let err = session
            .read_frame(RSP_VERIFY, TransactionId::default(), Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_read_frame_reports_closed_port_as_io() {
        let port = ScriptPort::new(Vec::new(), true);
        let mut session = DeviceSession::from_port(port);
        let err = session
            .read_frame(RSP_VERIFY, TransactionId::default(), None)
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_expect_disconnect_discards_and_closes() {
        let port = ScriptPort::new(vec![Ok(vec![1, 2, 3])], true);
        let closed = Arc::clone(&port.closed);
        let mut session = DeviceSession::from_port(port);
        session.expect_disconnect(Duration::from_secs(1)).unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(closed.load(Ordering::SeqCst));
        assert!(session.port_name().is_none());
    }

    #[test]
    fn test_expect_disconnect_budget() {
        let port = ScriptPort::new(Vec::new(), false);
        let mut session = DeviceSession::from_port(port);
        let err = session.expect_disconnect(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(session.state(), SessionState::AwaitingReset);
    }

    #[test]
    fn test_io_after_close_fails() {
        let port = ScriptPort::new(Vec::new(), false);
        let mut session = DeviceSession::from_port(port);
        session.close();
        session.close();
        assert!(matches!(
            session.send(CMD_GET_PUBKEY, &[]),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_drop_closes_port() {
        let port = ScriptPort::new(Vec::new(), false);
        let closed = Arc::clone(&port.closed);
        drop(DeviceSession::from_port(port));
        assert!(closed.load(Ordering::SeqCst));
    }

    struct OneShotConnector {
        ports: Vec<ScriptPort>,
    }

    impl Connector for OneShotConnector {
        type Port = ScriptPort;

        fn open(&mut self, _locator: &Locator) -> Result<ScriptPort> {
            self.ports.pop().ok_or(Error::DeviceNotFound)
        }
    }

    #[test]
    fn test_reconnect() {
        let mut connector = OneShotConnector {
            ports: vec![ScriptPort::new(Vec::new(), false), ScriptPort::new(Vec::new(), true)],
        };
        let mut session = DeviceSession::connect(&mut connector, &Locator::Auto).unwrap();
        session.expect_disconnect(Duration::from_secs(1)).unwrap();

        session
            .reconnect(&mut connector, &Locator::Auto, Duration::ZERO)
            .unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        session.expect_disconnect(Duration::from_millis(10)).unwrap_err();
        session.close();
        let err = session
            .reconnect(&mut connector, &Locator::Auto, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound));
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
