//! Provisioning workflows.
//!
//! Each workflow opens a session, usually resets the device into the
//! verifier's command mode, waits for the port to go away and come back,
//! and then runs its exchanges:
//!
//! ```text
//! Idle -> Connected -> ResetIssued -> AwaitingDisconnect -> Reconnected
//!                                                               |
//!                                                          Exchanging
//!                                                               |
//!                                                   Succeeded | Failed
//! ```
//!
//! | Workflow          | Reset into            | Exchanges                                       |
//! |-------------------|-----------------------|-------------------------------------------------|
//! | install           | flash 0, command mode | get pubkey, init, chunks                        |
//! | boot              | client, command mode  | load verifier, set/get pubkey, verify, load app |
//! | erase all         | flash 0, command mode | erase areas                                     |
//! | rotate public key | flash 0, command mode | get pubkey, store pubkey, get pubkey, reset     |
//!
//! The session is closed on every exit path. Nothing is retried; after a
//! failure the whole workflow has to be started again.

use {
    crate::{
        error::{Error, Result, Step, Workflow, WorkflowError},
        port::Port,
        protocol::{
            CMD_ERASE_AREAS, CMD_GET_PUBKEY, CMD_SET_PUBKEY, CMD_STORE_PUBKEY, CatalogRevision,
            CommandCatalog, FirmwareResetType, RSP_ERASE_AREAS, RSP_GET_PUBKEY, RSP_SET_PUBKEY,
            RSP_STORE_PUBKEY, ResetDirective, TransactionId, VerifierDestination, firmware,
        },
        session::{Connector, DeviceSession, Locator},
        signature::{self, Digest, PUBLIC_KEY_LEN, PublicKey, Signature},
        upload::{BinaryChunker, check_image},
    },
    log::{debug, info},
    std::{thread, time::Duration},
};

/// Outcome of a workflow.
pub type WorkflowResult = std::result::Result<(), WorkflowError>;

const FLASH0_COMMAND_MODE: ResetDirective =
    ResetDirective::new(FirmwareResetType::StartFlash0, VerifierDestination::CommandMode);
const CLIENT_COMMAND_MODE: ResetDirective =
    ResetDirective::new(FirmwareResetType::StartClient, VerifierDestination::CommandMode);
const DEFAULT_APP1: ResetDirective =
    ResetDirective::new(FirmwareResetType::StartDefault, VerifierDestination::App1);

/// How to tell that a reset has taken effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetSync {
    /// Wait for the port to close, then rediscover and reopen it.
    ExpectClose,
    /// Sleep and keep using the same port, for transports that survive a
    /// device reset.
    FixedDelay(Duration),
}

/// Timing of the device's touch confirmation.
///
/// The device blinks and waits for a touch up to `repeat_count` times,
/// each for `presence_timeout` with `repeat_delay` between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfirmation {
    /// How long one touch window lasts.
    pub presence_timeout: Duration,
    /// Pause between touch windows.
    pub repeat_delay: Duration,
    /// Number of touch windows.
    pub repeat_count: u32,
    /// Slack for transport and processing.
    pub margin: Duration,
}

impl Default for PresenceConfirmation {
    fn default() -> Self {
        Self {
            presence_timeout: Duration::from_secs(10),
            repeat_delay: Duration::from_secs(1),
            repeat_count: 3,
            margin: Duration::from_secs(5),
        }
    }
}

impl PresenceConfirmation {
    /// Upper bound on how long a confirmed command can take to answer.
    pub fn budget(&self) -> Duration {
        (self.presence_timeout + self.repeat_delay) * self.repeat_count + self.margin
    }
}

/// Provisioning configuration.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Pause between the port closing and reopening it.
    pub settle_delay: Duration,
    /// Reset synchronization mode.
    pub reset_sync: ResetSync,
    /// How long the port may stay open after a reset.
    pub disconnect_timeout: Duration,
    /// Touch confirmation timing.
    pub confirmation: PresenceConfirmation,
    /// Timeout for ordinary responses. `None` waits indefinitely.
    pub response_timeout: Option<Duration>,
    /// How long the verifier may take to answer or reset after a verify
    /// request. A verifier that rejects may stay silent, so this is bounded.
    pub verify_timeout: Duration,
    /// Transaction id for verifier commands.
    pub app_id: TransactionId,
    /// Transaction id for firmware commands.
    pub firmware_id: TransactionId,
    /// Verifier protocol revision.
    pub catalog: CatalogRevision,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
            reset_sync: ResetSync::ExpectClose,
            disconnect_timeout: Duration::from_secs(10),
            confirmation: PresenceConfirmation::default(),
            response_timeout: None,
            verify_timeout: Duration::from_secs(5),
            app_id: TransactionId::new(1).unwrap_or_default(),
            firmware_id: TransactionId::new(2).unwrap_or_default(),
            catalog: CatalogRevision::Current,
        }
    }
}

/// Where a workflow is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    /// No workflow has run.
    Idle,
    /// Session open.
    Connected,
    /// Reset sent.
    ResetIssued,
    /// Waiting for the port to close.
    AwaitingDisconnect,
    /// Port reopened after a reset.
    Reconnected,
    /// Running command exchanges.
    Exchanging,
    /// Last workflow succeeded.
    Succeeded,
    /// Last workflow failed.
    Failed,
}

/// Things a caller may want to show the user while a workflow runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionEvent {
    /// The state changed.
    State(ProvisionState),
    /// The device now waits for touches; `budget` is how long we wait.
    ConfirmationRequired {
        /// Workflow asking.
        workflow: Workflow,
        /// How long we wait for the answer.
        budget: Duration,
    },
    /// Upload progress.
    Progress {
        /// Bytes acknowledged.
        sent: usize,
        /// Total bytes.
        total: usize,
    },
}

type StepResult<T> = std::result::Result<T, (Step, Error)>;

trait AtStep<T> {
    fn at(self, step: Step) -> StepResult<T>;
}

impl<T> AtStep<T> for Result<T> {
    fn at(self, step: Step) -> StepResult<T> {
        self.map_err(|e| (step, e))
    }
}

/// Runs provisioning workflows against one device.
pub struct Provisioner<C: Connector> {
    connector: C,
    locator: Locator,
    config: ProvisionConfig,
    catalog: CommandCatalog,
    state: ProvisionState,
    observer: Option<Box<dyn FnMut(&ProvisionEvent)>>,
}

impl<C: Connector> Provisioner<C> {
    /// Create a provisioner for the device at `locator`.
    pub fn new(connector: C, locator: Locator, config: ProvisionConfig) -> Self {
        Self {
            catalog: CommandCatalog::new(config.catalog),
            connector,
            locator,
            config,
            state: ProvisionState::Idle,
            observer: None,
        }
    }

    /// Receive [`ProvisionEvent`]s.
    #[must_use]
    pub fn with_observer(mut self, observer: impl FnMut(&ProvisionEvent) + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Current state.
    pub fn state(&self) -> ProvisionState {
        self.state
    }

    /// Configuration in use.
    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    fn emit(&mut self, event: &ProvisionEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer(event);
        }
    }

    fn set_state(&mut self, state: ProvisionState) {
        debug!("{:?} -> {state:?}", self.state);
        self.state = state;
        self.emit(&ProvisionEvent::State(state));
    }

    fn fail(&mut self, workflow: Workflow, step: Step, source: Error) -> WorkflowError {
        self.set_state(ProvisionState::Failed);
        let err = WorkflowError {
            workflow,
            step,
            source,
        };
        debug!("{err}: {}", err.source);
        err
    }

    fn run<T>(
        &mut self,
        workflow: Workflow,
        body: impl FnOnce(&mut Self, &mut DeviceSession<C::Port>) -> StepResult<T>,
    ) -> std::result::Result<T, WorkflowError> {
        info!("Starting {workflow}");
        let mut session = match DeviceSession::connect(&mut self.connector, &self.locator) {
            Ok(session) => session,
            Err(source) => return Err(self.fail(workflow, Step::Connect, source)),
        };
        session.set_transaction_id(self.config.app_id);
        self.set_state(ProvisionState::Connected);

        let result = body(self, &mut session);
        session.close();

        match result {
            Ok(value) => {
                self.set_state(ProvisionState::Succeeded);
                info!("{workflow} done");
                Ok(value)
            },
            Err((step, source)) => Err(self.fail(workflow, step, source)),
        }
    }

    fn reset_and_resync(
        &mut self,
        session: &mut DeviceSession<C::Port>,
        directive: ResetDirective,
    ) -> StepResult<()> {
        debug!("Reset into {directive:?}");
        session
            .send(self.catalog.reset(), &directive.payload())
            .at(Step::Reset)?;
        self.set_state(ProvisionState::ResetIssued);
        self.resync(session)
    }

    fn resync(&mut self, session: &mut DeviceSession<C::Port>) -> StepResult<()> {
        match self.config.reset_sync {
            ResetSync::ExpectClose => {
                self.set_state(ProvisionState::AwaitingDisconnect);
                session
                    .expect_disconnect(self.config.disconnect_timeout)
                    .at(Step::AwaitDisconnect)?;
                session
                    .reconnect(&mut self.connector, &self.locator, self.config.settle_delay)
                    .at(Step::Reconnect)?;
            },
            ResetSync::FixedDelay(delay) => thread::sleep(delay),
        }
        self.set_state(ProvisionState::Reconnected);
        Ok(())
    }

    fn await_confirmation(&mut self, workflow: Workflow) -> Duration {
        let budget = self.config.confirmation.budget();
        info!("Waiting up to {budget:?} for touch confirmation");
        self.emit(&ProvisionEvent::ConfirmationRequired { workflow, budget });
        budget
    }

    /// Install `image` into flash, signed by `signature`.
    ///
    /// The signature is checked against the public key the device holds
    /// before any app byte is sent. Succeeds only once the last chunk is
    /// acknowledged.
    pub fn install(&mut self, image: &[u8], signature: &Signature) -> WorkflowResult {
        if let Err(e) = check_image(image) {
            return Err(self.fail(Workflow::Install, Step::Prepare, e));
        }
        let chunker = BinaryChunker::new()
            .with_init_timeout(Some(self.config.confirmation.budget()))
            .with_chunk_timeout(self.config.response_timeout);

        self.run(Workflow::Install, |p, session| {
            p.reset_and_resync(session, FLASH0_COMMAND_MODE)?;
            p.set_state(ProvisionState::Exchanging);

            let key = read_public_key(session, p.config.response_timeout).at(Step::ReadPublicKey)?;
            if !signature::verify_locally(&key, image, signature) {
                return Err(Error::VerificationFailed(
                    "app signature does not verify with the installed public key".to_string(),
                ))
                .at(Step::VerifyLocally);
            }

            p.await_confirmation(Workflow::Install);
            let digest = Digest::compute(image);
            chunker
                .upload(session, image, &digest, signature, &mut |sent, total| {
                    p.emit(&ProvisionEvent::Progress { sent, total });
                })
                .at(Step::Upload)
        })
    }

    /// Load the verifier, have it check `image`, and start `image`.
    ///
    /// With `public_key` the signature is checked on the host before the
    /// device is touched and the key is handed to the verifier. Without it,
    /// the verifier's installed key is read and used for the host check.
    /// Either way the target image is only sent after the verifier accepted
    /// the signature. Flash is never written.
    pub fn boot(
        &mut self,
        image: &[u8],
        signature: &Signature,
        verifier: &[u8],
        public_key: Option<&PublicKey>,
    ) -> WorkflowResult {
        if let Err(e) = check_image(image).and_then(|()| check_image(verifier)) {
            return Err(self.fail(Workflow::Boot, Step::Prepare, e));
        }
        if let Some(key) = public_key {
            if !signature::verify_locally(key, image, signature) {
                let e = Error::VerificationFailed(
                    "app signature does not verify with the given public key".to_string(),
                );
                return Err(self.fail(Workflow::Boot, Step::VerifyLocally, e));
            }
        }

        self.run(Workflow::Boot, |p, session| {
            p.reset_and_resync(session, CLIENT_COMMAND_MODE)?;
            p.set_state(ProvisionState::Exchanging);

            let timeout = p.config.response_timeout;
            firmware::load_app(session, p.config.firmware_id, verifier, timeout)
                .at(Step::LoadVerifier)?;

            match public_key {
                Some(key) => {
                    session
                        .exchange(CMD_SET_PUBKEY, RSP_SET_PUBKEY, &key.bytes, timeout)
                        .at(Step::SetPublicKey)?;
                },
                None => {
                    let key = read_public_key(session, timeout).at(Step::ReadPublicKey)?;
                    if !signature::verify_locally(&key, image, signature) {
                        return Err(Error::VerificationFailed(
                            "app signature does not verify with the verifier's key".to_string(),
                        ))
                        .at(Step::VerifyLocally);
                    }
                },
            }

            let digest = Digest::compute(image);
            signature::verify_on_device(session, &digest, signature, Some(p.config.verify_timeout))
                .map_err(|e| match e {
                    Error::DeviceError { status, .. } => Error::DeviceRejectedSignature { status },
                    other => other,
                })
                .at(Step::VerifyOnDevice)?;

            p.resync(session)?;
            p.set_state(ProvisionState::Exchanging);
            firmware::load_app(session, p.config.firmware_id, image, timeout).at(Step::LoadApp)?;
            Ok(())
        })
    }

    /// Erase all storage areas. Fails with [`Error::Timeout`] if nobody
    /// confirms on the device within the confirmation budget.
    pub fn erase_all(&mut self) -> WorkflowResult {
        self.run(Workflow::EraseAll, |p, session| {
            p.reset_and_resync(session, FLASH0_COMMAND_MODE)?;
            p.set_state(ProvisionState::Exchanging);

            let budget = p.await_confirmation(Workflow::EraseAll);
            session
                .exchange(CMD_ERASE_AREAS, RSP_ERASE_AREAS, &[], Some(budget))
                .at(Step::Erase)?;
            Ok(())
        })
    }

    /// Replace the trusted public key with `new_key`.
    ///
    /// Fails with [`Error::NoOpRotation`] without storing anything if the
    /// device already holds `new_key`, and with
    /// [`Error::VerificationFailed`] if the read-back differs.
    pub fn rotate_public_key(&mut self, new_key: &PublicKey) -> WorkflowResult {
        self.run(Workflow::RotatePublicKey, |p, session| {
            p.reset_and_resync(session, FLASH0_COMMAND_MODE)?;
            p.set_state(ProvisionState::Exchanging);

            let timeout = p.config.response_timeout;
            let current = read_public_key(session, timeout).at(Step::ReadPublicKey)?;
            if current.same_key(new_key) {
                return Err(Error::NoOpRotation).at(Step::StorePublicKey);
            }

            let budget = p.await_confirmation(Workflow::RotatePublicKey);
            session
                .exchange(CMD_STORE_PUBKEY, RSP_STORE_PUBKEY, &new_key.bytes, Some(budget))
                .at(Step::StorePublicKey)?;

            let stored = read_public_key(session, timeout).at(Step::ReadBack)?;
            if !stored.same_key(new_key) {
                return Err(Error::VerificationFailed(
                    "public key read back from the device differs".to_string(),
                ))
                .at(Step::ReadBack);
            }

            session
                .send(
                    p.catalog.reset(),
                    &DEFAULT_APP1.payload(),
                )
                .at(Step::Reset)
        })
    }

    /// Send a raw reset directive. With `await_close`, also wait for the
    /// port to go away.
    pub fn reset(&mut self, directive: ResetDirective, await_close: bool) -> WorkflowResult {
        self.run(Workflow::Reset, |p, session| {
            session
                .send(p.catalog.reset(), &directive.payload())
                .at(Step::Reset)?;
            p.set_state(ProvisionState::ResetIssued);
            if await_close {
                p.set_state(ProvisionState::AwaitingDisconnect);
                session
                    .expect_disconnect(p.config.disconnect_timeout)
                    .at(Step::AwaitDisconnect)?;
            }
            Ok(())
        })
    }
}

/// Read the public key the verifier holds.
pub fn read_public_key<P: Port>(
    session: &mut DeviceSession<P>,
    timeout: Option<Duration>,
) -> Result<PublicKey> {
    let reply = session.exchange(CMD_GET_PUBKEY, RSP_GET_PUBKEY, &[], timeout)?;
    let mut bytes = [0u8; PUBLIC_KEY_LEN];
    bytes.copy_from_slice(
        reply
            .body()
            .get(..PUBLIC_KEY_LEN)
            .ok_or_else(|| Error::ProtocolMismatch("public key response too short".to_string()))?,
    );
    Ok(PublicKey::from_bytes(bytes))
}
