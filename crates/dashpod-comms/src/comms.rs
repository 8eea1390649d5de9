//! Pod communications orchestrator.
//!
//! [`PodComms`] owns the link and the pod state on a single worker task.
//! Callers submit work through a FIFO channel; each unit (pairing, setup,
//! key agreement and the caller's session body) runs to completion before
//! the next one starts, so no caller ever observes a half-established key.
//!
//! ```text
//! NotPaired --pair--> PairingCompleted --assign--> AddressAssigned
//!     --setup--> PodPaired --session keys--> Ready
//!
//! assign: activation window closed  -> ActivationTimeout (terminal)
//! setup:  hardware constants differ -> PodIncompatible   (terminal)
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashpod_core::codec::{AssignAddress, SetupPod, VersionResponse};
use dashpod_core::{
    CommsConfig, Ids, MessageTransportState, PodConstants, PodState, SetupProgress,
};
use dashpod_crypto::{KeySource, OsKeySource};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::eap::SessionKeyEstablisher;
use crate::error::{PodCommsError, Result};
use crate::link::PodLink;
use crate::ltk::LtkExchanger;
use crate::session::{PodSession, SessionFuture};
use crate::state::{PodStateObserver, StateKeeper};
use crate::store::{JsonFileStore, MemoryStore, PodStateStore, StoreError};
use crate::transport::MessageTransport;

/// Queue depth used when the builder is not told otherwise.
pub const DEFAULT_QUEUE_DEPTH: usize = 32;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type Job<L> = Box<dyn FnOnce(CommsCore<L>) -> BoxFuture<CommsCore<L>> + Send>;

/// State owned by the worker. Never shared; moved through each job.
pub(crate) struct CommsCore<L: PodLink> {
    link: L,
    keeper: StateKeeper,
    ids: Ids,
    keys: Arc<dyn KeySource>,
    expected_constants: PodConstants,
    timeout: Duration,
    msg_sequence: u8,
}

impl<L: PodLink> CommsCore<L> {
    pub(crate) const fn state(&self) -> &PodState {
        self.keeper.state()
    }

    pub(crate) const fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub(crate) const fn keeper_mut(&mut self) -> &mut StateKeeper {
        &mut self.keeper
    }

    /// Drive the pod from its current progress to an encrypted session.
    ///
    /// With `allow_setup` false the pod must already be provisioned.
    async fn ensure_session(&mut self, allow_setup: bool) -> Result<MessageTransport> {
        self.check_operational()?;
        if !allow_setup && !self.state().setup_progress.is_provisioned() {
            return Err(PodCommsError::NotPaired);
        }

        if self.state().setup_progress == SetupProgress::NotPaired {
            self.pair().await?;
        }
        if self.state().setup_progress == SetupProgress::PairingCompleted {
            self.assign_address().await?;
        }
        if self.state().setup_progress == SetupProgress::AddressAssigned {
            self.setup_pod().await?;
        }
        self.establish_session().await
    }

    fn check_operational(&self) -> Result<()> {
        let state = self.state();
        if let Some(fault) = state.fault {
            return Err(PodCommsError::PodFault(fault));
        }
        if !state.setup_progress.is_terminal() {
            return Ok(());
        }
        Err(match state.setup_progress {
            SetupProgress::ActivationTimeout => PodCommsError::ActivationTimeExceeded,
            // The individual mismatches were reported when setup failed.
            _ => PodCommsError::Incompatible {
                mismatches: Vec::new(),
            },
        })
    }

    fn paired_address(&self) -> Result<u32> {
        self.state().address.ok_or(PodCommsError::NotPaired)
    }

    fn plain_transport(&self, destination: u32) -> MessageTransport {
        MessageTransport::plain(
            self.ids.controller(),
            destination,
            self.msg_sequence,
            self.timeout,
        )
    }

    /// Carry a finished plain exchange's framing sequence forward and
    /// record any fault it latched.
    fn finish_plain_exchange(&mut self, transport: &MessageTransport) -> Result<()> {
        self.msg_sequence = transport.msg_sequence();
        match transport.fault() {
            Some(fault) => self.keeper.commit(|s| s.fault = Some(fault)),
            None => Ok(()),
        }
    }

    async fn pair(&mut self) -> Result<()> {
        info!(
            controller = %format_args!("{:#010x}", self.ids.controller()),
            pod = %format_args!("{:#010x}", self.ids.pod()),
            "Pairing new pod"
        );
        let outcome = match LtkExchanger::new(self.ids, self.keys.as_ref(), self.timeout)
            .negotiate(&mut self.link)
            .await
        {
            Ok(outcome) => outcome,
            Err(PodCommsError::PodFault(fault)) => {
                self.keeper.commit(|s| s.fault = Some(fault))?;
                return Err(PodCommsError::PodFault(fault));
            }
            Err(e) => return Err(e),
        };
        self.msg_sequence = outcome.msg_sequence;
        self.keeper.commit(|s| {
            s.address = Some(outcome.address);
            s.long_term_key = Some(outcome.long_term_key.clone());
            s.eap_sequence_number = 0;
            s.transport_state = None;
            s.setup_progress = SetupProgress::PairingCompleted;
        })
    }

    async fn assign_address(&mut self) -> Result<()> {
        let address = self.paired_address()?;
        let mut transport = self.plain_transport(address);
        let result: Result<VersionResponse> = transport
            .exchange(&mut self.link, &AssignAddress { address })
            .await;
        self.finish_plain_exchange(&transport)?;
        let version = result?;

        if version.activation_time_exceeded() {
            warn!("Pod activation window has closed");
            self.keeper
                .commit(|s| s.setup_progress = SetupProgress::ActivationTimeout)?;
            return Err(PodCommsError::ActivationTimeExceeded);
        }
        if version.address != address {
            return Err(PodCommsError::AddressMismatch {
                found: version.address,
                expected: address,
            });
        }

        info!(
            firmware = %version.firmware_version,
            ble_firmware = %version.ble_firmware_version,
            lot = version.lot_number,
            serial = version.serial_number,
            "Address assigned"
        );
        self.keeper.commit(|s| {
            s.firmware_version = Some(version.firmware_version);
            s.ble_firmware_version = Some(version.ble_firmware_version);
            s.lot_number = Some(version.lot_number);
            s.serial_number = Some(version.serial_number);
            s.setup_progress = SetupProgress::AddressAssigned;
        })
    }

    async fn setup_pod(&mut self) -> Result<()> {
        let address = self.paired_address()?;
        let state = self.state();
        let (Some(lot_number), Some(serial_number)) = (state.lot_number, state.serial_number)
        else {
            return Err(PodCommsError::InvalidPersistedState(
                "address assigned without lot and serial numbers".into(),
            ));
        };
        let command = SetupPod {
            address,
            lot_number,
            serial_number,
            activation_time: unix_time_secs(),
        };

        let mut transport = self.plain_transport(address);
        let result: Result<VersionResponse> = transport.exchange(&mut self.link, &command).await;
        self.finish_plain_exchange(&transport)?;
        let version = result?;

        if version.activation_time_exceeded() {
            warn!("Pod activation window has closed");
            self.keeper
                .commit(|s| s.setup_progress = SetupProgress::ActivationTimeout)?;
            return Err(PodCommsError::ActivationTimeExceeded);
        }
        let mismatches = version.constants.mismatches(&self.expected_constants);
        if !mismatches.is_empty() {
            for m in &mismatches {
                warn!(field = m.field, expected = m.expected, found = m.found, "Pod constant mismatch");
            }
            self.keeper
                .commit(|s| s.setup_progress = SetupProgress::PodIncompatible)?;
            return Err(PodCommsError::Incompatible { mismatches });
        }

        self.keeper
            .commit(|s| s.setup_progress = SetupProgress::PodPaired)
    }

    async fn establish_session(&mut self) -> Result<MessageTransport> {
        let address = self.paired_address()?;
        let ltk = self
            .state()
            .long_term_key
            .clone()
            .ok_or(PodCommsError::NotPaired)?;
        let stored = self.state().eap_sequence_number;

        let mut transport = self.plain_transport(address);
        let keeper = &mut self.keeper;
        let result = SessionKeyEstablisher::new(&ltk, self.keys.as_ref())
            .establish(&mut self.link, &mut transport, stored, |used| {
                keeper.commit(|s| s.eap_sequence_number = used)
            })
            .await;
        self.finish_plain_exchange(&transport)?;
        let established = result?;

        let transport_state = MessageTransportState {
            cipher_key: established.keys.cipher_key,
            nonce_prefix: established.keys.nonce_prefix,
            msg_sequence: established.keys.msg_sequence,
            nonce_sequence: 0,
        };
        let next_sequence_number = established.sequence_number + 1;
        self.keeper.commit(|s| {
            s.eap_sequence_number = next_sequence_number;
            s.transport_state = Some(transport_state.clone());
            s.setup_progress = SetupProgress::Ready;
        })?;
        Ok(MessageTransport::encrypted(
            self.ids.controller(),
            address,
            &transport_state,
            self.timeout,
        ))
    }
}

fn unix_time_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| u32::try_from(d.as_secs()).ok())
        .unwrap_or(u32::MAX)
}

async fn run_worker<L: PodLink>(mut core: CommsCore<L>, mut jobs: mpsc::Receiver<Job<L>>) -> L {
    while let Some(job) = jobs.recv().await {
        core = job(core).await;
    }
    debug!("Pod worker queue closed");
    core.link
}

/// Handle to the communications core for one pod.
///
/// Cloneable handles are not provided; share it behind an `Arc` if several
/// tasks need it. Every operation is queued, so they complete in
/// submission order.
pub struct PodComms<L: PodLink> {
    jobs: mpsc::Sender<Job<L>>,
    worker: JoinHandle<L>,
}

impl<L: PodLink> PodComms<L> {
    pub fn builder(link: L) -> PodCommsBuilder<L> {
        PodCommsBuilder::new(link)
    }

    /// Pair and set up the pod as needed, establish session keys, then run
    /// `body` with the encrypted session.
    ///
    /// The whole sequence is one queue entry. Dropping the returned future
    /// does not cancel work already started on the worker.
    pub async fn run_session<T, F>(&self, body: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut PodSession<L>) -> SessionFuture<'a, T> + Send + 'static,
    {
        self.submit_session(true, body).await
    }

    /// Like [`run_session`](Self::run_session), but never pairs or sets up:
    /// a pod that is not yet provisioned fails with `NotPaired`.
    pub async fn resume_session<T, F>(&self, body: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut PodSession<L>) -> SessionFuture<'a, T> + Send + 'static,
    {
        self.submit_session(false, body).await
    }

    /// Snapshot of the pod state, ordered with queued sessions.
    pub async fn pod_state(&self) -> Result<PodState> {
        self.submit::<PodState, _>(|core| {
            Box::pin(async move {
                let state = core.state().clone();
                (core, state)
            })
        })
        .await
    }

    /// Close the queue, let queued work finish, and return the link.
    pub async fn shutdown(self) -> Result<L> {
        drop(self.jobs);
        self.worker
            .await
            .map_err(|e| PodCommsError::CommsError(format!("pod worker failed: {e}")))
    }

    async fn submit_session<T, F>(&self, allow_setup: bool, body: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut PodSession<L>) -> SessionFuture<'a, T> + Send + 'static,
    {
        self.submit::<Result<T>, _>(move |mut core| {
            Box::pin(async move {
                let ensured = core.ensure_session(allow_setup).await;
                let transport = match ensured {
                    Ok(transport) => transport,
                    Err(e) => return (core, Err(e)),
                };
                let mut session = PodSession::new(core, transport);
                let result = body(&mut session).await;
                let (mut core, transport) = session.into_parts();
                core.msg_sequence = transport.msg_sequence();
                (core, result)
            })
        })
        .await?
    }

    async fn submit<T, J>(&self, job: J) -> Result<T>
    where
        T: Send + 'static,
        J: FnOnce(CommsCore<L>) -> BoxFuture<(CommsCore<L>, T)> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job<L> = Box::new(move |core| -> BoxFuture<CommsCore<L>> {
            Box::pin(async move {
                let (core, out) = job(core).await;
                // The caller may have stopped waiting; the work still counts.
                let _ = tx.send(out);
                core
            })
        });
        self.jobs
            .send(job)
            .await
            .map_err(|_| PodCommsError::CommsError("pod worker stopped".into()))?;
        rx.await
            .map_err(|_| PodCommsError::CommsError("pod worker dropped the request".into()))
    }
}

/// Builder for [`PodComms`].
pub struct PodCommsBuilder<L: PodLink> {
    link: L,
    config: CommsConfig,
    keys: Arc<dyn KeySource>,
    store: Option<Arc<dyn PodStateStore>>,
    observer: Option<Arc<dyn PodStateObserver>>,
    queue_depth: usize,
}

impl<L: PodLink> PodCommsBuilder<L> {
    fn new(link: L) -> Self {
        Self {
            link,
            config: CommsConfig::default(),
            keys: Arc::new(OsKeySource),
            store: None,
            observer: None,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    #[must_use]
    pub fn config(mut self, config: CommsConfig) -> Self {
        self.config = config;
        self
    }

    /// Pod address candidate from the discovery layer.
    #[must_use]
    pub const fn pod_address_hint(mut self, address: u32) -> Self {
        self.config.pod_address_hint = Some(address);
        self
    }

    #[must_use]
    pub fn key_source(mut self, keys: Arc<dyn KeySource>) -> Self {
        self.keys = keys;
        self
    }

    /// Store for the pod state. Defaults to a JSON file at the configured
    /// `state_path`, or memory if none is configured.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn PodStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The single observer of pod state transitions.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn PodStateObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub const fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Load the persisted pod state and start the worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<PodComms<L>> {
        let store: Arc<dyn PodStateStore> = match (self.store, &self.config.state_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(JsonFileStore::new(path)),
            (None, None) => Arc::new(MemoryStore::new()),
        };
        let state = load_state(store.as_ref())?;
        let msg_sequence = state
            .transport_state
            .as_ref()
            .map_or(0, |t| t.msg_sequence);
        info!(
            progress = %state.setup_progress,
            sequence_number = state.eap_sequence_number,
            "Pod comms starting"
        );

        let core = CommsCore {
            link: self.link,
            keeper: StateKeeper::new(state, store, self.observer),
            ids: self.config.ids(),
            keys: self.keys,
            expected_constants: self.config.expected_constants,
            timeout: self.config.response_timeout(),
            msg_sequence,
        };
        let (jobs, rx) = mpsc::channel(self.queue_depth.max(1));
        let worker = tokio::spawn(run_worker(core, rx));
        Ok(PodComms { jobs, worker })
    }
}

fn load_state(store: &dyn PodStateStore) -> Result<PodState> {
    let state = match store.load() {
        Ok(Some(state)) => state,
        Ok(None) => return Ok(PodState::new()),
        Err(StoreError::Json(e)) => return Err(PodCommsError::InvalidPersistedState(e.to_string())),
        Err(e) => return Err(e.into()),
    };
    state.validate().map_err(|e| match e {
        dashpod_core::Error::InvalidState(msg) => PodCommsError::InvalidPersistedState(msg),
        other => PodCommsError::Codec(other),
    })?;
    Ok(state)
}
