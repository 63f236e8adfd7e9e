//! The client context: owner and orchestrator of every runtime object.
//!
//! The context owns the channel, IO, server, beacon and sync-group
//! tables, the UDP transport, and every TCP circuit. Inbound TCP frames
//! dispatch through two fixed jump tables indexed by command code — a
//! response table and an exception table — exactly one handler per
//! code, with unknown codes routed to a handler that tears the
//! offending circuit down.
//!
//! Locking: the callback lock (in [`crate::callback`]) is strictly
//! outside the state lock held around the tables here. Paths that hold
//! the state lock and need to run user code collect deferred thunks and
//! run them after release.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::bhe::Bhe;
use crate::callback::{self, CallbackGuard, CallbackLock, CallbackMode};
use crate::channel::{Backing, Binding, Chan, Channel, Cid, PRIORITY_MAX};
use crate::circuit::Circuit;
use crate::config::{self, Config};
use crate::dbr::{self, Dbr};
use crate::error::{CaException, Error, Result};
use crate::io::{Io, Ioid, ReadCallback, SubParams, SubscriptionCallback, WriteCallback};
use crate::notify::{ChannelNotify, LogNotify, SharedContextNotify};
use crate::service::{self, ServiceRegistry};
use crate::status::{Severity, Status};
use crate::sync_group::{SyncGroup, SyncGroupInfo};
use crate::udp::{SearchReply, UdpIiu};
use crate::wire::{self, CA_ANNEX_LEN, CA_HDR_LEN, CaHdr, CaHdrAnnex, Command, Header};

/// Longest accepted PV name; a search request must fit one datagram.
const MAX_NAME_LEN: usize = 960;

/// Emit a context diagnostic with source location, in the style of
/// [`Context::signal`].
#[macro_export]
macro_rules! ca_signal {
    ($ctx:expr, $status:expr, $($arg:tt)*) => {
        $ctx.signal($status, file!(), line!(), format_args!($($arg)*))
    };
}

/// The five tables, guarded by the state lock.
pub(crate) struct State {
    pub chans: HashMap<Cid, Chan>,
    pub ios: HashMap<Ioid, Io>,
    pub servers: HashMap<(SocketAddr, u8), Arc<Circuit>>,
    pub beacons: HashMap<SocketAddr, Bhe>,
    pub sync_groups: HashMap<u32, SyncGroup>,
}

/// Callbacks collected under the state lock, run after release.
#[derive(Default)]
struct Deferred(Vec<Box<dyn FnOnce() + Send>>);

impl Deferred {
    fn push(&mut self, thunk: impl FnOnce() + Send + 'static) {
        self.0.push(Box::new(thunk));
    }

    fn run(self) {
        let _mark = callback::enter();
        for thunk in self.0 {
            thunk();
        }
    }
}

pub(crate) struct Inner {
    config: Config,
    notify: SharedContextNotify,
    cb: CallbackLock,
    state: Mutex<State>,
    udp: std::sync::OnceLock<Arc<UdpIiu>>,
    resolver: std::sync::OnceLock<crate::resolver::Resolver>,
    services: ServiceRegistry,
    next_cid: AtomicU32,
    next_ioid: AtomicU32,
    next_sgid: AtomicU32,
    sg_seq: AtomicU32,
    iiu_uninstall: Notify,
    wakeup: Notify,
    destroyed: AtomicBool,
}

/// Handle to a client context. Cheap to clone; all clones share one
/// runtime.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

/// Configures and builds a [`Context`].
#[derive(Default)]
pub struct ContextBuilder {
    mode: CallbackMode,
    notify: Option<SharedContextNotify>,
    user_name: Option<String>,
    search_addrs: Option<Vec<SocketAddr>>,
    max_array_bytes: Option<u32>,
    conn_timeout: Option<Duration>,
}

impl ContextBuilder {
    /// Preemptive (default) or cooperative callback delivery.
    pub fn callback_mode(mut self, mode: CallbackMode) -> Self {
        self.mode = mode;
        self
    }

    /// Context-level notification sink. Defaults to logging.
    pub fn notify(mut self, sink: Arc<dyn crate::notify::ContextNotify>) -> Self {
        self.notify = Some(sink);
        self
    }

    /// Override the user name announced to servers.
    pub fn user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    /// Override the search destinations from the environment.
    pub fn search_addresses(mut self, addrs: Vec<SocketAddr>) -> Self {
        self.search_addrs = Some(addrs);
        self
    }

    /// Override the inbound payload bound from the environment.
    pub fn max_array_bytes(mut self, bytes: u32) -> Self {
        self.max_array_bytes = Some(bytes);
        self
    }

    /// Override the circuit-liveness probe period from the environment.
    pub fn conn_timeout(mut self, period: Duration) -> Self {
        self.conn_timeout = Some(period);
        self
    }

    /// Read the environment, apply overrides, and build the context.
    pub fn build(self) -> Result<Context> {
        callback::process_init();

        let mut config = Config::from_env();
        if let Some(name) = self.user_name {
            config.user_name = name;
        }
        if let Some(addrs) = self.search_addrs {
            config.search_addrs = addrs;
        }
        if let Some(bytes) = self.max_array_bytes {
            config.max_recv_bytes = config::max_recv_from_array_bytes(bytes as u64);
        }
        if let Some(period) = self.conn_timeout {
            config.conn_timeout = period;
        }

        Ok(Context {
            inner: Arc::new(Inner {
                config,
                notify: self.notify.unwrap_or_else(|| Arc::new(LogNotify)),
                cb: CallbackLock::new(self.mode),
                state: Mutex::new(State {
                    chans: HashMap::new(),
                    ios: HashMap::new(),
                    servers: HashMap::new(),
                    beacons: HashMap::new(),
                    sync_groups: HashMap::new(),
                }),
                udp: std::sync::OnceLock::new(),
                resolver: std::sync::OnceLock::new(),
                services: ServiceRegistry::default(),
                next_cid: AtomicU32::new(1),
                next_ioid: AtomicU32::new(1),
                next_sgid: AtomicU32::new(1),
                sg_seq: AtomicU32::new(1),
                iiu_uninstall: Notify::new(),
                wakeup: Notify::new(),
                destroyed: AtomicBool::new(false),
            }),
        })
    }
}

// ============================================================================
// Public API
// ============================================================================

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Build a context with defaults (preemptive callbacks, environment
    /// configuration, logging sink).
    pub fn new() -> Result<Context> {
        Self::builder().build()
    }

    /// Create a channel for a PV name.
    ///
    /// Locally registered services are consulted first, then the
    /// process-wide registry; only when neither claims the name is a
    /// network channel created and handed to the search machinery.
    pub fn create_channel(
        &self,
        name: &str,
        notify: Arc<dyn ChannelNotify>,
        priority: u8,
    ) -> Result<Channel> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        if priority > PRIORITY_MAX {
            return Err(Error::BadPriority {
                priority,
                max: PRIORITY_MAX,
            });
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(Error::BadChannelName(name.into()));
        }

        if let Some(svc) = self.inner.services.create_channel(name, &notify, priority) {
            return Ok(Channel {
                ctx: self.clone(),
                name: name.into(),
                backing: Backing::Service(svc),
            });
        }
        if let Some(svc) = service::global().create_channel(name, &notify, priority) {
            return Ok(Channel {
                ctx: self.clone(),
                name: name.into(),
                backing: Backing::Service(svc),
            });
        }

        let udp = self.ensure_udp()?;
        let cid = self.inner.next_cid.fetch_add(1, Ordering::Relaxed);
        let name: Arc<str> = name.into();
        {
            let mut st = self.state();
            st.chans
                .insert(cid, Chan::new(cid, name.clone(), notify, priority));
        }
        udp.install_channel(cid, name.clone());

        Ok(Channel {
            ctx: self.clone(),
            name,
            backing: Backing::Network(cid),
        })
    }

    /// Register a PV service with this context only.
    pub fn register_service(&self, service: Arc<dyn service::PvService>) {
        self.inner.services.register(service);
    }

    /// Request a flush on every circuit.
    pub fn flush(&self) {
        let st = self.state();
        for circuit in st.servers.values() {
            circuit.flush_request();
        }
    }

    /// Number of live virtual circuits.
    pub fn connection_count(&self) -> usize {
        self.state().servers.len()
    }

    /// Number of outstanding IO objects.
    pub fn io_count(&self) -> usize {
        self.state().ios.len()
    }

    /// The user name announced to servers.
    pub fn user_name(&self) -> &str {
        &self.inner.config.user_name
    }

    /// Run the event pump for `period` (cooperative mode).
    ///
    /// Opens the callback gate for the duration, then closes it and
    /// waits out any callback still in flight before returning. In
    /// preemptive mode this merely sleeps.
    pub async fn process_events(&self, period: Duration) {
        self.inner.cb.set_gate(true);
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = self.inner.wakeup.notified() => {}
        }
        self.inner.cb.set_gate(false);
        drop(self.inner.cb.barrier().await);
    }

    /// Install a sync group; returns its id.
    pub fn sync_group_install(&self) -> u32 {
        let id = self.inner.next_sgid.fetch_add(1, Ordering::Relaxed);
        let seq = self.inner.sg_seq.fetch_add(1, Ordering::Relaxed);
        self.state().sync_groups.insert(id, SyncGroup::new(id, seq));
        id
    }

    /// Remove a sync group; false when the id was unknown.
    pub fn sync_group_uninstall(&self, id: u32) -> bool {
        self.state().sync_groups.remove(&id).is_some()
    }

    /// Look a sync group up by id.
    pub fn sync_group_lookup(&self, id: u32) -> Option<SyncGroupInfo> {
        let st = self.state();
        st.sync_groups
            .get(&id)
            .filter(|sg| sg.verify(id))
            .map(|sg| sg.info())
    }

    /// Formatted multi-line diagnostic: severity, message, context,
    /// source location and local time. A status that is neither
    /// successful nor a warning aborts the process after flushing.
    pub fn signal(&self, status: Status, file: &str, line: u32, context: std::fmt::Arguments<'_>) {
        let severity = status.severity();
        let mut text = String::new();
        let _ = writeln!(
            text,
            "CA.Client.Exception..............................................."
        );
        let _ = writeln!(text, "    {}: \"{}\"", severity.label(), status.message());
        let _ = writeln!(text, "    Context: \"{context}\"");
        let _ = writeln!(text, "    Source File: {file} line {line}");
        let _ = writeln!(text, "    Current Time: {}", local_time_string());
        eprint!("{text}");
        tracing::warn!(status = %status, file, line, "client diagnostic");

        if !status.is_success() && severity != Severity::Warning {
            std::process::abort();
        }
        eprintln!("..................................................................");
    }

    /// Verify table/list agreement; panics on an inconsistency.
    /// Debugging aid only.
    pub fn self_test(&self) {
        let st = self.state();
        for (ioid, io) in &st.ios {
            assert_eq!(*ioid, io.id, "IO table key disagrees with IO id");
            let chan = st
                .chans
                .get(&io.cid)
                .expect("IO outlived its channel");
            assert!(
                chan.ios.contains(ioid),
                "IO in table but missing from its channel's list"
            );
        }
        for (cid, chan) in &st.chans {
            assert_eq!(*cid, chan.cid, "channel table key disagrees with CID");
            for ioid in &chan.ios {
                assert!(
                    st.ios.contains_key(ioid),
                    "IO in channel list but missing from the IO table"
                );
            }
            match &chan.binding {
                Binding::Tcp(circuit) => {
                    assert!(
                        circuit
                            .chans
                            .lock()
                            .expect("circuit channels poisoned")
                            .contains(cid),
                        "channel bound to a circuit that does not list it"
                    );
                }
                Binding::Udp => {
                    if let Some(udp) = self.inner.udp.get() {
                        assert!(
                            udp.is_searching(*cid),
                            "UDP-bound channel missing from the searching set"
                        );
                    }
                }
            }
        }
        for ((addr, priority), circuit) in &st.servers {
            assert_eq!(circuit.addr(), *addr);
            assert_eq!(circuit.priority(), *priority);
        }
        for (addr, bhe) in &st.beacons {
            assert_eq!(bhe.addr(), *addr, "beacon table key disagrees with entry");
        }
    }

    /// Learned beacon period of the server currently hosting a channel,
    /// once at least two beacons were observed from it.
    pub fn beacon_period(&self, channel: &Channel) -> Option<Duration> {
        let Backing::Network(cid) = &channel.backing else {
            return None;
        };
        let st = self.state();
        let chan = st.chans.get(cid)?;
        let circuit = chan.circuit()?;
        st.beacons.get(&circuit.addr()).and_then(|bhe| bhe.period())
    }

    /// Tear the context down: the UDP transport first (never while
    /// holding the state lock), then a clean shutdown of every circuit,
    /// then wait until each has uninstalled itself.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cb.force_open();
        self.inner.wakeup.notify_waiters();

        if let Some(udp) = self.inner.udp.get() {
            udp.shutdown();
        }

        let circuits: Vec<Arc<Circuit>> = self.state().servers.values().cloned().collect();
        for circuit in &circuits {
            circuit.initiate_clean_shutdown();
        }

        let mut attempts = 0u32;
        loop {
            let notified = self.inner.iiu_uninstall.notified();
            if self.connection_count() == 0 {
                break;
            }
            if tokio::time::timeout(Duration::from_secs(2), notified)
                .await
                .is_err()
            {
                attempts += 1;
                let circuits: Vec<Arc<Circuit>> =
                    self.state().servers.values().cloned().collect();
                for circuit in &circuits {
                    circuit.initiate_abort_shutdown();
                }
                if attempts > 3 {
                    tracing::warn!("circuits failed to uninstall during context destroy");
                    break;
                }
            }
        }
    }
}

// ============================================================================
// Channel-facing request paths
// ============================================================================

impl Context {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().expect("context state poisoned")
    }

    pub(crate) fn conn_timeout(&self) -> Duration {
        self.inner.config.conn_timeout
    }

    pub(crate) fn max_recv_bytes(&self) -> u32 {
        self.inner.config.max_recv_bytes
    }

    pub(crate) fn chan_connected(&self, cid: Cid) -> bool {
        self.state().chans.get(&cid).is_some_and(|c| c.connected)
    }

    pub(crate) fn chan_access_rights(&self, cid: Cid) -> crate::notify::AccessRights {
        self.state()
            .chans
            .get(&cid)
            .map(|c| c.rights)
            .unwrap_or_default()
    }

    /// Native (type, count) a connected channel's server reported.
    pub(crate) fn chan_native(&self, cid: Cid) -> Option<(u16, u32)> {
        let st = self.state();
        let chan = st.chans.get(&cid)?;
        chan.connected.then_some((chan.data_type, chan.native_count))
    }

    pub(crate) fn chan_host_name(&self, cid: Cid) -> String {
        self.state()
            .chans
            .get(&cid)
            .and_then(|c| c.circuit().map(|circuit| circuit.host_name()))
            .unwrap_or_else(|| "<disconnected>".into())
    }

    /// Create the UDP transport exactly once per context, with
    /// double-checked construction under the state lock.
    fn ensure_udp(&self) -> Result<Arc<UdpIiu>> {
        if let Some(udp) = self.inner.udp.get() {
            return Ok(udp.clone());
        }
        let created = {
            let _guard = self.state();
            if self.inner.udp.get().is_some() {
                None
            } else {
                let udp = UdpIiu::new(&self.inner.config)?;
                self.inner
                    .udp
                    .set(udp.clone())
                    .unwrap_or_else(|_| unreachable!("udp created twice"));
                Some(udp)
            }
        };
        match created {
            Some(udp) => {
                udp.clone().start(self.clone());
                Ok(udp)
            }
            None => Ok(self.inner.udp.get().expect("udp vanished").clone()),
        }
    }

    /// The shared flush policy: above the block threshold request a
    /// flush and (off callback threads) return the circuit to wait on;
    /// above the early threshold just request the flush.
    fn flush_if_required(&self, circuit: &Arc<Circuit>) -> Option<Arc<Circuit>> {
        if circuit.above_block_threshold() {
            circuit.flush_request();
            if !callback::is_callback_thread() {
                return Some(circuit.clone());
            }
        } else if circuit.above_early_threshold() {
            circuit.flush_request();
        }
        None
    }

    pub(crate) async fn write_request(&self, cid: Cid, value: &Dbr) -> Result<()> {
        let waiter = {
            let st = self.state();
            let chan = st
                .chans
                .get(&cid)
                .ok_or_else(|| Error::ca(Status::BADCHID, format!("channel {cid}")))?;
            if !chan.connected {
                return Err(Error::ca(Status::DISCONNCHID, chan.name.to_string()));
            }
            let circuit = chan.circuit().expect("connected without circuit").clone();
            circuit.write_request(chan.sid, cid, value);
            self.flush_if_required(&circuit)
        };
        if let Some(circuit) = waiter {
            circuit.backlog_reasonable().await;
        }
        Ok(())
    }

    pub(crate) async fn write_notify_request(
        &self,
        cid: Cid,
        value: &Dbr,
        done: WriteCallback,
    ) -> Result<Ioid> {
        let ioid = Ioid(self.inner.next_ioid.fetch_add(1, Ordering::Relaxed));
        let waiter = {
            let mut st = self.state();
            let State { chans, ios, .. } = &mut *st;
            let chan = chans
                .get_mut(&cid)
                .ok_or_else(|| Error::ca(Status::BADCHID, format!("channel {cid}")))?;
            if !chan.connected {
                return Err(Error::ca(Status::DISCONNCHID, chan.name.to_string()));
            }
            let circuit = chan.circuit().expect("connected without circuit").clone();
            ios.insert(ioid, Io::new_write_notify(ioid, cid, done));
            chan.ios.insert(ioid);
            circuit.write_notify_request(chan.sid, ioid, value);
            self.flush_if_required(&circuit)
        };
        if let Some(circuit) = waiter {
            circuit.backlog_reasonable().await;
        }
        Ok(ioid)
    }

    pub(crate) async fn read_notify_request(
        &self,
        cid: Cid,
        data_type: u16,
        count: u32,
        done: ReadCallback,
    ) -> Result<Ioid> {
        let ioid = Ioid(self.inner.next_ioid.fetch_add(1, Ordering::Relaxed));
        let waiter = {
            let mut st = self.state();
            let State { chans, ios, .. } = &mut *st;
            let chan = chans
                .get_mut(&cid)
                .ok_or_else(|| Error::ca(Status::BADCHID, format!("channel {cid}")))?;
            if !chan.connected {
                return Err(Error::ca(Status::DISCONNCHID, chan.name.to_string()));
            }
            let circuit = chan.circuit().expect("connected without circuit").clone();
            ios.insert(ioid, Io::new_read_notify(ioid, cid, done));
            chan.ios.insert(ioid);
            circuit.read_notify_request(chan.sid, ioid, data_type, count);
            self.flush_if_required(&circuit)
        };
        if let Some(circuit) = waiter {
            circuit.backlog_reasonable().await;
        }
        Ok(ioid)
    }

    /// Install a subscription. Issued to the server immediately when the
    /// channel is connected, and re-issued on every reconnect otherwise.
    pub(crate) async fn subscription_request(
        &self,
        cid: Cid,
        params: SubParams,
        update: SubscriptionCallback,
    ) -> Result<Ioid> {
        let ioid = Ioid(self.inner.next_ioid.fetch_add(1, Ordering::Relaxed));
        let waiter = {
            let mut st = self.state();
            let State { chans, ios, .. } = &mut *st;
            let chan = chans
                .get_mut(&cid)
                .ok_or_else(|| Error::ca(Status::BADCHID, format!("channel {cid}")))?;
            ios.insert(ioid, Io::new_subscription(ioid, cid, params, update));
            chan.ios.insert(ioid);
            if chan.connected {
                let circuit = chan.circuit().expect("connected without circuit").clone();
                circuit.subscription_request(chan.sid, ioid, &params);
                self.flush_if_required(&circuit)
            } else {
                None
            }
        };
        if let Some(circuit) = waiter {
            circuit.backlog_reasonable().await;
        }
        Ok(ioid)
    }

    /// Cancel an IO.
    ///
    /// Removes it from both tables under the state lock (so no receive
    /// path can find it), then takes the callback lock as a barrier so
    /// any in-flight callback has returned, then destroys the IO.
    /// Idempotent: unknown ids are a no-op.
    pub(crate) async fn io_cancel(&self, ioid: Ioid) -> Result<()> {
        let io = {
            let mut st = self.state();
            let State { chans, ios, .. } = &mut *st;
            let Some(io) = ios.remove(&ioid) else {
                return Ok(());
            };
            if let Some(chan) = chans.get_mut(&io.cid) {
                chan.ios.remove(&ioid);
                if let (Some(params), true) = (&io.sub, chan.connected) {
                    let circuit = chan.circuit().expect("connected without circuit");
                    circuit.subscription_cancel_request(chan.sid, ioid, params);
                    circuit.flush_request();
                }
            }
            io
        };
        drop(self.inner.cb.barrier().await);
        drop(io);
        Ok(())
    }

    /// Destroy a channel in four phases (side-effect sends without the
    /// callback lock, then the barrier, then IO destruction, then IIU
    /// uninstall) so that neither a deadlock nor a use-after-callback is
    /// possible.
    pub(crate) async fn destroy_channel(&self, cid: Cid) {
        let (chan, drained) = {
            let mut st = self.state();
            let State { chans, ios, .. } = &mut *st;
            let Some(mut chan) = chans.remove(&cid) else {
                return;
            };
            if let Some(circuit) = chan.circuit() {
                circuit.flush_request();
            }
            let mut drained = Vec::new();
            for ioid in std::mem::take(&mut chan.ios) {
                let Some(io) = ios.remove(&ioid) else {
                    tracing::warn!(%ioid, "unregistered IO found when uninstalling channel");
                    continue;
                };
                if let (Some(params), true) = (&io.sub, chan.connected) {
                    chan.circuit()
                        .expect("connected without circuit")
                        .subscription_cancel_request(chan.sid, ioid, params);
                }
                drained.push(io);
            }
            if chan.connected {
                chan.circuit()
                    .expect("connected without circuit")
                    .clear_channel_request(chan.sid, cid);
            }
            (chan, drained)
        };

        // no callback for this channel may be in flight past this point
        let barrier = self.inner.cb.barrier().await;

        {
            let _mark = callback::enter();
            for io in drained {
                io.fail(CaException::new(Status::CHANDESTROY, chan.name.to_string()));
            }
        }

        {
            let _st = self.state();
            match &chan.binding {
                Binding::Tcp(circuit) => {
                    circuit
                        .chans
                        .lock()
                        .expect("circuit channels poisoned")
                        .remove(&cid);
                }
                Binding::Udp => {
                    if let Some(udp) = self.inner.udp.get() {
                        udp.uninstall_channel(cid);
                    }
                }
            }
        }
        drop(barrier);
    }
}

// ============================================================================
// Inbound paths: search replies, beacons, TCP dispatch, circuit loss
// ============================================================================

impl Context {
    /// Deliver a search reply (UDP receive task).
    pub(crate) async fn search_response(&self, reply: SearchReply) {
        let cb = self.inner.cb.dispatch_guard().await;
        let _mark = callback::enter();
        self.lookup_channel_and_transfer(&cb, reply);
    }

    /// Move a channel from the UDP transport onto the circuit a search
    /// reply named, creating circuit and beacon entry as needed.
    fn lookup_channel_and_transfer(&self, _cb: &CallbackGuard<'_>, reply: SearchReply) {
        let mut deferred = Deferred::default();
        let mut started: Option<Arc<Circuit>> = None;
        {
            let mut st = self.state();
            let State {
                chans,
                ios,
                servers,
                beacons,
                ..
            } = &mut *st;

            // the channel may have been destroyed while the reply was
            // in flight
            let Some(chan) = chans.get_mut(&reply.cid) else {
                return;
            };

            if let Binding::Tcp(existing) = &chan.binding {
                if existing.addr() != reply.addr {
                    let name = chan.name.clone();
                    let current = existing.host_name();
                    let notify = self.inner.notify.clone();
                    self.inner.resolver().lookup(reply.addr, move |other| {
                        notify.exception(
                            Status::DBLCHNL,
                            &format!(
                                "Channel: \"{name}\", Connecting to: {current}, Ignored: {other}"
                            ),
                        );
                    });
                }
                return;
            }

            let key = (reply.addr, chan.priority);
            let circuit = match servers.get(&key) {
                Some(circuit) => {
                    if !circuit.alive() {
                        return;
                    }
                    circuit.clone()
                }
                None => {
                    let circuit = Circuit::new(
                        reply.addr,
                        chan.priority,
                        reply.minor,
                        &self.inner.config.user_name,
                        &self.inner.config.host_name,
                    );
                    let bhe = beacons
                        .entry(reply.addr)
                        .or_insert_with(|| Bhe::new_unseen(reply.addr));
                    bhe.register_iiu(key);
                    servers.insert(key, circuit.clone());
                    let resolved = circuit.clone();
                    self.inner
                        .resolver()
                        .lookup(reply.addr, move |name| resolved.set_host_name(name));
                    started = Some(circuit.clone());
                    circuit
                }
            };

            if let Some(udp) = self.inner.udp.get() {
                udp.uninstall_channel(reply.cid);
            }
            circuit
                .chans
                .lock()
                .expect("circuit channels poisoned")
                .insert(reply.cid);
            chan.binding = Binding::Tcp(circuit.clone());
            chan.sid = reply.sid;
            chan.data_type = reply.data_type;
            chan.native_count = reply.count;
            circuit.claim_request(reply.cid, &chan.name);

            if !circuit.v42_ok() {
                // the peer will never acknowledge the claim: connect
                // under the state lock and resubscribe immediately
                chan.connect(reply.data_type, reply.count, reply.sid, circuit.v41_ok());
                Inner::resubscribe_all(ios, &circuit, chan.sid, &chan.ios);
                let notify = chan.notify.clone();
                let rights = chan.rights;
                let v41 = circuit.v41_ok();
                deferred.push(move || {
                    notify.connect();
                    if !v41 {
                        notify.access_rights(rights);
                    }
                });
            }
        }
        deferred.run();
        if let Some(circuit) = started {
            circuit.start(self.clone());
        }
    }

    /// Record a beacon; a period anomaly or restart evidence resets the
    /// search backoff so unresolved channels re-search promptly.
    pub(crate) fn beacon_notify(&self, addr: SocketAddr, number: u32, protocol_revision: u16) {
        if self.inner.udp.get().is_none() {
            return;
        }
        let anomaly = {
            let mut st = self.state();
            match st.beacons.get_mut(&addr) {
                Some(bhe) => bhe.update_period(Instant::now(), number, protocol_revision),
                None => {
                    // first beacon from this server: seed only, a single
                    // sample carries no period information
                    st.beacons.insert(addr, Bhe::new(Instant::now(), number, addr));
                    false
                }
            }
        };
        if anomaly
            && let Some(udp) = self.inner.udp.get()
        {
            udp.beacon_anomaly();
        }
    }

    /// A cooperative event pump should wake up.
    pub(crate) fn wakeup_event(&self) {
        self.inner.wakeup.notify_waiters();
    }

    /// Dispatch one inbound TCP frame under the callback lock. A false
    /// return aborts the frame stream (the circuit is torn down).
    pub(crate) async fn dispatch_response(
        &self,
        iiu: &Arc<Circuit>,
        hdr: &Header,
        body: &[u8],
    ) -> bool {
        let cb = self.inner.cb.dispatch_guard().await;
        let _mark = callback::enter();
        self.inner.execute_response(&cb, iiu, hdr, body)
    }

    /// An inbound frame exceeded the configured maximum.
    pub(crate) fn oversized_frame(&self, circuit: &Arc<Circuit>, hdr: &Header) {
        ca_signal!(
            self,
            Status::TOLARGE,
            "response 0x{:x} from {} exceeds the configured maximum ({} > {} bytes)",
            hdr.command,
            circuit.host_name(),
            hdr.payload_size,
            self.inner.config.max_recv_bytes
        );
    }

    /// A circuit left the connected state: deliver disconnects, move its
    /// channels back to the UDP transport, and uninstall it.
    pub(crate) async fn circuit_down(&self, circuit: &Arc<Circuit>) {
        if !circuit.enter_disconnected() {
            return;
        }

        // generate wake-up traffic so a cooperative pump releases the
        // callback lock instead of deadlocking the teardown
        self.inner.wakeup.notify_waiters();
        if let Some(udp) = self.inner.udp.get() {
            udp.wakeup_msg();
        }

        let cb = self.inner.cb.dispatch_guard().await;
        let mut deferred = Deferred::default();
        {
            let mut st = self.state();
            let cids = circuit.take_channels();
            if !cids.is_empty() {
                let host = circuit.host_name();
                let notify = self.inner.notify.clone();
                deferred.push(move || {
                    notify.exception(
                        Status::DISCONN,
                        &format!("Virtual circuit disconnect, host={host}"),
                    );
                });
            }
            for cid in cids {
                self.inner
                    .disconnect_channel_locked(&mut st, cid, &mut deferred);
            }
            st.servers.remove(&circuit.key());
            if let Some(bhe) = st.beacons.get_mut(&circuit.addr()) {
                bhe.unregister_iiu(circuit.key());
            }
        }
        deferred.run();
        drop(cb);

        self.inner.iiu_uninstall.notify_waiters();
        tracing::debug!(addr = %circuit.addr(), "circuit uninstalled");
    }
}

// ============================================================================
// Dispatch tables and handlers
// ============================================================================

type ProtoHandler = fn(&Inner, &CallbackGuard<'_>, &Arc<Circuit>, &Header, &[u8]) -> bool;
type ExcepHandler = fn(&Inner, &CallbackGuard<'_>, &Arc<Circuit>, &Header, &str, Status) -> bool;

/// TCP response dispatch table, indexed by command code.
const TCP_JUMP_TABLE: [ProtoHandler; Command::LIMIT as usize] = [
    Inner::version_action,            // 0  VERSION
    Inner::event_resp_action,         // 1  EVENT_ADD
    Inner::bad_tcp_resp_action,       // 2  EVENT_CANCEL
    Inner::read_resp_action,          // 3  READ
    Inner::bad_tcp_resp_action,       // 4  WRITE
    Inner::bad_tcp_resp_action,       // 5  SNAPSHOT
    Inner::bad_tcp_resp_action,       // 6  SEARCH
    Inner::bad_tcp_resp_action,       // 7  BUILD
    Inner::bad_tcp_resp_action,       // 8  EVENTS_OFF
    Inner::bad_tcp_resp_action,       // 9  EVENTS_ON
    Inner::bad_tcp_resp_action,       // 10 READ_SYNC
    Inner::exception_resp_action,     // 11 ERROR
    Inner::clear_channel_resp_action, // 12 CLEAR_CHANNEL
    Inner::bad_tcp_resp_action,       // 13 RSRV_IS_UP
    Inner::bad_tcp_resp_action,       // 14 NOT_FOUND
    Inner::read_notify_resp_action,   // 15 READ_NOTIFY
    Inner::bad_tcp_resp_action,       // 16 READ_BUILD
    Inner::bad_tcp_resp_action,       // 17 REPEATER_CONFIRM
    Inner::claim_ciu_resp_action,     // 18 CLAIM_CIU
    Inner::write_notify_resp_action,  // 19 WRITE_NOTIFY
    Inner::bad_tcp_resp_action,       // 20 CLIENT_NAME
    Inner::bad_tcp_resp_action,       // 21 HOST_NAME
    Inner::access_rights_resp_action, // 22 ACCESS_RIGHTS
    Inner::echo_resp_action,          // 23 ECHO
    Inner::bad_tcp_resp_action,       // 24 REPEATER_REGISTER
    Inner::bad_tcp_resp_action,       // 25 SIGNAL
    Inner::verify_and_disconnect_chan, // 26 CLAIM_CIU_FAILED
    Inner::verify_and_disconnect_chan, // 27 SERVER_DISCONN
];

/// TCP exception dispatch table, indexed by the command code of the
/// embedded failed request.
const TCP_EXCEP_JUMP_TABLE: [ExcepHandler; Command::LIMIT as usize] = [
    Inner::default_excep,      // 0  VERSION
    Inner::event_add_excep,    // 1  EVENT_ADD
    Inner::default_excep,      // 2  EVENT_CANCEL
    Inner::read_excep,         // 3  READ
    Inner::write_excep,        // 4  WRITE
    Inner::default_excep,      // 5  SNAPSHOT
    Inner::default_excep,      // 6  SEARCH
    Inner::default_excep,      // 7  BUILD
    Inner::default_excep,      // 8  EVENTS_OFF
    Inner::default_excep,      // 9  EVENTS_ON
    Inner::default_excep,      // 10 READ_SYNC
    Inner::default_excep,      // 11 ERROR
    Inner::default_excep,      // 12 CLEAR_CHANNEL
    Inner::default_excep,      // 13 RSRV_IS_UP
    Inner::default_excep,      // 14 NOT_FOUND
    Inner::read_notify_excep,  // 15 READ_NOTIFY
    Inner::default_excep,      // 16 READ_BUILD
    Inner::default_excep,      // 17 REPEATER_CONFIRM
    Inner::default_excep,      // 18 CLAIM_CIU
    Inner::write_notify_excep, // 19 WRITE_NOTIFY
    Inner::default_excep,      // 20 CLIENT_NAME
    Inner::default_excep,      // 21 HOST_NAME
    Inner::default_excep,      // 22 ACCESS_RIGHTS
    Inner::default_excep,      // 23 ECHO
    Inner::default_excep,      // 24 REPEATER_REGISTER
    Inner::default_excep,      // 25 SIGNAL
    Inner::default_excep,      // 26 CLAIM_CIU_FAILED
    Inner::default_excep,      // 27 SERVER_DISCONN
];

impl Inner {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("context state poisoned")
    }

    fn resolver(&self) -> &crate::resolver::Resolver {
        self.resolver.get_or_init(crate::resolver::Resolver::new)
    }

    fn execute_response(
        &self,
        cb: &CallbackGuard<'_>,
        iiu: &Arc<Circuit>,
        hdr: &Header,
        body: &[u8],
    ) -> bool {
        let stub = if hdr.command >= Command::LIMIT {
            Inner::bad_tcp_resp_action
        } else {
            TCP_JUMP_TABLE[hdr.command as usize]
        };
        stub(self, cb, iiu, hdr, body)
    }

    // ------------------------------------------------------------------
    // IO delivery helpers
    // ------------------------------------------------------------------

    /// Deliver a sample to a durable IO without destroying it.
    fn io_completion_notify(&self, _cb: &CallbackGuard<'_>, ioid: Ioid, value: Dbr) {
        let callback = {
            let st = self.state();
            st.ios
                .get(&ioid)
                .and_then(|io| io.subscription_callback())
        };
        if let Some(callback) = callback {
            let mut update = callback.lock().expect("subscription callback poisoned");
            update(Ok(value));
        }
    }

    /// Deliver an exception without destroying a durable IO; a one-shot
    /// IO is removed and consumed.
    fn io_exception_notify(&self, _cb: &CallbackGuard<'_>, ioid: Ioid, exception: CaException) {
        enum Target {
            Durable(crate::io::SharedSubscriptionCallback),
            OneShot(Io),
        }
        let target = {
            let mut st = self.state();
            let State { chans, ios, .. } = &mut *st;
            match ios.get(&ioid) {
                Some(io) if io.is_subscription() => {
                    io.subscription_callback().map(Target::Durable)
                }
                Some(_) => {
                    let io = ios.remove(&ioid).expect("io table out of sync");
                    if let Some(chan) = chans.get_mut(&io.cid) {
                        chan.ios.remove(&ioid);
                    }
                    Some(Target::OneShot(io))
                }
                None => None,
            }
        };
        match target {
            Some(Target::Durable(callback)) => {
                let mut update = callback.lock().expect("subscription callback poisoned");
                update(Err(exception));
            }
            Some(Target::OneShot(io)) => io.fail(exception),
            None => {}
        }
    }

    /// Remove a one-shot IO from both tables; deliver after release.
    fn remove_io(&self, ioid: Ioid) -> Option<Io> {
        let mut st = self.state();
        let State { chans, ios, .. } = &mut *st;
        let io = ios.remove(&ioid)?;
        if let Some(chan) = chans.get_mut(&io.cid) {
            chan.ios.remove(&ioid);
        }
        Some(io)
    }

    fn io_read_completion_and_destroy(&self, _cb: &CallbackGuard<'_>, ioid: Ioid, value: Dbr) {
        if let Some(io) = self.remove_io(ioid) {
            io.complete_read(value);
        }
    }

    fn io_write_completion_and_destroy(&self, _cb: &CallbackGuard<'_>, ioid: Ioid) {
        if let Some(io) = self.remove_io(ioid) {
            io.complete_write();
        }
    }

    fn io_exception_and_destroy(&self, _cb: &CallbackGuard<'_>, ioid: Ioid, exception: CaException) {
        if let Some(io) = self.remove_io(ioid) {
            io.fail(exception);
        }
    }

    /// Re-issue every subscription of a freshly (re)connected channel.
    fn resubscribe_all(
        ios: &HashMap<Ioid, Io>,
        circuit: &Arc<Circuit>,
        sid: u32,
        ioids: &BTreeSet<Ioid>,
    ) {
        for ioid in ioids {
            let Some(io) = ios.get(ioid) else { continue };
            match &io.sub {
                Some(params) => circuit.subscription_request(sid, *ioid, params),
                // disconnected channels carry only subscription IO
                None => tracing::debug!(id = %ioid, "non-subscription IO survived disconnect"),
            }
        }
    }

    /// Disconnect one channel under the state lock: cancel one-shot IO
    /// with `DISCONN`, keep subscriptions for re-issue, rebind to the
    /// UDP transport, and defer the user notifications.
    fn disconnect_channel_locked(&self, st: &mut State, cid: Cid, deferred: &mut Deferred) {
        let udp = self.udp.get().cloned();
        let State { chans, ios, .. } = &mut *st;
        let Some(chan) = chans.get_mut(&cid) else {
            return;
        };
        let host = chan
            .circuit()
            .map(|c| c.host_name())
            .unwrap_or_else(|| "<disconnected>".into());
        if let Binding::Tcp(circuit) = &chan.binding {
            circuit
                .chans
                .lock()
                .expect("circuit channels poisoned")
                .remove(&cid);
        }

        let mut kept = BTreeSet::new();
        for ioid in std::mem::take(&mut chan.ios) {
            let Some(io) = ios.get(&ioid) else { continue };
            let exception = CaException::new(Status::DISCONN, format!("host = {host}"));
            if io.is_subscription() {
                if let Some(callback) = io.subscription_callback() {
                    deferred.push(move || {
                        let mut update =
                            callback.lock().expect("subscription callback poisoned");
                        update(Err(exception));
                    });
                }
                kept.insert(ioid);
            } else {
                let io = ios.remove(&ioid).expect("io table out of sync");
                deferred.push(move || io.fail(exception));
            }
        }
        chan.ios = kept;
        chan.disconnect();

        let notify = chan.notify.clone();
        let rights = chan.rights;
        deferred.push(move || {
            notify.disconnect();
            notify.access_rights(rights);
        });

        if let Some(udp) = udp {
            udp.install_channel(cid, chan.name.clone());
        }
    }

    // ------------------------------------------------------------------
    // Response handlers
    // ------------------------------------------------------------------

    fn version_action(
        &self,
        _cb: &CallbackGuard<'_>,
        iiu: &Arc<Circuit>,
        hdr: &Header,
        _body: &[u8],
    ) -> bool {
        iiu.set_minor(hdr.count as u16);
        true
    }

    fn echo_resp_action(
        &self,
        _cb: &CallbackGuard<'_>,
        _iiu: &Arc<Circuit>,
        _hdr: &Header,
        _body: &[u8],
    ) -> bool {
        true
    }

    fn clear_channel_resp_action(
        &self,
        _cb: &CallbackGuard<'_>,
        _iiu: &Arc<Circuit>,
        _hdr: &Header,
        _body: &[u8],
    ) -> bool {
        true
    }

    fn write_notify_resp_action(
        &self,
        cb: &CallbackGuard<'_>,
        _iiu: &Arc<Circuit>,
        hdr: &Header,
        _body: &[u8],
    ) -> bool {
        let status = Status::from_raw(hdr.param1);
        if status.is_success() {
            self.io_write_completion_and_destroy(cb, Ioid(hdr.param2));
        } else {
            self.io_exception_and_destroy(
                cb,
                Ioid(hdr.param2),
                CaException::new(status, "write notify request rejected"),
            );
        }
        true
    }

    fn read_notify_resp_action(
        &self,
        cb: &CallbackGuard<'_>,
        iiu: &Arc<Circuit>,
        hdr: &Header,
        body: &[u8],
    ) -> bool {
        // the channel id field carries the request status since V4.1
        let status = if iiu.v41_ok() {
            Status::from_raw(hdr.param1)
        } else {
            Status::NORMAL
        };
        if status.is_success() {
            match dbr::decode(hdr.data_type, hdr.count, body) {
                Ok(value) => {
                    self.io_read_completion_and_destroy(cb, Ioid(hdr.param2), value);
                }
                Err(bad) => self.io_exception_and_destroy(
                    cb,
                    Ioid(hdr.param2),
                    CaException::typed(bad, "read failed", hdr.data_type, hdr.count),
                ),
            }
        } else {
            self.io_exception_and_destroy(
                cb,
                Ioid(hdr.param2),
                CaException::typed(status, "read failed", hdr.data_type, hdr.count),
            );
        }
        true
    }

    /// Legacy READ: deliver and destroy, no status field to honor.
    fn read_resp_action(
        &self,
        cb: &CallbackGuard<'_>,
        _iiu: &Arc<Circuit>,
        hdr: &Header,
        body: &[u8],
    ) -> bool {
        match dbr::decode(hdr.data_type, hdr.count, body) {
            Ok(value) => self.io_read_completion_and_destroy(cb, Ioid(hdr.param2), value),
            Err(bad) => self.io_exception_and_destroy(
                cb,
                Ioid(hdr.param2),
                CaException::typed(bad, "read failed", hdr.data_type, hdr.count),
            ),
        }
        true
    }

    fn event_resp_action(
        &self,
        cb: &CallbackGuard<'_>,
        iiu: &Arc<Circuit>,
        hdr: &Header,
        body: &[u8],
    ) -> bool {
        // an empty update used to confirm a cancel; now a no-op because
        // the IO object is destroyed as the cancel is issued
        if hdr.payload_size == 0 {
            return true;
        }

        let status = if iiu.v41_ok() {
            Status::from_raw(hdr.param1)
        } else {
            Status::NORMAL
        };
        if status.is_success() {
            match dbr::decode(hdr.data_type, hdr.count, body) {
                Ok(value) => self.io_completion_notify(cb, Ioid(hdr.param2), value),
                Err(bad) => self.io_exception_notify(
                    cb,
                    Ioid(hdr.param2),
                    CaException::typed(bad, "subscription update failed", hdr.data_type, hdr.count),
                ),
            }
        } else {
            self.io_exception_notify(
                cb,
                Ioid(hdr.param2),
                CaException::typed(status, "subscription update failed", hdr.data_type, hdr.count),
            );
        }
        true
    }

    fn access_rights_resp_action(
        &self,
        _cb: &CallbackGuard<'_>,
        _iiu: &Arc<Circuit>,
        hdr: &Header,
        _body: &[u8],
    ) -> bool {
        let notification = {
            let mut st = self.state();
            st.chans.get_mut(&hdr.param1).map(|chan| {
                chan.rights = crate::notify::AccessRights {
                    read: hdr.param2 & wire::RIGHT_READ != 0,
                    write: hdr.param2 & wire::RIGHT_WRITE != 0,
                };
                (chan.notify.clone(), chan.rights)
            })
        };
        if let Some((notify, rights)) = notification {
            notify.access_rights(rights);
        }
        true
    }

    fn claim_ciu_resp_action(
        &self,
        _cb: &CallbackGuard<'_>,
        iiu: &Arc<Circuit>,
        hdr: &Header,
        _body: &[u8],
    ) -> bool {
        let mut deferred = Deferred::default();
        {
            let mut st = self.state();
            let State { chans, ios, .. } = &mut *st;
            match chans.get_mut(&hdr.param1) {
                Some(chan) => {
                    match chan.circuit() {
                        Some(current) if Arc::ptr_eq(current, iiu) => {}
                        // rebound since the claim went out
                        _ => return true,
                    }
                    let sid = if iiu.v44_ok() { hdr.param2 } else { chan.sid };
                    chan.connect(hdr.data_type, hdr.count, sid, iiu.v41_ok());
                    Inner::resubscribe_all(ios, iiu, sid, &chan.ios);
                    let notify = chan.notify.clone();
                    deferred.push(move || notify.connect());
                }
                None => {
                    if iiu.v44_ok() {
                        // claim ack for a channel the client no longer
                        // has: release the server-side resource
                        iiu.clear_channel_request(hdr.param2, hdr.param1);
                    } else {
                        tracing::debug!(
                            cid = hdr.param1,
                            host = %iiu.host_name(),
                            "claim ack for unknown channel from pre-v4.4 peer; server resource leaked"
                        );
                    }
                }
            }
        }
        deferred.run();
        true
    }

    fn verify_and_disconnect_chan(
        &self,
        _cb: &CallbackGuard<'_>,
        _iiu: &Arc<Circuit>,
        hdr: &Header,
        _body: &[u8],
    ) -> bool {
        let mut deferred = Deferred::default();
        {
            let mut st = self.state();
            if st.chans.contains_key(&hdr.param1) {
                self.disconnect_channel_locked(&mut st, hdr.param1, &mut deferred);
            }
        }
        deferred.run();
        true
    }

    fn bad_tcp_resp_action(
        &self,
        _cb: &CallbackGuard<'_>,
        iiu: &Arc<Circuit>,
        hdr: &Header,
        _body: &[u8],
    ) -> bool {
        tracing::warn!(
            command = hdr.command,
            host = %iiu.host_name(),
            "undecipherable TCP message (bad response type)"
        );
        false
    }

    /// ERROR carrier: re-parse the embedded failed request and route
    /// through the exception table by its command code.
    fn exception_resp_action(
        &self,
        cb: &CallbackGuard<'_>,
        iiu: &Arc<Circuit>,
        hdr: &Header,
        body: &[u8],
    ) -> bool {
        let Ok(req_hdr) = CaHdr::from_bytes(body) else {
            return false;
        };
        let mut consumed = CA_HDR_LEN;
        let req = if req_hdr.needs_annex() {
            let Ok(annex) = CaHdrAnnex::from_bytes(&body[consumed..]) else {
                return false;
            };
            consumed += CA_ANNEX_LEN;
            Header::large(req_hdr, annex)
        } else {
            Header::small(req_hdr)
        };

        let rest = &body[consumed..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let context = String::from_utf8_lossy(&rest[..end]);

        let status = Status::from_raw(hdr.param2);
        let stub = if req.command >= Command::LIMIT {
            Inner::default_excep
        } else {
            TCP_EXCEP_JUMP_TABLE[req.command as usize]
        };
        stub(self, cb, iiu, &req, &context, status)
    }

    // ------------------------------------------------------------------
    // Exception handlers
    // ------------------------------------------------------------------

    fn default_excep(
        &self,
        _cb: &CallbackGuard<'_>,
        iiu: &Arc<Circuit>,
        _req: &Header,
        context: &str,
        status: Status,
    ) -> bool {
        self.notify.exception(
            status,
            &format!("host={} ctx={}", iiu.host_name(), context),
        );
        true
    }

    fn event_add_excep(
        &self,
        cb: &CallbackGuard<'_>,
        _iiu: &Arc<Circuit>,
        req: &Header,
        context: &str,
        status: Status,
    ) -> bool {
        self.io_exception_notify(
            cb,
            Ioid(req.param2),
            CaException::typed(status, context, req.data_type, req.count),
        );
        true
    }

    fn read_excep(
        &self,
        cb: &CallbackGuard<'_>,
        _iiu: &Arc<Circuit>,
        req: &Header,
        context: &str,
        status: Status,
    ) -> bool {
        self.io_exception_and_destroy(
            cb,
            Ioid(req.param2),
            CaException::typed(status, context, req.data_type, req.count),
        );
        true
    }

    fn read_notify_excep(
        &self,
        cb: &CallbackGuard<'_>,
        _iiu: &Arc<Circuit>,
        req: &Header,
        context: &str,
        status: Status,
    ) -> bool {
        self.io_exception_and_destroy(
            cb,
            Ioid(req.param2),
            CaException::typed(status, context, req.data_type, req.count),
        );
        true
    }

    fn write_notify_excep(
        &self,
        cb: &CallbackGuard<'_>,
        _iiu: &Arc<Circuit>,
        req: &Header,
        context: &str,
        status: Status,
    ) -> bool {
        self.io_exception_and_destroy(
            cb,
            Ioid(req.param2),
            CaException::typed(status, context, req.data_type, req.count),
        );
        true
    }

    /// Plain writes have no IO object; route the failure to the channel.
    fn write_excep(
        &self,
        _cb: &CallbackGuard<'_>,
        _iiu: &Arc<Circuit>,
        req: &Header,
        context: &str,
        status: Status,
    ) -> bool {
        let notify = {
            let st = self.state();
            st.chans.get(&req.param2).map(|chan| chan.notify.clone())
        };
        if let Some(notify) = notify {
            notify.write_exception(status, context);
        }
        true
    }
}

fn local_time_string() -> String {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    // SAFETY: tv is valid for writes; the timezone argument may be null.
    unsafe {
        libc::gettimeofday(&mut tv, std::ptr::null_mut());
    }
    // SAFETY: zeroed tm is a valid output buffer for localtime_r.
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    // SAFETY: tv_sec and tm are valid pointers.
    unsafe {
        libc::localtime_r(&tv.tv_sec, &mut tm);
    }
    let mut buf = [0u8; 64];
    // SAFETY: the format string is NUL-terminated and buf is sized.
    let n = unsafe {
        libc::strftime(
            buf.as_mut_ptr().cast(),
            buf.len(),
            c"%a %b %d %Y %H:%M:%S".as_ptr(),
            &tm,
        )
    };
    format!(
        "{}.{:06}",
        String::from_utf8_lossy(&buf[..n]),
        tv.tv_usec as u32
    )
}
