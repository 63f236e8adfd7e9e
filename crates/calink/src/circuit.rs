//! TCP virtual circuits.
//!
//! One circuit per (server address, priority) pair, multiplexing every
//! channel of that priority bound to that server. Each started circuit
//! runs a receive task (which also dials the connection) and a send
//! task draining the outbound queue; the receive path never blocks on
//! the queue, so callback delivery can never deadlock against sending.

use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Notify;

use crate::channel::Cid;
use crate::context::Context;
use crate::dbr::Dbr;
use crate::io::{Ioid, SubParams};
use crate::wire::{
    self, CA_ANNEX_LEN, CA_HDR_LEN, CaHdr, CaHdrAnnex, Command, FrameBuilder, Header,
};

/// Queue depth above which a flush is requested without waiting.
const FLUSH_EARLY_THRESHOLD: usize = 16 * 1024;
/// Depth above which non-callback writers wait for the backlog to drain.
const SEND_BLOCK_THRESHOLD: usize = 64 * 1024;
/// Backlog level writers wait for before continuing.
const BACKLOG_REASONABLE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CircuitState {
    Connecting,
    Connected,
    CleanShutdown,
    AbortShutdown,
    Disconnected,
}

#[derive(Default)]
struct SendQueue {
    frames: VecDeque<Bytes>,
    nbytes: usize,
}

/// One virtual circuit.
pub(crate) struct Circuit {
    addr: SocketAddr,
    priority: u8,
    minor: AtomicU16,
    state: Mutex<CircuitState>,
    /// Channels bound to this circuit. Mutated only under the context
    /// state lock.
    pub(crate) chans: Mutex<BTreeSet<Cid>>,
    sendq: Mutex<SendQueue>,
    send_wake: Notify,
    backlog_wake: Notify,
    shutdown_wake: Notify,
    last_recv: Mutex<Instant>,
    host: OnceLock<String>,
}

impl Circuit {
    /// Create a circuit and queue the connect handshake: VERSION at the
    /// channel priority, then the client's user and host names.
    pub fn new(
        addr: SocketAddr,
        priority: u8,
        minor: u16,
        user_name: &str,
        host_name: &str,
    ) -> Arc<Self> {
        let circuit = Arc::new(Self {
            addr,
            priority,
            minor: AtomicU16::new(minor),
            state: Mutex::new(CircuitState::Connecting),
            chans: Mutex::new(BTreeSet::new()),
            sendq: Mutex::new(SendQueue::default()),
            send_wake: Notify::new(),
            backlog_wake: Notify::new(),
            shutdown_wake: Notify::new(),
            last_recv: Mutex::new(Instant::now()),
            host: OnceLock::new(),
        });

        circuit.enqueue(
            FrameBuilder::new(Command::VERSION)
                .data_type(priority as u16)
                .count(wire::MINOR_VERSION as u32)
                .finish(),
        );
        circuit.enqueue(
            FrameBuilder::new(Command::CLIENT_NAME)
                .payload_str(user_name)
                .finish(),
        );
        circuit.enqueue(
            FrameBuilder::new(Command::HOST_NAME)
                .payload_str(host_name)
                .finish(),
        );

        circuit
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// The server-table key of this circuit.
    pub fn key(&self) -> (SocketAddr, u8) {
        (self.addr, self.priority)
    }

    pub fn set_minor(&self, minor: u16) {
        self.minor.store(minor, Ordering::Release);
    }

    pub fn v41_ok(&self) -> bool {
        wire::v41_ok(self.minor.load(Ordering::Acquire))
    }

    pub fn v42_ok(&self) -> bool {
        wire::v42_ok(self.minor.load(Ordering::Acquire))
    }

    pub fn v44_ok(&self) -> bool {
        wire::v44_ok(self.minor.load(Ordering::Acquire))
    }

    fn state(&self) -> CircuitState {
        *self.state.lock().expect("circuit state poisoned")
    }

    /// A circuit is alive while it can still carry traffic.
    pub fn alive(&self) -> bool {
        matches!(
            self.state(),
            CircuitState::Connecting | CircuitState::Connected
        )
    }

    /// Drain the bound-channel set for teardown.
    pub fn take_channels(&self) -> Vec<Cid> {
        let mut chans = self.chans.lock().expect("circuit channels poisoned");
        std::mem::take(&mut *chans).into_iter().collect()
    }

    /// Resolved host name, or the dotted address until resolution lands.
    pub fn host_name(&self) -> String {
        self.host
            .get()
            .cloned()
            .unwrap_or_else(|| self.addr.to_string())
    }

    pub fn set_host_name(&self, name: String) {
        let _ = self.host.set(name);
    }

    // ========================================================================
    // Outbound queue
    // ========================================================================

    fn enqueue(&self, frame: Bytes) {
        {
            let mut q = self.sendq.lock().expect("send queue poisoned");
            q.nbytes += frame.len();
            q.frames.push_back(frame);
        }
        self.send_wake.notify_one();
    }

    fn backlog(&self) -> usize {
        self.sendq.lock().expect("send queue poisoned").nbytes
    }

    /// Above the threshold where writers must wait.
    pub fn above_block_threshold(&self) -> bool {
        self.backlog() > SEND_BLOCK_THRESHOLD
    }

    /// Above the threshold where a flush should be requested.
    pub fn above_early_threshold(&self) -> bool {
        self.backlog() > FLUSH_EARLY_THRESHOLD
    }

    /// Ask the send task to drain.
    pub fn flush_request(&self) {
        self.send_wake.notify_one();
    }

    /// Wait until the backlog is reasonable again (or the circuit dies).
    pub async fn backlog_reasonable(&self) {
        loop {
            let notified = self.backlog_wake.notified();
            if self.backlog() <= BACKLOG_REASONABLE || !self.alive() {
                return;
            }
            notified.await;
        }
    }

    // ========================================================================
    // Request encoders
    // ========================================================================

    /// Claim a channel on the server.
    pub fn claim_request(&self, cid: Cid, name: &str) {
        self.enqueue(
            FrameBuilder::new(Command::CLAIM_CIU)
                .param1(cid)
                .param2(wire::MINOR_VERSION as u32)
                .payload_str(name)
                .finish(),
        );
    }

    /// Fire-and-forget write. Carries the CID so server exceptions can
    /// route back to the channel.
    pub fn write_request(&self, sid: u32, cid: Cid, value: &Dbr) {
        self.enqueue(
            FrameBuilder::new(Command::WRITE)
                .data_type(value.data_type() as u16)
                .count(value.count())
                .param1(sid)
                .param2(cid)
                .payload_bytes(&value.encode())
                .finish(),
        );
    }

    pub fn write_notify_request(&self, sid: u32, ioid: Ioid, value: &Dbr) {
        self.enqueue(
            FrameBuilder::new(Command::WRITE_NOTIFY)
                .data_type(value.data_type() as u16)
                .count(value.count())
                .param1(sid)
                .param2(ioid.raw())
                .payload_bytes(&value.encode())
                .finish(),
        );
    }

    pub fn read_notify_request(&self, sid: u32, ioid: Ioid, data_type: u16, count: u32) {
        self.enqueue(
            FrameBuilder::new(Command::READ_NOTIFY)
                .data_type(data_type)
                .count(count)
                .param1(sid)
                .param2(ioid.raw())
                .finish(),
        );
    }

    pub fn subscription_request(&self, sid: u32, ioid: Ioid, params: &SubParams) {
        // 12 reserved bytes (dead-band floats, unused) + u16 mask + pad
        let mut body = [0u8; 16];
        body[12..14].copy_from_slice(&(params.mask as u16).to_be_bytes());
        self.enqueue(
            FrameBuilder::new(Command::EVENT_ADD)
                .data_type(params.data_type)
                .count(params.count)
                .param1(sid)
                .param2(ioid.raw())
                .payload_bytes(&body)
                .finish(),
        );
    }

    pub fn subscription_cancel_request(&self, sid: u32, ioid: Ioid, params: &SubParams) {
        self.enqueue(
            FrameBuilder::new(Command::EVENT_CANCEL)
                .data_type(params.data_type)
                .count(params.count)
                .param1(sid)
                .param2(ioid.raw())
                .finish(),
        );
    }

    /// Release a server-side channel resource.
    pub fn clear_channel_request(&self, sid: u32, cid: Cid) {
        self.enqueue(
            FrameBuilder::new(Command::CLEAR_CHANNEL)
                .param1(sid)
                .param2(cid)
                .finish(),
        );
    }

    fn echo_request(&self) {
        self.enqueue(FrameBuilder::new(Command::ECHO).finish());
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// User-initiated shutdown: drain the queue, then close.
    ///
    /// The receive task keeps running until the send task has drained
    /// and closed the write side; it then stops on the peer's EOF or on
    /// the send task's backstop wake.
    pub fn initiate_clean_shutdown(&self) {
        {
            let mut state = self.state.lock().expect("circuit state poisoned");
            if !matches!(*state, CircuitState::Connecting | CircuitState::Connected) {
                return;
            }
            *state = CircuitState::CleanShutdown;
        }
        self.send_wake.notify_one();
    }

    /// Fatal error path: close without draining.
    pub fn initiate_abort_shutdown(&self) {
        {
            let mut state = self.state.lock().expect("circuit state poisoned");
            if matches!(*state, CircuitState::Disconnected) {
                return;
            }
            *state = CircuitState::AbortShutdown;
        }
        self.send_wake.notify_one();
        self.shutdown_wake.notify_waiters();
        self.backlog_wake.notify_waiters();
    }

    /// Enter the terminal state; true exactly once.
    pub fn enter_disconnected(&self) -> bool {
        let mut state = self.state.lock().expect("circuit state poisoned");
        if *state == CircuitState::Disconnected {
            false
        } else {
            *state = CircuitState::Disconnected;
            true
        }
    }

    /// Spawn the circuit's tasks.
    pub fn start(self: Arc<Self>, ctx: Context) {
        tokio::spawn(async move {
            self.run(ctx).await;
        });
    }

    async fn run(self: Arc<Self>, ctx: Context) {
        let stream = match TcpStream::connect(self.addr).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(addr = %self.addr, error = %e, "circuit connect failed");
                ctx.circuit_down(&self).await;
                return;
            }
        };
        let _ = stream.set_nodelay(true);

        let proceed = {
            let mut state = self.state.lock().expect("circuit state poisoned");
            if *state == CircuitState::Connecting {
                *state = CircuitState::Connected;
                true
            } else {
                false
            }
        };
        if !proceed {
            ctx.circuit_down(&self).await;
            return;
        }

        *self.last_recv.lock().expect("last recv poisoned") = Instant::now();
        tracing::debug!(addr = %self.addr, priority = self.priority, "circuit connected");

        let (rd, wr) = stream.into_split();
        let sender = tokio::spawn(send_loop(self.clone(), ctx.conn_timeout(), wr));

        self.clone().recv_loop(&ctx, rd).await;

        sender.abort();
        ctx.circuit_down(&self).await;
    }

    async fn recv_loop(self: Arc<Self>, ctx: &Context, mut rd: OwnedReadHalf) {
        let mut hdr_buf = [0u8; CA_HDR_LEN];
        let mut annex_buf = [0u8; CA_ANNEX_LEN];
        let mut body = BytesMut::new();

        loop {
            let read = tokio::select! {
                r = rd.read_exact(&mut hdr_buf) => r,
                _ = self.shutdown_wake.notified() => break,
            };
            if read.is_err() {
                break;
            }

            let Ok(hdr) = CaHdr::from_bytes(&hdr_buf) else {
                break;
            };
            let header = if hdr.needs_annex() {
                if rd.read_exact(&mut annex_buf).await.is_err() {
                    break;
                }
                let Ok(annex) = CaHdrAnnex::from_bytes(&annex_buf) else {
                    break;
                };
                Header::large(hdr, annex)
            } else {
                Header::small(hdr)
            };

            if header.payload_size > ctx.max_recv_bytes() {
                ctx.oversized_frame(&self, &header);
                self.initiate_abort_shutdown();
                break;
            }

            body.clear();
            body.resize(header.payload_size as usize, 0);
            if header.payload_size > 0 && rd.read_exact(&mut body).await.is_err() {
                break;
            }

            *self.last_recv.lock().expect("last recv poisoned") = Instant::now();

            if !ctx.dispatch_response(&self, &header, &body).await {
                self.initiate_abort_shutdown();
                break;
            }
        }
    }
}

/// Drains the outbound queue and probes circuit liveness.
///
/// The send side is the only place that writes the socket; the receive
/// path enqueues without ever waiting, and is woken here once the
/// backlog falls to a reasonable level.
async fn send_loop(circuit: Arc<Circuit>, probe: Duration, mut wr: OwnedWriteHalf) {
    let period = probe.max(Duration::from_millis(100));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = circuit.send_wake.notified() => {}
            _ = ticker.tick() => {
                let idle = circuit
                    .last_recv
                    .lock()
                    .expect("last recv poisoned")
                    .elapsed();
                if idle > period * 2 {
                    tracing::debug!(addr = %circuit.addr, "circuit unresponsive, aborting");
                    circuit.initiate_abort_shutdown();
                } else if idle > period {
                    circuit.echo_request();
                }
            }
        }

        let state = circuit.state();
        if matches!(
            state,
            CircuitState::AbortShutdown | CircuitState::Disconnected
        ) {
            return;
        }

        loop {
            let frame = {
                let mut q = circuit.sendq.lock().expect("send queue poisoned");
                match q.frames.pop_front() {
                    Some(frame) => {
                        q.nbytes -= frame.len();
                        Some(frame)
                    }
                    None => None,
                }
            };
            let Some(frame) = frame else { break };
            if wr.write_all(&frame).await.is_err() {
                circuit.initiate_abort_shutdown();
                return;
            }
        }
        if circuit.backlog() <= BACKLOG_REASONABLE {
            circuit.backlog_wake.notify_waiters();
        }

        if state == CircuitState::CleanShutdown {
            let _ = wr.shutdown().await;
            // backstop in case the peer never closes its side
            tokio::time::sleep(Duration::from_millis(250)).await;
            circuit.shutdown_wake.notify_waiters();
            return;
        }
    }
}
