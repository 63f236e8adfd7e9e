//! UDP search and beacon transport.
//!
//! Owns the search datagram socket and the set of channels still
//! looking for their server. Search rounds are batched datagrams sent
//! with exponential backoff; a beacon anomaly resets every channel's
//! retry budget so unresolved names re-search promptly.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::channel::Cid;
use crate::config::Config;
use crate::context::Context;
use crate::error::Result;
use crate::wire::{
    self, Command, DatagramIter, FrameBuilder, MAX_UDP_SEND,
};

/// First search interval after a channel is installed.
const MIN_SEARCH_PERIOD: Duration = Duration::from_millis(50);
/// Ceiling of the backoff.
const MAX_SEARCH_PERIOD: Duration = Duration::from_secs(5);
/// Rounds a channel participates in before it waits for a beacon
/// anomaly to reset its budget.
const SEARCH_TRIES_MAX: u32 = 100;

struct SearchState {
    /// Rotation order of searching channels.
    chans: VecDeque<(Cid, Arc<str>)>,
    retries: HashMap<Cid, u32>,
    /// Search sequence number, bumped per round.
    seq: u16,
    interval: Duration,
}

/// The context's datagram transport.
pub(crate) struct UdpIiu {
    socket: Arc<UdpSocket>,
    state: Mutex<SearchState>,
    wake: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    search_addrs: Vec<SocketAddr>,
    wakeup_addr: SocketAddr,
}

impl UdpIiu {
    /// Create the search socket. At most one exists per context.
    pub fn new(config: &Config) -> Result<Arc<Self>> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        let any: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
        socket.bind(&any.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        let port = socket.local_addr()?.port();

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            state: Mutex::new(SearchState {
                chans: VecDeque::new(),
                retries: HashMap::new(),
                seq: 0,
                interval: MIN_SEARCH_PERIOD,
            }),
            wake: Notify::new(),
            tasks: Mutex::new(Vec::new()),
            search_addrs: config.search_addrs.clone(),
            wakeup_addr: (Ipv4Addr::LOCALHOST, port).into(),
        }))
    }

    /// Spawn the receive and search-timer tasks.
    pub fn start(self: Arc<Self>, ctx: Context) {
        let mut tasks = self.tasks.lock().expect("udp tasks poisoned");
        let me = self.clone();
        tasks.push(tokio::spawn(async move {
            me.recv_loop(ctx).await;
        }));
        let me = self.clone();
        tasks.push(tokio::spawn(async move {
            me.search_loop().await;
        }));
    }

    /// Stop both tasks. Never called with the state lock held.
    pub fn shutdown(&self) {
        self.wakeup_msg();
        let mut tasks = self.tasks.lock().expect("udp tasks poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Add a channel to the searching set and search soon.
    pub fn install_channel(&self, cid: Cid, name: Arc<str>) {
        {
            let mut st = self.state.lock().expect("udp state poisoned");
            if st.chans.iter().any(|(c, _)| *c == cid) {
                return;
            }
            st.chans.push_back((cid, name));
            st.retries.insert(cid, 0);
            st.interval = MIN_SEARCH_PERIOD;
        }
        self.wake.notify_one();
    }

    pub fn uninstall_channel(&self, cid: Cid) {
        let mut st = self.state.lock().expect("udp state poisoned");
        st.chans.retain(|(c, _)| *c != cid);
        st.retries.remove(&cid);
    }

    pub fn searching_count(&self) -> usize {
        self.state.lock().expect("udp state poisoned").chans.len()
    }

    pub fn is_searching(&self, cid: Cid) -> bool {
        self.state
            .lock()
            .expect("udp state poisoned")
            .chans
            .iter()
            .any(|(c, _)| *c == cid)
    }

    /// Reset every channel's retry budget and search promptly.
    pub fn beacon_anomaly(&self) {
        {
            let mut st = self.state.lock().expect("udp state poisoned");
            for retries in st.retries.values_mut() {
                *retries = 0;
            }
            st.interval = MIN_SEARCH_PERIOD;
        }
        self.wake.notify_one();
    }

    /// A search reply was seen: keep the cadence up while the burst of
    /// answers lasts.
    pub fn notify_search_response(&self) {
        let mut st = self.state.lock().expect("udp state poisoned");
        st.interval = MIN_SEARCH_PERIOD;
    }

    /// Self-addressed no-op datagram so a cooperative main thread exits
    /// its event wait.
    pub fn wakeup_msg(&self) {
        let frame = FrameBuilder::new(Command::VERSION).finish();
        let _ = self.socket.try_send_to(&frame, self.wakeup_addr);
    }

    async fn search_loop(self: Arc<Self>) {
        loop {
            let interval = self.state.lock().expect("udp state poisoned").interval;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.wake.notified() => {}
            }

            if let Some(datagram) = self.build_search_round() {
                for dest in &self.search_addrs {
                    if let Err(e) = self.socket.send_to(&datagram, dest).await {
                        tracing::debug!(dest = %dest, error = %e, "search send failed");
                    }
                }
            }

            let mut st = self.state.lock().expect("udp state poisoned");
            st.interval = (st.interval * 2).min(MAX_SEARCH_PERIOD);
        }
    }

    /// Assemble one round: a VERSION frame followed by as many search
    /// requests as fit the datagram budget, rotating through channels
    /// that still have retry budget.
    fn build_search_round(&self) -> Option<Vec<u8>> {
        let mut st = self.state.lock().expect("udp state poisoned");
        if st.chans.is_empty() {
            return None;
        }
        st.seq = st.seq.wrapping_add(1);
        let seq = st.seq;

        let mut datagram = Vec::with_capacity(MAX_UDP_SEND);
        datagram.extend_from_slice(
            &FrameBuilder::new(Command::VERSION)
                .count(wire::MINOR_VERSION as u32)
                .param1(seq as u32)
                .finish(),
        );

        let mut searched = 0usize;
        for _ in 0..st.chans.len() {
            let Some((cid, name)) = st.chans.pop_front() else {
                break;
            };
            let budget_left = {
                let retries = st.retries.entry(cid).or_insert(0);
                if *retries < SEARCH_TRIES_MAX {
                    *retries += 1;
                    true
                } else {
                    false
                }
            };
            if budget_left {
                let frame = FrameBuilder::new(Command::SEARCH)
                    .data_type(wire::SEARCH_DO_REPLY)
                    .count(wire::MINOR_VERSION as u32)
                    .param1(cid)
                    .param2(cid)
                    .payload_str(&name)
                    .finish();
                if datagram.len() + frame.len() > MAX_UDP_SEND {
                    st.chans.push_front((cid, name));
                    break;
                }
                datagram.extend_from_slice(&frame);
                searched += 1;
            }
            st.chans.push_back((cid, name));
        }

        (searched > 0).then_some(datagram)
    }

    async fn recv_loop(self: Arc<Self>, ctx: Context) {
        let mut buf = vec![0u8; 0x10000];
        loop {
            let (n, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::debug!(error = %e, "udp recv failed");
                    continue;
                }
            };
            for frame in DatagramIter::new(&buf[..n]) {
                let Ok((hdr, body)) = frame else {
                    tracing::debug!(src = %src, "undecipherable datagram");
                    break;
                };
                match hdr.command {
                    Command::SEARCH => {
                        let Some(reply) = SearchReply::parse(&hdr, body, src) else {
                            continue;
                        };
                        ctx.search_response(reply).await;
                        self.notify_search_response();
                    }
                    Command::RSRV_IS_UP => {
                        let port = if hdr.count != 0 {
                            hdr.count as u16
                        } else {
                            src.port()
                        };
                        let ip = if hdr.param2 != 0 {
                            Ipv4Addr::from(hdr.param2).into()
                        } else {
                            src.ip()
                        };
                        ctx.beacon_notify(
                            SocketAddr::new(ip, port),
                            hdr.param1,
                            hdr.data_type,
                        );
                    }
                    // wake-up datagram for the cooperative event pump
                    Command::VERSION if hdr.payload_size == 0 && hdr.count == 0 => {
                        ctx.wakeup_event();
                    }
                    Command::VERSION | Command::NOT_FOUND => {}
                    other => {
                        tracing::debug!(src = %src, command = other, "ignoring datagram command");
                    }
                }
            }
        }
    }
}

/// A positive search reply.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SearchReply {
    pub cid: Cid,
    pub sid: u32,
    pub data_type: u16,
    pub count: u32,
    pub minor: u16,
    pub addr: SocketAddr,
}

impl SearchReply {
    fn parse(hdr: &crate::wire::Header, body: &[u8], src: SocketAddr) -> Option<Self> {
        if body.len() < 4 {
            return None;
        }
        let minor = u16::from_be_bytes([body[0], body[1]]);
        let data_type = u16::from_be_bytes([body[2], body[3]]);
        let port = if hdr.data_type != 0 {
            hdr.data_type
        } else {
            src.port()
        };
        Some(Self {
            cid: hdr.param2,
            sid: hdr.param1,
            data_type,
            count: hdr.count,
            minor,
            addr: SocketAddr::new(src.ip(), port),
        })
    }
}
