//! Mock Channel Access server pieces shared by the integration tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

use calink::wire::{
    CA_ANNEX_LEN, CA_HDR_LEN, CaHdr, CaHdrAnnex, Command, DatagramIter, FrameBuilder, Header,
};
use calink::{AccessRights, CaException, ChannelNotify, ContextNotify, Dbr, Status};

/// Hard ceiling on every wait in the tests.
pub const LONG: Duration = Duration::from_secs(10);

pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(LONG, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// One mock server: a UDP socket answering searches and a TCP listener
/// accepting circuits.
pub struct TestServer {
    pub udp: UdpSocket,
    pub listener: TcpListener,
}

impl TestServer {
    pub async fn new() -> Self {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { udp, listener }
    }

    /// Where clients should send their search datagrams.
    pub fn search_addr(&self) -> SocketAddr {
        self.udp.local_addr().unwrap()
    }

    pub fn tcp_port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    /// Wait for a search for `pv` and answer it. Returns the CID the
    /// client assigned and the client's search-socket address.
    pub async fn answer_search(
        &self,
        pv: &str,
        sid: u32,
        data_type: u16,
        count: u32,
        minor: u16,
    ) -> (u32, SocketAddr) {
        self.answer_search_at(pv, sid, data_type, count, minor, self.tcp_port())
            .await
    }

    /// Same, but claim the PV lives at an arbitrary TCP port.
    pub async fn answer_search_at(
        &self,
        pv: &str,
        sid: u32,
        data_type: u16,
        count: u32,
        minor: u16,
        tcp_port: u16,
    ) -> (u32, SocketAddr) {
        let mut buf = vec![0u8; 0x10000];
        loop {
            let (n, src) = self.udp.recv_from(&mut buf).await.unwrap();
            for frame in DatagramIter::new(&buf[..n]) {
                let (hdr, body) = frame.unwrap();
                if hdr.command != Command::SEARCH {
                    continue;
                }
                let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
                if &body[..end] != pv.as_bytes() {
                    continue;
                }
                self.send_search_reply(hdr.param1, sid, data_type, count, minor, tcp_port, src)
                    .await;
                return (hdr.param1, src);
            }
        }
    }

    /// Send one search reply, unprompted.
    pub async fn send_search_reply(
        &self,
        cid: u32,
        sid: u32,
        data_type: u16,
        count: u32,
        minor: u16,
        tcp_port: u16,
        to: SocketAddr,
    ) {
        let mut payload = [0u8; 8];
        payload[0..2].copy_from_slice(&minor.to_be_bytes());
        payload[2..4].copy_from_slice(&data_type.to_be_bytes());
        let reply = FrameBuilder::new(Command::SEARCH)
            .data_type(tcp_port)
            .count(count)
            .param1(sid)
            .param2(cid)
            .payload_bytes(&payload)
            .finish();
        self.udp.send_to(&reply, to).await.unwrap();
    }

    /// Send a beacon to the client's search socket.
    pub async fn send_beacon(&self, to: SocketAddr, number: u32, tcp_port: u16) {
        let beacon = FrameBuilder::new(Command::RSRV_IS_UP)
            .data_type(11)
            .count(tcp_port as u32)
            .param1(number)
            .finish();
        self.udp.send_to(&beacon, to).await.unwrap();
    }

    pub async fn accept(&self) -> Conn {
        let (stream, _) = self.listener.accept().await.unwrap();
        Conn { stream }
    }
}

/// Server side of one accepted circuit.
pub struct Conn {
    pub stream: TcpStream,
}

impl Conn {
    pub async fn read_frame(&mut self) -> (Header, Vec<u8>) {
        let mut hdr_buf = [0u8; CA_HDR_LEN];
        self.stream.read_exact(&mut hdr_buf).await.unwrap();
        let hdr = CaHdr::from_bytes(&hdr_buf).unwrap();
        let header = if hdr.needs_annex() {
            let mut annex_buf = [0u8; CA_ANNEX_LEN];
            self.stream.read_exact(&mut annex_buf).await.unwrap();
            Header::large(hdr, CaHdrAnnex::from_bytes(&annex_buf).unwrap())
        } else {
            Header::small(hdr)
        };
        let mut body = vec![0u8; header.payload_size as usize];
        self.stream.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    /// Read frames until one with the wanted command arrives.
    pub async fn read_until(&mut self, command: u16) -> (Header, Vec<u8>) {
        loop {
            let (hdr, body) = self.read_frame().await;
            if hdr.command == command {
                return (hdr, body);
            }
        }
    }

    pub async fn write_frame(&mut self, frame: &[u8]) {
        self.stream.write_all(frame).await.unwrap();
    }

    /// Consume the client handshake (VERSION, CLIENT_NAME, HOST_NAME)
    /// and answer with the server's minor version.
    pub async fn handshake(&mut self, minor: u16) {
        let (version, _) = self.read_frame().await;
        assert_eq!(version.command, Command::VERSION);
        let (client, _) = self.read_frame().await;
        assert_eq!(client.command, Command::CLIENT_NAME);
        let (host, _) = self.read_frame().await;
        assert_eq!(host.command, Command::HOST_NAME);
        self.write_frame(
            &FrameBuilder::new(Command::VERSION)
                .count(minor as u32)
                .finish(),
        )
        .await;
    }

    /// Consume a claim request; returns (CID, PV name).
    pub async fn expect_claim(&mut self) -> (u32, String) {
        let (hdr, body) = self.read_until(Command::CLAIM_CIU).await;
        let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
        (hdr.param1, String::from_utf8_lossy(&body[..end]).into_owned())
    }

    pub async fn ack_claim(&mut self, cid: u32, sid: u32, data_type: u16, count: u32) {
        self.write_frame(
            &FrameBuilder::new(Command::CLAIM_CIU)
                .data_type(data_type)
                .count(count)
                .param1(cid)
                .param2(sid)
                .finish(),
        )
        .await;
    }

    pub async fn send_access_rights(&mut self, cid: u32, rights: u32) {
        self.write_frame(
            &FrameBuilder::new(Command::ACCESS_RIGHTS)
                .param1(cid)
                .param2(rights)
                .finish(),
        )
        .await;
    }

    /// Answer a read-notify request with a value.
    pub async fn answer_read_notify(&mut self, value: &Dbr) {
        let (req, _) = self.read_until(Command::READ_NOTIFY).await;
        self.write_frame(
            &FrameBuilder::new(Command::READ_NOTIFY)
                .data_type(value.data_type() as u16)
                .count(value.count())
                .param1(Status::NORMAL.raw() as u32)
                .param2(req.param2)
                .payload_bytes(&value.encode())
                .finish(),
        )
        .await;
    }

    /// Push a subscription update for an EVENT_ADD the server has seen.
    pub async fn send_update(&mut self, ioid: u32, value: &Dbr) {
        self.write_frame(
            &FrameBuilder::new(Command::EVENT_ADD)
                .data_type(value.data_type() as u16)
                .count(value.count())
                .param1(Status::NORMAL.raw() as u32)
                .param2(ioid)
                .payload_bytes(&value.encode())
                .finish(),
        )
        .await;
    }

    pub async fn send_server_disconn(&mut self, cid: u32) {
        self.write_frame(&FrameBuilder::new(Command::SERVER_DISCONN).param1(cid).finish())
            .await;
    }
}

/// Everything observable about one channel, in arrival order.
#[derive(Debug)]
pub enum Event {
    Connected,
    Disconnected,
    Rights(AccessRights),
    Sample(Result<Dbr, CaException>),
}

/// Channel notify that forwards ordered events to the test body.
pub struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    /// A subscription callback feeding the same ordered stream.
    pub fn sample_sink(&self) -> impl FnMut(Result<Dbr, CaException>) + Send + 'static {
        let tx = self.tx.clone();
        move |sample| {
            let _ = tx.send(Event::Sample(sample));
        }
    }
}

impl ChannelNotify for Recorder {
    fn connect(&self) {
        let _ = self.tx.send(Event::Connected);
    }

    fn disconnect(&self) {
        let _ = self.tx.send(Event::Disconnected);
    }

    fn access_rights(&self, rights: AccessRights) {
        let _ = self.tx.send(Event::Rights(rights));
    }
}

/// Context sink recording every exception it sees.
#[derive(Default)]
pub struct Sink {
    pub exceptions: Mutex<Vec<(Status, String)>>,
}

impl Sink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn statuses(&self) -> Vec<Status> {
        self.exceptions
            .lock()
            .unwrap()
            .iter()
            .map(|(status, _)| *status)
            .collect()
    }

    pub fn contains(&self, status: Status) -> bool {
        self.statuses().contains(&status)
    }

    pub fn context_of(&self, status: Status) -> Option<String> {
        self.exceptions
            .lock()
            .unwrap()
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, ctx)| ctx.clone())
    }
}

impl ContextNotify for Sink {
    fn exception(&self, status: Status, context: &str) {
        self.exceptions
            .lock()
            .unwrap()
            .push((status, context.to_string()));
    }
}

/// Wait for the next event, failing the test on a timeout.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    within("a channel event", rx.recv())
        .await
        .expect("event stream closed")
}

/// Assert that no event arrives within the grace period.
pub async fn expect_silence(rx: &mut mpsc::UnboundedReceiver<Event>, grace: Duration) {
    match tokio::time::timeout(grace, rx.recv()).await {
        Err(_) => {}
        Ok(event) => panic!("expected silence, got {event:?}"),
    }
}
