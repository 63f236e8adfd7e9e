//! End-to-end scenarios against a mock server.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::io::AsyncReadExt;

use calink::wire::{Command, RIGHT_READ, RIGHT_WRITE, dbe};
use calink::{CallbackMode, Context, Dbr, DbrType, Status};

use common::{Event, Recorder, Sink, TestServer, expect_silence, next_event, within};

fn context_for(server: &TestServer, sink: &Arc<Sink>) -> Context {
    Context::builder()
        .notify(sink.clone())
        .search_addresses(vec![server.search_addr()])
        .user_name("tester")
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s1_search_connect_read_notify() {
    let server = TestServer::new().await;
    let sink = Sink::new();
    let ctx = context_for(&server, &sink);
    let (recorder, mut events) = Recorder::new();
    let chan = ctx.create_channel("X", recorder.clone(), 0).unwrap();

    let (cid, _) = within("search", server.answer_search("X", 7, 6, 1, 11)).await;
    let mut conn = within("accept", server.accept()).await;
    conn.handshake(11).await;
    let (claim_cid, name) = conn.expect_claim().await;
    assert_eq!(claim_cid, cid);
    assert_eq!(name, "X");
    conn.send_access_rights(cid, RIGHT_READ | RIGHT_WRITE).await;
    conn.ack_claim(cid, 7, 6, 1).await;

    match next_event(&mut events).await {
        Event::Rights(rights) => assert!(rights.read && rights.write),
        other => panic!("expected access rights first, got {other:?}"),
    }
    match next_event(&mut events).await {
        Event::Connected => {}
        other => panic!("expected connect, got {other:?}"),
    }
    assert!(chan.connected());
    ctx.self_test();

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    chan.read_notify(DbrType::Double, 1, move |sample| {
        let _ = done_tx.send(sample);
    })
    .await
    .unwrap();
    conn.answer_read_notify(&Dbr::double(3.14)).await;

    let sample = within("read completion", done_rx).await.unwrap().unwrap();
    assert_eq!(sample, Dbr::double(3.14));
    assert_eq!(ctx.io_count(), 0);
    ctx.self_test();

    chan.destroy().await;
    ctx.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s2_multiply_defined_pv() {
    let server = TestServer::new().await;
    let sink = Sink::new();
    let ctx = context_for(&server, &sink);
    let (recorder, mut events) = Recorder::new();
    let _chan = ctx.create_channel("X", recorder.clone(), 0).unwrap();

    let (cid, client_addr) = within("search", server.answer_search("X", 7, 6, 1, 11)).await;
    let mut conn = within("accept", server.accept()).await;
    conn.handshake(11).await;
    let (_, _) = conn.expect_claim().await;
    conn.ack_claim(cid, 7, 6, 1).await;
    match next_event(&mut events).await {
        Event::Connected => {}
        other => panic!("expected connect, got {other:?}"),
    }

    // a second server claims the same PV from another port
    server
        .send_search_reply(cid, 99, 6, 1, 11, server.tcp_port() + 1, client_addr)
        .await;

    within("multiply-defined diagnostic", async {
        while !sink.contains(Status::DBLCHNL) {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    let context = sink.context_of(Status::DBLCHNL).unwrap();
    assert!(context.contains("Channel: \"X\""), "context was: {context}");
    assert!(context.contains("Ignored:"), "context was: {context}");

    // binding unchanged, no user callbacks fired
    expect_silence(&mut events, Duration::from_millis(200)).await;
    assert_eq!(ctx.connection_count(), 1);
    ctx.self_test();

    ctx.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s3_server_disconn_retains_subscription() {
    let server = Arc::new(TestServer::new().await);
    let sink = Sink::new();
    let ctx = context_for(&server, &sink);
    let (recorder, mut events) = Recorder::new();
    let chan = ctx.create_channel("Y", recorder.clone(), 0).unwrap();

    // install the subscription while still searching
    let sub_id = chan
        .subscribe(DbrType::Double, 1, dbe::VALUE, recorder.sample_sink())
        .await
        .unwrap();

    let (cid, _) = within("search", server.answer_search("Y", 3, 6, 1, 11)).await;
    let mut conn = within("accept", server.accept()).await;
    conn.handshake(11).await;
    let (_, _) = conn.expect_claim().await;
    conn.ack_claim(cid, 3, 6, 1).await;
    match next_event(&mut events).await {
        Event::Connected => {}
        other => panic!("expected connect, got {other:?}"),
    }

    // the pending subscription is issued on connect
    let (sub_req, _) = within("subscription request", conn.read_until(Command::EVENT_ADD)).await;
    assert_eq!(sub_req.param2, sub_id.raw());
    conn.send_update(sub_req.param2, &Dbr::double(1.0)).await;
    match next_event(&mut events).await {
        Event::Sample(Ok(value)) => assert_eq!(value, Dbr::double(1.0)),
        other => panic!("expected a sample, got {other:?}"),
    }

    // answer every re-search; the client ignores replies for channels
    // that are already bound
    let answering = tokio::spawn({
        let server = server.clone();
        async move {
            loop {
                server.answer_search("Y", 4, 6, 1, 11).await;
            }
        }
    });

    // server drops the channel (but not the circuit)
    conn.send_server_disconn(cid).await;
    match next_event(&mut events).await {
        Event::Sample(Err(e)) => assert_eq!(e.status, Status::DISCONN),
        other => panic!("expected DISCONN on the subscription, got {other:?}"),
    }
    match next_event(&mut events).await {
        Event::Disconnected => {}
        other => panic!("expected disconnect, got {other:?}"),
    }
    match next_event(&mut events).await {
        Event::Rights(rights) => assert!(!rights.read && !rights.write),
        other => panic!("expected stale rights, got {other:?}"),
    }
    assert!(!chan.connected());
    assert_eq!(ctx.io_count(), 1, "the subscription must survive");
    assert_eq!(ctx.connection_count(), 1, "the circuit must survive");
    ctx.self_test();

    // the channel re-searches; on reconnect the subscription re-issues
    let (claim_cid, _) = within("re-claim", conn.expect_claim()).await;
    assert_eq!(claim_cid, cid, "a channel keeps its CID for life");
    answering.abort();
    conn.ack_claim(cid, 4, 6, 1).await;
    match next_event(&mut events).await {
        Event::Connected => {}
        other => panic!("expected reconnect, got {other:?}"),
    }
    let (sub_req, _) = within("re-subscription", conn.read_until(Command::EVENT_ADD)).await;
    assert_eq!(sub_req.param2, sub_id.raw());
    conn.send_update(sub_req.param2, &Dbr::double(2.0)).await;
    match next_event(&mut events).await {
        Event::Sample(Ok(value)) => assert_eq!(value, Dbr::double(2.0)),
        other => panic!("expected the post-reconnect sample, got {other:?}"),
    }

    chan.destroy().await;
    ctx.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_restart_reissues_subscriptions() {
    let server = Arc::new(TestServer::new().await);
    let sink = Sink::new();
    let ctx = context_for(&server, &sink);
    let (recorder, mut events) = Recorder::new();
    let chan = ctx.create_channel("R", recorder.clone(), 0).unwrap();
    let sub_id = chan
        .subscribe(DbrType::Double, 1, dbe::VALUE, recorder.sample_sink())
        .await
        .unwrap();

    let (cid, _) = within("search", server.answer_search("R", 1, 6, 1, 11)).await;
    let mut conn = within("accept", server.accept()).await;
    conn.handshake(11).await;
    conn.expect_claim().await;
    conn.ack_claim(cid, 1, 6, 1).await;
    match next_event(&mut events).await {
        Event::Connected => {}
        other => panic!("expected connect, got {other:?}"),
    }
    within("subscription request", conn.read_until(Command::EVENT_ADD)).await;

    // server restart: the circuit drops, and the reborn server answers
    // every search from now on
    let answering = tokio::spawn({
        let server = server.clone();
        async move {
            loop {
                server.answer_search("R", 2, 6, 1, 11).await;
            }
        }
    });
    drop(conn);
    match next_event(&mut events).await {
        Event::Sample(Err(e)) => assert_eq!(e.status, Status::DISCONN),
        other => panic!("expected DISCONN on the subscription, got {other:?}"),
    }
    match next_event(&mut events).await {
        Event::Disconnected => {}
        other => panic!("expected disconnect, got {other:?}"),
    }
    match next_event(&mut events).await {
        Event::Rights(_) => {}
        other => panic!("expected stale rights, got {other:?}"),
    }
    assert!(sink.contains(Status::DISCONN));
    assert_eq!(ctx.io_count(), 1);
    within("circuit uninstall", async {
        while ctx.connection_count() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    ctx.self_test();

    // the server comes back; connect must precede any update
    let mut conn = within("re-accept", server.accept()).await;
    conn.handshake(11).await;
    let (claim_cid, _) = conn.expect_claim().await;
    assert_eq!(claim_cid, cid, "a channel keeps its CID for life");
    answering.abort();
    conn.ack_claim(cid, 2, 6, 1).await;
    match next_event(&mut events).await {
        Event::Connected => {}
        other => panic!("connect must precede any post-reconnect update, got {other:?}"),
    }
    let (sub_req, _) = within("re-subscription", conn.read_until(Command::EVENT_ADD)).await;
    assert_eq!(sub_req.param2, sub_id.raw());
    conn.send_update(sub_req.param2, &Dbr::double(7.5)).await;
    match next_event(&mut events).await {
        Event::Sample(Ok(value)) => assert_eq!(value, Dbr::double(7.5)),
        other => panic!("expected the post-restart sample, got {other:?}"),
    }

    chan.destroy().await;
    ctx.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s4_pre_v41_peer_synthesizes_rights() {
    let server = TestServer::new().await;
    let sink = Sink::new();
    let ctx = context_for(&server, &sink);
    let (recorder, mut events) = Recorder::new();
    let chan = ctx.create_channel("Z", recorder.clone(), 0).unwrap();

    // minor = 0: no claim ack, no access-rights frame will ever come
    let (cid, _) = within("search", server.answer_search("Z", 9, 6, 1, 0)).await;

    match next_event(&mut events).await {
        Event::Connected => {}
        other => panic!("expected connect, got {other:?}"),
    }
    match next_event(&mut events).await {
        Event::Rights(rights) => {
            assert!(rights.read && rights.write, "pre-v4.1 peers grant read+write");
        }
        other => panic!("expected synthesized rights, got {other:?}"),
    }
    assert!(chan.connected());

    // the claim still goes out for the server's bookkeeping
    let mut conn = within("accept", server.accept()).await;
    let (version, _) = conn.read_frame().await;
    assert_eq!(version.command, Command::VERSION);
    conn.read_frame().await; // CLIENT_NAME
    conn.read_frame().await; // HOST_NAME
    let (claim_cid, name) = conn.expect_claim().await;
    assert_eq!(claim_cid, cid);
    assert_eq!(name, "Z");

    chan.destroy().await;
    ctx.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s5_oversized_frame_tears_circuit_down() {
    let server = TestServer::new().await;
    let sink = Sink::new();
    let ctx = Context::builder()
        .notify(sink.clone())
        .search_addresses(vec![server.search_addr()])
        .max_array_bytes(1) // rounds up to the base frame budget
        .build()
        .unwrap();
    let (recorder, mut events) = Recorder::new();
    let chan = ctx.create_channel("BIG", recorder.clone(), 0).unwrap();

    let (cid, _) = within("search", server.answer_search("BIG", 5, 6, 1, 11)).await;
    let mut conn = within("accept", server.accept()).await;
    conn.handshake(11).await;
    conn.expect_claim().await;
    conn.ack_claim(cid, 5, 6, 1).await;
    match next_event(&mut events).await {
        Event::Connected => {}
        other => panic!("expected connect, got {other:?}"),
    }

    let _sub = chan
        .subscribe(DbrType::Double, 1, dbe::VALUE, recorder.sample_sink())
        .await
        .unwrap();
    within("subscription request", conn.read_until(Command::EVENT_ADD)).await;

    chan.read_notify(DbrType::Double, 1, recorder.sample_sink())
        .await
        .unwrap();
    let (read_req, _) = within("read request", conn.read_until(Command::READ_NOTIFY)).await;

    // forge a READ_NOTIFY whose annex declares an enormous payload
    let mut forged = Vec::new();
    forged.extend_from_slice(&Command::READ_NOTIFY.to_be_bytes());
    forged.extend_from_slice(&0xffffu16.to_be_bytes()); // size sentinel
    forged.extend_from_slice(&6u16.to_be_bytes());
    forged.extend_from_slice(&0xffffu16.to_be_bytes()); // count sentinel
    forged.extend_from_slice(&(Status::NORMAL.raw() as u32).to_be_bytes());
    forged.extend_from_slice(&read_req.param2.to_be_bytes());
    forged.extend_from_slice(&100_000u32.to_be_bytes()); // annex: true size
    forged.extend_from_slice(&12_500u32.to_be_bytes()); // annex: true count
    conn.write_frame(&forged).await;

    // both outstanding IOs see DISCONN, never partial data
    let mut disconn_samples = 0;
    loop {
        match next_event(&mut events).await {
            Event::Sample(Err(e)) => {
                assert_eq!(e.status, Status::DISCONN);
                disconn_samples += 1;
            }
            Event::Sample(Ok(value)) => panic!("partial data delivered: {value:?}"),
            Event::Disconnected => break,
            Event::Rights(_) | Event::Connected => panic!("unexpected order"),
        }
    }
    assert_eq!(disconn_samples, 2);
    assert!(sink.contains(Status::DISCONN));
    assert_eq!(ctx.io_count(), 1, "the subscription must survive");
    within("circuit teardown", async {
        while ctx.connection_count() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    // the server side of the socket is gone
    let mut probe = [0u8; 16];
    match conn.stream.read(&mut probe).await {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected a closed socket, read {n} bytes"),
    }

    chan.destroy().await;
    ctx.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s6_cancel_blocks_until_callback_returns() {
    let server = TestServer::new().await;
    let sink = Sink::new();
    let ctx = context_for(&server, &sink);
    let (recorder, mut events) = Recorder::new();
    let chan = ctx.create_channel("C", recorder.clone(), 0).unwrap();

    let (cid, _) = within("search", server.answer_search("C", 6, 6, 1, 11)).await;
    let mut conn = within("accept", server.accept()).await;
    conn.handshake(11).await;
    conn.expect_claim().await;
    conn.ack_claim(cid, 6, 6, 1).await;
    match next_event(&mut events).await {
        Event::Connected => {}
        other => panic!("expected connect, got {other:?}"),
    }

    let calls = Arc::new(AtomicU32::new(0));
    let (entered_tx, mut entered_rx) = tokio::sync::mpsc::unbounded_channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let counter = calls.clone();
    let mut first = true;
    let sub_id = chan
        .subscribe(DbrType::Double, 1, dbe::VALUE, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if first {
                first = false;
                entered_tx.send(()).unwrap();
                // hold the callback open until the test releases it
                release_rx.recv().unwrap();
            }
        })
        .await
        .unwrap();
    let (sub_req, _) = within("subscription request", conn.read_until(Command::EVENT_ADD)).await;

    conn.send_update(sub_req.param2, &Dbr::double(1.0)).await;
    within("callback entry", entered_rx.recv()).await.unwrap();

    // cancel must wait for the in-flight callback to return
    {
        let mut cancel = std::pin::pin!(chan.cancel_io(sub_id));
        assert!(
            tokio::time::timeout(Duration::from_millis(150), &mut cancel)
                .await
                .is_err(),
            "cancel returned while the callback was still running"
        );

        release_tx.send(()).unwrap();
        within("cancel completion", &mut cancel).await.unwrap();
    }
    assert_eq!(ctx.io_count(), 0);
    within("cancel request", conn.read_until(Command::EVENT_CANCEL)).await;

    // further updates must not reach the callback
    conn.send_update(sub_req.param2, &Dbr::double(2.0)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    chan.destroy().await;
    ctx.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_notify_then_read_notify_round_trip() {
    let server = TestServer::new().await;
    let sink = Sink::new();
    let ctx = context_for(&server, &sink);
    let (recorder, mut events) = Recorder::new();
    let chan = ctx.create_channel("RT", recorder.clone(), 0).unwrap();

    let (cid, _) = within("search", server.answer_search("RT", 2, 6, 1, 11)).await;
    let mut conn = within("accept", server.accept()).await;
    conn.handshake(11).await;
    conn.expect_claim().await;
    conn.ack_claim(cid, 2, 6, 1).await;
    match next_event(&mut events).await {
        Event::Connected => {}
        other => panic!("expected connect, got {other:?}"),
    }

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    chan.write_notify(&Dbr::double(5.5), move |result| {
        let _ = done_tx.send(result);
    })
    .await
    .unwrap();

    // server: store the written value, acknowledge the write
    let (write_req, body) = within("write request", conn.read_until(Command::WRITE_NOTIFY)).await;
    let stored = calink::dbr::decode(write_req.data_type, write_req.count, &body).unwrap();
    conn.write_frame(
        &calink::wire::FrameBuilder::new(Command::WRITE_NOTIFY)
            .data_type(write_req.data_type)
            .count(write_req.count)
            .param1(Status::NORMAL.raw() as u32)
            .param2(write_req.param2)
            .finish(),
    )
    .await;
    within("write completion", done_rx).await.unwrap().unwrap();

    // a read after the write observes the written value
    let (read_tx, read_rx) = tokio::sync::oneshot::channel();
    chan.read_notify(DbrType::Double, 1, move |sample| {
        let _ = read_tx.send(sample);
    })
    .await
    .unwrap();
    conn.answer_read_notify(&stored).await;
    let sample = within("read completion", read_rx).await.unwrap().unwrap();
    assert_eq!(sample, Dbr::double(5.5));
    assert_eq!(ctx.io_count(), 0);

    chan.destroy().await;
    ctx.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unresponsive_circuit_is_probed_then_aborted() {
    let server = TestServer::new().await;
    let sink = Sink::new();
    let ctx = Context::builder()
        .notify(sink.clone())
        .search_addresses(vec![server.search_addr()])
        .conn_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let (recorder, mut events) = Recorder::new();
    let chan = ctx.create_channel("DEAD", recorder.clone(), 0).unwrap();

    let (cid, _) = within("search", server.answer_search("DEAD", 1, 6, 1, 11)).await;
    let mut conn = within("accept", server.accept()).await;
    conn.handshake(11).await;
    conn.expect_claim().await;
    conn.ack_claim(cid, 1, 6, 1).await;
    match next_event(&mut events).await {
        Event::Connected => {}
        other => panic!("expected connect, got {other:?}"),
    }

    // the client probes the silent circuit, gets nothing, and gives up
    within("echo probe", conn.read_until(Command::ECHO)).await;
    loop {
        match next_event(&mut events).await {
            Event::Disconnected => break,
            Event::Sample(_) | Event::Rights(_) => {}
            Event::Connected => panic!("unexpected reconnect"),
        }
    }
    assert!(!chan.connected());

    chan.destroy().await;
    ctx.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_exceptions_route_through_the_exception_table() {
    use calink::wire::FrameBuilder;

    let server = TestServer::new().await;
    let sink = Sink::new();
    let ctx = context_for(&server, &sink);
    let (recorder, mut events) = Recorder::new();
    let chan = ctx.create_channel("DENIED", recorder.clone(), 0).unwrap();

    let (cid, _) = within("search", server.answer_search("DENIED", 1, 6, 1, 11)).await;
    let mut conn = within("accept", server.accept()).await;
    conn.handshake(11).await;
    conn.expect_claim().await;
    conn.ack_claim(cid, 1, 6, 1).await;
    match next_event(&mut events).await {
        Event::Connected => {}
        other => panic!("expected connect, got {other:?}"),
    }

    let (read_tx, read_rx) = tokio::sync::oneshot::channel();
    chan.read_notify(DbrType::Double, 1, move |sample| {
        let _ = read_tx.send(sample);
    })
    .await
    .unwrap();
    let (req, _) = within("read request", conn.read_until(Command::READ_NOTIFY)).await;

    // error carrier: the failed request header, then the context string
    let embedded = FrameBuilder::new(Command::READ_NOTIFY)
        .data_type(req.data_type)
        .count(req.count)
        .param1(req.param1)
        .param2(req.param2)
        .finish();
    let mut payload = embedded.to_vec();
    payload.extend_from_slice(b"read access denied\0");
    conn.write_frame(
        &FrameBuilder::new(Command::ERROR)
            .param1(cid)
            .param2(Status::GETFAIL.raw() as u32)
            .payload_bytes(&payload)
            .finish(),
    )
    .await;

    let error = within("read exception", read_rx)
        .await
        .unwrap()
        .expect_err("the read must fail");
    assert_eq!(error.status, Status::GETFAIL);
    assert!(error.context.contains("read access denied"));
    assert_eq!(error.data_type, Some(6));
    assert_eq!(error.count, Some(1));
    assert_eq!(ctx.io_count(), 0, "a failed one-shot IO is destroyed");

    // an exception for a command with no dedicated handler goes to the
    // context sink with the peer's host in the text
    let embedded = FrameBuilder::new(Command::ECHO).finish();
    let mut payload = embedded.to_vec();
    payload.extend_from_slice(b"echo rejected\0");
    conn.write_frame(
        &FrameBuilder::new(Command::ERROR)
            .param2(Status::BADTYPE.raw() as u32)
            .payload_bytes(&payload)
            .finish(),
    )
    .await;
    within("sink exception", async {
        while !sink.contains(Status::BADTYPE) {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    let context = sink.context_of(Status::BADTYPE).unwrap();
    assert!(context.contains("ctx=echo rejected"), "context was: {context}");

    chan.destroy().await;
    ctx.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn beacons_feed_the_anomaly_path() {
    let server = TestServer::new().await;
    let sink = Sink::new();
    let ctx = context_for(&server, &sink);
    let (recorder, _events) = Recorder::new();
    let _chan = ctx.create_channel("NOWHERE", recorder.clone(), 0).unwrap();

    // observe one search round to learn the client's socket address
    let mut buf = vec![0u8; 0x10000];
    let (_, client_addr) = within("first search", server.udp.recv_from(&mut buf))
        .await
        .unwrap();

    // first beacon seeds the history; a repeated beacon number at the
    // same address is restart evidence and must not disturb anything
    server.send_beacon(client_addr, 5, server.tcp_port()).await;
    server.send_beacon(client_addr, 5, server.tcp_port()).await;

    // the unresolved channel keeps searching afterwards
    within("continued search", server.udp.recv_from(&mut buf))
        .await
        .unwrap();
    assert!(sink.statuses().is_empty());
    ctx.self_test();

    ctx.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cooperative_mode_defers_callbacks_to_the_pump() {
    let server = TestServer::new().await;
    let sink = Sink::new();
    let ctx = Context::builder()
        .notify(sink.clone())
        .search_addresses(vec![server.search_addr()])
        .callback_mode(CallbackMode::Cooperative)
        .build()
        .unwrap();
    let (recorder, mut events) = Recorder::new();
    let chan = ctx.create_channel("COOP", recorder.clone(), 0).unwrap();

    // pre-v4.2 peer so connect fires straight from the search reply
    within("search", server.answer_search("COOP", 1, 6, 1, 0)).await;

    // nothing may fire before the pump runs
    expect_silence(&mut events, Duration::from_millis(300)).await;

    ctx.process_events(Duration::from_millis(400)).await;

    match next_event(&mut events).await {
        Event::Connected => {}
        other => panic!("expected connect during the pump, got {other:?}"),
    }
    match next_event(&mut events).await {
        Event::Rights(rights) => assert!(rights.read && rights.write),
        other => panic!("expected rights during the pump, got {other:?}"),
    }
    assert!(chan.connected());

    chan.destroy().await;
    ctx.destroy().await;
}
