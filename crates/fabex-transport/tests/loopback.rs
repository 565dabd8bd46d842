use std::net::TcpListener;
use std::time::Duration;

use fabex_transport::{
    getinfo, Accepted, ActiveEndpoint, BindFlags, CompletionFlags, CompletionQueue, CqAttr,
    Domain, EndpointState, EpAttr, EqAttr, EqEvent, EventQueue, Errno, Fabric, FidKind,
    GetInfoFlags, Hints, Info, PassiveEndpoint, TransportError, MAX_MSG_SIZE,
};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

/// Endpoint plus the resources it was opened on, in teardown order.
struct Conn {
    ep: ActiveEndpoint,
    tx: CompletionQueue,
    rx: CompletionQueue,
    domain: Domain,
}

struct Client {
    conn: Conn,
    eq: EventQueue,
    fabric: Fabric,
    _info: Info,
}

struct Passive {
    pep: PassiveEndpoint,
    eq: EventQueue,
    fabric: Fabric,
    _info: Info,
}

struct Server {
    conn: Conn,
    passive: Passive,
}

fn open_conn(fabric: &Fabric, eq: &EventQueue, info: &Info) -> Conn {
    let domain = Domain::open(fabric, info).unwrap();
    let tx = CompletionQueue::open(&domain, CqAttr::default()).unwrap();
    let rx = CompletionQueue::open(&domain, CqAttr::default()).unwrap();
    let mut ep = ActiveEndpoint::open(&domain, info).unwrap();
    ep.bind_cq(&tx, BindFlags::TRANSMIT).unwrap();
    ep.bind_cq(&rx, BindFlags::RECV).unwrap();
    ep.bind_eq(eq).unwrap();
    ep.enable().unwrap();
    Conn { ep, tx, rx, domain }
}

fn listen(hints: &Hints) -> Passive {
    let info = getinfo(hints, Some("127.0.0.1"), Some("0"), GetInfoFlags::SOURCE).unwrap();
    let fabric = Fabric::open(&info).unwrap();
    let eq = EventQueue::open(&fabric, EqAttr::default()).unwrap();
    let mut pep = PassiveEndpoint::open(&fabric, &info).unwrap();
    pep.bind(&eq).unwrap();
    pep.listen().unwrap();
    Passive {
        pep,
        eq,
        fabric,
        _info: info,
    }
}

fn client(hints: &Hints) -> Client {
    let info = getinfo(hints, None, None, GetInfoFlags::empty()).unwrap();
    let fabric = Fabric::open(&info).unwrap();
    let eq = EventQueue::open(&fabric, EqAttr::default()).unwrap();
    let conn = open_conn(&fabric, &eq, &info);
    Client {
        conn,
        eq,
        fabric,
        _info: info,
    }
}

fn expect_connected(eq: &EventQueue) {
    match eq.sread(WAIT) {
        Ok(EqEvent::Connected { .. }) => {}
        Ok(other) => panic!("expected CONNECTED, got {}", other.name()),
        Err(err) => panic!("expected CONNECTED, got error {err}"),
    }
}

fn connected_pair(client_hints: &Hints, server_hints: &Hints) -> (Client, Server) {
    let passive = listen(server_hints);
    let addr = passive.pep.getname().unwrap();
    assert_ne!(addr.port(), 0);

    let mut client = client(client_hints);
    client.conn.ep.connect(addr).unwrap();

    let request = match passive.eq.sread(WAIT).unwrap() {
        EqEvent::ConnReq(request) => request,
        other => panic!("expected CONNREQ, got {}", other.name()),
    };
    let mut conn = open_conn(&passive.fabric, &passive.eq, &request.info);
    conn.ep.accept().unwrap();

    expect_connected(&passive.eq);
    expect_connected(&client.eq);
    assert_eq!(client.conn.ep.state(), EndpointState::Connected);
    assert_eq!(conn.ep.state(), EndpointState::Connected);

    (client, Server { conn, passive })
}

#[test]
fn message_crosses_loopback() {
    let (mut client, mut server) = connected_pair(&Hints::default(), &Hints::default());

    assert_eq!(server.conn.ep.recv(16, 7).unwrap(), Accepted::Full);
    assert_eq!(client.conn.ep.send(b"hello", 3).unwrap(), Accepted::Full);

    let received = server.conn.rx.sread(WAIT).unwrap();
    assert_eq!(received.context, 7);
    assert_eq!(received.flags, CompletionFlags::RECV);
    assert_eq!(received.len, 5);
    assert_eq!(received.data.as_deref(), Some(&b"hello"[..]));

    let sent = client.conn.tx.sread(WAIT).unwrap();
    assert_eq!(sent.context, 3);
    assert_eq!(sent.flags, CompletionFlags::SEND);
    assert_eq!(sent.len, 5);
}

#[test]
fn send_completes_only_after_peer_posts_receive() {
    let (mut client, mut server) = connected_pair(&Hints::default(), &Hints::default());

    client.conn.ep.send(&[1, 2, 3, 4], 1).unwrap();
    let early = client.conn.tx.sread(Some(Duration::from_millis(100)));
    assert!(matches!(early, Err(TransportError::Again { .. })));

    server.conn.ep.recv(4, 2).unwrap();
    let received = server.conn.rx.sread(WAIT).unwrap();
    let sent = client.conn.tx.sread(WAIT).unwrap();
    assert!(received.completed_at <= sent.completed_at);
}

#[test]
fn completions_follow_post_order() {
    let (mut client, mut server) = connected_pair(&Hints::default(), &Hints::default());

    for context in 0..8u64 {
        server.conn.ep.recv(8, context).unwrap();
    }
    for context in 0..8u64 {
        client.conn.ep.send(&context.to_le_bytes(), 100 + context).unwrap();
    }
    for context in 0..8u64 {
        let received = server.conn.rx.sread(WAIT).unwrap();
        assert_eq!(received.context, context);
        assert_eq!(received.data.as_deref(), Some(&context.to_le_bytes()[..]));
        let sent = client.conn.tx.sread(WAIT).unwrap();
        assert_eq!(sent.context, 100 + context);
    }
}

#[test]
fn oversized_post_is_partially_accepted() {
    let small = Hints::default().with_ep_attr(EpAttr {
        max_msg_size: 100,
        ..EpAttr::default()
    });
    let (mut client, mut server) = connected_pair(&small, &Hints::default());
    assert_eq!(client.conn.ep.max_msg_size(), 100);
    assert_eq!(server.conn.ep.max_msg_size(), 100);

    assert_eq!(server.conn.ep.recv(250, 1).unwrap(), Accepted::Partial(100));
    assert_eq!(
        client.conn.ep.send(&[9u8; 250], 1).unwrap(),
        Accepted::Partial(100)
    );
    assert_eq!(server.conn.rx.sread(WAIT).unwrap().len, 100);
}

#[test]
fn largest_message_fits_one_frame() {
    let huge = Hints::default().with_ep_attr(EpAttr {
        max_msg_size: 32 * 1024 * 1024,
        ..EpAttr::default()
    });
    let (mut client, mut server) = connected_pair(&huge, &huge);
    assert_eq!(client.conn.ep.max_msg_size(), MAX_MSG_SIZE);
    assert_eq!(server.conn.ep.max_msg_size(), MAX_MSG_SIZE);

    let payload = vec![7u8; MAX_MSG_SIZE + 64];
    assert_eq!(
        server.conn.ep.recv(payload.len(), 1).unwrap(),
        Accepted::Partial(MAX_MSG_SIZE)
    );
    assert_eq!(
        client.conn.ep.send(&payload, 1).unwrap(),
        Accepted::Partial(MAX_MSG_SIZE)
    );

    let received = server.conn.rx.sread(WAIT).unwrap();
    assert_eq!(received.len, MAX_MSG_SIZE);
    let sent = client.conn.tx.sread(WAIT).unwrap();
    assert_eq!(sent.len, MAX_MSG_SIZE);
}

#[test]
fn full_transmit_queue_reports_again() {
    let one_slot = Hints::default().with_ep_attr(EpAttr {
        tx_size: 1,
        ..EpAttr::default()
    });
    let (mut client, mut server) = connected_pair(&one_slot, &Hints::default());

    client.conn.ep.send(b"first", 1).unwrap();
    let err = client.conn.ep.send(b"second", 2).unwrap_err();
    assert!(err.is_again());

    server.conn.ep.recv(16, 1).unwrap();
    client.conn.tx.sread(WAIT).unwrap();
    assert_eq!(client.conn.ep.send(b"second", 2).unwrap(), Accepted::Full);
}

#[test]
fn message_longer_than_buffer_is_truncated() {
    let (mut client, mut server) = connected_pair(&Hints::default(), &Hints::default());

    server.conn.ep.recv(4, 5).unwrap();
    client.conn.ep.send(&[0u8; 8], 5).unwrap();

    let err = server.conn.rx.sread(WAIT).unwrap_err();
    assert!(matches!(err, TransportError::ErrorAvailable { .. }));
    let entry = server.conn.rx.readerr().unwrap();
    assert_eq!(entry.err, Errno::Truncated);
    assert_eq!(entry.context, 5);
    assert_eq!(entry.len, 8);
}

#[test]
fn rejected_request_reaches_connector_as_error() {
    let passive = listen(&Hints::default());
    let addr = passive.pep.getname().unwrap();
    let mut client = client(&Hints::default());
    client.conn.ep.connect(addr).unwrap();

    let request = match passive.eq.sread(WAIT).unwrap() {
        EqEvent::ConnReq(request) => request,
        other => panic!("expected CONNREQ, got {}", other.name()),
    };
    passive.pep.reject(request, "no overlap").unwrap();

    let err = client.eq.sread(WAIT).unwrap_err();
    assert!(matches!(err, TransportError::ErrorAvailable { .. }));
    let entry = client.eq.readerr().unwrap();
    assert_eq!(entry.err, Errno::ConnRefused);
    assert_eq!(entry.err_data, b"no overlap");
    assert_eq!(entry.fid, Some(client.conn.ep.id()));
}

#[test]
fn connect_without_listener_is_refused() {
    let addr = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        match probe.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => addr,
            other => panic!("unexpected address {other}"),
        }
    };
    let mut client = client(&Hints::default());
    client.conn.ep.connect(addr).unwrap();

    assert!(matches!(
        client.eq.sread(WAIT),
        Err(TransportError::ErrorAvailable { .. })
    ));
    assert_eq!(client.eq.readerr().unwrap().err, Errno::ConnRefused);
    assert_eq!(client.conn.ep.state(), EndpointState::Enabled);
}

#[test]
fn peer_shutdown_is_reported() {
    let (mut client, server) = connected_pair(&Hints::default(), &Hints::default());

    client.conn.ep.shutdown().unwrap();
    match server.passive.eq.sread(WAIT).unwrap() {
        EqEvent::Shutdown { fid } => assert_eq!(fid, server.conn.ep.id()),
        other => panic!("expected SHUTDOWN, got {}", other.name()),
    }
    assert_eq!(server.conn.ep.state(), EndpointState::ShuttingDown);
}

#[test]
fn dropped_connection_fails_posted_receives() {
    let (mut client, mut server) = connected_pair(&Hints::default(), &Hints::default());

    server.conn.ep.recv(16, 11).unwrap();
    client.conn.ep.close().unwrap();

    assert!(matches!(
        server.conn.rx.sread(WAIT),
        Err(TransportError::ErrorAvailable { .. })
    ));
    let entry = server.conn.rx.readerr().unwrap();
    assert_eq!(entry.err, Errno::ConnReset);
    assert_eq!(entry.context, 11);
}

#[test]
fn endpoint_must_be_enabled_and_connected() {
    let info = getinfo(&Hints::default(), None, None, GetInfoFlags::empty()).unwrap();
    let fabric = Fabric::open(&info).unwrap();
    let domain = Domain::open(&fabric, &info).unwrap();
    let tx = CompletionQueue::open(&domain, CqAttr::default()).unwrap();
    let mut ep = ActiveEndpoint::open(&domain, &info).unwrap();

    let err = ep.recv(4, 0).unwrap_err();
    assert!(matches!(
        err,
        TransportError::InvalidState {
            state: EndpointState::Created,
            ..
        }
    ));

    ep.bind_cq(&tx, BindFlags::TRANSMIT).unwrap();
    assert!(matches!(
        ep.enable(),
        Err(TransportError::InvalidState {
            state: EndpointState::Bound,
            ..
        })
    ));
    assert!(ep.send(b"x", 0).is_err());
}

#[test]
fn teardown_follows_dependency_order() {
    let mut client = client(&Hints::default());

    let violation = client.conn.domain.close().unwrap_err();
    assert!(matches!(
        violation,
        TransportError::TeardownOrderViolation {
            object: FidKind::Domain,
            ..
        }
    ));
    assert!(client.conn.tx.close().is_err());
    assert!(client.eq.close().is_err());
    assert!(client.fabric.close().is_err());

    client.conn.ep.close().unwrap();
    client.conn.tx.close().unwrap();
    client.conn.rx.close().unwrap();
    client.conn.domain.close().unwrap();
    client.eq.close().unwrap();
    client.fabric.close().unwrap();
    client.conn.ep.close().unwrap();
}

#[test]
fn passive_endpoint_pins_event_queue() {
    let mut passive = listen(&Hints::default());

    assert!(matches!(
        passive.eq.close(),
        Err(TransportError::TeardownOrderViolation {
            object: FidKind::EventQueue,
            open: 1
        })
    ));
    passive.pep.close().unwrap();
    passive.eq.close().unwrap();
    passive.fabric.close().unwrap();
}
