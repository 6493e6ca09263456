//! Backend selection, pooling and failure handling.

use plexus_relay::{
    BackendId, DuplexPort, Peer, RelayError, Session, SessionConfig, Segment,
};
use plexus_testing::{Call, Framing, RecordingConnector, ScriptedProtocol, SharedPort};

type TestSession = Session<ScriptedProtocol, RecordingConnector>;

fn id(raw: u32) -> BackendId {
    BackendId::new(raw).unwrap()
}

fn start(protocol: ScriptedProtocol, connector: RecordingConnector) -> (TestSession, SharedPort) {
    start_with(protocol, connector, SessionConfig::default())
}

fn start_with(
    protocol: ScriptedProtocol,
    connector: RecordingConnector,
    config: SessionConfig,
) -> (TestSession, SharedPort) {
    let frontend = SharedPort::new(1024, 1024);
    let session = Session::new(frontend.clone(), protocol, connector, config);
    (session, frontend)
}

fn echo(frame: usize) -> ScriptedProtocol {
    ScriptedProtocol::new(Framing::handle(frame), Framing::handle(frame))
}

fn backend_port(session: &TestSession, raw: u32) -> SharedPort {
    session.connector().port(id(raw)).unwrap()
}

#[test]
fn same_endpoint_reuses_backend() {
    let (mut session, frontend) = start(echo(2).unpinned(), RecordingConnector::new("a:1"));

    frontend.push_input(b"aabb");
    session.readable(Peer::Frontend);
    assert_eq!(session.backend_ids(), vec![id(1)]);

    // The second frame waits for the first to reach the backend.
    assert_eq!(session.protocol().fed(Peer::Frontend).len(), 1);
    session.connected(id(1));

    assert_eq!(backend_port(&session, 1).take_output(), b"aabb");
    assert_eq!(session.backend_ids(), vec![id(1)]);
    assert_eq!(session.connector().opened().len(), 1);
    assert_eq!(session.stats().backends_opened, 1);
    assert_eq!(session.stats().backends_reused, 1);
    assert_eq!(
        session.protocol().count(|call| *call == Call::Selected(id(1))),
        2
    );
    assert_eq!(
        session.protocol().count(|call| matches!(call, Call::Connected(_))),
        1
    );
}

#[test]
fn different_endpoint_opens_new_backend() {
    let (mut session, frontend) = start(echo(2).unpinned(), RecordingConnector::new("a:1"));

    frontend.push_input(b"aa");
    session.readable(Peer::Frontend);
    session.connected(id(1));

    session.connector_mut().set_endpoint(Some("b:1"));
    frontend.push_input(b"bb");
    session.readable(Peer::Frontend);

    assert_eq!(session.backend_ids(), vec![id(1), id(2)]);
    assert_eq!(session.backend(id(2)).unwrap().endpoint(), "b:1");
    assert_eq!(backend_port(&session, 2).output_used(), 0);

    session.connected(id(2));
    assert_eq!(backend_port(&session, 1).take_output(), b"aa");
    assert_eq!(backend_port(&session, 2).take_output(), b"bb");
}

#[test]
fn pinned_backend_skips_selection() {
    let (mut session, frontend) = start(echo(2), RecordingConnector::new("a:1"));

    frontend.push_input(b"aabbcc");
    session.readable(Peer::Frontend);
    session.connected(id(1));

    assert_eq!(backend_port(&session, 1).take_output(), b"aabbcc");
    assert_eq!(session.stats().backends_reused, 0);
    assert_eq!(
        session.protocol().count(|call| matches!(call, Call::Selected(_))),
        1
    );
}

#[test]
fn greeting_precedes_first_message() {
    let protocol = echo(2).with_greeting(b"HELLO");
    let (mut session, frontend) = start(protocol, RecordingConnector::new("a:1"));

    frontend.push_input(b"aa");
    session.readable(Peer::Frontend);
    session.connected(id(1));

    assert_eq!(backend_port(&session, 1).take_output(), b"HELLOaa");
    assert_eq!(
        session.protocol().calls(),
        &[
            Call::NewSub(Peer::Frontend),
            Call::Feed(Peer::Frontend, bytes::Bytes::from_static(b"aa")),
            Call::NewSub(Peer::Backend(id(1))),
            Call::Connected(id(1)),
            Call::Selected(id(1)),
        ]
    );
}

#[test]
fn consumed_frame_still_opens_backend() {
    let protocol = echo(3).swallowing(b"PRI").with_greeting(b"HELLO");
    let (mut session, frontend) = start(protocol, RecordingConnector::new("a:1"));

    frontend.push_input(b"PRI");
    session.readable(Peer::Frontend);

    assert_eq!(session.backend_ids(), vec![id(1)]);
    assert_eq!(session.protocol().count(|call| *call == Call::Connected(id(1))), 1);
    assert_eq!(session.protocol().count(|call| *call == Call::Selected(id(1))), 1);

    session.connected(id(1));
    let backend = backend_port(&session, 1);
    assert_eq!(backend.take_output(), b"HELLO");

    frontend.push_input(b"abc");
    session.readable(Peer::Frontend);
    assert_eq!(backend.take_output(), b"abc");
    assert_eq!(session.backend_count(), 1);
}

#[test]
fn no_endpoint_drops_message_and_keeps_session() {
    let (mut session, frontend) = start(echo(2), RecordingConnector::refusing());

    frontend.push_input(b"aabb");
    session.readable(Peer::Frontend);

    assert!(!session.is_closed());
    assert_eq!(session.backend_count(), 0);
    assert_eq!(session.stats().messages_dropped, 2);
    assert_eq!(frontend.input_used(), 0);

    session.connector_mut().set_endpoint(Some("a:1"));
    frontend.push_input(b"cc");
    session.readable(Peer::Frontend);
    session.connected(id(1));

    assert_eq!(backend_port(&session, 1).take_output(), b"cc");
}

#[test]
fn no_endpoint_in_proxy_mode_closes_session() {
    let protocol = ScriptedProtocol::new(Framing::proxy(10), Framing::handle(1));
    let (mut session, frontend) = start(protocol, RecordingConnector::refusing());

    frontend.push_input(b"xyz");
    session.readable(Peer::Frontend);

    assert!(session.is_closed());
    assert!(matches!(session.close_reason(), Some(RelayError::NoEndpoint)));
    assert_eq!(frontend.close_count(), 1);
}

#[test]
fn table_full_drops_message() {
    let config = SessionConfig {
        max_backends: 1,
        ..SessionConfig::default()
    };
    let (mut session, frontend) =
        start_with(echo(2).unpinned(), RecordingConnector::new("a:1"), config);

    frontend.push_input(b"aa");
    session.readable(Peer::Frontend);
    session.connected(id(1));

    session.connector_mut().set_endpoint(Some("b:1"));
    frontend.push_input(b"bb");
    session.readable(Peer::Frontend);

    assert!(!session.is_closed());
    assert_eq!(session.backend_ids(), vec![id(1)]);
    assert_eq!(session.stats().messages_dropped, 1);

    // Same endpoint still resolves to the pooled backend.
    session.connector_mut().set_endpoint(Some("a:1"));
    frontend.push_input(b"cc");
    session.readable(Peer::Frontend);
    assert_eq!(backend_port(&session, 1).take_output(), b"aacc");
}

#[test]
fn connect_failure_closes_session() {
    let (mut session, frontend) = start(echo(2), RecordingConnector::new("a:1").failing());

    frontend.push_input(b"aa");
    session.readable(Peer::Frontend);

    assert!(session.is_closed());
    match session.close_reason() {
        Some(RelayError::Connect { endpoint, .. }) => assert_eq!(endpoint, "a:1"),
        other => panic!("unexpected close reason: {other:?}"),
    }
    assert!(frontend.is_closed());
}

#[test]
fn writes_wait_for_connection() {
    let (mut session, frontend) = start(echo(2), RecordingConnector::new("a:1"));

    frontend.push_input(b"aa");
    session.readable(Peer::Frontend);
    session.writable(Peer::Backend(id(1)));

    let backend = session.backend(id(1)).unwrap();
    assert!(!backend.is_connected());
    assert_eq!(backend.to_backend().current().map(Segment::pending), Some(2));
    assert_eq!(backend_port(&session, 1).output_used(), 0);

    session.connected(id(1));
    assert!(session.backend(id(1)).unwrap().is_connected());
    assert!(session.backend(id(1)).unwrap().to_backend().is_empty());
}

#[test]
fn events_for_unknown_backend_are_ignored() {
    let (mut session, frontend) = start(echo(2), RecordingConnector::new("a:1"));

    session.readable(Peer::Backend(id(7)));
    session.writable(Peer::Backend(id(7)));
    session.connected(id(7));

    assert!(!session.is_closed());
    assert!(!frontend.is_closed());
}
