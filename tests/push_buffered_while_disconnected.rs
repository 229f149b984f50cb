mod common;

use common::single_transport;
use phoenix_channel::{Endpoint, SocketBuilder};
use serde_json::json;

/// A push submitted before the socket ever connects is buffered, not lost,
/// and reaches the transport in submission order once the channel joins.
#[tokio::test]
async fn buffered_push_flushes_after_join() {
    let (factory, mut server) = single_transport();
    let endpoint = Endpoint::parse("ws://example.com").unwrap();
    let socket = SocketBuilder::new(endpoint).transport_factory(factory).build();

    let channel = socket.channel("rooms:lobby", json!({}));
    let _join = channel.join(None);
    let _push = channel.push("e", json!({"x": 1}), None);

    // Nothing written yet: the socket hasn't connected.
    assert!(server.try_recv().is_none());

    socket.connect();

    let join_frame = server.recv().await;
    assert_eq!(join_frame[3], "phx_join");
    let join_ref = join_frame[1].as_str().unwrap().to_owned();

    server.send(json!([null, join_ref, "rooms:lobby", "phx_reply", {"status": "ok", "response": {}}]));

    let push_frame = server.recv().await;
    assert_eq!(push_frame[3], "e");
    assert_eq!(push_frame[4], json!({"x": 1}));
}
