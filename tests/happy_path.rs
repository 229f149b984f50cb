mod common;

use common::single_transport;
use phoenix_channel::{ChannelState, Endpoint, SocketBuilder};
use serde_json::json;

#[tokio::test]
async fn join_then_push_then_reply() {
    let (factory, mut server) = single_transport();
    let endpoint = Endpoint::parse("ws://example.com").unwrap();
    let socket = SocketBuilder::new(endpoint).transport_factory(factory).build();
    socket.connect();

    let channel = socket.channel("rooms:lobby", json!({"one": "two"}));
    let join = channel.join(None);

    let join_frame = server.recv().await;
    assert_eq!(join_frame[2], "rooms:lobby");
    assert_eq!(join_frame[3], "phx_join");
    assert_eq!(join_frame[4], json!({"one": "two"}));
    let join_ref = join_frame[1].as_str().unwrap().to_owned();
    assert_eq!(join_frame[0].as_str().unwrap(), join_ref); // join frame's join_ref == its own ref

    server.send(json!([null, join_ref, "rooms:lobby", "phx_reply", {"status": "ok", "response": {}}]));
    join.await.unwrap();
    assert_eq!(channel.state(), ChannelState::Joined);

    let push = channel.push("new_msg", json!({"body": "hi"}), None);
    let push_frame = server.recv().await;
    assert_eq!(push_frame[0].as_str().unwrap(), join_ref); // non-lifecycle frame still carries join_ref
    assert_eq!(push_frame[3], "new_msg");
    assert_eq!(push_frame[4], json!({"body": "hi"}));

    let push_ref = push_frame[1].as_str().unwrap().to_owned();
    server.send(json!([
        null,
        push_ref,
        "rooms:lobby",
        "phx_reply",
        {"status": "ok", "response": {"ack": true}}
    ]));

    let response = push.await.unwrap();
    assert_eq!(response, json!({"ack": true}));
}
