mod common;

use std::time::Duration;

use common::single_transport;
use phoenix_channel::{Endpoint, PushError, SocketBuilder};
use serde_json::json;

/// A push with no reply within its timeout resolves to `PushError::Timeout`,
/// and a reply that arrives after the fact can no longer change the outcome.
#[tokio::test(start_paused = true)]
async fn push_without_reply_times_out() {
    let (factory, mut server) = single_transport();
    let endpoint = Endpoint::parse("ws://example.com").unwrap();
    let socket = SocketBuilder::new(endpoint).transport_factory(factory).build();
    socket.connect();

    let channel = socket.channel("t", json!({}));
    let join = channel.join(None);
    let frame = server.recv().await;
    let join_ref = frame[1].as_str().unwrap().to_owned();
    server.send(json!([null, join_ref, "t", "phx_reply", {"status": "ok", "response": {}}]));
    join.await.unwrap();

    let push = channel.push("e", json!({}), Some(Duration::from_millis(100)));
    let push_frame = server.recv().await;
    assert_eq!(push_frame[3], "e");

    let result = push.await;
    assert!(matches!(
        result,
        Err(PushError::Timeout { event, .. }) if event == "e"
    ));
}
