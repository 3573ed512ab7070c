//! WebSocket protocol tests over real connections: fan-out, join
//! backfill, presence events, newcomer announcements and delete
//! propagation.

mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use common::{TestServer, ADMIN_PASSWORD, ADMIN_USER};

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

async fn connect_ws(server: &TestServer, token: &str) -> Ws {
    let url = format!("ws://{}/api/chat", server.api_addr);
    let mut request = url.into_client_request().expect("ws request");
    request
        .headers_mut()
        .insert("token", token.parse().expect("token header"));
    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("ws connect");
    ws
}

/// Read frames until one satisfies `predicate`; unrelated events (e.g.
/// interleaved presence updates) are skipped.
async fn wait_for(ws: &mut Ws, predicate: impl Fn(&serde_json::Value) -> bool) -> serde_json::Value {
    for _ in 0..50 {
        let message = tokio::time::timeout(EVENT_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("ws error");
        if let Message::Text(text) = message {
            let event: serde_json::Value = serde_json::from_str(&text).expect("event json");
            if predicate(&event) {
                return event;
            }
        }
    }
    panic!("event did not arrive");
}

/// Assert that no text frame arrives within a short window.
async fn expect_silence(ws: &mut Ws) {
    let result = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    if let Ok(Some(Ok(Message::Text(text)))) = result {
        panic!("unexpected event: {text}");
    }
}

async fn send_chat(ws: &mut Ws, chat_id: &str, content: &str) {
    let frame = serde_json::json!({
        "type": "send",
        "chatId": chat_id,
        "content": content,
    });
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}

async fn join_chat(ws: &mut Ws, chat_id: &str) {
    let frame = serde_json::json!({ "type": "join", "chatId": chat_id });
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("join frame");
}

async fn user_id_of(server: &TestServer, token: &str) -> String {
    let me: serde_json::Value = server
        .get_authed("/api/me", token)
        .await
        .json()
        .await
        .expect("me body");
    me["id"].as_str().expect("user id").to_string()
}

/// The upgrade response races the server-side actor registration; poll the
/// roster until the hub reports the user online before depending on
/// fan-out.
async fn await_online(server: &TestServer, token: &str, user_id: &str) {
    for _ in 0..100 {
        let users: serde_json::Value = server
            .get_authed("/api/users", token)
            .await
            .json()
            .await
            .expect("roster");
        let online = users
            .as_array()
            .unwrap()
            .iter()
            .any(|u| u["id"] == user_id && u["presence"]["online"] == true);
        if online {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("user {user_id} never came online");
}

#[tokio::test]
async fn ws_requires_a_valid_token() {
    let server = TestServer::start().await;
    let url = format!("ws://{}/api/chat", server.api_addr);
    let mut request = url.into_client_request().unwrap();
    request
        .headers_mut()
        .insert("token", "bogus".parse().unwrap());
    let result = tokio_tungstenite::connect_async(request).await;
    assert!(result.is_err(), "upgrade must be refused");
}

#[tokio::test]
async fn send_fans_out_and_join_backfills() {
    let server = TestServer::start().await;
    let (t1, _) = server.register("u1", "pw").await;
    let (t2, _) = server.register("u2", "pw").await;
    let u2 = user_id_of(&server, &t2).await;

    let u1 = user_id_of(&server, &t1).await;
    let mut ws1 = connect_ws(&server, &t1).await;
    await_online(&server, &t1, &u1).await;
    let mut ws2 = connect_ws(&server, &t2).await;

    // u1 learns that u2 came online.
    wait_for(&mut ws1, |e| e["type"] == "online" && e["userId"] == u2.as_str()).await;

    for i in 1..=3 {
        send_chat(&mut ws1, "townhall", &format!("msg {i}")).await;
    }

    // Both members see the live records, in seq order.
    for expected_seq in 1..=3 {
        let event = wait_for(&mut ws2, |e| e["type"] == "messages").await;
        assert_eq!(event["chatId"], "townhall");
        assert_eq!(event["messages"][0]["seq"], expected_seq);
        assert_eq!(
            event["messages"][0]["content"],
            format!("msg {expected_seq}")
        );
    }
    for expected_seq in 1..=3 {
        let event = wait_for(&mut ws1, |e| e["type"] == "messages").await;
        assert_eq!(event["messages"][0]["seq"], expected_seq);
    }

    // An explicit join replays history to the sender only.
    join_chat(&mut ws2, "townhall").await;
    let backfill = wait_for(&mut ws2, |e| e["type"] == "messages").await;
    let messages = backfill["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(
        messages.iter().map(|m| m["seq"].as_i64().unwrap()).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    expect_silence(&mut ws1).await;
}

#[tokio::test]
async fn dm_messages_reach_only_the_two_parties() {
    let server = TestServer::start().await;
    let (t1, _) = server.register("u1", "pw").await;
    let (t2, _) = server.register("u2", "pw").await;
    let (t3, _) = server.register("u3", "pw").await;
    let u1 = user_id_of(&server, &t1).await;
    let u2 = user_id_of(&server, &t2).await;

    let u3 = user_id_of(&server, &t3).await;
    let mut ws1 = connect_ws(&server, &t1).await;
    let mut ws2 = connect_ws(&server, &t2).await;
    let mut ws3 = connect_ws(&server, &t3).await;
    for id in [&u1, &u2, &u3] {
        await_online(&server, &t1, id).await;
    }

    let dm = besedka_server::hub::dm_id(&u1, &u2);
    send_chat(&mut ws1, &dm, "private").await;

    let event = wait_for(&mut ws2, |e| e["type"] == "messages").await;
    assert_eq!(event["chatId"], dm.as_str());
    assert_eq!(event["messages"][0]["content"], "private");

    expect_silence(&mut ws3).await;

    // A third party writing into the DM is silently dropped.
    send_chat(&mut ws3, &dm, "intrusion").await;
    expect_silence(&mut ws2).await;
}

#[tokio::test]
async fn attachments_travel_with_the_message() {
    let server = TestServer::start().await;
    let (t1, _) = server.register("u1", "pw").await;
    let (t2, _) = server.register("u2", "pw").await;
    let u1 = user_id_of(&server, &t1).await;

    let mut ws1 = connect_ws(&server, &t1).await;
    await_online(&server, &t1, &u1).await;
    let mut ws2 = connect_ws(&server, &t2).await;
    wait_for(&mut ws1, |e| e["type"] == "online").await;

    let frame = serde_json::json!({
        "type": "send",
        "chatId": "townhall",
        "content": "see photo",
        "attachments": [{
            "type": "image",
            "name": "cat.png",
            "mimeType": "image/png",
            "fileId": "f-123",
        }],
    });
    ws1.send(Message::Text(frame.to_string().into()))
        .await
        .expect("send frame");

    let event = wait_for(&mut ws2, |e| e["type"] == "messages").await;
    let message = &event["messages"][0];
    assert_eq!(message["content"], "see photo");
    assert_eq!(message["attachments"][0]["type"], "image");
    assert_eq!(message["attachments"][0]["fileId"], "f-123");

    // Survives the durable path: an explicit join replays it intact.
    join_chat(&mut ws2, "townhall").await;
    let backfill = wait_for(&mut ws2, |e| e["type"] == "messages").await;
    assert_eq!(
        backfill["messages"][0]["attachments"][0]["mimeType"],
        "image/png"
    );
}

#[tokio::test]
async fn presence_events_follow_connections() {
    let server = TestServer::start().await;
    let (t1, _) = server.register("u1", "pw").await;
    let (t2, _) = server.register("u2", "pw").await;
    let u2 = user_id_of(&server, &t2).await;

    let u1 = user_id_of(&server, &t1).await;
    let mut ws1 = connect_ws(&server, &t1).await;
    await_online(&server, &t1, &u1).await;
    let mut ws2 = connect_ws(&server, &t2).await;

    wait_for(&mut ws1, |e| e["type"] == "online" && e["userId"] == u2.as_str()).await;

    ws2.close(None).await.expect("close");
    wait_for(&mut ws1, |e| e["type"] == "offline" && e["userId"] == u2.as_str()).await;

    // The roster reflects it.
    let users: serde_json::Value = server
        .get_authed("/api/users", &t1)
        .await
        .json()
        .await
        .unwrap();
    let entry = users
        .as_array()
        .unwrap()
        .iter()
        .find(|u| u["id"] == u2.as_str())
        .unwrap();
    assert_eq!(entry["presence"]["online"], false);
}

#[tokio::test]
async fn registration_announces_the_newcomer() {
    let server = TestServer::start().await;
    let (t1, _) = server.register("u1", "pw").await;
    let u1 = user_id_of(&server, &t1).await;

    let mut ws1 = connect_ws(&server, &t1).await;
    await_online(&server, &t1, &u1).await;

    let (t2, _) = server.register("newbie", "pw").await;
    let u2 = user_id_of(&server, &t2).await;

    let event = wait_for(&mut ws1, |e| e["type"] == "new").await;
    assert_eq!(event["user"]["id"], u2.as_str());
    assert_eq!(event["chat"]["id"], besedka_server::hub::dm_id(&u1, &u2));
    assert_eq!(event["chat"]["isDm"], true);

    // The DM is immediately usable in both chat lists.
    let chats: serde_json::Value = server
        .get_authed("/api/chats", &t1)
        .await
        .json()
        .await
        .unwrap();
    let chats = chats.as_array().unwrap();
    assert_eq!(chats[0]["id"], "townhall");
    assert!(chats
        .iter()
        .any(|c| c["id"] == besedka_server::hub::dm_id(&u1, &u2)));
}

#[tokio::test]
async fn admin_delete_propagates_everywhere() {
    let server = TestServer::start().await;
    let (t1, _) = server.register("u1", "pw").await;
    let (t2, _) = server.register("u2", "pw").await;
    let (t3, _) = server.register("u3", "pw").await;
    let u1 = user_id_of(&server, &t1).await;
    let u2 = user_id_of(&server, &t2).await;
    let u3 = user_id_of(&server, &t3).await;

    let mut ws1 = connect_ws(&server, &t1).await;
    let mut ws2 = connect_ws(&server, &t2).await;
    let mut ws3 = connect_ws(&server, &t3).await;
    for id in [&u1, &u2, &u3] {
        await_online(&server, &t2, id).await;
    }
    wait_for(&mut ws2, |e| e["type"] == "online" && e["userId"] == u3.as_str()).await;

    let response = server
        .client
        .delete(server.admin_url("/admin/users"))
        .basic_auth(ADMIN_USER, Some(ADMIN_PASSWORD))
        .query(&[("id", u1.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Exactly one deleted event per surviving user.
    for ws in [&mut ws2, &mut ws3] {
        let event = wait_for(ws, |e| e["type"] == "deleted").await;
        assert_eq!(event["userId"], u1.as_str());
        expect_silence(ws).await;
    }

    // The deleted user's socket is closed by the server.
    let closed = tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match ws1.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "deleted user's connection must close");

    // DMs involving u1 are gone; the surviving DM stays.
    let chats: serde_json::Value = server
        .get_authed("/api/chats", &t2)
        .await
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = chats
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"townhall"));
    assert!(ids.contains(&besedka_server::hub::dm_id(&u2, &u3).as_str()));
    assert!(!ids.iter().any(|id| id.contains(u1.as_str())));
}
