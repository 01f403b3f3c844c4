//! Memory relay and WebSocket channel behaviour

use classcall_core::{SessionDescription, SessionId, SignalingMessage, UserId};
use classcall_signaling::{ChannelConnector, ChannelEvent, MemoryRelay, SignalingChannel, WebSocketConnector};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

async fn next_event(channel: &mut SignalingChannel) -> ChannelEvent {
    timeout(Duration::from_secs(2), channel.recv())
        .await
        .expect("timed out waiting for channel event")
        .expect("channel dropped")
}

async fn next_message(channel: &mut SignalingChannel) -> SignalingMessage {
    match next_event(channel).await {
        ChannelEvent::Message(message) => message,
        other => panic!("expected message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_relay_presence_and_fanout() {
    let relay = MemoryRelay::new();
    let session = SessionId::from(1);
    let host = UserId::from(10);
    let guest = UserId::from(20);

    let mut host_channel = relay.connect(&session, &host).await.unwrap();
    assert_eq!(next_event(&mut host_channel).await, ChannelEvent::Open);
    assert_eq!(
        next_message(&mut host_channel).await,
        SignalingMessage::Peers {
            peers: vec![host.clone()]
        }
    );
    assert_eq!(
        next_message(&mut host_channel).await,
        SignalingMessage::Join { user: host.clone() }
    );

    let mut guest_channel = relay.connect(&session, &guest).await.unwrap();
    assert_eq!(next_event(&mut guest_channel).await, ChannelEvent::Open);
    assert_eq!(
        next_message(&mut guest_channel).await,
        SignalingMessage::Peers {
            peers: vec![host.clone(), guest.clone()]
        }
    );
    assert_eq!(
        next_message(&mut guest_channel).await,
        SignalingMessage::Join { user: guest.clone() }
    );
    assert_eq!(
        next_message(&mut host_channel).await,
        SignalingMessage::Join { user: guest.clone() }
    );

    // Frames reach every member, the sender included
    let offer = SignalingMessage::Offer {
        offer: SessionDescription::offer("v=0\r\n"),
        user: host.clone(),
        recipient_id: Some(guest.clone()),
    };
    host_channel.sender().send(offer.clone());
    assert_eq!(next_message(&mut guest_channel).await, offer);
    assert_eq!(next_message(&mut host_channel).await, offer);
    assert_eq!(relay.history(&session), vec![offer]);

    guest_channel.sender().close();
    assert!(matches!(
        next_event(&mut guest_channel).await,
        ChannelEvent::Closed { .. }
    ));
    assert_eq!(
        next_message(&mut host_channel).await,
        SignalingMessage::Leave { user: guest }
    );
    assert_eq!(relay.members(&session), vec![host]);
}

#[tokio::test]
async fn test_relay_drops_malformed_frames() {
    let relay = MemoryRelay::new();
    let session = SessionId::new("room-call");
    let mut channel = relay.join(&session, &UserId::new("alice"));
    next_event(&mut channel).await;
    next_message(&mut channel).await;
    next_message(&mut channel).await;

    relay.inject_raw(&session, "{not json");
    relay.inject_raw(&session, r#"{"action":"share_screen","status":true}"#);
    relay.inject_raw(&session, r#"{"action":"camera_status","user":3,"status":false}"#);

    assert_eq!(
        next_message(&mut channel).await,
        SignalingMessage::CameraStatus {
            user: UserId::from(3),
            status: false
        }
    );
}

#[tokio::test]
async fn test_relay_session_close_is_terminal() {
    let relay = MemoryRelay::new();
    let session = SessionId::from(9);
    let mut channel = relay.join(&session, &UserId::from(1));
    next_event(&mut channel).await;
    next_message(&mut channel).await;
    next_message(&mut channel).await;

    relay.close_session(&session, "server shutting down");
    assert_eq!(
        next_event(&mut channel).await,
        ChannelEvent::Closed {
            reason: "server shutting down".to_string()
        }
    );
    assert!(relay.members(&session).is_empty());
}

#[tokio::test]
async fn test_websocket_channel_round_trip() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = accept_async(stream).await.unwrap();

        let first = socket.next().await.unwrap().unwrap();
        let received = match first {
            Message::Text(text) => SignalingMessage::from_json(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        };

        socket.send(Message::Text("garbage".to_string())).await.unwrap();
        socket
            .send(Message::Text(r#"{"action":"join","user":5}"#.to_string()))
            .await
            .unwrap();
        socket.close(None).await.unwrap();
        received
    });

    let connector = WebSocketConnector::new(&format!("ws://{addr}"), Some("secret".to_string())).unwrap();
    let mut channel = connector
        .connect(&SessionId::from(4), &UserId::from(7))
        .await
        .unwrap();
    assert_eq!(next_event(&mut channel).await, ChannelEvent::Open);

    channel.sender().send(SignalingMessage::ToggleMic {
        status: false,
        user: None,
    });
    assert_eq!(
        next_message(&mut channel).await,
        SignalingMessage::Join {
            user: UserId::from(5)
        }
    );
    assert!(matches!(
        next_event(&mut channel).await,
        ChannelEvent::Closed { .. }
    ));

    let received = server.await.unwrap();
    assert_eq!(
        received,
        SignalingMessage::ToggleMic {
            status: false,
            user: None
        }
    );
}
