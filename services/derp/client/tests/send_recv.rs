mod common;

use common::{next_packet, spawn_reader, TestRelay};
use derp_wire::{Message, NodePrivate, PeerGoneReason};
use std::time::Duration;

#[tokio::test]
async fn test_send_recv_between_three_clients() {
    let relay = TestRelay::new();
    let keys: Vec<NodePrivate> = (0..3).map(|_| NodePrivate::generate()).collect();
    let clients: Vec<_> = keys.iter().map(|key| relay.client(key.clone())).collect();

    for client in &clients {
        client.connect().await.unwrap();
        assert_eq!(client.server_public_key(), Some(relay.public_key()));
    }

    let mut readers: Vec<_> = clients.iter().map(|c| spawn_reader(c.clone())).collect();
    for reader in readers.iter_mut() {
        assert!(matches!(reader.recv().await, Some(Ok(Message::ServerInfo(_)))));
    }

    clients[0]
        .send(&keys[1].public(), b"hello 0->1\n")
        .await
        .unwrap();
    let (source, data) = next_packet(&mut readers[1]).await;
    assert_eq!(source, keys[0].public());
    assert_eq!(&data[..], b"hello 0->1\n");

    clients[1]
        .send(&keys[2].public(), b"hello 1->2\n")
        .await
        .unwrap();
    let (source, data) = next_packet(&mut readers[2]).await;
    assert_eq!(source, keys[1].public());
    assert_eq!(&data[..], b"hello 1->2\n");

    // Nobody wrote to client 0
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(readers[0].try_recv().is_err());
    assert!(readers[2].try_recv().is_err());

    for client in &clients {
        client.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_send_to_absent_peer_reports_not_here() {
    let relay = TestRelay::new();
    let client = relay.client(NodePrivate::generate());
    client.connect().await.unwrap();
    let mut reader = spawn_reader(client.clone());

    let absent = NodePrivate::generate().public();
    client.send(&absent, b"anyone?").await.unwrap();

    loop {
        match reader.recv().await {
            Some(Ok(Message::PeerGone { key, reason })) => {
                assert_eq!(key, absent);
                assert_eq!(reason, PeerGoneReason::NotHere);
                break;
            }
            Some(Ok(_)) => continue,
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_forward_packet_from_mesh_peer() {
    let relay = TestRelay::with_mesh_key("1234");
    let mesh_key = NodePrivate::generate();
    let mesh = relay.watcher(mesh_key, "1234");
    let target_key = NodePrivate::generate();
    let target = relay.client(target_key.clone());

    mesh.connect().await.unwrap();
    target.connect().await.unwrap();
    let mut reader = spawn_reader(target.clone());

    let origin = NodePrivate::generate().public();
    mesh.forward_packet(&origin, &target_key.public(), b"forwarded")
        .await
        .unwrap();

    let (source, data) = next_packet(&mut reader).await;
    assert_eq!(source, origin);
    assert_eq!(&data[..], b"forwarded");
}
