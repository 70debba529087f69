//! Integration tests for the relay server
//!
//! These tests drive the public APIs of both crates together: datagram framing
//! across wraparound, input merging through the registry on real threads, and
//! a full handshake and login against a running server over UDP.

use protocol::{pack, unpack, Body, ConnectMessage, Message};
use server::config::{GameConfig, ServerConfig};
use server::error::RoomError;
use server::events::{DesyncReason, EventReceiver, Events, ServerEvent};
use server::registry::Registry;
use server::UserId;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// FRAMING TESTS
mod framing_tests {
    use super::*;

    fn chat(number: u16, text: &str) -> Message {
        Message::new(
            number,
            Body::ChatRequest {
                message: text.to_string(),
            },
        )
        .unwrap()
    }

    /// A sender's window repeated across datagrams yields each message once
    #[test]
    fn repeated_window_delivers_each_message_once() {
        let mut window: VecDeque<Message> = VecDeque::new();
        let mut last_accepted = 0xFFFF;
        let mut received = Vec::new();

        for number in 0..20u16 {
            window.push_front(chat(number, &format!("line {number}")));
            window.truncate(6);
            let datagram = pack(window.make_contiguous(), 1024);

            for message in unpack(&datagram, last_accepted).unwrap() {
                last_accepted = message.number;
                received.push(message.number);
            }
        }

        assert_eq!(received, (0..20).collect::<Vec<u16>>());
    }

    /// Losing datagrams is recovered by the next one while the window covers the gap
    #[test]
    fn lost_datagrams_recovered_across_wraparound() {
        let mut window: VecDeque<Message> = VecDeque::new();
        let mut last_accepted = 0xFFFA;
        let mut received = Vec::new();

        let numbers: Vec<u16> = (0xFFFBu16..=0xFFFF).chain(0..6).collect();
        for (i, &number) in numbers.iter().enumerate() {
            window.push_front(chat(number, "x"));
            window.truncate(6);
            // Every third datagram is lost in transit.
            if i % 3 == 1 {
                continue;
            }
            let datagram = pack(window.make_contiguous(), 1024);
            for message in unpack(&datagram, last_accepted).unwrap() {
                last_accepted = message.number;
                received.push(message.number);
            }
        }

        assert_eq!(received, numbers);
    }

    /// A datagram made only of seen messages produces nothing
    #[test]
    fn stale_datagram_is_empty() {
        let messages = vec![chat(9, "b"), chat(8, "a")];
        let datagram = pack(&messages, 1024);
        assert!(unpack(&datagram, 9).unwrap().is_empty());
    }

    /// Garbage on the wire is rejected rather than partially applied
    #[test]
    fn corrupted_datagrams_rejected() {
        let datagram = pack(&[chat(0, "hello")], 1024);

        let truncated = &datagram[..datagram.len() - 2];
        assert!(unpack(truncated, 0xFFFF).is_err());

        let mut bad_count = datagram.clone();
        bad_count[0] = 0;
        assert!(unpack(&bad_count, 0xFFFF).is_err());

        assert!(unpack(&[], 0xFFFF).is_err());
    }
}

/// SYNCHRONIZATION TESTS
mod sync_tests {
    use super::*;

    fn registry(game: GameConfig) -> (Arc<Registry>, EventReceiver) {
        let (events, rx) = Events::channel();
        let config = ServerConfig {
            game,
            ..ServerConfig::default()
        };
        (Arc::new(Registry::new(config, events)), rx)
    }

    fn fast_game() -> GameConfig {
        GameConfig {
            timeout_millis: 20,
            scan_workers: 1,
            ..GameConfig::default()
        }
    }

    fn logged_in(registry: &Registry, name: &str, connection_type: u8) -> UserId {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let id = registry.add_user(addr).unwrap();
        registry
            .login(id, name.into(), "emu".into(), connection_type, 30)
            .unwrap();
        id
    }

    /// Seats `players` users in one room and brings it to Playing
    fn playing_room(registry: &Registry, players: usize, connection_type: u8) -> Vec<UserId> {
        let ids: Vec<UserId> = (0..players)
            .map(|i| logged_in(registry, &format!("p{i}"), connection_type))
            .collect();
        let room = registry.create_room(ids[0], "Game".into()).unwrap();
        for &id in &ids[1..] {
            registry.join_room(id, room.id(), connection_type).unwrap();
        }
        let (_, info) = registry.start_room(ids[0]).unwrap();
        assert_eq!(info.num_players, players);

        let mut all_ready = false;
        for &id in &ids {
            all_ready = registry.ready_seat(id).unwrap().1;
        }
        assert!(all_ready);
        ids
    }

    fn drain(rx: &mut EventReceiver) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Every seat receives the same merged steps, in seat order
    #[test]
    fn threads_receive_identical_merged_steps() {
        let (registry, _rx) = registry(fast_game());
        let ids = playing_room(&registry, 3, 1);

        let handles: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(seat, &id)| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    (0..50u8)
                        .map(|step| {
                            registry
                                .submit_input(id, &[seat as u8 + 1, step])
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<Vec<u8>>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for step in 0..50u8 {
            let expected = vec![1, step, 2, step, 3, step];
            for seat in &results {
                assert_eq!(seat[step as usize], expected);
            }
        }
    }

    /// Multi-frame messages merge frame by frame, seats side by side
    #[test]
    fn multi_frame_messages_merge() {
        let (registry, _rx) = registry(fast_game());
        let ids = playing_room(&registry, 2, 2);

        let other = {
            let registry = Arc::clone(&registry);
            let id = ids[1];
            thread::spawn(move || registry.submit_input(id, &[0xB1, 0xB2]).unwrap())
        };
        let merged = registry.submit_input(ids[0], &[0xA1, 0xA2]).unwrap();

        assert_eq!(merged, vec![0xA1, 0xB1, 0xA2, 0xB2]);
        assert_eq!(other.join().unwrap(), merged);
    }

    /// A silent seat is desynchronized once the timeout threshold is reached
    #[test]
    fn silent_seat_desynchronizes_room() {
        let (registry, mut rx) = registry(GameConfig {
            timeout_millis: 5,
            desynch_timeouts: 4,
            scan_workers: 1,
            ..GameConfig::default()
        });
        let ids = playing_room(&registry, 2, 1);
        drain(&mut rx);

        let result = registry.submit_input(ids[0], &[1, 0]);
        assert_eq!(result, Err(RoomError::Desynched));

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::PlayerDesynced {
                player_number: 2,
                reason: DesyncReason::Lagging { timeouts: 4 },
                ..
            }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::RoomDesynced { .. })));
        let timeouts = events
            .iter()
            .filter(|e| matches!(e, ServerEvent::PlayerTimeout { .. }))
            .count();
        assert_eq!(timeouts, 4);
    }

    /// Dropping a seat releases the others and they continue with zeros
    #[test]
    fn dropped_seat_releases_blocked_submitter() {
        let (registry, _rx) = registry(GameConfig {
            timeout_millis: 20,
            desynch_timeouts: 1000,
            scan_workers: 1,
            ..GameConfig::default()
        });
        let ids = playing_room(&registry, 3, 1);

        let waiting = {
            let registry = Arc::clone(&registry);
            let id = ids[0];
            thread::spawn(move || registry.submit_input(id, &[7, 7]))
        };
        let third = {
            let registry = Arc::clone(&registry);
            let id = ids[2];
            thread::spawn(move || registry.submit_input(id, &[9, 9]))
        };

        thread::sleep(Duration::from_millis(60));
        let (_, player_number) = registry.drop_seat(ids[1]).unwrap();
        assert_eq!(player_number, 2);

        let merged = waiting.join().unwrap().unwrap();
        assert_eq!(merged, vec![7, 7, 0, 0, 9, 9]);
        assert_eq!(third.join().unwrap().unwrap(), merged);
    }

    /// The owner leaving closes the room for everyone
    #[test]
    fn owner_leaving_closes_room() {
        let (registry, mut rx) = registry(fast_game());
        let ids = playing_room(&registry, 2, 1);
        let room_id = registry.room_of(ids[0]).unwrap().id();

        registry.leave_room(ids[0]).unwrap();

        assert!(registry.room(room_id).is_none());
        assert_eq!(registry.room_of(ids[1]).err(), Some(RoomError::NotInRoom));
        assert!(drain(&mut rx)
            .iter()
            .any(|e| *e == ServerEvent::RoomClosed { room_id }));
    }
}

/// NETWORK TESTS
mod network_tests {
    use super::*;
    use server::network::Server;

    /// Minimal client: numbers its messages and repeats a window of them
    struct TestClient {
        socket: UdpSocket,
        session: SocketAddr,
        next_number: u16,
        recent: VecDeque<Message>,
        last_accepted: u16,
    }

    impl TestClient {
        async fn send(&mut self, body: Body) {
            self.recent
                .push_front(Message::new(self.next_number, body).unwrap());
            self.recent.truncate(6);
            self.next_number = self.next_number.wrapping_add(1);
            let datagram = pack(self.recent.make_contiguous(), 1024);
            self.socket.send_to(&datagram, self.session).await.unwrap();
        }

        async fn recv(&mut self) -> Vec<Body> {
            let mut buf = [0u8; 2048];
            let (len, _) = timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
                .await
                .expect("server did not answer")
                .unwrap();
            let messages = unpack(&buf[..len], self.last_accepted).unwrap();
            if let Some(last) = messages.last() {
                self.last_accepted = last.number;
            }
            messages.into_iter().map(|m| m.body).collect()
        }
    }

    async fn start_server() -> SocketAddr {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            connect_port: 0,
            welcome_messages: vec!["hello from the test server".to_string()],
            ..ServerConfig::default()
        };
        let mut server = Server::new(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move { server.run().await });
        addr
    }

    async fn connect(server: SocketAddr) -> TestClient {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let hello = ConnectMessage::Hello {
            version: protocol::handshake::PROTOCOL_VERSION.to_string(),
        };
        socket.send_to(&hello.encode(), server).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let port = match ConnectMessage::parse(&buf[..len]).unwrap() {
            ConnectMessage::HelloResponse { port } => port,
            other => panic!("unexpected handshake reply {other:?}"),
        };

        TestClient {
            socket,
            session: SocketAddr::new(server.ip(), port),
            next_number: 0,
            recent: VecDeque::new(),
            last_accepted: 0xFFFF,
        }
    }

    /// Answers acks until the lobby status arrives, returning everything seen
    async fn login(client: &mut TestClient, name: &str) -> Vec<Body> {
        client
            .send(Body::UserInformation {
                user_name: name.to_string(),
                client_type: "emu".to_string(),
                connection_type: 1,
            })
            .await;

        let mut seen = Vec::new();
        while !seen.iter().any(|b| matches!(b, Body::InformationMessage { .. })) {
            for body in client.recv().await {
                if body == Body::ServerAck {
                    client.send(Body::ClientAck).await;
                }
                seen.push(body);
            }
        }
        seen
    }

    /// Handshake, ack round trips, and the post-login lobby state
    #[tokio::test]
    async fn handshake_and_login() {
        let server = start_server().await;
        let mut client = connect(server).await;
        assert_ne!(client.session.port(), server.port());

        let seen = login(&mut client, "alice").await;

        let acks = seen.iter().filter(|b| **b == Body::ServerAck).count();
        assert_eq!(acks, 4);
        assert!(seen.iter().any(|b| matches!(
            b,
            Body::ServerStatus { users, games } if users.is_empty() && games.is_empty()
        )));
        assert!(seen.iter().any(|b| matches!(
            b,
            Body::UserJoined { user_name, .. } if user_name == "alice"
        )));
    }

    /// A second user sees the first in the lobby and chat reaches both
    #[tokio::test]
    async fn lobby_chat_reaches_everyone() {
        let server = start_server().await;
        let mut alice = connect(server).await;
        login(&mut alice, "alice").await;
        let mut bob = connect(server).await;
        let seen = login(&mut bob, "bob").await;

        assert!(seen.iter().any(|b| matches!(
            b,
            Body::ServerStatus { users, .. } if users.len() == 1 && users[0].name == "alice"
        )));

        bob.send(Body::ChatRequest {
            message: "hi all".to_string(),
        })
        .await;

        let expected = Body::ChatNotification {
            user_name: "bob".to_string(),
            message: "hi all".to_string(),
        };
        loop {
            if alice.recv().await.contains(&expected) {
                break;
            }
        }
    }

    /// The connect port answers pings without allocating a session
    #[tokio::test]
    async fn connect_port_ping() {
        let server = start_server().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(&ConnectMessage::Ping.encode(), server)
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ConnectMessage::parse(&buf[..len]).unwrap(), ConnectMessage::Pong);
    }
}
