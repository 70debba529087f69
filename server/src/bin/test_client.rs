use clap::Parser;
use protocol::handshake::PROTOCOL_VERSION;
use protocol::{pack, unpack, Body, ConnectMessage, Message};
use rand::Rng;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use server::data_cache::GameDataCache;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Scripted client for exercising a relay server")]
struct Args {
    /// Connect port address of the server
    #[clap(short, long, default_value = "127.0.0.1:27888")]
    server: SocketAddr,
    #[clap(short, long, default_value = "tester")]
    name: String,
    /// Create a room for this game name
    #[clap(long, conflicts_with = "join")]
    create: Option<String>,
    /// Join the room with this id
    #[clap(long)]
    join: Option<u16>,
    /// As owner, start once this many players are seated
    #[clap(long, default_value = "2")]
    players: u8,
    /// Input messages to exchange before leaving
    #[clap(long, default_value = "300")]
    frames: u32,
    #[clap(long, default_value = "1")]
    connection_type: u8,
}

/// Client half of a session: numbering, resend window, and caches.
struct Connection {
    socket: UdpSocket,
    server: SocketAddr,
    next_number: u16,
    recent: VecDeque<Message>,
    last_accepted: u16,
    inbound: GameDataCache,
    outbound: GameDataCache,
}

impl Connection {
    async fn send(&mut self, body: Body) -> Result<(), Box<dyn std::error::Error>> {
        let message = Message::new(self.next_number, body)?;
        self.next_number = self.next_number.wrapping_add(1);
        self.recent.push_front(message);
        self.recent.truncate(6);
        let datagram = pack(self.recent.make_contiguous(), 1024);
        self.socket.send_to(&datagram, self.server).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<Message>, Box<dyn std::error::Error>> {
        let mut buf = [0u8; 4096];
        let (len, _) = timeout(Duration::from_secs(30), self.socket.recv_from(&mut buf)).await??;
        let messages = unpack(&buf[..len], self.last_accepted)?;
        if let Some(last) = messages.last() {
            self.last_accepted = last.number;
        }
        Ok(messages)
    }

    async fn send_input(&mut self, input: Vec<u8>) -> Result<(), Box<dyn std::error::Error>> {
        let body = match self.outbound.find(&input) {
            Some(key) => Body::CachedGameData { key },
            None => {
                self.outbound.insert(input.clone());
                Body::GameData { data: input }
            }
        };
        self.send(body).await
    }
}

fn random_input(connection_type: u8) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    // A small set of button states keeps the caches busy.
    (0..connection_type)
        .flat_map(|_| [rng.gen_range(0..4u8), 0])
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    // Handshake on the connect port
    let hello = ConnectMessage::Hello {
        version: PROTOCOL_VERSION.to_string(),
    };
    socket.send_to(&hello.encode(), args.server).await?;
    let mut buf = [0u8; 256];
    let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await??;
    let port = match ConnectMessage::parse(&buf[..len])? {
        ConnectMessage::HelloResponse { port } => port,
        other => {
            println!("Server refused connection: {:?}", other);
            return Ok(());
        }
    };
    println!("Assigned session port {}", port);

    let mut conn = Connection {
        socket,
        server: SocketAddr::new(args.server.ip(), port),
        next_number: 0,
        recent: VecDeque::new(),
        last_accepted: 0xFFFF,
        inbound: GameDataCache::new(),
        outbound: GameDataCache::new(),
    };

    conn.send(Body::UserInformation {
        user_name: args.name.clone(),
        client_type: "test_client".to_string(),
        connection_type: args.connection_type,
    })
    .await?;

    let mut room_id = args.join;
    let mut started = false;
    let mut frames = 0u32;
    let mut step_received = false;

    loop {
        for message in conn.recv().await? {
            match message.body {
                Body::ServerAck => conn.send(Body::ClientAck).await?,
                Body::ServerStatus { users, games } => {
                    println!("Logged in: {} users, {} games", users.len(), games.len());
                    if let Some(rom_name) = &args.create {
                        conn.send(Body::CreateGameRequest {
                            rom_name: rom_name.clone(),
                        })
                        .await?;
                    } else if let Some(game_id) = args.join {
                        conn.send(Body::JoinGameRequest {
                            game_id,
                            connection_type: args.connection_type,
                        })
                        .await?;
                    }
                }
                Body::CreateGameNotification {
                    user_name, game_id, ..
                } if user_name == args.name => {
                    println!("Created room {}", game_id);
                    room_id = Some(game_id);
                }
                Body::GameStatus {
                    game_id,
                    num_players,
                    status,
                    ..
                } if Some(game_id) == room_id => {
                    println!("Room {}: {} players, status {}", game_id, num_players, status);
                    if args.create.is_some() && !started && num_players >= args.players {
                        started = true;
                        conn.send(Body::StartGameRequest).await?;
                    }
                }
                Body::StartGameNotification {
                    frame_delay,
                    player_number,
                    num_players,
                } => {
                    println!(
                        "Game starting: player {} of {}, delay {}",
                        player_number, num_players, frame_delay
                    );
                    conn.inbound = GameDataCache::new();
                    conn.outbound = GameDataCache::new();
                    conn.send(Body::AllReady).await?;
                }
                Body::AllReady => {
                    println!("All players ready");
                    conn.send_input(random_input(args.connection_type)).await?;
                }
                Body::GameData { data } => {
                    conn.inbound.insert(data);
                    frames += 1;
                    step_received = true;
                }
                Body::CachedGameData { key } => {
                    if conn.inbound.get(key).is_none() {
                        println!("Server referenced empty cache slot {}", key);
                    }
                    frames += 1;
                    step_received = true;
                }
                Body::GameChatNotification { user_name, message } => {
                    println!("[room] {}: {}", user_name, message);
                }
                Body::InformationMessage { source, message } => {
                    println!("[{}] {}", source, message);
                }
                Body::CloseGame { game_id, .. } if Some(game_id) == room_id => {
                    println!("Room {} closed", game_id);
                    conn.send(Body::QuitRequest {
                        message: "room closed".to_string(),
                    })
                    .await?;
                    return Ok(());
                }
                other => println!("Received {}", other.message_type().name()),
            }

            if frames >= args.frames {
                println!("Exchanged {} frames, leaving", frames);
                conn.send(Body::PlayerDropRequest).await?;
                conn.send(Body::QuitGameRequest).await?;
                conn.send(Body::QuitRequest {
                    message: "done".to_string(),
                })
                .await?;
                return Ok(());
            }
        }

        // Answer each merged step with the next input.
        if step_received {
            step_received = false;
            conn.send_input(random_input(args.connection_type)).await?;
        }
    }
}
