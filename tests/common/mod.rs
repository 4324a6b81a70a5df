//! Loopback fake RESP server shared by the integration tests.
//!
//! Understands just enough commands to exercise the client:
//! `PING`, `ECHO`, `SET`, `GET`, `SELECT`, `AUTH`, `QUIT`, `SUBSCRIBE`,
//! `SLEEP <ms>` and `KILL` (drops the socket without replying).

#![allow(dead_code)]

use bytes::Bytes;
use flashpipe::buffer::BufferPool;
use flashpipe::protocol::{FrameReader, Response};
use flashpipe::ConnectionKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

pub const PASSWORD: &str = "secret";

/// Installs a test subscriber once. `RUST_LOG=flashpipe=debug` shows the
/// client's logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Behavior {
    /// Swallow `QUIT` without answering or closing
    pub ignore_quit: bool,
}

#[derive(Default)]
struct ServerState {
    data: Mutex<HashMap<Bytes, Bytes>>,
    accepted: AtomicUsize,
    behavior: Behavior,
}

pub struct FakeServer {
    addr: String,
    state: Arc<ServerState>,
}

impl FakeServer {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_with(Behavior::default()).await
    }

    pub async fn start_with(behavior: Behavior) -> anyhow::Result<Self> {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        let state = Arc::new(ServerState {
            behavior,
            ..ServerState::default()
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });

        Ok(Self { addr, state })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.addr.clone(), 0)
    }

    pub fn key_with_db(&self, db: u16) -> ConnectionKey {
        ConnectionKey::new(self.addr.clone(), db)
    }

    /// TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }
}

async fn serve(stream: TcpStream, state: Arc<ServerState>) {
    let (read, mut write) = stream.into_split();
    let mut reader = FrameReader::new(read, BufferPool::new(4096, 4));

    while let Ok(request) = reader.receive().await {
        let Some(args) = request.into_array() else {
            return;
        };
        let args: Vec<Bytes> = args
            .into_iter()
            .filter_map(|arg| arg.as_bytes().map(Bytes::copy_from_slice))
            .collect();
        let Some(name) = args.first() else {
            continue;
        };

        let name = String::from_utf8_lossy(name).to_ascii_uppercase();
        let reply = match name.as_str() {
            "PING" => Response::status("PONG"),
            "ECHO" if args.len() == 2 => Response::bulk(args[1].clone()),
            "SET" if args.len() == 3 => {
                lock(&state.data).insert(args[1].clone(), args[2].clone());
                Response::status("OK")
            }
            "GET" if args.len() == 2 => match lock(&state.data).get(&args[1]) {
                Some(value) => Response::bulk(value.clone()),
                None => Response::nil(),
            },
            "SELECT" if args.len() == 2 => {
                match std::str::from_utf8(&args[1]).ok().and_then(|s| s.parse::<u16>().ok()) {
                    Some(db) if db < 16 => Response::status("OK"),
                    _ => Response::error("ERR DB index is out of range"),
                }
            }
            "AUTH" if args.len() == 2 => {
                if args[1] == PASSWORD.as_bytes() {
                    Response::status("OK")
                } else {
                    Response::error("WRONGPASS invalid username-password pair")
                }
            }
            "SLEEP" if args.len() == 2 => {
                let ms = std::str::from_utf8(&args[1])
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Response::status("OK")
            }
            "SUBSCRIBE" => {
                let mut out = Vec::new();
                for (count, channel) in args[1..].iter().enumerate() {
                    Response::multi_bulk(vec![
                        Response::bulk("subscribe"),
                        Response::bulk(channel.clone()),
                        Response::Integer(count as i64 + 1),
                    ])
                    .serialize_into(&mut out);
                    Response::multi_bulk(vec![
                        Response::bulk("message"),
                        Response::bulk(channel.clone()),
                        Response::bulk("welcome"),
                    ])
                    .serialize_into(&mut out);
                }
                if write.write_all(&out).await.is_err() {
                    return;
                }
                continue;
            }
            "QUIT" if state.behavior.ignore_quit => continue,
            "QUIT" => {
                let _ = send(&mut write, &Response::status("OK")).await;
                return;
            }
            "KILL" => return,
            _ => Response::error(format!("ERR unknown command '{}'", name.to_lowercase())),
        };

        if send(&mut write, &reply).await.is_err() {
            return;
        }
    }
}

async fn send(write: &mut OwnedWriteHalf, reply: &Response) -> std::io::Result<()> {
    write.write_all(&reply.serialize()).await
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}
