//! End-to-end tunnel tests
//!
//! Runs the real UDP responder against a fake framed TCP backend and drives
//! it the way an agent does: open, announce, fragment, poll, fetch.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use dnsbridge::config::{StoreKind, TransformKind};
use dnsbridge::dns::{DnsQuery, QCLASS_IN, QTYPE_TXT};
use dnsbridge::fragment::{chunk, encode_base32_unpadded};
use dnsbridge::{BridgeConfig, DnsBridgeServer, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::oneshot;

const INPUT: &str = "send.tunnel.test";
const OUTPUT: &str = "receive.tunnel.test";

/// Backend that answers every frame with `reply(frame)`
async fn backend<F>(reply: F) -> SocketAddr
where
    F: Fn(Vec<u8>) -> Vec<u8> + Send + Sync + Copy + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut peer, _)) = listener.accept().await {
            tokio::spawn(async move {
                loop {
                    let mut len = [0u8; 4];
                    if peer.read_exact(&mut len).await.is_err() {
                        break;
                    }
                    let mut frame = vec![0u8; u32::from_le_bytes(len) as usize];
                    if peer.read_exact(&mut frame).await.is_err() {
                        break;
                    }

                    let answer = reply(frame);
                    let mut out = (answer.len() as u32).to_le_bytes().to_vec();
                    out.extend_from_slice(&answer);
                    if peer.write_all(&out).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

struct Bridge {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

fn test_config(backend: SocketAddr) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.domains.input = INPUT.to_string();
    config.domains.output = OUTPUT.to_string();
    config.backend.addr = backend;
    config.backend.recv_timeout = Duration::from_millis(300);
    config.store.kind = StoreKind::Memory;
    config.transform.kind = TransformKind::None;
    config
}

async fn start(config: BridgeConfig) -> Bridge {
    config.validate().unwrap();
    let router = Arc::new(Router::from_config(&config).unwrap());
    let server = DnsBridgeServer::bind(config.listen_addr, router).await.unwrap();
    let addr = server.local_addr().unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(server.run_until(async {
        let _ = stopped.await;
    }));

    Bridge {
        addr,
        stop: Some(stop),
    }
}

/// Minimal agent speaking the label protocol over UDP
struct Agent {
    socket: UdpSocket,
    server: SocketAddr,
    next_id: u16,
}

impl Agent {
    async fn new(server: SocketAddr) -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            server,
            next_id: 1,
        }
    }

    async fn query(&mut self, name: &str) -> Vec<String> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let query = DnsQuery::new(id, name, QTYPE_TXT, QCLASS_IN);
        self.socket.send_to(&query.encode(), self.server).await.unwrap();

        let mut buf = [0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(3), self.socket.recv_from(&mut buf))
            .await
            .expect("response in time")
            .unwrap();
        let (response_id, answers) = parse_txt_response(&buf[..len]);
        assert_eq!(response_id, id);
        answers
    }

    async fn send(&mut self, handle: &str, session: &str, payload: &[u8]) {
        let encoded = encode_base32_unpadded(payload);
        let labels = chunk(&encoded, 60);
        let groups: Vec<&[&str]> = labels.chunks(3).collect();

        let announce = format!("{}.{}.{}.{}", handle, groups.len(), session, INPUT);
        assert_eq!(self.query(&announce).await, vec!["ACK"]);

        for (pos, group) in groups.iter().enumerate() {
            let name = format!("{}.{}.{}.{}.{}", handle, pos, session, group.join("."), INPUT);
            assert_eq!(self.query(&name).await, vec!["ACK"]);
        }
    }

    async fn receive(&mut self, handle: &str, session: &str) -> Option<Vec<u8>> {
        let poll = self.query(&format!("{}.{}.{}", handle, session, OUTPUT)).await;
        let count: usize = poll.first()?.parse().ok()?;

        let mut text = String::new();
        for pos in 0..count {
            let answers = self
                .query(&format!("{}.{}.{}.{}", handle, pos, session, OUTPUT))
                .await;
            text.push_str(&answers.concat());
        }
        Some(BASE64.decode(text).unwrap())
    }
}

/// Transaction id and TXT strings of a response
fn parse_txt_response(packet: &[u8]) -> (u16, Vec<String>) {
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    assert_eq!(&packet[2..4], &[0x84, 0x00]);
    let ancount = u16::from_be_bytes([packet[6], packet[7]]) as usize;

    let mut offset = 12;
    while packet[offset] != 0 {
        offset += packet[offset] as usize + 1;
    }
    offset += 1 + 4;

    let mut answers = Vec::with_capacity(ancount);
    for _ in 0..ancount {
        assert_eq!(&packet[offset..offset + 2], &[0xC0, 0x0C]);
        offset += 10;
        let rdlength = u16::from_be_bytes([packet[offset], packet[offset + 1]]) as usize;
        offset += 2;
        let len = packet[offset] as usize;
        assert_eq!(rdlength, len + 1);
        answers.push(String::from_utf8(packet[offset + 1..offset + 1 + len].to_vec()).unwrap());
        offset += rdlength;
    }
    (id, answers)
}

#[tokio::test]
async fn test_echo_roundtrip() {
    let backend = backend(|frame| frame).await;
    let bridge = start(test_config(backend)).await;
    let mut agent = Agent::new(bridge.addr).await;

    assert_eq!(agent.query(&format!("agent1.{}", INPUT)).await, vec!["ACK"]);

    let payload: Vec<u8> = (0..1500u32).map(|i| (i * 7 % 256) as u8).collect();
    agent.send("agent1", "up1", &payload).await;

    let echoed = agent.receive("agent1", "down1").await.expect("echoed frame");
    assert_eq!(echoed, payload);

    // Session is gone after the last chunk was read
    assert_eq!(
        agent.query(&format!("agent1.0.down1.{}", OUTPUT)).await,
        vec!["EOFEOFEOFEOF"]
    );
}

#[tokio::test]
async fn test_poll_states() {
    let backend = backend(|frame| frame).await;
    let bridge = start(test_config(backend)).await;
    let mut agent = Agent::new(bridge.addr).await;

    assert_eq!(
        agent.query(&format!("stranger.s1.{}", OUTPUT)).await,
        vec!["NH"]
    );

    agent.query(&format!("quiet.{}", INPUT)).await;
    assert_eq!(agent.query(&format!("quiet.s1.{}", OUTPUT)).await, vec!["None"]);

    assert!(agent.query("www.example.com").await.is_empty());
}

#[tokio::test]
async fn test_case_insensitive_domains() {
    let backend = backend(|frame| frame).await;
    let bridge = start(test_config(backend)).await;
    let mut agent = Agent::new(bridge.addr).await;

    assert_eq!(agent.query("h1.SEND.Tunnel.Test").await, vec!["ACK"]);
    assert_eq!(agent.query("h1.s1.RECEIVE.tunnel.test").await, vec!["None"]);
}

#[tokio::test]
async fn test_sqlite_store_and_aes_transform() {
    use aes::Aes256;
    use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};

    let key = [3u8; 32];
    let iv = [5u8; 16];
    let db = std::env::temp_dir().join(format!("dnsbridge_e2e_{}.sqlite", rand::random::<u64>()));

    let backend = backend(|frame| frame.iter().rev().copied().collect()).await;
    let mut config = test_config(backend);
    config.store.kind = StoreKind::Sqlite;
    config.store.path = db.clone();
    config.transform.kind = TransformKind::AesCbc;
    config.transform.key = BASE64.encode(key);
    config.transform.iv = BASE64.encode(iv);
    config.transform.padding = dnsbridge::transform::CbcPadding::Pkcs7;

    let bridge = start(config).await;
    let mut agent = Agent::new(bridge.addr).await;

    agent.query(&format!("h1.{}", INPUT)).await;
    agent.send("h1", "in", b"hello through sqlite").await;

    let encrypted = agent.receive("h1", "out").await.expect("encrypted frame");
    let plain = cbc::Decryptor::<Aes256>::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&encrypted)
        .unwrap();
    assert_eq!(plain, b"etilqs hguorht olleh");

    drop(bridge);
    let _ = std::fs::remove_file(&db);
}
