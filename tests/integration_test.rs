//! End-to-end tests: the responder against a loopback egress, and a
//! full client-to-server turn over real HTTP.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use burrow::buf::Pusher;
use burrow::client::{ClientConfig, Requester};
use burrow::crypto::NonceCache;
use burrow::dispatch::{DispatchError, Responder, SubResponseSink};
use burrow::pool::Pool;
use burrow::protocol::{
    AddressType, CloseRequest, DialRequest, Id, ProtocolError, ResumeRequest, RetrieveRequest,
    SendRequest,
};
use burrow::relay;
use burrow::server::{self, ServerConfig};
use burrow::session::{Retrievers, Sessions, Sink};
use burrow::MAX_REQUEST_BODY_SIZE;

/// Collects serialized sub-responses in plaintext.
#[derive(Default)]
struct CollectorSink {
    segments: Mutex<Vec<Vec<u8>>>,
}

impl SubResponseSink for CollectorSink {
    fn write<'a>(
        &'a self,
        build: &'a (dyn Fn(&mut Pusher<'_>) -> Result<(), ProtocolError> + Send + Sync),
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        Box::pin(async move {
            let mut buf = vec![0u8; MAX_REQUEST_BODY_SIZE];
            let mut p = Pusher::new(&mut buf);
            build(&mut p).map_err(DispatchError::Protocol)?;
            self.segments.lock().push(p.data().to_vec());
            Ok(())
        })
    }
}

fn build_one(build: impl FnOnce(&mut Pusher<'_>) -> Result<(), ProtocolError>) -> Vec<u8> {
    let mut buf = vec![0u8; 1024];
    let mut p = Pusher::new(&mut buf);
    build(&mut p).unwrap();
    p.data().to_vec()
}

/// The egress socket behind a dial-send-send-close sequence sees
/// exactly the bytes `TestSendA`.
#[tokio::test]
async fn responder_dial_echo_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 9];
        stream.read_exact(&mut buf[..8]).await.unwrap();
        stream.write_all(b"Connect").await.unwrap();
        stream.read_exact(&mut buf[8..]).await.unwrap();
        stream.write_all(b"Connected").await.unwrap();
        let _ = seen_tx.send(buf.to_vec());
    });

    let pool = Arc::new(Pool::new(MAX_REQUEST_BODY_SIZE, 6));
    let sessions = Sessions::new(
        10,
        Duration::from_secs(10),
        relay::Config {
            dial_timeout: Duration::from_secs(1),
            retrieve_timeout: Duration::from_secs(10),
        },
        pool,
    );
    let responder = Responder::new(sessions.clone(), 1024);
    let sink: Arc<dyn SubResponseSink> = Arc::new(CollectorSink::default());

    let id = Id([0u8; 32]);
    let octets = match addr.ip() {
        std::net::IpAddr::V4(ip) => ip.octets(),
        _ => unreachable!(),
    };
    let turns = vec![
        build_one(|p| {
            DialRequest {
                id,
                atyp: AddressType::TcpV4,
                addr: Bytes::copy_from_slice(&octets),
                port: addr.port(),
                max_retrieve_len: 128,
                request: Bytes::from_static(b"Test"),
            }
            .build(p)
        }),
        build_one(|p| {
            SendRequest {
                id,
                wid: 0,
                payload: Bytes::from_static(b"Send"),
            }
            .build(p)
        }),
        build_one(|p| {
            RetrieveRequest {
                id,
                rid: 0,
                offset: 0,
            }
            .build(p)
        }),
        build_one(|p| {
            SendRequest {
                id,
                wid: 1,
                payload: Bytes::from_static(b"A"),
            }
            .build(p)
        }),
        build_one(|p| ResumeRequest { id, rid: 0 }.build(p)),
        build_one(|p| {
            RetrieveRequest {
                id,
                rid: 0,
                offset: 0,
            }
            .build(p)
        }),
        build_one(|p| CloseRequest { id }.build(p)),
    ];
    for turn in turns {
        responder.dispatch(&turn, &sink).await.unwrap();
    }

    let seen = tokio::time::timeout(Duration::from_secs(5), seen_rx)
        .await
        .expect("egress data in time")
        .unwrap();
    assert_eq!(seen, b"TestSendA".to_vec());
    // The close settled; the session table is empty again.
    assert!(sessions.is_empty());
}

/// A hosted-socket stand-in that records retrieved bytes.
#[derive(Default)]
struct CollectSink {
    data: Mutex<Vec<u8>>,
    arrived: Notify,
}

#[async_trait]
impl Sink for CollectSink {
    async fn dialed(&self) {}

    async fn retrieved(&self, data: &[u8]) {
        self.data.lock().extend_from_slice(data);
        self.arrived.notify_waiters();
    }

    async fn close(&self) {}
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Full round trip through a real HTTP backend: dial with piggy-backed
/// bytes, send more, retrieve the echo, close.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tunnel_end_to_end_over_http() {
    // Plain TCP echo service playing the remote destination.
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = echo.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    // The backend server on a local port.
    let backend_port = free_port().await;
    let server_cfg = ServerConfig {
        listen: format!("127.0.0.1:{backend_port}"),
        key: b"TestKey".to_vec(),
        logging: false,
        idle_timeout: Duration::from_secs(60),
        retrieve_timeout: Duration::from_secs(1),
        dial_timeout: Duration::from_secs(2),
        max_outgoing_connections: 8,
        tls_public_key_block: Vec::new(),
        tls_private_key_block: Vec::new(),
    };
    tokio::spawn(async move {
        let _ = server::run(server_cfg).await;
    });
    // Wait for the listener to come up.
    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", backend_port)).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Client-side plumbing pointed at the backend.
    let client_cfg = ClientConfig {
        backend: format!("http://127.0.0.1:{backend_port}/"),
        key: b"TestKey".to_vec(),
        listen: "127.0.0.1:0".into(),
        username: String::new(),
        password: String::new(),
        backend_host_enforce: None,
        max_client_connections: 8,
        max_backend_connections: 2,
        max_retrieve_length: 4096,
        request_timeout: Duration::from_secs(4),
        idle_timeout: Duration::from_secs(30),
        max_retries: 4,
    };
    let pool = Arc::new(Pool::new(burrow::MAX_REQUEST_PAYLOAD_SIZE, 8));
    let retrievers = Retrievers::new(8);
    let nonces = Arc::new(NonceCache::new(512));
    let requester = Requester::start(&client_cfg, pool, retrievers, nonces).unwrap();

    let octets = match echo_addr.ip() {
        std::net::IpAddr::V4(ip) => ip.octets(),
        _ => unreachable!(),
    };
    let sink = Arc::new(CollectSink::default());
    let shared = sink.clone();
    let (id, _) = requester
        .dial(
            AddressType::TcpV4,
            Bytes::copy_from_slice(&octets),
            echo_addr.port(),
            4096,
            Bytes::from_static(b"hello"),
            move |_| shared,
        )
        .await
        .expect("dial through the tunnel");

    let sent = requester.send(id, b" world").await.expect("send");
    assert_eq!(sent, 6);

    // Poll until the whole echo came back.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while sink.data.lock().len() < 11 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "echo did not arrive in time, got {:?}",
            String::from_utf8_lossy(&sink.data.lock())
        );
        requester.retrieve(id).await.expect("retrieve");
    }
    assert_eq!(&sink.data.lock()[..], b"hello world");

    requester.close(id).await.expect("close");
}
