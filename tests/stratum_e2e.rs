//! End-to-end stratum scenarios over a live TCP socket: a real server, a
//! seeded job pipeline and a raw line-protocol client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use lode_pool::bus::{MessageBus, PoolEvent};
use lode_pool::config::PoolConfig;
use lode_pool::daemon::responses::BlockTemplate;
use lode_pool::daemon::DaemonClient;
use lode_pool::family::sha256d::Sha256dFamily;
use lode_pool::family::PoolHandler;
use lode_pool::pool::Pool;

fn template(height: u64) -> BlockTemplate {
    serde_json::from_value(json!({
        "version": 0x20000000u32,
        "previousblockhash": "000000000000000000024e2f5b3a7f8caa6c1b2d9e8f70123456789abcdef012",
        "height": height,
        "bits": "207fffff",
        // Near-impossible explicit target: shares never become candidates,
        // so validation outcomes are deterministic.
        "target": "0000000000000000000000000000000000000000000000000000000000000001",
        "curtime": Utc::now().timestamp() as u64
    }))
    .unwrap()
}

async fn start_pool() -> (Arc<Pool>, SocketAddr, CancellationToken) {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let config: PoolConfig = serde_json::from_value(json!({
        "id": "e2e",
        "address": "bcrt1qpoolpayout",
        "endpoints": [{"host": "127.0.0.1", "port": port}],
        "daemons": [{"host": "127.0.0.1", "port": 1, "timeout_secs": 1}],
        "initial_difficulty": 16.0,
        "vardiff": {"min_diff": 0.01}
    }))
    .unwrap();
    let config = Arc::new(config);

    let daemon = Arc::new(DaemonClient::new(&config.daemons).unwrap());
    let handler: Arc<dyn PoolHandler> = Arc::new(Sha256dFamily::new("51").unwrap());
    let bus = Arc::new(MessageBus::new());
    let pool = Pool::new(config, daemon, handler, bus);

    pool.job_manager().apply_template(template(800000), false);

    let ct = CancellationToken::new();
    {
        let pool = Arc::clone(&pool);
        let ct = ct.clone();
        tokio::spawn(async move {
            let _ = pool.serve(ct).await;
        });
    }

    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    for _ in 0..50 {
        if TcpStream::connect(addr).await.is_ok() {
            return (pool, addr, ct);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("stratum server did not come up on {}", addr);
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    line: String,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
            line: String::new(),
        }
    }

    async fn send(&mut self, value: Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        self.line.clear();
        let read = tokio::time::timeout(
            Duration::from_secs(5),
            self.reader.read_line(&mut self.line),
        )
        .await
        .expect("timed out waiting for a server line")
        .unwrap();
        assert!(read > 0, "server closed the connection");
        serde_json::from_str(self.line.trim()).unwrap()
    }

    /// Subscribe and authorize; returns (extranonce1, current job id).
    async fn handshake(&mut self) -> (String, String) {
        self.send(json!({"id": 1, "method": "mining.subscribe", "params": ["cgminer/4.9"]}))
            .await;
        let response = self.recv().await;
        assert_eq!(response["id"], json!(1));
        assert!(response["error"].is_null());
        let extranonce1 = response["result"][1].as_str().unwrap().to_string();

        let set_difficulty = self.recv().await;
        assert_eq!(set_difficulty["method"], json!("mining.set_difficulty"));

        let notify = self.recv().await;
        assert_eq!(notify["method"], json!("mining.notify"));
        let job_id = notify["params"][0].as_str().unwrap().to_string();

        self.send(json!({"id": 2, "method": "mining.authorize", "params": ["wallet1.rig1", "x"]}))
            .await;
        let response = self.recv().await;
        assert_eq!(response["result"], json!(true));

        (extranonce1, job_id)
    }
}

fn ntime_now() -> String {
    format!("{:08x}", Utc::now().timestamp())
}

#[tokio::test]
async fn subscribe_returns_extranonce_and_job() {
    let (_pool, addr, ct) = start_pool().await;
    let mut client = Client::connect(addr).await;

    client
        .send(json!({"id": 1, "method": "mining.subscribe", "params": ["cgminer/4.9"]}))
        .await;
    let response = client.recv().await;

    assert_eq!(response["id"], json!(1));
    assert!(response["error"].is_null());
    let result = response["result"].as_array().unwrap();
    // [[["mining.set_difficulty", id], ["mining.notify", id]], extranonce1, size]
    assert_eq!(result[0][0][0], json!("mining.set_difficulty"));
    assert_eq!(result[0][1][0], json!("mining.notify"));
    let extranonce1 = result[1].as_str().unwrap();
    assert_eq!(extranonce1.len(), 8);
    assert_eq!(result[2], json!(4));

    let set_difficulty = client.recv().await;
    assert_eq!(set_difficulty["method"], json!("mining.set_difficulty"));
    assert_eq!(set_difficulty["params"][0], json!(16.0));

    let notify = client.recv().await;
    assert_eq!(notify["method"], json!("mining.notify"));
    let params = notify["params"].as_array().unwrap();
    assert_eq!(params.len(), 9);
    assert_eq!(params[8], json!(true), "first job is clean");

    ct.cancel();
}

#[tokio::test]
async fn stale_job_id_yields_code_21() {
    let (_pool, addr, ct) = start_pool().await;
    let mut client = Client::connect(addr).await;
    client.handshake().await;

    client
        .send(json!({
            "id": 5,
            "method": "mining.submit",
            "params": ["wallet1.rig1", "no-such-job", "00000000", ntime_now(), "00000000"]
        }))
        .await;
    let response = client.recv().await;

    assert_eq!(response["id"], json!(5));
    assert!(response["result"].is_null());
    assert_eq!(response["error"][0], json!(21));
    assert_eq!(response["error"][1], json!("job not found"));
    assert!(response["error"][2].is_null());

    ct.cancel();
}

#[tokio::test]
async fn weak_share_yields_code_23_then_duplicate_22() {
    let (_pool, addr, ct) = start_pool().await;
    let mut client = Client::connect(addr).await;
    let (_extranonce1, job_id) = client.handshake().await;

    let params = json!(["wallet1.rig1", job_id, "00000001", ntime_now(), "deadbeef"]);
    client
        .send(json!({"id": 6, "method": "mining.submit", "params": params}))
        .await;
    let response = client.recv().await;
    assert_eq!(response["error"][0], json!(23));
    assert!(response["error"][1]
        .as_str()
        .unwrap()
        .starts_with("low difficulty share ("));

    // Same tuple again: duplicate detection fires before the target check.
    client
        .send(json!({"id": 7, "method": "mining.submit", "params": params}))
        .await;
    let response = client.recv().await;
    assert_eq!(response["error"][0], json!(22));
    assert_eq!(response["error"][1], json!("duplicate share"));

    ct.cancel();
}

#[tokio::test]
async fn submit_before_subscribe_yields_code_25() {
    let (_pool, addr, ct) = start_pool().await;
    let mut client = Client::connect(addr).await;

    client
        .send(json!({
            "id": 9,
            "method": "mining.submit",
            "params": ["w", "1", "00000000", ntime_now(), "00000000"]
        }))
        .await;
    let response = client.recv().await;
    assert_eq!(response["error"][0], json!(25));

    ct.cancel();
}

#[tokio::test]
async fn submit_before_authorize_yields_code_24() {
    let (_pool, addr, ct) = start_pool().await;
    let mut client = Client::connect(addr).await;

    client
        .send(json!({"id": 1, "method": "mining.subscribe", "params": []}))
        .await;
    let _response = client.recv().await;
    let _set_difficulty = client.recv().await;
    let _notify = client.recv().await;

    client
        .send(json!({
            "id": 2,
            "method": "mining.submit",
            "params": ["w", "1", "00000000", ntime_now(), "00000000"]
        }))
        .await;
    let response = client.recv().await;
    assert_eq!(response["error"][0], json!(24));

    ct.cancel();
}

#[tokio::test]
async fn unknown_method_yields_code_20() {
    let (_pool, addr, ct) = start_pool().await;
    let mut client = Client::connect(addr).await;

    client
        .send(json!({"id": 3, "method": "mining.frobnicate", "params": []}))
        .await;
    let response = client.recv().await;
    assert_eq!(response["error"][0], json!(20));
    assert_eq!(response["error"][1], json!("Unsupported method"));

    ct.cancel();
}

#[tokio::test]
async fn new_tip_broadcasts_clean_job_and_invalidates_old_ids() {
    let (pool, addr, ct) = start_pool().await;
    let mut client = Client::connect(addr).await;
    let (_extranonce1, old_job_id) = client.handshake().await;

    // New chain tip arrives.
    let mut tpl = template(800001);
    tpl.previous_block_hash =
        "00000000000000000002aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".into();
    assert!(pool.job_manager().apply_template(tpl, false));

    let notify = client.recv().await;
    assert_eq!(notify["method"], json!("mining.notify"));
    let params = notify["params"].as_array().unwrap();
    let new_job_id = params[0].as_str().unwrap();
    assert_ne!(new_job_id, old_job_id);
    assert_eq!(params[8], json!(true), "tip change must set clean_jobs");

    // The old job id is gone from the registry.
    client
        .send(json!({
            "id": 11,
            "method": "mining.submit",
            "params": ["wallet1.rig1", old_job_id, "00000000", ntime_now(), "00000000"]
        }))
        .await;
    let response = client.recv().await;
    assert_eq!(response["error"][0], json!(21));

    ct.cancel();
}

#[tokio::test]
async fn bus_publishes_job_broadcast_markers() {
    let (pool, addr, ct) = start_pool().await;
    let mut events = pool.bus().subscribe();

    let mut client = Client::connect(addr).await;
    client.handshake().await;

    let mut tpl = template(800002);
    tpl.previous_block_hash =
        "00000000000000000002bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".into();
    pool.job_manager().apply_template(tpl, false);

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        PoolEvent::JobBroadcast { clean_jobs, .. } => assert!(clean_jobs),
        other => panic!("unexpected event {:?}", other),
    }

    ct.cancel();
}
