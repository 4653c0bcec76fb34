//! Master/replica replication over real HTTP nodes bound to 127.0.0.1:0

use relaykv::replication::TaskOptions;
use relaykv::server::{RunningNode, WriteAck};
use relaykv::{Node, NodeConfig, NodeRole, Position};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn config(id: &str, role: NodeRole, data_dir: &Path, master: Option<&str>) -> NodeConfig {
    NodeConfig {
        node_id: id.to_string(),
        role,
        data_dir: data_dir.to_path_buf(),
        engine: "sled".to_string(),
        http_addr: "127.0.0.1:0".parse().unwrap(),
        master_url: master.map(str::to_string),
        poll_interval_ms: 20,
        request_timeout_secs: 5,
        ..Default::default()
    }
}

async fn start(config: NodeConfig) -> RunningNode {
    let options = TaskOptions {
        report_interval: Duration::from_millis(50),
        retention_interval: Duration::from_secs(3600),
        ..TaskOptions::from_config(&config)
    };
    Node::new(config)
        .with_task_options(options)
        .start()
        .await
        .unwrap()
}

/// Poll `check` until it returns true or the deadline passes
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn put(http: &Client, node: &RunningNode, key: &str, value: &str) -> WriteAck {
    let resp = http
        .put(format!("{}/kv/{}", node.url(), key))
        .body(value.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    resp.json().await.unwrap()
}

async fn get(http: &Client, node: &RunningNode, key: &str) -> Option<String> {
    let resp = http
        .get(format!("{}/kv/{}", node.url(), key))
        .send()
        .await
        .unwrap();
    match resp.status() {
        StatusCode::OK => Some(resp.text().await.unwrap()),
        StatusCode::NOT_FOUND => None,
        other => panic!("unexpected status {}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replica_bootstraps_then_streams() {
    let dir = TempDir::new().unwrap();
    let http = Client::new();

    let master = start(config("master", NodeRole::Master, &dir.path().join("m"), None)).await;
    put(&http, &master, "before/1", "a").await;
    put(&http, &master, "before/2", "b").await;

    let replica = start(config(
        "replica-1",
        NodeRole::Replica,
        &dir.path().join("r"),
        Some(&master.url()),
    ))
    .await;

    let (h, r) = (&http, &replica);
    eventually("bootstrap", move || async move {
        get(h, r, "before/2").await.as_deref() == Some("b")
    })
    .await;

    let ack = put(&http, &master, "after", "c").await;
    assert!(ack.applied);
    http.delete(format!("{}/kv/before/1", master.url()))
        .send()
        .await
        .unwrap();

    eventually("streamed writes", move || async move {
        get(h, r, "after").await.as_deref() == Some("c") && get(h, r, "before/1").await.is_none()
    })
    .await;

    let m = &master;
    eventually("replica offset report", move || async move {
        let applied = r.manager().current_position().unwrap();
        m.manager()
            .replicas()
            .unwrap()
            .iter()
            .any(|p| p.replica_id == "replica-1" && p.offset == applied)
    })
    .await;
    assert_eq!(
        replica.manager().current_position().unwrap(),
        master.manager().current_position().unwrap()
    );

    replica.shutdown().await.unwrap();
    master.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replica_is_read_only() {
    let dir = TempDir::new().unwrap();
    let http = Client::new();

    let master = start(config("master", NodeRole::Master, &dir.path().join("m"), None)).await;
    let replica = start(config(
        "replica-1",
        NodeRole::Replica,
        &dir.path().join("r"),
        Some(&master.url()),
    ))
    .await;

    let resp = http
        .put(format!("{}/kv/k", replica.url()))
        .body("v")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = http
        .post(format!("{}/incr/counter", replica.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let status: Value = http
        .get(format!("{}/status", replica.url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["role"], "replica");

    replica.shutdown().await.unwrap();
    master.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_increments_match_on_replica() {
    let dir = TempDir::new().unwrap();
    let http = Client::new();

    let master = start(config("master", NodeRole::Master, &dir.path().join("m"), None)).await;
    let replica = start(config(
        "replica-1",
        NodeRole::Replica,
        &dir.path().join("r"),
        Some(&master.url()),
    ))
    .await;

    let mut last = None;
    for _ in 0..10 {
        let ack: WriteAck = http
            .post(format!("{}/incr/stats/hits", master.url()))
            .query(&[("by", "3")])
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        last = ack.value;
    }
    assert_eq!(last.as_deref(), Some("30"));

    let ack: WriteAck = http
        .post(format!("{}/append/log", master.url()))
        .body("xy")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ack.value.as_deref(), Some("xy"));

    let (h, r) = (&http, &replica);
    eventually("replicated counter", move || async move {
        get(h, r, "stats/hits").await.as_deref() == Some("30")
            && get(h, r, "log").await.as_deref() == Some("xy")
    })
    .await;

    replica.shutdown().await.unwrap();
    master.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_trim_waits_for_slowest_replica() {
    let dir = TempDir::new().unwrap();
    let http = Client::new();
    let replica_dir = dir.path().join("r");

    let mut master_cfg = config("master", NodeRole::Master, &dir.path().join("m"), None);
    master_cfg.max_wal_size = "1B".to_string();
    let master = start(master_cfg).await;
    put(&http, &master, "k0", "0").await;

    let replica = start(config(
        "replica-1",
        NodeRole::Replica,
        &replica_dir,
        Some(&master.url()),
    ))
    .await;
    let k1 = put(&http, &master, "k1", "1").await;
    let (h, r, m) = (&http, &replica, &master);
    eventually("replica catches up", move || async move {
        get(h, r, "k1").await.is_some()
    })
    .await;
    let reported = replica.manager().current_position().unwrap();
    assert_eq!(reported, Position::At(k1.offset));
    eventually("offset reported", move || async move {
        m.manager()
            .replicas()
            .unwrap()
            .iter()
            .any(|p| p.offset == reported)
    })
    .await;
    replica.shutdown().await.unwrap();

    // the replica is offline while the master keeps writing
    for i in 2..=5 {
        put(&http, &master, &format!("k{}", i), "x").await;
    }
    let bound = master.manager().trim_bound().unwrap();
    assert_eq!(bound.map(Position::At), Some(reported));
    assert_eq!(master.manager().enforce_retention().unwrap(), 1);
    let wal = master.manager().status().unwrap().wal.unwrap();
    assert_eq!(wal.first_offset, Some(k1.offset));

    // entries the replica still needs are retained
    let entries = master.manager().range_since(reported, 0).unwrap();
    assert_eq!(entries.len(), 4);

    let replica = start(config(
        "replica-1",
        NodeRole::Replica,
        &replica_dir,
        Some(&master.url()),
    ))
    .await;
    let r = &replica;
    eventually("replica resumes", move || async move {
        get(h, r, "k5").await.is_some()
    })
    .await;
    assert_eq!(get(&http, &replica, "k1").await.as_deref(), Some("1"));

    replica.shutdown().await.unwrap();
    master.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replication_endpoints() {
    let dir = TempDir::new().unwrap();
    let http = Client::new();
    let master = start(config("master", NodeRole::Master, &dir.path().join("m"), None)).await;

    let first = put(&http, &master, "a", "1").await;
    let second = put(&http, &master, "b", "2").await;
    assert!(first.offset < second.offset);

    let batch: Value = http
        .get(format!("{}/replication/wal", master.url()))
        .query(&[("limit", "-1"), ("offset", "")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(batch["entries"].as_array().unwrap().len(), 2);

    let batch: Value = http
        .get(format!("{}/replication/wal", master.url()))
        .query(&[("limit", "10"), ("offset", first.offset.to_string().as_str())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = batch["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["offset"], second.offset.to_string());

    let resp = http
        .get(format!("{}/replication/wal", master.url()))
        .query(&[("offset", "not-an-offset")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let info: Value = http
        .get(format!("{}/replication/offset", master.url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["offset"], second.offset.to_string());

    let resp = http.get(format!("{}/dump", master.url())).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()["x-current-offset"].to_str().unwrap(),
        second.offset.to_string()
    );
    let declared = resp.content_length().unwrap();
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len() as u64, declared);
    assert!(body.starts_with(b"RKVDUMP1"));

    master.shutdown().await.unwrap();
}
