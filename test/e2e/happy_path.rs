//! End-to-end happy path test.
//!
//! Runs two node agents and one orchestrator over real HTTP on loopback,
//! with the mock runtime in place of runc and recording runners in place of
//! rsync and iptables. The agents share a port and differ by address
//! (`127.0.0.1` and `127.0.0.2`), the same way production hosts do.
//!
//! 1. Cold start on host A
//! 2. Live migration A → B
//! 3. Live migration B → A
//! 4. Reset all
//!
//! ## Running
//!
//! ```bash
//! cargo test -p migrant-e2e --test happy_path
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use migrant_networking::{IptablesRedirector, RedirectConfig};
use migrant_node_agent::{
    api as agent_api, LaunchMode, MockRuntime, NodeAgent, StateSync, SyncConfig,
};
use migrant_orchestrator::{api, state::AppState, HttpAgentClient, Orchestrator};
use migrant_testing::RecordingRunner;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const HOST_A: &str = "127.0.0.1";
const HOST_B: &str = "127.0.0.2";

struct AgentNode {
    runtime: Arc<MockRuntime>,
    rsync: Arc<RecordingRunner>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

fn serve(
    listener: TcpListener,
    app: axum::Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await;
    })
}

fn agent_node(
    listener: TcpListener,
    shutdown_rx: watch::Receiver<bool>,
) -> (AgentNode, JoinHandle<()>) {
    let runtime = Arc::new(MockRuntime::new());
    let rsync = Arc::new(RecordingRunner::new());
    let sync = StateSync::new(
        SyncConfig {
            bin: "rsync".to_string(),
            user: "root".to_string(),
            dirs: vec![PathBuf::from("/srv/workload/checkpoint")],
        },
        rsync.clone(),
    );
    let agent = NodeAgent::new(runtime.clone(), sync)
        .with_grace_period(Duration::from_millis(100))
        .with_run_state_dir("/nonexistent/migrant-e2e/run");

    let handle = serve(listener, agent_api::create_router(Arc::new(agent)), shutdown_rx);
    (AgentNode { runtime, rsync }, handle)
}

async fn agent_status(client: &reqwest::Client, host: &str, port: u16) -> serde_json::Value {
    client
        .get(format!("http://{host}:{port}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn migrate(client: &reqwest::Client, base_url: &str, target: &str) -> serde_json::Value {
    let resp = client
        .post(format!("{base_url}/migrate"))
        .query(&[("target", target)])
        .send()
        .await
        .unwrap();
    let status = resp.status();
    let body = resp.text().await.unwrap();
    assert!(status.is_success(), "migrate to {target} failed: {status} {body}");
    serde_json::from_str(&body).unwrap()
}

async fn authoritative(client: &reqwest::Client, base_url: &str) -> Vec<String> {
    let hosts: serde_json::Value = client
        .get(format!("{base_url}/"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    hosts
        .as_array()
        .unwrap()
        .iter()
        .filter(|h| h["authoritative"] == true)
        .map(|h| h["address"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_happy_path() {
    init_tracing();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Both agents listen on the same port, on different loopback addresses.
    let listener_a = TcpListener::bind((HOST_A, 0)).await.unwrap();
    let agent_port = listener_a.local_addr().unwrap().port();
    let listener_b = TcpListener::bind((HOST_B, agent_port)).await.unwrap();

    let (node_a, handle_a) = agent_node(listener_a, shutdown_rx.clone());
    let (node_b, handle_b) = agent_node(listener_b, shutdown_rx.clone());

    let iptables = Arc::new(RecordingRunner::new());
    let redirector = Arc::new(IptablesRedirector::new(
        RedirectConfig::new("203.0.113.10".parse().unwrap()),
        iptables.clone(),
    ));
    let orchestrator = Orchestrator::new(Arc::new(HttpAgentClient::new(agent_port)), redirector);

    let listener = TcpListener::bind((HOST_A, 0)).await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let orchestrator_handle = serve(
        listener,
        api::create_router(AppState::new(orchestrator)),
        shutdown_rx,
    );

    let client = reqwest::Client::new();

    // 1. Cold start on A.
    let outcome = migrate(&client, &base_url, HOST_A).await;
    assert_eq!(outcome["outcome"], "cold_start");
    assert_eq!(authoritative(&client, &base_url).await, [HOST_A]);
    assert_eq!(node_a.runtime.launches(), [LaunchMode::Fresh]);
    assert_eq!(agent_status(&client, HOST_A, agent_port).await["running"], true);

    // 2. A → B.
    let outcome = migrate(&client, &base_url, HOST_B).await;
    assert_eq!(outcome["outcome"], "migrated");
    assert_eq!(outcome["from"], HOST_A);
    assert_eq!(authoritative(&client, &base_url).await, [HOST_B]);

    assert_eq!(node_a.runtime.checkpoint_count(), 1);
    assert_eq!(
        node_a.rsync.command_lines(),
        ["rsync -az --delete /srv/workload/checkpoint/ root@127.0.0.2:/srv/workload/checkpoint"]
    );
    assert_eq!(node_b.runtime.launches(), [LaunchMode::Restore]);
    assert_eq!(agent_status(&client, HOST_A, agent_port).await["running"], false);
    let status_b = agent_status(&client, HOST_B, agent_port).await;
    assert_eq!(status_b["running"], true);
    assert_eq!(status_b["mode"], "restore");

    // 3. B → A.
    let outcome = migrate(&client, &base_url, HOST_A).await;
    assert_eq!(outcome["from"], HOST_B);
    assert_eq!(authoritative(&client, &base_url).await, [HOST_A]);
    assert_eq!(node_a.runtime.launches(), [LaunchMode::Fresh, LaunchMode::Restore]);

    // Every redirect appended three NAT rules pointing at the new target.
    let appends: Vec<String> = iptables
        .command_lines()
        .into_iter()
        .filter(|line| line.contains(" -A "))
        .collect();
    assert_eq!(appends.len(), 9);
    assert!(appends[6..].iter().all(|line| line.contains("127.0.0.1")));

    // Repeating the last migration is a no-op.
    let outcome = migrate(&client, &base_url, HOST_A).await;
    assert_eq!(outcome["outcome"], "already_authoritative");

    // 4. Reset all.
    let resp = client
        .post(format!("{base_url}/reset"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert!(authoritative(&client, &base_url).await.is_empty());
    assert_eq!(agent_status(&client, HOST_A, agent_port).await["running"], false);
    assert_eq!(agent_status(&client, HOST_B, agent_port).await["running"], false);

    let _ = shutdown_tx.send(true);
    for handle in [handle_a, handle_b, orchestrator_handle] {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
}
