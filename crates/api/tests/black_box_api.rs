use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use msaq_core::StaticCatalog;
use msaq_infra::jobs::{ClaimedJob, LocalJobSystem};
use msaq_infra::workers::{SearchWorker, WorkerConfig, WorkerHandle};
use msaq_infra::{Dispatcher, ExecutionError};
use reqwest::StatusCode;
use serde_json::json;
use tokio_util::sync::CancellationToken;

struct TestServer {
    base_url: String,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn spawn() -> (Self, Arc<LocalJobSystem>) {
        let dir = tempfile::tempdir().expect("failed to create results dir");
        let jobs = Arc::new(LocalJobSystem::open(dir.path()).expect("failed to open job system"));
        let catalog = Arc::new(StaticCatalog::new(["uniref", "bfd"]).with_defaults(["uniref"]));
        let dispatcher = Arc::new(Dispatcher::new(jobs.clone(), catalog, dir.path()));

        // Same router as prod, bound to an ephemeral port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            msaq_api::server::serve_on(listener, dispatcher, token).await.unwrap();
        });

        (
            Self {
                base_url,
                cancel,
                handle,
                _dir: dir,
            },
            jobs,
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

fn start_worker(jobs: Arc<LocalJobSystem>) -> WorkerHandle {
    let engine = Arc::new(|job: &ClaimedJob, _: &CancellationToken| -> Result<PathBuf, ExecutionError> {
        if job.request.variant().query().contains("WWWW") {
            return Err(ExecutionError::Failed {
                status: "exit status: 1".into(),
                stderr: "no hits".into(),
            });
        }
        let artifact = job.work_dir.join("result.tar.gz");
        fs::write(&artifact, b"alignment").map_err(|e| ExecutionError::Prepare(e.to_string()))?;
        Ok(artifact)
    });

    SearchWorker::new(
        jobs,
        engine,
        WorkerConfig::default()
            .with_name("test-worker")
            .with_poll_interval(Duration::from_millis(20)),
    )
    .spawn(CancellationToken::new())
    .expect("failed to spawn worker")
}

async fn submit(client: &reqwest::Client, srv: &TestServer, body: serde_json::Value) -> reqwest::Response {
    client.post(srv.url("/ticket")).json(&body).send().await.unwrap()
}

async fn ticket_eventually(
    client: &reqwest::Client,
    srv: &TestServer,
    ticket: &str,
    state: &str,
) -> serde_json::Value {
    // Workers run on their own threads; poll until the job settles.
    for _ in 0..200 {
        let res = client
            .get(srv.url(&format!("/ticket/{ticket}")))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = res.json().await.unwrap();
        if body["state"] == state {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("ticket {ticket} did not reach {state} in time");
}

#[tokio::test]
async fn health_and_databases() {
    let (srv, _jobs) = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client.get(srv.url("/databases")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["databases"], json!(["uniref", "bfd"]));
}

#[tokio::test]
async fn submission_lifecycle_and_dedup() {
    let (srv, jobs) = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let payload = json!({"q": "ABCDEF", "dbs": ["uniref"], "mode": "standard", "email": "a@b.com"});

    let res = submit(&client, &srv, payload.clone()).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["state"], "pending");
    let ticket = body["ticket"].as_str().unwrap().to_string();

    let res = client.get(srv.url(&format!("/result/{ticket}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let err: serde_json::Value = res.json().await.unwrap();
    assert_eq!(err["error"], "not_ready");

    let worker = start_worker(jobs.clone());
    let record = ticket_eventually(&client, &srv, &ticket, "complete").await;
    assert_eq!(record["kind"], "msa");
    assert_eq!(record["databases"], json!(["uniref"]));

    let res = client.get(srv.url(&format!("/result/{ticket}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let result: serde_json::Value = res.json().await.unwrap();
    assert_eq!(result["location"], record["result"]);
    assert!(result["location"].as_str().unwrap().ends_with("result.tar.gz"));

    let res = submit(&client, &srv, payload.clone()).await;
    let again: serde_json::Value = res.json().await.unwrap();
    assert_eq!(again["ticket"], ticket.as_str());
    assert_eq!(again["state"], "complete");

    let mut forced = payload;
    forced["force"] = json!(true);
    let res = submit(&client, &srv, forced).await;
    let fresh: serde_json::Value = res.json().await.unwrap();
    assert_ne!(fresh["ticket"], ticket.as_str());

    worker.shutdown();
}

#[tokio::test]
async fn pair_mode_ignores_databases() {
    let (srv, jobs) = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = submit(
        &client,
        &srv,
        json!({"query": "ABCDEF", "databases": ["doesnotexist"], "mode": "pairgreedy", "email": "a@b.com"}),
    )
    .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let ticket = res.json::<serde_json::Value>().await.unwrap()["ticket"]
        .as_str()
        .unwrap()
        .to_string();

    let worker = start_worker(jobs);
    let record = ticket_eventually(&client, &srv, &ticket, "complete").await;
    assert_eq!(record["kind"], "pair");
    assert_eq!(record["databases"], json!([]));
    worker.shutdown();
}

#[tokio::test]
async fn failed_search_is_reported_on_the_ticket() {
    let (srv, jobs) = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = submit(&client, &srv, json!({"q": "WWWW", "mode": "standard"})).await;
    let ticket = res.json::<serde_json::Value>().await.unwrap()["ticket"]
        .as_str()
        .unwrap()
        .to_string();

    let worker = start_worker(jobs);
    let record = ticket_eventually(&client, &srv, &ticket, "error").await;
    assert!(record["message"].as_str().unwrap().contains("no hits"));
    assert_eq!(record["databases"], json!(["uniref"]));

    let res = client.get(srv.url(&format!("/result/{ticket}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    worker.shutdown();
}

#[tokio::test]
async fn invalid_submissions_are_rejected() {
    let (srv, jobs) = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = submit(&client, &srv, json!({"q": "ABCDEF", "dbs": ["doesnotexist"], "mode": "standard"})).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unknown_database");

    let res = submit(&client, &srv, json!({"q": "AB1DEF", "mode": "standard"})).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = submit(&client, &srv, json!({"q": "ABCDEF", "mode": ""})).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    assert_eq!(jobs.pending_count().unwrap(), 0);
}

#[tokio::test]
async fn unknown_and_malformed_tickets() {
    let (srv, _jobs) = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let unknown = msaq_core::Ticket::new().to_string();

    let res = client.get(srv.url(&format!("/ticket/{unknown}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client.get(srv.url("/ticket/not-a-ticket")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_id");

    let res = client.get(srv.url(&format!("/result/{unknown}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bulk_ticket_status() {
    let (srv, _jobs) = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = submit(&client, &srv, json!({"q": "ABCDEF", "mode": "pairgreedy"})).await;
    let ticket = res.json::<serde_json::Value>().await.unwrap()["ticket"]
        .as_str()
        .unwrap()
        .to_string();
    let unknown = msaq_core::Ticket::new().to_string();

    let res = client
        .post(srv.url("/tickets"))
        .json(&json!({"tickets": [ticket, unknown]}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["state"], "pending");
    assert_eq!(items[1]["ticket"], unknown.as_str());
    assert_eq!(items[1]["state"], "unknown");

    let res = client
        .post(srv.url("/tickets"))
        .json(&json!({"tickets": ["nope"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}
