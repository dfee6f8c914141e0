use std::sync::Arc;
use std::time::Duration;

use lorekeeper_api::app::{self, services::{AppServices, InMemoryBackends}};
use lorekeeper_core::{ClaimId, EntityId, WorldId};
use lorekeeper_infra::{PipelineConfig, consumer::JobConsumerHandle};
use reqwest::StatusCode;
use serde_json::{Value, json};

const WORKER_TOKEN: &str = "test-worker";

struct TestServer {
    base_url: String,
    backends: InMemoryBackends,
    handle: tokio::task::JoinHandle<()>,
    _consumer: Option<JobConsumerHandle>,
}

impl TestServer {
    /// Server only; jobs stay where the test puts them.
    async fn spawn() -> Self {
        Self::start(false).await
    }

    /// Server plus the in-process consumer, as `main` runs in memory.
    async fn spawn_with_consumer() -> Self {
        Self::start(true).await
    }

    async fn start(with_consumer: bool) -> Self {
        let config = PipelineConfig {
            worker_tokens: vec![WORKER_TOKEN.to_string()],
            wait_time: Duration::from_millis(100),
            ..PipelineConfig::default()
        };
        let backends = InMemoryBackends::new(&config);
        let (app, consumer) = if with_consumer {
            let server = app::server(&backends.backends(), config);
            (server.router, server.consumer)
        } else {
            let services = Arc::new(AppServices::new(&backends.backends(), config));
            (app::router(services), None)
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            backends,
            handle,
            _consumer: consumer,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// A world with two entities and one claim.
    fn seed_world(&self) -> (WorldId, Vec<EntityId>, ClaimId) {
        let world = WorldId::new();
        self.backends.lore.insert_world(world);
        let entities = vec![EntityId::new(), EntityId::new()];
        for e in &entities {
            self.backends.lore.insert_entity(world, *e);
        }
        let claim = ClaimId::new();
        self.backends.lore.insert_claim(world, claim);
        (world, entities, claim)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn job_body(world: WorldId, entities: &[EntityId], claim: ClaimId, description: &str) -> Value {
    json!({
        "world_id": world,
        "asset_type": "IMAGE",
        "provider": "mock",
        "model_id": "sketch-v1",
        "prompt_spec": { "description": description, "style": "ink" },
        "references": {
            "entity_ids": entities,
            "claim_ids": [claim],
        },
    })
}

async fn submit(client: &reqwest::Client, srv: &TestServer, body: &Value) -> reqwest::Response {
    client
        .post(srv.url("/asset-jobs"))
        .header("user-id", "alice")
        .json(body)
        .send()
        .await
        .unwrap()
}

async fn submit_ok(client: &reqwest::Client, srv: &TestServer, body: &Value) -> Value {
    let res = submit(client, srv, body).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

async fn patch_status(
    client: &reqwest::Client,
    srv: &TestServer,
    id: &str,
    body: Value,
) -> reqwest::Response {
    client
        .patch(srv.url(&format!("/asset-jobs/{id}")))
        .bearer_auth(WORKER_TOKEN)
        .json(&body)
        .send()
        .await
        .unwrap()
}

fn asset_body(world: WorldId, storage_key: &str) -> Value {
    json!({
        "asset": {
            "world_id": world,
            "asset_type": "IMAGE",
            "format": "png",
            "storage_key": storage_key,
            "content_type": "image/png",
            "size_bytes": 2048,
            "created_by": "worker-1",
        }
    })
}

async fn submit_and_complete(
    client: &reqwest::Client,
    srv: &TestServer,
    world: WorldId,
    entities: &[EntityId],
    claim: ClaimId,
    description: &str,
) {
    let job = submit_ok(client, srv, &job_body(world, entities, claim, description)).await;
    let id = job["id"].as_str().unwrap().to_string();
    let res = client
        .post(srv.url(&format!("/asset-jobs/{id}/complete")))
        .bearer_auth(WORKER_TOKEN)
        .json(&asset_body(world, &format!("worlds/{world}/assets/{id}.png")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn submit_returns_queued_job_with_provenance() {
    let srv = TestServer::spawn().await;
    let (world, entities, claim) = srv.seed_world();
    let client = reqwest::Client::new();

    let job = submit_ok(&client, &srv, &job_body(world, &entities, claim, "a tower")).await;

    assert_eq!(job["status"], "QUEUED");
    assert_eq!(job["requested_by"], "alice");
    assert_eq!(job["world_id"], world.to_string());
    assert_eq!(job["input_hash"].as_str().unwrap().len(), 64);
    assert_eq!(job["derivation"]["entity_ids"].as_array().unwrap().len(), 2);
    assert_eq!(job["derivation"]["claim_ids"][0], claim.to_string());

    let snapshot = job["derivation"]["lore_snapshot"].to_string();
    for e in &entities {
        assert!(snapshot.contains(&e.to_string()));
    }
    assert!(snapshot.contains(&claim.to_string()));

    let messages = srv.backends.queue.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].job_id.to_string(), job["id"].as_str().unwrap());
    for e in &entities {
        assert!(messages[0].body.contains(&e.to_string()));
    }
}

#[tokio::test]
async fn duplicate_submission_returns_same_job_and_enqueues_once() {
    let srv = TestServer::spawn().await;
    let (world, entities, claim) = srv.seed_world();
    let client = reqwest::Client::new();

    let first = submit_ok(&client, &srv, &job_body(world, &entities, claim, "a tower")).await;

    // Same request with reordered references and fields.
    let mut reversed = entities.clone();
    reversed.reverse();
    let replay = json!({
        "prompt_spec": { "style": "ink", "description": "a tower" },
        "references": { "claim_ids": [claim], "entity_ids": reversed },
        "model_id": "sketch-v1",
        "provider": "mock",
        "asset_type": "IMAGE",
        "world_id": world,
    });
    let second = submit_ok(&client, &srv, &replay).await;

    assert_eq!(first["id"], second["id"]);
    assert_eq!(first["input_hash"], second["input_hash"]);
    assert_eq!(srv.backends.queue.len(), 1);
    assert_eq!(srv.backends.jobs.job_count(), 1);
}

#[tokio::test]
async fn cross_world_reference_is_rejected_without_a_job() {
    let srv = TestServer::spawn().await;
    let (world, _, claim) = srv.seed_world();
    let (_, foreign_entities, _) = srv.seed_world();
    let client = reqwest::Client::new();

    let res = submit(&client, &srv, &job_body(world, &foreign_entities, claim, "x")).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "scope_violation");

    assert_eq!(srv.backends.jobs.job_count(), 0);
    assert!(srv.backends.queue.is_empty());
}

#[tokio::test]
async fn unknown_world_and_reference_are_not_found() {
    let srv = TestServer::spawn().await;
    let (world, entities, _) = srv.seed_world();
    let client = reqwest::Client::new();

    let res = submit(&client, &srv, &job_body(WorldId::new(), &[], ClaimId::new(), "x")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "world_not_found");

    let res = submit(&client, &srv, &job_body(world, &entities, ClaimId::new(), "x")).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "reference_not_found");
}

#[tokio::test]
async fn bad_asset_type_and_empty_prompt_are_rejected() {
    let srv = TestServer::spawn().await;
    let (world, entities, claim) = srv.seed_world();
    let client = reqwest::Client::new();

    let mut body = job_body(world, &entities, claim, "x");
    body["asset_type"] = json!("HOLOGRAM");
    let res = submit(&client, &srv, &body).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let err: Value = res.json().await.unwrap();
    assert_eq!(err["error"], "unsupported_asset_type");

    let mut body = job_body(world, &entities, claim, "x");
    body["prompt_spec"] = json!({ "description": "", "tags": [] });
    let res = submit(&client, &srv, &body).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let err: Value = res.json().await.unwrap();
    assert_eq!(err["error"], "empty_prompt_spec");

    assert_eq!(srv.backends.jobs.job_count(), 0);
}

#[tokio::test]
async fn submit_requires_user_id() {
    let srv = TestServer::spawn().await;
    let (world, entities, claim) = srv.seed_world();
    let client = reqwest::Client::new();

    let res = client
        .post(srv.url("/asset-jobs"))
        .json(&job_body(world, &entities, claim, "x"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn worker_routes_require_bearer_before_lookup() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let unknown = uuid::Uuid::now_v7();

    let res = client
        .patch(srv.url(&format!("/asset-jobs/{unknown}")))
        .json(&json!({ "status": "RUNNING" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unauthorized");

    let res = client
        .post(srv.url(&format!("/asset-jobs/{unknown}/fail")))
        .bearer_auth("not-a-worker")
        .json(&json!({ "error_code": "X" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    // With a valid token the same call reaches the lookup.
    let res = client
        .post(srv.url(&format!("/asset-jobs/{unknown}/fail")))
        .bearer_auth(WORKER_TOKEN)
        .json(&json!({ "error_code": "X" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn job_lifecycle_run_complete_and_read_asset() {
    let srv = TestServer::spawn().await;
    let (world, entities, claim) = srv.seed_world();
    let client = reqwest::Client::new();

    let job = submit_ok(&client, &srv, &job_body(world, &entities, claim, "a tower")).await;
    let id = job["id"].as_str().unwrap().to_string();

    let res = patch_status(&client, &srv, &id, json!({ "status": "RUNNING" })).await;
    assert_eq!(res.status(), StatusCode::OK);
    let running: Value = res.json().await.unwrap();
    assert_eq!(running["status"], "RUNNING");
    assert!(running["started_at"].is_string());

    let key = format!("worlds/{world}/assets/{id}.png");
    let complete = |body: Value| {
        client
            .post(srv.url(&format!("/asset-jobs/{id}/complete")))
            .bearer_auth(WORKER_TOKEN)
            .json(&body)
            .send()
    };

    let res = complete(asset_body(world, &key)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let done: Value = res.json().await.unwrap();
    assert_eq!(done["status"], "SUCCEEDED");
    let asset_id = done["asset"]["id"].as_str().unwrap().to_string();
    assert_eq!(done["derivation"]["asset_id"], asset_id.as_str());

    // Redelivery after completion: same asset, no second row.
    let res = complete(asset_body(world, &key)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let again: Value = res.json().await.unwrap();
    assert_eq!(again["asset"]["id"], asset_id.as_str());
    assert_eq!(srv.backends.jobs.asset_count(), 1);

    let res = client
        .get(srv.url(&format!("/asset-jobs/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let fetched: Value = res.json().await.unwrap();
    assert_eq!(fetched["asset"]["storage_key"], key.as_str());

    let res = client
        .get(srv.url(&format!("/assets/{asset_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let asset: Value = res.json().await.unwrap();
    assert_eq!(asset["storage_key"], key.as_str());
    assert_eq!(asset["provenance"]["asset_job_id"], id.as_str());
    assert_eq!(asset["provenance"]["requested_by"], "alice");
    assert_eq!(
        asset["provenance"]["derivation"]["entity_ids"]
            .as_array()
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn illegal_transitions_are_conflicts_naming_allowed_states() {
    let srv = TestServer::spawn().await;
    let (world, entities, claim) = srv.seed_world();
    let client = reqwest::Client::new();

    let job = submit_ok(&client, &srv, &job_body(world, &entities, claim, "a gate")).await;
    let id = job["id"].as_str().unwrap().to_string();

    let res = patch_status(
        &client,
        &srv,
        &id,
        json!({ "status": "FAILED", "error_code": "BOOM" }),
    )
    .await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_transition");
    assert_eq!(body["current"], "QUEUED");
    assert_eq!(body["attempted"], "FAILED");
    assert_eq!(body["allowed"], json!(["RUNNING", "CANCELLED"]));

    let res = client
        .get(srv.url(&format!("/asset-jobs/{id}")))
        .send()
        .await
        .unwrap();
    let unchanged: Value = res.json().await.unwrap();
    assert_eq!(unchanged["status"], "QUEUED");
    assert!(unchanged["error_code"].is_null());

    // SUCCEEDED only through /complete.
    let res = patch_status(&client, &srv, &id, json!({ "status": "RUNNING" })).await;
    assert_eq!(res.status(), StatusCode::OK);
    let res = patch_status(&client, &srv, &id, json!({ "status": "SUCCEEDED" })).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn terminal_jobs_do_not_move() {
    let srv = TestServer::spawn().await;
    let (world, entities, claim) = srv.seed_world();
    let client = reqwest::Client::new();

    let job = submit_ok(&client, &srv, &job_body(world, &entities, claim, "a bridge")).await;
    let id = job["id"].as_str().unwrap().to_string();

    let res = client
        .post(srv.url(&format!("/asset-jobs/{id}/cancel")))
        .header("user-id", "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let cancelled: Value = res.json().await.unwrap();
    assert_eq!(cancelled["status"], "CANCELLED");
    let finished_at = cancelled["finished_at"].clone();

    let res = patch_status(&client, &srv, &id, json!({ "status": "RUNNING" })).await;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["allowed"], json!([]));

    let res = client
        .get(srv.url(&format!("/asset-jobs/{id}")))
        .send()
        .await
        .unwrap();
    let after: Value = res.json().await.unwrap();
    assert_eq!(after["status"], "CANCELLED");
    assert_eq!(after["finished_at"], finished_at);
}

#[tokio::test]
async fn resubmitting_after_failure_creates_a_new_job() {
    let srv = TestServer::spawn().await;
    let (world, entities, claim) = srv.seed_world();
    let client = reqwest::Client::new();
    let body = job_body(world, &entities, claim, "a ruin");

    let first = submit_ok(&client, &srv, &body).await;
    let id = first["id"].as_str().unwrap().to_string();

    let res = patch_status(&client, &srv, &id, json!({ "status": "RUNNING" })).await;
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .post(srv.url(&format!("/asset-jobs/{id}/fail")))
        .bearer_auth(WORKER_TOKEN)
        .json(&json!({ "error_code": "PROVIDER_ERROR", "error_message": "quota" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let failed: Value = res.json().await.unwrap();
    assert_eq!(failed["status"], "FAILED");
    assert_eq!(failed["error_code"], "PROVIDER_ERROR");

    let second = submit_ok(&client, &srv, &body).await;
    assert_ne!(second["id"], first["id"]);
    assert_eq!(second["input_hash"], first["input_hash"]);
    assert_eq!(second["status"], "QUEUED");
    assert_eq!(srv.backends.queue.len(), 2);
}

#[tokio::test]
async fn list_filters_and_paginates() {
    let srv = TestServer::spawn().await;
    let (world, entities, claim) = srv.seed_world();
    let (other_world, other_entities, other_claim) = srv.seed_world();
    let client = reqwest::Client::new();

    for n in 0..3 {
        submit_ok(&client, &srv, &job_body(world, &entities, claim, &format!("tower {n}"))).await;
    }
    submit_ok(&client, &srv, &job_body(other_world, &other_entities, other_claim, "moat")).await;

    let res = client
        .get(srv.url(&format!("/asset-jobs?world_id={world}&limit=2")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let page: Value = res.json().await.unwrap();
    assert_eq!(page["total"], 3);
    assert_eq!(page["limit"], 2);
    assert_eq!(page["items"].as_array().unwrap().len(), 2);

    let res = client
        .get(srv.url(&format!("/asset-jobs?world_id={world}&skip=2&limit=2")))
        .send()
        .await
        .unwrap();
    let page: Value = res.json().await.unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 1);

    let res = client
        .get(srv.url("/asset-jobs?status=RUNNING"))
        .send()
        .await
        .unwrap();
    let page: Value = res.json().await.unwrap();
    assert_eq!(page["total"], 0);

    let res = client
        .get(srv.url("/asset-jobs?status=DONE"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(srv.url(&format!("/asset-jobs/{}", uuid::Uuid::now_v7())))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");

    let res = client
        .get(srv.url("/asset-jobs/not-a-uuid"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .get(srv.url(&format!("/assets/{}", uuid::Uuid::now_v7())))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn in_memory_server_generates_submitted_jobs() {
    let srv = TestServer::spawn_with_consumer().await;
    let (world, entities, claim) = srv.seed_world();
    let client = reqwest::Client::new();

    let job = submit_ok(&client, &srv, &job_body(world, &entities, claim, "a lighthouse")).await;
    let id = job["id"].as_str().unwrap().to_string();

    let mut fetched = Value::Null;
    for _ in 0..100 {
        fetched = client
            .get(srv.url(&format!("/asset-jobs/{id}")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if fetched["status"] == "SUCCEEDED" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(fetched["status"], "SUCCEEDED");
    assert_eq!(
        fetched["asset"]["storage_key"],
        format!("worlds/{world}/assets/{id}.png").as_str()
    );
    assert!(srv.backends.queue.is_empty());
}

#[tokio::test]
async fn assets_list_filters_and_clamps() {
    let srv = TestServer::spawn().await;
    let (world, entities, claim) = srv.seed_world();
    let (other_world, other_entities, other_claim) = srv.seed_world();
    let client = reqwest::Client::new();

    submit_and_complete(&client, &srv, world, &entities, claim, "tower").await;
    submit_and_complete(&client, &srv, world, &entities, claim, "bridge").await;
    submit_and_complete(&client, &srv, other_world, &other_entities, other_claim, "moat").await;

    let res = client
        .get(srv.url(&format!("/assets?world_id={world}&limit=1")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let page: Value = res.json().await.unwrap();
    assert_eq!(page["total"], 2);
    assert_eq!(page["limit"], 1);
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
    assert_eq!(page["items"][0]["world_id"], world.to_string().as_str());

    let res = client
        .get(srv.url(&format!(
            "/assets?related_entity_id={}&limit=1000",
            other_entities[0]
        )))
        .send()
        .await
        .unwrap();
    let page: Value = res.json().await.unwrap();
    assert_eq!(page["total"], 1);
    assert_eq!(page["limit"], 100);

    let res = client.get(srv.url("/assets")).send().await.unwrap();
    let page: Value = res.json().await.unwrap();
    assert_eq!(page["total"], 3);
    assert_eq!(page["skip"], 0);
    assert_eq!(page["limit"], 10);

    let res = client
        .get(srv.url("/assets?status=SHINY"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_submissions_share_one_job() {
    let srv = Arc::new(TestServer::spawn().await);
    let (world, entities, claim) = srv.seed_world();
    let body = job_body(world, &entities, claim, "a tower");

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let srv = srv.clone();
        let body = body.clone();
        tasks.spawn(async move {
            let res = submit(&reqwest::Client::new(), &srv, &body).await;
            assert!(res.status().is_success());
            let job: Value = res.json().await.unwrap();
            job["id"].as_str().unwrap().to_string()
        });
    }
    let mut ids = std::collections::HashSet::new();
    while let Some(id) = tasks.join_next().await {
        ids.insert(id.unwrap());
    }

    assert_eq!(ids.len(), 1);
    assert_eq!(srv.backends.jobs.job_count(), 1);
    assert_eq!(srv.backends.queue.len(), 1);
}
