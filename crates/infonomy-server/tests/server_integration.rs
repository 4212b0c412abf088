//! Integration tests for the market's HTTP surface.
//!
//! These spawn a real axum server on a random port, backed by the in-memory
//! `Store` test double, and exercise the REST endpoints with `reqwest`.

use std::sync::Arc;

use infonomy_agent::AgentBridge;
use infonomy_core::config::Config;
use infonomy_core::model::{BuyerProfile, PriorityCounters, UserId};
use infonomy_server::{build_router, spawn_worker_pool, start_server, AppState, JobRegistry};
use infonomy_store::test_double::InMemoryStore;
use infonomy_store::Store;

/// Seeds the buyer profile `create_context` now requires before escrowing.
async fn seed_buyer(store: &InMemoryStore, user_id: UserId) {
    store
        .upsert_buyer_profile(BuyerProfile {
            user_id,
            default_agent_model: "test-model".into(),
            default_agent_prompt: String::new(),
            default_max_budget: 50.0,
            counters: PriorityCounters::default(),
        })
        .await
        .unwrap();
}

async fn spawn_test_server() -> (Arc<InMemoryStore>, String) {
    let store = Arc::new(InMemoryStore::new());
    let agent = Arc::new(AgentBridge::new("test-key").unwrap());
    let config = Arc::new(Config::default());
    let jobs = JobRegistry::new();
    let job_tx = spawn_worker_pool(store.clone() as Arc<dyn Store>, agent.clone(), config.clone(), jobs.clone(), 4);

    let app_state = AppState { store: store.clone() as Arc<dyn Store>, agent, config, jobs, job_tx };
    let router = build_router(app_state);
    let addr = start_server(router, ([127, 0, 0, 1], 0).into()).await;
    (store, format!("http://{addr}"))
}

#[tokio::test]
async fn create_context_escrows_and_returns_the_new_context() {
    let (store, base) = spawn_test_server().await;
    let buyer = store.seed_user(100.0, 100.0);
    seed_buyer(&store, buyer).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/contexts"))
        .header("x-user-id", buyer.to_string())
        .json(&serde_json::json!({"query": "best espresso machine", "max_budget": 20.0, "priority": "low"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["buyer_id"], buyer);
    assert_eq!(body["max_budget"], 20.0);

    let user = store.get_user(buyer).await.unwrap();
    assert_eq!(user.available_balance, 80.0, "escrow must debit available_balance");
    assert_eq!(user.total_balance, 100.0, "escrow must not touch total_balance");
}

#[tokio::test]
async fn create_context_rejects_a_nonpositive_budget() {
    let (store, base) = spawn_test_server().await;
    let buyer = store.seed_user(100.0, 100.0);
    seed_buyer(&store, buyer).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/contexts"))
        .header("x-user-id", buyer.to_string())
        .json(&serde_json::json!({"max_budget": 0.0, "priority": "low"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn create_context_rejects_insufficient_funds() {
    let (store, base) = spawn_test_server().await;
    let buyer = store.seed_user(10.0, 10.0);
    seed_buyer(&store, buyer).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/contexts"))
        .header("x-user-id", buyer.to_string())
        .json(&serde_json::json!({"max_budget": 50.0, "priority": "low"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn update_context_rejects_a_non_owning_buyer() {
    let (store, base) = spawn_test_server().await;
    let buyer = store.seed_user(100.0, 100.0);
    let intruder = store.seed_user(100.0, 100.0);
    seed_buyer(&store, buyer).await;

    let ctx: serde_json::Value = reqwest::Client::new()
        .post(format!("{base}/contexts"))
        .header("x-user-id", buyer.to_string())
        .json(&serde_json::json!({"max_budget": 20.0, "priority": "low"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = ctx["id"].as_i64().unwrap();

    let resp = reqwest::Client::new()
        .patch(format!("{base}/contexts/{id}"))
        .header("x-user-id", intruder.to_string())
        .json(&serde_json::json!({"max_budget": 30.0}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn get_context_rejects_child_contexts() {
    let (store, base) = spawn_test_server().await;
    let buyer = store.seed_user(100.0, 100.0);
    let root = store
        .create_context(infonomy_store::NewDecisionContext {
            query: Some("root".into()),
            context_pages: None,
            buyer_id: buyer,
            max_budget: 20.0,
            priority: infonomy_core::model::Priority::Low,
            target_human_seller_ids: None,
            target_bot_seller_ids: None,
            parent_id: None,
            parent_offers: vec![],
        })
        .await
        .unwrap();
    let mut child = infonomy_store::NewDecisionContext {
        query: Some("child".into()),
        context_pages: None,
        buyer_id: buyer,
        max_budget: 5.0,
        priority: infonomy_core::model::Priority::High,
        target_human_seller_ids: None,
        target_bot_seller_ids: None,
        parent_id: Some(root.id),
        parent_offers: vec![],
    };
    child.parent_id = Some(root.id);
    let child = store.create_context(child).await.unwrap();

    let resp = reqwest::get(format!("{base}/contexts/{}", child.id)).await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn offer_projection_hides_private_info_from_non_sellers() {
    let (store, base) = spawn_test_server().await;
    let buyer = store.seed_user(100.0, 100.0);
    let seller = store.seed_user(0.0, 0.0);
    let stranger = store.seed_user(0.0, 0.0);
    seed_buyer(&store, buyer).await;
    store.create_human_seller(seller).await.unwrap();

    let ctx: serde_json::Value = reqwest::Client::new()
        .post(format!("{base}/contexts"))
        .header("x-user-id", buyer.to_string())
        .json(&serde_json::json!({"max_budget": 20.0, "priority": "low"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let cid = ctx["id"].as_i64().unwrap();

    let client = reqwest::Client::new();
    let created: serde_json::Value = client
        .post(format!("{base}/contexts/{cid}/offers"))
        .header("x-user-id", seller.to_string())
        .json(&serde_json::json!({"private_info": "the real secret", "public_info": "teaser", "price": 5.0}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(created["private_info"], "the real secret", "the seller sees their own private_info");
    let oid = created["id"].as_i64().unwrap();

    let as_stranger: serde_json::Value = client
        .get(format!("{base}/contexts/{cid}/offers/{oid}"))
        .header("x-user-id", stranger.to_string())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(as_stranger["private_info"].is_null());
    assert_eq!(as_stranger["public_info"], "teaser");
}

#[tokio::test]
async fn subscription_lifecycle_rejects_a_non_owning_seller() {
    let (store, base) = spawn_test_server().await;
    let seller = store.seed_user(0.0, 0.0);
    let intruder = store.seed_user(0.0, 0.0);
    store.create_human_seller(seller).await.unwrap();

    let client = reqwest::Client::new();
    let created: serde_json::Value = client
        .post(format!("{base}/sellers/me/subscriptions"))
        .header("x-user-id", seller.to_string())
        .json(&serde_json::json!({"min_priority": "low"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_i64().unwrap();

    let resp = client
        .delete(format!("{base}/sellers/me/subscriptions/{id}"))
        .header("x-user-id", intruder.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = client
        .delete(format!("{base}/sellers/me/subscriptions/{id}"))
        .header("x-user-id", seller.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn start_inspection_returns_a_job_that_eventually_finishes() {
    let (store, base) = spawn_test_server().await;
    let buyer = store.seed_user(100.0, 100.0);
    seed_buyer(&store, buyer).await;

    let ctx: serde_json::Value = reqwest::Client::new()
        .post(format!("{base}/contexts"))
        .header("x-user-id", buyer.to_string())
        .json(&serde_json::json!({"max_budget": 20.0, "priority": "low"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let cid = ctx["id"].as_i64().unwrap();

    let client = reqwest::Client::new();
    let started: serde_json::Value = client
        .post(format!("{base}/contexts/{cid}/inspections"))
        .header("x-user-id", buyer.to_string())
        .json(&serde_json::json!({"info_offer_ids": []}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let job_id = started["job_id"].as_i64().unwrap();

    let mut last_state = String::new();
    for _ in 0..50 {
        let status: serde_json::Value = reqwest::get(format!("{base}/jobs/{job_id}")).await.unwrap().json().await.unwrap();
        last_state = status["state"].as_str().unwrap().to_string();
        if last_state == "done" || last_state == "failed" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(last_state == "done" || last_state == "failed", "job never settled, last state: {last_state}");
}

#[tokio::test]
async fn get_job_returns_404_for_unknown_id() {
    let (_store, base) = spawn_test_server().await;
    let resp = reqwest::get(format!("{base}/jobs/999999")).await.unwrap();
    assert_eq!(resp.status(), 404);
}
