//! REST handlers for the market's HTTP surface (§4.7, §6).

use std::sync::Arc;

use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;
use infonomy_agent::AgentBridge;
use infonomy_core::config::Config;
use infonomy_core::error::{MarketError, StoreError};
use infonomy_core::model::{
    BuyerTypeFilter, ContextId, DecisionContext, InfoOfferView, OfferId, Priority, SellerRef, Subscription,
    SubscriptionId, UserId,
};
use infonomy_store::{ContextUpdate, NewDecisionContext, NewInfoOffer, NewSubscription, OfferUpdate, Store};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ApiError;
use crate::jobs::{Job, JobId, JobRegistry};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub agent: Arc<AgentBridge>,
    pub config: Arc<Config>,
    pub jobs: JobRegistry,
    pub job_tx: mpsc::Sender<Job>,
}

/// The caller's identity, taken from the `X-User-Id` header. Real credential
/// issuance (JWT) is out of scope (§3 GLOSSARY); this is the minimal
/// authenticated-principal extractor the rest of the surface needs.
pub struct Principal(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for Principal {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("x-user-id")
            .ok_or((StatusCode::UNAUTHORIZED, "missing X-User-Id header"))?;
        let raw = header.to_str().map_err(|_| (StatusCode::UNAUTHORIZED, "invalid X-User-Id header"))?;
        let id: UserId = raw.parse().map_err(|_| (StatusCode::UNAUTHORIZED, "invalid X-User-Id header"))?;
        Ok(Principal(id))
    }
}

/// Same as [`Principal`] but absent entirely for anonymous reads.
pub struct OptionalPrincipal(pub Option<UserId>);

impl<S: Send + Sync> FromRequestParts<S> for OptionalPrincipal {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get("x-user-id")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse().ok());
        Ok(OptionalPrincipal(id))
    }
}

fn project_offer(offer: &infonomy_core::model::InfoOffer, ctx: &DecisionContext, viewer: Option<UserId>) -> InfoOfferView {
    let viewer_ref = viewer.map(|id| SellerRef::Human { id });
    let viewer_purchased = offer.purchased && viewer == Some(ctx.buyer_id);
    offer.project(viewer_ref, viewer_purchased)
}

// ── contexts ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateContextRequest {
    pub query: Option<String>,
    pub pages: Option<Vec<String>>,
    pub max_budget: f64,
    pub priority: Priority,
    pub target_human_seller_ids: Option<Vec<UserId>>,
    pub target_bot_seller_ids: Option<Vec<UserId>>,
}

pub async fn create_context(
    State(app): State<AppState>,
    Principal(buyer_id): Principal,
    Json(body): Json<CreateContextRequest>,
) -> Result<(StatusCode, Json<DecisionContext>), ApiError> {
    match app.store.get_buyer_profile(buyer_id).await {
        Ok(_) => {}
        Err(StoreError::NotFound) => return Err(MarketError::Validation("no buyer profile".into()).into()),
        Err(e) => return Err(e.into()),
    }

    if body.max_budget <= 0.0 {
        return Err(MarketError::Validation("max_budget must be positive".into()).into());
    }

    infonomy_store::BalanceKeeper::new(app.store.as_ref())
        .escrow(buyer_id, body.max_budget)
        .await?;

    let ctx = app
        .store
        .create_context(NewDecisionContext {
            query: body.query,
            context_pages: body.pages,
            buyer_id,
            max_budget: body.max_budget,
            priority: body.priority,
            target_human_seller_ids: body.target_human_seller_ids,
            target_bot_seller_ids: body.target_bot_seller_ids,
            parent_id: None,
            parent_offers: vec![],
        })
        .await?;

    app.store.record_buyer_query(buyer_id, ctx.priority).await?;
    let _ = app.job_tx.try_send(Job::FanOutContext { context_id: ctx.id });

    Ok((StatusCode::CREATED, Json(ctx)))
}

#[derive(Deserialize, Default)]
pub struct UpdateContextRequest {
    pub query: Option<String>,
    pub pages: Option<Vec<String>>,
    pub max_budget: Option<f64>,
    pub priority: Option<Priority>,
}

pub async fn update_context(
    State(app): State<AppState>,
    Principal(buyer_id): Principal,
    Path(id): Path<ContextId>,
    Json(body): Json<UpdateContextRequest>,
) -> Result<Json<DecisionContext>, ApiError> {
    let ctx = app.store.get_context(id).await?;
    if ctx.buyer_id != buyer_id {
        return Err(MarketError::Authorization.into());
    }

    let ctx = app
        .store
        .update_context(
            id,
            ContextUpdate {
                query: body.query,
                context_pages: body.pages,
                max_budget: body.max_budget,
                priority: body.priority,
            },
        )
        .await?;

    let _ = app.job_tx.try_send(Job::FanOutContext { context_id: ctx.id });
    Ok(Json(ctx))
}

pub async fn delete_context(
    State(app): State<AppState>,
    Principal(buyer_id): Principal,
    Path(id): Path<ContextId>,
) -> Result<StatusCode, ApiError> {
    let ctx = app.store.get_context(id).await?;
    if ctx.buyer_id != buyer_id {
        return Err(MarketError::Authorization.into());
    }

    // Best-effort: refund the escrow outstanding against this context.
    // Mid-inspection settlement racing a delete is not fully reconciled here.
    infonomy_store::BalanceKeeper::new(app.store.as_ref())
        .refund(buyer_id, ctx.max_budget)
        .await?;

    app.store.delete_inbox_items_for_context(id).await?;
    app.store.delete_context(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_context(
    State(app): State<AppState>,
    Path(id): Path<ContextId>,
) -> Result<Json<DecisionContext>, ApiError> {
    let ctx = app.store.get_context(id).await?;
    if !ctx.is_root() {
        return Err(MarketError::NotFound.into());
    }
    Ok(Json(ctx))
}

// ── offers ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateOfferRequest {
    pub private_info: String,
    pub public_info: Option<String>,
    pub price: f64,
}

pub async fn create_offer(
    State(app): State<AppState>,
    Principal(seller_id): Principal,
    Path(cid): Path<ContextId>,
    Json(body): Json<CreateOfferRequest>,
) -> Result<(StatusCode, Json<InfoOfferView>), ApiError> {
    match app.store.get_human_seller(seller_id).await {
        Ok(_) => {}
        Err(StoreError::NotFound) => return Err(MarketError::Validation("not a seller".into()).into()),
        Err(e) => return Err(e.into()),
    }

    if body.price <= 0.0 {
        return Err(MarketError::Validation("price must be positive".into()).into());
    }
    let ctx = app.store.get_context(cid).await?;
    let offer = app
        .store
        .create_offer(NewInfoOffer {
            seller: SellerRef::Human { id: seller_id },
            context_id: cid,
            private_info: body.private_info,
            public_info: body.public_info,
            price: body.price,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(project_offer(&offer, &ctx, Some(seller_id)))))
}

#[derive(Deserialize, Default)]
pub struct UpdateOfferRequest {
    pub private_info: Option<String>,
    pub public_info: Option<String>,
    pub price: Option<f64>,
}

pub async fn update_offer(
    State(app): State<AppState>,
    Principal(seller_id): Principal,
    Path((cid, oid)): Path<(ContextId, OfferId)>,
    Json(body): Json<UpdateOfferRequest>,
) -> Result<Json<InfoOfferView>, ApiError> {
    let ctx = app.store.get_context(cid).await?;
    let offer = app.store.get_offer(oid).await?;
    if offer.seller != (SellerRef::Human { id: seller_id }) {
        return Err(MarketError::Authorization.into());
    }

    let offer = app
        .store
        .update_offer(
            oid,
            OfferUpdate {
                private_info: body.private_info,
                public_info: body.public_info.map(Some),
                price: body.price,
            },
        )
        .await?;
    Ok(Json(project_offer(&offer, &ctx, Some(seller_id))))
}

pub async fn delete_offer(
    State(app): State<AppState>,
    Principal(seller_id): Principal,
    Path((cid, oid)): Path<(ContextId, OfferId)>,
) -> Result<Json<InfoOfferView>, ApiError> {
    let ctx = app.store.get_context(cid).await?;
    let offer = app.store.get_offer(oid).await?;
    if offer.seller != (SellerRef::Human { id: seller_id }) {
        return Err(MarketError::Authorization.into());
    }
    app.store.delete_offer(oid).await?;
    Ok(Json(project_offer(&offer, &ctx, Some(seller_id))))
}

pub async fn list_offers(
    State(app): State<AppState>,
    OptionalPrincipal(viewer): OptionalPrincipal,
    Path(cid): Path<ContextId>,
) -> Result<Json<Vec<InfoOfferView>>, ApiError> {
    let ctx = app.store.get_context(cid).await?;
    let offers = app.store.list_offers_for_context(cid).await?;
    Ok(Json(offers.iter().map(|o| project_offer(o, &ctx, viewer)).collect()))
}

pub async fn get_offer(
    State(app): State<AppState>,
    OptionalPrincipal(viewer): OptionalPrincipal,
    Path((cid, oid)): Path<(ContextId, OfferId)>,
) -> Result<Json<InfoOfferView>, ApiError> {
    let ctx = app.store.get_context(cid).await?;
    let offer = app.store.get_offer(oid).await?;
    Ok(Json(project_offer(&offer, &ctx, viewer)))
}

// ── subscriptions ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SubscriptionRequest {
    #[serde(default)]
    pub keywords: Option<Vec<String>>,
    #[serde(default)]
    pub context_pages: Option<Vec<String>>,
    #[serde(default)]
    pub min_budget: f64,
    pub min_priority: Priority,
    #[serde(default)]
    pub min_inspection_rate: f64,
    #[serde(default)]
    pub min_purchase_rate: f64,
    #[serde(default)]
    pub buyer_type_filter: Option<BuyerTypeFilter>,
    #[serde(default)]
    pub age_limit_secs: Option<i64>,
}

pub async fn create_subscription(
    State(app): State<AppState>,
    Principal(seller_id): Principal,
    Json(body): Json<SubscriptionRequest>,
) -> Result<(StatusCode, Json<Subscription>), ApiError> {
    app.store.get_human_seller(seller_id).await?;

    let sub = app
        .store
        .create_subscription(NewSubscription {
            owner: SellerRef::Human { id: seller_id },
            keywords: body.keywords,
            context_pages: body.context_pages,
            min_budget: body.min_budget,
            min_priority: body.min_priority,
            min_inspection_rate: body.min_inspection_rate,
            min_purchase_rate: body.min_purchase_rate,
            buyer_type_filter: body.buyer_type_filter,
            age_limit_secs: body.age_limit_secs,
        })
        .await?;

    infonomy_matcher::MatcherIndex::new(app.store.as_ref()).refresh_by_subscription(&sub).await?;
    Ok((StatusCode::CREATED, Json(sub)))
}

pub async fn update_subscription(
    State(app): State<AppState>,
    Principal(seller_id): Principal,
    Path(id): Path<SubscriptionId>,
    Json(body): Json<SubscriptionRequest>,
) -> Result<Json<Subscription>, ApiError> {
    let existing = app.store.get_subscription(id).await?;
    if existing.owner != (SellerRef::Human { id: seller_id }) {
        return Err(MarketError::Authorization.into());
    }

    let sub = app
        .store
        .update_subscription(
            id,
            NewSubscription {
                owner: existing.owner,
                keywords: body.keywords,
                context_pages: body.context_pages,
                min_budget: body.min_budget,
                min_priority: body.min_priority,
                min_inspection_rate: body.min_inspection_rate,
                min_purchase_rate: body.min_purchase_rate,
                buyer_type_filter: body.buyer_type_filter,
                age_limit_secs: body.age_limit_secs,
            },
        )
        .await?;

    infonomy_matcher::MatcherIndex::new(app.store.as_ref()).refresh_by_subscription(&sub).await?;
    Ok(Json(sub))
}

pub async fn delete_subscription(
    State(app): State<AppState>,
    Principal(seller_id): Principal,
    Path(id): Path<SubscriptionId>,
) -> Result<StatusCode, ApiError> {
    let existing = app.store.get_subscription(id).await?;
    if existing.owner != (SellerRef::Human { id: seller_id }) {
        return Err(MarketError::Authorization.into());
    }
    infonomy_matcher::MatcherIndex::new(app.store.as_ref()).purge_subscription(id).await?;
    app.store.delete_subscription(id).await?;
    Ok(StatusCode::OK)
}

pub async fn get_inbox(
    State(app): State<AppState>,
    Principal(seller_id): Principal,
    Path(id): Path<SubscriptionId>,
) -> Result<Json<Vec<DecisionContext>>, ApiError> {
    let sub = app.store.get_subscription(id).await?;
    if sub.owner != (SellerRef::Human { id: seller_id }) {
        return Err(MarketError::Authorization.into());
    }

    let now = chrono::Utc::now();
    let items = app.store.list_inbox_for_subscription(id).await?;
    let mut contexts = Vec::new();
    for item in items {
        if item.status != infonomy_core::model::InboxStatus::New || !item.is_live(now) {
            continue;
        }
        if let Ok(ctx) = app.store.get_context(item.context_id).await {
            contexts.push(ctx);
        }
    }
    Ok(Json(contexts))
}

// ── inspections / jobs ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct StartInspectionRequest {
    pub info_offer_ids: Vec<OfferId>,
}

#[derive(Serialize)]
pub struct StartInspectionResponse {
    pub job_id: JobId,
}

pub async fn start_inspection(
    State(app): State<AppState>,
    Principal(buyer_id): Principal,
    Path(id): Path<ContextId>,
    Json(body): Json<StartInspectionRequest>,
) -> Result<(StatusCode, Json<StartInspectionResponse>), ApiError> {
    let ctx = app.store.get_context(id).await?;
    if ctx.buyer_id != buyer_id {
        return Err(MarketError::Authorization.into());
    }
    if !ctx.is_root() {
        return Err(MarketError::Validation("only root contexts can be inspected directly".into()).into());
    }

    let job_id = app.jobs.create();
    app.job_tx
        .try_send(Job::Inspect { job_id, context_id: id, info_offer_ids: body.info_offer_ids })
        .map_err(|_| MarketError::Transient("job queue full".into()))?;

    Ok((StatusCode::CREATED, Json(StartInspectionResponse { job_id })))
}

pub async fn get_job(State(app): State<AppState>, Path(id): Path<JobId>) -> Result<Json<crate::jobs::JobStatus>, ApiError> {
    app.jobs.get(id).map(Json).ok_or_else(|| MarketError::NotFound.into())
}
