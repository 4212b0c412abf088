//! The `Store` trait (§4.1): transactional persistence for every entity in
//! §3, plus the indexed queries C3's matcher needs.
//!
//! Object-safe over `async_trait` so `infonomy-server`'s `AppState` can hold
//! an `Arc<dyn Store>` and swap in a test double without touching callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use infonomy_core::error::StoreError;
use infonomy_core::model::*;

/// A newly-created decision context, before the id is assigned.
#[derive(Debug, Clone)]
pub struct NewDecisionContext {
    pub query: Option<String>,
    pub context_pages: Option<Vec<String>>,
    pub buyer_id: UserId,
    pub max_budget: f64,
    pub priority: Priority,
    pub target_human_seller_ids: Option<Vec<UserId>>,
    pub target_bot_seller_ids: Option<Vec<UserId>>,
    pub parent_id: Option<ContextId>,
    pub parent_offers: Vec<OfferId>,
}

#[derive(Debug, Clone)]
pub struct NewInfoOffer {
    pub seller: SellerRef,
    pub context_id: ContextId,
    pub private_info: String,
    pub public_info: Option<String>,
    pub price: f64,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub owner: SellerRef,
    pub keywords: Option<Vec<String>>,
    pub context_pages: Option<Vec<String>>,
    pub min_budget: f64,
    pub min_priority: Priority,
    pub min_inspection_rate: f64,
    pub min_purchase_rate: f64,
    pub buyer_type_filter: Option<BuyerTypeFilter>,
    pub age_limit_secs: Option<i64>,
}

/// Partial update for a decision context (`PATCH /contexts/{id}`, §4.7).
/// `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct ContextUpdate {
    pub query: Option<String>,
    pub context_pages: Option<Vec<String>>,
    pub max_budget: Option<f64>,
    pub priority: Option<Priority>,
}

/// Partial update for an info offer (`PATCH /contexts/{cid}/offers/{oid}`, §4.7).
#[derive(Debug, Clone, Default)]
pub struct OfferUpdate {
    pub private_info: Option<String>,
    pub public_info: Option<Option<String>>,
    pub price: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct NewInspection {
    pub decision_context_id: ContextId,
    pub buyer_id: UserId,
    pub known_offers: Vec<OfferId>,
    pub job_id: Option<JobId>,
    pub elder_brother_id: Option<InspectionId>,
    pub child_context_id: Option<ContextId>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ── users / balances ───────────────────────────────────────
    async fn get_user(&self, id: UserId) -> Result<User, StoreError>;
    async fn create_user(&self, daily_bonus_amount: f64) -> Result<User, StoreError>;
    /// Compare-and-update: succeeds only if the row's `available_balance`
    /// still equals `expected_available`; returns `Conflict` otherwise so the
    /// caller (`BalanceKeeper`) can retry. Used instead of row locking so
    /// readers never block on an in-flight ledger update.
    async fn cas_balances(
        &self,
        id: UserId,
        expected_available: f64,
        new_available: f64,
        new_total: f64,
        new_last_bonus_date: Option<chrono::NaiveDate>,
    ) -> Result<User, StoreError>;

    // ── buyer profile ──────────────────────────────────────────
    async fn get_buyer_profile(&self, user_id: UserId) -> Result<BuyerProfile, StoreError>;
    async fn upsert_buyer_profile(&self, profile: BuyerProfile) -> Result<BuyerProfile, StoreError>;
    async fn record_buyer_query(&self, user_id: UserId, priority: Priority) -> Result<(), StoreError>;
    async fn record_buyer_inspected(&self, user_id: UserId, priority: Priority) -> Result<(), StoreError>;
    async fn record_buyer_purchased(&self, user_id: UserId, priority: Priority) -> Result<(), StoreError>;

    // ── seller profiles ────────────────────────────────────────
    async fn get_human_seller(&self, user_id: UserId) -> Result<HumanSellerProfile, StoreError>;
    async fn create_human_seller(&self, user_id: UserId) -> Result<HumanSellerProfile, StoreError>;
    async fn get_bot_seller(&self, id: UserId) -> Result<BotSellerProfile, StoreError>;
    async fn create_bot_seller(
        &self,
        owner_user_id: UserId,
        kind: BotSellerKind,
    ) -> Result<BotSellerProfile, StoreError>;
    async fn update_bot_seller(&self, id: UserId, kind: BotSellerKind) -> Result<BotSellerProfile, StoreError>;
    async fn delete_bot_seller(&self, id: UserId) -> Result<(), StoreError>;
    async fn list_bot_sellers_owned_by(&self, owner_user_id: UserId) -> Result<Vec<BotSellerProfile>, StoreError>;

    // ── subscriptions ───────────────────────────────────────────
    async fn create_subscription(&self, sub: NewSubscription) -> Result<Subscription, StoreError>;
    async fn update_subscription(&self, id: SubscriptionId, sub: NewSubscription) -> Result<Subscription, StoreError>;
    async fn delete_subscription(&self, id: SubscriptionId) -> Result<(), StoreError>;
    async fn get_subscription(&self, id: SubscriptionId) -> Result<Subscription, StoreError>;
    async fn list_subscriptions_owned_by(&self, owner: SellerRef) -> Result<Vec<Subscription>, StoreError>;
    /// `(subscription.min_budget, min_priority)` index: the cheap SQL
    /// prefilter before the matcher's in-process predicate pass (§4.3).
    async fn list_subscriptions_eligible_for(
        &self,
        max_budget: f64,
        priority: Priority,
    ) -> Result<Vec<Subscription>, StoreError>;

    // ── decision contexts ───────────────────────────────────────
    async fn create_context(&self, ctx: NewDecisionContext) -> Result<DecisionContext, StoreError>;
    async fn get_context(&self, id: ContextId) -> Result<DecisionContext, StoreError>;
    async fn update_context(&self, id: ContextId, update: ContextUpdate) -> Result<DecisionContext, StoreError>;
    async fn delete_context(&self, id: ContextId) -> Result<(), StoreError>;
    async fn list_contexts_for_buyer(&self, buyer_id: UserId) -> Result<Vec<DecisionContext>, StoreError>;
    async fn list_root_contexts(&self) -> Result<Vec<DecisionContext>, StoreError>;

    // ── info offers ─────────────────────────────────────────────
    async fn create_offer(&self, offer: NewInfoOffer) -> Result<InfoOffer, StoreError>;
    async fn get_offer(&self, id: OfferId) -> Result<InfoOffer, StoreError>;
    async fn update_offer(&self, id: OfferId, update: OfferUpdate) -> Result<InfoOffer, StoreError>;
    async fn delete_offer(&self, id: OfferId) -> Result<(), StoreError>;
    async fn list_offers_for_context(&self, context_id: ContextId) -> Result<Vec<InfoOffer>, StoreError>;
    async fn list_uninspected_offers(
        &self,
        context_id: ContextId,
        already_known: &[OfferId],
    ) -> Result<Vec<InfoOffer>, StoreError>;
    async fn mark_offer_inspected(&self, id: OfferId) -> Result<(), StoreError>;
    async fn mark_offer_purchased(&self, id: OfferId) -> Result<(), StoreError>;

    // ── inbox ───────────────────────────────────────────────────
    async fn create_inbox_item(
        &self,
        subscription_id: SubscriptionId,
        context_id: ContextId,
        expires_at: DateTime<Utc>,
    ) -> Result<InboxItem, StoreError>;
    async fn delete_inbox_items_for_context(&self, context_id: ContextId) -> Result<(), StoreError>;
    async fn list_inbox_for_subscription(&self, subscription_id: SubscriptionId) -> Result<Vec<InboxItem>, StoreError>;
    async fn set_inbox_status(&self, id: InboxItemId, status: InboxStatus) -> Result<(), StoreError>;

    // ── inspections ─────────────────────────────────────────────
    async fn create_inspection(&self, insp: NewInspection) -> Result<Inspection, StoreError>;
    async fn get_inspection(&self, id: InspectionId) -> Result<Inspection, StoreError>;
    async fn set_inspection_purchases(
        &self,
        id: InspectionId,
        purchased: Vec<OfferId>,
        info_offer_ids: Vec<OfferId>,
    ) -> Result<(), StoreError>;
    async fn set_inspection_child_context(&self, id: InspectionId, child_context_id: ContextId) -> Result<(), StoreError>;
    async fn list_inspections_for_context(&self, context_id: ContextId) -> Result<Vec<Inspection>, StoreError>;
}
