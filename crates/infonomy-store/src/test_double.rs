//! In-memory `Store` test double, used by this crate's and `infonomy-engine`'s
//! unit tests so the concurrency/ledger logic can be exercised without a
//! running Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use infonomy_core::error::StoreError;
use infonomy_core::model::*;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::store::{
    ContextUpdate, NewDecisionContext, NewInfoOffer, NewInspection, NewSubscription, OfferUpdate, Store,
};

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, User>,
    buyer_profiles: HashMap<UserId, BuyerProfile>,
    human_sellers: HashMap<UserId, HumanSellerProfile>,
    bot_sellers: HashMap<UserId, BotSellerProfile>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    contexts: HashMap<ContextId, DecisionContext>,
    offers: HashMap<OfferId, InfoOffer>,
    inbox_items: HashMap<InboxItemId, InboxItem>,
    inspections: HashMap<InspectionId, Inspection>,
    next_id: i64,
}

impl Inner {
    fn alloc(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user with a given balance, bypassing the escrow API.
    pub fn seed_user(&self, total: f64, available: f64) -> UserId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.alloc();
        inner.users.insert(
            id,
            User {
                id,
                total_balance: total,
                available_balance: available,
                last_bonus_date: None,
                daily_bonus_amount: 10.0,
                api_keys: Default::default(),
            },
        );
        id
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_user(&self, id: UserId) -> Result<User, StoreError> {
        self.inner.lock().unwrap().users.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn create_user(&self, daily_bonus_amount: f64) -> Result<User, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.alloc();
        let user = User {
            id,
            total_balance: 0.0,
            available_balance: 0.0,
            last_bonus_date: None,
            daily_bonus_amount,
            api_keys: Default::default(),
        };
        inner.users.insert(id, user.clone());
        Ok(user)
    }

    async fn cas_balances(
        &self,
        id: UserId,
        expected_available: f64,
        new_available: f64,
        new_total: f64,
        new_last_bonus_date: Option<chrono::NaiveDate>,
    ) -> Result<User, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let user = inner.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        if user.available_balance != expected_available {
            return Err(StoreError::Conflict("stale balance read".into()));
        }
        user.available_balance = new_available;
        user.total_balance = new_total;
        user.last_bonus_date = new_last_bonus_date;
        Ok(user.clone())
    }

    async fn get_buyer_profile(&self, user_id: UserId) -> Result<BuyerProfile, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .buyer_profiles
            .get(&user_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn upsert_buyer_profile(&self, profile: BuyerProfile) -> Result<BuyerProfile, StoreError> {
        self.inner.lock().unwrap().buyer_profiles.insert(profile.user_id, profile.clone());
        Ok(profile)
    }

    async fn record_buyer_query(&self, user_id: UserId, priority: Priority) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(p) = inner.buyer_profiles.get_mut(&user_id) {
            *p.counters.queries.entry(priority.as_i16()).or_insert(0) += 1;
        }
        Ok(())
    }

    async fn record_buyer_inspected(&self, user_id: UserId, priority: Priority) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(p) = inner.buyer_profiles.get_mut(&user_id) {
            *p.counters.inspected.entry(priority.as_i16()).or_insert(0) += 1;
        }
        Ok(())
    }

    async fn record_buyer_purchased(&self, user_id: UserId, priority: Priority) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(p) = inner.buyer_profiles.get_mut(&user_id) {
            *p.counters.purchased.entry(priority.as_i16()).or_insert(0) += 1;
        }
        Ok(())
    }

    async fn get_human_seller(&self, user_id: UserId) -> Result<HumanSellerProfile, StoreError> {
        self.inner.lock().unwrap().human_sellers.get(&user_id).cloned().ok_or(StoreError::NotFound)
    }

    async fn create_human_seller(&self, user_id: UserId) -> Result<HumanSellerProfile, StoreError> {
        let profile = HumanSellerProfile { user_id };
        self.inner.lock().unwrap().human_sellers.insert(user_id, profile.clone());
        Ok(profile)
    }

    async fn get_bot_seller(&self, id: UserId) -> Result<BotSellerProfile, StoreError> {
        self.inner.lock().unwrap().bot_sellers.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn create_bot_seller(&self, owner_user_id: UserId, kind: BotSellerKind) -> Result<BotSellerProfile, StoreError> {
        kind.validate().map_err(|e| StoreError::Conflict(e.to_string()))?;
        let mut inner = self.inner.lock().unwrap();
        let id = inner.alloc();
        let profile = BotSellerProfile { id, owner_user_id, kind };
        inner.bot_sellers.insert(id, profile.clone());
        Ok(profile)
    }

    async fn update_bot_seller(&self, id: UserId, kind: BotSellerKind) -> Result<BotSellerProfile, StoreError> {
        kind.validate().map_err(|e| StoreError::Conflict(e.to_string()))?;
        let mut inner = self.inner.lock().unwrap();
        let profile = inner.bot_sellers.get_mut(&id).ok_or(StoreError::NotFound)?;
        profile.kind = kind;
        Ok(profile.clone())
    }

    async fn delete_bot_seller(&self, id: UserId) -> Result<(), StoreError> {
        self.inner.lock().unwrap().bot_sellers.remove(&id);
        Ok(())
    }

    async fn list_bot_sellers_owned_by(&self, owner_user_id: UserId) -> Result<Vec<BotSellerProfile>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .bot_sellers
            .values()
            .filter(|p| p.owner_user_id == owner_user_id)
            .cloned()
            .collect())
    }

    async fn create_subscription(&self, sub: NewSubscription) -> Result<Subscription, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.alloc();
        let subscription = Subscription {
            id,
            owner: sub.owner,
            keywords: sub.keywords,
            context_pages: sub.context_pages,
            min_budget: sub.min_budget,
            min_priority: sub.min_priority,
            min_inspection_rate: sub.min_inspection_rate,
            min_purchase_rate: sub.min_purchase_rate,
            buyer_type_filter: sub.buyer_type_filter,
            age_limit_secs: sub.age_limit_secs,
        };
        inner.subscriptions.insert(id, subscription.clone());
        Ok(subscription)
    }

    async fn update_subscription(&self, id: SubscriptionId, sub: NewSubscription) -> Result<Subscription, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let existing = inner.subscriptions.get_mut(&id).ok_or(StoreError::NotFound)?;
        existing.keywords = sub.keywords;
        existing.context_pages = sub.context_pages;
        existing.min_budget = sub.min_budget;
        existing.min_priority = sub.min_priority;
        existing.min_inspection_rate = sub.min_inspection_rate;
        existing.min_purchase_rate = sub.min_purchase_rate;
        existing.buyer_type_filter = sub.buyer_type_filter;
        existing.age_limit_secs = sub.age_limit_secs;
        Ok(existing.clone())
    }

    async fn delete_subscription(&self, id: SubscriptionId) -> Result<(), StoreError> {
        self.inner.lock().unwrap().subscriptions.remove(&id);
        Ok(())
    }

    async fn get_subscription(&self, id: SubscriptionId) -> Result<Subscription, StoreError> {
        self.inner.lock().unwrap().subscriptions.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn list_subscriptions_owned_by(&self, owner: SellerRef) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .filter(|s| s.owner == owner)
            .cloned()
            .collect())
    }

    async fn list_subscriptions_eligible_for(
        &self,
        max_budget: f64,
        priority: Priority,
    ) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .filter(|s| s.min_budget <= max_budget && s.min_priority <= priority)
            .cloned()
            .collect())
    }

    async fn create_context(&self, ctx: NewDecisionContext) -> Result<DecisionContext, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.alloc();
        let context = DecisionContext {
            id,
            query: ctx.query,
            context_pages: ctx.context_pages,
            buyer_id: ctx.buyer_id,
            max_budget: ctx.max_budget,
            priority: ctx.priority,
            created_at: Utc::now(),
            target_human_seller_ids: ctx.target_human_seller_ids,
            target_bot_seller_ids: ctx.target_bot_seller_ids,
            parent_id: ctx.parent_id,
            parent_offers: ctx.parent_offers,
        };
        inner.contexts.insert(id, context.clone());
        Ok(context)
    }

    async fn get_context(&self, id: ContextId) -> Result<DecisionContext, StoreError> {
        self.inner.lock().unwrap().contexts.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn update_context(&self, id: ContextId, update: ContextUpdate) -> Result<DecisionContext, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let ctx = inner.contexts.get_mut(&id).ok_or(StoreError::NotFound)?;
        if let Some(query) = update.query {
            ctx.query = Some(query);
        }
        if let Some(pages) = update.context_pages {
            ctx.context_pages = Some(pages);
        }
        if let Some(budget) = update.max_budget {
            ctx.max_budget = budget;
        }
        if let Some(priority) = update.priority {
            ctx.priority = priority;
        }
        Ok(ctx.clone())
    }

    async fn delete_context(&self, id: ContextId) -> Result<(), StoreError> {
        self.inner.lock().unwrap().contexts.remove(&id);
        Ok(())
    }

    async fn list_contexts_for_buyer(&self, buyer_id: UserId) -> Result<Vec<DecisionContext>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .contexts
            .values()
            .filter(|c| c.buyer_id == buyer_id)
            .cloned()
            .collect())
    }

    async fn list_root_contexts(&self) -> Result<Vec<DecisionContext>, StoreError> {
        Ok(self.inner.lock().unwrap().contexts.values().filter(|c| c.is_root()).cloned().collect())
    }

    async fn create_offer(&self, offer: NewInfoOffer) -> Result<InfoOffer, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.alloc();
        let offer = InfoOffer {
            id,
            seller: offer.seller,
            context_id: offer.context_id,
            private_info: offer.private_info,
            public_info: offer.public_info,
            price: offer.price,
            created_at: Utc::now(),
            inspected: false,
            purchased: false,
        };
        inner.offers.insert(id, offer.clone());
        Ok(offer)
    }

    async fn get_offer(&self, id: OfferId) -> Result<InfoOffer, StoreError> {
        self.inner.lock().unwrap().offers.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn update_offer(&self, id: OfferId, update: OfferUpdate) -> Result<InfoOffer, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let offer = inner.offers.get_mut(&id).ok_or(StoreError::NotFound)?;
        if let Some(private_info) = update.private_info {
            offer.private_info = private_info;
        }
        if let Some(public_info) = update.public_info {
            offer.public_info = public_info;
        }
        if let Some(price) = update.price {
            offer.price = price;
        }
        Ok(offer.clone())
    }

    async fn delete_offer(&self, id: OfferId) -> Result<(), StoreError> {
        self.inner.lock().unwrap().offers.remove(&id);
        Ok(())
    }

    async fn list_offers_for_context(&self, context_id: ContextId) -> Result<Vec<InfoOffer>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .offers
            .values()
            .filter(|o| o.context_id == context_id)
            .cloned()
            .collect())
    }

    async fn list_uninspected_offers(
        &self,
        context_id: ContextId,
        already_known: &[OfferId],
    ) -> Result<Vec<InfoOffer>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .offers
            .values()
            .filter(|o| o.context_id == context_id && !o.inspected && !already_known.contains(&o.id))
            .cloned()
            .collect())
    }

    async fn mark_offer_inspected(&self, id: OfferId) -> Result<(), StoreError> {
        if let Some(o) = self.inner.lock().unwrap().offers.get_mut(&id) {
            o.inspected = true;
        }
        Ok(())
    }

    async fn mark_offer_purchased(&self, id: OfferId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let offer = inner.offers.get_mut(&id).ok_or(StoreError::NotFound)?;
        if offer.purchased {
            return Err(StoreError::Conflict(format!("offer {id} is already purchased")));
        }
        offer.purchased = true;
        offer.inspected = true;
        Ok(())
    }

    async fn create_inbox_item(
        &self,
        subscription_id: SubscriptionId,
        context_id: ContextId,
        expires_at: DateTime<Utc>,
    ) -> Result<InboxItem, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.alloc();
        let item = InboxItem {
            id,
            subscription_id,
            context_id,
            status: InboxStatus::New,
            created_at: Utc::now(),
            expires_at,
        };
        inner.inbox_items.insert(id, item.clone());
        Ok(item)
    }

    async fn delete_inbox_items_for_context(&self, context_id: ContextId) -> Result<(), StoreError> {
        self.inner.lock().unwrap().inbox_items.retain(|_, v| v.context_id != context_id);
        Ok(())
    }

    async fn list_inbox_for_subscription(&self, subscription_id: SubscriptionId) -> Result<Vec<InboxItem>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .inbox_items
            .values()
            .filter(|i| i.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn set_inbox_status(&self, id: InboxItemId, status: InboxStatus) -> Result<(), StoreError> {
        if let Some(item) = self.inner.lock().unwrap().inbox_items.get_mut(&id) {
            item.status = status;
        }
        Ok(())
    }

    async fn create_inspection(&self, insp: NewInspection) -> Result<Inspection, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.alloc();
        let inspection = Inspection {
            id,
            decision_context_id: insp.decision_context_id,
            buyer_id: insp.buyer_id,
            known_offers: insp.known_offers,
            purchased: vec![],
            info_offer_ids: vec![],
            job_id: insp.job_id,
            elder_brother_id: insp.elder_brother_id,
            younger_brother_id: None,
            child_context_id: insp.child_context_id,
            created_at: Utc::now(),
        };
        inner.inspections.insert(id, inspection.clone());
        if let Some(elder_id) = insp.elder_brother_id {
            if let Some(elder) = inner.inspections.get_mut(&elder_id) {
                elder.younger_brother_id = Some(id);
            }
        }
        Ok(inspection)
    }

    async fn get_inspection(&self, id: InspectionId) -> Result<Inspection, StoreError> {
        self.inner.lock().unwrap().inspections.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn set_inspection_purchases(
        &self,
        id: InspectionId,
        purchased: Vec<OfferId>,
        info_offer_ids: Vec<OfferId>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let inspection = inner.inspections.get_mut(&id).ok_or(StoreError::NotFound)?;
        inspection.purchased = purchased;
        inspection.info_offer_ids = info_offer_ids;
        Ok(())
    }

    async fn set_inspection_child_context(&self, id: InspectionId, child_context_id: ContextId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let inspection = inner.inspections.get_mut(&id).ok_or(StoreError::NotFound)?;
        inspection.child_context_id = Some(child_context_id);
        Ok(())
    }

    async fn list_inspections_for_context(&self, context_id: ContextId) -> Result<Vec<Inspection>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .inspections
            .values()
            .filter(|i| i.decision_context_id == context_id)
            .cloned()
            .collect())
    }
}
