//! `MatcherIndex` (§4.3): the two refresh entry points over a `Store`.

use chrono::{Duration, Utc};
use infonomy_core::error::MarketError;
use infonomy_core::model::{ContextId, DecisionContext, Subscription, SubscriptionId};
use infonomy_store::Store;
use tracing::debug;

use crate::predicate;

pub struct MatcherIndex<'a> {
    store: &'a dyn Store,
}

impl<'a> MatcherIndex<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    /// Invoked when a context is created, updated, or deleted (§4.3).
    /// Recursive (child) contexts never fan out; they are consumed only by
    /// the parent's inspection.
    pub async fn refresh_by_context(&self, ctx: &DecisionContext) -> Result<Vec<Subscription>, MarketError> {
        self.store.delete_inbox_items_for_context(ctx.id).await?;

        if !ctx.is_public() {
            debug!("context {} is a child context; skipping matcher fan-out", ctx.id);
            return Ok(vec![]);
        }

        let candidates = self
            .store
            .list_subscriptions_eligible_for(ctx.max_budget, ctx.priority)
            .await?;

        let mut matched = Vec::new();
        for sub in candidates {
            if self.context_matches_subscription(ctx, &sub).await? {
                self.materialize(&sub, ctx).await?;
                matched.push(sub);
            }
        }
        Ok(matched)
    }

    /// Invoked when a subscription is created, updated, or deleted. On
    /// delete the caller should only call `purge`, never this method.
    pub async fn refresh_by_subscription(&self, sub: &Subscription) -> Result<Vec<ContextId>, MarketError> {
        self.purge_subscription(sub.id).await?;

        let mut matched = Vec::new();
        for ctx in self.store.list_root_contexts().await? {
            if ctx.max_budget < sub.min_budget || ctx.priority < sub.min_priority {
                continue;
            }
            if self.context_matches_subscription(&ctx, sub).await? {
                self.materialize(sub, &ctx).await?;
                matched.push(ctx.id);
            }
        }
        Ok(matched)
    }

    pub async fn purge_subscription(&self, subscription_id: SubscriptionId) -> Result<(), MarketError> {
        for item in self.store.list_inbox_for_subscription(subscription_id).await? {
            // Subscription-scoped purge: there is no bulk "delete by
            // subscription" Store op, so each live item is individually
            // marked ignored rather than physically deleted — a context's
            // own inbox rows are purged wholesale by `refresh_by_context`.
            self.store.set_inbox_status(item.id, infonomy_core::model::InboxStatus::Ignored).await?;
        }
        Ok(())
    }

    async fn context_matches_subscription(&self, ctx: &DecisionContext, sub: &Subscription) -> Result<bool, MarketError> {
        let counters = match self.store.get_buyer_profile(ctx.buyer_id).await {
            Ok(p) => p.counters,
            Err(_) => Default::default(),
        };
        Ok(predicate::matches(sub, ctx, &counters, Utc::now()))
    }

    async fn materialize(&self, sub: &Subscription, ctx: &DecisionContext) -> Result<(), MarketError> {
        let expires_at = Utc::now()
            + sub
                .age_limit_secs
                .map(Duration::seconds)
                .unwrap_or_else(|| Duration::days(30));
        self.store.create_inbox_item(sub.id, ctx.id, expires_at).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infonomy_core::model::{InboxStatus, Priority, SellerRef};
    use infonomy_store::{NewDecisionContext, NewSubscription};
    use infonomy_store::test_double::InMemoryStore;

    fn open_subscription(seller_id: i64) -> NewSubscription {
        NewSubscription {
            owner: SellerRef::Human { id: seller_id },
            keywords: None,
            context_pages: None,
            min_budget: 0.0,
            min_priority: Priority::Low,
            min_inspection_rate: 0.0,
            min_purchase_rate: 0.0,
            buyer_type_filter: None,
            age_limit_secs: None,
        }
    }

    fn root_context(buyer_id: i64) -> NewDecisionContext {
        NewDecisionContext {
            query: Some("widgets".into()),
            context_pages: None,
            buyer_id,
            max_budget: 50.0,
            priority: Priority::Low,
            target_human_seller_ids: None,
            target_bot_seller_ids: None,
            parent_id: None,
            parent_offers: vec![],
        }
    }

    #[tokio::test]
    async fn refresh_by_context_materializes_an_inbox_item_for_a_matching_subscription() {
        let store = InMemoryStore::new();
        let buyer = store.seed_user(100.0, 100.0);
        let sub = store.create_subscription(open_subscription(1)).await.unwrap();
        let ctx = store.create_context(root_context(buyer)).await.unwrap();

        let index = MatcherIndex::new(&store);
        let matched = index.refresh_by_context(&ctx).await.unwrap();

        assert_eq!(matched.len(), 1);
        let inbox = store.list_inbox_for_subscription(sub.id).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].context_id, ctx.id);
    }

    #[tokio::test]
    async fn refresh_by_context_skips_child_contexts() {
        let store = InMemoryStore::new();
        let buyer = store.seed_user(100.0, 100.0);
        store.create_subscription(open_subscription(1)).await.unwrap();
        let root = store.create_context(root_context(buyer)).await.unwrap();
        let mut child = root_context(buyer);
        child.parent_id = Some(root.id);
        let child = store.create_context(child).await.unwrap();

        let index = MatcherIndex::new(&store);
        let matched = index.refresh_by_context(&child).await.unwrap();
        assert!(matched.is_empty());
    }

    #[tokio::test]
    async fn purge_subscription_marks_live_items_ignored() {
        let store = InMemoryStore::new();
        let buyer = store.seed_user(100.0, 100.0);
        let sub = store.create_subscription(open_subscription(1)).await.unwrap();
        let ctx = store.create_context(root_context(buyer)).await.unwrap();

        let index = MatcherIndex::new(&store);
        index.refresh_by_context(&ctx).await.unwrap();

        index.purge_subscription(sub.id).await.unwrap();
        let inbox = store.list_inbox_for_subscription(sub.id).await.unwrap();
        assert_eq!(inbox[0].status, InboxStatus::Ignored);
    }

    #[tokio::test]
    async fn refresh_by_subscription_finds_existing_matching_root_contexts() {
        let store = InMemoryStore::new();
        let buyer = store.seed_user(100.0, 100.0);
        let ctx = store.create_context(root_context(buyer)).await.unwrap();

        let index = MatcherIndex::new(&store);
        let sub = store.create_subscription(open_subscription(1)).await.unwrap();
        let matched = index.refresh_by_subscription(&sub).await.unwrap();
        assert_eq!(matched, vec![ctx.id]);
    }
}
