//! `PgStore`: the sole production `Store` implementor, backed by a
//! `sqlx::PgPool`. Each trait method is one `sqlx::Transaction` (§4.1).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use infonomy_core::error::StoreError;
use infonomy_core::model::*;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;

use crate::store::{
    ContextUpdate, NewDecisionContext, NewInfoOffer, NewInspection, NewSubscription, OfferUpdate, Store,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(ref db) if db.is_check_violation() || db.is_foreign_key_violation() => {
            StoreError::Conflict(db.message().to_string())
        }
        other => StoreError::Transient(other.to_string()),
    }
}

fn seller_ref(kind: &str, id: i64) -> Result<SellerRef, StoreError> {
    match kind {
        "human" => Ok(SellerRef::Human { id }),
        "bot" => Ok(SellerRef::Bot { id }),
        other => Err(StoreError::Transient(format!("unknown seller kind `{other}` in row"))),
    }
}

fn priority_from_row(v: i16) -> Priority {
    Priority::from_i16(v).unwrap_or(Priority::Low)
}

#[async_trait]
impl Store for PgStore {
    async fn get_user(&self, id: UserId) -> Result<User, StoreError> {
        let row = sqlx::query(
            "SELECT id, total_balance, available_balance, last_bonus_date, daily_bonus_amount, api_keys \
             FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let api_keys_json: serde_json::Value = row.try_get("api_keys").map_err(map_sqlx)?;
        let api_keys: BTreeMap<String, String> =
            serde_json::from_value(api_keys_json).unwrap_or_default();

        Ok(User {
            id: row.try_get("id").map_err(map_sqlx)?,
            total_balance: row.try_get("total_balance").map_err(map_sqlx)?,
            available_balance: row.try_get("available_balance").map_err(map_sqlx)?,
            last_bonus_date: row.try_get::<Option<NaiveDate>, _>("last_bonus_date").map_err(map_sqlx)?,
            daily_bonus_amount: row.try_get("daily_bonus_amount").map_err(map_sqlx)?,
            api_keys: api_keys.into_iter().map(|(k, v)| (k, Credential(v))).collect(),
        })
    }

    async fn create_user(&self, daily_bonus_amount: f64) -> Result<User, StoreError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO users (total_balance, available_balance, daily_bonus_amount, api_keys) \
             VALUES (0, 0, $1, '{}'::jsonb) RETURNING id",
        )
        .bind(daily_bonus_amount)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        self.get_user(id).await
    }

    async fn cas_balances(
        &self,
        id: UserId,
        expected_available: f64,
        new_available: f64,
        new_total: f64,
        new_last_bonus_date: Option<NaiveDate>,
    ) -> Result<User, StoreError> {
        let result = sqlx::query(
            "UPDATE users SET available_balance = $1, total_balance = $2, last_bonus_date = $3 \
             WHERE id = $4 AND available_balance = $5",
        )
        .bind(new_available)
        .bind(new_total)
        .bind(new_last_bonus_date)
        .bind(id)
        .bind(expected_available)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "balance for user {id} changed since it was read"
            )));
        }
        self.get_user(id).await
    }

    async fn get_buyer_profile(&self, user_id: UserId) -> Result<BuyerProfile, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, default_agent_model, default_agent_prompt, default_max_budget, \
             queries_by_priority, inspected_by_priority, purchased_by_priority \
             FROM buyer_profiles WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let queries: BTreeMap<i16, u64> =
            serde_json::from_value(row.try_get("queries_by_priority").map_err(map_sqlx)?).unwrap_or_default();
        let inspected: BTreeMap<i16, u64> =
            serde_json::from_value(row.try_get("inspected_by_priority").map_err(map_sqlx)?).unwrap_or_default();
        let purchased: BTreeMap<i16, u64> =
            serde_json::from_value(row.try_get("purchased_by_priority").map_err(map_sqlx)?).unwrap_or_default();

        Ok(BuyerProfile {
            user_id: row.try_get("user_id").map_err(map_sqlx)?,
            default_agent_model: row.try_get("default_agent_model").map_err(map_sqlx)?,
            default_agent_prompt: row.try_get("default_agent_prompt").map_err(map_sqlx)?,
            default_max_budget: row.try_get("default_max_budget").map_err(map_sqlx)?,
            counters: PriorityCounters { queries, inspected, purchased },
        })
    }

    async fn upsert_buyer_profile(&self, profile: BuyerProfile) -> Result<BuyerProfile, StoreError> {
        sqlx::query(
            "INSERT INTO buyer_profiles \
             (user_id, default_agent_model, default_agent_prompt, default_max_budget, \
              queries_by_priority, inspected_by_priority, purchased_by_priority) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (user_id) DO UPDATE SET \
             default_agent_model = excluded.default_agent_model, \
             default_agent_prompt = excluded.default_agent_prompt, \
             default_max_budget = excluded.default_max_budget",
        )
        .bind(profile.user_id)
        .bind(&profile.default_agent_model)
        .bind(&profile.default_agent_prompt)
        .bind(profile.default_max_budget)
        .bind(serde_json::to_value(&profile.counters.queries).unwrap())
        .bind(serde_json::to_value(&profile.counters.inspected).unwrap())
        .bind(serde_json::to_value(&profile.counters.purchased).unwrap())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        self.get_buyer_profile(profile.user_id).await
    }

    async fn record_buyer_query(&self, user_id: UserId, priority: Priority) -> Result<(), StoreError> {
        self.bump_counter(user_id, "queries_by_priority", priority).await
    }

    async fn record_buyer_inspected(&self, user_id: UserId, priority: Priority) -> Result<(), StoreError> {
        self.bump_counter(user_id, "inspected_by_priority", priority).await
    }

    async fn record_buyer_purchased(&self, user_id: UserId, priority: Priority) -> Result<(), StoreError> {
        self.bump_counter(user_id, "purchased_by_priority", priority).await
    }

    async fn get_human_seller(&self, user_id: UserId) -> Result<HumanSellerProfile, StoreError> {
        sqlx::query("SELECT user_id FROM human_seller_profiles WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(HumanSellerProfile { user_id })
    }

    async fn create_human_seller(&self, user_id: UserId) -> Result<HumanSellerProfile, StoreError> {
        sqlx::query("INSERT INTO human_seller_profiles (user_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(HumanSellerProfile { user_id })
    }

    async fn get_bot_seller(&self, id: UserId) -> Result<BotSellerProfile, StoreError> {
        let row = sqlx::query(
            "SELECT id, owner_user_id, info, price, llm_model, llm_prompt FROM bot_seller_profiles WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row_to_bot_seller(&row)
    }

    async fn create_bot_seller(
        &self,
        owner_user_id: UserId,
        kind: BotSellerKind,
    ) -> Result<BotSellerProfile, StoreError> {
        kind.validate().map_err(|e| StoreError::Conflict(e.to_string()))?;
        let (info, price, llm_model, llm_prompt) = bot_kind_columns(&kind);
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO bot_seller_profiles (owner_user_id, info, price, llm_model, llm_prompt) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(owner_user_id)
        .bind(info)
        .bind(price)
        .bind(llm_model)
        .bind(llm_prompt)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        self.get_bot_seller(id).await
    }

    async fn update_bot_seller(&self, id: UserId, kind: BotSellerKind) -> Result<BotSellerProfile, StoreError> {
        kind.validate().map_err(|e| StoreError::Conflict(e.to_string()))?;
        let (info, price, llm_model, llm_prompt) = bot_kind_columns(&kind);
        sqlx::query(
            "UPDATE bot_seller_profiles SET info = $1, price = $2, llm_model = $3, llm_prompt = $4 WHERE id = $5",
        )
        .bind(info)
        .bind(price)
        .bind(llm_model)
        .bind(llm_prompt)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        self.get_bot_seller(id).await
    }

    async fn delete_bot_seller(&self, id: UserId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM bot_seller_profiles WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn list_bot_sellers_owned_by(&self, owner_user_id: UserId) -> Result<Vec<BotSellerProfile>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, owner_user_id, info, price, llm_model, llm_prompt FROM bot_seller_profiles \
             WHERE owner_user_id = $1",
        )
        .bind(owner_user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(row_to_bot_seller).collect()
    }

    async fn create_subscription(&self, sub: NewSubscription) -> Result<Subscription, StoreError> {
        let (owner_kind, owner_id) = seller_ref_columns(sub.owner);
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO subscriptions \
             (owner_kind, owner_id, keywords, context_pages, min_budget, min_priority, \
              min_inspection_rate, min_purchase_rate, buyer_type_filter, age_limit_secs) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING id",
        )
        .bind(owner_kind)
        .bind(owner_id)
        .bind(&sub.keywords)
        .bind(&sub.context_pages)
        .bind(sub.min_budget)
        .bind(sub.min_priority.as_i16())
        .bind(sub.min_inspection_rate)
        .bind(sub.min_purchase_rate)
        .bind(buyer_type_filter_column(sub.buyer_type_filter))
        .bind(sub.age_limit_secs)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        self.get_subscription(id).await
    }

    async fn update_subscription(&self, id: SubscriptionId, sub: NewSubscription) -> Result<Subscription, StoreError> {
        sqlx::query(
            "UPDATE subscriptions SET keywords = $1, context_pages = $2, min_budget = $3, min_priority = $4, \
             min_inspection_rate = $5, min_purchase_rate = $6, buyer_type_filter = $7, age_limit_secs = $8 \
             WHERE id = $9",
        )
        .bind(&sub.keywords)
        .bind(&sub.context_pages)
        .bind(sub.min_budget)
        .bind(sub.min_priority.as_i16())
        .bind(sub.min_inspection_rate)
        .bind(sub.min_purchase_rate)
        .bind(buyer_type_filter_column(sub.buyer_type_filter))
        .bind(sub.age_limit_secs)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        self.get_subscription(id).await
    }

    async fn delete_subscription(&self, id: SubscriptionId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM subscriptions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_subscription(&self, id: SubscriptionId) -> Result<Subscription, StoreError> {
        let row = sqlx::query(
            "SELECT id, owner_kind, owner_id, keywords, context_pages, min_budget, min_priority, \
             min_inspection_rate, min_purchase_rate, buyer_type_filter, age_limit_secs \
             FROM subscriptions WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row_to_subscription(&row)
    }

    async fn list_subscriptions_owned_by(&self, owner: SellerRef) -> Result<Vec<Subscription>, StoreError> {
        let (kind, id) = seller_ref_columns(owner);
        let rows = sqlx::query(
            "SELECT id, owner_kind, owner_id, keywords, context_pages, min_budget, min_priority, \
             min_inspection_rate, min_purchase_rate, buyer_type_filter, age_limit_secs \
             FROM subscriptions WHERE owner_kind = $1 AND owner_id = $2",
        )
        .bind(kind)
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(row_to_subscription).collect()
    }

    async fn list_subscriptions_eligible_for(
        &self,
        max_budget: f64,
        priority: Priority,
    ) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, owner_kind, owner_id, keywords, context_pages, min_budget, min_priority, \
             min_inspection_rate, min_purchase_rate, buyer_type_filter, age_limit_secs \
             FROM subscriptions WHERE min_budget <= $1 AND min_priority <= $2",
        )
        .bind(max_budget)
        .bind(priority.as_i16())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(row_to_subscription).collect()
    }

    async fn create_context(&self, ctx: NewDecisionContext) -> Result<DecisionContext, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO decision_contexts \
             (query, context_pages, buyer_id, max_budget, priority, \
              target_human_seller_ids, target_bot_seller_ids, parent_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
        )
        .bind(&ctx.query)
        .bind(&ctx.context_pages)
        .bind(ctx.buyer_id)
        .bind(ctx.max_budget)
        .bind(ctx.priority.as_i16())
        .bind(&ctx.target_human_seller_ids)
        .bind(&ctx.target_bot_seller_ids)
        .bind(ctx.parent_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        for offer_id in &ctx.parent_offers {
            sqlx::query("INSERT INTO decision_context_parent_offers (context_id, offer_id) VALUES ($1, $2)")
                .bind(id)
                .bind(offer_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        self.get_context(id).await
    }

    async fn get_context(&self, id: ContextId) -> Result<DecisionContext, StoreError> {
        let row = sqlx::query(
            "SELECT id, query, context_pages, buyer_id, max_budget, priority, created_at, \
             target_human_seller_ids, target_bot_seller_ids, parent_id \
             FROM decision_contexts WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let parent_offers: Vec<i64> = sqlx::query_scalar(
            "SELECT offer_id FROM decision_context_parent_offers WHERE context_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row_to_context(&row, parent_offers)
    }

    async fn update_context(&self, id: ContextId, update: ContextUpdate) -> Result<DecisionContext, StoreError> {
        let current = self.get_context(id).await?;
        sqlx::query("UPDATE decision_contexts SET query = $1, context_pages = $2, max_budget = $3, priority = $4 WHERE id = $5")
            .bind(update.query.or(current.query))
            .bind(update.context_pages.or(current.context_pages))
            .bind(update.max_budget.unwrap_or(current.max_budget))
            .bind(update.priority.unwrap_or(current.priority).as_i16())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        self.get_context(id).await
    }

    async fn delete_context(&self, id: ContextId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM decision_contexts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn list_contexts_for_buyer(&self, buyer_id: UserId) -> Result<Vec<DecisionContext>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, query, context_pages, buyer_id, max_budget, priority, created_at, \
             target_human_seller_ids, target_bot_seller_ids, parent_id \
             FROM decision_contexts WHERE buyer_id = $1 ORDER BY created_at DESC",
        )
        .bind(buyer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        self.hydrate_contexts(rows).await
    }

    async fn list_root_contexts(&self) -> Result<Vec<DecisionContext>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, query, context_pages, buyer_id, max_budget, priority, created_at, \
             target_human_seller_ids, target_bot_seller_ids, parent_id \
             FROM decision_contexts WHERE parent_id IS NULL ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        self.hydrate_contexts(rows).await
    }

    async fn create_offer(&self, offer: NewInfoOffer) -> Result<InfoOffer, StoreError> {
        let (kind, id) = seller_ref_columns(offer.seller);
        let offer_id: i64 = sqlx::query_scalar(
            "INSERT INTO info_offers (seller_kind, seller_id, context_id, private_info, public_info, price) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(kind)
        .bind(id)
        .bind(offer.context_id)
        .bind(&offer.private_info)
        .bind(&offer.public_info)
        .bind(offer.price)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        self.get_offer(offer_id).await
    }

    async fn get_offer(&self, id: OfferId) -> Result<InfoOffer, StoreError> {
        let row = sqlx::query(
            "SELECT id, seller_kind, seller_id, context_id, private_info, public_info, price, \
             created_at, inspected, purchased FROM info_offers WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row_to_offer(&row)
    }

    async fn update_offer(&self, id: OfferId, update: OfferUpdate) -> Result<InfoOffer, StoreError> {
        let current = self.get_offer(id).await?;
        sqlx::query("UPDATE info_offers SET private_info = $1, public_info = $2, price = $3 WHERE id = $4")
            .bind(update.private_info.unwrap_or(current.private_info))
            .bind(update.public_info.unwrap_or(current.public_info))
            .bind(update.price.unwrap_or(current.price))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        self.get_offer(id).await
    }

    async fn delete_offer(&self, id: OfferId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM info_offers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn list_offers_for_context(&self, context_id: ContextId) -> Result<Vec<InfoOffer>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, seller_kind, seller_id, context_id, private_info, public_info, price, \
             created_at, inspected, purchased FROM info_offers WHERE context_id = $1",
        )
        .bind(context_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(row_to_offer).collect()
    }

    async fn list_uninspected_offers(
        &self,
        context_id: ContextId,
        already_known: &[OfferId],
    ) -> Result<Vec<InfoOffer>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, seller_kind, seller_id, context_id, private_info, public_info, price, \
             created_at, inspected, purchased FROM info_offers \
             WHERE context_id = $1 AND inspected = false AND NOT (id = ANY($2))",
        )
        .bind(context_id)
        .bind(already_known)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(row_to_offer).collect()
    }

    async fn mark_offer_inspected(&self, id: OfferId) -> Result<(), StoreError> {
        sqlx::query("UPDATE info_offers SET inspected = true WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn mark_offer_purchased(&self, id: OfferId) -> Result<(), StoreError> {
        let row = sqlx::query(
            "UPDATE info_offers SET purchased = true, inspected = true \
             WHERE id = $1 AND purchased = false RETURNING id",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        match row {
            Some(_) => Ok(()),
            None => Err(StoreError::Conflict(format!("offer {id} is already purchased"))),
        }
    }

    async fn create_inbox_item(
        &self,
        subscription_id: SubscriptionId,
        context_id: ContextId,
        expires_at: DateTime<Utc>,
    ) -> Result<InboxItem, StoreError> {
        let row = sqlx::query(
            "INSERT INTO inbox_items (subscription_id, context_id, status, expires_at) \
             VALUES ($1, $2, 'new', $3) \
             RETURNING id, subscription_id, context_id, status, created_at, expires_at",
        )
        .bind(subscription_id)
        .bind(context_id)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row_to_inbox_item(&row)
    }

    async fn delete_inbox_items_for_context(&self, context_id: ContextId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM inbox_items WHERE context_id = $1")
            .bind(context_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn list_inbox_for_subscription(&self, subscription_id: SubscriptionId) -> Result<Vec<InboxItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, subscription_id, context_id, status, created_at, expires_at \
             FROM inbox_items WHERE subscription_id = $1",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(row_to_inbox_item).collect()
    }

    async fn set_inbox_status(&self, id: InboxItemId, status: InboxStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE inbox_items SET status = $1 WHERE id = $2")
            .bind(inbox_status_column(status))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn create_inspection(&self, insp: NewInspection) -> Result<Inspection, StoreError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO inspections \
             (decision_context_id, buyer_id, known_offers, job_id, elder_brother_id, child_context_id) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(insp.decision_context_id)
        .bind(insp.buyer_id)
        .bind(&insp.known_offers)
        .bind(insp.job_id)
        .bind(insp.elder_brother_id)
        .bind(insp.child_context_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if let Some(elder_id) = insp.elder_brother_id {
            sqlx::query("UPDATE inspections SET younger_brother_id = $1 WHERE id = $2")
                .bind(id)
                .bind(elder_id)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        }
        self.get_inspection(id).await
    }

    async fn get_inspection(&self, id: InspectionId) -> Result<Inspection, StoreError> {
        let row = sqlx::query(
            "SELECT id, decision_context_id, buyer_id, known_offers, purchased, info_offer_ids, \
             job_id, elder_brother_id, younger_brother_id, child_context_id, created_at \
             FROM inspections WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row_to_inspection(&row)
    }

    async fn set_inspection_purchases(
        &self,
        id: InspectionId,
        purchased: Vec<OfferId>,
        info_offer_ids: Vec<OfferId>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE inspections SET purchased = $1, info_offer_ids = $2 WHERE id = $3")
            .bind(&purchased)
            .bind(&info_offer_ids)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn set_inspection_child_context(&self, id: InspectionId, child_context_id: ContextId) -> Result<(), StoreError> {
        sqlx::query("UPDATE inspections SET child_context_id = $1 WHERE id = $2")
            .bind(child_context_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn list_inspections_for_context(&self, context_id: ContextId) -> Result<Vec<Inspection>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, decision_context_id, buyer_id, known_offers, purchased, info_offer_ids, \
             job_id, elder_brother_id, younger_brother_id, child_context_id, created_at \
             FROM inspections WHERE decision_context_id = $1 ORDER BY created_at",
        )
        .bind(context_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(row_to_inspection).collect()
    }
}

impl PgStore {
    async fn bump_counter(&self, user_id: UserId, column: &str, priority: Priority) -> Result<(), StoreError> {
        let p = priority.as_i16().to_string();
        let sql = format!(
            "UPDATE buyer_profiles SET {column} = jsonb_set({column}, '{{{p}}}', \
             (COALESCE(({column}->>'{p}')::bigint, 0) + 1)::text::jsonb) WHERE user_id = $1"
        );
        sqlx::query(&sql)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn hydrate_contexts(&self, rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<DecisionContext>, StoreError> {
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id").map_err(map_sqlx)?;
            let parent_offers: Vec<i64> = sqlx::query_scalar(
                "SELECT offer_id FROM decision_context_parent_offers WHERE context_id = $1",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
            out.push(row_to_context(row, parent_offers)?);
        }
        Ok(out)
    }
}

fn row_to_context(row: &sqlx::postgres::PgRow, parent_offers: Vec<i64>) -> Result<DecisionContext, StoreError> {
    Ok(DecisionContext {
        id: row.try_get("id").map_err(map_sqlx)?,
        query: row.try_get("query").map_err(map_sqlx)?,
        context_pages: row.try_get("context_pages").map_err(map_sqlx)?,
        buyer_id: row.try_get("buyer_id").map_err(map_sqlx)?,
        max_budget: row.try_get("max_budget").map_err(map_sqlx)?,
        priority: priority_from_row(row.try_get("priority").map_err(map_sqlx)?),
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        target_human_seller_ids: row.try_get("target_human_seller_ids").map_err(map_sqlx)?,
        target_bot_seller_ids: row.try_get("target_bot_seller_ids").map_err(map_sqlx)?,
        parent_id: row.try_get("parent_id").map_err(map_sqlx)?,
        parent_offers,
    })
}

fn row_to_offer(row: &sqlx::postgres::PgRow) -> Result<InfoOffer, StoreError> {
    let kind: String = row.try_get("seller_kind").map_err(map_sqlx)?;
    let seller_id: i64 = row.try_get("seller_id").map_err(map_sqlx)?;
    Ok(InfoOffer {
        id: row.try_get("id").map_err(map_sqlx)?,
        seller: seller_ref(&kind, seller_id)?,
        context_id: row.try_get("context_id").map_err(map_sqlx)?,
        private_info: row.try_get("private_info").map_err(map_sqlx)?,
        public_info: row.try_get("public_info").map_err(map_sqlx)?,
        price: row.try_get("price").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        inspected: row.try_get("inspected").map_err(map_sqlx)?,
        purchased: row.try_get("purchased").map_err(map_sqlx)?,
    })
}

fn row_to_subscription(row: &sqlx::postgres::PgRow) -> Result<Subscription, StoreError> {
    let kind: String = row.try_get("owner_kind").map_err(map_sqlx)?;
    let owner_id: i64 = row.try_get("owner_id").map_err(map_sqlx)?;
    let buyer_type_filter: Option<String> = row.try_get("buyer_type_filter").map_err(map_sqlx)?;
    Ok(Subscription {
        id: row.try_get("id").map_err(map_sqlx)?,
        owner: seller_ref(&kind, owner_id)?,
        keywords: row.try_get("keywords").map_err(map_sqlx)?,
        context_pages: row.try_get("context_pages").map_err(map_sqlx)?,
        min_budget: row.try_get("min_budget").map_err(map_sqlx)?,
        min_priority: priority_from_row(row.try_get("min_priority").map_err(map_sqlx)?),
        min_inspection_rate: row.try_get("min_inspection_rate").map_err(map_sqlx)?,
        min_purchase_rate: row.try_get("min_purchase_rate").map_err(map_sqlx)?,
        buyer_type_filter: buyer_type_filter.map(|_| BuyerTypeFilter::Human),
        age_limit_secs: row.try_get("age_limit_secs").map_err(map_sqlx)?,
    })
}

fn row_to_bot_seller(row: &sqlx::postgres::PgRow) -> Result<BotSellerProfile, StoreError> {
    let info: Option<String> = row.try_get("info").map_err(map_sqlx)?;
    let price: Option<f64> = row.try_get("price").map_err(map_sqlx)?;
    let llm_model: Option<String> = row.try_get("llm_model").map_err(map_sqlx)?;
    let llm_prompt: Option<String> = row.try_get("llm_prompt").map_err(map_sqlx)?;

    let kind = match (info, price, llm_model, llm_prompt) {
        (Some(info), Some(price), None, None) => BotSellerKind::FixedText { info, price },
        (None, None, Some(llm_model), Some(llm_prompt)) => BotSellerKind::LlmBacked { llm_model, llm_prompt },
        _ => return Err(StoreError::Transient("bot seller row matched neither kind".into())),
    };

    Ok(BotSellerProfile {
        id: row.try_get("id").map_err(map_sqlx)?,
        owner_user_id: row.try_get("owner_user_id").map_err(map_sqlx)?,
        kind,
    })
}

fn row_to_inbox_item(row: &sqlx::postgres::PgRow) -> Result<InboxItem, StoreError> {
    let status: String = row.try_get("status").map_err(map_sqlx)?;
    Ok(InboxItem {
        id: row.try_get("id").map_err(map_sqlx)?,
        subscription_id: row.try_get("subscription_id").map_err(map_sqlx)?,
        context_id: row.try_get("context_id").map_err(map_sqlx)?,
        status: match status.as_str() {
            "new" => InboxStatus::New,
            "ignored" => InboxStatus::Ignored,
            "responded" => InboxStatus::Responded,
            other => return Err(StoreError::Transient(format!("unknown inbox status `{other}`"))),
        },
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        expires_at: row.try_get("expires_at").map_err(map_sqlx)?,
    })
}

fn row_to_inspection(row: &sqlx::postgres::PgRow) -> Result<Inspection, StoreError> {
    Ok(Inspection {
        id: row.try_get("id").map_err(map_sqlx)?,
        decision_context_id: row.try_get("decision_context_id").map_err(map_sqlx)?,
        buyer_id: row.try_get("buyer_id").map_err(map_sqlx)?,
        known_offers: row.try_get("known_offers").map_err(map_sqlx)?,
        purchased: row.try_get("purchased").map_err(map_sqlx)?,
        info_offer_ids: row.try_get("info_offer_ids").map_err(map_sqlx)?,
        job_id: row.try_get("job_id").map_err(map_sqlx)?,
        elder_brother_id: row.try_get("elder_brother_id").map_err(map_sqlx)?,
        younger_brother_id: row.try_get("younger_brother_id").map_err(map_sqlx)?,
        child_context_id: row.try_get("child_context_id").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
    })
}

fn seller_ref_columns(owner: SellerRef) -> (&'static str, i64) {
    match owner {
        SellerRef::Human { id } => ("human", id),
        SellerRef::Bot { id } => ("bot", id),
    }
}

fn bot_kind_columns(kind: &BotSellerKind) -> (Option<&str>, Option<f64>, Option<&str>, Option<&str>) {
    match kind {
        BotSellerKind::FixedText { info, price } => (Some(info.as_str()), Some(*price), None, None),
        BotSellerKind::LlmBacked { llm_model, llm_prompt } => {
            (None, None, Some(llm_model.as_str()), Some(llm_prompt.as_str()))
        }
    }
}

fn buyer_type_filter_column(filter: Option<BuyerTypeFilter>) -> Option<&'static str> {
    filter.map(|BuyerTypeFilter::Human| "human")
}

fn inbox_status_column(status: InboxStatus) -> &'static str {
    match status {
        InboxStatus::New => "new",
        InboxStatus::Ignored => "ignored",
        InboxStatus::Responded => "responded",
    }
}
