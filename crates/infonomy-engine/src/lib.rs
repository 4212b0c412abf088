//! The bounded-recursion `InspectionEngine` (C5, §4.5) — the heart of the
//! market. Walks the inspection tree for one root decision context: agent
//! calls choose to purchase offers or spawn a child context for
//! clarification, recursing until the depth/breadth bounds are hit or the
//! agent settles on a purchase.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use infonomy_agent::{InspectionAgent, InspectionPrompt, PromptOffer, ValidatedDecision};
use infonomy_core::config::Config;
use infonomy_core::error::{MarketError, StoreError};
use infonomy_core::model::{ContextId, DecisionContext, InspectionId, OfferId, Priority};
use infonomy_matcher::{BotSellerDispatcher, MatcherIndex};
use infonomy_store::{BalanceKeeper, NewDecisionContext, NewInspection, Store};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A buyer's agent defaults (§3 `BuyerProfile`), resolved once per root
/// inspection and threaded unchanged through every step of its tree.
struct BuyerAgentConfig {
    model: String,
    system_prompt: Option<String>,
    credential: Option<String>,
}

/// `known ∪ new_ids`, deduped, preserving `known`'s order. Every `step`
/// return path must merge into `known_offers` this way — a bare node-local
/// decision silently drops whatever the rest of the tree already bought.
fn merge_known_offers(known: &[OfferId], new_ids: &[OfferId]) -> Vec<OfferId> {
    let mut merged = known.to_vec();
    for id in new_ids {
        if !merged.contains(id) {
            merged.push(*id);
        }
    }
    merged
}

/// The outcome of walking a root context's inspection tree (§4.5 step 6).
#[derive(Debug, Clone)]
pub struct RootOutcome {
    pub context_id: ContextId,
    pub purchased: Vec<OfferId>,
    pub spent: f64,
}

pub struct InspectionEngine<'a> {
    store: &'a dyn Store,
    agent: &'a dyn InspectionAgent,
    config: &'a Config,
    cancel: CancellationToken,
}

impl<'a> InspectionEngine<'a> {
    pub fn new(store: &'a dyn Store, agent: &'a dyn InspectionAgent, config: &'a Config, cancel: CancellationToken) -> Self {
        Self { store, agent, config, cancel }
    }

    /// Entry point: start (or resume) inspection of a root context. Non-root
    /// contexts are inspected only as part of their parent's recursion.
    ///
    /// `info_offer_ids` is the buyer-selected subset of currently-available
    /// offers to seed the first step with; an empty vec falls back to every
    /// offer currently on the context.
    pub async fn run_root_inspection(
        &self,
        ctx_id: ContextId,
        info_offer_ids: Vec<OfferId>,
    ) -> Result<RootOutcome, MarketError> {
        let ctx = self.store.get_context(ctx_id).await?;
        if !ctx.is_root() {
            return Err(MarketError::Validation(
                "inspection can only be started directly on a root context".into(),
            ));
        }

        let info_offer_ids = if info_offer_ids.is_empty() {
            let offers = self.store.list_offers_for_context(ctx_id).await?;
            offers.iter().map(|o| o.id).collect()
        } else {
            info_offer_ids
        };

        let profile = self.store.get_buyer_profile(ctx.buyer_id).await?;
        let buyer = self.store.get_user(ctx.buyer_id).await?;
        let agent_cfg = BuyerAgentConfig {
            model: if profile.default_agent_model.is_empty() {
                self.default_model()
            } else {
                profile.default_agent_model
            },
            system_prompt: Some(profile.default_agent_prompt).filter(|p| !p.is_empty()),
            credential: buyer.api_keys.get("openrouter").map(|c| c.expose().to_string()),
        };

        let purchased = self.step(&ctx, vec![], info_offer_ids, 0, 0, None, &agent_cfg).await?;
        let spent = self.total_price(&purchased).await?;

        let keeper = BalanceKeeper::new(self.store);
        if spent > 0.0 {
            keeper.settle(ctx.buyer_id, spent, ctx.max_budget).await?;
        } else {
            keeper.refund(ctx.buyer_id, ctx.max_budget).await?;
        }

        // Exactly once per root context, per §4.5 step 6.
        self.store.record_buyer_inspected(ctx.buyer_id, ctx.priority).await?;
        if spent > 0.0 {
            self.store.record_buyer_purchased(ctx.buyer_id, ctx.priority).await?;
        }

        info!("root inspection of context {ctx_id} settled: spent={spent}, purchased={}", purchased.len());
        Ok(RootOutcome { context_id: ctx_id, purchased, spent })
    }

    /// One step-function invocation (§4.5 steps 1-5), recursing into child
    /// contexts and brother re-inspections. Boxed because async fns can't
    /// recurse directly — the future's size would be unbounded.
    fn step<'b>(
        &'b self,
        ctx: &'b DecisionContext,
        known_offers: Vec<OfferId>,
        info_offer_ids: Vec<OfferId>,
        depth: u32,
        breadth: u32,
        elder_brother_id: Option<InspectionId>,
        agent_cfg: &'b BuyerAgentConfig,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OfferId>, MarketError>> + Send + 'b>> {
        Box::pin(async move {
            let inspection = self
                .store
                .create_inspection(NewInspection {
                    decision_context_id: ctx.id,
                    buyer_id: ctx.buyer_id,
                    known_offers: known_offers.clone(),
                    job_id: None,
                    elder_brother_id,
                    child_context_id: None,
                })
                .await?;

            // Step 1: bound check.
            if depth >= self.config.insp_max_depth || breadth >= self.config.insp_max_breadth {
                debug!("inspection {} hit recursion bound (depth={depth}, breadth={breadth})", inspection.id);
                return Ok(known_offers);
            }

            // Step 2: load & filter.
            if info_offer_ids.is_empty() {
                return Ok(known_offers);
            }
            let mut offers = Vec::with_capacity(info_offer_ids.len());
            for id in &info_offer_ids {
                offers.push(self.store.get_offer(*id).await?);
            }
            // Every offer shown to the agent this step is inspected, whether
            // or not it ends up bought (§3 "inspected may be set without purchased").
            for id in &info_offer_ids {
                self.store.mark_offer_inspected(*id).await?;
            }
            let mut known = Vec::with_capacity(known_offers.len());
            for id in &known_offers {
                known.push(self.store.get_offer(*id).await?);
            }
            let budget_used: f64 = known.iter().map(|o| o.price).sum();
            let budget_remaining = ctx.max_budget - budget_used;

            // Step 3: agent call. Cancellable per §4.5 "Cancellation & timeouts".
            if self.cancel.is_cancelled() {
                return Ok(known_offers);
            }
            let prompt = InspectionPrompt {
                model: agent_cfg.model.clone(),
                max_tokens: self.config.llm_default_max_tokens,
                temperature: self.config.llm_default_temperature,
                context_query: ctx.query.clone(),
                context_pages: ctx.context_pages.clone().unwrap_or_default(),
                is_recursive: !ctx.is_root(),
                offers: offers.iter().map(to_prompt_offer).collect(),
                known_info: known.iter().map(to_prompt_offer).collect(),
                budget_remaining,
                system_prompt: agent_cfg.system_prompt.clone(),
            };

            let decision = match self
                .agent
                .decide_inspection(prompt, self.config.agent_max_retries, agent_cfg.credential.as_deref())
                .await
            {
                Ok(d) => d,
                Err(e) => {
                    warn!("inspection {} exhausted agent retries, treating as no-op: {e}", inspection.id);
                    return Ok(known_offers);
                }
            };

            match decision {
                ValidatedDecision::Purchase { chosen_offer_ids } => {
                    // Step 4: settle each chosen offer; a conflicted id (already
                    // purchased by a racing inspection) is dropped rather than
                    // treated as a hard failure.
                    let mut confirmed = Vec::with_capacity(chosen_offer_ids.len());
                    for id in &chosen_offer_ids {
                        match self.store.mark_offer_purchased(*id).await {
                            Ok(()) => confirmed.push(*id),
                            Err(StoreError::Conflict(msg)) => {
                                warn!("inspection {} dropped offer {id}: {msg}", inspection.id);
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                    self.store
                        .set_inspection_purchases(inspection.id, confirmed.clone(), info_offer_ids.clone())
                        .await?;
                    Ok(merge_known_offers(&known_offers, &confirmed))
                }
                ValidatedDecision::Followup { query, budget, target_human_seller_ids, target_bot_seller_ids } => {
                    // Step 5: spawn a child context, fan it out, and wait.
                    let child = self
                        .store
                        .create_context(NewDecisionContext {
                            query: Some(query),
                            context_pages: ctx.context_pages.clone(),
                            buyer_id: ctx.buyer_id,
                            max_budget: budget,
                            priority: Priority::High,
                            target_human_seller_ids,
                            target_bot_seller_ids,
                            parent_id: Some(ctx.id),
                            parent_offers: info_offer_ids.clone(),
                        })
                        .await?;
                    self.store.set_inspection_child_context(inspection.id, child.id).await?;

                    let matched = MatcherIndex::new(self.store).refresh_by_context(&child).await?;
                    BotSellerDispatcher::new(self.store, self.agent).dispatch(&child, &matched).await;

                    let child_offer_ids = self.poll_for_offers(child.id).await?;
                    let child_purchased = self
                        .step(&child, vec![], child_offer_ids, depth + 1, breadth, None, agent_cfg)
                        .await?;

                    self.store
                        .set_inspection_purchases(inspection.id, child_purchased.clone(), info_offer_ids.clone())
                        .await?;

                    // Step 5 cont'd: younger brother re-inspects the same
                    // context with the child's purchases now known.
                    let new_known = merge_known_offers(&known_offers, &child_purchased);
                    let brother_purchased = self
                        .step(ctx, new_known.clone(), info_offer_ids.clone(), depth, breadth + 1, Some(inspection.id), agent_cfg)
                        .await?;
                    Ok(merge_known_offers(&new_known, &brother_purchased))
                }
            }
        })
    }

    /// Bounded poll for offers on a freshly-spawned child context: fast
    /// interval inside the bot-response window, slow interval after, giving
    /// up at the hard deadline (§4.5 step 5, §5 suspension points).
    async fn poll_for_offers(&self, context_id: ContextId) -> Result<Vec<OfferId>, MarketError> {
        let start = Instant::now();
        loop {
            let offers = self.store.list_offers_for_context(context_id).await?;
            if !offers.is_empty() {
                return Ok(offers.into_iter().map(|o| o.id).collect());
            }
            if self.cancel.is_cancelled() || start.elapsed() >= self.config.bot_deadline() {
                return Ok(vec![]);
            }
            let interval = if start.elapsed() < self.config.bot_fast_window() {
                self.config.bot_fast_poll()
            } else {
                self.config.bot_slow_poll()
            };
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => return Ok(vec![]),
            }
        }
    }

    async fn total_price(&self, offer_ids: &[OfferId]) -> Result<f64, MarketError> {
        let mut seen = HashSet::new();
        let mut total = 0.0;
        for id in offer_ids {
            if seen.insert(*id) {
                total += self.store.get_offer(*id).await?.price;
            }
        }
        Ok(total)
    }

    fn default_model(&self) -> String {
        "openrouter/auto".to_string()
    }
}

fn to_prompt_offer(offer: &infonomy_core::model::InfoOffer) -> PromptOffer {
    PromptOffer {
        id: offer.id,
        private_info: offer.private_info.clone(),
        public_info: offer.public_info.clone(),
        price: offer.price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infonomy_agent::test_util::{ScriptedAgent, ScriptedDecision};
    use infonomy_core::model::{Priority as P, SellerRef};
    use infonomy_store::test_double::InMemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_agent_cfg() -> BuyerAgentConfig {
        BuyerAgentConfig { model: "test-model".into(), system_prompt: None, credential: None }
    }

    async fn seed_root_context(store: &InMemoryStore, buyer_id: i64, max_budget: f64) -> DecisionContext {
        store
            .create_context(NewDecisionContext {
                query: Some("test query".into()),
                context_pages: None,
                buyer_id,
                max_budget,
                priority: P::Low,
                target_human_seller_ids: None,
                target_bot_seller_ids: None,
                parent_id: None,
                parent_offers: vec![],
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn bound_check_returns_empty_purchases_at_max_depth() {
        let store = InMemoryStore::new();
        let buyer = store.seed_user(100.0, 100.0);
        let ctx = seed_root_context(&store, buyer, 50.0).await;
        let offer = store
            .create_offer(infonomy_store::NewInfoOffer {
                seller: SellerRef::Human { id: 999 },
                context_id: ctx.id,
                private_info: "secret".into(),
                public_info: None,
                price: 10.0,
            })
            .await
            .unwrap();

        let config = Config { insp_max_depth: 0, ..Config::default() };
        let agent = ScriptedAgent::default();
        let engine = InspectionEngine::new(&store, &agent, &config, CancellationToken::new());

        let purchased = engine.step(&ctx, vec![], vec![offer.id], 0, 0, None, &test_agent_cfg()).await.unwrap();
        assert!(purchased.is_empty());
    }

    #[tokio::test]
    async fn bound_check_passes_through_known_offers_unchanged() {
        let store = InMemoryStore::new();
        let buyer = store.seed_user(100.0, 100.0);
        let ctx = seed_root_context(&store, buyer, 50.0).await;
        let offer = store
            .create_offer(infonomy_store::NewInfoOffer {
                seller: SellerRef::Human { id: 999 },
                context_id: ctx.id,
                private_info: "secret".into(),
                public_info: None,
                price: 10.0,
            })
            .await
            .unwrap();

        let config = Config { insp_max_depth: 0, ..Config::default() };
        let agent = ScriptedAgent::default();
        let engine = InspectionEngine::new(&store, &agent, &config, CancellationToken::new());

        let known = vec![offer.id];
        let purchased = engine
            .step(&ctx, known.clone(), vec![], 0, 0, None, &test_agent_cfg())
            .await
            .unwrap();
        assert_eq!(purchased, known, "a bound-hit step must return known_offers, not discard them");
    }

    #[tokio::test]
    async fn empty_offer_list_returns_empty_purchases() {
        let store = InMemoryStore::new();
        let buyer = store.seed_user(100.0, 100.0);
        let ctx = seed_root_context(&store, buyer, 50.0).await;

        let config = Config::default();
        let agent = ScriptedAgent::default();
        let engine = InspectionEngine::new(&store, &agent, &config, CancellationToken::new());

        let purchased = engine.step(&ctx, vec![], vec![], 0, 0, None, &test_agent_cfg()).await.unwrap();
        assert!(purchased.is_empty());
    }

    #[tokio::test]
    async fn cancellation_short_circuits_before_the_agent_call() {
        let store = InMemoryStore::new();
        let buyer = store.seed_user(100.0, 100.0);
        let ctx = seed_root_context(&store, buyer, 50.0).await;
        let offer = store
            .create_offer(infonomy_store::NewInfoOffer {
                seller: SellerRef::Human { id: 999 },
                context_id: ctx.id,
                private_info: "secret".into(),
                public_info: None,
                price: 10.0,
            })
            .await
            .unwrap();

        let config = Config::default();
        let agent = ScriptedAgent::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let engine = InspectionEngine::new(&store, &agent, &config, cancel);

        let purchased = engine.step(&ctx, vec![], vec![offer.id], 0, 0, None, &test_agent_cfg()).await.unwrap();
        assert!(purchased.is_empty(), "a pre-cancelled token must never reach the agent call");
    }

    #[tokio::test]
    async fn total_price_deduplicates_offer_ids() {
        let store = InMemoryStore::new();
        let buyer = store.seed_user(100.0, 100.0);
        let ctx = seed_root_context(&store, buyer, 50.0).await;
        let offer = store
            .create_offer(infonomy_store::NewInfoOffer {
                seller: SellerRef::Human { id: 999 },
                context_id: ctx.id,
                private_info: "secret".into(),
                public_info: None,
                price: 15.0,
            })
            .await
            .unwrap();

        let config = Config::default();
        let agent = ScriptedAgent::default();
        let engine = InspectionEngine::new(&store, &agent, &config, CancellationToken::new());

        let total = engine.total_price(&[offer.id, offer.id]).await.unwrap();
        assert_eq!(total, 15.0, "the same offer id counted twice must not double the spend");
    }

    /// spec.md §8 scenario 3: a followup spawns a child context that buys one
    /// offer, then the younger-brother re-inspection buys another out of the
    /// same parent offer list. Both purchases must show up in the final
    /// merged result and in total spend — regression test for the known-offers
    /// merge bug (root budget 50, child buys $5, brother buys $20, spent=25).
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recursion_merges_child_and_brother_purchases_into_known_offers() {
        let store = Arc::new(InMemoryStore::new());
        let buyer = store.seed_user(100.0, 100.0);
        let ctx = seed_root_context(&store, buyer, 50.0).await;
        let brother_offer = store
            .create_offer(infonomy_store::NewInfoOffer {
                seller: SellerRef::Human { id: 999 },
                context_id: ctx.id,
                private_info: "brother offer".into(),
                public_info: None,
                price: 20.0,
            })
            .await
            .unwrap();

        // Seeds the child context with its own offer as soon as the
        // followup decision spawns it, unblocking `poll_for_offers`.
        let watcher_store = store.clone();
        let root_id = ctx.id;
        let watcher = tokio::spawn(async move {
            loop {
                let contexts = watcher_store.list_contexts_for_buyer(buyer).await.unwrap();
                if let Some(child) = contexts.iter().find(|c| c.parent_id == Some(root_id)) {
                    return watcher_store
                        .create_offer(infonomy_store::NewInfoOffer {
                            seller: SellerRef::Human { id: 999 },
                            context_id: child.id,
                            private_info: "child offer".into(),
                            public_info: None,
                            price: 5.0,
                        })
                        .await
                        .unwrap();
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        let config = Config { bot_fast_poll_s: 0, bot_fast_window_s: 2, bot_deadline_s: 2, ..Config::default() };
        let agent = ScriptedAgent::new(vec![
            ScriptedDecision::Fixed(ValidatedDecision::Followup {
                query: "clarify".into(),
                budget: 10.0,
                target_human_seller_ids: None,
                target_bot_seller_ids: None,
            }),
            ScriptedDecision::PurchaseAllShown,
            ScriptedDecision::PurchaseAllShown,
        ]);
        let engine = InspectionEngine::new(store.as_ref(), &agent, &config, CancellationToken::new());

        let purchased = engine
            .step(&ctx, vec![], vec![brother_offer.id], 0, 0, None, &test_agent_cfg())
            .await
            .unwrap();
        let child_offer = watcher.await.unwrap();

        assert_eq!(purchased.len(), 2, "both the child's and the brother's purchases must survive");
        assert!(purchased.contains(&child_offer.id));
        assert!(purchased.contains(&brother_offer.id));

        let spent = engine.total_price(&purchased).await.unwrap();
        assert_eq!(spent, 25.0);
    }

    /// spec.md §8 scenario 6: two inspections race to purchase the same
    /// offer. Exactly one must win; the other must see the offer dropped
    /// from its confirmed set rather than erroring or double-charging.
    #[tokio::test]
    async fn double_purchase_race_drops_the_losing_side() {
        let store = InMemoryStore::new();
        let buyer = store.seed_user(100.0, 100.0);
        let ctx = seed_root_context(&store, buyer, 50.0).await;
        let offer = store
            .create_offer(infonomy_store::NewInfoOffer {
                seller: SellerRef::Human { id: 999 },
                context_id: ctx.id,
                private_info: "contested offer".into(),
                public_info: None,
                price: 10.0,
            })
            .await
            .unwrap();

        let config = Config::default();
        let agent_a = ScriptedAgent::new(vec![ScriptedDecision::PurchaseAllShown]);
        let agent_b = ScriptedAgent::new(vec![ScriptedDecision::PurchaseAllShown]);
        let engine_a = InspectionEngine::new(&store, &agent_a, &config, CancellationToken::new());
        let engine_b = InspectionEngine::new(&store, &agent_b, &config, CancellationToken::new());

        let cfg = test_agent_cfg();
        let (r1, r2) = tokio::join!(
            engine_a.step(&ctx, vec![], vec![offer.id], 0, 0, None, &cfg),
            engine_b.step(&ctx, vec![], vec![offer.id], 0, 0, None, &cfg),
        );
        let (r1, r2) = (r1.unwrap(), r2.unwrap());

        assert_eq!(r1.len() + r2.len(), 1, "only one side may keep the contested offer");
        assert!(store.get_offer(offer.id).await.unwrap().purchased);
    }
}
