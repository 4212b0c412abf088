//! `BotSellerDispatcher` (§4.4): synthesizes an `InfoOffer` for each
//! bot-seller subscription matched against a context.

use infonomy_agent::{BotOfferPrompt, InspectionAgent};
use infonomy_core::model::{BotSellerKind, DecisionContext, InfoOffer, SellerRef, Subscription};
use infonomy_store::{NewInfoOffer, Store};
use tracing::warn;

pub struct BotSellerDispatcher<'a> {
    store: &'a dyn Store,
    agent: &'a dyn InspectionAgent,
}

impl<'a> BotSellerDispatcher<'a> {
    pub fn new(store: &'a dyn Store, agent: &'a dyn InspectionAgent) -> Self {
        Self { store, agent }
    }

    /// Dispatch every bot subscription in `matched` against `ctx`, emitting
    /// one offer per bot that succeeds. A failed LLM call or parse emits no
    /// offer rather than a synthetic error offer (§4.4 failure policy).
    pub async fn dispatch(&self, ctx: &DecisionContext, matched: &[Subscription]) -> Vec<InfoOffer> {
        let mut offers = Vec::new();
        for sub in matched {
            let SellerRef::Bot { id: bot_id } = sub.owner else {
                continue;
            };
            match self.dispatch_one(ctx, bot_id).await {
                Ok(Some(offer)) => offers.push(offer),
                Ok(None) => {}
                Err(e) => warn!("bot seller {bot_id} dispatch failed for context {}: {e}", ctx.id),
            }
        }
        offers
    }

    async fn dispatch_one(
        &self,
        ctx: &DecisionContext,
        bot_id: infonomy_core::model::UserId,
    ) -> Result<Option<InfoOffer>, infonomy_core::error::MarketError> {
        let bot = self.store.get_bot_seller(bot_id).await?;

        let (private_info, public_info, price) = match bot.kind {
            BotSellerKind::FixedText { info, price } => (info, Some("fixed-text bot offer".to_string()), price),
            BotSellerKind::LlmBacked { llm_model, llm_prompt } => {
                let owner = self.store.get_user(bot.owner_user_id).await?;
                let credential = owner.api_keys.get("openrouter").map(|c| c.expose().to_string());

                let prompt = BotOfferPrompt {
                    model: llm_model,
                    llm_prompt,
                    max_tokens: 500,
                    temperature: 0.7,
                    context_query: ctx.query.clone(),
                    context_pages: ctx.context_pages.clone().unwrap_or_default(),
                    priority: ctx.priority.as_i16(),
                    max_budget: ctx.max_budget,
                };
                match self.agent.draft_bot_offer(prompt, credential.as_deref()).await {
                    Ok(draft) => (draft.private_info, Some(draft.public_info), draft.price.min(ctx.max_budget)),
                    Err(_) => return Ok(None),
                }
            }
        };

        let offer = self
            .store
            .create_offer(NewInfoOffer {
                seller: SellerRef::Bot { id: bot_id },
                context_id: ctx.id,
                private_info,
                public_info,
                price,
            })
            .await?;
        Ok(Some(offer))
    }
}
