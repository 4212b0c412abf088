//! Entities of the information market: users, profiles, subscriptions,
//! decision contexts, offers, inbox items, and inspection-tree nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type UserId = i64;
pub type ContextId = i64;
pub type OfferId = i64;
pub type SubscriptionId = i64;
pub type InboxItemId = i64;
pub type InspectionId = i64;
pub type JobId = i64;

/// Query priority. The matcher and the buyer's derived rates are both keyed
/// by this; only the range is meaningful, not any semantics beyond it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum Priority {
    Low = 0,
    High = 1,
}

impl Priority {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(Priority::Low),
            1 => Some(Priority::High),
            _ => None,
        }
    }
}

/// A user account. Credentials and JWT issuance are out of scope; only the
/// fields the market's own components read are modeled here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub total_balance: f64,
    pub available_balance: f64,
    pub last_bonus_date: Option<chrono::NaiveDate>,
    pub daily_bonus_amount: f64,
    /// Provider name -> credential, used only by the agent bridge.
    pub api_keys: BTreeMap<String, Credential>,
}

impl User {
    /// `0 <= available_balance <= total_balance`, checked after every ledger op.
    pub fn balance_invariant_holds(&self) -> bool {
        self.available_balance >= 0.0 && self.available_balance <= self.total_balance
    }
}

/// A credential value that never prints itself. `Debug`/`Display` render a
/// fixed placeholder so a stray `{:?}` of a `User` can't leak a key into logs.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential(pub String);

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(..)")
    }
}

impl Credential {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

/// Per-priority counters backing a buyer's derived inspection/purchase rates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriorityCounters {
    pub queries: BTreeMap<i16, u64>,
    pub inspected: BTreeMap<i16, u64>,
    pub purchased: BTreeMap<i16, u64>,
}

impl PriorityCounters {
    pub fn inspection_rate(&self, priority: Priority) -> f64 {
        let p = priority.as_i16();
        let q = *self.queries.get(&p).unwrap_or(&0);
        if q == 0 {
            return 0.0;
        }
        *self.inspected.get(&p).unwrap_or(&0) as f64 / q as f64
    }

    pub fn purchase_rate(&self, priority: Priority) -> f64 {
        let p = priority.as_i16();
        let q = *self.queries.get(&p).unwrap_or(&0);
        if q == 0 {
            return 0.0;
        }
        *self.purchased.get(&p).unwrap_or(&0) as f64 / q as f64
    }
}

/// One per buying user. Holds defaults and the derived-rate counters that
/// seller subscriptions filter on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyerProfile {
    pub user_id: UserId,
    pub default_agent_model: String,
    pub default_agent_prompt: String,
    pub default_max_budget: f64,
    pub counters: PriorityCounters,
}

/// One per user that can act as a human seller (at most one per user).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanSellerProfile {
    pub user_id: UserId,
}

/// Either a fixed-text bot or an LLM-backed bot; exactly one of the two
/// shapes holds, enforced on insert/update by `BotSellerKind::validate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BotSellerKind {
    FixedText { info: String, price: f64 },
    LlmBacked { llm_model: String, llm_prompt: String },
}

impl BotSellerKind {
    pub fn validate(&self) -> Result<(), &'static str> {
        match self {
            BotSellerKind::FixedText { info, .. } if info.is_empty() => {
                Err("fixed-text bot seller requires non-empty info")
            }
            BotSellerKind::LlmBacked {
                llm_model,
                llm_prompt,
            } if llm_model.is_empty() || llm_prompt.is_empty() => {
                Err("llm-backed bot seller requires both llm_model and llm_prompt")
            }
            _ => Ok(()),
        }
    }
}

/// A user may own any number of bot-seller profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotSellerProfile {
    pub id: UserId,
    pub owner_user_id: UserId,
    pub kind: BotSellerKind,
}

/// Tagged reference to whichever concrete seller table owns a row, per the
/// "polymorphic seller" design note: a tagged reference on offers and
/// subscriptions rather than table inheritance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SellerRef {
    Human { id: UserId },
    Bot { id: UserId },
}

/// A seller's standing predicate selecting which contexts land in their inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
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

/// `Subscription::buyer_type_filter` gate. The source models one buyer kind
/// ("human_buyer"); this enum leaves room for the LLM-buyer kind the Python
/// source sketched but never built, without implying it exists here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuyerTypeFilter {
    Human,
}

/// A buyer's priced request for information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionContext {
    pub id: ContextId,
    pub query: Option<String>,
    pub context_pages: Option<Vec<String>>,
    pub buyer_id: UserId,
    pub max_budget: f64,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub target_human_seller_ids: Option<Vec<UserId>>,
    pub target_bot_seller_ids: Option<Vec<UserId>>,
    pub parent_id: Option<ContextId>,
    /// The offers from the parent context this child was spawned to clarify.
    pub parent_offers: Vec<OfferId>,
}

impl DecisionContext {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Root contexts are public; children are visible only to the
    /// inspection that spawned them.
    pub fn is_public(&self) -> bool {
        self.is_root()
    }

    pub fn bypasses_matcher_fanout(&self) -> bool {
        self.target_human_seller_ids.is_some() || self.target_bot_seller_ids.is_some()
    }
}

/// A seller's priced candidate reply to one context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoOffer {
    pub id: OfferId,
    pub seller: SellerRef,
    pub context_id: ContextId,
    pub private_info: String,
    pub public_info: Option<String>,
    pub price: f64,
    pub created_at: DateTime<Utc>,
    pub inspected: bool,
    pub purchased: bool,
}

impl InfoOffer {
    /// Projected view per §4.7: `private_info` only for the seller or a
    /// purchaser, `public_info` otherwise.
    pub fn project(&self, viewer: Option<SellerRef>, viewer_purchased: bool) -> InfoOfferView {
        let can_see_private = viewer == Some(self.seller) || viewer_purchased;
        InfoOfferView {
            id: self.id,
            context_id: self.context_id,
            public_info: self.public_info.clone(),
            private_info: if can_see_private {
                Some(self.private_info.clone())
            } else {
                None
            },
            price: self.price,
            inspected: self.inspected,
            purchased: self.purchased,
            created_at: self.created_at,
        }
    }
}

/// The request-scoped projection of an offer returned over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoOfferView {
    pub id: OfferId,
    pub context_id: ContextId,
    pub public_info: Option<String>,
    pub private_info: Option<String>,
    pub price: f64,
    pub inspected: bool,
    pub purchased: bool,
    pub created_at: DateTime<Utc>,
}

/// Status of a materialized (subscription, context) match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    New,
    Ignored,
    Responded,
}

/// A materialized match between a subscription and a context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxItem {
    pub id: InboxItemId,
    pub subscription_id: SubscriptionId,
    pub context_id: ContextId,
    pub status: InboxStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl InboxItem {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == InboxStatus::New && self.expires_at > now
    }
}

/// One node in the bounded-recursion inspection tree (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inspection {
    pub id: InspectionId,
    pub decision_context_id: ContextId,
    pub buyer_id: UserId,
    pub known_offers: Vec<OfferId>,
    pub purchased: Vec<OfferId>,
    pub info_offer_ids: Vec<OfferId>,
    pub job_id: Option<JobId>,
    pub elder_brother_id: Option<InspectionId>,
    pub younger_brother_id: Option<InspectionId>,
    pub child_context_id: Option<ContextId>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_are_zero_with_no_queries() {
        let counters = PriorityCounters::default();
        assert_eq!(counters.inspection_rate(Priority::Low), 0.0);
        assert_eq!(counters.purchase_rate(Priority::High), 0.0);
    }

    #[test]
    fn rates_divide_by_priority_bucket() {
        let mut counters = PriorityCounters::default();
        counters.queries.insert(1, 4);
        counters.inspected.insert(1, 2);
        counters.purchased.insert(1, 1);
        assert_eq!(counters.inspection_rate(Priority::High), 0.5);
        assert_eq!(counters.purchase_rate(Priority::High), 0.25);
    }

    #[test]
    fn bot_seller_kind_requires_exactly_one_shape() {
        assert!(
            BotSellerKind::FixedText {
                info: String::new(),
                price: 1.0
            }
            .validate()
            .is_err()
        );
        assert!(
            BotSellerKind::LlmBacked {
                llm_model: "m".into(),
                llm_prompt: String::new()
            }
            .validate()
            .is_err()
        );
        assert!(
            BotSellerKind::FixedText {
                info: "hi".into(),
                price: 1.0
            }
            .validate()
            .is_ok()
        );
    }

    #[test]
    fn offer_projection_hides_private_info_by_default() {
        let offer = InfoOffer {
            id: 1,
            seller: SellerRef::Human { id: 9 },
            context_id: 1,
            private_info: "secret".into(),
            public_info: Some("summary".into()),
            price: 5.0,
            created_at: Utc::now(),
            inspected: false,
            purchased: false,
        };
        let view = offer.project(None, false);
        assert!(view.private_info.is_none());
        let seller_view = offer.project(Some(SellerRef::Human { id: 9 }), false);
        assert_eq!(seller_view.private_info.as_deref(), Some("secret"));
    }

    #[test]
    fn root_context_is_public_child_is_not() {
        let root = DecisionContext {
            id: 1,
            query: None,
            context_pages: None,
            buyer_id: 1,
            max_budget: 10.0,
            priority: Priority::Low,
            created_at: Utc::now(),
            target_human_seller_ids: None,
            target_bot_seller_ids: None,
            parent_id: None,
            parent_offers: vec![],
        };
        assert!(root.is_public());
        let child = DecisionContext {
            parent_id: Some(1),
            ..root
        };
        assert!(!child.is_public());
    }
}
