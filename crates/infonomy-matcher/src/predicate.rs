//! Pure predicate evaluation for the matching algorithm (§4.3 steps 1-6).
//! No I/O: `MatcherIndex` does the SQL prefilter and calls these to finish
//! the decision, and these are exercised directly in tests without a store.

use chrono::{DateTime, Utc};
use infonomy_core::model::{DecisionContext, PriorityCounters, Subscription};

/// Step 1-6 of §4.3, given the buyer's counters already fetched by the
/// caller. Step 7 (inserting the inbox row) is the caller's job.
pub fn matches(sub: &Subscription, ctx: &DecisionContext, buyer_counters: &PriorityCounters, now: DateTime<Utc>) -> bool {
    // Steps 1 (budget/priority) are the caller's cheap SQL prefilter;
    // re-checked here so this function is a complete, independently
    // testable predicate.
    if ctx.max_budget < sub.min_budget || ctx.priority < sub.min_priority {
        return false;
    }

    if let Some(age_limit) = sub.age_limit_secs {
        let age = (now - ctx.created_at).num_seconds();
        if age > age_limit {
            return false;
        }
    }

    // Every buyer in this market is human-typed today (§9), so
    // `buyer_type_filter` never excludes anything yet; it is still modeled
    // so an LLM-buyer kind can be added without a schema change.

    if buyer_counters.inspection_rate(ctx.priority) < sub.min_inspection_rate {
        return false;
    }
    if buyer_counters.purchase_rate(ctx.priority) < sub.min_purchase_rate {
        return false;
    }

    if let Some(keywords) = &sub.keywords {
        let query = ctx.query.as_deref().unwrap_or("").to_lowercase();
        if !keywords.iter().any(|k| query.contains(&k.to_lowercase())) {
            return false;
        }
    }

    if let Some(sub_pages) = &sub.context_pages {
        let ctx_pages = ctx.context_pages.as_deref().unwrap_or(&[]);
        if !sub_pages.iter().any(|p| ctx_pages.contains(p)) {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use infonomy_core::model::{Priority, SellerRef};

    fn base_context() -> DecisionContext {
        DecisionContext {
            id: 1,
            query: Some("looking for restaurant recommendations in Lisbon".into()),
            context_pages: Some(vec!["travel".into()]),
            buyer_id: 1,
            max_budget: 50.0,
            priority: Priority::High,
            created_at: Utc::now(),
            target_human_seller_ids: None,
            target_bot_seller_ids: None,
            parent_id: None,
            parent_offers: vec![],
        }
    }

    fn base_sub() -> Subscription {
        Subscription {
            id: 1,
            owner: SellerRef::Human { id: 2 },
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

    #[test]
    fn rejects_below_budget_floor() {
        let mut sub = base_sub();
        sub.min_budget = 100.0;
        assert!(!matches(&sub, &base_context(), &PriorityCounters::default(), Utc::now()));
    }

    #[test]
    fn rejects_below_priority_floor() {
        let mut ctx = base_context();
        ctx.priority = Priority::Low;
        let mut sub = base_sub();
        sub.min_priority = Priority::High;
        assert!(!matches(&sub, &ctx, &PriorityCounters::default(), Utc::now()));
    }

    #[test]
    fn rejects_stale_context_past_age_limit() {
        let mut ctx = base_context();
        ctx.created_at = Utc::now() - chrono::Duration::seconds(1000);
        let mut sub = base_sub();
        sub.age_limit_secs = Some(60);
        assert!(!matches(&sub, &ctx, &PriorityCounters::default(), Utc::now()));
    }

    #[test]
    fn rejects_below_rate_floors() {
        let mut sub = base_sub();
        sub.min_inspection_rate = 0.5;
        let mut counters = PriorityCounters::default();
        counters.queries.insert(Priority::High.as_i16(), 10);
        counters.inspected.insert(Priority::High.as_i16(), 1);
        assert!(!matches(&sub, &base_context(), &counters, Utc::now()));
    }

    #[test]
    fn keyword_match_is_case_insensitive_substring() {
        let mut sub = base_sub();
        sub.keywords = Some(vec!["LISBON".into()]);
        assert!(matches(&sub, &base_context(), &PriorityCounters::default(), Utc::now()));

        sub.keywords = Some(vec!["skiing".into()]);
        assert!(!matches(&sub, &base_context(), &PriorityCounters::default(), Utc::now()));
    }

    #[test]
    fn page_match_requires_overlap() {
        let mut sub = base_sub();
        sub.context_pages = Some(vec!["finance".into()]);
        assert!(!matches(&sub, &base_context(), &PriorityCounters::default(), Utc::now()));

        sub.context_pages = Some(vec!["travel".into()]);
        assert!(matches(&sub, &base_context(), &PriorityCounters::default(), Utc::now()));
    }

    #[test]
    fn default_subscription_matches_anything() {
        assert!(matches(&base_sub(), &base_context(), &PriorityCounters::default(), Utc::now()));
    }
}
