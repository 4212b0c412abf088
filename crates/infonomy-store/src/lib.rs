//! Persistence layer for the information market: the [`Store`] trait (§4.1),
//! its production implementor [`PgStore`], and [`BalanceKeeper`] (§4.2).

pub mod balance;
pub mod pg;
pub mod store;

pub use balance::BalanceKeeper;
pub use pg::PgStore;
pub use store::{
    ContextUpdate, NewDecisionContext, NewInfoOffer, NewInspection, NewSubscription, OfferUpdate, Store,
};

/// In-memory [`Store`] test double. Gated behind `test-util` so downstream
/// crates can depend on it from their own tests without pulling it into
/// production builds.
#[cfg(any(test, feature = "test-util"))]
pub mod test_double;
