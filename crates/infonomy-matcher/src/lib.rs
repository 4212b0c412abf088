//! Subscription matching (C3) and bot-seller dispatch (C4) for the
//! information market (§4.3, §4.4).

pub mod dispatcher;
pub mod index;
pub mod predicate;

pub use dispatcher::BotSellerDispatcher;
pub use index::MatcherIndex;
