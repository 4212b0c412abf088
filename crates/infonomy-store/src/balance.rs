//! `BalanceKeeper` (§4.2): escrow/settle/refund/daily_bonus over a `Store`,
//! retrying the compare-and-update race with the same backoff math the
//! agent bridge uses for transient HTTP errors.

use chrono::Utc;
use infonomy_agent::RetryConfig;
use infonomy_core::error::{MarketError, StoreError};
use infonomy_core::model::{User, UserId};
use tracing::warn;

use crate::store::Store;

pub struct BalanceKeeper<'a> {
    store: &'a dyn Store,
    retry: RetryConfig,
}

impl<'a> BalanceKeeper<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store, retry: RetryConfig::with_retries(5) }
    }

    /// `available_balance -= amount`, failing with `InsufficientFunds` if
    /// `amount > available_balance`. Called by the root-context create path.
    pub async fn escrow(&self, user_id: UserId, amount: f64) -> Result<User, MarketError> {
        self.cas_retry(user_id, move |u| {
            if amount > u.available_balance {
                return Err(MarketError::InsufficientFunds);
            }
            Ok((u.available_balance - amount, u.total_balance, u.last_bonus_date))
        })
        .await
    }

    /// A root inspection completed with total purchase cost `spent ≤
    /// escrowed`: `total_balance -= spent`, `available_balance += (escrowed
    /// - spent)`. Never reduces `available_balance`.
    pub async fn settle(&self, user_id: UserId, spent: f64, escrowed: f64) -> Result<User, MarketError> {
        self.cas_retry(user_id, move |u| {
            Ok((
                u.available_balance + (escrowed - spent),
                u.total_balance - spent,
                u.last_bonus_date,
            ))
        })
        .await
    }

    /// A root inspection ended with no purchases: `available_balance +=
    /// escrowed`.
    pub async fn refund(&self, user_id: UserId, escrowed: f64) -> Result<User, MarketError> {
        self.cas_retry(user_id, move |u| {
            Ok((u.available_balance + escrowed, u.total_balance, u.last_bonus_date))
        })
        .await
    }

    /// Grant the daily bonus if it hasn't already been granted today.
    pub async fn daily_bonus(&self, user_id: UserId) -> Result<User, MarketError> {
        let today = Utc::now().date_naive();
        self.cas_retry(user_id, move |u| {
            if u.last_bonus_date == Some(today) {
                return Ok((u.available_balance, u.total_balance, u.last_bonus_date));
            }
            Ok((
                u.available_balance + u.daily_bonus_amount,
                u.total_balance + u.daily_bonus_amount,
                Some(today),
            ))
        })
        .await
    }

    async fn cas_retry(
        &self,
        user_id: UserId,
        compute: impl Fn(&User) -> Result<(f64, f64, Option<chrono::NaiveDate>), MarketError>,
    ) -> Result<User, MarketError> {
        let mut attempt = 0;
        loop {
            let user = self.store.get_user(user_id).await?;
            let (new_available, new_total, new_last_bonus_date) = compute(&user)?;

            if !(0.0..=new_total).contains(&new_available) {
                return Err(MarketError::Validation(
                    "operation would violate the balance invariant".into(),
                ));
            }

            match self
                .store
                .cas_balances(user_id, user.available_balance, new_available, new_total, new_last_bonus_date)
                .await
            {
                Ok(updated) => return Ok(updated),
                Err(e) if matches!(e, StoreError::Transient(_) | StoreError::Conflict(_))
                    && attempt < self.retry.max_retries =>
                {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!("balance CAS conflict for user {user_id} (attempt {attempt}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_double::InMemoryStore;

    #[tokio::test]
    async fn escrow_moves_available_only() {
        let store = InMemoryStore::new();
        let user_id = store.seed_user(100.0, 100.0);
        let keeper = BalanceKeeper::new(&store);

        let user = keeper.escrow(user_id, 30.0).await.unwrap();
        assert_eq!(user.available_balance, 70.0);
        assert_eq!(user.total_balance, 100.0);
    }

    #[tokio::test]
    async fn escrow_rejects_insufficient_funds() {
        let store = InMemoryStore::new();
        let user_id = store.seed_user(100.0, 10.0);
        let keeper = BalanceKeeper::new(&store);

        let err = keeper.escrow(user_id, 30.0).await.unwrap_err();
        assert!(matches!(err, MarketError::InsufficientFunds));
    }

    #[tokio::test]
    async fn settle_credits_back_the_unspent_escrow() {
        // Scenario 1 from §8: available=100, total=100, escrow 40, spend 30.
        let store = InMemoryStore::new();
        let user_id = store.seed_user(100.0, 100.0);
        let keeper = BalanceKeeper::new(&store);

        keeper.escrow(user_id, 40.0).await.unwrap();
        let user = keeper.settle(user_id, 30.0, 40.0).await.unwrap();
        assert_eq!(user.total_balance, 70.0);
        assert_eq!(user.available_balance, 90.0);
        assert!(user.balance_invariant_holds());
    }

    #[tokio::test]
    async fn refund_restores_the_full_escrow() {
        let store = InMemoryStore::new();
        let user_id = store.seed_user(100.0, 60.0);
        let keeper = BalanceKeeper::new(&store);

        let user = keeper.refund(user_id, 40.0).await.unwrap();
        assert_eq!(user.available_balance, 100.0);
        assert_eq!(user.total_balance, 100.0);
    }

    #[tokio::test]
    async fn daily_bonus_is_granted_once_per_day() {
        let store = InMemoryStore::new();
        let user_id = store.seed_user(0.0, 0.0);
        let keeper = BalanceKeeper::new(&store);

        let user = keeper.daily_bonus(user_id).await.unwrap();
        assert_eq!(user.available_balance, 10.0);

        let user = keeper.daily_bonus(user_id).await.unwrap();
        assert_eq!(user.available_balance, 10.0, "second call today is a no-op");
    }

    #[tokio::test]
    async fn settle_with_nothing_spent_fully_refunds_via_settle() {
        let store = InMemoryStore::new();
        let user_id = store.seed_user(100.0, 100.0);
        let keeper = BalanceKeeper::new(&store);

        keeper.escrow(user_id, 40.0).await.unwrap();
        let user = keeper.settle(user_id, 0.0, 40.0).await.unwrap();
        assert_eq!(user.total_balance, 100.0);
        assert_eq!(user.available_balance, 100.0);
    }
}
