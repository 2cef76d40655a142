use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::supabase::SupabaseClient;

pub const SUBSCRIPTIONS_TABLE: &str = "subscriptions";

/// One row per user, keyed on `user_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub user_id: String,
    pub status: String,
    pub plan: String,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: Option<String>,
}

/// Field set written by subscription-updated events. Cleared cancellation
/// timestamps must reach the store as explicit nulls, so the options are
/// always serialized.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionChanges {
    pub status: String,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_user_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> anyhow::Result<Option<String>>;

    async fn update_subscription(
        &self,
        user_id: &str,
        changes: &SubscriptionChanges,
    ) -> anyhow::Result<()>;

    async fn upsert_subscription(&self, record: &SubscriptionRecord) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
struct UserIdRow {
    user_id: String,
}

#[async_trait]
impl SubscriptionStore for SupabaseClient {
    async fn find_user_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> anyhow::Result<Option<String>> {
        let row: Option<UserIdRow> = self
            .select_one(
                SUBSCRIPTIONS_TABLE,
                &[(
                    "stripe_subscription_id",
                    format!("eq.{}", subscription_id),
                )],
                "user_id",
            )
            .await?;
        Ok(row.map(|row| row.user_id))
    }

    async fn update_subscription(
        &self,
        user_id: &str,
        changes: &SubscriptionChanges,
    ) -> anyhow::Result<()> {
        self.update(
            SUBSCRIPTIONS_TABLE,
            &[("user_id", format!("eq.{}", user_id))],
            changes,
        )
        .await
    }

    async fn upsert_subscription(&self, record: &SubscriptionRecord) -> anyhow::Result<()> {
        self.upsert(SUBSCRIPTIONS_TABLE, "user_id", record).await
    }
}

/// Stripe timestamps are epoch seconds; the store keeps timestamptz.
pub fn epoch_seconds_to_datetime(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}

pub fn opt_epoch_seconds_to_datetime(seconds: Option<i64>) -> Option<DateTime<Utc>> {
    seconds.and_then(epoch_seconds_to_datetime)
}
