use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};

use crate::common::{ConditionId, PolicyId};

/// Consecutive passing cycles of one condition for one policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConditionStreak {
    pub registered_policy_id: PolicyId,
    pub condition_id: ConditionId,
    pub streak_count: i32,
    pub streak_started_at: Option<DateTime<Utc>>,
    pub last_evaluated_at: DateTime<Utc>,
}

impl ConditionStreak {
    /// Count carried into the cycle evaluated at `now`. A streak whose last
    /// evaluation is older than the validation window is stale and counts
    /// as broken.
    pub fn carried_count(&self, now: DateTime<Utc>, validation_window_days: i32) -> i32 {
        let window = Duration::days(i64::from(validation_window_days.max(0)));
        if self.last_evaluated_at < now - window {
            0
        } else {
            self.streak_count.max(0)
        }
    }

    /// Whether `now` falls in the cycle this streak was last counted in.
    /// Scheduled runs are a full interval apart; anything closer than half
    /// an interval is the same tick run again.
    pub fn same_cycle(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        now - self.last_evaluated_at < interval / 2
    }

    pub async fn find_for_policy(policy_id: PolicyId, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM trigger_condition_streaks WHERE registered_policy_id = $1",
        )
        .bind(policy_id)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn upsert(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trigger_condition_streaks
                (registered_policy_id, condition_id, streak_count, streak_started_at, last_evaluated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (registered_policy_id, condition_id) DO UPDATE SET
                streak_count = EXCLUDED.streak_count,
                streak_started_at = EXCLUDED.streak_started_at,
                last_evaluated_at = EXCLUDED.last_evaluated_at
            "#,
        )
        .bind(self.registered_policy_id)
        .bind(self.condition_id)
        .bind(self.streak_count)
        .bind(self.streak_started_at)
        .bind(self.last_evaluated_at)
        .execute(conn)
        .await?;
        Ok(())
    }
}
