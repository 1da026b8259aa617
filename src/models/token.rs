// Token records as stored in the `tokens` table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::user::Role;

/// A stored bearer token. One row per username at most.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: i64,
    pub token: String,
    pub username: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

impl TokenRecord {
    /// Live means `expired_at` is strictly after `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expired_at > now
    }
}

/// The identity resolved from a valid bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub username: String,
    pub role: Role,
    pub expired_at: DateTime<Utc>,
}

impl From<TokenRecord> for Identity {
    fn from(record: TokenRecord) -> Self {
        Self {
            username: record.username,
            role: record.role,
            expired_at: record.expired_at,
        }
    }
}

/// Token listing entry returned to admins. Only a prefix of the value is shown.
#[derive(Debug, Clone, Serialize)]
pub struct TokenSummary {
    pub id: i64,
    pub token_prefix: String,
    pub username: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

impl From<&TokenRecord> for TokenSummary {
    fn from(record: &TokenRecord) -> Self {
        Self {
            id: record.id,
            token_prefix: record.token.chars().take(8).collect(),
            username: record.username.clone(),
            role: record.role,
            created_at: record.created_at,
            expired_at: record.expired_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_liveness_boundary_is_exclusive() {
        let now = Utc::now();
        let mut record = TokenRecord {
            id: 1,
            token: "ab".repeat(32),
            username: "alice".into(),
            role: Role::User,
            created_at: now,
            expired_at: now,
        };
        assert!(!record.is_live(now), "expiry instant itself is already invalid");
        record.expired_at = now + Duration::seconds(1);
        assert!(record.is_live(now));
    }

    #[test]
    fn test_summary_hides_token_value() {
        let now = Utc::now();
        let record = TokenRecord {
            id: 7,
            token: "0123456789abcdef".repeat(4),
            username: "bob".into(),
            role: Role::Admin,
            created_at: now,
            expired_at: now,
        };
        let summary = TokenSummary::from(&record);
        assert_eq!(summary.token_prefix, "01234567");
        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("token").is_none());
    }
}
