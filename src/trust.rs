use crate::error::Error;
use crate::globals::GLOBALS;
use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;

/// Coarse trust bucket used to partition rating summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    Core,
    High,
    Standard,
    Unverified,
    Blocked,
}

impl TrustTier {
    pub fn as_str(&self) -> &'static str {
        match *self {
            TrustTier::Core => "core",
            TrustTier::High => "high",
            TrustTier::Standard => "standard",
            TrustTier::Unverified => "unverified",
            TrustTier::Blocked => "blocked",
        }
    }

    /// The canonical tier set, in summary ordering
    pub fn all() -> [TrustTier; 5] {
        [
            TrustTier::Core,
            TrustTier::High,
            TrustTier::Standard,
            TrustTier::Unverified,
            TrustTier::Blocked,
        ]
    }
}

impl std::fmt::Display for TrustTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Map a numeric trust level to its coarse tier
pub fn tier_for_level(level: i64) -> TrustTier {
    if level < 0 {
        TrustTier::Blocked
    } else if level == 0 {
        TrustTier::Unverified
    } else if level < 50 {
        TrustTier::Standard
    } else if level < 100 {
        TrustTier::High
    } else {
        TrustTier::Core
    }
}

/// The trust level of an author per the locally stored declaration
/// graph. Maintenance of that graph happens outside this runtime; a
/// pubkey without a declaration is level 0.
pub async fn trust_level(pubkey: String) -> Result<i64, Error> {
    spawn_blocking(move || {
        let maybe_db = GLOBALS.db.blocking_lock();
        let db = maybe_db.as_ref().unwrap();

        let mut stmt = db.prepare("SELECT trust_level FROM trust_declarations WHERE pubkey=?")?;
        let mut rows = stmt.query((&pubkey,))?;
        match rows.next()? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    })
    .await?
}

/// Resolve a pubkey to (level, tier). Callers aggregate an event with
/// at most one resolution, holding the result for that event's whole
/// processing.
pub async fn resolve(pubkey: String) -> Result<(i64, TrustTier), Error> {
    let level = trust_level(pubkey).await?;
    Ok((level, tier_for_level(level)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tier_thresholds() {
        assert_eq!(tier_for_level(-5), TrustTier::Blocked);
        assert_eq!(tier_for_level(0), TrustTier::Unverified);
        assert_eq!(tier_for_level(1), TrustTier::Standard);
        assert_eq!(tier_for_level(49), TrustTier::Standard);
        assert_eq!(tier_for_level(50), TrustTier::High);
        assert_eq!(tier_for_level(99), TrustTier::High);
        assert_eq!(tier_for_level(100), TrustTier::Core);
    }

    #[tokio::test]
    async fn test_unknown_pubkey_is_unverified() {
        let _db = crate::db::test::setup();
        let (level, tier) = resolve("ab".repeat(32)).await.unwrap();
        assert_eq!(level, 0);
        assert_eq!(tier, TrustTier::Unverified);
    }
}
