//! Conflict detection and resolution between a queued client edit and the
//! current server row

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::{NewResolutionRecord, SyncEntityType};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    /// Higher version wins; equal versions fall back to the later edit
    LocalWins,
    ServerWins,
    /// Caller-supplied field policy combines both sides
    Merge,
    /// No automatic winner; the item waits for an operator
    Manual,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::LocalWins => "LOCAL_WINS",
            ResolutionStrategy::ServerWins => "SERVER_WINS",
            ResolutionStrategy::Merge => "MERGE",
            ResolutionStrategy::Manual => "MANUAL",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Local,
    Server,
    Merged,
    /// Deferred to manual review
    None,
}

impl Winner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Winner::Local => "local",
            Winner::Server => "server",
            Winner::Merged => "merged",
            Winner::None => "none",
        }
    }
}

/// Version stamp of one side of a conflict
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecordVersion {
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub entity_type: SyncEntityType,
    pub entity_id: Uuid,
    pub local: RecordVersion,
    pub server: RecordVersion,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    pub winner: Winner,
    pub reason: String,
}

impl Resolution {
    pub fn requires_review(&self) -> bool {
        self.winner == Winner::None
    }

    /// Audit entry for this outcome
    pub fn audit_record(
        &self,
        queue_item_id: Option<Uuid>,
        entity_type: SyncEntityType,
        entity_id: Option<Uuid>,
    ) -> NewResolutionRecord {
        NewResolutionRecord {
            queue_item_id,
            entity_type,
            entity_id: entity_id.map(|id| id.to_string()),
            strategy: self.strategy.as_str().to_string(),
            winner: self.winner.as_str().to_string(),
            reason: self.reason.clone(),
        }
    }
}

/// Stateless; every decision is a pure function of the two versions
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// A conflict exists only when both sides are present and their
    /// versions differ
    pub fn detect(
        &self,
        entity_type: SyncEntityType,
        entity_id: Uuid,
        local: Option<RecordVersion>,
        server: Option<RecordVersion>,
    ) -> Option<Conflict> {
        let (local, server) = (local?, server?);
        if local.version == server.version {
            return None;
        }
        Some(Conflict {
            entity_type,
            entity_id,
            local,
            server,
        })
    }

    pub fn resolve(&self, conflict: &Conflict, strategy: ResolutionStrategy) -> Resolution {
        let (winner, reason) = match strategy {
            ResolutionStrategy::LocalWins => {
                let (local, server) = (&conflict.local, &conflict.server);
                if local.version > server.version {
                    (
                        Winner::Local,
                        format!(
                            "local version {} is ahead of server version {}",
                            local.version, server.version
                        ),
                    )
                } else if local.version < server.version {
                    (
                        Winner::Server,
                        format!(
                            "server version {} is ahead of local version {}",
                            server.version, local.version
                        ),
                    )
                } else if local.updated_at > server.updated_at {
                    (Winner::Local, "local edit is more recent".to_string())
                } else {
                    (Winner::Server, "server edit is at least as recent".to_string())
                }
            }
            ResolutionStrategy::ServerWins => {
                (Winner::Server, "server record is authoritative".to_string())
            }
            ResolutionStrategy::Merge => (
                Winner::Merged,
                "fields combined by merge policy".to_string(),
            ),
            ResolutionStrategy::Manual => (
                Winner::None,
                "deferred for manual review".to_string(),
            ),
        };

        Resolution {
            strategy,
            winner,
            reason,
        }
    }

    /// Resolves with [`ResolutionStrategy::Merge`] and applies `policy` to
    /// produce the merged value
    pub fn merge<T>(
        &self,
        conflict: &Conflict,
        local: &T,
        server: &T,
        policy: impl FnOnce(&T, &T) -> T,
    ) -> (Resolution, T) {
        let resolution = self.resolve(conflict, ResolutionStrategy::Merge);
        (resolution, policy(local, server))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn stamp(version: i64, offset_secs: i64) -> RecordVersion {
        RecordVersion {
            version,
            updated_at: DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(1_700_000_000 + offset_secs),
        }
    }

    fn conflict(local: RecordVersion, server: RecordVersion) -> Conflict {
        ConflictResolver::new()
            .detect(SyncEntityType::Loan, Uuid::new_v4(), Some(local), Some(server))
            .unwrap()
    }

    #[test]
    fn test_detect() {
        let resolver = ConflictResolver::new();
        let id = Uuid::new_v4();

        assert!(resolver
            .detect(SyncEntityType::Loan, id, Some(stamp(1, 0)), Some(stamp(2, 0)))
            .is_some());
        assert!(resolver
            .detect(SyncEntityType::Loan, id, Some(stamp(2, 0)), Some(stamp(2, 50)))
            .is_none());
        assert!(resolver
            .detect(SyncEntityType::Loan, id, None, Some(stamp(2, 0)))
            .is_none());
        assert!(resolver
            .detect(SyncEntityType::Loan, id, Some(stamp(1, 0)), None)
            .is_none());
    }

    #[test]
    fn test_local_wins_prefers_higher_version() {
        let resolver = ConflictResolver::new();

        let ahead = conflict(stamp(3, 0), stamp(2, 100));
        assert_eq!(
            resolver.resolve(&ahead, ResolutionStrategy::LocalWins).winner,
            Winner::Local
        );

        let behind = conflict(stamp(1, 100), stamp(2, 0));
        assert_eq!(
            resolver.resolve(&behind, ResolutionStrategy::LocalWins).winner,
            Winner::Server
        );
    }

    #[test]
    fn test_local_wins_tie_breaks_on_timestamp() {
        let resolver = ConflictResolver::new();
        // Equal versions never reach `detect`, so build the conflict directly.
        let tied = Conflict {
            entity_type: SyncEntityType::User,
            entity_id: Uuid::new_v4(),
            local: stamp(2, 10),
            server: stamp(2, 0),
        };
        assert_eq!(
            resolver.resolve(&tied, ResolutionStrategy::LocalWins).winner,
            Winner::Local
        );

        let older = Conflict {
            local: stamp(2, 0),
            server: stamp(2, 10),
            ..tied
        };
        assert_eq!(
            resolver.resolve(&older, ResolutionStrategy::LocalWins).winner,
            Winner::Server
        );
    }

    #[test]
    fn test_other_strategies() {
        let resolver = ConflictResolver::new();
        let c = conflict(stamp(5, 0), stamp(2, 0));

        assert_eq!(
            resolver.resolve(&c, ResolutionStrategy::ServerWins).winner,
            Winner::Server
        );
        let manual = resolver.resolve(&c, ResolutionStrategy::Manual);
        assert_eq!(manual.winner, Winner::None);
        assert!(manual.requires_review());

        let (local, server) = ("local".to_string(), "server".to_string());
        let (resolution, merged) = resolver.merge(&c, &local, &server, |l, s| format!("{}+{}", l, s));
        assert_eq!(resolution.winner, Winner::Merged);
        assert_eq!(merged, "local+server");
    }

    #[test]
    fn test_audit_record_carries_strategy_and_reason() {
        let resolver = ConflictResolver::new();
        let c = conflict(stamp(1, 0), stamp(4, 0));
        let resolution = resolver.resolve(&c, ResolutionStrategy::LocalWins);
        let record = resolution.audit_record(None, c.entity_type, Some(c.entity_id));

        assert_eq!(record.strategy, "LOCAL_WINS");
        assert_eq!(record.winner, "server");
        assert!(record.reason.contains("server version 4"));
        assert_eq!(record.entity_id, Some(c.entity_id.to_string()));
    }

    #[test]
    fn test_strategy_wire_names() {
        assert_eq!(
            serde_json::from_str::<ResolutionStrategy>("\"LOCAL_WINS\"").unwrap(),
            ResolutionStrategy::LocalWins
        );
        assert_eq!(
            serde_json::to_string(&ResolutionStrategy::ServerWins).unwrap(),
            format!("\"{}\"", ResolutionStrategy::ServerWins.as_str())
        );
        assert!(serde_json::from_str::<ResolutionStrategy>("\"crdt\"").is_err());
    }
}
