use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Identity snapshot carried in presence records and broadcasts. The
/// email is the dedup key across sessions; the id is the upstream
/// account id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// One occupant of a scope: the joining session plus its user snapshot
/// and the join instant (unix millis) used for last-writer-wins dedup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceMember {
    pub user: UserSnapshot,
    #[serde(rename = "joinedAt")]
    pub joined_at: i64,
}

/// Presence record for a single scope as mirrored to the shared store:
/// session-id keyed, value per member.
pub type PresenceRecord = HashMap<String, PresenceMember>;

/// Collapse a presence record into the client-visible snapshot: one
/// entry per email, most recent join wins, ordered by join time.
pub fn dedupe_by_email(record: &PresenceRecord) -> Vec<UserSnapshot> {
    let mut latest: HashMap<&str, &PresenceMember> = HashMap::new();
    for member in record.values() {
        match latest.get(member.user.email.as_str()) {
            Some(existing) if existing.joined_at >= member.joined_at => {}
            _ => {
                latest.insert(member.user.email.as_str(), member);
            }
        }
    }

    let mut members: Vec<&PresenceMember> = latest.into_values().collect();
    members.sort_by_key(|member| member.joined_at);
    members.iter().map(|member| member.user.clone()).collect()
}

/// Session ids in `record` that share an email with another session but
/// are not the most recent holder. These are the entries the duplicate
/// sweeper evicts.
pub fn stale_duplicate_sessions(record: &PresenceRecord) -> Vec<String> {
    let mut winners: HashMap<&str, (&str, i64)> = HashMap::new();
    for (session_id, member) in record {
        match winners.get(member.user.email.as_str()) {
            Some((_, at)) if *at >= member.joined_at => {}
            _ => {
                winners.insert(
                    member.user.email.as_str(),
                    (session_id.as_str(), member.joined_at),
                );
            }
        }
    }

    record
        .iter()
        .filter(|(session_id, member)| {
            winners
                .get(member.user.email.as_str())
                .is_some_and(|winner| winner.0 != session_id.as_str())
        })
        .map(|(session_id, _)| session_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(email: &str, joined_at: i64) -> PresenceMember {
        PresenceMember {
            user: UserSnapshot {
                id: format!("id-{email}"),
                email: email.to_owned(),
                name: email.to_owned(),
                image: None,
            },
            joined_at,
        }
    }

    #[test]
    fn dedupe_keeps_most_recent_entry_per_email() {
        let mut record = PresenceRecord::new();
        record.insert("s1".into(), member("alice@x", 10));
        record.insert("s2".into(), member("alice@x", 20));
        record.insert("s3".into(), member("bob@x", 15));

        let users = dedupe_by_email(&record);
        assert_eq!(users.len(), 2);
        let emails: Vec<_> = users.iter().map(|u| u.email.as_str()).collect();
        assert_eq!(emails, vec!["bob@x", "alice@x"]);
    }

    #[test]
    fn stale_sessions_exclude_the_winner() {
        let mut record = PresenceRecord::new();
        record.insert("s1".into(), member("alice@x", 10));
        record.insert("s2".into(), member("alice@x", 20));
        record.insert("s3".into(), member("bob@x", 5));

        let stale = stale_duplicate_sessions(&record);
        assert_eq!(stale, vec!["s1".to_string()]);
    }

    #[test]
    fn snapshot_serializes_camel_case_join_instant() {
        let value = serde_json::to_value(member("alice@x", 42)).unwrap();
        assert_eq!(value["joinedAt"], 42);
        assert_eq!(value["user"]["email"], "alice@x");
        assert!(value["user"].get("image").is_none());
    }
}
