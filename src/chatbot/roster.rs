//! In-memory member roster with online/offline classification.
//!
//! Telegram doesn't let bots enumerate members, so the roster is built from
//! what the bot sees: message authors and chat_member updates. Anyone active
//! within the online window counts as online.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// Tracks members and supplies live roster facts for the system prompt.
pub trait RosterProvider: Send + Sync {
    /// Record activity from a member.
    fn observe(&self, chat_id: i64, user_id: i64, display_name: &str, at: DateTime<Utc>);

    /// A member left or was removed.
    fn member_left(&self, chat_id: i64, user_id: i64);

    /// Plain-text facts about who is online right now.
    fn facts(&self, chat_id: i64) -> String;

    /// A member joined; they count as active from `at`.
    fn member_joined(&self, chat_id: i64, user_id: i64, display_name: &str, at: DateTime<Utc>) {
        debug!("Roster: {} joined chat {}", display_name, chat_id);
        self.observe(chat_id, user_id, display_name, at);
    }
}

#[derive(Debug, Clone)]
struct MemberEntry {
    display_name: String,
    last_seen: DateTime<Utc>,
}

pub struct Roster {
    chats: RwLock<HashMap<i64, HashMap<i64, MemberEntry>>>,
    online_window: Duration,
}

impl Roster {
    pub fn new(online_window: Duration) -> Self {
        Self {
            chats: RwLock::new(HashMap::new()),
            online_window,
        }
    }

    /// Facts as of `now`: online names, then offline names, sorted.
    pub fn facts_at(&self, chat_id: i64, now: DateTime<Utc>) -> String {
        let chats = self.chats.read().unwrap_or_else(|p| p.into_inner());
        let Some(members) = chats.get(&chat_id).filter(|m| !m.is_empty()) else {
            return "No member information available.".to_string();
        };

        let cutoff = now
            .checked_sub_signed(self.online_window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut online = Vec::new();
        let mut offline = Vec::new();
        for entry in members.values() {
            if entry.last_seen >= cutoff {
                online.push(entry.display_name.as_str());
            } else {
                offline.push(entry.display_name.as_str());
            }
        }
        online.sort_unstable();
        offline.sort_unstable();

        format!(
            "Online ({}): {}\nOffline ({}): {}",
            online.len(),
            list_or_none(&online),
            offline.len(),
            list_or_none(&offline)
        )
    }
}

fn list_or_none(names: &[&str]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

impl RosterProvider for Roster {
    fn observe(&self, chat_id: i64, user_id: i64, display_name: &str, at: DateTime<Utc>) {
        let mut chats = self.chats.write().unwrap_or_else(|p| p.into_inner());
        let members = chats.entry(chat_id).or_default();
        let entry = members.entry(user_id).or_insert_with(|| MemberEntry {
            display_name: display_name.to_string(),
            last_seen: at,
        });
        entry.display_name = display_name.to_string();
        if at > entry.last_seen {
            entry.last_seen = at;
        }
    }

    fn member_left(&self, chat_id: i64, user_id: i64) {
        let mut chats = self.chats.write().unwrap_or_else(|p| p.into_inner());
        if let Some(members) = chats.get_mut(&chat_id) {
            members.remove(&user_id);
        }
    }

    fn facts(&self, chat_id: i64) -> String {
        self.facts_at(chat_id, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, minute, 0).unwrap()
    }

    #[test]
    fn test_empty_roster() {
        let roster = Roster::new(Duration::minutes(10));
        assert_eq!(roster.facts_at(1, at(0)), "No member information available.");
    }

    #[test]
    fn test_online_offline_split() {
        let roster = Roster::new(Duration::minutes(10));
        roster.observe(1, 10, "Carol", at(0));
        roster.observe(1, 11, "Bob", at(25));
        roster.observe(1, 12, "Alice", at(28));
        roster.observe(2, 13, "Elsewhere", at(28));

        assert_eq!(
            roster.facts_at(1, at(30)),
            "Online (2): Alice, Bob\nOffline (1): Carol"
        );
    }

    #[test]
    fn test_observe_updates_name_and_keeps_latest_time() {
        let roster = Roster::new(Duration::minutes(10));
        roster.observe(1, 10, "old", at(29));
        roster.observe(1, 10, "new", at(5));
        assert_eq!(roster.facts_at(1, at(30)), "Online (1): new\nOffline (0): none");
    }

    #[test]
    fn test_huge_window_counts_everyone_online() {
        let roster = Roster::new(Duration::minutes(1_000_000_000_000));
        roster.observe(1, 10, "Erin", at(0));
        assert_eq!(roster.facts_at(1, at(30)), "Online (1): Erin\nOffline (0): none");
    }

    #[test]
    fn test_member_left_is_removed() {
        let roster = Roster::new(Duration::minutes(10));
        roster.member_joined(1, 10, "Dave", at(0));
        roster.member_left(1, 10);
        roster.member_left(99, 10);
        assert_eq!(roster.facts_at(1, at(1)), "No member information available.");
    }
}
