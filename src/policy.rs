//! Edit-window policy.
//!
//! Records are EDITABLE for five hours from creation, then LOCKED for
//! non-admin roles. The transition is evaluated lazily as a pure function of
//! `(now, created_at)` rather than stored state, so there is no timer to
//! drift. Administrators bypass the lock entirely.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Mutex;

use crate::models::Role;

/// Non-admin roles may edit a record for this long after creation.
pub fn edit_window() -> Duration {
    Duration::hours(5)
}

/// The expiration warning window opens one hour before the lock...
fn warning_start() -> Duration {
    Duration::hours(4)
}

/// ...and closes ten minutes later.
fn warning_end() -> Duration {
    Duration::hours(4) + Duration::minutes(10)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditState {
    Editable,
    Locked,
}

/// Current edit state for a record and role.
pub fn edit_state(role: Role, created_at: DateTime<Utc>, now: DateTime<Utc>) -> EditState {
    if role.is_admin() {
        return EditState::Editable;
    }
    if now - created_at >= edit_window() {
        EditState::Locked
    } else {
        EditState::Editable
    }
}

pub fn is_editable(role: Role, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    edit_state(role, created_at, now) == EditState::Editable
}

/// Whether the one-shot expiration warning is currently due for a record
/// created at `created_at`. Role and ownership filtering happen at the call
/// site; this is only the time window.
pub fn warning_due(created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let age = now - created_at;
    age >= warning_start() && age <= warning_end()
}

/// Per-session "already warned" set. Prevents the expiration warning from
/// firing more than once per record within the same session.
#[derive(Default)]
pub struct WarnedSet {
    seen: Mutex<HashSet<String>>,
}

impl WarnedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true exactly once per record id.
    pub fn first_warning(&self, record_id: &str) -> bool {
        match self.seen.lock() {
            Ok(mut seen) => seen.insert(record_id.to_string()),
            Err(_) => false,
        }
    }
}

/// Scan records owned by `user_id` and return the ids whose warning should
/// fire now, marking them warned. Admins never receive warnings.
pub fn due_warnings<'a>(
    records: impl IntoIterator<Item = (&'a str, DateTime<Utc>, Option<&'a str>)>,
    role: Role,
    user_id: &str,
    warned: &WarnedSet,
    now: DateTime<Utc>,
) -> Vec<String> {
    if role.is_admin() {
        return Vec::new();
    }
    records
        .into_iter()
        .filter(|(_, created_at, created_by)| {
            *created_by == Some(user_id) && warning_due(*created_at, now)
        })
        .filter(|(id, _, _)| warned.first_warning(id))
        .map(|(id, _, _)| id.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ago(minutes: i64) -> DateTime<Utc> {
        Utc::now() - Duration::minutes(minutes)
    }

    #[test]
    fn test_edit_window_boundaries() {
        let now = Utc::now();
        // 4h59m old: still editable for a non-admin
        assert!(is_editable(Role::Registrar, ago(4 * 60 + 59), now));
        // 5h01m old: locked
        assert!(!is_editable(Role::Registrar, ago(5 * 60 + 1), now));
        // Admin can edit either
        assert!(is_editable(Role::Admin, ago(5 * 60 + 1), now));
        assert!(is_editable(Role::Admin, ago(48 * 60), now));
    }

    #[test]
    fn test_warning_window() {
        let now = Utc::now();
        assert!(!warning_due(ago(3 * 60 + 59), now));
        assert!(warning_due(ago(4 * 60), now));
        assert!(warning_due(ago(4 * 60 + 9), now));
        assert!(!warning_due(ago(4 * 60 + 11), now));
    }

    #[test]
    fn test_warning_fires_once_per_record() {
        let warned = WarnedSet::new();
        let now = Utc::now();
        let created = ago(4 * 60 + 2);
        let records = vec![
            ("stat-1", created, Some("user-7")),
            ("stat-2", created, Some("someone-else")),
            ("stat-3", ago(10), Some("user-7")),
        ];

        let first = due_warnings(
            records
                .iter()
                .map(|(id, at, by)| (*id, *at, by.as_deref())),
            Role::Registrar,
            "user-7",
            &warned,
            now,
        );
        assert_eq!(first, vec!["stat-1".to_string()]);

        // Same scan again: already warned, nothing fires.
        let second = due_warnings(
            records
                .iter()
                .map(|(id, at, by)| (*id, *at, by.as_deref())),
            Role::Registrar,
            "user-7",
            &warned,
            now,
        );
        assert!(second.is_empty());
    }

    #[test]
    fn test_admins_never_warned() {
        let warned = WarnedSet::new();
        let now = Utc::now();
        let records = vec![("stat-1", ago(4 * 60 + 2), Some("admin-1"))];
        let due = due_warnings(
            records
                .iter()
                .map(|(id, at, by)| (*id, *at, by.as_deref())),
            Role::Admin,
            "admin-1",
            &warned,
            now,
        );
        assert!(due.is_empty());
    }
}
