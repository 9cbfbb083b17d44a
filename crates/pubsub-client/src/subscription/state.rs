//! Subscription set, cursor and connectivity state. Owned by the driver.

use std::collections::BTreeMap;

pub(crate) const PRESENCE_SUFFIX: &str = "-pnpres";

/// Position in the message stream. `timetoken == 0` means the next
/// request is a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    pub timetoken: i64,
    pub region: i32,
}

impl Cursor {
    pub fn is_handshake(&self) -> bool {
        self.timetoken == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    UnexpectedDisconnect,
}

/// Read-only copy published for callers outside the driver.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct Snapshot {
    pub channels: Vec<String>,
    pub groups: Vec<String>,
    pub connection: ConnectionState,
    pub cursor: Cursor,
}

#[derive(Debug, Default)]
pub(crate) struct SubscriptionState {
    /// name → with presence
    channels: BTreeMap<String, bool>,
    groups: BTreeMap<String, bool>,
    pub cursor: Cursor,
    pub connection: ConnectionState,
    pub retry_count: u32,
}

fn merge(target: &mut BTreeMap<String, bool>, names: &[String], with_presence: bool) -> bool {
    let mut changed = false;
    for name in names {
        let entry = target.entry(name.clone()).or_insert_with(|| {
            changed = true;
            false
        });
        if with_presence && !*entry {
            *entry = true;
            changed = true;
        }
    }
    changed
}

fn take(target: &mut BTreeMap<String, bool>, names: &[String]) -> Vec<String> {
    names
        .iter()
        .filter(|n| target.remove(n.as_str()).is_some())
        .cloned()
        .collect()
}

fn with_presence_variants(map: &BTreeMap<String, bool>) -> Vec<String> {
    let mut out = Vec::with_capacity(map.len());
    for (name, presence) in map {
        out.push(name.clone());
        if *presence {
            out.push(format!("{name}{PRESENCE_SUFFIX}"));
        }
    }
    out
}

impl SubscriptionState {
    /// Union the given names into the set. Presence flags are OR-ed.
    /// Returns whether anything changed.
    pub fn add(&mut self, channels: &[String], groups: &[String], with_presence: bool) -> bool {
        let c = merge(&mut self.channels, channels, with_presence);
        let g = merge(&mut self.groups, groups, with_presence);
        c || g
    }

    /// Remove the given names, returning the ones that were present.
    pub fn remove(&mut self, channels: &[String], groups: &[String]) -> (Vec<String>, Vec<String>) {
        (take(&mut self.channels, channels), take(&mut self.groups, groups))
    }

    pub fn clear(&mut self) -> (Vec<String>, Vec<String>) {
        let channels = std::mem::take(&mut self.channels).into_keys().collect();
        let groups = std::mem::take(&mut self.groups).into_keys().collect();
        (channels, groups)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.groups.is_empty()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    /// Channel list for the long poll, presence variants included.
    pub fn wire_channels(&self) -> Vec<String> {
        with_presence_variants(&self.channels)
    }

    pub fn wire_groups(&self) -> Vec<String> {
        with_presence_variants(&self.groups)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            channels: self.channel_names(),
            groups: self.group_names(),
            connection: self.connection,
            cursor: self.cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn union_with_presence_or() {
        let mut state = SubscriptionState::default();
        assert!(state.add(&names(&["a", "b"]), &[], true));
        assert!(state.add(&names(&["b", "c"]), &names(&["g"]), false));
        assert!(!state.add(&names(&["a"]), &[], false));

        assert_eq!(state.channel_names(), names(&["a", "b", "c"]));
        assert_eq!(
            state.wire_channels(),
            names(&["a", "a-pnpres", "b", "b-pnpres", "c"])
        );
        assert_eq!(state.wire_groups(), names(&["g"]));

        assert!(state.add(&[], &names(&["g"]), true));
        assert_eq!(state.wire_groups(), names(&["g", "g-pnpres"]));
    }

    #[test]
    fn remove_reports_only_members() {
        let mut state = SubscriptionState::default();
        state.add(&names(&["a", "b"]), &names(&["g"]), false);
        let (c, g) = state.remove(&names(&["a", "zzz"]), &names(&["g"]));
        assert_eq!(c, names(&["a"]));
        assert_eq!(g, names(&["g"]));
        assert!(!state.is_empty());

        let (c, g) = state.clear();
        assert_eq!(c, names(&["b"]));
        assert!(g.is_empty());
        assert!(state.is_empty());
    }

    #[test]
    fn snapshot_reflects_state() {
        let mut state = SubscriptionState::default();
        state.add(&names(&["a"]), &[], true);
        state.cursor = Cursor {
            timetoken: 17,
            region: 1,
        };
        state.connection = ConnectionState::Connected;
        let snap = state.snapshot();
        assert_eq!(snap.channels, names(&["a"]));
        assert_eq!(snap.connection, ConnectionState::Connected);
        assert!(!snap.cursor.is_handshake());
    }
}
