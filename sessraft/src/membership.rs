//! Cluster membership: members, roles and the configuration.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::summary::MessageSummary;
use crate::MemberId;

/// The role a member holds within the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    /// A voting member which participates in elections and commit quorums.
    Active,
    /// A learner which receives all committed entries but does not vote.
    Passive,
    /// A member which receives only configuration and heartbeats; a
    /// candidate for promotion.
    Reserve,
    /// A placeholder member which receives nothing.
    Inactive,
}

impl MemberRole {
    pub fn is_voter(&self) -> bool {
        matches!(self, MemberRole::Active)
    }

    /// Whether members of this role receive log entries from the leader.
    pub fn receives_entries(&self) -> bool {
        matches!(self, MemberRole::Active | MemberRole::Passive)
    }
}

/// A member of the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub role: MemberRole,
    /// An opaque address understood by the transport, if any.
    pub address: Option<String>,
}

impl Member {
    pub fn new(id: MemberId, role: MemberRole) -> Self {
        Self { id, role, address: None }
    }

    pub fn with_address(id: MemberId, role: MemberRole, address: impl Into<String>) -> Self {
        Self {
            id,
            role,
            address: Some(address.into()),
        }
    }
}

/// The membership configuration of the cluster.
///
/// `index` is the log index at which this configuration was appended (0 for
/// the bootstrap configuration), and `time` is a logical timestamp which
/// increases with every change. A server always operates under the latest
/// configuration it has seen, committed or not.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub index: u64,
    pub time: u64,
    members: BTreeMap<MemberId, Member>,
}

impl Configuration {
    /// Create a new initial configuration containing only the given member as
    /// an active voter.
    pub fn new_initial(id: MemberId) -> Self {
        let mut members = BTreeMap::new();
        members.insert(id, Member::new(id, MemberRole::Active));
        Self { index: 0, time: 0, members }
    }

    /// Create a configuration from the given member set.
    pub fn with_members(members: impl IntoIterator<Item = Member>) -> Self {
        Self {
            index: 0,
            time: 0,
            members: members.into_iter().map(|m| (m.id, m)).collect(),
        }
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn get(&self, id: MemberId) -> Option<&Member> {
        self.members.get(&id)
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.members.contains_key(&id)
    }

    /// The role the given member holds, `Inactive` when unknown.
    pub fn role_of(&self, id: MemberId) -> MemberRole {
        self.members.get(&id).map(|m| m.role).unwrap_or(MemberRole::Inactive)
    }

    /// IDs of all voting members.
    pub fn active_ids(&self) -> BTreeSet<MemberId> {
        self.members.values().filter(|m| m.role.is_voter()).map(|m| m.id).collect()
    }

    /// IDs of all members which receive log entries (active + passive),
    /// excluding the given local member.
    pub fn replication_targets(&self, exclude: MemberId) -> BTreeSet<MemberId> {
        self.members
            .values()
            .filter(|m| m.role.receives_entries() && m.id != exclude)
            .map(|m| m.id)
            .collect()
    }

    /// IDs of all reserve members, excluding the given local member.
    pub fn reserve_ids(&self, exclude: MemberId) -> BTreeSet<MemberId> {
        self.members
            .values()
            .filter(|m| m.role == MemberRole::Reserve && m.id != exclude)
            .map(|m| m.id)
            .collect()
    }

    /// The number of voters required for a majority of the active members.
    pub fn quorum(&self) -> usize {
        self.active_ids().len() / 2 + 1
    }

    /// A copy of this configuration with the given member inserted or
    /// replaced, its log index reset for re-appending, and its logical time
    /// advanced.
    pub fn to_added(&self, member: Member) -> Self {
        let mut members = self.members.clone();
        members.insert(member.id, member);
        Self {
            index: 0,
            time: self.time + 1,
            members,
        }
    }

    /// A copy of this configuration with the given member's role changed.
    pub fn to_role(&self, id: MemberId, role: MemberRole) -> Self {
        let mut members = self.members.clone();
        if let Some(m) = members.get_mut(&id) {
            m.role = role;
        }
        Self {
            index: 0,
            time: self.time + 1,
            members,
        }
    }

    /// A copy of this configuration with the given member removed.
    pub fn to_removed(&self, id: MemberId) -> Self {
        let mut members = self.members.clone();
        members.remove(&id);
        Self {
            index: 0,
            time: self.time + 1,
            members,
        }
    }

    /// A copy of this configuration with a replaced member set.
    pub fn to_members(&self, members: impl IntoIterator<Item = Member>) -> Self {
        Self {
            index: 0,
            time: self.time + 1,
            members: members.into_iter().map(|m| (m.id, m)).collect(),
        }
    }

    /// Whether `other` is more recent than this configuration.
    ///
    /// Configurations form a linear history ordered by logical time, with the
    /// log index breaking ties between a proposed and an appended copy.
    pub fn is_newer_than(&self, other: &Configuration) -> bool {
        (self.time, self.index) > (other.time, other.index)
    }
}

impl MessageSummary for Configuration {
    fn summary(&self) -> String {
        let members = self
            .members
            .values()
            .map(|m| format!("{}:{:?}", m.id, m.role))
            .collect::<Vec<_>>()
            .join(",");
        format!("{{index:{}, time:{}, members:[{}]}}", self.index, self.time, members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_of(roles: &[(MemberId, MemberRole)]) -> Configuration {
        Configuration::with_members(roles.iter().map(|(id, role)| Member::new(*id, *role)))
    }

    #[test]
    fn test_quorum_counts_only_active_members() {
        let config = config_of(&[
            (1, MemberRole::Active),
            (2, MemberRole::Active),
            (3, MemberRole::Active),
            (4, MemberRole::Passive),
            (5, MemberRole::Reserve),
        ]);
        assert_eq!(config.quorum(), 2);
        assert_eq!(config.active_ids().len(), 3);
    }

    #[test]
    fn test_replication_targets_exclude_self_and_reserves() {
        let config = config_of(&[
            (1, MemberRole::Active),
            (2, MemberRole::Active),
            (3, MemberRole::Passive),
            (4, MemberRole::Reserve),
        ]);
        let targets = config.replication_targets(1);
        assert!(targets.contains(&2));
        assert!(targets.contains(&3));
        assert!(!targets.contains(&1));
        assert!(!targets.contains(&4));
        assert_eq!(config.reserve_ids(1), maplit::btreeset! {4});
    }

    #[test]
    fn test_role_changes_advance_logical_time() {
        let config = config_of(&[(1, MemberRole::Active)]);
        let added = config.to_added(Member::new(2, MemberRole::Reserve));
        assert_eq!(added.time, config.time + 1);
        assert_eq!(added.role_of(2), MemberRole::Reserve);

        let promoted = added.to_role(2, MemberRole::Passive);
        assert_eq!(promoted.role_of(2), MemberRole::Passive);
        assert!(promoted.is_newer_than(&added));

        let removed = promoted.to_removed(2);
        assert!(!removed.contains(2));
        assert_eq!(removed.role_of(2), MemberRole::Inactive);
    }
}
