use crate::types::PollTarget;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Logical partition of the messages a storage node keeps for one swarm.
///
/// The integer tag is what nodes put on the wire; everything else is derived
/// from the variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum Namespace {
    Default,
    ConfigUserProfile,
    ConfigContacts,
    ConfigConvoInfoVolatile,
    ConfigUserGroups,
    LegacyClosedGroup,
    GroupMessages,
    ConfigGroupKeys,
    ConfigGroupInfo,
    ConfigGroupMembers,
    RevokedRetrievableGroupMessages,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnknownNamespace(pub i32);

impl Display for UnknownNamespace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown namespace {}", self.0)
    }
}

impl std::error::Error for UnknownNamespace {}

impl Namespace {
    pub const ALL: [Namespace; 11] = [
        Namespace::Default,
        Namespace::ConfigUserProfile,
        Namespace::ConfigContacts,
        Namespace::ConfigConvoInfoVolatile,
        Namespace::ConfigUserGroups,
        Namespace::LegacyClosedGroup,
        Namespace::GroupMessages,
        Namespace::ConfigGroupKeys,
        Namespace::ConfigGroupInfo,
        Namespace::ConfigGroupMembers,
        Namespace::RevokedRetrievableGroupMessages,
    ];

    pub fn tag(self) -> i32 {
        match self {
            Namespace::Default => 0,
            Namespace::ConfigUserProfile => 2,
            Namespace::ConfigContacts => 3,
            Namespace::ConfigConvoInfoVolatile => 4,
            Namespace::ConfigUserGroups => 5,
            Namespace::LegacyClosedGroup => -10,
            Namespace::GroupMessages => 11,
            Namespace::ConfigGroupKeys => 12,
            Namespace::ConfigGroupInfo => 13,
            Namespace::ConfigGroupMembers => 14,
            Namespace::RevokedRetrievableGroupMessages => -11,
        }
    }

    pub fn from_tag(tag: i32) -> Result<Self, UnknownNamespace> {
        Namespace::ALL
            .iter()
            .copied()
            .find(|ns| ns.tag() == tag)
            .ok_or(UnknownNamespace(tag))
    }

    /// Lower values are merged first within one poll result. Keys and user
    /// config come before group state, which comes before anything that only
    /// tracks read state, and messages go last.
    pub fn processing_order(self) -> u8 {
        match self {
            Namespace::ConfigUserProfile | Namespace::ConfigContacts | Namespace::ConfigGroupKeys => 0,
            Namespace::ConfigUserGroups
            | Namespace::ConfigGroupInfo
            | Namespace::ConfigGroupMembers => 1,
            Namespace::ConfigConvoInfoVolatile => 2,
            Namespace::Default
            | Namespace::LegacyClosedGroup
            | Namespace::GroupMessages
            | Namespace::RevokedRetrievableGroupMessages => 3,
        }
    }

    /// Messages in these namespaces are handled inside the poll transaction
    /// instead of being queued.
    pub fn should_handle_synchronously(self) -> bool {
        matches!(
            self,
            Namespace::ConfigGroupKeys | Namespace::RevokedRetrievableGroupMessages
        )
    }

    pub fn should_fetch_since_last_hash(self) -> bool {
        !matches!(self, Namespace::RevokedRetrievableGroupMessages)
    }

    pub fn is_config_namespace(self) -> bool {
        matches!(
            self,
            Namespace::ConfigUserProfile
                | Namespace::ConfigContacts
                | Namespace::ConfigConvoInfoVolatile
                | Namespace::ConfigUserGroups
                | Namespace::ConfigGroupKeys
                | Namespace::ConfigGroupInfo
                | Namespace::ConfigGroupMembers
        )
    }

    pub fn defaults_for(target: &PollTarget) -> Vec<Namespace> {
        match target {
            PollTarget::Server(_) => vec![Namespace::Default],
            PollTarget::Swarm(id) if id.is_group() => vec![
                Namespace::ConfigGroupKeys,
                Namespace::ConfigGroupInfo,
                Namespace::ConfigGroupMembers,
                Namespace::GroupMessages,
                Namespace::RevokedRetrievableGroupMessages,
            ],
            PollTarget::Swarm(_) => vec![
                Namespace::ConfigUserProfile,
                Namespace::ConfigContacts,
                Namespace::ConfigConvoInfoVolatile,
                Namespace::ConfigUserGroups,
                Namespace::Default,
            ],
        }
    }

    pub fn legacy_group() -> Vec<Namespace> {
        vec![Namespace::LegacyClosedGroup]
    }
}

impl From<Namespace> for i32 {
    fn from(ns: Namespace) -> Self {
        ns.tag()
    }
}

impl TryFrom<i32> for Namespace {
    type Error = UnknownNamespace;

    fn try_from(tag: i32) -> Result<Self, Self::Error> {
        Namespace::from_tag(tag)
    }
}

impl Display for Namespace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.tag())
    }
}
