//! This module holds some utilities for working with group members.
//!
//! A protocol run happens among a fixed group of members, each identified by
//! a [`MemberIndex`]. Over the course of a run members can be marked as
//! inactive or disqualified, and protocol states stop accepting their messages.
use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

/// The stable ordinal position of a participant within a group.
///
/// Indices start at 1, so that `0` is never a valid member.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MemberIndex(u8);

impl MemberIndex {
    pub fn new(index: u8) -> Option<Self> {
        if index == 0 {
            return None;
        }
        Some(Self(index))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl From<MemberIndex> for u8 {
    fn from(m: MemberIndex) -> Self {
        m.0
    }
}

impl fmt::Display for MemberIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validates that a message sender really is the member it claims to be.
///
/// Protocol states call this from their `receive` implementations, binding a
/// member index to the public key which signed the network message.
pub trait MembershipValidator: Send + Sync {
    fn is_valid_membership(&self, member: MemberIndex, public_key: &[u8]) -> bool;
}

/// A validator backed by the list of operator keys selected for the group.
///
/// The operator at position `i` of the list holds member index `i + 1`. The
/// same operator can be selected several times, holding several indices.
#[derive(Debug, Clone)]
pub struct OperatorMembershipValidator {
    operators: Vec<Vec<u8>>,
}

impl OperatorMembershipValidator {
    pub fn new(operators: Vec<Vec<u8>>) -> Self {
        Self { operators }
    }

    /// All the member indices held by the operator with this key.
    pub fn indices_of(&self, public_key: &[u8]) -> Vec<MemberIndex> {
        self.operators
            .iter()
            .enumerate()
            .filter(|(_, key)| key.as_slice() == public_key)
            .filter_map(|(i, _)| u8::try_from(i + 1).ok().and_then(MemberIndex::new))
            .collect()
    }
}

impl MembershipValidator for OperatorMembershipValidator {
    fn is_valid_membership(&self, member: MemberIndex, public_key: &[u8]) -> bool {
        let position = usize::from(member.get()) - 1;
        match self.operators.get(position) {
            Some(key) => key.as_slice() == public_key,
            None => false,
        }
    }
}

/// The members taking part in a protocol run.
#[derive(Debug, Clone, Serialize)]
pub struct Group {
    size: u8,
    dishonest_threshold: u8,
    disqualified: BTreeSet<MemberIndex>,
    inactive: BTreeSet<MemberIndex>,
}

impl Group {
    /// Create a group of `size` members, with indices `1..=size`.
    ///
    /// This will return None if the threshold doesn't fit in the group.
    pub fn new(size: u8, dishonest_threshold: u8) -> Option<Self> {
        if size == 0 || dishonest_threshold >= size {
            return None;
        }
        Some(Self {
            size,
            dishonest_threshold,
            disqualified: BTreeSet::new(),
            inactive: BTreeSet::new(),
        })
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    pub fn dishonest_threshold(&self) -> u8 {
        self.dishonest_threshold
    }

    pub fn member_indices(&self) -> impl Iterator<Item = MemberIndex> {
        (1..=self.size).map(MemberIndex)
    }

    pub fn contains(&self, member: MemberIndex) -> bool {
        member.0 <= self.size
    }

    pub fn mark_disqualified(&mut self, member: MemberIndex) {
        if self.contains(member) {
            self.disqualified.insert(member);
        }
    }

    pub fn mark_inactive(&mut self, member: MemberIndex) {
        if self.contains(member) {
            self.inactive.insert(member);
        }
    }

    /// Whether this member still takes part in the protocol.
    pub fn is_operating(&self, member: MemberIndex) -> bool {
        self.contains(member)
            && !self.disqualified.contains(&member)
            && !self.inactive.contains(&member)
    }

    pub fn operating_members(&self) -> Vec<MemberIndex> {
        self.member_indices()
            .filter(|m| self.is_operating(*m))
            .collect()
    }

    /// Iterate over the other operating members
    pub fn others(&self, me: MemberIndex) -> impl Iterator<Item = MemberIndex> + '_ {
        self.member_indices()
            .filter(move |m| *m != me && self.is_operating(*m))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn index(i: u8) -> MemberIndex {
        MemberIndex::new(i).unwrap()
    }

    #[test]
    fn test_zero_is_not_a_member_index() {
        assert!(MemberIndex::new(0).is_none());
        assert_eq!(index(3).get(), 3);
    }

    #[test]
    fn test_operator_validator_binds_positions() {
        let validator =
            OperatorMembershipValidator::new(vec![vec![1], vec![2], vec![1]]);

        assert!(validator.is_valid_membership(index(1), &[1]));
        assert!(validator.is_valid_membership(index(2), &[2]));
        assert!(validator.is_valid_membership(index(3), &[1]));
        assert!(!validator.is_valid_membership(index(2), &[1]));
        assert!(!validator.is_valid_membership(index(4), &[1]));
        assert_eq!(validator.indices_of(&[1]), vec![index(1), index(3)]);
    }

    #[test]
    fn test_group_tracks_operating_members() {
        let mut group = Group::new(5, 2).unwrap();
        group.mark_disqualified(index(2));
        group.mark_inactive(index(4));
        group.mark_inactive(index(9));

        assert_eq!(group.operating_members(), vec![index(1), index(3), index(5)]);
        assert!(!group.is_operating(index(9)));
        assert_eq!(
            group.others(index(1)).collect::<Vec<_>>(),
            vec![index(3), index(5)]
        );
    }

    #[test]
    fn test_group_rejects_bad_threshold() {
        assert!(Group::new(3, 3).is_none());
        assert!(Group::new(0, 0).is_none());
    }
}
