//! Deterministic offerer/answerer assignment
//!
//! Both ends of a link evaluate [`assign_role`] with the inputs swapped and
//! must arrive at opposite roles without exchanging another message.

use crate::signaling::{PeerId, Role};
use serde::{Deserialize, Serialize};

/// Id ordering used when nothing else decides the roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RolePolicy {
    #[default]
    LargerIdOffers,
    SmallerIdOffers,
}

/// Role-relevant facts about one side of a link
#[derive(Debug, Clone, Copy)]
pub struct Participant<'a> {
    pub id: &'a PeerId,
    /// Session start time (ms)
    pub time_stamp: u64,
    /// Configured forced role, if any
    pub forced: Option<Role>,
    /// Whether this side currently belongs to a relay chain
    pub relay_member: bool,
}

/// Role of `local` on its link to `remote`.
///
/// Precedence:
/// 1. a forced role on exactly one side, or different forced roles, win;
/// 2. when both force the same role, it goes to the side that wins the
///    tie-break (relay membership, then earlier timestamp, then id);
/// 3. with no forced roles a relay member offers to a non-member;
/// 4. otherwise the id policy decides.
pub fn assign_role(local: &Participant<'_>, remote: &Participant<'_>, policy: RolePolicy) -> Role {
    match (local.forced, remote.forced) {
        (Some(mine), None) => mine,
        (None, Some(theirs)) => theirs.opposite(),
        (Some(mine), Some(theirs)) if mine != theirs => mine,
        (Some(mine), Some(_)) => {
            if wins_tie_break(local, remote, policy) {
                mine
            } else {
                mine.opposite()
            }
        }
        (None, None) => {
            if local.relay_member != remote.relay_member {
                return if local.relay_member { Role::Offerer } else { Role::Answerer };
            }
            if id_offers(local.id, remote.id, policy) {
                Role::Offerer
            } else {
                Role::Answerer
            }
        }
    }
}

fn wins_tie_break(local: &Participant<'_>, remote: &Participant<'_>, policy: RolePolicy) -> bool {
    if local.relay_member != remote.relay_member {
        return local.relay_member;
    }
    if local.time_stamp != remote.time_stamp {
        return local.time_stamp < remote.time_stamp;
    }
    id_offers(local.id, remote.id, policy)
}

fn id_offers(local: &PeerId, remote: &PeerId, policy: RolePolicy) -> bool {
    match policy {
        RolePolicy::LargerIdOffers => local > remote,
        RolePolicy::SmallerIdOffers => local < remote,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn side(id: &PeerId, time_stamp: u64, forced: Option<Role>, relay_member: bool) -> Participant<'_> {
        Participant { id, time_stamp, forced, relay_member }
    }

    #[test]
    fn larger_id_offers_by_default() {
        let five = PeerId::from("5");
        let nine = PeerId::from("9");
        let a = side(&five, 100, None, false);
        let b = side(&nine, 200, None, false);
        assert_eq!(assign_role(&b, &a, RolePolicy::default()), Role::Offerer);
        assert_eq!(assign_role(&a, &b, RolePolicy::default()), Role::Answerer);
    }

    #[test]
    fn mirror_policy_flips() {
        let five = PeerId::from("5");
        let nine = PeerId::from("9");
        let a = side(&five, 0, None, false);
        let b = side(&nine, 0, None, false);
        assert_eq!(assign_role(&a, &b, RolePolicy::SmallerIdOffers), Role::Offerer);
    }

    #[test]
    fn single_forced_role_is_honored() {
        let five = PeerId::from("5");
        let nine = PeerId::from("9");
        let a = side(&five, 0, Some(Role::Offerer), false);
        let b = side(&nine, 0, None, false);
        assert_eq!(assign_role(&a, &b, RolePolicy::default()), Role::Offerer);
        assert_eq!(assign_role(&b, &a, RolePolicy::default()), Role::Answerer);
    }

    #[test]
    fn contested_forced_role_goes_to_earlier_joiner() {
        let five = PeerId::from("5");
        let nine = PeerId::from("9");
        let early = side(&five, 10, Some(Role::Offerer), false);
        let late = side(&nine, 20, Some(Role::Offerer), false);
        assert_eq!(assign_role(&early, &late, RolePolicy::default()), Role::Offerer);
        assert_eq!(assign_role(&late, &early, RolePolicy::default()), Role::Answerer);
    }

    #[test]
    fn relay_member_offers_to_newcomer() {
        let five = PeerId::from("5");
        let nine = PeerId::from("9");
        let member = side(&five, 0, None, true);
        let newcomer = side(&nine, 0, None, false);
        assert_eq!(assign_role(&member, &newcomer, RolePolicy::default()), Role::Offerer);
        assert_eq!(assign_role(&newcomer, &member, RolePolicy::default()), Role::Answerer);
    }

    #[test]
    fn assignment_is_antisymmetric_over_all_inputs() {
        let ids = [PeerId::from("a"), PeerId::from("b")];
        let forced = [None, Some(Role::Offerer), Some(Role::Answerer)];
        let stamps = [1u64, 2];
        let policies = [RolePolicy::LargerIdOffers, RolePolicy::SmallerIdOffers];

        for policy in policies {
            for lf in forced {
                for rf in forced {
                    for lr in [false, true] {
                        for rr in [false, true] {
                            for lt in stamps {
                                for rt in stamps {
                                    let local = side(&ids[0], lt, lf, lr);
                                    let remote = side(&ids[1], rt, rf, rr);
                                    let mine = assign_role(&local, &remote, policy);
                                    let theirs = assign_role(&remote, &local, policy);
                                    assert_eq!(
                                        mine,
                                        theirs.opposite(),
                                        "{:?} / {:?} under {:?}",
                                        local,
                                        remote,
                                        policy
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}
