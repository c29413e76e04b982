//! Group mesh formation.
//!
//! Who dials whom is decided by id order alone:
//!
//! * the leader dials every other participant (`GroupRequest`);
//! * every other participant dials the participants whose id is strictly
//!   greater than its own, except the leader (`GroupResponse`).
//!
//! Every unordered pair therefore ends up with exactly one connection
//! without any negotiation.

use parley_core::PeerId;

/// Participants `me` must connect to.
///
/// For a private session the initiator is passed as the leader.
pub fn outbound_targets(me: PeerId, leader: PeerId, participants: &[PeerId]) -> Vec<PeerId> {
    participants
        .iter()
        .copied()
        .filter(|&id| id != me)
        .filter(|&id| me == leader || (id > me && id != leader))
        .collect()
}
