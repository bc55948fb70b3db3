//! Property-based tests for membership state merging
//!
//! Records are fed straight into the SWIM sequencing core, bypassing the
//! network, so any delivery order and duplication can be generated.

use crate::config::SwimConfig;
use crate::member::{Member, MemberId, MemberState};
use crate::swim::engine::tests::{harness, remote};
use proptest::prelude::*;

/// Strategy for member ids drawn from a small pool so updates collide
pub fn member_id_strategy() -> impl Strategy<Value = String> {
    prop_oneof![Just("a"), Just("b"), Just("c"), Just("d")].prop_map(String::from)
}

/// Strategy for states a member can be reported in
pub fn state_strategy() -> impl Strategy<Value = MemberState> {
    prop_oneof![
        Just(MemberState::Alive),
        Just(MemberState::Suspect),
        Just(MemberState::Dead),
    ]
}

/// Strategy for non-terminal states
pub fn live_state_strategy() -> impl Strategy<Value = MemberState> {
    prop_oneof![Just(MemberState::Alive), Just(MemberState::Suspect)]
}

fn port_for(id: &str) -> u16 {
    7100 + id.bytes().map(u16::from).sum::<u16>()
}

/// Record whose properties are a function of (id, incarnation)
fn versioned_record(id: &str, incarnation: u64, state: MemberState) -> Member {
    remote(id, port_for(id), incarnation, state)
        .with_property("generation", incarnation.to_string())
}

proptest! {
    #[test]
    fn test_merge_converges_regardless_of_order(
        updates in prop::collection::vec(
            (member_id_strategy(), 1u64..6, live_state_strategy()),
            0..40,
        ),
        seed in any::<u64>(),
    ) {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let expected = |updates: &[(String, u64, MemberState)], id: &str| {
            updates
                .iter()
                .filter(|(uid, _, _)| uid == id)
                .map(|(_, inc, state)| (*inc, *state))
                .chain(std::iter::once((1, MemberState::Alive)))
                .max()
        };

        // Same updates, shuffled and partly duplicated, on a second node
        let mut delivery = updates.clone();
        delivery.extend(updates.iter().take(updates.len() / 2).cloned());
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        delivery.shuffle(&mut rng);

        for order in [&updates, &delivery] {
            let mut h = harness(SwimConfig::default(), vec![]);
            for id in ["a", "b", "c", "d"] {
                h.core.update_state(versioned_record(id, 1, MemberState::Alive));
            }
            for (id, inc, state) in order.iter() {
                h.core.update_state(versioned_record(id, *inc, *state));
            }

            for id in ["a", "b", "c", "d"] {
                let member = h.directory.get(&MemberId::new(id)).unwrap();
                let (inc, state) = expected(&updates, id).unwrap();
                prop_assert_eq!(member.incarnation, inc);
                prop_assert_eq!(member.state, state);
                prop_assert_eq!(
                    member.properties.get("generation").cloned(),
                    Some(inc.to_string())
                );
            }
        }
    }

    #[test]
    fn test_incarnation_never_decreases(
        updates in prop::collection::vec(
            (member_id_strategy(), 0u64..8, state_strategy()),
            1..60,
        ),
    ) {
        let mut h = harness(SwimConfig::default(), vec![]);
        let mut seen: std::collections::HashMap<String, u64> = Default::default();

        for (id, inc, state) in updates {
            h.core.update_state(versioned_record(&id, inc, state));
            match h.directory.get(&MemberId::new(id.as_str())) {
                Some(member) => {
                    let previous = seen.insert(id.clone(), member.incarnation).unwrap_or(0);
                    prop_assert!(member.incarnation >= previous);
                    prop_assert!(member.state != MemberState::Dead);
                }
                None => {
                    // Removal resets what may legitimately re-appear
                    seen.remove(&id);
                }
            }
        }
    }

    #[test]
    fn test_local_member_survives_any_claim(
        claims in prop::collection::vec((0u64..30, state_strategy()), 1..30),
    ) {
        let mut h = harness(SwimConfig::default(), vec![]);
        let local_id = MemberId::new("local");

        for (inc, state) in claims {
            let mut claim = Member::new("local", crate::swim::engine::tests::addr(7000));
            claim.incarnation = inc;
            claim.state = state;

            prop_assert!(!h.core.update_state(claim));
            let local = h.directory.get(&local_id).unwrap();
            prop_assert_eq!(local.state, MemberState::Alive);
            prop_assert!(local.incarnation >= inc);
            if state != MemberState::Alive {
                prop_assert!(local.incarnation > inc);
            }
        }
    }

    #[test]
    fn test_defense_is_idempotent(inc in 0u64..30, state in state_strategy()) {
        let mut h = harness(SwimConfig::default(), vec![]);
        let mut claim = Member::new("local", crate::swim::engine::tests::addr(7000));
        claim.incarnation = inc;
        claim.state = state;

        h.core.defend(&claim);
        let first = h.directory.local().unwrap().incarnation;
        prop_assert!(!h.core.defend(&claim));
        prop_assert_eq!(h.directory.local().unwrap().incarnation, first);
    }
}
