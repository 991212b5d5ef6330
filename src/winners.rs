//! Winner selection
//!
//! Invite giveaways award the users tied at the top of the validated invite
//! counts, after filtering by the minimum invite requirement. Classic
//! giveaways draw uniformly from the participants. Ties and draws are broken
//! with the injected RNG so tests can seed it.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::models::{Giveaway, GiveawayKind, UserId};

pub struct WinnerSelector;

impl WinnerSelector {
    /// Pick at most `winner_count` winners. An empty list is a valid outcome.
    pub fn select<R: Rng + ?Sized>(
        giveaway: &Giveaway,
        invite_counts: &HashMap<UserId, u32>,
        rng: &mut R,
    ) -> Vec<UserId> {
        let limit = giveaway.winner_count as usize;
        match giveaway.kind {
            GiveawayKind::Invite => {
                let min_invites = giveaway.requirements.min_invites;
                let mut top = Self::top_tie_group(invite_counts, min_invites);
                top.shuffle(rng);
                top.truncate(limit);
                top
            }
            GiveawayKind::Classic => {
                let mut pool: Vec<UserId> = giveaway.participants.iter().cloned().collect();
                pool.shuffle(rng);
                pool.truncate(limit);
                pool
            }
        }
    }

    /// Every eligible user sharing the highest count, sorted by id.
    pub fn top_tie_group(invite_counts: &HashMap<UserId, u32>, min_invites: u32) -> Vec<UserId> {
        let eligible = invite_counts
            .iter()
            .filter(|(_, count)| **count > 0 && **count >= min_invites);

        let Some(max) = eligible.clone().map(|(_, count)| *count).max() else {
            return Vec::new();
        };

        let mut group: Vec<UserId> = eligible
            .filter(|(_, count)| **count == max)
            .map(|(user, _)| user.clone())
            .collect();
        // HashMap order is random per process; sort so the RNG alone decides
        group.sort();
        group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewGiveaway, Requirements};
    use chrono::{Duration, Utc};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn giveaway(kind: GiveawayKind, winner_count: u32, min_invites: u32) -> Giveaway {
        let now = Utc::now();
        Giveaway::new(
            "g1",
            NewGiveaway {
                title: "Prize".into(),
                prize: "Prize".into(),
                kind,
                winner_count,
                requirements: Requirements {
                    min_invites,
                    ..Default::default()
                },
                ..Default::default()
            },
            now + Duration::hours(1),
            now,
        )
    }

    fn counts(pairs: &[(&str, u32)]) -> HashMap<UserId, u32> {
        pairs.iter().map(|(u, c)| (u.to_string(), *c)).collect()
    }

    #[test]
    fn test_highest_count_wins() {
        let g = giveaway(GiveawayKind::Invite, 1, 2);
        let mut rng = StdRng::seed_from_u64(7);
        let winners = WinnerSelector::select(&g, &counts(&[("a", 3), ("b", 2)]), &mut rng);
        assert_eq!(winners, vec!["a".to_string()]);
    }

    #[test]
    fn test_tie_group_not_padded() {
        let g = giveaway(GiveawayKind::Invite, 3, 0);
        let mut rng = StdRng::seed_from_u64(1);
        let winners = WinnerSelector::select(
            &g,
            &counts(&[("a", 4), ("b", 4), ("c", 1)]),
            &mut rng,
        );
        assert_eq!(winners.len(), 2);
        assert!(winners.contains(&"a".to_string()));
        assert!(winners.contains(&"b".to_string()));
    }

    #[test]
    fn test_tie_group_truncated_to_winner_count() {
        let g = giveaway(GiveawayKind::Invite, 2, 0);
        let pool = counts(&[("a", 5), ("b", 5), ("c", 5), ("d", 5)]);
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let winners = WinnerSelector::select(&g, &pool, &mut rng);
            assert_eq!(winners.len(), 2);
            assert!(winners.iter().all(|w| pool[w] == 5));
        }
    }

    #[test]
    fn test_min_invites_filters_everyone() {
        let g = giveaway(GiveawayKind::Invite, 1, 5);
        let mut rng = StdRng::seed_from_u64(3);
        assert!(WinnerSelector::select(&g, &counts(&[("a", 4)]), &mut rng).is_empty());
    }

    #[test]
    fn test_classic_draws_from_participants() {
        let mut g = giveaway(GiveawayKind::Classic, 2, 0);
        g.participants.extend(["u1", "u2", "u3"].map(String::from));
        let mut rng = StdRng::seed_from_u64(9);
        let winners = WinnerSelector::select(&g, &HashMap::new(), &mut rng);
        assert_eq!(winners.len(), 2);
        assert!(winners.iter().all(|w| g.participants.contains(w)));
        assert_ne!(winners[0], winners[1]);
    }

    #[test]
    fn test_classic_without_participants() {
        let g = giveaway(GiveawayKind::Classic, 1, 0);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(WinnerSelector::select(&g, &HashMap::new(), &mut rng).is_empty());
    }
}
