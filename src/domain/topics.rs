use std::collections::HashMap;

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::Rng;

use super::TopicId;

/// Fixed topic catalog. Broadcast payloads only ever carry the id; display
/// text is looked up locally so a tampered or stale payload cannot change
/// what a client scores against.
pub const TOPIC_CATALOG: &[(TopicId, &str)] = &[
    (1, "banana"),
    (2, "bicycle"),
    (3, "lighthouse"),
    (4, "penguin"),
    (5, "volcano"),
    (6, "umbrella"),
    (7, "guitar"),
    (8, "rocket"),
    (9, "octopus"),
    (10, "windmill"),
    (11, "snowman"),
    (12, "cactus"),
    (13, "submarine"),
    (14, "butterfly"),
    (15, "campfire"),
    (16, "telescope"),
];

static TOPIC_INDEX: Lazy<HashMap<TopicId, &'static str>> =
    Lazy::new(|| TOPIC_CATALOG.iter().copied().collect());

pub fn topic_text(id: TopicId) -> Option<&'static str> {
    TOPIC_INDEX.get(&id).copied()
}

/// Draws `count` distinct topic ids uniformly without replacement. Returns
/// fewer when the catalog is smaller than `count`.
pub fn draw_topic_choices<R: Rng + ?Sized>(rng: &mut R, count: usize) -> Vec<TopicId> {
    TOPIC_CATALOG
        .choose_multiple(rng, count)
        .map(|(id, _)| *id)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn lookup_hits_and_misses() {
        assert_eq!(topic_text(1), Some("banana"));
        assert_eq!(topic_text(9999), None);
    }

    #[test]
    fn choices_are_distinct_and_from_catalog() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let picks = draw_topic_choices(&mut rng, 3);
            assert_eq!(picks.len(), 3);
            let unique: HashSet<_> = picks.iter().collect();
            assert_eq!(unique.len(), 3);
            for id in &picks {
                assert!(topic_text(*id).is_some());
            }
        }
    }

    #[test]
    fn oversized_request_is_capped_at_catalog() {
        let mut rng = StdRng::seed_from_u64(7);
        let picks = draw_topic_choices(&mut rng, TOPIC_CATALOG.len() + 5);
        assert_eq!(picks.len(), TOPIC_CATALOG.len());
    }
}
