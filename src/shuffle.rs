// Cadenza -- Media streaming daemon with play-queue and download orchestration
// Copyright 2024 Ruud van Asseldonk
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// A copy of the License has been included in the root of the repository.

//! Logic for shuffling the queue and for radio playback.

use rand::Rng;
use rand::SeedableRng;
use rand::seq::SliceRandom;

use crate::MediaCatalog;
use crate::prim::Track;
use crate::queue::QueuedTrack;

pub type Prng = rand_chacha::ChaCha8Rng;

pub fn new_prng() -> Prng {
    Prng::from_entropy()
}

/// Randomly permute the queue without disrupting active playback.
///
/// The entry under the cursor, if any, moves to the front and stays there;
/// everything behind it is shuffled. Returns the new cursor position.
pub fn shuffle_pinning_current<R: Rng>(
    rng: &mut R,
    tracks: &mut Vec<QueuedTrack>,
    current: Option<usize>,
) -> Option<usize> {
    match current {
        Some(i) => {
            tracks.swap(0, i);
            tracks[1..].shuffle(rng);
            Some(0)
        }
        None => {
            tracks.shuffle(rng);
            None
        }
    }
}

/// Search criteria for drawing random tracks from the catalog.
#[derive(Clone, Debug, Default)]
pub struct RadioCriteria {
    pub genre: Option<String>,
    pub from_year: Option<u32>,
    pub to_year: Option<u32>,
}

/// A lazy, endless source of tracks matching some criteria.
///
/// Radio playback keeps the queue populated by appending batches from this
/// buffer; there is no state to it beyond the criteria, every batch is an
/// independent draw.
pub struct RadioBuffer {
    criteria: RadioCriteria,
}

impl RadioBuffer {
    pub fn new(criteria: RadioCriteria) -> RadioBuffer {
        RadioBuffer { criteria }
    }

    pub fn criteria(&self) -> &RadioCriteria {
        &self.criteria
    }

    pub fn next_batch(&self, catalog: &dyn MediaCatalog, count: usize) -> Vec<Track> {
        catalog.random_tracks(&self.criteria, count)
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;
    use std::sync::Arc;

    use rand::SeedableRng;

    use crate::download::Download;
    use crate::download::test::make_track;
    use crate::prim::QueueId;
    use crate::queue::QueuedTrack;
    use super::{Prng, shuffle_pinning_current};

    fn make_entries(n: u64) -> Vec<QueuedTrack> {
        let dir = Path::new("/nonexistent/cadenza-test-cache");
        (0..n)
            .map(|i| QueuedTrack {
                queue_id: QueueId(i),
                download: Arc::new(Download::new(make_track(i, 100), dir, false)),
            })
            .collect()
    }

    #[test]
    fn shuffle_keeps_the_current_entry_at_the_front() {
        let mut rng = Prng::seed_from_u64(1);
        for start in 0..5 {
            let mut entries = make_entries(5);
            let pinned = entries[start].queue_id;
            let new_current = shuffle_pinning_current(&mut rng, &mut entries, Some(start));
            assert_eq!(new_current, Some(0));
            assert_eq!(entries[0].queue_id, pinned);
            assert_eq!(entries.len(), 5);
        }
    }

    #[test]
    fn shuffle_without_cursor_permutes_everything() {
        let mut rng = Prng::seed_from_u64(2);
        let mut entries = make_entries(16);
        let new_current = shuffle_pinning_current(&mut rng, &mut entries, None);
        assert_eq!(new_current, None);
        assert_eq!(entries.len(), 16);

        let mut ids: Vec<u64> = entries.iter().map(|qt| qt.queue_id.0).collect();
        ids.sort();
        let expected: Vec<u64> = (0..16).collect();
        assert_eq!(ids, expected);
    }
}
