// Cadenza -- Media streaming daemon with play-queue and download orchestration
// Copyright 2024 Ruud van Asseldonk
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// A copy of the License has been included in the root of the repository.

//! The ordered, cursor-tracked list of downloads for one player session.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rand::Rng;

use crate::download::Download;
use crate::prim::QueueId;
use crate::shuffle;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RepeatMode {
    Off,
    All,
    Single,
}

impl FromStr for RepeatMode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<RepeatMode, &'static str> {
        match s {
            "off" => Ok(RepeatMode::Off),
            "all" => Ok(RepeatMode::All),
            "single" => Ok(RepeatMode::Single),
            _ => Err("Expected repeat mode 'off', 'all', or 'single'."),
        }
    }
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            RepeatMode::Off => "off",
            RepeatMode::All => "all",
            RepeatMode::Single => "single",
        };
        write!(f, "{}", name)
    }
}

/// One entry in the queue.
///
/// The same track can be queued multiple times; the queue id tells the
/// entries apart.
#[derive(Clone)]
pub struct QueuedTrack {
    pub queue_id: QueueId,
    pub download: Arc<Download>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddMode {
    Append,
    Replace,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InsertPosition {
    End,
    AfterCurrent,
}

/// What `previous` decided to do.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PreviousAction {
    /// Keep the index, restart the current track from the beginning.
    Restart,
    /// The cursor moved to this index.
    Moved(usize),
}

/// The play queue.
///
/// The cursor is `None` when the queue is empty, or when playback ran past
/// the final track; otherwise it is in bounds. Every structural mutation
/// (add, remove, clear, shuffle) bumps the revision and snapshots the
/// previous contents into a single-level backup that `undo` swaps back in.
/// The backup is one pair mutated in place, deliberately not a history.
pub struct Queue {
    tracks: Vec<QueuedTrack>,
    current: Option<usize>,
    repeat: RepeatMode,
    revision: u64,
    backup_tracks: Vec<QueuedTrack>,
    backup_current: Option<usize>,
    next_queue_id: u64,
}

impl Queue {
    pub fn new(repeat: RepeatMode) -> Queue {
        Queue {
            tracks: Vec::new(),
            current: None,
            repeat: repeat,
            revision: 0,
            backup_tracks: Vec::new(),
            backup_current: None,
            next_queue_id: 0,
        }
    }

    /// Assert that invariants hold, for use in testing, or debugging.
    fn assert_invariants(&self) {
        if let Some(i) = self.current {
            assert!(
                i < self.tracks.len(),
                "Queue cursor {} out of bounds, queue has {} entries.",
                i,
                self.tracks.len(),
            );
        }
    }

    fn fresh_queue_id(&mut self) -> QueueId {
        let id = QueueId(self.next_queue_id);
        self.next_queue_id += 1;
        id
    }

    /// Copy the live contents into the backup pair.
    ///
    /// Called at the start of every mutating operation, so `undo` restores
    /// the queue as it was just before.
    fn checkpoint(&mut self) {
        self.backup_tracks = self.tracks.clone();
        self.backup_current = self.current;
    }

    /// Swap the live queue and the backup taken before the last mutation.
    ///
    /// Single-level: calling `undo` twice restores the pre-undo state.
    pub fn undo(&mut self) {
        std::mem::swap(&mut self.tracks, &mut self.backup_tracks);
        std::mem::swap(&mut self.current, &mut self.backup_current);
        self.revision += 1;

        #[cfg(debug_assertions)]
        self.assert_invariants();
    }

    /// Insert downloads into the queue.
    ///
    /// Replacing drops the existing contents first. When the queue was (or
    /// became) empty, the cursor lands on the first inserted entry, so the
    /// cursor invariant holds as soon as there is anything to point at.
    pub fn add(
        &mut self,
        downloads: Vec<Arc<Download>>,
        mode: AddMode,
        position: InsertPosition,
    ) -> Vec<QueueId> {
        self.checkpoint();

        if let AddMode::Replace = mode {
            self.tracks.clear();
            self.current = None;
        }

        let insert_at = match position {
            InsertPosition::End => self.tracks.len(),
            InsertPosition::AfterCurrent => match self.current {
                Some(i) => (i + 1).min(self.tracks.len()),
                None => self.tracks.len(),
            },
        };

        let mut ids = Vec::with_capacity(downloads.len());
        let mut entries = Vec::with_capacity(downloads.len());
        for download in downloads {
            let queue_id = self.fresh_queue_id();
            ids.push(queue_id);
            entries.push(QueuedTrack { queue_id, download });
        }
        self.tracks.splice(insert_at..insert_at, entries);

        if self.current.is_none() && !self.tracks.is_empty() {
            self.current = Some(0);
        }
        self.revision += 1;

        #[cfg(debug_assertions)]
        self.assert_invariants();

        ids
    }

    /// Remove the entry with the given queue id, if present.
    ///
    /// The cursor stays on the same entry when possible; when the current
    /// entry itself is removed, the cursor stays at the same index, which
    /// is the following track, clamped into bounds.
    pub fn remove(&mut self, queue_id: QueueId) -> Option<Arc<Download>> {
        let idx = match self.tracks.iter().position(|qt| qt.queue_id == queue_id) {
            Some(idx) => idx,
            None => return None,
        };

        self.checkpoint();
        let removed = self.tracks.remove(idx);

        self.current = match self.current {
            Some(c) if idx < c => Some(c - 1),
            Some(c) if idx == c => {
                if self.tracks.is_empty() {
                    None
                } else {
                    Some(c.min(self.tracks.len() - 1))
                }
            }
            other => other,
        };
        self.revision += 1;

        #[cfg(debug_assertions)]
        self.assert_invariants();

        Some(removed.download)
    }

    /// Empty the queue. A no-op when there is nothing to clear.
    pub fn clear(&mut self) -> Vec<QueuedTrack> {
        if self.tracks.is_empty() {
            return Vec::new();
        }
        self.checkpoint();
        let removed = std::mem::replace(&mut self.tracks, Vec::new());
        self.current = None;
        self.revision += 1;
        removed
    }

    /// Move the cursor, clamping into bounds. A no-op on an empty queue.
    pub fn set_index(&mut self, index: usize) -> Option<usize> {
        if self.tracks.is_empty() {
            return None;
        }
        let clamped = index.min(self.tracks.len() - 1);
        self.current = Some(clamped);
        Some(clamped)
    }

    /// Advance the cursor.
    ///
    /// At the final entry, repeat-all wraps to the front; otherwise the
    /// cursor moves past the end (`None`). Repeat-single only affects what
    /// happens when a track finishes by itself, not an explicit skip, so it
    /// behaves like off here.
    pub fn next(&mut self) -> Option<usize> {
        let n = self.tracks.len();
        if n == 0 {
            return None;
        }
        match self.current {
            // Already past the end; there is nothing further to advance to.
            None => None,
            Some(i) if i + 1 < n => {
                self.current = Some(i + 1);
                self.current
            }
            Some(_) => match self.repeat {
                RepeatMode::All => {
                    self.current = Some(0);
                    self.current
                }
                RepeatMode::Off | RepeatMode::Single => {
                    self.current = None;
                    None
                }
            },
        }
    }

    /// Move the cursor back, or decide to restart the current track.
    ///
    /// When more than `restart_threshold_ms` of the current track has
    /// played, or the cursor is already at the front, "previous" means
    /// "from the top" rather than "the one before". That is how every
    /// CD player button behaves and what listeners expect.
    pub fn previous(
        &mut self,
        position_ms: u64,
        restart_threshold_ms: u64,
    ) -> Option<PreviousAction> {
        let n = self.tracks.len();
        if n == 0 {
            return None;
        }
        let i = match self.current {
            Some(i) => i,
            // Past the end; step back onto the final entry.
            None => {
                self.current = Some(n - 1);
                return Some(PreviousAction::Moved(n - 1));
            }
        };
        if position_ms > restart_threshold_ms || i == 0 {
            Some(PreviousAction::Restart)
        } else {
            self.current = Some(i - 1);
            Some(PreviousAction::Moved(i - 1))
        }
    }

    /// Randomly permute the queue, keeping the current entry at the front.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        if self.tracks.len() < 2 {
            return;
        }
        self.checkpoint();
        self.current = shuffle::shuffle_pinning_current(rng, &mut self.tracks, self.current);
        self.revision += 1;

        #[cfg(debug_assertions)]
        self.assert_invariants();
    }

    /// Drop entries more than `keep_behind` positions before the cursor.
    ///
    /// Radio playback appends forever; without trimming, a queue that runs
    /// for days grows without bound. Returns the removed entries so their
    /// files can be cleaned up.
    pub fn trim_before(&mut self, keep_behind: usize) -> Vec<QueuedTrack> {
        let cut = match self.current {
            Some(c) if c > keep_behind => c - keep_behind,
            _ => return Vec::new(),
        };
        self.checkpoint();
        let removed: Vec<QueuedTrack> = self.tracks.drain(..cut).collect();
        self.current = Some(self.current.unwrap() - cut);
        self.revision += 1;

        #[cfg(debug_assertions)]
        self.assert_invariants();

        removed
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn repeat(&self) -> RepeatMode {
        self.repeat
    }

    pub fn set_repeat(&mut self, mode: RepeatMode) {
        self.repeat = mode;
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current(&self) -> Option<&QueuedTrack> {
        match self.current {
            Some(i) => self.tracks.get(i),
            None => None,
        }
    }

    pub fn get(&self, index: usize) -> Option<&QueuedTrack> {
        self.tracks.get(index)
    }

    pub fn entries(&self) -> &[QueuedTrack] {
        &self.tracks[..]
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;
    use std::sync::Arc;

    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use crate::download::Download;
    use crate::download::test::make_track;
    use crate::prim::TrackId;
    use super::{AddMode, InsertPosition, PreviousAction, Queue, RepeatMode};

    fn make_download(id: u64) -> Arc<Download> {
        // The path does not exist; none of these tests touch the disk.
        let dir = Path::new("/nonexistent/cadenza-test-cache");
        Arc::new(Download::new(make_track(id, 1000), dir, false))
    }

    fn make_queue(n: u64, repeat: RepeatMode) -> Queue {
        let mut queue = Queue::new(repeat);
        let downloads = (0..n).map(make_download).collect();
        queue.add(downloads, AddMode::Replace, InsertPosition::End);
        queue
    }

    fn track_ids(queue: &Queue) -> Vec<TrackId> {
        queue.entries().iter().map(|qt| qt.download.track().id).collect()
    }

    #[test]
    fn add_replace_into_empty_queue_sets_cursor_to_front() {
        let queue = make_queue(3, RepeatMode::Off);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.current_index(), Some(0));
    }

    #[test]
    fn add_after_current_inserts_behind_the_cursor() {
        let mut queue = make_queue(3, RepeatMode::Off);
        queue.set_index(1);
        queue.add(
            vec![make_download(10)],
            AddMode::Append,
            InsertPosition::AfterCurrent,
        );
        let ids: Vec<u64> = track_ids(&queue).iter().map(|id| id.0).collect();
        assert_eq!(ids, vec![0, 1, 10, 2]);
        assert_eq!(queue.current_index(), Some(1));
    }

    #[test]
    fn next_with_repeat_all_wraps_around() {
        let mut queue = make_queue(3, RepeatMode::All);
        assert_eq!(queue.current_index(), Some(0));
        assert_eq!(queue.next(), Some(1));
        assert_eq!(queue.next(), Some(2));
        assert_eq!(queue.next(), Some(0));
    }

    #[test]
    fn next_past_the_end_leaves_the_cursor_unset() {
        let mut queue = make_queue(3, RepeatMode::Off);
        queue.set_index(2);
        assert_eq!(queue.next(), None);
        assert_eq!(queue.current_index(), None);
        // Advancing further is a no-op.
        assert_eq!(queue.next(), None);
    }

    #[test]
    fn previous_restarts_after_the_threshold() {
        let mut queue = make_queue(3, RepeatMode::Off);
        queue.set_index(1);
        assert_eq!(queue.previous(6_000, 5_000), Some(PreviousAction::Restart));
        assert_eq!(queue.current_index(), Some(1));
    }

    #[test]
    fn previous_moves_back_before_the_threshold() {
        let mut queue = make_queue(3, RepeatMode::Off);
        queue.set_index(1);
        assert_eq!(queue.previous(2_000, 5_000), Some(PreviousAction::Moved(0)));
        assert_eq!(queue.current_index(), Some(0));
    }

    #[test]
    fn previous_at_the_front_restarts_regardless_of_position() {
        let mut queue = make_queue(3, RepeatMode::Off);
        assert_eq!(queue.previous(1_000, 5_000), Some(PreviousAction::Restart));
        assert_eq!(queue.current_index(), Some(0));
    }

    #[test]
    fn set_index_clamps_into_bounds() {
        let mut queue = make_queue(3, RepeatMode::Off);
        assert_eq!(queue.set_index(17), Some(2));
        assert_eq!(queue.current_index(), Some(2));

        let mut empty = Queue::new(RepeatMode::Off);
        assert_eq!(empty.set_index(0), None);
        assert_eq!(empty.current_index(), None);
    }

    #[test]
    fn revision_increases_on_mutations_only() {
        let mut queue = make_queue(3, RepeatMode::Off);
        let r0 = queue.revision();

        // Read-only operations and cursor moves leave the revision alone.
        queue.set_index(2);
        let _ = queue.current();
        let _ = queue.next();
        assert_eq!(queue.revision(), r0);

        let queue_id = queue.entries()[0].queue_id;
        queue.remove(queue_id);
        assert!(queue.revision() > r0);

        let r1 = queue.revision();
        queue.clear();
        assert!(queue.revision() > r1);
    }

    #[test]
    fn remove_before_cursor_shifts_it_left() {
        let mut queue = make_queue(3, RepeatMode::Off);
        queue.set_index(2);
        let queue_id = queue.entries()[0].queue_id;
        queue.remove(queue_id);
        assert_eq!(queue.current_index(), Some(1));
        assert_eq!(track_ids(&queue), vec![TrackId(1), TrackId(2)]);
    }

    #[test]
    fn remove_current_keeps_cursor_in_bounds() {
        let mut queue = make_queue(3, RepeatMode::Off);
        queue.set_index(2);
        let queue_id = queue.entries()[2].queue_id;
        queue.remove(queue_id);
        assert_eq!(queue.current_index(), Some(1));

        let mut single = make_queue(1, RepeatMode::Off);
        let queue_id = single.entries()[0].queue_id;
        single.remove(queue_id);
        assert_eq!(single.current_index(), None);
        assert!(single.is_empty());
    }

    #[test]
    fn remove_of_unknown_id_is_a_no_op() {
        let mut queue = make_queue(3, RepeatMode::Off);
        let r0 = queue.revision();
        assert!(queue.remove(crate::prim::QueueId(999)).is_none());
        assert_eq!(queue.revision(), r0);
    }

    #[test]
    fn undo_swaps_live_and_backup_both_ways() {
        let mut queue = make_queue(3, RepeatMode::Off);
        let before = track_ids(&queue);

        queue.clear();
        assert!(queue.is_empty());

        queue.undo();
        assert_eq!(track_ids(&queue), before);
        assert_eq!(queue.current_index(), Some(0));

        // Undoing the undo restores the cleared state.
        queue.undo();
        assert!(queue.is_empty());
    }

    #[test]
    fn shuffle_pins_the_current_entry_to_the_front() {
        let mut queue = make_queue(8, RepeatMode::Off);
        queue.set_index(5);
        let current_track = queue.current().unwrap().download.track().id;
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        queue.shuffle(&mut rng);
        assert_eq!(queue.current_index(), Some(0));
        assert_eq!(queue.entries()[0].download.track().id, current_track);
        assert_eq!(queue.len(), 8);
    }

    #[test]
    fn trim_before_drops_played_entries_and_shifts_cursor() {
        let mut queue = make_queue(6, RepeatMode::Off);
        queue.set_index(4);
        let removed = queue.trim_before(1);
        assert_eq!(removed.len(), 3);
        assert_eq!(queue.current_index(), Some(1));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.current().unwrap().download.track().id, TrackId(4));
    }
}
