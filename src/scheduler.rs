// Cadenza -- Media streaming daemon with play-queue and download orchestration
// Copyright 2024 Ruud van Asseldonk
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// A copy of the License has been included in the root of the repository.

//! Deciding which download should be running.
//!
//! The scheduler is a reconciliation loop, not an event handler: every
//! tick it looks at the queue as it is now and makes the download state
//! match. The track being played always wins; after that comes a bounded
//! amount of prefetch, one transfer at a time. Ticks run on a small worker
//! pool, at a fixed cadence, plus immediately whenever the queue changes
//! or a transfer ends (both send a wakeup). Nothing is retried faster than
//! the next tick, which is what keeps a flaky network from turning into a
//! busy loop.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};

use crate::download::Download;
use crate::player;
use crate::player::{PlayerState, Shared};
use crate::queue::{AddMode, InsertPosition};

/// Number of worker threads that run scheduler ticks.
///
/// Two is plenty: ticks are short, and the point of the second worker is
/// only that a wakeup does not have to wait for a tick that is blocked on
/// the player lock.
pub const N_WORKERS: usize = 2;

/// Fixed delay between unsolicited reconciliation passes.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// With radio on, keep at least this many tracks queued past the cursor.
pub const RADIO_MIN_AHEAD: usize = 10;

/// With radio on, keep at most this many played tracks before the cursor.
pub const RADIO_KEEP_BEHIND: usize = 5;

/// Messages that interrupt the scheduler's sleep.
pub enum Wake {
    /// Run a reconciliation pass now.
    Reconcile,
    /// Exit the worker loop.
    Shutdown,
}

/// Main for a scheduler worker thread.
pub fn main(shared: Arc<Shared>, wakeups: Receiver<Wake>) {
    loop {
        match wakeups.recv_timeout(TICK_INTERVAL) {
            Ok(Wake::Shutdown) => break,
            Ok(Wake::Reconcile) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        tick(&shared);
    }
}

/// One reconciliation pass, plus the periodic queue snapshot.
pub fn tick(shared: &Arc<Shared>) {
    let to_save = {
        let mut guard = shared.state.lock().unwrap();
        let state = &mut *guard;
        reconcile(shared, state);
        player::take_snapshot_if_dirty(state)
    };
    // The snapshot write happens outside the lock; a slow disk should not
    // stall play/pause.
    if let Some(snapshot) = to_save {
        player::persist(shared, &snapshot);
    }
}

fn reconcile(shared: &Arc<Shared>, state: &mut PlayerState) {
    // Radio replenishment is queue bookkeeping, not IO; it runs even when
    // the network or the storage is gone, so the queue is ready the moment
    // we are back.
    replenish_radio(shared, state);

    let connectivity = shared.connectivity.get();
    if !connectivity.network_up || !connectivity.storage_ok {
        return;
    }

    reconcile_downloads(shared, state);
    run_cleanup(state);
}

fn reconcile_downloads(shared: &Arc<Shared>, state: &mut PlayerState) {
    // Drop the handle to a transfer that ended. Whether it succeeded is
    // recorded on the download itself; selection below deals with it.
    let ended = state
        .downloading
        .as_ref()
        .map_or(false, |d| !d.is_downloading());
    if ended {
        state.downloading = None;
    }

    // The playing track pre-empts everything else.
    let current = state.queue.current().map(|qt| qt.download.clone());
    if let Some(current) = current {
        if !current.is_work_done() && !current.is_permanently_failed() {
            let already = state
                .downloading
                .as_ref()
                .map_or(false, |d| Arc::ptr_eq(d, &current));
            if !already {
                if let Some(other) = state.downloading.take() {
                    println!(
                        "Pre-empting prefetch of {} for the playing track.",
                        other.track(),
                    );
                    other.cancel();
                }
                start_download(shared, state, current);
            }
            return;
        }
    }

    // One transfer at a time; if one is still running, let it run.
    if state.downloading.is_some() {
        return;
    }

    let n = state.queue.len();
    if n == 0 {
        return;
    }

    // Scan the queue in circular order from the cursor and pick the first
    // entry that still needs bytes, as long as we have not prefetched past
    // the budget. Entries marked for saving bypass the budget: the user
    // asked to have those on disk, period.
    let scan_start = state.queue.current_index().unwrap_or(0);
    let budget = shared.config.preload_count as usize;
    let mut n_preloaded = 0;
    let mut selected = None;
    for k in 0..n {
        let i = (scan_start + k) % n;
        let entry = match state.queue.get(i) {
            Some(entry) => entry,
            None => continue,
        };
        let download = &entry.download;
        if download.is_work_done() {
            if k > 0 {
                n_preloaded += 1;
            }
            continue;
        }
        if download.is_permanently_failed() {
            continue;
        }
        if download.save() || n_preloaded < budget {
            selected = Some(download.clone());
            break;
        }
        // Over the budget and not marked for saving. Keep scanning, a
        // saved entry further along may still need its bytes.
    }

    if let Some(download) = selected {
        start_download(shared, state, download);
    }
}

fn start_download(shared: &Arc<Shared>, state: &mut PlayerState, download: Arc<Download>) {
    println!("Starting download of {}.", download.track());
    Download::start(
        &download,
        shared.catalog.clone(),
        shared.config.download_rate_limit_kbps,
        shared.wake_sender.clone(),
    );
    player::track_cleanup_candidate(state, download.clone());
    state.downloading = Some(download);
}

/// Delete files of downloads that nothing references any more.
///
/// Everything the scheduler ever started downloading, and everything the
/// player removed from the queue, sits in the candidates list. An entry
/// leaves the list once its files are confirmed gone; until then we keep
/// trying, a tick at a time.
fn run_cleanup(state: &mut PlayerState) {
    let current = state.queue.current().map(|qt| qt.download.clone());
    let mut candidates = std::mem::replace(&mut state.cleanup_candidates, Vec::new());
    candidates.retain(|download| {
        let is_current = current.as_ref().map_or(false, |c| Arc::ptr_eq(c, download));
        let is_active = state
            .downloading
            .as_ref()
            .map_or(false, |a| Arc::ptr_eq(a, download));
        let in_queue = state
            .queue
            .entries()
            .iter()
            .any(|qt| Arc::ptr_eq(&qt.download, download));
        if is_current || is_active || in_queue {
            return true;
        }
        !download.cleanup()
    });
    state.cleanup_candidates = candidates;
}

/// Keep the queue populated when radio playback is on.
fn replenish_radio(shared: &Arc<Shared>, state: &mut PlayerState) {
    let batch = match &state.radio {
        None => return,
        Some(radio) => {
            let ahead = match state.queue.current_index() {
                Some(i) => state.queue.len() - 1 - i,
                None => 0,
            };
            if ahead >= RADIO_MIN_AHEAD {
                Vec::new()
            } else {
                radio.next_batch(&*shared.catalog, RADIO_MIN_AHEAD - ahead)
            }
        }
    };

    if !batch.is_empty() {
        println!("Radio: appending {} tracks to the queue.", batch.len());
        let downloads = batch
            .into_iter()
            .map(|t| Arc::new(Download::new(t, &shared.config.download_path, false)))
            .collect();
        state.queue.add(downloads, AddMode::Append, InsertPosition::End);
        player::sync_jukebox(state);
    }

    let removed = state.queue.trim_before(RADIO_KEEP_BEHIND);
    for entry in removed {
        player::track_cleanup_candidate(state, entry.download);
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use crossbeam::channel;

    use crate::config::Config;
    use crate::download::Download;
    use crate::download::test::{MemoryCatalog, make_track};
    use crate::jukebox::test::RecordingDevice;
    use crate::mvar::MVar;
    use crate::playback::ClockEngine;
    use crate::player::{Connectivity, PlayerState, Shared};
    use crate::prim::Track;
    use crate::queue::{AddMode, InsertPosition, RepeatMode};
    use crate::shuffle::{RadioBuffer, RadioCriteria};
    use crate::snapshot::FileSnapshotStore;
    use super::{RADIO_MIN_AHEAD, tick};

    fn make_config(dir: &Path, preload_count: u32, rate_limit: Option<u32>) -> Config {
        Config {
            listen: String::from("localhost:0"),
            library_path: dir.join("library"),
            download_path: dir.to_path_buf(),
            state_path: dir.join("queue.state"),
            preload_count: preload_count,
            download_rate_limit_kbps: rate_limit,
            repeat: RepeatMode::Off,
            previous_restart_ms: 5_000,
            end_grace_ms: 10_000,
        }
    }

    fn make_shared(catalog: MemoryCatalog, config: Config) -> Arc<Shared> {
        let (wake_sender, _wake_receiver) = channel::unbounded();
        let (event_sender, _event_receiver) = channel::unbounded();
        let (engine_sender, _engine_receiver) = channel::unbounded();
        let engine = Box::new(ClockEngine::new(engine_sender));
        let device = Box::new(RecordingDevice(Arc::new(Mutex::new(Vec::new()))));
        let state = PlayerState::new(&config, engine, device);
        let store = Arc::new(FileSnapshotStore::new(config.state_path.clone()));
        Arc::new(Shared {
            state: Mutex::new(state),
            catalog: Arc::new(catalog),
            store: store,
            connectivity: MVar::new(Connectivity { network_up: true, storage_ok: true }),
            wake_sender: wake_sender,
            events: event_sender,
            config: config,
        })
    }

    fn enqueue(shared: &Arc<Shared>, tracks: &[Track], save: bool) -> Vec<Arc<Download>> {
        let mut state = shared.state.lock().unwrap();
        let downloads: Vec<Arc<Download>> = tracks
            .iter()
            .map(|t| Arc::new(Download::new(t.clone(), &shared.config.download_path, save)))
            .collect();
        state.queue.add(downloads.clone(), AddMode::Append, InsertPosition::End);
        downloads
    }

    fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "Timed out waiting until {}.", what);
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn playing_track_preempts_a_running_prefetch() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MemoryCatalog::new();
        let t0 = make_track(1, 40_000);
        let t1 = make_track(2, 40_000);
        catalog.add(t0.clone(), vec![0_u8; 40_000]);
        catalog.add(t1.clone(), vec![1_u8; 40_000]);

        // 1 kbps, so transfers stay in flight long enough to observe.
        let shared = make_shared(catalog, make_config(dir.path(), 3, Some(1)));
        let downloads = enqueue(&shared, &[t0, t1], false);

        // Put the scheduler in the state where the second entry is being
        // prefetched while the first (incomplete) entry is current.
        {
            let mut state = shared.state.lock().unwrap();
            Download::start(
                &downloads[1],
                shared.catalog.clone(),
                shared.config.download_rate_limit_kbps,
                shared.wake_sender.clone(),
            );
            state.downloading = Some(downloads[1].clone());
        }
        wait_until("the prefetch is running", || downloads[1].is_downloading());

        tick(&shared);

        // Within the same tick, the prefetch was told to stop and the
        // playing track's transfer was started.
        {
            let state = shared.state.lock().unwrap();
            let active = state.downloading.as_ref().unwrap();
            assert!(Arc::ptr_eq(active, &downloads[0]));
        }
        assert!(downloads[0].is_downloading());
        wait_until("the prefetch stops", || !downloads[1].is_downloading());
        assert!(!downloads[1].is_work_done());
    }

    #[test]
    fn prefetch_stops_at_the_preload_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MemoryCatalog::new();
        let tracks: Vec<Track> = (1..=3).map(|i| make_track(i, 1_000)).collect();
        for t in &tracks {
            catalog.add(t.clone(), vec![0_u8; 1_000]);
        }
        // Entries 0 (current) and 1 already have their complete files.
        for t in &tracks[..2] {
            let path = dir.path().join(format!("{}.complete", t.id));
            std::fs::write(&path, vec![0_u8; 1_000]).unwrap();
        }

        let shared = make_shared(catalog, make_config(dir.path(), 1, None));
        let downloads = enqueue(&shared, &tracks, false);

        tick(&shared);

        // One track is already buffered ahead, which exhausts a budget of
        // one; the third entry is not fetched.
        assert!(shared.state.lock().unwrap().downloading.is_none());
        assert!(!downloads[2].is_downloading());
        assert!(!downloads[2].is_work_done());
    }

    #[test]
    fn prefetch_proceeds_within_the_preload_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MemoryCatalog::new();
        let tracks: Vec<Track> = (1..=3).map(|i| make_track(i, 1_000)).collect();
        for t in &tracks {
            catalog.add(t.clone(), vec![0_u8; 1_000]);
        }
        for t in &tracks[..2] {
            let path = dir.path().join(format!("{}.complete", t.id));
            std::fs::write(&path, vec![0_u8; 1_000]).unwrap();
        }

        let shared = make_shared(catalog, make_config(dir.path(), 2, None));
        let downloads = enqueue(&shared, &tracks, false);

        tick(&shared);
        wait_until("the third entry downloads", || downloads[2].is_work_done());
    }

    #[test]
    fn saved_entries_bypass_the_preload_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MemoryCatalog::new();
        let t0 = make_track(1, 1_000);
        let t1 = make_track(2, 1_000);
        catalog.add(t0.clone(), vec![0_u8; 1_000]);
        catalog.add(t1.clone(), vec![0_u8; 1_000]);
        let complete0 = dir.path().join(format!("{}.complete", t0.id));
        std::fs::write(&complete0, vec![0_u8; 1_000]).unwrap();

        // A budget of zero would normally prevent all prefetch.
        let shared = make_shared(catalog, make_config(dir.path(), 0, None));
        enqueue(&shared, &[t0], false);
        let saved = enqueue(&shared, &[t1], true);

        tick(&shared);
        wait_until("the saved entry downloads", || saved[0].is_work_done());
    }

    #[test]
    fn cleanup_deletes_files_of_evicted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MemoryCatalog::new();
        let t0 = make_track(1, 1_000);
        let t1 = make_track(2, 1_000);
        catalog.add(t0.clone(), vec![0_u8; 1_000]);
        catalog.add(t1.clone(), vec![0_u8; 1_000]);
        for t in [&t0, &t1] {
            let path = dir.path().join(format!("{}.complete", t.id));
            std::fs::write(&path, vec![0_u8; 1_000]).unwrap();
        }

        let shared = make_shared(catalog, make_config(dir.path(), 3, None));
        let downloads = enqueue(&shared, &[t0.clone(), t1], false);

        // Remove the second entry from the queue, as the player would.
        {
            let mut state = shared.state.lock().unwrap();
            let queue_id = state.queue.entries()[1].queue_id;
            state.queue.remove(queue_id);
            crate::player::track_cleanup_candidate(&mut state, downloads[1].clone());
        }

        tick(&shared);

        assert!(!downloads[1].complete_path().exists());
        // The remaining entry is untouched and no longer tracked work is
        // pending.
        assert!(downloads[0].complete_path().exists());
        assert!(shared.state.lock().unwrap().cleanup_candidates.is_empty());
    }

    #[test]
    fn radio_replenishes_the_queue_even_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MemoryCatalog::new();
        for i in 1..=32 {
            let t = make_track(i, 1_000);
            catalog.add(t, vec![0_u8; 1_000]);
        }

        let shared = make_shared(catalog, make_config(dir.path(), 3, None));
        shared.connectivity.set(Connectivity { network_up: false, storage_ok: true });
        {
            let mut state = shared.state.lock().unwrap();
            state.radio = Some(RadioBuffer::new(RadioCriteria::default()));
        }

        tick(&shared);

        let state = shared.state.lock().unwrap();
        assert_eq!(state.queue.len(), RADIO_MIN_AHEAD);
        assert_eq!(state.queue.current_index(), Some(0));
        // But no downloads were attempted while offline.
        assert!(state.downloading.is_none());
    }

    #[test]
    fn failed_downloads_are_retried_then_abandoned() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MemoryCatalog::new();
        // The catalog claims more bytes than the stream delivers, so every
        // transfer attempt fails.
        let track = make_track(1, 2_000);
        catalog.add(track.clone(), vec![0_u8; 500]);

        let shared = make_shared(catalog, make_config(dir.path(), 3, None));
        let downloads = enqueue(&shared, &[track], false);

        for _ in 0..crate::download::MAX_DOWNLOAD_ATTEMPTS {
            tick(&shared);
            wait_until("the transfer attempt ends", || !downloads[0].is_downloading());
        }

        assert!(downloads[0].is_permanently_failed());

        // Once permanently failed, the scheduler leaves it alone.
        tick(&shared);
        assert!(!downloads[0].is_downloading());
        let state = shared.state.lock().unwrap();
        assert!(state.downloading.is_none());
    }
}
