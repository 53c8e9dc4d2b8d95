// Cadenza -- Media streaming daemon with play-queue and download orchestration
// Copyright 2024 Ruud van Asseldonk
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// A copy of the License has been included in the root of the repository.

//! The player: one queue, one render engine, one lock.
//!
//! Everything that touches the queue or the playback state machine goes
//! through a single mutex. That is deliberate: the correctness of advance,
//! removal, and the scheduler's reconciliation depends on reading the
//! cursor and the playback state together, and at human interaction rates
//! (play, pause, skip) a coarse lock costs nothing. The background threads
//! (scheduler workers, download transfers, buffer waits, the render
//! engine) take the lock briefly at their checkpoints and do their actual
//! work outside of it.
//!
//! Nothing in here returns an error to the caller. Failures are absorbed
//! into state: a failed download raises a flag the scheduler acts on, a
//! render engine error resets the machine to idle. Callers poll; they
//! observe what happened, they do not catch it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::thread::JoinHandle;

use crossbeam::channel;
use crossbeam::channel::{Receiver, Sender};

use crate::MediaCatalog;
use crate::buffer::{BufferOutcome, BufferTask};
use crate::config::Config;
use crate::download::Download;
use crate::history;
use crate::history::{NotificationSink, PlaybackEvent, ScrobbleSink};
use crate::jukebox::{Jukebox, JukeboxDevice};
use crate::mvar::MVar;
use crate::playback::{
    CompletionAction, PlaybackState, RenderEngine, RenderEvent, completion_action,
};
use crate::prim::{Millibel, QueueId, Track};
use crate::queue::{AddMode, InsertPosition, Queue, RepeatMode};
use crate::scheduler;
use crate::scheduler::Wake;
use crate::shuffle;
use crate::shuffle::{Prng, RadioBuffer, RadioCriteria};
use crate::signals::MediaKey;
use crate::snapshot::{QueueSnapshot, SnapshotEntry, SnapshotStore, sweep_orphans};

/// Whether the world outside the player is reachable.
///
/// The signal bridge writes these flags, the scheduler reads them. While
/// either is false, no downloads are attempted; already-complete local
/// files keep playing.
#[derive(Copy, Clone, Debug)]
pub struct Connectivity {
    pub network_up: bool,
    pub storage_ok: bool,
}

/// Everything behind the player lock.
pub struct PlayerState {
    pub queue: Queue,
    pub playback: PlaybackState,
    pub engine: Box<dyn RenderEngine>,
    pub jukebox: Jukebox,

    /// The download the scheduler most recently started, if any.
    ///
    /// At most one transfer runs at a time; this is that one. The download
    /// itself knows whether its thread is still alive.
    pub downloading: Option<Arc<Download>>,

    /// Downloads we may still have to delete files for.
    ///
    /// Every download the scheduler ever started, plus everything removed
    /// from the queue, stays tracked here until its files are gone (or it
    /// is referenced by the queue again). See the cleanup pass in the
    /// scheduler.
    pub cleanup_candidates: Vec<Arc<Download>>,

    /// The wait-for-bytes task for the pending play request, if any.
    pub buffer_task: Option<BufferTask>,

    /// Criteria-driven track source, when radio playback is on.
    pub radio: Option<RadioBuffer>,

    pub rng: Prng,

    /// Bumped on every new play/stop/reset decision.
    ///
    /// The buffer task completes on its own thread and calls back into the
    /// player; by then the world may have moved on. The callback carries
    /// the epoch it was spawned under and is ignored if it is stale.
    pub play_epoch: u64,

    /// Position to start from on the next play, from a restored snapshot
    /// or a seek while nothing was loaded.
    pub pending_seek_ms: Option<u64>,

    /// Whether the engine is rendering the complete file, as opposed to a
    /// still-growing partial file. Decides what end-of-stream means.
    pub rendering_complete_file: bool,

    /// Whether the last pause came from losing the audio output to
    /// another application, in which case getting it back resumes.
    pub paused_by_focus_loss: bool,

    /// (revision, position_ms) of the last persisted snapshot, to skip
    /// writes when nothing changed.
    pub last_persisted: Option<(u64, u64)>,
}

impl PlayerState {
    pub(crate) fn new(
        config: &Config,
        engine: Box<dyn RenderEngine>,
        jukebox_device: Box<dyn JukeboxDevice>,
    ) -> PlayerState {
        PlayerState {
            queue: Queue::new(config.repeat),
            playback: PlaybackState::Idle,
            engine: engine,
            jukebox: Jukebox::new(jukebox_device),
            downloading: None,
            cleanup_candidates: Vec::new(),
            buffer_task: None,
            radio: None,
            rng: shuffle::new_prng(),
            play_epoch: 0,
            pending_seek_ms: None,
            rendering_complete_file: false,
            paused_by_focus_loss: false,
            last_persisted: None,
        }
    }
}

/// State shared between the player facade and its worker threads.
pub struct Shared {
    pub state: Mutex<PlayerState>,
    pub catalog: Arc<dyn MediaCatalog>,
    pub store: Arc<dyn SnapshotStore>,
    pub connectivity: MVar<Connectivity>,
    pub wake_sender: Sender<Wake>,
    pub events: Sender<PlaybackEvent>,
    pub config: Config,
}

/// A queue entry with its download progress, for polling callers.
#[derive(Clone)]
pub struct QueueEntryInfo {
    pub queue_id: QueueId,
    pub track: Track,
    pub downloaded_bytes: u64,
    pub is_complete: bool,
    pub is_failed: bool,
    pub save: bool,
}

/// Everything a status poll needs, read in one go under the lock.
#[derive(Clone)]
pub struct PlayerStatus {
    pub state: PlaybackState,
    pub position_ms: u64,
    pub duration_ms: Option<u64>,
    pub current_index: Option<usize>,
    pub current: Option<QueueEntryInfo>,
    pub revision: u64,
    pub repeat: RepeatMode,
    pub jukebox_enabled: bool,
    pub jukebox_volume: Millibel,
}

pub struct Player {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Player {
    pub fn new(
        config: Config,
        catalog: Arc<dyn MediaCatalog>,
        engine: Box<dyn RenderEngine>,
        engine_events: Receiver<RenderEvent>,
        jukebox_device: Box<dyn JukeboxDevice>,
        store: Arc<dyn SnapshotStore>,
        notifications: Box<dyn NotificationSink>,
        scrobbler: Box<dyn ScrobbleSink>,
    ) -> Player {
        let (wake_sender, wake_receiver) = channel::unbounded();
        let (event_sender, event_receiver) = channel::unbounded();

        let state = PlayerState::new(&config, engine, jukebox_device);
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            catalog: catalog,
            store: store,
            connectivity: MVar::new(Connectivity { network_up: true, storage_ok: true }),
            wake_sender: wake_sender,
            events: event_sender,
            config: config,
        });

        restore(&shared);

        let mut workers = Vec::with_capacity(scheduler::N_WORKERS);
        for i in 0..scheduler::N_WORKERS {
            let shared_i = shared.clone();
            let receiver_i = wake_receiver.clone();
            let builder = thread::Builder::new().name(format!("scheduler_{}", i));
            let join_handle = builder
                .spawn(move || scheduler::main(shared_i, receiver_i))
                .expect("Failed to spawn scheduler worker thread.");
            workers.push(join_handle);
        }

        // These two run until their channels close, which happens when the
        // engine and the shared state go away; we don't join them.
        let shared_for_events = shared.clone();
        let builder = thread::Builder::new().name("engine_events".into());
        builder
            .spawn(move || engine_events_main(shared_for_events, engine_events))
            .expect("Failed to spawn engine event thread.");

        let builder = thread::Builder::new().name("history".into());
        builder
            .spawn(move || history::main(event_receiver, notifications, scrobbler))
            .expect("Failed to spawn history thread.");

        Player { shared, workers }
    }

    fn lock(&self) -> MutexGuard<PlayerState> {
        self.shared.state.lock().unwrap()
    }

    fn wake(&self) {
        let _ = self.shared.wake_sender.send(Wake::Reconcile);
    }

    /// Add tracks to the queue as downloads.
    ///
    /// With `autoplay` the tracks replace the queue and playback starts at
    /// the front; with `play_next` they go in right after the current
    /// entry, otherwise at the end.
    pub fn download(
        &self,
        tracks: Vec<Track>,
        save: bool,
        autoplay: bool,
        play_next: bool,
    ) -> Vec<QueueId> {
        let mut state = self.lock();
        let downloads = tracks
            .into_iter()
            .map(|t| Arc::new(Download::new(t, &self.shared.config.download_path, save)))
            .collect();
        let mode = match autoplay {
            true => AddMode::Replace,
            false => AddMode::Append,
        };
        let position = match play_next {
            true => InsertPosition::AfterCurrent,
            false => InsertPosition::End,
        };
        let ids = state.queue.add(downloads, mode, position);
        sync_jukebox(&mut state);
        if autoplay {
            state.pending_seek_ms = None;
            start_playback(&self.shared, &mut state, 0);
        }
        drop(state);
        self.wake();
        ids
    }

    pub fn play(&self) {
        let mut state = self.lock();
        state.paused_by_focus_loss = false;
        match state.playback {
            PlaybackState::Started => {}
            // A start is already in flight; let it finish.
            PlaybackState::Downloading
            | PlaybackState::Preparing
            | PlaybackState::Prepared => {}
            PlaybackState::Paused => {
                if state.jukebox.enabled() {
                    let index = match state.queue.current_index() {
                        Some(i) => i,
                        None => return,
                    };
                    let from_ms = state.pending_seek_ms.take().unwrap_or(0);
                    state.jukebox.start(index, from_ms);
                    set_state(&self.shared, &mut state, PlaybackState::Started);
                } else {
                    match state.engine.play() {
                        Ok(()) => set_state(&self.shared, &mut state, PlaybackState::Started),
                        Err(err) => handle_render_error(
                            &self.shared,
                            &mut state,
                            format!("Failed to resume: {}", err),
                        ),
                    }
                }
            }
            PlaybackState::Idle
            | PlaybackState::Stopped
            | PlaybackState::Completed => {
                if state.queue.current().is_none() {
                    state.queue.set_index(0);
                }
                if state.queue.current().is_none() {
                    return;
                }
                let from_ms = state.pending_seek_ms.take().unwrap_or(0);
                start_playback(&self.shared, &mut state, from_ms);
            }
        }
    }

    /// Jump to the given queue index (clamped) and play it from the top.
    pub fn play_at(&self, index: usize) {
        let mut state = self.lock();
        if state.queue.set_index(index).is_none() {
            return;
        }
        state.pending_seek_ms = None;
        start_playback(&self.shared, &mut state, 0);
    }

    pub fn pause(&self) {
        let to_save = {
            let mut state = self.lock();
            if state.playback != PlaybackState::Started {
                None
            } else {
                state.paused_by_focus_loss = false;
                if state.jukebox.enabled() {
                    let position_ms = state.jukebox.position_ms();
                    state.pending_seek_ms = Some(position_ms);
                    state.jukebox.stop();
                } else if let Err(err) = state.engine.pause() {
                    handle_render_error(
                        &self.shared,
                        &mut state,
                        format!("Failed to pause: {}", err),
                    );
                    return;
                }
                set_state(&self.shared, &mut state, PlaybackState::Paused);
                take_snapshot_if_dirty(&mut state)
            }
        };
        if let Some(snapshot) = to_save {
            persist(&self.shared, &snapshot);
        }
    }

    pub fn toggle_play_pause(&self) {
        let playback = self.lock().playback;
        match playback {
            PlaybackState::Started => self.pause(),
            _ => self.play(),
        }
    }

    pub fn next(&self) {
        let mut state = self.lock();
        if state.queue.is_empty() {
            return;
        }
        match state.queue.next() {
            Some(_) => start_playback(&self.shared, &mut state, 0),
            None => stop_at_queue_end(&self.shared, &mut state),
        }
    }

    pub fn previous(&self) {
        let mut state = self.lock();
        let position_ms = position_ms_of(&state);
        let threshold = self.shared.config.previous_restart_ms;
        // Both outcomes start a track from the top; `previous` already
        // moved the cursor if it decided to move.
        if state.queue.previous(position_ms, threshold).is_some() {
            start_playback(&self.shared, &mut state, 0);
        }
    }

    pub fn seek_to(&self, position_ms: u64) {
        let mut state = self.lock();
        if state.jukebox.enabled() {
            match (state.playback, state.queue.current_index()) {
                (PlaybackState::Started, Some(index)) => state.jukebox.start(index, position_ms),
                _ => state.pending_seek_ms = Some(position_ms),
            }
            return;
        }
        match state.playback {
            PlaybackState::Started
            | PlaybackState::Paused
            | PlaybackState::Prepared => {
                if let Err(err) = state.engine.seek(position_ms) {
                    eprintln!("Seek to {} ms failed: {}", position_ms, err);
                }
            }
            // Still waiting for bytes; re-target the wait at the new
            // offset.
            PlaybackState::Downloading | PlaybackState::Preparing => {
                start_playback(&self.shared, &mut state, position_ms);
            }
            PlaybackState::Idle
            | PlaybackState::Stopped
            | PlaybackState::Completed => {
                state.pending_seek_ms = Some(position_ms);
            }
        }
    }

    /// Stop playback and return to idle. The queue is untouched.
    pub fn reset(&self) {
        let mut state = self.lock();
        reset_playback(&self.shared, &mut state);
    }

    /// Cancel everything and empty the queue.
    pub fn clear(&self) {
        let to_save = {
            let mut state = self.lock();
            reset_playback(&self.shared, &mut state);
            if let Some(download) = state.downloading.take() {
                download.cancel();
            }
            let removed = state.queue.clear();
            for entry in removed {
                track_cleanup_candidate(&mut state, entry.download);
            }
            sync_jukebox(&mut state);
            take_snapshot_if_dirty(&mut state)
        };
        if let Some(snapshot) = to_save {
            persist(&self.shared, &snapshot);
        }
        self.wake();
    }

    /// Drop incompletely downloaded entries from the queue.
    ///
    /// The current entry is kept even when incomplete; clearing should not
    /// interrupt what is playing right now.
    pub fn clear_incomplete(&self) {
        let mut state = self.lock();
        let to_remove: Vec<QueueId> = state
            .queue
            .entries()
            .iter()
            .filter(|qt| !qt.download.is_work_done())
            .map(|qt| qt.queue_id)
            .collect();
        let current_id = state.queue.current().map(|qt| qt.queue_id);
        for queue_id in to_remove {
            if Some(queue_id) == current_id {
                continue;
            }
            if let Some(download) = state.queue.remove(queue_id) {
                let is_active = state
                    .downloading
                    .as_ref()
                    .map_or(false, |a| Arc::ptr_eq(a, &download));
                if is_active {
                    if let Some(active) = state.downloading.take() {
                        active.cancel();
                    }
                }
                track_cleanup_candidate(&mut state, download);
            }
        }
        sync_jukebox(&mut state);
        drop(state);
        self.wake();
    }

    /// Remove one entry from the queue.
    pub fn remove(&self, queue_id: QueueId) {
        let mut state = self.lock();
        let is_current = match state.queue.current() {
            Some(qt) => qt.queue_id == queue_id,
            None => false,
        };
        if is_current {
            reset_playback(&self.shared, &mut state);
        }
        if let Some(download) = state.queue.remove(queue_id) {
            let is_active = state
                .downloading
                .as_ref()
                .map_or(false, |a| Arc::ptr_eq(a, &download));
            if is_active {
                if let Some(active) = state.downloading.take() {
                    active.cancel();
                }
            }
            track_cleanup_candidate(&mut state, download);
            sync_jukebox(&mut state);
        }
        drop(state);
        self.wake();
    }

    pub fn shuffle(&self) {
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.queue.shuffle(&mut state.rng);
            sync_jukebox(state);
        }
        self.wake();
    }

    /// Swap the queue with the backup from before the last mutation.
    pub fn undo(&self) {
        let mut state = self.lock();
        state.queue.undo();
        sync_jukebox(&mut state);
        drop(state);
        self.wake();
    }

    /// Turn radio playback on with the given criteria, or off with `None`.
    pub fn set_shuffle_play(&self, criteria: Option<RadioCriteria>) {
        let mut state = self.lock();
        state.radio = criteria.map(RadioBuffer::new);
        drop(state);
        self.wake();
    }

    pub fn set_repeat(&self, mode: RepeatMode) {
        self.lock().queue.set_repeat(mode);
    }

    pub fn set_jukebox_enabled(&self, enabled: bool) {
        let mut state = self.lock();
        if enabled == state.jukebox.enabled() {
            return;
        }
        // Either direction goes through a full stop; the new backend takes
        // over from idle.
        state.play_epoch += 1;
        if let Some(task) = state.buffer_task.take() {
            task.cancel();
        }
        state.engine.stop();
        if enabled {
            let tracks = queue_tracks(&state);
            state.jukebox.enable(&tracks);
        } else {
            state.jukebox.disable();
        }
        set_state(&self.shared, &mut state, PlaybackState::Idle);
        emit(&self.shared, PlaybackEvent::NowPlayingCleared);
    }

    pub fn adjust_jukebox_volume(&self, up: bool) -> Millibel {
        self.lock().jukebox.adjust_volume(up)
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.lock().playback
    }

    pub fn position_ms(&self) -> u64 {
        position_ms_of(&self.lock())
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let state = self.lock();
        match state.engine.duration_ms() {
            Some(ms) => Some(ms),
            None => state.queue.current().map(|qt| qt.download.track().duration_ms),
        }
    }

    pub fn current(&self) -> Option<(QueueId, Track)> {
        let state = self.lock();
        state
            .queue
            .current()
            .map(|qt| (qt.queue_id, qt.download.track().clone()))
    }

    pub fn status(&self) -> PlayerStatus {
        let state = self.lock();
        PlayerStatus {
            state: state.playback,
            position_ms: position_ms_of(&state),
            duration_ms: match state.engine.duration_ms() {
                Some(ms) => Some(ms),
                None => state.queue.current().map(|qt| qt.download.track().duration_ms),
            },
            current_index: state.queue.current_index(),
            current: state.queue.current().map(entry_info),
            revision: state.queue.revision(),
            repeat: state.queue.repeat(),
            jukebox_enabled: state.jukebox.enabled(),
            jukebox_volume: state.jukebox.volume(),
        }
    }

    pub fn downloads(&self) -> Vec<QueueEntryInfo> {
        let state = self.lock();
        state.queue.entries().iter().map(entry_info).collect()
    }

    // Entry points for the OS-signal bridge.

    /// The headset was unplugged; blasting the speakers is never intended.
    pub fn on_headset_unplugged(&self) {
        self.pause();
    }

    /// The storage holding the downloads is gone.
    pub fn on_storage_ejected(&self) {
        self.shared.connectivity.update(|c| Connectivity { storage_ok: false, ..c });
        let mut state = self.lock();
        if let Some(download) = state.downloading.take() {
            download.cancel();
        }
        reset_playback(&self.shared, &mut state);
    }

    /// Network connectivity changed.
    pub fn on_network_changed(&self, up: bool) {
        self.shared.connectivity.update(|c| Connectivity { network_up: up, ..c });
        self.wake();
    }

    /// Another application took or returned the audio output.
    ///
    /// Losing the output pauses playback but cancels nothing: the download
    /// keeps going, and getting the output back resumes where we were.
    /// Only a pause we made here is resumed; if the user paused, a focus
    /// change does not override that.
    pub fn on_audio_focus_changed(&self, gained: bool) {
        if !gained {
            let was_started = self.lock().playback == PlaybackState::Started;
            if was_started {
                self.pause();
                self.lock().paused_by_focus_loss = true;
            }
        } else {
            let resume = {
                let mut state = self.lock();
                let resume = state.paused_by_focus_loss
                    && state.playback == PlaybackState::Paused;
                state.paused_by_focus_loss = false;
                resume
            };
            if resume {
                self.play();
            }
        }
    }

    /// A media button was pressed.
    pub fn on_media_key(&self, key: MediaKey) {
        match key {
            MediaKey::PlayPause => self.toggle_play_pause(),
            MediaKey::Play => self.play(),
            MediaKey::Pause => self.pause(),
            MediaKey::Stop => self.reset(),
            MediaKey::Next => self.next(),
            MediaKey::Previous => self.previous(),
        }
    }

    /// Persist the queue, stop the workers, and wait for them to exit.
    pub fn shutdown(self) {
        let snapshot = {
            let mut state = self.lock();
            state.play_epoch += 1;
            if let Some(task) = state.buffer_task.take() {
                task.cancel();
            }
            if let Some(download) = state.downloading.take() {
                download.cancel();
            }
            state.engine.stop();
            snapshot_of(&state)
        };
        persist(&self.shared, &snapshot);

        for _ in &self.workers {
            let _ = self.shared.wake_sender.send(Wake::Shutdown);
        }
        for worker in self.workers {
            worker.join().unwrap();
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

fn entry_info(entry: &crate::queue::QueuedTrack) -> QueueEntryInfo {
    QueueEntryInfo {
        queue_id: entry.queue_id,
        track: entry.download.track().clone(),
        downloaded_bytes: entry.download.downloaded_bytes(),
        is_complete: entry.download.is_work_done(),
        is_failed: entry.download.is_permanently_failed(),
        save: entry.download.save(),
    }
}

pub(crate) fn emit(shared: &Shared, event: PlaybackEvent) {
    // The history thread going away means we are shutting down; then the
    // event no longer matters.
    let _ = shared.events.send(event);
}

fn set_state(shared: &Shared, state: &mut PlayerState, new_state: PlaybackState) {
    if state.playback != new_state {
        state.playback = new_state;
        emit(shared, PlaybackEvent::StateChanged(new_state));
    }
}

pub(crate) fn position_ms_of(state: &PlayerState) -> u64 {
    if state.jukebox.enabled() {
        state.jukebox.position_ms()
    } else {
        state.engine.position_ms()
    }
}

fn queue_tracks(state: &PlayerState) -> Vec<Track> {
    state
        .queue
        .entries()
        .iter()
        .map(|qt| qt.download.track().clone())
        .collect()
}

/// Mirror the queue to the jukebox device, when it is in charge.
pub(crate) fn sync_jukebox(state: &mut PlayerState) {
    if state.jukebox.enabled() {
        let tracks = queue_tracks(state);
        state.jukebox.push_playlist(&tracks);
    }
}

pub(crate) fn track_cleanup_candidate(state: &mut PlayerState, download: Arc<Download>) {
    let already = state
        .cleanup_candidates
        .iter()
        .any(|c| Arc::ptr_eq(c, &download));
    if !already {
        state.cleanup_candidates.push(download);
    }
}

/// Start playing the entry under the cursor, from `from_ms`.
///
/// When the file is not complete yet, this parks the state machine in
/// `Downloading` and spawns a buffer task; the task calls back in once
/// enough bytes are there (or never, if it gets cancelled first).
pub(crate) fn start_playback(shared: &Arc<Shared>, state: &mut PlayerState, from_ms: u64) {
    state.play_epoch += 1;
    if let Some(task) = state.buffer_task.take() {
        task.cancel();
    }

    let entry = match state.queue.current() {
        Some(qt) => qt.clone(),
        None => return stop_at_queue_end(shared, state),
    };

    if state.jukebox.enabled() {
        // The queue has a current entry, so the index is set.
        let index = state.queue.current_index().unwrap();
        state.jukebox.start(index, from_ms);
        set_state(shared, state, PlaybackState::Started);
        emit(
            shared,
            PlaybackEvent::Started(entry.queue_id, entry.download.track().clone()),
        );
        return;
    }

    if entry.download.is_work_done() {
        begin_render(shared, state, &entry, from_ms);
    } else {
        set_state(shared, state, PlaybackState::Downloading);
        let shared_cb = shared.clone();
        let epoch = state.play_epoch;
        let queue_id = entry.queue_id;
        state.buffer_task = Some(BufferTask::spawn(
            entry.download.clone(),
            from_ms,
            Box::new(move |outcome| on_buffer_done(&shared_cb, epoch, queue_id, from_ms, outcome)),
        ));
        // Tell the scheduler now; the current track pre-empts any prefetch.
        let _ = shared.wake_sender.send(Wake::Reconcile);
    }
}

/// Load the entry into the engine and start it.
fn begin_render(
    shared: &Arc<Shared>,
    state: &mut PlayerState,
    entry: &crate::queue::QueuedTrack,
    from_ms: u64,
) {
    set_state(shared, state, PlaybackState::Preparing);

    let path = entry.download.current_file();
    state.rendering_complete_file = path != entry.download.partial_path();

    let track = entry.download.track().clone();
    if let Err(err) = state.engine.load(&track, &path, from_ms) {
        let msg = format!("Failed to load {:?}: {}", path, err);
        return handle_render_error(shared, state, msg);
    }
    set_state(shared, state, PlaybackState::Prepared);

    if let Err(err) = state.engine.play() {
        let msg = format!("Failed to start rendering: {}", err);
        return handle_render_error(shared, state, msg);
    }
    set_state(shared, state, PlaybackState::Started);
    emit(shared, PlaybackEvent::Started(entry.queue_id, track));
}

/// The buffer task finished; continue the play request it belonged to.
fn on_buffer_done(
    shared: &Arc<Shared>,
    epoch: u64,
    queue_id: QueueId,
    from_ms: u64,
    outcome: BufferOutcome,
) {
    let mut state = shared.state.lock().unwrap();
    if state.play_epoch != epoch {
        // Somebody pressed something while we were waiting; this play
        // request is no longer wanted.
        return;
    }
    let entry = match state.queue.current() {
        Some(qt) if qt.queue_id == queue_id => qt.clone(),
        _ => return,
    };
    state.buffer_task = None;
    match outcome {
        BufferOutcome::Ready => begin_render(shared, &mut state, &entry, from_ms),
        BufferOutcome::Failed => {
            eprintln!(
                "Giving up on {}, the download failed for good.",
                entry.download.track(),
            );
            advance(shared, &mut state);
        }
    }
}

/// Move to the track after the current one, per the repeat mode, skipping
/// entries whose download failed for good.
pub(crate) fn advance(shared: &Arc<Shared>, state: &mut PlayerState) {
    match state.queue.repeat() {
        RepeatMode::Single => start_playback(shared, state, 0),
        RepeatMode::Off | RepeatMode::All => {
            let n = state.queue.len();
            let mut steps = 0;
            loop {
                match state.queue.next() {
                    None => return stop_at_queue_end(shared, state),
                    Some(i) => {
                        steps += 1;
                        let failed = match state.queue.get(i) {
                            Some(qt) => qt.download.is_permanently_failed(),
                            None => true,
                        };
                        if !failed {
                            return start_playback(shared, state, 0);
                        }
                        println!("Skipping queue index {}, its download failed for good.", i);
                        // With repeat-all and only failed tracks left, the
                        // wrap-around would spin forever without this.
                        if steps >= n {
                            return stop_at_queue_end(shared, state);
                        }
                    }
                }
            }
        }
    }
}

/// Playback ran off the end of the queue (or there is no queue).
fn stop_at_queue_end(shared: &Arc<Shared>, state: &mut PlayerState) {
    state.play_epoch += 1;
    if let Some(task) = state.buffer_task.take() {
        task.cancel();
    }
    state.engine.stop();
    if state.jukebox.enabled() {
        state.jukebox.stop();
    }
    set_state(shared, state, PlaybackState::Stopped);
    emit(shared, PlaybackEvent::NowPlayingCleared);
}

/// Stop everything and return to idle, keeping the queue.
fn reset_playback(shared: &Arc<Shared>, state: &mut PlayerState) {
    state.play_epoch += 1;
    if let Some(task) = state.buffer_task.take() {
        task.cancel();
    }
    state.engine.stop();
    if state.jukebox.enabled() {
        state.jukebox.stop();
    }
    state.pending_seek_ms = None;
    set_state(shared, state, PlaybackState::Idle);
    emit(shared, PlaybackEvent::NowPlayingCleared);
}

/// The single funnel for render engine failures.
///
/// Logs, resets the engine, and leaves the machine in idle for callers to
/// observe. Never propagates.
pub(crate) fn handle_render_error(shared: &Arc<Shared>, state: &mut PlayerState, msg: String) {
    eprintln!("Render engine error: {}", msg);
    state.play_epoch += 1;
    if let Some(task) = state.buffer_task.take() {
        task.cancel();
    }
    state.engine.stop();
    set_state(shared, state, PlaybackState::Idle);
    emit(shared, PlaybackEvent::NowPlayingCleared);
}

/// Main for the thread that listens to the render engine.
pub(crate) fn engine_events_main(shared: Arc<Shared>, events: Receiver<RenderEvent>) {
    for event in events.iter() {
        match event {
            RenderEvent::EndOfStream => handle_completed(&shared),
            RenderEvent::Error(msg) => {
                let mut state = shared.state.lock().unwrap();
                handle_render_error(&shared, &mut state, msg);
            }
        }
    }
}

/// The engine reported the end of the stream.
fn handle_completed(shared: &Arc<Shared>) {
    let mut state = shared.state.lock().unwrap();

    if state.jukebox.enabled() {
        // The engine is bypassed in jukebox mode; a late event from before
        // the switch is meaningless now.
        return;
    }
    let prior = state.playback;
    match prior {
        PlaybackState::Started | PlaybackState::Paused | PlaybackState::Prepared => {}
        // A stale report from before a stop or reset.
        _ => return,
    }
    let entry = match state.queue.current() {
        Some(qt) => qt.clone(),
        None => return,
    };

    set_state(shared, &mut state, PlaybackState::Completed);
    if prior == PlaybackState::Started {
        emit(
            shared,
            PlaybackEvent::Completed(entry.queue_id, entry.download.track().clone()),
        );
    }

    let was_complete_file = state.rendering_complete_file;
    let position_ms = state.engine.position_ms();
    let duration_ms = state
        .engine
        .duration_ms()
        .unwrap_or(entry.download.track().duration_ms);
    let action = completion_action(
        was_complete_file,
        position_ms,
        duration_ms,
        shared.config.end_grace_ms,
    );

    match action {
        CompletionAction::Advance => {
            if !was_complete_file {
                // Played to the end from a partial file; the bytes were
                // good enough, no need to fetch them again.
                entry.download.mark_done();
            }
            advance(shared, &mut state);
        }
        CompletionAction::Resume { from_ms } => {
            println!(
                "Caught up with the download of {}, rebuffering at {} ms.",
                entry.download.track(),
                from_ms,
            );
            start_playback(shared, &mut state, from_ms);
        }
    }
}

pub(crate) fn snapshot_of(state: &PlayerState) -> QueueSnapshot {
    let entries = state
        .queue
        .entries()
        .iter()
        .map(|qt| SnapshotEntry {
            id: qt.download.track().id,
            save: qt.download.save(),
        })
        .collect();
    QueueSnapshot {
        entries: entries,
        current: state.queue.current_index(),
        position_ms: position_ms_of(state),
    }
}

/// Snapshot the queue for persisting, unless the last persisted snapshot
/// is still accurate.
pub(crate) fn take_snapshot_if_dirty(state: &mut PlayerState) -> Option<QueueSnapshot> {
    let snapshot = snapshot_of(state);
    let key = (state.queue.revision(), snapshot.position_ms);
    if state.last_persisted == Some(key) {
        return None;
    }
    state.last_persisted = Some(key);
    Some(snapshot)
}

pub(crate) fn persist(shared: &Shared, snapshot: &QueueSnapshot) {
    if let Err(err) = shared.store.save(snapshot) {
        eprintln!("Failed to persist the queue: {}", err);
    }
}

/// Restore the queue from the snapshot store, then sweep the download
/// directory for files no restored entry references.
fn restore(shared: &Arc<Shared>) {
    let snapshot = match shared.store.load() {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => {
            sweep_orphans(&shared.config.download_path, &HashSet::new());
            return;
        }
        Err(err) => {
            // A snapshot we cannot read is the same as no snapshot.
            eprintln!("Ignoring unreadable queue snapshot: {}", err);
            sweep_orphans(&shared.config.download_path, &HashSet::new());
            return;
        }
    };

    let mut referenced = HashSet::new();
    let mut downloads = Vec::new();
    let mut new_current = None;
    let mut n_kept = 0;
    for (i, entry) in snapshot.entries.iter().enumerate() {
        match shared.catalog.resolve(entry.id) {
            Some(track) => {
                referenced.insert(entry.id);
                if snapshot.current == Some(i) {
                    new_current = Some(n_kept);
                }
                let download = Download::new(track, &shared.config.download_path, entry.save);
                downloads.push(Arc::new(download));
                n_kept += 1;
            }
            None => {
                println!("Dropping queued track {}, no longer in the catalog.", entry.id);
            }
        }
    }

    if !downloads.is_empty() {
        let mut state = shared.state.lock().unwrap();
        state.queue.add(downloads, AddMode::Replace, InsertPosition::End);
        if let Some(index) = new_current {
            state.queue.set_index(index);
            if snapshot.position_ms > 0 {
                state.pending_seek_ms = Some(snapshot.position_ms);
            }
        }
        println!(
            "Restored a queue of {} tracks at index {:?}.",
            state.queue.len(),
            state.queue.current_index(),
        );
    }

    sweep_orphans(&shared.config.download_path, &referenced);
    let _ = shared.wake_sender.send(Wake::Reconcile);
}
