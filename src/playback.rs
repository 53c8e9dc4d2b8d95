// Cadenza -- Media streaming daemon with play-queue and download orchestration
// Copyright 2024 Ruud van Asseldonk
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// A copy of the License has been included in the root of the repository.

//! The player state machine and the render engine boundary.
//!
//! The render engine is whatever actually turns a file into sound: a local
//! output device, or nothing at all when the daemon only orchestrates
//! downloads for remote clients. The player drives it through the
//! [`RenderEngine`] trait and hears back through a channel of
//! [`RenderEvent`]s, so engine failures can never unwind into the player;
//! they arrive as data.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;

use crate::prim::Track;

/// What the player is doing, observable by polling callers.
///
/// The normal flow of starting a track runs Idle → Downloading (waiting for
/// enough bytes) → Preparing (engine is loading the file) → Prepared →
/// Started. Every state can fall back to Idle through the error path.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PlaybackState {
    Idle,
    Downloading,
    Preparing,
    Prepared,
    Started,
    Paused,
    Stopped,
    Completed,
}

impl PlaybackState {
    pub fn as_str(&self) -> &'static str {
        match *self {
            PlaybackState::Idle => "idle",
            PlaybackState::Downloading => "downloading",
            PlaybackState::Preparing => "preparing",
            PlaybackState::Prepared => "prepared",
            PlaybackState::Started => "started",
            PlaybackState::Paused => "paused",
            PlaybackState::Stopped => "stopped",
            PlaybackState::Completed => "completed",
        }
    }
}

/// Events the render engine reports back to the player.
pub enum RenderEvent {
    /// The engine ran out of data at the end of the loaded file.
    EndOfStream,
    /// The engine hit an unrecoverable problem (codec error, device lost).
    Error(String),
}

/// The local media-rendering engine, driven under the player lock.
///
/// Implementations send their [`RenderEvent`]s on the channel handed to
/// them at construction. Calls are expected to return quickly; an engine
/// that needs to block should do so on its own thread.
pub trait RenderEngine: Send {
    /// Prepare the engine to render `path` from `start_ms` onwards.
    ///
    /// The track carries metadata hints (duration, bit rate) that the
    /// engine may use when the file itself does not provide them.
    fn load(&mut self, track: &Track, path: &Path, start_ms: u64) -> io::Result<()>;

    /// Start or resume rendering.
    fn play(&mut self) -> io::Result<()>;

    /// Suspend rendering, keeping the loaded file and position.
    fn pause(&mut self) -> io::Result<()>;

    /// Jump to the given position in the loaded file.
    fn seek(&mut self, position_ms: u64) -> io::Result<()>;

    /// Discard the loaded file. Infallible; there is nothing sensible a
    /// caller could do about a failure to stop.
    fn stop(&mut self);

    /// Current position in the loaded file.
    fn position_ms(&self) -> u64;

    /// Duration of the loaded file, if the engine knows it.
    fn duration_ms(&self) -> Option<u64>;
}

/// What to do after the engine reports the end of the stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompletionAction {
    /// The track really finished; move on to the next one.
    Advance,
    /// The engine ran off the end of a still-growing partial file; go back
    /// to buffering and resume from this position.
    Resume { from_ms: u64 },
}

/// Decide how to handle an end-of-stream report.
///
/// An end-of-stream on the complete file is the real end of the track. On a
/// partial file it usually means the engine caught up with the download,
/// except when the reported position is within `end_grace_ms` of the known
/// duration: engines report the end slightly early on files that grow under
/// them, and resuming would replay the final second forever.
pub fn completion_action(
    was_complete_file: bool,
    position_ms: u64,
    duration_ms: u64,
    end_grace_ms: u64,
) -> CompletionAction {
    if was_complete_file {
        return CompletionAction::Advance;
    }
    if duration_ms > 0 && position_ms + end_grace_ms >= duration_ms {
        return CompletionAction::Advance;
    }
    CompletionAction::Resume { from_ms: position_ms }
}

struct ClockState {
    loaded: Option<PathBuf>,
    playing: bool,
    /// Position when `started_at` was last set.
    base_ms: u64,
    started_at: Option<Instant>,
    duration_ms: u64,
    eos_sent: bool,
}

impl ClockState {
    fn position_ms(&self) -> u64 {
        let running_ms = match (self.playing, self.started_at) {
            (true, Some(at)) => at.elapsed().as_millis() as u64,
            _ => 0,
        };
        self.base_ms + running_ms
    }
}

/// A render engine that renders nothing, in real time.
///
/// The daemon's own job is orchestrating downloads; actual audio output
/// belongs to the client on the other end of the API. This engine stands in
/// for a real output device: it advances a clock while "playing" and
/// reports end-of-stream when the clock passes the track duration, so the
/// queue advances exactly as it would with sound coming out.
pub struct ClockEngine {
    state: Arc<Mutex<ClockState>>,
}

impl ClockEngine {
    pub fn new(events: Sender<RenderEvent>) -> ClockEngine {
        let state = Arc::new(Mutex::new(ClockState {
            loaded: None,
            playing: false,
            base_ms: 0,
            started_at: None,
            duration_ms: 0,
            eos_sent: false,
        }));

        // The ticker outlives the engine handle; it exits when the event
        // channel is gone, which happens when the player shuts down.
        let state_for_ticker = state.clone();
        let builder = thread::Builder::new().name("render_clock".into());
        builder
            .spawn(move || {
                loop {
                    thread::sleep(Duration::from_millis(250));
                    let mut state = state_for_ticker.lock().unwrap();
                    let at_end = state.playing
                        && !state.eos_sent
                        && state.duration_ms > 0
                        && state.position_ms() >= state.duration_ms;
                    if at_end {
                        state.eos_sent = true;
                        state.playing = false;
                        state.base_ms = state.duration_ms;
                        state.started_at = None;
                        drop(state);
                        if events.send(RenderEvent::EndOfStream).is_err() {
                            break;
                        }
                    }
                }
            })
            .expect("Failed to spawn render clock thread.");

        ClockEngine { state }
    }
}

impl RenderEngine for ClockEngine {
    fn load(&mut self, track: &Track, path: &Path, start_ms: u64) -> io::Result<()> {
        // Confirm the file is actually there, which is what a real engine
        // would trip over at this point.
        fs::metadata(path)?;
        let mut state = self.state.lock().unwrap();
        state.loaded = Some(path.to_path_buf());
        state.playing = false;
        state.base_ms = start_ms;
        state.started_at = None;
        state.duration_ms = track.duration_ms;
        state.eos_sent = false;
        Ok(())
    }

    fn play(&mut self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.loaded.is_none() {
            return Err(io::Error::new(io::ErrorKind::Other, "No file loaded."));
        }
        if !state.playing {
            state.playing = true;
            state.started_at = Some(Instant::now());
        }
        Ok(())
    }

    fn pause(&mut self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.playing {
            state.base_ms = state.position_ms();
            state.playing = false;
            state.started_at = None;
        }
        Ok(())
    }

    fn seek(&mut self, position_ms: u64) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.base_ms = position_ms;
        if state.playing {
            state.started_at = Some(Instant::now());
        }
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.loaded = None;
        state.playing = false;
        state.base_ms = 0;
        state.started_at = None;
        state.duration_ms = 0;
        state.eos_sent = false;
    }

    fn position_ms(&self) -> u64 {
        self.state.lock().unwrap().position_ms()
    }

    fn duration_ms(&self) -> Option<u64> {
        let state = self.state.lock().unwrap();
        match state.duration_ms {
            0 => None,
            ms => Some(ms),
        }
    }
}

#[cfg(test)]
mod test {
    use crossbeam::channel;

    use crate::download::test::make_track;
    use super::{ClockEngine, CompletionAction, RenderEngine, completion_action};

    #[test]
    fn complete_file_always_advances() {
        assert_eq!(
            completion_action(true, 1_000, 200_000, 10_000),
            CompletionAction::Advance,
        );
    }

    #[test]
    fn partial_file_near_the_end_advances() {
        // 195 s into a 200 s track, with a 10 s grace: effectively done.
        assert_eq!(
            completion_action(false, 195_000, 200_000, 10_000),
            CompletionAction::Advance,
        );
    }

    #[test]
    fn partial_file_far_from_the_end_resumes() {
        assert_eq!(
            completion_action(false, 60_000, 200_000, 10_000),
            CompletionAction::Resume { from_ms: 60_000 },
        );
    }

    #[test]
    fn partial_file_with_unknown_duration_resumes() {
        assert_eq!(
            completion_action(false, 60_000, 0, 10_000),
            CompletionAction::Resume { from_ms: 60_000 },
        );
    }

    #[test]
    fn clock_engine_refuses_to_load_a_missing_file() {
        let (tx, _rx) = channel::unbounded();
        let mut engine = ClockEngine::new(tx);
        let track = make_track(1, 100);
        let result = engine.load(&track, std::path::Path::new("/nonexistent/x.flac"), 0);
        assert!(result.is_err());
    }

    #[test]
    fn clock_engine_tracks_position_across_seek_and_pause() {
        let (tx, _rx) = channel::unbounded();
        let mut engine = ClockEngine::new(tx);
        let track = make_track(2, 100);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.flac");
        std::fs::write(&path, b"x").unwrap();

        engine.load(&track, &path, 1_500).unwrap();
        assert_eq!(engine.position_ms(), 1_500);
        assert_eq!(engine.duration_ms(), Some(30_000));

        engine.seek(7_000).unwrap();
        engine.pause().unwrap();
        assert_eq!(engine.position_ms(), 7_000);

        engine.stop();
        assert_eq!(engine.position_ms(), 0);
        assert_eq!(engine.duration_ms(), None);
    }
}
