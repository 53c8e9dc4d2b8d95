// Cadenza -- Media streaming daemon with play-queue and download orchestration
// Copyright 2024 Ruud van Asseldonk
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// A copy of the License has been included in the root of the repository.

//! Logging of historical playback events.
//!
//! The player pushes events onto a channel and forgets about them; this
//! thread fans them out to the notification and scrobble sinks. The sinks
//! are best-effort by contract: whatever they do (desktop notifications,
//! an HTTP call to a scrobbling service), it happens here, off the player
//! lock, and a slow sink only delays other notifications.

use crossbeam::channel::Receiver;

use crate::playback::PlaybackState;
use crate::prim::{QueueId, Track};

/// Changes in the playback state to be recorded.
pub enum PlaybackEvent {
    /// A track started playing.
    Started(QueueId, Track),
    /// A track played to its end.
    Completed(QueueId, Track),
    /// The player state machine moved to a new state.
    StateChanged(PlaybackState),
    /// Nothing is playing any more.
    NowPlayingCleared,
}

/// Receives "now playing changed" and "playback state changed" updates.
pub trait NotificationSink: Send {
    fn now_playing_changed(&self, track: Option<&Track>);
    fn playback_state_changed(&self, state: PlaybackState);
}

/// Receives scrobbles. `is_submission` is false for a now-playing
/// notification at the start of a track, true for the final submission
/// after it completed.
pub trait ScrobbleSink: Send {
    fn scrobble(&self, track: &Track, is_submission: bool);
}

/// Main for the thread that logs historical playback events.
///
/// Returns when the sending half of the channel is dropped, which happens
/// when the player shuts down.
pub fn main(
    events: Receiver<PlaybackEvent>,
    notifications: Box<dyn NotificationSink>,
    scrobbler: Box<dyn ScrobbleSink>,
) {
    for event in events.iter() {
        let now = chrono::Utc::now();
        match event {
            PlaybackEvent::Started(queue_id, track) => {
                println!("Started {} {} at {}", queue_id, track, now);
                scrobbler.scrobble(&track, false);
                notifications.now_playing_changed(Some(&track));
            }
            PlaybackEvent::Completed(queue_id, track) => {
                println!("Completed {} {} at {}", queue_id, track, now);
                scrobbler.scrobble(&track, true);
            }
            PlaybackEvent::StateChanged(state) => {
                notifications.playback_state_changed(state);
            }
            PlaybackEvent::NowPlayingCleared => {
                notifications.now_playing_changed(None);
            }
        }
    }
}
