// Cadenza -- Media streaming daemon with play-queue and download orchestration
// Copyright 2024 Ruud van Asseldonk
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// A copy of the License has been included in the root of the repository.

//! Cadenza is the playback core of a personal media streaming server.
//!
//! It owns the play queue, downloads the bytes for queued tracks ahead of
//! playback, gates the render engine on buffered data, and keeps all of it
//! alive across restarts. The catalog of tracks, the thing that actually
//! makes sound, and the places notifications go are all collaborators
//! behind traits; this crate is the coordination between them.

use std::io;
use std::io::Read;

pub mod buffer;
pub mod config;
pub mod download;
pub mod error;
pub mod history;
pub mod jukebox;
pub mod mvar;
pub mod playback;
pub mod player;
pub mod prim;
pub mod queue;
pub mod scheduler;
pub mod serialization;
pub mod shuffle;
pub mod signals;
pub mod snapshot;

pub use crate::config::Config;
pub use crate::player::Player;
pub use crate::prim::{QueueId, Track, TrackId};

use crate::shuffle::RadioCriteria;

/// The library of tracks this player can play.
///
/// The catalog is external to this crate: it might be backed by a
/// database, a scan of the filesystem, or another server. The player asks
/// it three things: what a track id means, where its bytes come from, and
/// for random tracks to keep a radio queue going.
pub trait MediaCatalog: Send + Sync {
    /// Look up the metadata for a track.
    fn resolve(&self, id: TrackId) -> Option<Track>;

    /// Whether the catalog (still) has this track.
    fn exists(&self, id: TrackId) -> bool;

    /// Open the backing byte stream of a track, from the beginning.
    fn open(&self, id: TrackId) -> io::Result<Box<dyn Read + Send>>;

    /// Draw up to `count` random tracks matching the criteria.
    fn random_tracks(&self, criteria: &RadioCriteria, count: usize) -> Vec<Track>;
}
