// Cadenza -- Media streaming daemon with play-queue and download orchestration
// Copyright 2024 Ruud van Asseldonk
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// A copy of the License has been included in the root of the repository.

//! Primitive data types for tracks and playback.

use std::fmt;
use std::path::{Path, PathBuf};

// The catalog is the authority on track identity. It hands out 64-bit ids
// derived from the track path, so equality of ids is equality of paths. We
// don't need the id to be stable across machines, only across restarts of
// the same daemon, because ids end up in the persisted queue snapshot. A
// 64-bit hash of the path satisfies both: at a 1% collision probability you
// would need on the order of 600M tracks, far beyond any personal library.

/// Identifies a track in the catalog, derived from its path.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TrackId(pub u64);

/// Identifies an entry in the play queue.
///
/// The same track can occur in the queue multiple times, so the track id is
/// not sufficient to identify an entry. Queue ids are assigned from a
/// per-queue counter and never reused within a session.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct QueueId(pub u64);

impl TrackId {
    #[inline]
    pub fn parse(src: &str) -> Option<TrackId> {
        u64::from_str_radix(src, 16).ok().map(TrackId)
    }
}

impl QueueId {
    #[inline]
    pub fn parse(src: &str) -> Option<QueueId> {
        u64::from_str_radix(src, 16).ok().map(QueueId)
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Container format of a media file, determined from its extension.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileFormat {
    Flac,
    Mp3,
    Ogg,
    Mp4,
    Unknown,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> FileFormat {
        let ext = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => ext,
            None => return FileFormat::Unknown,
        };
        match &ext.to_ascii_lowercase()[..] {
            "flac" => FileFormat::Flac,
            "mp3" => FileFormat::Mp3,
            "ogg" | "oga" | "opus" => FileFormat::Ogg,
            "m4a" | "mp4" | "aac" => FileFormat::Mp4,
            _ => FileFormat::Unknown,
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            FileFormat::Flac => "flac",
            FileFormat::Mp3 => "mp3",
            FileFormat::Ogg => "ogg",
            FileFormat::Mp4 => "mp4",
            FileFormat::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Metadata for a single track, as resolved by the catalog.
///
/// Tracks are immutable; the catalog produces them, the queue consumes them.
/// Two tracks are the same track if and only if they have the same path,
/// regardless of the metadata, which can change between scans.
#[derive(Clone, Debug)]
pub struct Track {
    pub id: TrackId,
    pub path: PathBuf,
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Duration in milliseconds, 0 when unknown.
    pub duration_ms: u64,
    /// Average bit rate in kbit per second, 0 when unknown.
    pub bitrate_kbps: u32,
    pub format: FileFormat,
    /// Size of the backing file in bytes, if the catalog knows it.
    pub size_bytes: Option<u64>,
}

impl PartialEq for Track {
    fn eq(&self, other: &Track) -> bool {
        self.path == other.path
    }
}

impl Eq for Track {}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {} - {}", self.id, self.artist, self.title)
    }
}

/// A volume in hundredths of a decibel, relative to full scale.
///
/// Example: -7.32 dB would be stored as `Millibel(-732)`.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Millibel(pub i32);

impl Millibel {
    /// The softest volume the jukebox device can be set to.
    pub const MIN: Millibel = Millibel(-6000);

    /// Full scale.
    pub const MAX: Millibel = Millibel(0);

    pub fn clamp_to_range(self) -> Millibel {
        if self < Millibel::MIN { return Millibel::MIN }
        if self > Millibel::MAX { return Millibel::MAX }
        self
    }
}

impl fmt::Display for Millibel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:.2} dB", (self.0 as f32) * 0.01)
    }
}

#[cfg(test)]
mod test {
    use std::path::{Path, PathBuf};
    use super::{FileFormat, Millibel, Track, TrackId};

    fn make_track(path: &str, title: &str) -> Track {
        Track {
            id: TrackId(1),
            path: PathBuf::from(path),
            title: String::from(title),
            artist: String::new(),
            album: String::new(),
            duration_ms: 0,
            bitrate_kbps: 0,
            format: FileFormat::from_path(Path::new(path)),
            size_bytes: None,
        }
    }

    #[test]
    fn track_id_display_roundtrips_through_parse() {
        let id = TrackId(0x29b4_bebd_a0c8_710d);
        assert_eq!(TrackId::parse(&id.to_string()), Some(id));
    }

    #[test]
    fn track_equality_is_by_path() {
        let t1 = make_track("/lib/a.flac", "One");
        let t2 = make_track("/lib/a.flac", "Renamed");
        let t3 = make_track("/lib/b.flac", "One");
        assert_eq!(t1, t2);
        assert!(t1 != t3);
    }

    #[test]
    fn file_format_ignores_extension_case() {
        assert_eq!(FileFormat::from_path(Path::new("x.FLAC")), FileFormat::Flac);
        assert_eq!(FileFormat::from_path(Path::new("x.Mp3")), FileFormat::Mp3);
        assert_eq!(FileFormat::from_path(Path::new("x")), FileFormat::Unknown);
    }

    #[test]
    fn millibel_clamps_to_range() {
        assert_eq!(Millibel(100).clamp_to_range(), Millibel::MAX);
        assert_eq!(Millibel(-9000).clamp_to_range(), Millibel::MIN);
        assert_eq!(Millibel(-150).clamp_to_range(), Millibel(-150));
    }
}
