// Cadenza -- Media streaming daemon with play-queue and download orchestration
// Copyright 2024 Ruud van Asseldonk
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// A copy of the License has been included in the root of the repository.

//! Logic for serializing player and queue state to json.

use std::io;
use std::io::Write;

use crate::player::{PlayerStatus, QueueEntryInfo};
use crate::prim::{Millibel, Track};

/// Write a json representation of one track to the writer.
pub fn write_track_json<W: Write>(mut w: W, track: &Track) -> io::Result<()> {
    write!(w, r#"{{"id":"{}","title":"#, track.id)?;
    serde_json::to_writer(&mut w, &track.title)?;
    write!(w, r#","artist":"#)?;
    serde_json::to_writer(&mut w, &track.artist)?;
    write!(w, r#","album":"#)?;
    serde_json::to_writer(&mut w, &track.album)?;
    write!(
        w,
        r#","duration_ms":{},"bitrate_kbps":{},"format":"{}"}}"#,
        track.duration_ms, track.bitrate_kbps, track.format,
    )
}

/// Write a json representation of the track listing to the writer.
pub fn write_tracks_json<W: Write>(mut w: W, tracks: &[Track]) -> io::Result<()> {
    write!(w, "[")?;
    let mut first = true;
    for track in tracks {
        if !first { write!(w, ",")?; }
        write_track_json(&mut w, track)?;
        first = false;
    }
    write!(w, "]")
}

fn write_queue_entry_json<W: Write>(mut w: W, entry: &QueueEntryInfo) -> io::Result<()> {
    write!(w, r#"{{"queue_id":"{}","track":"#, entry.queue_id)?;
    write_track_json(&mut w, &entry.track)?;
    write!(
        w,
        r#","downloaded_bytes":{},"complete":{},"failed":{},"save":{}}}"#,
        entry.downloaded_bytes, entry.is_complete, entry.is_failed, entry.save,
    )
}

/// Write a json representation of the queue to the writer.
pub fn write_queue_json<W: Write>(mut w: W, entries: &[QueueEntryInfo]) -> io::Result<()> {
    write!(w, "[")?;
    let mut first = true;
    for entry in entries {
        if !first { write!(w, ",")?; }
        write_queue_entry_json(&mut w, entry)?;
        first = false;
    }
    write!(w, "]")
}

/// Write a json representation of the player status to the writer.
pub fn write_status_json<W: Write>(mut w: W, status: &PlayerStatus) -> io::Result<()> {
    write!(w, r#"{{"state":"{}","position_ms":{}"#, status.state.as_str(), status.position_ms)?;
    match status.duration_ms {
        Some(ms) => write!(w, r#","duration_ms":{}"#, ms)?,
        None => write!(w, r#","duration_ms":null"#)?,
    }
    match status.current_index {
        Some(i) => write!(w, r#","current_index":{}"#, i)?,
        None => write!(w, r#","current_index":null"#)?,
    }
    write!(w, r#","current":"#)?;
    match &status.current {
        Some(entry) => write_queue_entry_json(&mut w, entry)?,
        None => write!(w, "null")?,
    }
    write!(
        w,
        r#","revision":{},"repeat":"{}","jukebox_enabled":{},"jukebox_volume_db":{:.02}}}"#,
        status.revision,
        status.repeat,
        status.jukebox_enabled,
        status.jukebox_volume.0 as f32 * 0.01,
    )
}

pub fn write_volume_json<W: Write>(mut w: W, current_volume: Millibel) -> io::Result<()> {
    write!(w, r#"{{"volume_db":{:.02}}}"#, current_volume.0 as f32 * 0.01)
}
