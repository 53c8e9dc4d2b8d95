// Cadenza -- Media streaming daemon with play-queue and download orchestration
// Copyright 2024 Ruud van Asseldonk
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// A copy of the License has been included in the root of the repository.

//! Persisting the queue across restarts.
//!
//! The persisted form is a deliberately boring line-based text file: a
//! version header, the position, the cursor, and one line per queued track,
//! in order. Anything that fails to parse reads as "no saved state"; a
//! snapshot is a convenience, never something to refuse startup over.
//!
//! ```text
//! cadenza queue v1
//! position_ms = 83250
//! current = 2
//! track = 29b4bebda0c8710d
//! track = b9b7641fbd52f102 saved
//! ```

use std::collections::HashSet;
use std::fs;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::prim::TrackId;

const MAGIC: &str = "cadenza queue v1";

/// One queued track in the persisted form.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SnapshotEntry {
    pub id: TrackId,
    pub save: bool,
}

/// The queue as persisted: ordered track ids, cursor, playback position.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueSnapshot {
    pub entries: Vec<SnapshotEntry>,
    pub current: Option<usize>,
    pub position_ms: u64,
}

impl QueueSnapshot {
    pub fn write_to<W: Write>(&self, mut w: W) -> io::Result<()> {
        writeln!(w, "{}", MAGIC)?;
        writeln!(w, "position_ms = {}", self.position_ms)?;
        match self.current {
            Some(i) => writeln!(w, "current = {}", i)?,
            None => writeln!(w, "current = none")?,
        }
        for entry in &self.entries {
            match entry.save {
                false => writeln!(w, "track = {}", entry.id)?,
                true => writeln!(w, "track = {} saved", entry.id)?,
            }
        }
        Ok(())
    }

    pub fn parse<I, S>(lines: I) -> Result<QueueSnapshot>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries = Vec::new();
        let mut current = None;
        let mut position_ms = 0;
        let mut saw_magic = false;

        for (lineno, line_raw) in lines.into_iter().enumerate() {
            let line = line_raw.as_ref();

            if line.len() == 0 {
                continue
            }

            if !saw_magic {
                if line == MAGIC {
                    saw_magic = true;
                    continue
                }
                let msg = "Expected snapshot header on the first line.";
                return Err(Error::InvalidSnapshot(lineno, msg));
            }

            if let Some(n) = line.find('=') {
                let key = line[..n].trim();
                let value = line[n + 1..].trim();
                match key {
                    "position_ms" => match u64::from_str(value) {
                        Ok(ms) => position_ms = ms,
                        Err(_) => {
                            let msg = "Invalid position_ms value, must be an integer.";
                            return Err(Error::InvalidSnapshot(lineno, msg));
                        }
                    }
                    "current" => match value {
                        "none" => current = None,
                        _ => match usize::from_str(value) {
                            Ok(i) => current = Some(i),
                            Err(_) => {
                                let msg = "Invalid current value, must be an index or 'none'.";
                                return Err(Error::InvalidSnapshot(lineno, msg));
                            }
                        }
                    }
                    "track" => {
                        let mut parts = value.split(' ').filter(|p| p.len() > 0);
                        let id = match parts.next().and_then(TrackId::parse) {
                            Some(id) => id,
                            None => {
                                let msg = "Invalid track id, expected 16 hex digits.";
                                return Err(Error::InvalidSnapshot(lineno, msg));
                            }
                        };
                        let save = match parts.next() {
                            None => false,
                            Some("saved") => true,
                            Some(_) => {
                                let msg = "Invalid track flag, expected 'saved' or nothing.";
                                return Err(Error::InvalidSnapshot(lineno, msg));
                            }
                        };
                        entries.push(SnapshotEntry { id, save });
                    }
                    _ => {
                        let msg = "Unknown key in queue snapshot.";
                        return Err(Error::InvalidSnapshot(lineno, msg));
                    }
                }
            } else {
                let msg = "Line contains no '='.";
                return Err(Error::InvalidSnapshot(lineno, msg));
            }
        }

        if !saw_magic {
            return Err(Error::InvalidSnapshot(0, "Snapshot file is empty."));
        }

        // A cursor that points outside the restored list would violate the
        // queue invariant before playback even starts.
        if let Some(i) = current {
            if i >= entries.len() {
                let msg = "Cursor out of bounds for the number of tracks.";
                return Err(Error::InvalidSnapshot(0, msg));
            }
        }

        let snapshot = QueueSnapshot {
            entries: entries,
            current: current,
            position_ms: position_ms,
        };
        Ok(snapshot)
    }
}

/// Where queue snapshots are kept between runs of the daemon.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &QueueSnapshot) -> Result<()>;
    fn load(&self) -> Result<Option<QueueSnapshot>>;
}

/// Snapshot storage in a file, written atomically via a rename.
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: PathBuf) -> FileSnapshotStore {
        FileSnapshotStore { path }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, snapshot: &QueueSnapshot) -> Result<()> {
        // Write to a sibling file and rename over the target, so a crash
        // mid-write leaves the previous snapshot intact rather than half a
        // file.
        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = fs::File::create(&tmp_path)?;
        snapshot.write_to(&mut tmp)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<Option<QueueSnapshot>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::IoError(err)),
        };
        let snapshot = QueueSnapshot::parse(contents.lines())?;
        Ok(Some(snapshot))
    }
}

/// Delete download files that no queue entry references any more.
///
/// Runs once at startup, after the snapshot is restored: files from queues
/// of sessions past would otherwise pile up forever. Saved files are kept
/// no matter what; that is what saving means. Files whose names do not look
/// like download files (the snapshot itself, for one, lives in the same
/// directory) are left alone. Returns the number of files deleted.
pub fn sweep_orphans(download_dir: &Path, referenced: &HashSet<TrackId>) -> u32 {
    let mut n_deleted = 0;

    let entries = walkdir::WalkDir::new(download_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| match e {
            Ok(entry) => Some(entry),
            Err(err) => {
                eprintln!("Error while sweeping downloads: {}", err);
                None
            }
        })
        .filter(|e| e.file_type().is_file());

    for entry in entries {
        let name = match entry.file_name().to_str() {
            Some(name) => name,
            None => continue,
        };
        let (stem, suffix) = match name.find('.') {
            Some(n) => (&name[..n], &name[n + 1..]),
            None => continue,
        };
        match suffix {
            "partial" | "complete" => {}
            _ => continue,
        }
        let id = match TrackId::parse(stem) {
            Some(id) => id,
            None => continue,
        };
        if referenced.contains(&id) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                println!("Deleted orphaned download {}.", name);
                n_deleted += 1;
            }
            Err(err) => eprintln!("Failed to delete {:?}: {}", entry.path(), err),
        }
    }

    n_deleted
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use crate::prim::TrackId;
    use super::{
        FileSnapshotStore, QueueSnapshot, SnapshotEntry, SnapshotStore, sweep_orphans,
    };

    fn example_snapshot() -> QueueSnapshot {
        QueueSnapshot {
            entries: vec![
                SnapshotEntry { id: TrackId(0x29b4_bebd_a0c8_710d), save: false },
                SnapshotEntry { id: TrackId(0xb9b7_641f_bd52_f102), save: true },
                SnapshotEntry { id: TrackId(0x0000_0000_0000_00ff), save: false },
            ],
            current: Some(1),
            position_ms: 83_250,
        }
    }

    #[test]
    fn snapshot_roundtrips_through_the_line_format() {
        let snapshot = example_snapshot();
        let mut buffer = Vec::new();
        snapshot.write_to(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let parsed = QueueSnapshot::parse(text.lines()).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn snapshot_roundtrips_through_the_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("queue.state"));

        assert_eq!(store.load().unwrap(), None);

        let snapshot = example_snapshot();
        store.save(&snapshot).unwrap();
        assert_eq!(store.load().unwrap(), Some(snapshot));
    }

    #[test]
    fn corrupt_snapshots_fail_to_parse() {
        let cases: &[&[&str]] = &[
            // Wrong header.
            &["cadenza queue v9", "position_ms = 0"],
            // Cursor out of bounds.
            &["cadenza queue v1", "current = 3", "track = 0000000000000001"],
            // Bad track id.
            &["cadenza queue v1", "track = zzz"],
            // Not a key-value line.
            &["cadenza queue v1", "what is this"],
            // Empty file.
            &[],
        ];
        for lines in cases {
            assert!(QueueSnapshot::parse(lines.iter()).is_err());
        }
    }

    #[test]
    fn sweep_deletes_unreferenced_downloads_only() {
        let dir = tempfile::tempdir().unwrap();
        let keep = TrackId(0xa1);
        let drop = TrackId(0xb2);

        let keep_file = dir.path().join(format!("{}.complete", keep));
        let drop_partial = dir.path().join(format!("{}.partial", drop));
        let drop_complete = dir.path().join(format!("{}.complete", drop));
        let saved = dir.path().join(format!("{}.save", drop));
        let state = dir.path().join("queue.state");
        for path in [&keep_file, &drop_partial, &drop_complete, &saved, &state] {
            std::fs::write(path, b"x").unwrap();
        }

        let mut referenced = HashSet::new();
        referenced.insert(keep);
        let n_deleted = sweep_orphans(dir.path(), &referenced);

        assert_eq!(n_deleted, 2);
        assert!(keep_file.exists());
        assert!(!drop_partial.exists());
        assert!(!drop_complete.exists());
        // Saved files and unrelated files survive the sweep.
        assert!(saved.exists());
        assert!(state.exists());
    }
}
