// Cadenza -- Media streaming daemon with play-queue and download orchestration
// Copyright 2024 Ruud van Asseldonk
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// A copy of the License has been included in the root of the repository.

//! A track paired with its on-disk download state.
//!
//! Bytes for a queued track are transferred from the catalog's backing
//! stream into a `.partial` file next to the final file. When the transfer
//! reaches the end and the byte count matches what the catalog reported,
//! the partial file is renamed into place. The rename is the commit point:
//! a `.partial` file on disk is by definition incomplete or abandoned, and
//! the orphan sweep may delete it at any time once nothing references it.

use std::fs;
use std::io;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;

use crate::MediaCatalog;
use crate::prim::Track;
use crate::scheduler::Wake;

/// How often a failed transfer may be retried before we give up on it.
///
/// The scheduler re-selects failed downloads at tick cadence, so without a
/// bound, a file that is gone from the catalog would be retried forever,
/// once per tick. Five attempts spaced at tick intervals is enough to ride
/// out a network blip.
pub const MAX_DOWNLOAD_ATTEMPTS: u32 = 5;

/// Transfer state shared between the download thread and its owners.
pub struct DownloadProgress {
    /// Bytes present in the partial file.
    bytes: AtomicU64,
    /// Set when the complete file is in place, or when the render engine
    /// played the track to the end from a partial file.
    done: AtomicBool,
    /// Set when the most recent transfer attempt ended in an error.
    failed: AtomicBool,
    /// Number of transfer attempts that ended in an error.
    attempts: AtomicU32,
    /// Cooperative cancellation flag, checked once per chunk.
    cancel: AtomicBool,
    /// Whether a transfer thread is currently running.
    downloading: AtomicBool,
}

/// A queued track together with its partially or fully downloaded file.
pub struct Download {
    track: Track,
    partial_path: PathBuf,
    complete_path: PathBuf,
    /// Saved downloads survive cache eviction; see [`Download::cleanup`].
    save: bool,
    progress: Arc<DownloadProgress>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

enum TransferOutcome {
    Complete,
    Cancelled,
}

impl Download {
    pub fn new(track: Track, download_dir: &Path, save: bool) -> Download {
        let partial_path = download_dir.join(format!("{}.partial", track.id));
        let complete_name = match save {
            false => format!("{}.complete", track.id),
            true => format!("{}.save", track.id),
        };
        let complete_path = download_dir.join(complete_name);

        // Pick up where a previous run of the daemon left off: a complete
        // file means there is no work to do at all, a partial file seeds the
        // byte count so the transfer resumes instead of restarting.
        let already_done = match fs::metadata(&complete_path) {
            Ok(meta) => match track.size_bytes {
                Some(size) => meta.len() == size,
                None => true,
            },
            Err(_) => false,
        };
        let partial_bytes = match fs::metadata(&partial_path) {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        Download {
            track,
            partial_path,
            complete_path,
            save,
            progress: Arc::new(DownloadProgress {
                bytes: AtomicU64::new(partial_bytes),
                done: AtomicBool::new(already_done),
                failed: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                cancel: AtomicBool::new(false),
                downloading: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    pub fn save(&self) -> bool {
        self.save
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial_path
    }

    pub fn complete_path(&self) -> &Path {
        &self.complete_path
    }

    /// The file the render engine should read from right now.
    ///
    /// Returns the complete file once it is in place, and the growing
    /// partial file before that.
    pub fn current_file(&self) -> PathBuf {
        match fs::metadata(&self.complete_path) {
            Ok(_) => self.complete_path.clone(),
            Err(_) => self.partial_path.clone(),
        }
    }

    /// Whether the complete file exists with the expected size, or the
    /// track was explicitly marked as fully played.
    pub fn is_work_done(&self) -> bool {
        if self.progress.done.load(Ordering::SeqCst) {
            return true;
        }
        match fs::metadata(&self.complete_path) {
            Ok(meta) => match self.track.size_bytes {
                Some(size) => meta.len() == size,
                None => true,
            },
            Err(_) => false,
        }
    }

    /// Mark the download as done without a complete file on disk.
    ///
    /// Used when the render engine reports end-of-stream on a partial file
    /// close enough to the track duration: the bytes were good enough to
    /// play, so there is no point in downloading them again.
    pub fn mark_done(&self) {
        self.progress.done.store(true, Ordering::SeqCst);
    }

    pub fn is_downloading(&self) -> bool {
        self.progress.downloading.load(Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.progress.failed.load(Ordering::SeqCst)
    }

    /// Whether the transfer failed [`MAX_DOWNLOAD_ATTEMPTS`] times.
    ///
    /// A permanently failed download is skipped both by the scheduler and
    /// when advancing through the queue.
    pub fn is_permanently_failed(&self) -> bool {
        self.progress.attempts.load(Ordering::SeqCst) >= MAX_DOWNLOAD_ATTEMPTS
    }

    pub fn downloaded_bytes(&self) -> u64 {
        if self.progress.done.load(Ordering::SeqCst) {
            if let Some(size) = self.track.size_bytes {
                return size;
            }
        }
        self.progress.bytes.load(Ordering::SeqCst)
    }

    /// Start the transfer thread for this download.
    ///
    /// A no-op when a transfer is already running or the work is done. On
    /// termination of the thread, for whatever reason, a reconcile wakeup
    /// is sent so the scheduler can pick the next download immediately
    /// instead of waiting out the tick interval.
    pub fn start(
        this: &Arc<Download>,
        catalog: Arc<dyn MediaCatalog>,
        rate_limit_kbps: Option<u32>,
        wake: Sender<Wake>,
    ) {
        if this.is_work_done() || this.is_downloading() {
            return;
        }
        if this
            .progress
            .downloading
            .swap(true, Ordering::SeqCst)
        {
            // Lost the race against another starter.
            return;
        }

        this.progress.cancel.store(false, Ordering::SeqCst);
        this.progress.failed.store(false, Ordering::SeqCst);

        let this_for_thread = this.clone();
        let builder = thread::Builder::new().name("download".into());
        let join_handle = builder
            .spawn(move || {
                let this = this_for_thread;
                let result = this.run_transfer(&*catalog, rate_limit_kbps);
                match result {
                    Ok(TransferOutcome::Complete) => {
                        this.progress.done.store(true, Ordering::SeqCst);
                        println!(
                            "Download complete: {} ({} bytes)",
                            this.track,
                            this.downloaded_bytes(),
                        );
                    }
                    Ok(TransferOutcome::Cancelled) => {
                        println!("Download cancelled: {}", this.track);
                    }
                    Err(err) => {
                        this.progress.failed.store(true, Ordering::SeqCst);
                        let attempt = 1 + this.progress.attempts.fetch_add(1, Ordering::SeqCst);
                        eprintln!(
                            "Download failed (attempt {}): {}: {}",
                            attempt, this.track, err,
                        );
                    }
                }
                this.progress.downloading.store(false, Ordering::SeqCst);
                // The receiving end going away just means we are shutting down.
                let _ = wake.send(Wake::Reconcile);
            })
            .expect("Failed to spawn download thread.");

        *this.worker.lock().unwrap() = Some(join_handle);
    }

    /// Ask a running transfer to stop at the next chunk boundary.
    ///
    /// The partial file is left in place so a later transfer can resume it.
    pub fn cancel(&self) {
        self.progress.cancel.store(true, Ordering::SeqCst);
    }

    /// Wait for the transfer thread to exit, if one was ever started.
    pub fn join(&self) {
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.join().unwrap();
        }
    }

    /// Delete this download's files from disk.
    ///
    /// Returns false when deleting is unsafe right now (a transfer is
    /// writing the partial file) or when a deletion failed; the caller
    /// should retry later. Saved downloads keep their complete file. Safe
    /// to call repeatedly: deleting an already-deleted file succeeds.
    pub fn cleanup(&self) -> bool {
        if self.is_downloading() {
            return false;
        }
        let mut ok = remove_if_exists(&self.partial_path);
        if !self.save {
            ok = remove_if_exists(&self.complete_path) && ok;
        }
        ok
    }

    fn run_transfer(
        &self,
        catalog: &dyn MediaCatalog,
        rate_limit_kbps: Option<u32>,
    ) -> io::Result<TransferOutcome> {
        let mut src = catalog.open(self.track.id)?;

        // The source stream always starts at byte zero. If we have a leftover
        // partial file, skip the bytes we already have rather than asking the
        // catalog to seek; this cannot duplicate data even when the source
        // does not support resumption.
        let existing = match fs::metadata(&self.partial_path) {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if existing > 0 {
            io::copy(&mut src.by_ref().take(existing), &mut io::sink())?;
        }

        let mut out = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.partial_path)?;

        self.progress.bytes.store(existing, Ordering::SeqCst);

        let started = Instant::now();
        let mut transferred: u64 = 0;
        let mut buffer = [0_u8; 64 * 1024];

        loop {
            if self.progress.cancel.load(Ordering::SeqCst) {
                use std::io::Write;
                out.flush()?;
                return Ok(TransferOutcome::Cancelled);
            }

            let n = src.read(&mut buffer)?;
            if n == 0 {
                break;
            }

            {
                use std::io::Write;
                out.write_all(&buffer[..n])?;
            }

            transferred += n as u64;
            self.progress.bytes.store(existing + transferred, Ordering::SeqCst);

            if let Some(kbps) = rate_limit_kbps {
                throttle(&self.progress, started, transferred, kbps);
            }
        }

        {
            use std::io::Write;
            out.flush()?;
        }

        // The transfer only counts when we got everything the catalog
        // promised; a short stream is as much of a failure as an IO error.
        let total = existing + transferred;
        if let Some(size) = self.track.size_bytes {
            if total != size {
                let msg = format!("Expected {} bytes, got {}.", size, total);
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, msg));
            }
        }

        fs::rename(&self.partial_path, &self.complete_path)?;
        Ok(TransferOutcome::Complete)
    }
}

/// Sleep long enough to keep the transfer under the configured rate.
///
/// Sleeps in short slices so a cancellation does not have to wait out the
/// full pause; cancel latency stays bounded by the slice, not the rate.
fn throttle(progress: &DownloadProgress, started: Instant, transferred: u64, kbps: u32) {
    let bytes_per_sec = (kbps as u64) * 1024 / 8;
    let expected_ms = transferred * 1000 / bytes_per_sec.max(1);
    loop {
        if progress.cancel.load(Ordering::SeqCst) {
            return;
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if expected_ms <= elapsed_ms {
            return;
        }
        let wait_ms = (expected_ms - elapsed_ms).min(100);
        thread::sleep(Duration::from_millis(wait_ms));
    }
}

fn remove_if_exists(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(ref err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            eprintln!("Failed to delete {:?}: {}", path, err);
            false
        }
    }
}

#[cfg(test)]
pub mod test {
    use std::collections::HashMap;
    use std::io;
    use std::io::Cursor;
    use std::io::Read;
    use std::path::Path;
    use std::sync::Arc;

    use crossbeam::channel;

    use crate::MediaCatalog;
    use crate::prim::{FileFormat, Track, TrackId};
    use crate::shuffle::RadioCriteria;
    use super::Download;

    /// In-memory catalog for tests, also used by the scheduler and player
    /// test modules.
    pub struct MemoryCatalog {
        tracks: HashMap<TrackId, (Track, Vec<u8>)>,
    }

    impl MemoryCatalog {
        pub fn new() -> MemoryCatalog {
            MemoryCatalog { tracks: HashMap::new() }
        }

        pub fn add(&mut self, track: Track, data: Vec<u8>) {
            self.tracks.insert(track.id, (track, data));
        }
    }

    impl MediaCatalog for MemoryCatalog {
        fn resolve(&self, id: TrackId) -> Option<Track> {
            self.tracks.get(&id).map(|entry| entry.0.clone())
        }

        fn exists(&self, id: TrackId) -> bool {
            self.tracks.contains_key(&id)
        }

        fn open(&self, id: TrackId) -> io::Result<Box<dyn Read + Send>> {
            match self.tracks.get(&id) {
                Some(entry) => Ok(Box::new(Cursor::new(entry.1.clone()))),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "No such track.")),
            }
        }

        fn random_tracks(&self, _criteria: &RadioCriteria, count: usize) -> Vec<Track> {
            self.tracks.values().take(count).map(|entry| entry.0.clone()).collect()
        }
    }

    pub fn make_track(id: u64, n_bytes: usize) -> Track {
        Track {
            id: TrackId(id),
            path: Path::new("/library").join(format!("{}.flac", id)),
            title: format!("Track {}", id),
            artist: String::from("Artist"),
            album: String::from("Album"),
            duration_ms: 30_000,
            bitrate_kbps: 128,
            format: FileFormat::Flac,
            size_bytes: Some(n_bytes as u64),
        }
    }

    fn transfer_blocking(download: &Arc<Download>, catalog: &Arc<MemoryCatalog>) {
        let (wake_tx, _wake_rx) = channel::unbounded();
        let catalog_dyn: Arc<dyn MediaCatalog> = catalog.clone();
        Download::start(download, catalog_dyn, None, wake_tx);
        download.join();
    }

    #[test]
    fn transfer_renames_partial_into_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MemoryCatalog::new();
        let track = make_track(1, 1000);
        catalog.add(track.clone(), vec![7_u8; 1000]);
        let catalog = Arc::new(catalog);

        let download = Arc::new(Download::new(track, dir.path(), false));
        assert!(!download.is_work_done());

        transfer_blocking(&download, &catalog);

        assert!(download.is_work_done());
        assert!(!download.is_failed());
        assert!(download.complete_path().exists());
        assert!(!download.partial_path().exists());
        assert_eq!(download.downloaded_bytes(), 1000);
    }

    #[test]
    fn transfer_resumes_from_existing_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MemoryCatalog::new();
        let track = make_track(2, 1000);
        let data: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        catalog.add(track.clone(), data.clone());
        let catalog = Arc::new(catalog);

        // Simulate an interrupted earlier transfer.
        let partial = dir.path().join(format!("{}.partial", track.id));
        std::fs::write(&partial, &data[..400]).unwrap();

        let download = Arc::new(Download::new(track, dir.path(), false));
        assert_eq!(download.downloaded_bytes(), 400);

        transfer_blocking(&download, &catalog);

        assert!(download.is_work_done());
        let complete = std::fs::read(download.complete_path()).unwrap();
        assert_eq!(complete, data);
    }

    #[test]
    fn short_stream_sets_failure_flag_and_keeps_partial() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MemoryCatalog::new();
        // Catalog claims 1000 bytes but the stream has fewer.
        let track = make_track(3, 1000);
        catalog.add(track.clone(), vec![1_u8; 700]);
        let catalog = Arc::new(catalog);

        let download = Arc::new(Download::new(track, dir.path(), false));
        transfer_blocking(&download, &catalog);

        assert!(download.is_failed());
        assert!(!download.is_work_done());
        assert!(download.partial_path().exists());
        assert!(!download.is_permanently_failed());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MemoryCatalog::new();
        let track = make_track(4, 100);
        catalog.add(track.clone(), vec![2_u8; 100]);
        let catalog = Arc::new(catalog);

        let download = Arc::new(Download::new(track, dir.path(), false));
        transfer_blocking(&download, &catalog);
        assert!(download.complete_path().exists());

        assert!(download.cleanup());
        assert!(!download.complete_path().exists());

        // A second cleanup has nothing to do and still reports success.
        assert!(download.cleanup());
    }

    #[test]
    fn cleanup_keeps_saved_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MemoryCatalog::new();
        let track = make_track(5, 100);
        catalog.add(track.clone(), vec![3_u8; 100]);
        let catalog = Arc::new(catalog);

        let download = Arc::new(Download::new(track, dir.path(), true));
        transfer_blocking(&download, &catalog);

        assert!(download.cleanup());
        assert!(download.complete_path().exists());
    }

    #[test]
    fn work_is_done_when_complete_file_exists_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let track = make_track(6, 100);
        let complete = dir.path().join(format!("{}.complete", track.id));
        std::fs::write(&complete, vec![4_u8; 100]).unwrap();

        let download = Download::new(track, dir.path(), false);
        assert!(download.is_work_done());
    }
}
