// Cadenza -- Media streaming daemon with play-queue and download orchestration
// Copyright 2024 Ruud van Asseldonk
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// A copy of the License has been included in the root of the repository.

//! Gating playback start on buffered data.
//!
//! Starting the render engine on a nearly-empty partial file means an
//! immediate underrun, so a play request first goes through a buffer task
//! that waits for enough bytes to accumulate. "Enough" is a few seconds of
//! audio at the track's bit rate, with a floor for tracks whose bit rate we
//! do not know, counted from the byte offset where playback will start:
//! when playback resumes mid-file, the bytes before that point do not help.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::download::Download;

/// Minimum number of buffered bytes before playback may start.
pub const BUFFER_FLOOR_BYTES: u64 = 100_000;

/// How many seconds of audio, at the track's bit rate, to buffer ahead.
pub const BUFFER_WINDOW_SECONDS: u64 = 5;

/// How long to wait between checks of the partial file.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How the wait for buffered data ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BufferOutcome {
    /// Enough bytes are buffered, or the file is complete.
    Ready,
    /// The download will never produce more bytes; give up on the track.
    Failed,
}

/// The number of buffered bytes to wait for.
pub fn threshold_bytes(bitrate_kbps: u32) -> u64 {
    let window = (bitrate_kbps as u64) * 1024 / 8 * BUFFER_WINDOW_SECONDS;
    BUFFER_FLOOR_BYTES.max(window)
}

/// A cancellable wait for a download to buffer enough data.
///
/// Cancellation is cooperative, checked once per poll interval. A
/// cancelled task exits without invoking its callback.
pub struct BufferTask {
    cancel: Arc<AtomicBool>,
    join_handle: JoinHandle<()>,
}

impl BufferTask {
    pub fn spawn(
        download: Arc<Download>,
        start_ms: u64,
        on_done: Box<dyn FnOnce(BufferOutcome) + Send>,
    ) -> BufferTask {
        let cancel = Arc::new(AtomicBool::new(false));

        let cancel_for_task = cancel.clone();
        let builder = thread::Builder::new().name("buffer".into());
        let join_handle = builder
            .spawn(move || {
                if let Some(outcome) = wait_for_buffer(&download, start_ms, &cancel_for_task) {
                    on_done(outcome);
                }
            })
            .expect("Failed to spawn buffer thread.");

        BufferTask { cancel, join_handle }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Wait for the task to exit. Mostly useful in tests; the player just
    /// cancels superseded tasks and lets them wind down on their own.
    pub fn join(self) {
        self.join_handle.join().unwrap();
    }
}

fn wait_for_buffer(
    download: &Download,
    start_ms: u64,
    cancel: &AtomicBool,
) -> Option<BufferOutcome> {
    let track = download.track();
    let start_bytes = match track.bitrate_kbps {
        // Without a bit rate there is no way to convert the start position
        // to bytes; measure from wherever the file is right now instead.
        0 => download.downloaded_bytes(),
        kbps => start_ms * (kbps as u64) * 1024 / 8 / 1000,
    };
    let mut target = start_bytes.saturating_add(threshold_bytes(track.bitrate_kbps));
    if let Some(size) = track.size_bytes {
        // Never wait for more bytes than the file will ever have.
        target = target.min(size);
    }

    loop {
        if cancel.load(Ordering::SeqCst) {
            return None;
        }
        if download.is_work_done() {
            return Some(BufferOutcome::Ready);
        }
        if download.downloaded_bytes() >= target {
            return Some(BufferOutcome::Ready);
        }
        if download.is_permanently_failed() {
            return Some(BufferOutcome::Failed);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use crossbeam::channel;

    use crate::download::Download;
    use crate::download::test::make_track;
    use super::{BUFFER_FLOOR_BYTES, BufferOutcome, BufferTask, threshold_bytes};

    #[test]
    fn threshold_has_a_floor_for_low_bitrates() {
        // 128 kbps over a 5 second window is 81920 bytes, below the floor.
        assert_eq!(threshold_bytes(128), BUFFER_FLOOR_BYTES);
        assert_eq!(threshold_bytes(0), BUFFER_FLOOR_BYTES);
    }

    #[test]
    fn threshold_scales_with_the_bitrate() {
        assert_eq!(threshold_bytes(320), 320 * 1024 / 8 * 5);
    }

    #[test]
    fn task_reports_ready_for_a_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let track = make_track(1, 100);
        let complete = dir.path().join(format!("{}.complete", track.id));
        std::fs::write(&complete, vec![0_u8; 100]).unwrap();

        let download = Arc::new(Download::new(track, dir.path(), false));
        let (tx, rx) = channel::bounded(1);
        let task = BufferTask::spawn(
            download,
            0,
            Box::new(move |outcome| tx.send(outcome).unwrap()),
        );
        task.join();
        assert_eq!(rx.try_recv(), Ok(BufferOutcome::Ready));
    }

    #[test]
    fn task_reports_ready_when_the_partial_file_is_large_enough() {
        let dir = tempfile::tempdir().unwrap();
        // 200 kB on disk exceeds the 100 kB threshold for a 128 kbps track.
        let track = make_track(2, 500_000);
        let partial = dir.path().join(format!("{}.partial", track.id));
        std::fs::write(&partial, vec![0_u8; 200_000]).unwrap();

        let download = Arc::new(Download::new(track, dir.path(), false));
        let (tx, rx) = channel::bounded(1);
        let task = BufferTask::spawn(
            download,
            0,
            Box::new(move |outcome| tx.send(outcome).unwrap()),
        );
        task.join();
        assert_eq!(rx.try_recv(), Ok(BufferOutcome::Ready));
    }

    #[test]
    fn cancelled_task_never_invokes_the_callback() {
        let dir = tempfile::tempdir().unwrap();
        let track = make_track(3, 500_000);
        let download = Arc::new(Download::new(track, dir.path(), false));

        let (tx, rx) = channel::bounded(1);
        let task = BufferTask::spawn(
            download,
            0,
            Box::new(move |outcome: BufferOutcome| tx.send(outcome).unwrap()),
        );
        task.cancel();
        task.join();
        assert!(rx.try_recv().is_err());
    }
}
