// Cadenza -- Media streaming daemon with play-queue and download orchestration
// Copyright 2024 Ruud van Asseldonk
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// A copy of the License has been included in the root of the repository.

//! Mirroring playback to a server-side audio device.
//!
//! In jukebox mode the machine running the daemon renders the audio, for
//! the living-room setup where the server is plugged into the amplifier
//! and the phone is just a remote. The local render engine is bypassed
//! entirely; instead the queue is mirrored to the device on every change,
//! and transport operations are forwarded. Device errors are logged and
//! swallowed: an amplifier that is switched off must not take the player
//! state machine down with it.

use std::io;

use crate::prim::{Millibel, Track};

/// The server-side audio device that jukebox mode drives.
pub trait JukeboxDevice: Send {
    /// Replace the device's playlist with these tracks, in order.
    fn set_playlist(&mut self, tracks: &[Track]) -> io::Result<()>;

    /// Start playing the playlist entry at `index` from `offset_seconds`.
    fn start(&mut self, index: usize, offset_seconds: u32) -> io::Result<()>;

    /// Stop rendering.
    fn stop(&mut self) -> io::Result<()>;

    fn set_volume(&mut self, volume: Millibel) -> io::Result<()>;

    /// Position in the currently rendering entry. Second granularity is
    /// all the devices offer, and all the remote needs.
    fn position_seconds(&self) -> u32;
}

/// Volume change per up/down step.
const VOLUME_STEP: Millibel = Millibel(200);

/// Initial jukebox volume, roughly a 75% gain.
const DEFAULT_VOLUME: Millibel = Millibel(-250);

/// The remote playback delegate: owns the device and the enabled flag.
pub struct Jukebox {
    device: Box<dyn JukeboxDevice>,
    enabled: bool,
    volume: Millibel,
}

impl Jukebox {
    pub fn new(device: Box<dyn JukeboxDevice>) -> Jukebox {
        Jukebox {
            device: device,
            enabled: false,
            volume: DEFAULT_VOLUME,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn volume(&self) -> Millibel {
        self.volume
    }

    /// Take over playback: push the queue and the volume to the device.
    pub fn enable(&mut self, tracks: &[Track]) {
        self.enabled = true;
        let volume = self.volume;
        self.log_err("set_volume", |dev| dev.set_volume(volume));
        self.push_playlist(tracks);
    }

    /// Give playback back to the local engine.
    pub fn disable(&mut self) {
        self.stop();
        self.enabled = false;
    }

    /// Mirror the queue to the device. A no-op while disabled.
    pub fn push_playlist(&mut self, tracks: &[Track]) {
        if !self.enabled {
            return;
        }
        self.log_err("set_playlist", |dev| dev.set_playlist(tracks));
    }

    pub fn start(&mut self, index: usize, offset_ms: u64) {
        let offset_seconds = (offset_ms / 1000) as u32;
        self.log_err("start", |dev| dev.start(index, offset_seconds));
    }

    pub fn stop(&mut self) {
        self.log_err("stop", |dev| dev.stop());
    }

    /// Step the volume up or down, returning the new value.
    pub fn adjust_volume(&mut self, up: bool) -> Millibel {
        let new_volume = match up {
            true => Millibel(self.volume.0 + VOLUME_STEP.0),
            false => Millibel(self.volume.0 - VOLUME_STEP.0),
        };
        self.volume = new_volume.clamp_to_range();
        let volume = self.volume;
        self.log_err("set_volume", |dev| dev.set_volume(volume));
        self.volume
    }

    pub fn position_ms(&self) -> u64 {
        (self.device.position_seconds() as u64) * 1000
    }

    fn log_err<F: FnOnce(&mut dyn JukeboxDevice) -> io::Result<()>>(
        &mut self,
        what: &'static str,
        f: F,
    ) {
        if let Err(err) = f(&mut *self.device) {
            eprintln!("Jukebox device error during {}: {}", what, err);
        }
    }
}
