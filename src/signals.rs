// Cadenza -- Media streaming daemon with play-queue and download orchestration
// Copyright 2024 Ruud van Asseldonk
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// A copy of the License has been included in the root of the repository.

//! Mapping OS-level signals onto player operations.
//!
//! Remote control clients forward raw media-button key codes; the codes
//! are the Android `KeyEvent` ones, which is what every Bluetooth remote
//! and headset button ends up producing. The player itself has the entry
//! points (`on_media_key`, `on_headset_unplugged`, `on_storage_ejected`);
//! this module only knows the mapping.

/// A media-button press, already decoded from its key code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MediaKey {
    PlayPause,
    Play,
    Pause,
    Stop,
    Next,
    Previous,
}

/// Map a raw media-button key code to a key, if we handle it.
pub fn media_key_from_code(code: u32) -> Option<MediaKey> {
    match code {
        // KEYCODE_HEADSETHOOK: the single button on a wired headset acts
        // as play/pause.
        79 => Some(MediaKey::PlayPause),
        85 => Some(MediaKey::PlayPause),
        86 => Some(MediaKey::Stop),
        87 => Some(MediaKey::Next),
        88 => Some(MediaKey::Previous),
        126 => Some(MediaKey::Play),
        127 => Some(MediaKey::Pause),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::{MediaKey, media_key_from_code};

    #[test]
    fn known_key_codes_map_to_keys() {
        assert_eq!(media_key_from_code(79), Some(MediaKey::PlayPause));
        assert_eq!(media_key_from_code(85), Some(MediaKey::PlayPause));
        assert_eq!(media_key_from_code(86), Some(MediaKey::Stop));
        assert_eq!(media_key_from_code(87), Some(MediaKey::Next));
        assert_eq!(media_key_from_code(88), Some(MediaKey::Previous));
        assert_eq!(media_key_from_code(126), Some(MediaKey::Play));
        assert_eq!(media_key_from_code(127), Some(MediaKey::Pause));
    }

    #[test]
    fn unknown_key_codes_are_ignored() {
        assert_eq!(media_key_from_code(0), None);
        assert_eq!(media_key_from_code(23), None);
    }
}
