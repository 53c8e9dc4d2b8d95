// Cadenza -- Media streaming daemon with play-queue and download orchestration
// Copyright 2024 Ruud van Asseldonk
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// A copy of the License has been included in the root of the repository.

//! Configuration file parser.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::queue::RepeatMode;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub library_path: PathBuf,
    pub download_path: PathBuf,
    /// Where the queue snapshot lives, defaults to `queue.state` in the
    /// download directory.
    pub state_path: PathBuf,
    /// How many tracks past the current one to download ahead of playback.
    pub preload_count: u32,
    /// Cap on the download transfer rate, in kbit per second.
    pub download_rate_limit_kbps: Option<u32>,
    pub repeat: RepeatMode,
    /// "Previous" restarts the current track instead of moving back when
    /// this much of it has played. The 5-second value matches what remote
    /// control clients expect; it is configurable, not universal.
    pub previous_restart_ms: u64,
    /// A track that ends this close to its known duration while its file is
    /// still partial counts as fully played. Works around render engines
    /// that report end-of-stream slightly early on growing files.
    pub end_grace_ms: u64,
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "  listen                   = {}\n", self.listen)?;
        write!(f, "  library_path             = {}\n", self.library_path.to_string_lossy())?;
        write!(f, "  download_path            = {}\n", self.download_path.to_string_lossy())?;
        write!(f, "  state_path               = {}\n", self.state_path.to_string_lossy())?;
        write!(f, "  preload_count            = {}\n", self.preload_count)?;
        match self.download_rate_limit_kbps {
            Some(kbps) => write!(f, "  download_rate_limit_kbps = {}\n", kbps)?,
            None => write!(f, "  download_rate_limit_kbps is not set\n")?,
        }
        write!(f, "  repeat                   = {}\n", self.repeat)?;
        write!(f, "  previous_restart_ms      = {}\n", self.previous_restart_ms)?;
        write!(f, "  end_grace_ms             = {}", self.end_grace_ms)?;
        Ok(())
    }
}

impl Config {
    pub fn parse<I, S>(lines: I) -> Result<Config>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut listen = None;
        let mut library_path = None;
        let mut download_path = None;
        let mut state_path = None;
        let mut preload_count = 3;
        let mut download_rate_limit_kbps = None;
        let mut repeat = RepeatMode::Off;
        let mut previous_restart_ms = 5_000;
        let mut end_grace_ms = 10_000;

        for (lineno, line_raw) in lines.into_iter().enumerate() {
            let line = line_raw.as_ref();

            // Allow empty lines in the config file.
            if line.len() == 0 {
                continue
            }

            // Skip lines starting with '#' to allow comments.
            if line.starts_with("#") {
                continue
            }

            if let Some(n) = line.find('=') {
                let key = line[..n].trim();
                let value = line[n + 1..].trim();
                match key {
                    "listen" => listen = Some(String::from(value)),
                    "library_path" => library_path = Some(PathBuf::from(value)),
                    "download_path" => download_path = Some(PathBuf::from(value)),
                    "state_path" => state_path = Some(PathBuf::from(value)),
                    "preload_count" => match u32::from_str(value) {
                        Ok(count) => preload_count = count,
                        Err(_) => {
                            let msg = "Invalid preload_count value, must be an integer.";
                            return Err(Error::InvalidConfig(lineno, msg));
                        }
                    }
                    "download_rate_limit_kbps" => match u32::from_str(value) {
                        Ok(kbps) if kbps > 0 => download_rate_limit_kbps = Some(kbps),
                        Ok(_) => download_rate_limit_kbps = None,
                        Err(_) => {
                            let msg = "Invalid download_rate_limit_kbps value, \
                                must be an integer number of kbit per second.";
                            return Err(Error::InvalidConfig(lineno, msg));
                        }
                    }
                    "repeat" => match RepeatMode::from_str(value) {
                        Ok(mode) => repeat = mode,
                        Err(msg) => return Err(Error::InvalidConfig(lineno, msg)),
                    }
                    "previous_restart_ms" => match u64::from_str(value) {
                        Ok(ms) => previous_restart_ms = ms,
                        Err(_) => {
                            let msg = "Invalid previous_restart_ms value, must be an integer.";
                            return Err(Error::InvalidConfig(lineno, msg));
                        }
                    }
                    "end_grace_ms" => match u64::from_str(value) {
                        Ok(ms) => end_grace_ms = ms,
                        Err(_) => {
                            let msg = "Invalid end_grace_ms value, must be an integer.";
                            return Err(Error::InvalidConfig(lineno, msg));
                        }
                    }
                    _ => {
                        let msg = "Unknown key. See the configuration docs for supported keys.";
                        return Err(Error::InvalidConfig(lineno, msg))
                    }
                }
            } else {
                let msg = "Line contains no '='. \
                    Expected key-value pair like 'preload_count = 3'.";
                return Err(Error::InvalidConfig(lineno, msg))
            }
        }

        let download_path = match download_path {
            Some(p) => p,
            None => return Err(Error::IncompleteConfig(
                "Download path not set. Expected 'download_path ='-line."
            )),
        };

        let config = Config {
            listen: match listen {
                Some(b) => b,
                None => String::from("0.0.0.0:8323"),
            },
            library_path: match library_path {
                Some(p) => p,
                None => return Err(Error::IncompleteConfig(
                    "Library path not set. Expected 'library_path ='-line."
                )),
            },
            state_path: match state_path {
                Some(p) => p,
                None => download_path.join("queue.state"),
            },
            download_path: download_path,
            preload_count: preload_count,
            download_rate_limit_kbps: download_rate_limit_kbps,
            repeat: repeat,
            previous_restart_ms: previous_restart_ms,
            end_grace_ms: end_grace_ms,
        };

        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;
    use super::Config;
    use crate::queue::RepeatMode;

    #[test]
    pub fn config_can_be_parsed() {
        let config_lines = [
            "# This is a comment.",
            "listen = localhost:8000",
            "library_path = /home/user/music",
            "download_path = /home/user/.cache/cadenza",
            "",
            "preload_count = 5",
            "download_rate_limit_kbps = 320",
            "repeat = all",
        ];
        let config = Config::parse(&config_lines).unwrap();
        assert_eq!(&config.listen[..], "localhost:8000");
        assert_eq!(config.library_path.as_path(), Path::new("/home/user/music"));
        assert_eq!(config.download_path.as_path(), Path::new("/home/user/.cache/cadenza"));
        assert_eq!(
            config.state_path.as_path(),
            Path::new("/home/user/.cache/cadenza/queue.state"),
        );
        assert_eq!(config.preload_count, 5);
        assert_eq!(config.download_rate_limit_kbps, Some(320));
        assert_eq!(config.repeat, RepeatMode::All);
    }

    #[test]
    pub fn config_defaults_apply() {
        let config_lines = [
            "library_path = /music",
            "download_path = /cache",
        ];
        let config = Config::parse(&config_lines).unwrap();
        assert_eq!(&config.listen[..], "0.0.0.0:8323");
        assert_eq!(config.preload_count, 3);
        assert_eq!(config.download_rate_limit_kbps, None);
        assert_eq!(config.repeat, RepeatMode::Off);
        assert_eq!(config.previous_restart_ms, 5_000);
        assert_eq!(config.end_grace_ms, 10_000);
    }

    #[test]
    pub fn config_reports_missing_required_keys() {
        let config_lines = ["library_path = /music"];
        assert!(Config::parse(&config_lines).is_err());
    }

    #[test]
    pub fn config_reports_invalid_lines() {
        let config_lines = [
            "library_path = /music",
            "download_path = /cache",
            "preload_count = many",
        ];
        assert!(Config::parse(&config_lines).is_err());
    }
}
