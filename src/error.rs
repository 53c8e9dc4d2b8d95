// Cadenza -- Media streaming daemon with play-queue and download orchestration
// Copyright 2024 Ruud van Asseldonk
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// A copy of the License has been included in the root of the repository.

use std::fmt;
use std::io;
use std::result;

#[derive(Debug)]
pub enum Error {
    /// Error in config file on a given line.
    InvalidConfig(usize, &'static str),

    /// A key is missing in the config.
    IncompleteConfig(&'static str),

    /// Error in a persisted queue snapshot on a given line.
    ///
    /// Callers treat a snapshot that fails to parse as "no saved state", so
    /// this error never makes it past the startup restore.
    InvalidSnapshot(usize, &'static str),

    /// IO error.
    IoError(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidConfig(lineno, msg) => {
                write!(f, "Invalid config on line {}: {}", lineno + 1, msg)
            }
            Error::IncompleteConfig(msg) => {
                write!(f, "Incomplete config: {}", msg)
            }
            Error::InvalidSnapshot(lineno, msg) => {
                write!(f, "Invalid queue snapshot on line {}: {}", lineno + 1, msg)
            }
            Error::IoError(err) => {
                write!(f, "IO error: {}", err)
            }
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IoError(err)
    }
}

pub type Result<T> = result::Result<T, Error>;
