// Cadenza -- Media streaming daemon with play-queue and download orchestration
// Copyright 2024 Ruud van Asseldonk
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// A copy of the License has been included in the root of the repository.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::io;
use std::io::Read;
use std::path::Path;
use std::process;
use std::sync::{Arc, Mutex};
use std::thread;

use tiny_http::{Header, Request, Response, ResponseBox, Server};
use tiny_http::Method::{Delete, Get, Post, Put};

use cadenza::MediaCatalog;
use cadenza::config::Config;
use cadenza::error;
use cadenza::history::{NotificationSink, ScrobbleSink};
use cadenza::jukebox::JukeboxDevice;
use cadenza::playback::{ClockEngine, PlaybackState};
use cadenza::player::Player;
use cadenza::prim::{FileFormat, Millibel, QueueId, Track, TrackId};
use cadenza::queue::RepeatMode;
use cadenza::serialization;
use cadenza::shuffle::RadioCriteria;
use cadenza::signals;
use cadenza::snapshot::{FileSnapshotStore, SnapshotStore, sweep_orphans};

fn header_content_type(content_type: &str) -> Header {
    Header::from_bytes(&b"Content-Type"[..], content_type.as_bytes())
        .expect("Failed to create content-type header, value is not ascii.")
}

/// Derive a track id from the path of the file.
///
/// FNV-1a over the path bytes. The id only has to be stable across runs of
/// the daemon on the same library, so the persisted queue can find its
/// tracks back; it does not leave the machine.
fn track_id_for_path(path: &Path) -> TrackId {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    for byte in path.to_string_lossy().as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    TrackId(hash)
}

/// A catalog built from a walk over the library directory.
///
/// There is no tag parsing here: the title is the file stem, and the
/// `Artist/Album/Track` directory convention provides the rest. Duration
/// and bit rate are unknown without tags, which the player tolerates (the
/// buffering floor applies, and tracks end when skipped). A real
/// deployment would put a tag-indexing catalog behind the same trait.
struct FsCatalog {
    tracks: HashMap<TrackId, Track>,
    ids: Vec<TrackId>,
    rng: Mutex<cadenza::shuffle::Prng>,
}

impl FsCatalog {
    fn scan(library_path: &Path) -> FsCatalog {
        let wd = walkdir::WalkDir::new(library_path)
            .follow_links(true)
            .max_open(128);

        let mut tracks = HashMap::new();
        let mut ids = Vec::new();

        let files = wd
            .into_iter()
            .filter_map(|e| match e {
                Ok(entry) => Some(entry),
                Err(err) => {
                    eprintln!("Error while scanning library: {}", err);
                    None
                }
            })
            .filter(|e| e.file_type().is_file());

        for entry in files {
            let path = entry.into_path();
            let format = FileFormat::from_path(&path);
            if format == FileFormat::Unknown {
                continue;
            }

            let title = match path.file_stem() {
                Some(stem) => stem.to_string_lossy().into_owned(),
                None => continue,
            };
            let dir_name = |p: Option<&Path>| -> String {
                p.and_then(|d| d.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| String::from("Unknown"))
            };
            let album = dir_name(path.parent());
            let artist = dir_name(path.parent().and_then(|d| d.parent()));
            let size_bytes = fs::metadata(&path).ok().map(|m| m.len());

            let id = track_id_for_path(&path);
            let track = Track {
                id: id,
                path: path,
                title: title,
                artist: artist,
                album: album,
                duration_ms: 0,
                bitrate_kbps: 0,
                format: format,
                size_bytes: size_bytes,
            };
            tracks.insert(id, track);
            ids.push(id);
        }

        ids.sort();

        FsCatalog {
            tracks: tracks,
            ids: ids,
            rng: Mutex::new(cadenza::shuffle::new_prng()),
        }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn all_tracks(&self) -> Vec<Track> {
        let mut tracks: Vec<Track> = self.tracks.values().cloned().collect();
        tracks.sort_by(|a, b| a.path.cmp(&b.path));
        tracks
    }
}

impl MediaCatalog for FsCatalog {
    fn resolve(&self, id: TrackId) -> Option<Track> {
        self.tracks.get(&id).cloned()
    }

    fn exists(&self, id: TrackId) -> bool {
        self.tracks.contains_key(&id)
    }

    fn open(&self, id: TrackId) -> io::Result<Box<dyn Read + Send>> {
        let track = match self.tracks.get(&id) {
            Some(track) => track,
            None => return Err(io::Error::new(io::ErrorKind::NotFound, "No such track.")),
        };
        let file = fs::File::open(&track.path)?;
        Ok(Box::new(file))
    }

    fn random_tracks(&self, _criteria: &RadioCriteria, count: usize) -> Vec<Track> {
        // This catalog has no tag metadata, so the criteria cannot narrow
        // the draw; every track is a candidate.
        use rand::seq::SliceRandom;
        let mut rng = self.rng.lock().unwrap();
        self.ids
            .choose_multiple(&mut *rng, count)
            .filter_map(|id| self.tracks.get(id).cloned())
            .collect()
    }
}

/// Prints what would otherwise go to a notification area.
struct StdoutNotifications;

impl NotificationSink for StdoutNotifications {
    fn now_playing_changed(&self, track: Option<&Track>) {
        match track {
            Some(track) => println!("Now playing: {}", track),
            None => println!("Now playing: nothing"),
        }
    }

    fn playback_state_changed(&self, state: PlaybackState) {
        println!("Playback state: {}", state.as_str());
    }
}

/// Prints scrobbles instead of submitting them anywhere.
struct StdoutScrobbler;

impl ScrobbleSink for StdoutScrobbler {
    fn scrobble(&self, track: &Track, is_submission: bool) {
        match is_submission {
            false => println!("Scrobble (now playing): {}", track),
            true => println!("Scrobble (submission):  {}", track),
        }
    }
}

/// A jukebox device that logs instead of driving an output.
///
/// Stands in for the process that owns the sound card; the delegate logic
/// (mirroring, volume, transport) is the same either way.
struct LogJukeboxDevice;

impl JukeboxDevice for LogJukeboxDevice {
    fn set_playlist(&mut self, tracks: &[Track]) -> io::Result<()> {
        println!("Jukebox: playlist of {} tracks.", tracks.len());
        Ok(())
    }

    fn start(&mut self, index: usize, offset_seconds: u32) -> io::Result<()> {
        println!("Jukebox: start entry {} at {} s.", index, offset_seconds);
        Ok(())
    }

    fn stop(&mut self) -> io::Result<()> {
        println!("Jukebox: stop.");
        Ok(())
    }

    fn set_volume(&mut self, volume: Millibel) -> io::Result<()> {
        println!("Jukebox: volume {}.", volume);
        Ok(())
    }

    fn position_seconds(&self) -> u32 {
        0
    }
}

struct ControlServer {
    player: Player,
    catalog: Arc<FsCatalog>,
}

impl ControlServer {
    fn new(player: Player, catalog: Arc<FsCatalog>) -> ControlServer {
        ControlServer { player, catalog }
    }

    fn handle_not_found(&self) -> ResponseBox {
        Response::from_string("Not Found")
            .with_status_code(404) // "404 Not Found"
            .boxed()
    }

    fn handle_bad_request(&self, reason: &'static str) -> ResponseBox {
        Response::from_string(reason)
            .with_status_code(400) // "400 Bad Request"
            .boxed()
    }

    fn handle_ok(&self) -> ResponseBox {
        Response::from_string("{}")
            .with_header(header_content_type("application/json"))
            .boxed()
    }

    fn json_response(&self, buffer: Vec<u8>) -> ResponseBox {
        Response::from_data(buffer)
            .with_header(header_content_type("application/json"))
            .boxed()
    }

    fn handle_status(&self) -> ResponseBox {
        let status = self.player.status();
        let mut w = io::Cursor::new(Vec::new());
        serialization::write_status_json(&mut w, &status).unwrap();
        self.json_response(w.into_inner())
    }

    fn handle_queue(&self) -> ResponseBox {
        let entries = self.player.downloads();
        let mut w = io::Cursor::new(Vec::new());
        serialization::write_queue_json(&mut w, &entries[..]).unwrap();
        self.json_response(w.into_inner())
    }

    fn handle_tracks(&self) -> ResponseBox {
        let tracks = self.catalog.all_tracks();
        let mut w = io::Cursor::new(Vec::new());
        serialization::write_tracks_json(&mut w, &tracks[..]).unwrap();
        self.json_response(w.into_inner())
    }

    fn handle_enqueue(&self, id: &str, query: &str) -> ResponseBox {
        let track_id = match TrackId::parse(id) {
            Some(tid) => tid,
            None => return self.handle_bad_request("Invalid track id."),
        };
        let track = match self.catalog.resolve(track_id) {
            Some(t) => t,
            None => return self.handle_not_found(),
        };

        let mut save = false;
        let mut autoplay = false;
        let mut play_next = false;
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            match (k.as_ref(), v.as_ref()) {
                ("save", "true") => save = true,
                ("play", "now") => autoplay = true,
                ("play", "next") => play_next = true,
                _ => {}
            }
        }

        let queue_ids = self.player.download(vec![track], save, autoplay, play_next);
        let body = match queue_ids.first() {
            Some(queue_id) => format!(r#"{{"queue_id":"{}"}}"#, queue_id),
            None => String::from("{}"),
        };
        Response::from_string(body)
            .with_status_code(201) // "201 Created"
            .with_header(header_content_type("application/json"))
            .boxed()
    }

    fn handle_remove(&self, id: &str) -> ResponseBox {
        let queue_id = match QueueId::parse(id) {
            Some(qid) => qid,
            None => return self.handle_bad_request("Invalid queue id."),
        };
        self.player.remove(queue_id);
        self.handle_ok()
    }

    fn handle_play(&self, query: &str) -> ResponseBox {
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            if k == "index" {
                match v.parse::<usize>() {
                    Ok(index) => {
                        self.player.play_at(index);
                        return self.handle_ok();
                    }
                    Err(_) => return self.handle_bad_request("Invalid index."),
                }
            }
        }
        self.player.play();
        self.handle_ok()
    }

    fn handle_seek(&self, query: &str) -> ResponseBox {
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            if k == "ms" {
                match v.parse::<u64>() {
                    Ok(ms) => {
                        self.player.seek_to(ms);
                        return self.handle_ok();
                    }
                    Err(_) => break,
                }
            }
        }
        self.handle_bad_request("Expected ?ms=<position>.")
    }

    fn handle_media_key(&self, query: &str) -> ResponseBox {
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            if k == "code" {
                let key = match v.parse::<u32>().ok().and_then(signals::media_key_from_code) {
                    Some(key) => key,
                    None => return self.handle_bad_request("Unknown key code."),
                };
                self.player.on_media_key(key);
                return self.handle_ok();
            }
        }
        self.handle_bad_request("Expected ?code=<key code>.")
    }

    fn handle_repeat(&self, mode: &str) -> ResponseBox {
        match mode.parse::<RepeatMode>() {
            Ok(mode) => {
                self.player.set_repeat(mode);
                self.handle_ok()
            }
            Err(msg) => self.handle_bad_request(msg),
        }
    }

    fn handle_get_volume(&self) -> ResponseBox {
        let status = self.player.status();
        let mut w = io::Cursor::new(Vec::new());
        serialization::write_volume_json(&mut w, status.jukebox_volume).unwrap();
        self.json_response(w.into_inner())
    }

    fn handle_change_volume(&self, up: bool) -> ResponseBox {
        let volume = self.player.adjust_jukebox_volume(up);
        let mut w = io::Cursor::new(Vec::new());
        serialization::write_volume_json(&mut w, volume).unwrap();
        self.json_response(w.into_inner())
    }

    fn handle_request(&self, request: Request) {
        // Break url into the part before the ? and the part after. The part
        // before we split on slashes.
        let mut url_iter = request.url().splitn(2, '?');

        let mut p0 = None;
        let mut p1 = None;

        if let Some(base) = url_iter.next() {
            let mut parts = base.splitn(3, '/').filter(|x| x.len() > 0);

            p0 = parts.next();
            p1 = parts.next();
        }

        let query = url_iter.next().unwrap_or("");

        let response = match (request.method(), p0, p1) {
            (&Get, Some("status"), None) => self.handle_status(),
            (&Get, Some("queue"), None) => self.handle_queue(),
            (&Get, Some("tracks"), None) => self.handle_tracks(),

            (&Put, Some("queue"), Some(t)) => self.handle_enqueue(t, query),
            (&Delete, Some("queue"), Some(t)) => self.handle_remove(t),
            (&Post, Some("queue"), Some("clear")) => {
                self.player.clear();
                self.handle_ok()
            }
            (&Post, Some("queue"), Some("clear_incomplete")) => {
                self.player.clear_incomplete();
                self.handle_ok()
            }
            (&Post, Some("queue"), Some("shuffle")) => {
                self.player.shuffle();
                self.handle_ok()
            }
            (&Post, Some("queue"), Some("undo")) => {
                self.player.undo();
                self.handle_ok()
            }

            (&Post, Some("play"), None) => self.handle_play(query),
            (&Post, Some("pause"), None) => {
                self.player.pause();
                self.handle_ok()
            }
            (&Post, Some("toggle"), None) => {
                self.player.toggle_play_pause();
                self.handle_ok()
            }
            (&Post, Some("next"), None) => {
                self.player.next();
                self.handle_ok()
            }
            (&Post, Some("previous"), None) => {
                self.player.previous();
                self.handle_ok()
            }
            (&Post, Some("stop"), None) => {
                self.player.reset();
                self.handle_ok()
            }
            (&Post, Some("seek"), None) => self.handle_seek(query),
            (&Post, Some("key"), None) => self.handle_media_key(query),
            (&Post, Some("repeat"), Some(mode)) => self.handle_repeat(mode),

            (&Post, Some("radio"), Some("on")) => {
                self.player.set_shuffle_play(Some(RadioCriteria::default()));
                self.handle_ok()
            }
            (&Post, Some("radio"), Some("off")) => {
                self.player.set_shuffle_play(None);
                self.handle_ok()
            }

            (&Post, Some("jukebox"), Some("on")) => {
                self.player.set_jukebox_enabled(true);
                self.handle_ok()
            }
            (&Post, Some("jukebox"), Some("off")) => {
                self.player.set_jukebox_enabled(false);
                self.handle_ok()
            }

            // Volume control, volume up/down change the volume by 2 dB.
            (&Get, Some("volume"), None) => self.handle_get_volume(),
            (&Post, Some("volume"), Some("up")) => self.handle_change_volume(true),
            (&Post, Some("volume"), Some("down")) => self.handle_change_volume(false),

            (&Get, _, _) => self.handle_not_found(),
            _ => self.handle_bad_request("Unsupported request."),
        };

        match request.respond(response) {
            Ok(()) => {}
            Err(err) => println!("Error while responding to request: {:?}", err),
        }
    }
}

fn serve(bind: &str, service: Arc<ControlServer>) {
    let server = match Server::http(bind) {
        Ok(server) => Arc::new(server),
        Err(err) => {
            eprintln!("Failed to start server on {}: {}", bind, err);
            process::exit(1);
        }
    };

    // The control surface serves one or two remotes, not a crowd; a small
    // pool of handler threads is plenty.
    let n_threads = 4;
    let mut threads = Vec::with_capacity(n_threads);

    for i in 0..n_threads {
        let server_i = server.clone();
        let service_i = service.clone();
        let name = format!("http_server_{}", i);
        let builder = thread::Builder::new().name(name);
        let join_handle = builder
            .spawn(move || {
                loop {
                    let request = match server_i.recv() {
                        Ok(rq) => rq,
                        Err(e) => {
                            println!("Error: {:?}", e);
                            break;
                        }
                    };
                    service_i.handle_request(request);
                }
            })
            .unwrap();
        threads.push(join_handle);
    }

    // Block until all threads have stopped, which only happens in case of an
    // error on all of them.
    for thread in threads.drain(..) {
        thread.join().unwrap();
    }
}

fn print_usage() {
    println!("Usage:\n");
    println!("  cadenza serve cadenza.conf");
    println!("  cadenza sweep cadenza.conf");
    println!("
serve -- Start the daemon.
sweep -- Delete downloaded files that the persisted queue does not reference.");
}

fn load_config(config_fname: &str) -> error::Result<Config> {
    let f = fs::File::open(config_fname)?;
    let buf_reader = io::BufReader::new(f);
    let lines: io::Result<Vec<String>> = io::BufRead::lines(buf_reader).collect();
    Config::parse(lines?.iter())
}

fn serve_main(config: Config) {
    if let Err(err) = fs::create_dir_all(&config.download_path) {
        eprintln!("Failed to create download directory: {}", err);
        process::exit(1);
    }

    let catalog = Arc::new(FsCatalog::scan(&config.library_path));
    println!("Catalog has {} tracks.", catalog.len());

    let (engine_events_sender, engine_events) = crossbeam::channel::unbounded();
    let engine = Box::new(ClockEngine::new(engine_events_sender));
    let store = Arc::new(FileSnapshotStore::new(config.state_path.clone()));

    println!("Starting server on {}.", config.listen);
    let listen = config.listen.clone();
    let player = Player::new(
        config,
        catalog.clone(),
        engine,
        engine_events,
        Box::new(LogJukeboxDevice),
        store,
        Box::new(StdoutNotifications),
        Box::new(StdoutScrobbler),
    );

    let service = ControlServer::new(player, catalog);
    serve(&listen, Arc::new(service));
}

fn sweep_main(config: Config) {
    let store = FileSnapshotStore::new(config.state_path.clone());
    let referenced = match store.load() {
        Ok(Some(snapshot)) => snapshot.entries.iter().map(|e| e.id).collect(),
        Ok(None) => std::collections::HashSet::new(),
        Err(err) => {
            eprintln!("Ignoring unreadable queue snapshot: {}", err);
            std::collections::HashSet::new()
        }
    };
    let n_deleted = sweep_orphans(&config.download_path, &referenced);
    println!("Deleted {} orphaned files.", n_deleted);
}

fn main() {
    if env::args().len() < 3 {
        print_usage();
        process::exit(1);
    }

    let cmd = env::args().nth(1).unwrap();
    let config_path = env::args().nth(2).unwrap();
    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load {}: {}", config_path, err);
            process::exit(1);
        }
    };
    println!("Configuration:\n{}\n", config);

    match &cmd[..] {
        "serve" => serve_main(config),
        "sweep" => sweep_main(config),
        _ => {
            print_usage();
            process::exit(1);
        }
    }
}
