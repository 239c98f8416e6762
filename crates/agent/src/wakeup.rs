//! Wake-word greeting cache
//!
//! Greeting audio is cached as WAV files keyed by voice identity so the
//! wake word answers instantly instead of waiting on synthesis. Entries
//! older than the refresh window trigger an asynchronous regeneration; the
//! stale clip still plays while the new one is produced.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use voice_gateway_pipeline::codec::{load_wav_as_opus_frames, OpusStreamDecoder, SAMPLE_RATE};
use voice_gateway_pipeline::TtsEngine;

/// Seconds a cached greeting stays fresh.
pub const REFRESH_TIME: Duration = Duration::from_secs(10);

/// Canned greetings rotated through on refresh.
pub const RESPONSES: [&str; 9] = [
    "我一直都在呢，您请说。",
    "在的呢，请随时吩咐我。",
    "来啦来啦，请告诉我吧。",
    "您请说，我正听着。",
    "请您讲话，我准备好了。",
    "请您说出指令吧。",
    "我认真听着呢，请讲。",
    "请问您需要什么帮助？",
    "我在这里，等候您的指令。",
];

#[derive(Clone)]
pub struct CachedGreeting {
    pub frames: Vec<Vec<u8>>,
    pub text: String,
    pub stale: bool,
}

#[derive(Clone)]
struct Entry {
    file: PathBuf,
    text: String,
    written: SystemTime,
}

pub struct WakeupCache {
    dir: PathBuf,
    entries: Mutex<HashMap<String, Entry>>,
    refreshing: AtomicBool,
}

impl WakeupCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(err) = std::fs::create_dir_all(&dir) {
            tracing::warn!(dir = %dir.display(), error = %err, "wakeup cache dir unavailable");
        }
        let cache = Self {
            dir,
            entries: Mutex::new(HashMap::new()),
            refreshing: AtomicBool::new(false),
        };
        cache.scan_existing();
        cache
    }

    fn scan_existing(&self) {
        let Ok(read) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let mut entries = self.entries.lock();
        for file in read.flatten() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wav") {
                continue;
            }
            let Some(voice) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let written = file
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            entries.insert(
                voice.to_string(),
                Entry {
                    file: path,
                    // Text sidecar is not persisted; a rescan falls back to
                    // the first canned response.
                    text: RESPONSES[0].to_string(),
                    written,
                },
            );
        }
    }

    /// Cached greeting for a voice, if one exists on disk.
    pub fn get(&self, voice: &str) -> Option<CachedGreeting> {
        let entry = self.entries.lock().get(voice).cloned()?;
        let frames = load_wav_as_opus_frames(&entry.file).ok()?;
        let stale = entry
            .written
            .elapsed()
            .map(|age| age > REFRESH_TIME)
            .unwrap_or(true);
        Some(CachedGreeting {
            frames,
            text: entry.text,
            stale,
        })
    }

    fn file_path(&self, voice: &str) -> PathBuf {
        self.dir.join(format!("{voice}.wav"))
    }

    fn store(&self, voice: &str, path: PathBuf, text: String) {
        self.entries.lock().insert(
            voice.to_string(),
            Entry {
                file: path,
                text,
                written: SystemTime::now(),
            },
        );
    }

    /// Regenerate the greeting for a voice in the background. At most one
    /// refresh runs at a time process-wide.
    pub fn spawn_refresh(self: &Arc<Self>, engine: Arc<dyn TtsEngine>, voice: String) {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let cache = self.clone();
        tokio::spawn(async move {
            let text = RESPONSES
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or(RESPONSES[0])
                .to_string();
            match engine.synthesize(&text).await {
                Ok(frames) => {
                    let path = cache.file_path(&voice);
                    match write_frames_as_wav(&frames, &path) {
                        Ok(()) => {
                            cache.store(&voice, path, text);
                            tracing::debug!(voice = %voice, "wakeup greeting refreshed");
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "greeting cache write failed")
                        }
                    }
                }
                Err(err) => tracing::warn!(error = %err, "greeting synthesis failed"),
            }
            cache.refreshing.store(false, Ordering::Release);
        });
    }
}

fn write_frames_as_wav(frames: &[Vec<u8>], path: &Path) -> Result<(), String> {
    let mut decoder = OpusStreamDecoder::new().map_err(|e| e.to_string())?;
    let mut samples = Vec::new();
    for frame in frames {
        match decoder.decode(frame) {
            Ok(pcm) => samples.extend(pcm),
            Err(err) => tracing::debug!(error = %err, "greeting frame skipped"),
        }
    }
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).map_err(|e| e.to_string())?;
    for sample in samples {
        writer.write_sample(sample).map_err(|e| e.to_string())?;
    }
    writer.finalize().map_err(|e| e.to_string())
}
