//! Download cache: materializes remote tracks into local files, reference
//! counts their consumers and evicts unreferenced files in batches.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use cadenzalib::track::{TrackId, TrackService};

use crate::error::{Error, Result};

/// Sweep threshold: disk is touched on every `REMOVE_LIMIT + 1`-th delete.
/// Tests depend on this exact cadence.
pub const REMOVE_LIMIT: u32 = 11;

const DEFAULT_FORMAT: &str = ".m4a";

/// What the engine needs to materialize a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub id: TrackId,
    pub source: String,
    pub service: TrackService,
}

impl From<&cadenzalib::track::Track> for DownloadRequest {
    fn from(track: &cadenzalib::track::Track) -> Self {
        Self {
            id: track.id.clone(),
            source: track.url.clone(),
            service: track.service,
        }
    }
}

/// Engine-facing seam of the download cache.
#[async_trait]
pub trait Download: Send + Sync {
    async fn download(&self, request: &DownloadRequest) -> Result<PathBuf>;
    fn delete(&self, path: &Path) -> Result<()>;
}

struct CacheState {
    /// local file path -> number of queued/playing consumers
    counter: HashMap<PathBuf, i64>,
    remove_counter: u32,
}

pub struct Downloader {
    youtube: YtDlp,
    state: parking_lot::Mutex<CacheState>,
    pwd: PathBuf,
}

impl Downloader {
    /// Erases and recreates `output_dir` so no orphan files from a previous
    /// run survive, then records the working directory used to absolutize
    /// candidate paths.
    pub fn new(output_dir: &Path) -> Result<Self> {
        if output_dir.exists() {
            std::fs::remove_dir_all(output_dir)?;
        }
        std::fs::create_dir_all(output_dir)?;

        Ok(Self {
            youtube: YtDlp {
                output_dir: output_dir.to_path_buf(),
            },
            state: parking_lot::Mutex::new(CacheState {
                counter: HashMap::with_capacity(REMOVE_LIMIT as usize + 1),
                remove_counter: 0,
            }),
            pwd: std::env::current_dir()?,
        })
    }

    fn absolutize(&self, path: PathBuf) -> PathBuf {
        if path.is_absolute() {
            path
        } else {
            self.pwd.join(path)
        }
    }

    fn sweep(state: &mut CacheState) -> Result<()> {
        if state.remove_counter < REMOVE_LIMIT {
            state.remove_counter += 1;
            return Ok(());
        }

        state.remove_counter = 0;
        let mut broken = Vec::new();
        state.counter.retain(|path, count| {
            if *count > 0 {
                return true;
            }
            if let Err(err) = std::fs::remove_file(path) {
                broken.push(format!("{} - {err}", path.display()));
            }
            false
        });

        if broken.is_empty() {
            Ok(())
        } else {
            Err(Error::BrokenFiles(broken.join(", ")))
        }
    }
}

#[async_trait]
impl Download for Downloader {
    async fn download(&self, request: &DownloadRequest) -> Result<PathBuf> {
        match request.service {
            TrackService::Youtube => {
                let candidate = self
                    .absolutize(self.youtube.target_path(&request.id));
                {
                    let mut state = self.state.lock();
                    if let Some(count) = state.counter.get_mut(&candidate) {
                        *count += 1;
                        return Ok(candidate);
                    }
                }

                let source = self
                    .absolutize(self.youtube.fetch(request.id.external_id()).await?);
                *self.state.lock().counter.entry(source.clone()).or_insert(0) += 1;
                Ok(source)
            }
            TrackService::Vk => Err(Error::ServiceUnknown),
        }
    }

    /// Decrement the consumer count for `path` (never below zero), then run
    /// the batched sweep.
    fn delete(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(count) = state.counter.get_mut(path) {
            if *count > 0 {
                *count -= 1;
            }
        }
        Self::sweep(&mut state)
    }
}

struct YtDlp {
    output_dir: PathBuf,
}

impl YtDlp {
    /// Deterministic landing path for an already-downloaded track.
    fn target_path(&self, id: &TrackId) -> PathBuf {
        self.output_dir.join(format!("{id}{DEFAULT_FORMAT}"))
    }

    /// Fetch the best m4a under 200 kbps; stdout yields the final path.
    async fn fetch(&self, video_id: &str) -> Result<PathBuf> {
        let output = Command::new("yt-dlp")
            .arg("-f")
            .arg("ba[ext=m4a][abr<200]")
            .arg("-q")
            .arg("--print")
            .arg("after_move:filepath")
            .arg("-o")
            .arg(format!(
                "{}/youtube_%(id)s.%(ext)s",
                self.output_dir.display()
            ))
            .arg(video_id)
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: "yt-dlp",
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let path = String::from_utf8_lossy(&output.stdout);
        Ok(PathBuf::from(path.trim_end_matches('\n')))
    }
}
