//! Lockfile-based recovery of partially written images.
//!
//! The moment a raw buffer lands in daemon memory, a sidecar lockfile is
//! written next to the intended output path: a self-describing JSON document
//! holding the exposure number, controller and detector names, frame
//! metadata, the full header, the target path, and the pixel payload itself
//! (base64, little-endian). The lockfile is removed only after the FITS file
//! has been renamed into place.
//!
//! On daemon start (and on an explicit `recover` request) any lockfiles
//! found are replayed: the embedded frame is written to the final path and
//! the lockfile removed. No live controller is needed, so recovery works
//! even when the hardware that produced the frame is gone.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::controller::frame::FrameData;
use crate::core::{FitsHeader, FrameWriter, Reporter};
use crate::error::{ArchonError, ArchonResult};
use crate::storage;

/// Everything needed to reconstruct one output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockfilePayload {
    pub exposure_no: u64,
    pub controller: String,
    pub ccd: String,
    pub buffer: u8,
    pub frame_number: u64,
    pub width: usize,
    pub height: usize,
    pub bits_per_pixel: u8,
    pub filename: PathBuf,
    pub header: FitsHeader,
    /// Base64 of the row-major little-endian pixel payload.
    pub pixels: String,
}

impl LockfilePayload {
    pub fn new(
        exposure_no: u64,
        controller: &str,
        ccd: &str,
        buffer: u8,
        frame_number: u64,
        data: &FrameData,
        header: FitsHeader,
        filename: PathBuf,
    ) -> Self {
        let (height, width) = data.dim();
        Self {
            exposure_no,
            controller: controller.to_string(),
            ccd: ccd.to_string(),
            buffer,
            frame_number,
            width,
            height,
            bits_per_pixel: data.bits_per_pixel(),
            filename,
            header,
            pixels: BASE64.encode(data.to_le_bytes()),
        }
    }

    /// Decodes the embedded pixel payload back into a frame.
    pub fn frame_data(&self) -> ArchonResult<FrameData> {
        let bytes = BASE64
            .decode(&self.pixels)
            .map_err(|err| ArchonError::Persist(format!("corrupt lockfile payload: {err}")))?;
        FrameData::from_le_bytes(
            &bytes,
            self.width,
            self.height,
            usize::from(self.bits_per_pixel / 8),
        )
    }

    /// The lockfile path for this payload's target file.
    pub fn lock_path(&self) -> PathBuf {
        lock_path(&self.filename)
    }
}

/// `<target>.lock`.
pub fn lock_path(filename: &Path) -> PathBuf {
    let mut os = filename.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

/// Writes, removes, and replays lockfiles.
pub struct ExposureRecovery {
    writer: Arc<dyn FrameWriter>,
    reporter: Reporter,
}

impl ExposureRecovery {
    pub fn new(writer: Arc<dyn FrameWriter>, reporter: Reporter) -> Self {
        Self { writer, reporter }
    }

    /// Creates (or overwrites) the lockfile for a payload.
    pub async fn record(&self, payload: &LockfilePayload) -> ArchonResult<PathBuf> {
        let path = payload.lock_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = serde_json::to_vec(payload)
            .map_err(|err| ArchonError::Persist(format!("serialising lockfile: {err}")))?;
        tokio::fs::write(&path, text).await?;
        self.reporter
            .log(
                Some(&payload.controller),
                &format!("created lockfile {}", path.display()),
            )
            .await;
        Ok(path)
    }

    /// Removes the lockfile once its FITS file is in place. With
    /// `force = false` the target must exist.
    pub async fn release(&self, filename: &Path, force: bool) -> ArchonResult<()> {
        if !force && !tokio::fs::try_exists(filename).await.unwrap_or(false) {
            return Err(ArchonError::Persist(format!(
                "{} does not exist; keeping its lockfile",
                filename.display()
            )));
        }
        let lock = lock_path(filename);
        match tokio::fs::remove_file(&lock).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Finds all lockfiles under `dir`, recursively.
    pub async fn scan(&self, dir: &Path) -> ArchonResult<Vec<PathBuf>> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            let mut stack = vec![dir];
            while let Some(current) = stack.pop() {
                let entries = match std::fs::read_dir(&current) {
                    Ok(entries) => entries,
                    Err(_) => continue,
                };
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        stack.push(path);
                    } else if path.extension().is_some_and(|ext| ext == "lock") {
                        found.push(path);
                    }
                }
            }
            found.sort();
            Ok(found)
        })
        .await
        .map_err(|err| ArchonError::Persist(format!("lockfile scan failed: {err}")))?
    }

    /// Replays one lockfile: writes the embedded frame to its final path and
    /// removes the lockfile. Produces a file identical to the interrupted
    /// write.
    pub async fn recover_file(&self, lock: &Path) -> ArchonResult<PathBuf> {
        let text = tokio::fs::read(lock).await?;
        let payload: LockfilePayload = serde_json::from_slice(&text)
            .map_err(|err| ArchonError::Persist(format!("corrupt lockfile {lock:?}: {err}")))?;

        let data = payload.frame_data()?;
        self.reporter
            .text(
                Some(&payload.controller),
                &format!("recovering exposure file {}", payload.filename.display()),
            )
            .await;

        storage::persist_atomic(self.writer.as_ref(), &data, &payload.header, &payload.filename)
            .await?;
        self.release(&payload.filename, false).await?;

        info!(filename = %payload.filename.display(), "exposure recovered from lockfile");
        Ok(payload.filename)
    }

    /// Replays every lockfile under `dir`. Failures are reported and
    /// skipped; the lockfiles of failed recoveries stay on disk.
    pub async fn recover_dir(&self, dir: &Path) -> ArchonResult<Vec<PathBuf>> {
        let mut recovered = Vec::new();
        for lock in self.scan(dir).await? {
            match self.recover_file(&lock).await {
                Ok(path) => recovered.push(path),
                Err(err) => {
                    warn!(lock = %lock.display(), %err, "could not recover exposure");
                    self.reporter
                        .error(None, &format!("failed recovering {}: {err}", lock.display()))
                        .await;
                }
            }
        }
        if !recovered.is_empty() {
            self.reporter.filenames(&recovered).await;
        }
        Ok(recovered)
    }
}
