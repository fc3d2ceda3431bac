//! Frame persistence: the default FITS writer, atomic placement, and the
//! optional checksum sidecar.
//!
//! Writing is CPU- and disk-bound, so it runs on the blocking pool and never
//! touches controller state. Placement is crash-safe: the caller writes to a
//! temp path in the destination directory, then renames into place; the
//! lockfile bracket around it belongs to the exposure delegate.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use md5::Md5;
use sha1::Sha1;
use tracing::{debug, info};

use crate::config::{ChecksumMode, ChecksumSettings};
use crate::controller::frame::FrameData;
use crate::core::{FitsHeader, FrameWriter, HeaderValue};
use crate::error::{ArchonError, ArchonResult};

/// Default [`FrameWriter`]: one primary HDU per file through cfitsio.
pub struct FitsFileWriter;

#[async_trait]
impl FrameWriter for FitsFileWriter {
    async fn write(&self, data: &FrameData, header: &FitsHeader, path: &Path) -> ArchonResult<()> {
        let data = data.clone();
        let header = header.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || write_fits_sync(&data, &header, &path))
            .await
            .map_err(|err| ArchonError::Persist(format!("FITS write task failed: {err}")))?
    }
}

fn write_fits_sync(data: &FrameData, header: &FitsHeader, path: &Path) -> ArchonResult<()> {
    use fitsio::images::{ImageDescription, ImageType};
    use fitsio::FitsFile;

    let persist = |err: fitsio::errors::Error| ArchonError::Persist(err.to_string());

    let (height, width) = data.dim();
    let image_type = match data {
        FrameData::U16(_) => ImageType::UnsignedShort,
        FrameData::U32(_) => ImageType::UnsignedLong,
    };
    let description = ImageDescription {
        data_type: image_type,
        dimensions: &[height, width],
    };

    let mut file = FitsFile::create(path)
        .with_custom_primary(&description)
        .overwrite()
        .open()
        .map_err(persist)?;
    let hdu = file.primary_hdu().map_err(persist)?;

    for card in header.cards() {
        match &card.value {
            HeaderValue::Str(v) => hdu.write_key(&mut file, &card.key, v.clone()),
            HeaderValue::Int(v) => hdu.write_key(&mut file, &card.key, *v),
            HeaderValue::Float(v) => hdu.write_key(&mut file, &card.key, *v),
            HeaderValue::Bool(v) => hdu.write_key(&mut file, &card.key, i64::from(*v)),
        }
        .map_err(persist)?;
    }

    match data {
        FrameData::U16(arr) => {
            let flat = arr.as_standard_layout();
            let slice = flat.as_slice().expect("standard layout");
            hdu.write_image(&mut file, slice).map_err(persist)?;
        }
        FrameData::U32(arr) => {
            let flat = arr.as_standard_layout();
            let slice = flat.as_slice().expect("standard layout");
            hdu.write_image(&mut file, slice).map_err(persist)?;
        }
    }

    debug!(?path, "FITS file written");
    Ok(())
}

/// Writes `data` + `header` at `path` atomically: temp file in the same
/// directory, then rename. Returns the final path.
pub async fn persist_atomic(
    writer: &dyn FrameWriter,
    data: &FrameData,
    header: &FitsHeader,
    path: &Path,
) -> ArchonResult<PathBuf> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    writer.write(data, header, &tmp).await?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|err| ArchonError::Persist(format!("renaming {tmp:?} into place: {err}")))?;

    info!(?path, "image written to disk");
    Ok(path.to_path_buf())
}

/// SDSS Julian Date: MJD shifted so the observing night does not straddle a
/// date rollover.
pub fn sjd(now: DateTime<Utc>) -> u64 {
    const MJD_OF_UNIX_EPOCH: f64 = 40_587.0;
    let mjd = now.timestamp() as f64 / 86_400.0 + MJD_OF_UNIX_EPOCH;
    (mjd + 0.4).floor() as u64
}

/// Appends the image's checksum to the shared daily sidecar next to it.
pub async fn append_checksum(
    settings: &ChecksumSettings,
    image_path: &Path,
    now: DateTime<Utc>,
) -> ArchonResult<Option<PathBuf>> {
    if !settings.enabled {
        return Ok(None);
    }

    let name = settings
        .file
        .replace("{sjd}", &sjd(now).to_string())
        .replace("{mode}", settings.mode.as_str());
    let sidecar = image_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(name);

    let mode = settings.mode;
    let image = image_path.to_path_buf();
    let sidecar_clone = sidecar.clone();
    tokio::task::spawn_blocking(move || append_checksum_sync(mode, &image, &sidecar_clone))
        .await
        .map_err(|err| ArchonError::Persist(format!("checksum task failed: {err}")))??;

    Ok(Some(sidecar))
}

fn append_checksum_sync(mode: ChecksumMode, image: &Path, sidecar: &Path) -> ArchonResult<()> {
    use md5::Digest;
    use std::io::Write;

    let bytes = std::fs::read(image)?;
    let digest = match mode {
        ChecksumMode::Md5 => {
            let mut hasher = Md5::new();
            hasher.update(&bytes);
            format!("{:x}", hasher.finalize())
        }
        ChecksumMode::Sha1 => {
            let mut hasher = Sha1::new();
            hasher.update(&bytes);
            format!("{:x}", hasher.finalize())
        }
    };

    let basename = image
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(sidecar)?;
    writeln!(file, "{digest}  {basename}")?;
    Ok(())
}
