//! FITS frame store with night directories.
//!
//! Frames land under `<root>/<YYYY-MM-DD>/`, named by capture time and
//! kind; master calibration frames are named `<date>_master<kind>.fits`.
//! Loading a master scans the current night first and falls back to the
//! most recent earlier night, newest file winning within a night.

use chrono::NaiveDate;
use fitsio::images::{ImageDescription, ImageType};
use fitsio::{FitsFile, hdu::HduInfo};
use ndarray::Array2;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::frame::{CapturedFrame, FrameHeader, SequenceKind};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("fits: {0}")]
    Fits(#[from] fitsio::errors::Error),

    /// A file on disk did not contain what its name promised.
    #[error("malformed stored frame {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Frame store rooted at a data directory, one subdirectory per night.
#[derive(Debug, Clone)]
pub struct NightStore {
    root: PathBuf,
}

impl NightStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn night_dir(&self, date: NaiveDate) -> PathBuf {
        self.root.join(date.format("%Y-%m-%d").to_string())
    }

    /// Save a raw frame with its header fields. Returns the path written.
    pub fn save_frame(
        &self,
        frame: &CapturedFrame,
        header: &FrameHeader,
        index: Option<usize>,
    ) -> Result<PathBuf, StoreError> {
        let date = header.captured_at.date_naive();
        let dir = self.night_dir(date);
        fs::create_dir_all(&dir)?;

        let stamp = header.captured_at.format("%H%M%S");
        let name = match index {
            Some(i) => format!("{stamp}_{}_{i:03}.fits", header.kind.label()),
            None => format!("{stamp}_{}.fits", header.kind.label()),
        };
        let path = dir.join(name);

        let (height, width) = frame.pixels.dim();
        let description = ImageDescription {
            data_type: ImageType::Long,
            dimensions: &[height, width],
        };
        let mut fptr = FitsFile::create(&path)
            .overwrite()
            .with_custom_primary(&description)
            .open()?;
        let hdu = fptr.primary_hdu()?;
        let data: Vec<i32> = frame.pixels.iter().map(|&v| i32::from(v)).collect();
        hdu.write_image(&mut fptr, &data)?;
        write_header(&mut fptr, header)?;
        Ok(path)
    }

    /// Save a master calibration frame for `date`. Returns the path.
    pub fn save_master(
        &self,
        kind: SequenceKind,
        date: NaiveDate,
        pixels: &Array2<f64>,
    ) -> Result<PathBuf, StoreError> {
        let dir = self.night_dir(date);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!(
            "{}_master{}.fits",
            date.format("%Y-%m-%d"),
            kind.label()
        ));

        let (height, width) = pixels.dim();
        let description = ImageDescription {
            data_type: ImageType::Double,
            dimensions: &[height, width],
        };
        let mut fptr = FitsFile::create(&path)
            .overwrite()
            .with_custom_primary(&description)
            .open()?;
        let hdu = fptr.primary_hdu()?;
        let data: Vec<f64> = pixels.iter().copied().collect();
        hdu.write_image(&mut fptr, &data)?;
        hdu.write_key(&mut fptr, "OBJECT", format!("master{}", kind.label()))?;
        Ok(path)
    }

    /// Load the most recent master of `kind`: current night first, then
    /// earlier nights newest-first. `Ok(None)` when no master exists
    /// anywhere; the caller decides whether that is a quality warning.
    pub fn load_master(&self, kind: SequenceKind) -> Result<Option<Array2<f64>>, StoreError> {
        let suffix = format!("_master{}.fits", kind.label());
        for dir in self.night_dirs_newest_first()? {
            let mut candidates: Vec<PathBuf> = fs::read_dir(&dir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    path.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.ends_with(&suffix))
                        .unwrap_or(false)
                })
                .collect();
            candidates.sort();
            if let Some(path) = candidates.pop() {
                log::debug!("loading master {} from {}", kind.label(), path.display());
                return read_f64_image(&path).map(Some);
            }
        }
        Ok(None)
    }

    /// Night directories sorted newest first. Non-date directories are
    /// ignored.
    fn night_dirs_newest_first(&self) -> Result<Vec<PathBuf>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut nights: Vec<(NaiveDate, PathBuf)> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let path = entry.path();
                let name = path.file_name()?.to_str()?.to_string();
                let date = NaiveDate::parse_from_str(&name, "%Y-%m-%d").ok()?;
                Some((date, path))
            })
            .collect();
        nights.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(nights.into_iter().map(|(_, path)| path).collect())
    }
}

fn write_header(fptr: &mut FitsFile, header: &FrameHeader) -> Result<(), StoreError> {
    let hdu = fptr.primary_hdu()?;
    hdu.write_key(
        fptr,
        "DATE-OBS",
        header.captured_at.format("%Y-%m-%d").to_string(),
    )?;
    hdu.write_key(
        fptr,
        "TIME-OBS",
        header.captured_at.format("%H:%M:%S").to_string(),
    )?;
    hdu.write_key(fptr, "EXPTIME", header.exptime_s)?;
    hdu.write_key(fptr, "OBJECT", header.kind.label().to_string())?;
    if let Some((ra, dec)) = header.position {
        hdu.write_key(fptr, "RA", ra)?;
        hdu.write_key(fptr, "DEC", dec)?;
    }
    Ok(())
}

fn read_f64_image(path: &Path) -> Result<Array2<f64>, StoreError> {
    let mut fptr = FitsFile::open(path)?;
    let hdu = fptr.primary_hdu()?;
    let shape = match &hdu.info {
        HduInfo::ImageInfo { shape, .. } if shape.len() == 2 => (shape[0], shape[1]),
        _ => {
            return Err(StoreError::Malformed {
                path: path.to_path_buf(),
                reason: "primary HDU is not a 2-D image".to_string(),
            })
        }
    };
    let data: Vec<f64> = hdu.read_image(&mut fptr)?;
    Array2::from_shape_vec(shape, data).map_err(|e| StoreError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ndarray::Array2;
    use tempfile::TempDir;

    fn test_frame(value: u16) -> CapturedFrame {
        CapturedFrame {
            pixels: Array2::from_elem((8, 8), value),
            captured_at: Utc.with_ymd_and_hms(2026, 3, 14, 1, 59, 26).unwrap(),
            exptime_s: 2.5,
            simulated: true,
        }
    }

    #[test]
    fn save_frame_lands_in_night_directory() {
        let tmp = TempDir::new().unwrap();
        let store = NightStore::new(tmp.path());
        let frame = test_frame(100);
        let header = FrameHeader::for_frame(&frame, SequenceKind::Science)
            .with_position(Some((182.5, -0.25)));
        let path = store.save_frame(&frame, &header, Some(3)).unwrap();
        assert!(path.exists());
        assert!(path.to_string_lossy().contains("2026-03-14"));
        assert!(path.to_string_lossy().ends_with("015926_science_003.fits"));
    }

    #[test]
    fn master_round_trips() {
        let tmp = TempDir::new().unwrap();
        let store = NightStore::new(tmp.path());
        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let master = Array2::from_shape_fn((6, 5), |(y, x)| (y * 5 + x) as f64 / 3.0);
        store.save_master(SequenceKind::Bias, date, &master).unwrap();

        let loaded = store.load_master(SequenceKind::Bias).unwrap().unwrap();
        assert_eq!(loaded.dim(), (6, 5));
        assert_eq!(loaded, master);
    }

    #[test]
    fn missing_master_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = NightStore::new(tmp.path());
        assert!(store.load_master(SequenceKind::Flat).unwrap().is_none());
    }

    #[test]
    fn newest_night_wins() {
        let tmp = TempDir::new().unwrap();
        let store = NightStore::new(tmp.path());
        let old = NaiveDate::from_ymd_opt(2026, 3, 12).unwrap();
        let new = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        store
            .save_master(SequenceKind::Dark, old, &Array2::from_elem((4, 4), 1.0))
            .unwrap();
        store
            .save_master(SequenceKind::Dark, new, &Array2::from_elem((4, 4), 2.0))
            .unwrap();

        let loaded = store.load_master(SequenceKind::Dark).unwrap().unwrap();
        assert_eq!(loaded[[0, 0]], 2.0);
    }

    #[test]
    fn older_night_is_a_fallback() {
        let tmp = TempDir::new().unwrap();
        let store = NightStore::new(tmp.path());
        let old = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        store
            .save_master(SequenceKind::Flat, old, &Array2::from_elem((4, 4), 0.9))
            .unwrap();
        // A newer night directory exists but holds no flat master.
        std::fs::create_dir_all(store.night_dir(NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()))
            .unwrap();

        let loaded = store.load_master(SequenceKind::Flat).unwrap().unwrap();
        assert_eq!(loaded[[0, 0]], 0.9);
    }
}
