//! Gzipped tar archives of chain data directories.
//!
//! Archives hold the *contents* of the data directory, so extracting over an
//! empty directory yields a launchable chain.

use crate::SnapshotError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::Path;
use tar::Archive;

/// Pack the contents of `src_dir` into a `.tgz` archive at `dest`.
pub fn create(src_dir: &Path, dest: &Path) -> Result<(), SnapshotError> {
    if !src_dir.is_dir() {
        return Err(SnapshotError::SourceMissing(src_dir.to_path_buf()));
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", src_dir)?;
    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(())
}

/// Unpack an archive produced by [`create`] into `dest_dir`.
pub fn extract(archive_path: &Path, dest_dir: &Path) -> Result<(), SnapshotError> {
    if !archive_path.is_file() {
        return Err(SnapshotError::MissingArchive(
            archive_path.display().to_string(),
        ));
    }
    std::fs::create_dir_all(dest_dir)?;
    let file = File::open(archive_path)?;
    let decoder = GzDecoder::new(file);
    Archive::new(decoder).unpack(dest_dir)?;
    Ok(())
}
