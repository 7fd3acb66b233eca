use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use tracing::warn;

use crate::models::SyncError;

/// Pack a directory tree into a gzipped tar with root-relative paths.
///
/// Entries are appended in sorted order so equal trees produce equal
/// archives.
pub fn pack_dir(dir: &Path) -> Result<Vec<u8>, SyncError> {
    let mut entries = Vec::new();
    collect_entries(dir, dir, &mut entries)?;
    entries.sort();

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    for rel in &entries {
        let full = dir.join(rel);
        if full.is_dir() {
            builder
                .append_dir(rel, &full)
                .map_err(|e| SyncError::Archive(e.to_string()))?;
        } else {
            builder
                .append_path_with_name(&full, rel)
                .map_err(|e| SyncError::Archive(e.to_string()))?;
        }
    }
    let encoder = builder
        .into_inner()
        .map_err(|e| SyncError::Archive(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| SyncError::Archive(e.to_string()))
}

/// Unpack a gzipped tar into `dst`, skipping entries that would escape it.
pub fn unpack_into(bytes: &[u8], dst: &Path) -> Result<(), SyncError> {
    fs::create_dir_all(dst)?;
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let entries = archive
        .entries()
        .map_err(|e| SyncError::Archive(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| SyncError::Archive(e.to_string()))?;
        let name = entry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "<invalid>".to_string());
        let unpacked = entry
            .unpack_in(dst)
            .map_err(|e| SyncError::Archive(e.to_string()))?;
        if !unpacked {
            warn!("Skipping archive entry escaping the workspace: {}", name);
        }
    }
    Ok(())
}

fn collect_entries(base: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), SyncError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let rel = path
            .strip_prefix(base)
            .map_err(|e| SyncError::Archive(e.to_string()))?
            .to_path_buf();
        if path.is_dir() {
            out.push(rel);
            collect_entries(base, &path, out)?;
        } else {
            out.push(rel);
        }
    }
    Ok(())
}
