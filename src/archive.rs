use std::fs::File;
use std::io::Read;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tempfile::NamedTempFile;

use crate::error::DetError;

/// Gzip-compressed tar writer that only exposes the archive at its final
/// path once [`ArchiveWriter::commit`] succeeds. Dropping it before then
/// deletes the partial file.
pub struct ArchiveWriter {
    path: Utf8PathBuf,
    builder: tar::Builder<GzEncoder<NamedTempFile>>,
}

impl ArchiveWriter {
    pub fn create(path: &Utf8Path) -> Result<Self, DetError> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        let temp = tempfile::Builder::new()
            .prefix(".det-bundle")
            .suffix(".partial")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| DetError::Filesystem(format!("create archive in {parent}: {err}")))?;
        let encoder = GzEncoder::new(temp, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.mode(tar::HeaderMode::Deterministic);
        Ok(Self {
            path: path.to_path_buf(),
            builder,
        })
    }

    pub fn append_file(&mut self, name: &str, source: &Path) -> Result<(), DetError> {
        let mut file = File::open(source)
            .map_err(|err| DetError::Filesystem(format!("open {}: {err}", source.display())))?;
        self.builder
            .append_file(name, &mut file)
            .map_err(|err| DetError::Archive(format!("append {name}: {err}")))
    }

    /// Finishes the tar and gzip streams and renames the file into place,
    /// replacing any archive already at that path.
    pub fn commit(self) -> Result<Utf8PathBuf, DetError> {
        let encoder = self
            .builder
            .into_inner()
            .map_err(|err| DetError::Archive(err.to_string()))?;
        let temp = encoder
            .finish()
            .map_err(|err| DetError::Archive(err.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| DetError::Filesystem(err.to_string()))?;
        temp.persist(self.path.as_std_path())
            .map_err(|err| DetError::Filesystem(format!("persist {}: {}", self.path, err.error)))?;
        Ok(self.path)
    }
}

pub fn list_archive_entries(path: &Utf8Path) -> Result<Vec<String>, DetError> {
    Ok(read_archive(path)?
        .into_iter()
        .map(|(name, _)| name)
        .collect())
}

/// Reads every regular entry of a `.tar.gz` into memory, in archive order.
pub fn read_archive(path: &Utf8Path) -> Result<Vec<(String, Vec<u8>)>, DetError> {
    let file = File::open(path.as_std_path())
        .map_err(|err| DetError::Filesystem(format!("open archive {path}: {err}")))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let entries = archive
        .entries()
        .map_err(|err| DetError::Archive(err.to_string()))?;

    let mut items = Vec::new();
    for entry in entries {
        let mut entry = entry.map_err(|err| DetError::Archive(err.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .map_err(|err| DetError::Archive(err.to_string()))?
            .to_string_lossy()
            .into_owned();
        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|err| DetError::Archive(err.to_string()))?;
        items.push((name, contents));
    }
    Ok(items)
}
