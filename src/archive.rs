//! Tar bundles exchanged with the service: the outgoing scan archive and the
//! incoming (optionally gzipped) result archive.

use std::{
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom},
    path::{Component, Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use flate2::read::GzDecoder;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const MAX_RESULT_ENTRIES: usize = 100_000;
const MAX_RESULT_ENTRY_BYTES: u64 = 256 * 1024 * 1024;
const MAX_RESULT_TOTAL_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Archive I/O error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Invalid archive: {0}")]
    Invalid(String),
    #[error("Archive entry escapes the destination: {0}")]
    UnsafePath(String),
    #[error("Archive {0} is already closed")]
    Closed(PathBuf),
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Upload bundle of exported scans, written entry by entry.
pub struct ScanArchive {
    path: PathBuf,
    builder: Option<tar::Builder<File>>,
    entries: u32,
}

impl ScanArchive {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let path = path.into();
        let file = File::create(&path).map_err(io_at(&path))?;
        tracing::debug!(path = %path.display(), "scan archive opened");
        Ok(Self {
            path,
            builder: Some(tar::Builder::new(file)),
            entries: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_count(&self) -> u32 {
        self.entries
    }

    /// True once [`finish`](Self::finish) has run; no more entries fit.
    pub fn is_closed(&self) -> bool {
        self.builder.is_none()
    }

    pub fn append(&mut self, name: &str, bytes: &[u8]) -> Result<(), ArchiveError> {
        let builder = self
            .builder
            .as_mut()
            .ok_or_else(|| ArchiveError::Closed(self.path.clone()))?;
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0),
        );
        builder
            .append_data(&mut header, name, bytes)
            .map_err(io_at(&self.path))?;
        self.entries += 1;
        Ok(())
    }

    /// Write the trailer and flush. Later calls are no-ops.
    pub fn finish(&mut self) -> Result<&Path, ArchiveError> {
        if let Some(builder) = self.builder.take() {
            let file = builder.into_inner().map_err(io_at(&self.path))?;
            file.sync_all().map_err(io_at(&self.path))?;
            tracing::debug!(path = %self.path.display(), entries = self.entries, "scan archive closed");
        }
        Ok(&self.path)
    }

    /// Close (if needed) and delete the archive file.
    pub fn discard(mut self) {
        self.builder.take();
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to remove scan archive");
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct ExtractionLimits {
    max_entries: usize,
    max_entry_bytes: u64,
    max_total_bytes: u64,
}

impl ExtractionLimits {
    fn standard() -> Self {
        Self {
            max_entries: MAX_RESULT_ENTRIES,
            max_entry_bytes: MAX_RESULT_ENTRY_BYTES,
            max_total_bytes: MAX_RESULT_TOTAL_BYTES,
        }
    }
}

/// Unpack every file entry of a result archive into `dest_dir`. Gzip
/// compression is detected from the leading bytes. On failure, files
/// already written are removed again.
pub fn unpack_results(archive_path: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    unpack_with_limits(archive_path, dest_dir, ExtractionLimits::standard())
}

fn unpack_with_limits(
    archive_path: &Path,
    dest_dir: &Path,
    limits: ExtractionLimits,
) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut written = Vec::new();
    if let Err(err) = extract_entries(archive_path, dest_dir, limits, &mut written) {
        for path in &written {
            let _ = fs::remove_file(path);
        }
        return Err(err);
    }
    tracing::debug!(archive = %archive_path.display(), files = written.len(), "results unpacked");
    Ok(written)
}

fn extract_entries(
    archive_path: &Path,
    dest_dir: &Path,
    limits: ExtractionLimits,
    written: &mut Vec<PathBuf>,
) -> Result<(), ArchiveError> {
    let mut file = File::open(archive_path).map_err(io_at(archive_path))?;
    let mut magic = [0u8; 2];
    let sniffed = file.read(&mut magic).map_err(io_at(archive_path))?;
    file.seek(SeekFrom::Start(0)).map_err(io_at(archive_path))?;
    let reader: Box<dyn Read> = if sniffed == 2 && magic == GZIP_MAGIC {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    fs::create_dir_all(dest_dir).map_err(io_at(dest_dir))?;

    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(io_at(archive_path))?;
    let mut seen = 0usize;
    let mut total: u64 = 0;
    for entry in entries {
        let mut entry = entry.map_err(io_at(archive_path))?;
        seen += 1;
        if seen > limits.max_entries {
            return Err(ArchiveError::Invalid(format!(
                "more than {} entries",
                limits.max_entries
            )));
        }
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            continue;
        }
        let relative = entry.path().map_err(io_at(archive_path))?.into_owned();
        if !kind.is_file() {
            tracing::debug!(entry = %relative.display(), "skipping non-file archive entry");
            continue;
        }
        check_relative(&relative)?;
        let size = entry.size();
        if size > limits.max_entry_bytes {
            return Err(ArchiveError::Invalid(format!(
                "entry '{}' is too large ({size} bytes, limit {})",
                relative.display(),
                limits.max_entry_bytes
            )));
        }
        total = total
            .checked_add(size)
            .ok_or_else(|| ArchiveError::Invalid("archive size overflow".into()))?;
        if total > limits.max_total_bytes {
            return Err(ArchiveError::Invalid(format!(
                "extracted size {total} exceeds limit {}",
                limits.max_total_bytes
            )));
        }

        let out_path = dest_dir.join(&relative);
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(io_at(parent))?;
        }
        let mut out = File::create(&out_path).map_err(io_at(&out_path))?;
        written.push(out_path.clone());
        let copied = io::copy(&mut (&mut entry).take(limits.max_entry_bytes + 1), &mut out)
            .map_err(io_at(&out_path))?;
        if copied > limits.max_entry_bytes {
            return Err(ArchiveError::Invalid(format!(
                "entry '{}' exceeded its declared size",
                relative.display()
            )));
        }
    }
    Ok(())
}

fn check_relative(path: &Path) -> Result<(), ArchiveError> {
    let safe = path.components().next().is_some()
        && path
            .components()
            .all(|part| matches!(part, Component::Normal(_) | Component::CurDir));
    if safe {
        Ok(())
    } else {
        Err(ArchiveError::UnsafePath(path.display().to_string()))
    }
}
