//! Rolling line checksums embedded in text and XML artifacts.
//!
//! Every text file exchanged with the processing service carries a trailing
//! `# checksum:<sha1 hex>` line. The hash is a fold over all non-marker lines:
//! `hash = sha1(previous_hash_hex + line)`, starting from a fixed seed, so a
//! truncated or corrupted transfer is detected without a side-channel digest.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use sha1::{Digest, Sha1};

/// Prefix identifying the embedded checksum line.
pub const CHECKSUM_MARKER: &str = "# checksum:";
const HASH_SEED: &str = "Veritomyx hash seed!";

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("Failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("Failed to append checksum to {path}: {source}")]
    Append { path: PathBuf, source: io::Error },
}

/// Outcome of comparing a file's embedded hash with its recomputed hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid,
    Invalid {
        /// Hash found on the marker line, if any.
        claimed: Option<String>,
        computed: String,
    },
    /// The file does not exist. Expected for scans the server skipped.
    Missing,
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// In-memory accumulator for the rolling hash.
#[derive(Debug, Clone)]
pub struct RollingChecksum {
    hash: String,
}

impl Default for RollingChecksum {
    fn default() -> Self {
        Self::new()
    }
}

impl RollingChecksum {
    /// A fresh accumulator with the seed already folded in.
    pub fn new() -> Self {
        let mut rolling = Self {
            hash: String::new(),
        };
        rolling.reset();
        rolling
    }

    pub fn reset(&mut self) {
        self.hash.clear();
        self.fold_line(HASH_SEED);
    }

    /// Fold `line` into the hash unless it is a marker line. Returns the
    /// input untouched so writers can fold and emit in one expression.
    pub fn fold_line<'a>(&mut self, line: &'a str) -> &'a str {
        if is_marker_line(line) {
            return line;
        }
        let mut hasher = Sha1::new();
        hasher.update(self.hash.as_bytes());
        hasher.update(strip_line_endings(line).as_bytes());
        self.hash = format!("{:x}", hasher.finalize());
        line
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// `"<marker><hash>\n"`.
    pub fn checksum_line(&self) -> String {
        format!("{CHECKSUM_MARKER}{}\n", self.hash)
    }
}

/// Checksum bookkeeping bound to one file on disk.
#[derive(Debug, Clone)]
pub struct ChecksummedFile {
    path: PathBuf,
    rolling: RollingChecksum,
    claimed: Option<String>,
}

impl ChecksummedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            rolling: RollingChecksum::new(),
            claimed: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reset(&mut self) {
        self.rolling.reset();
        self.claimed = None;
    }

    pub fn fold_line<'a>(&mut self, line: &'a str) -> &'a str {
        self.rolling.fold_line(line)
    }

    pub fn hash(&self) -> &str {
        self.rolling.hash()
    }

    /// Hash found on the first marker line by the last `hash_whole_file`.
    pub fn claimed(&self) -> Option<&str> {
        self.claimed.as_deref()
    }

    pub fn checksum_line(&self) -> String {
        self.rolling.checksum_line()
    }

    /// Replay every line of the file, discarding any previously folded state.
    pub fn hash_whole_file(&mut self) -> Result<(), ChecksumError> {
        self.reset();
        let file = File::open(&self.path).map_err(|source| self.read_error(source))?;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|source| self.read_error(source))?;
            if let Some(value) = line.strip_prefix(CHECKSUM_MARKER) {
                if self.claimed.is_none() {
                    self.claimed = Some(value.trim().to_string());
                }
            } else {
                self.rolling.fold_line(&line);
            }
        }
        Ok(())
    }

    /// Append the checksum line for the current hash state.
    pub fn append_as_text(&mut self, verify_after: bool) -> Result<Option<Verification>, ChecksumError> {
        let line = self.checksum_line();
        self.append(line.as_bytes())?;
        self.verify_if(verify_after)
    }

    /// Close an XML document with a tag-wrapped checksum. The wrapper tags
    /// are folded first so the hash covers the markup too.
    pub fn append_as_xml(
        &mut self,
        value_tag: &str,
        container_tag: &str,
        verify_after: bool,
    ) -> Result<Option<Verification>, ChecksumError> {
        let open = format!("<{value_tag}>");
        let close = format!("</{value_tag}>");
        let container_close = format!("</{container_tag}>");
        self.rolling.fold_line(&open);
        self.rolling.fold_line(&close);
        self.rolling.fold_line(&container_close);
        let block = format!(
            "{open}\n{}{close}\n{container_close}\n",
            self.checksum_line()
        );
        self.append(block.as_bytes())?;
        self.verify_if(verify_after)
    }

    pub fn verify(&mut self) -> Result<Verification, ChecksumError> {
        match self.hash_whole_file() {
            Ok(()) => {}
            Err(ChecksumError::Read { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                return Ok(Verification::Missing);
            }
            Err(err) => return Err(err),
        }
        let computed = self.rolling.hash();
        if self.claimed.as_deref() == Some(computed) {
            tracing::trace!(path = %self.path.display(), "valid checksum");
            Ok(Verification::Valid)
        } else {
            tracing::debug!(path = %self.path.display(), "invalid checksum");
            Ok(Verification::Invalid {
                claimed: self.claimed.clone(),
                computed: computed.to_string(),
            })
        }
    }

    fn verify_if(&mut self, verify_after: bool) -> Result<Option<Verification>, ChecksumError> {
        if verify_after {
            self.verify().map(Some)
        } else {
            Ok(None)
        }
    }

    fn append(&self, bytes: &[u8]) -> Result<(), ChecksumError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.append_error(source))?;
        file.write_all(bytes)
            .and_then(|_| file.flush())
            .map_err(|source| self.append_error(source))
    }

    fn read_error(&self, source: io::Error) -> ChecksumError {
        ChecksumError::Read {
            path: self.path.clone(),
            source,
        }
    }

    fn append_error(&self, source: io::Error) -> ChecksumError {
        ChecksumError::Append {
            path: self.path.clone(),
            source,
        }
    }
}

/// Hash the existing contents of `path` and append the checksum line.
pub fn seal_text_file(path: &Path) -> Result<Verification, ChecksumError> {
    let mut file = ChecksummedFile::new(path);
    file.hash_whole_file()?;
    file.append_as_text(true)
        .map(|verification| verification.unwrap_or(Verification::Valid))
}

pub fn is_marker_line(line: &str) -> bool {
    line.starts_with(CHECKSUM_MARKER)
}

fn strip_line_endings(line: &str) -> std::borrow::Cow<'_, str> {
    if line.contains('\n') {
        std::borrow::Cow::Owned(line.replace("\r\n", "").replace('\n', ""))
    } else {
        std::borrow::Cow::Borrowed(line)
    }
}
