//! Scan data as seen by the job client: export to the transfer format and
//! parse the centroided peak lists that come back.
//!
//! File names are derived from scan number and MS level so the retrieval side
//! can find a scan's result without a manifest.

use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read, Write},
    path::{Path, PathBuf},
    sync::LazyLock,
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use regex::Regex;

use crate::checksum::RollingChecksum;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

static SCAN_FILE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^scan(\d+)(?:_ms(\d+))?").expect("scan file name pattern is valid")
});

/// One (mass, intensity) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub mass: f64,
    pub intensity: f64,
}

impl Peak {
    pub fn new(mass: f64, intensity: f64) -> Self {
        Self { mass, intensity }
    }
}

/// Inclusive m/z window reported to the service when a job is sized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MassRange {
    pub min: f64,
    pub max: f64,
}

impl MassRange {
    pub fn union(self, other: MassRange) -> MassRange {
        MassRange {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// A raw profile scan handed over by the acquisition pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Scan {
    pub number: u32,
    pub ms_level: u8,
    pub retention_time: Option<f64>,
    pub points: Vec<Peak>,
}

impl Scan {
    pub fn new(number: u32, ms_level: u8, points: Vec<Peak>) -> Self {
        Self {
            number,
            ms_level,
            retention_time: None,
            points,
        }
    }

    pub fn mass_range(&self) -> Option<MassRange> {
        let mut points = self.points.iter();
        let first = points.next()?;
        let start = MassRange {
            min: first.mass,
            max: first.mass,
        };
        Some(points.fold(start, |range, peak| {
            range.union(MassRange {
                min: peak.mass,
                max: peak.mass,
            })
        }))
    }

    /// Archive entry name for the exported scan.
    pub fn export_name(&self) -> String {
        format!("{}.txt.gz", self.file_stem())
    }

    /// Name of the centroided result the service produces for this scan.
    pub fn result_name(&self) -> String {
        format!("{}.vcent.txt", self.file_stem())
    }

    fn file_stem(&self) -> String {
        format!("scan{:04}_ms{}", self.number, self.ms_level)
    }
}

/// Serializes one scan into the bytes of an upload archive entry.
pub trait ScanExporter: Send + Sync {
    fn export(&self, scan: &Scan) -> io::Result<Vec<u8>>;
}

/// Default exporter: gzip-compressed tab-separated text with a comment
/// header and a trailing checksum line.
#[derive(Debug, Clone, Copy)]
pub struct TextScanExporter {
    level: Compression,
}

impl Default for TextScanExporter {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl TextScanExporter {
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }

    /// Write the uncompressed text form, returning the writer.
    pub fn write_text<W: Write>(&self, scan: &Scan, mut out: W) -> io::Result<W> {
        let mut rolling = RollingChecksum::new();
        let mut emit = |out: &mut W, line: String| -> io::Result<()> {
            writeln!(out, "{}", rolling.fold_line(&line))
        };
        emit(&mut out, format!("# scan: {}", scan.number))?;
        emit(&mut out, format!("# ms_level: {}", scan.ms_level))?;
        if let Some(rt) = scan.retention_time {
            emit(&mut out, format!("# retention_time: {rt}"))?;
        }
        emit(&mut out, format!("# points: {}", scan.points.len()))?;
        for peak in &scan.points {
            emit(&mut out, format!("{}\t{}", peak.mass, peak.intensity))?;
        }
        out.write_all(rolling.checksum_line().as_bytes())?;
        Ok(out)
    }
}

impl ScanExporter for TextScanExporter {
    fn export(&self, scan: &Scan) -> io::Result<Vec<u8>> {
        let encoder = GzEncoder::new(Vec::new(), self.level);
        self.write_text(scan, encoder)?.finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeakParseError {
    #[error("Line {line_number}: expected '<mass> <intensity>', got '{line}'")]
    Malformed { line_number: usize, line: String },
}

/// Parse a centroided peak list. `#` lines and blank lines are skipped;
/// every other line must be exactly two decimal numbers.
pub fn parse_peak_lines<I, S>(lines: I) -> Result<Vec<Peak>, PeakParseError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut peaks = Vec::new();
    for (index, line) in lines.into_iter().enumerate() {
        let line = line.as_ref().trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_pair(line) {
            Some(peak) => peaks.push(peak),
            None => {
                return Err(PeakParseError::Malformed {
                    line_number: index + 1,
                    line: line.to_string(),
                });
            }
        }
    }
    Ok(peaks)
}

fn parse_pair(line: &str) -> Option<Peak> {
    let mut fields = line.split_whitespace();
    let mass = fields.next()?.parse::<f64>().ok()?;
    let intensity = fields.next()?.parse::<f64>().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(Peak::new(mass, intensity))
}

#[derive(Debug, thiserror::Error)]
pub enum ScanFileError {
    #[error("Failed to read scan file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Scan file {path} has no scan number in its header or name")]
    MissingNumber { path: PathBuf },
    #[error("Scan file {path}: {source}")]
    Peaks {
        path: PathBuf,
        source: PeakParseError,
    },
}

/// Load a scan from a text file in the export format (optionally gzipped).
/// Header comments win over numbers embedded in the file name.
pub fn read_scan_file(path: &Path) -> Result<Scan, ScanFileError> {
    let io_err = |source| ScanFileError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_err)?;
    let mut magic = [0u8; 2];
    let sniffed = file.read(&mut magic).map_err(io_err)?;
    let file = File::open(path).map_err(io_err)?;
    let reader: Box<dyn BufRead> = if sniffed == 2 && magic == GZIP_MAGIC {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    let lines = reader.lines().collect::<Result<Vec<_>, _>>().map_err(io_err)?;

    let (mut number, mut ms_level) = numbers_from_name(path);
    let mut retention_time = None;
    for line in &lines {
        let Some(comment) = line.strip_prefix('#') else {
            continue;
        };
        let Some((key, value)) = comment.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "scan" => number = value.parse().ok().or(number),
            "ms_level" => ms_level = value.parse().ok().or(ms_level),
            "retention_time" => retention_time = value.parse().ok(),
            _ => {}
        }
    }
    let number = number.ok_or_else(|| ScanFileError::MissingNumber {
        path: path.to_path_buf(),
    })?;
    let points = parse_peak_lines(&lines).map_err(|source| ScanFileError::Peaks {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Scan {
        number,
        ms_level: ms_level.unwrap_or(1),
        retention_time,
        points,
    })
}

fn numbers_from_name(path: &Path) -> (Option<u32>, Option<u8>) {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return (None, None);
    };
    let Some(captures) = SCAN_FILE_NAME.captures(name) else {
        return (None, None);
    };
    let number = captures.get(1).and_then(|m| m.as_str().parse().ok());
    let level = captures.get(2).and_then(|m| m.as_str().parse().ok());
    (number, level)
}
