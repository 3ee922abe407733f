//! Append-only file segments.
//!
//! Layout under the audit root: sealed segments `seg-<seq>.log` (where
//! `<seq>` is the sequence number of the segment's first record) and at
//! most one active segment `seg-<seq>.log.open`. Each record is
//! `len(4B BE) ‖ canonical_bytes ‖ tag(32B)`; a segment ends with a fixed
//! seal record. Rotation seals the active file (seal record, fsync,
//! rename into its final name) and opens the next one. At construction a
//! leftover `.open` segment is truncated to its last verified record and
//! resumed.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use mandate_bus_core::Event;
use mandate_types::Clock;

use crate::canonical::canonical_bytes;
use crate::sink::{integrity_tag, verify_tag, AuditSink, SinkError, TAG_LEN};

/// Fixed payload of the segment seal record.
const SEAL_MAGIC: &[u8; 16] = b"MANDATE-SEG-SEAL";

/// Upper bound accepted for a single record when reading back.
const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;

/// File sink parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Directory all segments (and the active temp segment) live under.
    #[serde(rename = "rootDir")]
    pub root_dir: PathBuf,
    /// Seal the active segment once it reaches this many bytes.
    #[serde(rename = "rotateBytes")]
    pub rotate_bytes: u64,
    /// Seal the active segment once it has been open this long.
    #[serde(rename = "rotateInterval")]
    pub rotate_interval: Duration,
}

impl AuditConfig {
    /// Sensible defaults under `root_dir`.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            rotate_bytes: 1024 * 1024,
            rotate_interval: Duration::from_secs(60 * 60),
        }
    }
}

struct Segment {
    file: File,
    path: PathBuf,
    next_seq: u64,
    bytes: u64,
    opened_at: Duration,
}

/// Append-only audit sink over rotating segment files.
pub struct FileAuditSink {
    root: PathBuf,
    key: Vec<u8>,
    config: AuditConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<Segment>,
}

impl FileAuditSink {
    /// Open (or recover) a sink under `config.root_dir`.
    pub fn new(
        config: AuditConfig,
        key: impl Into<Vec<u8>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SinkError> {
        let key = key.into();
        fs::create_dir_all(&config.root_dir)
            .map_err(|e| SinkError::Unavailable(format!("create audit root: {e}")))?;
        let root = config
            .root_dir
            .canonicalize()
            .map_err(|e| SinkError::Unavailable(format!("resolve audit root: {e}")))?;

        let scan = scan_root(&root)?;
        let segment = match scan.open_segment {
            Some((first_seq, path)) => {
                let verified = recover_open_segment(&path, &key, first_seq)?;
                info!(
                    path = %path.display(),
                    records = verified.records,
                    "resumed audit segment after recovery"
                );
                let file = OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .map_err(|e| SinkError::Unavailable(format!("open segment: {e}")))?;
                Segment {
                    file,
                    path,
                    next_seq: first_seq + verified.records,
                    bytes: verified.bytes,
                    opened_at: clock.monotonic(),
                }
            }
            None => {
                let next_seq = scan.next_seq_after_sealed;
                open_segment(&root, next_seq, &clock)?
            }
        };

        Ok(Self {
            root,
            key,
            config,
            clock,
            state: Mutex::new(segment),
        })
    }

    /// The resolved audit root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sequence number the next record will carry.
    pub fn next_seq(&self) -> u64 {
        self.state.lock().next_seq
    }

    /// Seal the active segment and start a new one regardless of
    /// thresholds.
    pub fn rotate(&self) -> Result<(), SinkError> {
        let mut segment = self.state.lock();
        self.seal_locked(&mut segment)
    }

    fn seal_locked(&self, segment: &mut Segment) -> Result<(), SinkError> {
        // Seal record, then make everything durable before the rename.
        let seq = segment.next_seq;
        write_record(&mut segment.file, &self.key, seq, SEAL_MAGIC)
            .map_err(|e| SinkError::Unavailable(format!("write seal: {e}")))?;
        segment.next_seq += 1;
        segment
            .file
            .sync_all()
            .map_err(|e| SinkError::Unavailable(format!("sync segment: {e}")))?;

        let sealed_path = sealed_name(&segment.path)
            .ok_or_else(|| SinkError::Fatal("active segment has no .open suffix".into()))?;
        ensure_in_root(&self.root, &sealed_path)?;
        fs::rename(&segment.path, &sealed_path)
            .map_err(|e| SinkError::Unavailable(format!("seal rename: {e}")))?;
        info!(path = %sealed_path.display(), "audit segment sealed");

        *segment = open_segment(&self.root, segment.next_seq, &self.clock)?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn append(&self, event: &Event) -> Result<u64, SinkError> {
        let bytes = canonical_bytes(event);
        let mut segment = self.state.lock();

        let seq = segment.next_seq;
        let written = write_record(&mut segment.file, &self.key, seq, &bytes)
            .map_err(|e| SinkError::Unavailable(format!("append record: {e}")))?;
        segment.next_seq += 1;
        segment.bytes += written;
        debug!(seq, bytes = written, "audit record appended");

        let age = self.clock.monotonic().saturating_sub(segment.opened_at);
        if segment.bytes >= self.config.rotate_bytes || age >= self.config.rotate_interval {
            self.seal_locked(&mut segment)?;
        }
        Ok(seq)
    }
}

//─────────────────────────────
//  Segment file helpers
//─────────────────────────────

fn segment_file_name(first_seq: u64) -> String {
    format!("seg-{first_seq}.log")
}

fn sealed_name(open_path: &Path) -> Option<PathBuf> {
    let name = open_path.file_name()?.to_str()?;
    let sealed = name.strip_suffix(".open")?;
    Some(open_path.with_file_name(sealed))
}

fn ensure_in_root(root: &Path, path: &Path) -> Result<(), SinkError> {
    if path.starts_with(root) {
        Ok(())
    } else {
        Err(SinkError::Fatal(format!(
            "path {} escapes audit root {}",
            path.display(),
            root.display()
        )))
    }
}

fn open_segment(root: &Path, first_seq: u64, clock: &Arc<dyn Clock>) -> Result<Segment, SinkError> {
    let path = root.join(format!("{}.open", segment_file_name(first_seq)));
    ensure_in_root(root, &path)?;
    let file = OpenOptions::new()
        .create_new(true)
        .append(true)
        .open(&path)
        .map_err(|e| SinkError::Unavailable(format!("create segment: {e}")))?;
    debug!(path = %path.display(), first_seq, "audit segment opened");
    Ok(Segment {
        file,
        path,
        next_seq: first_seq,
        bytes: 0,
        opened_at: clock.monotonic(),
    })
}

fn write_record(file: &mut File, key: &[u8], seq: u64, bytes: &[u8]) -> std::io::Result<u64> {
    let tag = integrity_tag(key, seq, bytes);
    let mut buf = Vec::with_capacity(4 + bytes.len() + TAG_LEN);
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
    buf.extend_from_slice(&tag);
    file.write_all(&buf)?;
    file.flush()?;
    Ok(buf.len() as u64)
}

struct ScanResult {
    /// Newest active segment, if any: (first sequence, path).
    open_segment: Option<(u64, PathBuf)>,
    /// First sequence for a fresh segment after the sealed ones.
    next_seq_after_sealed: u64,
}

fn scan_root(root: &Path) -> Result<ScanResult, SinkError> {
    let mut open_segment: Option<(u64, PathBuf)> = None;
    let mut newest_sealed: Option<(u64, PathBuf)> = None;

    let entries =
        fs::read_dir(root).map_err(|e| SinkError::Unavailable(format!("scan audit root: {e}")))?;
    for entry in entries {
        let entry = entry.map_err(|e| SinkError::Unavailable(format!("scan audit root: {e}")))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stem) = name.strip_suffix(".log.open") {
            if let Some(seq) = parse_seq(stem) {
                if open_segment.as_ref().map_or(true, |(s, _)| seq > *s) {
                    open_segment = Some((seq, entry.path()));
                }
            }
        } else if let Some(stem) = name.strip_suffix(".log") {
            if let Some(seq) = parse_seq(stem) {
                if newest_sealed.as_ref().map_or(true, |(s, _)| seq > *s) {
                    newest_sealed = Some((seq, entry.path()));
                }
            }
        }
    }

    let next_seq_after_sealed = match &newest_sealed {
        None => 0,
        Some((first_seq, path)) => {
            // Count records (seal included) to continue the sequence.
            let stats = read_segment(path, *first_seq)?;
            first_seq + stats.records
        }
    };

    Ok(ScanResult {
        open_segment,
        next_seq_after_sealed,
    })
}

fn parse_seq(stem: &str) -> Option<u64> {
    stem.strip_prefix("seg-")?.parse().ok()
}

struct SegmentStats {
    /// Records present (including any seal record).
    records: u64,
    /// Bytes covered by complete records.
    bytes: u64,
}

/// Walk a segment's framing without verifying tags.
fn read_segment(path: &Path, _first_seq: u64) -> Result<SegmentStats, SinkError> {
    let mut file =
        File::open(path).map_err(|e| SinkError::Unavailable(format!("open segment: {e}")))?;
    let mut records = 0u64;
    let mut offset = 0u64;
    loop {
        match read_one(&mut file) {
            Ok(Some((len, _bytes, _tag))) => {
                records += 1;
                offset += 4 + len as u64 + TAG_LEN as u64;
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
    Ok(SegmentStats {
        records,
        bytes: offset,
    })
}

struct Recovered {
    records: u64,
    bytes: u64,
}

/// Verify an interrupted `.open` segment and truncate it to the last
/// record whose integrity tag checks out.
fn recover_open_segment(path: &Path, key: &[u8], first_seq: u64) -> Result<Recovered, SinkError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| SinkError::Unavailable(format!("open segment: {e}")))?;

    let mut seq = first_seq;
    let mut good_end = 0u64;
    let mut records = 0u64;
    loop {
        match read_one(&mut file) {
            Ok(Some((len, bytes, tag))) if verify_tag(key, seq, &bytes, &tag) => {
                seq += 1;
                records += 1;
                good_end += 4 + len as u64 + TAG_LEN as u64;
            }
            // Tag mismatch, short read, or framing damage: cut here.
            _ => break,
        }
    }

    let actual_len = file
        .metadata()
        .map_err(|e| SinkError::Unavailable(format!("stat segment: {e}")))?
        .len();
    if actual_len > good_end {
        warn!(
            path = %path.display(),
            from = actual_len,
            to = good_end,
            "truncating audit segment to last verified record"
        );
        file.set_len(good_end)
            .map_err(|e| SinkError::Unavailable(format!("truncate segment: {e}")))?;
    }

    Ok(Recovered {
        records,
        bytes: good_end,
    })
}

#[allow(clippy::type_complexity)]
fn read_one(file: &mut File) -> std::io::Result<Option<(u32, Vec<u8>, [u8; TAG_LEN])>> {
    let mut len_buf = [0u8; 4];
    match file.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }
    let mut bytes = vec![0u8; len as usize];
    match file.read_exact(&mut bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut tag = [0u8; TAG_LEN];
    match file.read_exact(&mut tag) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    Ok(Some((len, bytes, tag)))
}

/// Read and verify every record of a segment starting at `first_seq`.
///
/// Returns the canonical bytes of each verified record, stopping silently
/// at the seal record (sealed segments) or at the first damage
/// (interrupted segments).
pub fn verify_segment(
    path: &Path,
    key: &[u8],
    first_seq: u64,
) -> Result<Vec<Vec<u8>>, SinkError> {
    let mut file =
        File::open(path).map_err(|e| SinkError::Unavailable(format!("open segment: {e}")))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| SinkError::Unavailable(format!("seek segment: {e}")))?;

    let mut seq = first_seq;
    let mut out = Vec::new();
    loop {
        match read_one(&mut file) {
            Ok(Some((_len, bytes, tag))) => {
                if !verify_tag(key, seq, &bytes, &tag) {
                    break;
                }
                seq += 1;
                if bytes.as_slice() == SEAL_MAGIC {
                    break;
                }
                out.push(bytes);
            }
            _ => break,
        }
    }
    Ok(out)
}
