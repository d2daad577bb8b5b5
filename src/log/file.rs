//! Append-only fact log.

use crate::error::{Result, StoreError};
use crate::types::{Fact, FactHeader, Serial};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for fact frames.
const LOG_MAGIC: &[u8; 4] = b"FCT\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Fixed part of a frame: magic + version + serial + frames left in batch
/// + header len + payload len + crc.
const FRAME_OVERHEAD: u64 = 4 + 1 + 8 + 4 + 4 + 4 + 4;

/// A frame found while scanning the log on open.
#[derive(Clone, Debug)]
pub struct RecoveredFrame {
    pub offset: u64,
    pub serial: Serial,
    pub header: FactHeader,
}

/// Raw frame as read from disk, before the checksum is verified.
struct RawFrame {
    serial: Serial,
    /// Frames that follow in the same batch. Zero closes the batch.
    batch_rest: u32,
    header: Vec<u8>,
    payload: Vec<u8>,
    checksum: u32,
}

impl RawFrame {
    fn len(&self) -> u64 {
        FRAME_OVERHEAD + self.header.len() as u64 + self.payload.len() as u64
    }

    fn verify(&self) -> Result<()> {
        let got = frame_checksum(self.serial, self.batch_rest, &self.header, &self.payload);
        if got != self.checksum {
            return Err(StoreError::ChecksumMismatch {
                serial: self.serial,
                expected: self.checksum,
                got,
            });
        }
        Ok(())
    }

    fn decode_header(&self) -> Result<FactHeader> {
        Ok(rmp_serde::from_slice(&self.header)?)
    }

    fn into_fact(self) -> Result<Fact> {
        self.verify()?;
        let header = self.decode_header()?;
        Ok(Fact {
            serial: self.serial,
            header,
            payload: self.payload,
        })
    }
}

/// Append-only fact log.
pub struct FactLog {
    /// Path to the log file.
    path: PathBuf,

    /// Handle used for appends and truncation.
    writer: Mutex<File>,

    /// Separate handle so reads don't queue behind appends.
    reader: Mutex<File>,

    /// Committed file size. Frames beyond this are not yet visible.
    file_size: RwLock<u64>,

    /// Number of batches since last sync.
    writes_since_sync: Mutex<u64>,

    /// Sync every N batches (0 and 1 both mean every batch)
    sync_interval: u64,
}

impl FactLog {
    /// Default sync interval: every batch is on disk before it is acknowledged.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 1;

    /// Open or create a fact log with default sync interval.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<RecoveredFrame>)> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a fact log, returning every intact frame so the
    /// caller can rebuild its indices. An incomplete batch at the tail is
    /// cut off as a whole.
    pub fn open_with_sync_interval(
        path: impl AsRef<Path>,
        sync_interval: u64,
    ) -> Result<(Self, Vec<RecoveredFrame>)> {
        let path = path.as_ref().to_path_buf();

        let writer = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let reader = File::open(&path)?;

        let (frames, valid_len) = Self::recover(&reader)?;

        let file_size = writer.metadata()?.len();
        if valid_len < file_size {
            warn!(
                path = %path.display(),
                valid_len,
                file_size,
                "truncating torn tail of fact log"
            );
            writer.set_len(valid_len)?;
            writer.sync_all()?;
        }

        debug!(path = %path.display(), facts = frames.len(), "fact log opened");

        Ok((
            Self {
                path,
                writer: Mutex::new(writer),
                reader: Mutex::new(reader),
                file_size: RwLock::new(valid_len),
                writes_since_sync: Mutex::new(0),
                sync_interval: sync_interval.max(1),
            },
            frames,
        ))
    }

    /// Append a batch of facts as one contiguous write.
    ///
    /// Either every frame lands or the file is cut back to its previous
    /// length. Returns the offset of each frame.
    pub fn append_batch(&self, facts: &[Fact]) -> Result<Vec<u64>> {
        let mut file = self.writer.lock();
        let start = *self.file_size.read();

        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(facts.len());
        let last = facts.len().saturating_sub(1);
        for (i, fact) in facts.iter().enumerate() {
            offsets.push(start + buf.len() as u64);
            let rest = u32::try_from(last - i)
                .map_err(|_| StoreError::Validation("batch too large".into()))?;
            encode_frame(&mut buf, fact, rest)?;
        }

        if let Err(e) = Self::write_at(&mut file, start, &buf) {
            warn!(error = %e, start, "batch write failed, rolling back");
            file.set_len(start)?;
            return Err(e);
        }

        let mut writes = self.writes_since_sync.lock();
        *writes += 1;
        if *writes >= self.sync_interval {
            if let Err(e) = file.sync_data() {
                file.set_len(start)?;
                return Err(e.into());
            }
            *writes = 0;
        }

        *self.file_size.write() = start + buf.len() as u64;
        Ok(offsets)
    }

    fn write_at(file: &mut File, offset: u64, buf: &[u8]) -> Result<()> {
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let file = self.writer.lock();
        file.sync_all()?;
        *self.writes_since_sync.lock() = 0;
        Ok(())
    }

    /// Read the fact stored at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<Fact> {
        let size = *self.file_size.read();
        if offset >= size {
            return Err(StoreError::Corruption(format!(
                "offset {} beyond end of log ({})",
                offset, size
            )));
        }

        let mut file = self.reader.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(&mut *file);
        read_frame(&mut reader, size - offset)?.into_fact()
    }

    /// Get current committed size.
    pub fn size(&self) -> u64 {
        *self.file_size.read()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scan every frame. Returns the frames of every complete batch and the
    /// length of the file prefix holding them.
    fn recover(file: &File) -> Result<(Vec<RecoveredFrame>, u64)> {
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut frames = Vec::new();
        let mut pending: Vec<RecoveredFrame> = Vec::new();
        let mut expected_rest: Option<u32> = None;
        let mut offset = 0u64;
        let mut committed = 0u64;
        let mut last = Serial::ZERO;

        while offset < file_size {
            let raw = match read_frame(&mut reader, file_size - offset) {
                Ok(raw) => raw,
                Err(StoreError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };

            let end = offset + raw.len();
            if let Err(e) = raw.verify() {
                // Only the last frame may be torn.
                if end == file_size {
                    warn!(offset, serial = %raw.serial, "dropping torn frame at tail");
                    break;
                }
                return Err(e);
            }

            if raw.serial <= last {
                return Err(StoreError::Corruption(format!(
                    "serial {} follows {} at offset {}",
                    raw.serial, last, offset
                )));
            }
            if let Some(expected) = expected_rest {
                if raw.batch_rest != expected {
                    return Err(StoreError::Corruption(format!(
                        "frame at offset {} breaks its batch ({} frames expected after it, found {})",
                        offset, expected, raw.batch_rest
                    )));
                }
            }
            last = raw.serial;

            pending.push(RecoveredFrame {
                offset,
                serial: raw.serial,
                header: raw.decode_header()?,
            });
            offset = end;

            if raw.batch_rest == 0 {
                frames.append(&mut pending);
                committed = offset;
                expected_rest = None;
            } else {
                expected_rest = Some(raw.batch_rest - 1);
            }
        }

        if !pending.is_empty() {
            warn!(
                dropped = pending.len(),
                offset = committed,
                "dropping incomplete batch at tail"
            );
        }

        Ok((frames, committed))
    }
}

fn frame_checksum(serial: Serial, batch_rest: u32, header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&serial.0.to_le_bytes());
    hasher.update(&batch_rest.to_le_bytes());
    hasher.update(header);
    hasher.update(payload);
    hasher.finalize()
}

fn encode_frame(buf: &mut Vec<u8>, fact: &Fact, batch_rest: u32) -> Result<()> {
    let header = rmp_serde::to_vec_named(&fact.header)?;
    let header_len = u32::try_from(header.len())
        .map_err(|_| StoreError::Validation("fact header too large".into()))?;
    let payload_len = u32::try_from(fact.payload.len())
        .map_err(|_| StoreError::Validation("fact payload too large".into()))?;

    buf.extend_from_slice(LOG_MAGIC);
    buf.push(LOG_VERSION);
    buf.extend_from_slice(&fact.serial.0.to_le_bytes());
    buf.extend_from_slice(&batch_rest.to_le_bytes());
    buf.extend_from_slice(&header_len.to_le_bytes());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&payload_len.to_le_bytes());
    buf.extend_from_slice(&fact.payload);
    let checksum = frame_checksum(fact.serial, batch_rest, &header, &fact.payload);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(())
}

/// Read one frame. `remaining` bounds the length fields so a torn frame
/// reports `UnexpectedEof` instead of allocating garbage sizes.
fn read_frame<R: Read>(reader: &mut R, remaining: u64) -> Result<RawFrame> {
    let eof = || StoreError::Io(ErrorKind::UnexpectedEof.into());

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != LOG_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid frame magic".into()));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != LOG_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported log version: {}",
            version[0]
        )));
    }

    let mut serial_bytes = [0u8; 8];
    reader.read_exact(&mut serial_bytes)?;
    let serial = Serial(u64::from_le_bytes(serial_bytes));

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let batch_rest = u32::from_le_bytes(len_bytes);

    reader.read_exact(&mut len_bytes)?;
    let header_len = u32::from_le_bytes(len_bytes) as u64;
    if FRAME_OVERHEAD + header_len > remaining {
        return Err(eof());
    }
    let mut header = vec![0u8; header_len as usize];
    reader.read_exact(&mut header)?;

    reader.read_exact(&mut len_bytes)?;
    let payload_len = u32::from_le_bytes(len_bytes) as u64;
    if FRAME_OVERHEAD + header_len + payload_len > remaining {
        return Err(eof());
    }
    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;

    Ok(RawFrame {
        serial,
        batch_rest,
        header,
        payload,
        checksum: u32::from_le_bytes(checksum_bytes),
    })
}
