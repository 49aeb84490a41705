// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Error, Gid};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    fs::{self, File, OpenOptions},
    io::{Cursor, ErrorKind, Read, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, error, trace, warn};

/// Fixed width of the textual gid in every record, including its NUL padding.
pub const TMGIDSIZE: usize = 100;

const RECORD_LEN: usize = 1 + TMGIDSIZE + 4;

const TAG_COMMITTED: u8 = 1;
const TAG_FORGET: u8 = 2;

/// The durable payload naming a distributed transaction.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct GxactLog {
    pub gid: Gid,
}

/// A `DtxLogRecord` is either the commit point of a distributed transaction
/// or the note that every participant acknowledged its commit.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub enum DtxLogRecord {
    DistributedCommit(GxactLog),
    DistributedForget(GxactLog),
}

impl DtxLogRecord {
    pub fn gid(&self) -> Gid {
        match self {
            DtxLogRecord::DistributedCommit(g) | DtxLogRecord::DistributedForget(g) => g.gid,
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, Error> {
        let (tag, log) = match self {
            DtxLogRecord::DistributedCommit(g) => (TAG_COMMITTED, g),
            DtxLogRecord::DistributedForget(g) => (TAG_FORGET, g),
        };
        let text = log.gid.to_string();
        if text.len() >= TMGIDSIZE {
            error!("gid {} does not fit in a log record", text);
            return Err(Error::InvariantViolation(format!(
                "distribute transaction identifier too long ({})",
                text.len()
            )));
        }
        let mut buf = Vec::with_capacity(RECORD_LEN);
        buf.write_u8(tag)?;
        buf.extend_from_slice(text.as_bytes());
        buf.resize(1 + TMGIDSIZE, 0);
        buf.write_u32::<BigEndian>(log.gid.gxid)?;
        Ok(buf)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != RECORD_LEN {
            return Err(Error::BadLogRecord(format!(
                "record length {} (expected {})",
                bytes.len(),
                RECORD_LEN
            )));
        }
        let mut cur = Cursor::new(bytes);
        let tag = cur.read_u8()?;
        let mut text = [0u8; TMGIDSIZE];
        cur.read_exact(&mut text)?;
        let gxid = cur.read_u32::<BigEndian>()?;
        let end = text.iter().position(|b| *b == 0).unwrap_or(TMGIDSIZE);
        let text = std::str::from_utf8(&text[..end])
            .map_err(|_| Error::BadLogRecord("gid is not utf-8".into()))?;
        let gid: Gid = text.parse()?;
        if gid.gxid != gxid {
            return Err(Error::BadLogRecord(format!(
                "gid {} does not match gxid {}",
                gid, gxid
            )));
        }
        let log = GxactLog { gid };
        match tag {
            TAG_COMMITTED => Ok(DtxLogRecord::DistributedCommit(log)),
            TAG_FORGET => Ok(DtxLogRecord::DistributedForget(log)),
            t => Err(Error::BadLogRecord(format!("unknown record tag {}", t))),
        }
    }
}

fn decode_all(bytes: &[u8]) -> Result<Vec<DtxLogRecord>, Error> {
    if bytes.len() % RECORD_LEN != 0 {
        return Err(Error::BadLogRecord(format!(
            "log length {} is not a multiple of the record length {}",
            bytes.len(),
            RECORD_LEN
        )));
    }
    bytes.chunks(RECORD_LEN).map(DtxLogRecord::decode).collect()
}

/// A `DtxLog` is the coordinator's durable record of commit points and
/// forget notes. Clients provide an implementation and pass it to
/// [crate::TmShared::new].
///
/// `append` must not return until the record is durable: a committed record
/// that reports success and is later lost would let crash recovery abort a
/// transaction some segment already committed.
pub trait DtxLog: Send + Sync + 'static {
    fn append(&mut self, rec: &DtxLogRecord) -> Result<(), Error>;

    /// Every record appended so far, oldest first.
    fn replay(&self) -> Result<Vec<DtxLogRecord>, Error>;
}

/// A volatile [DtxLog]; "durable" for as long as the value lives.
#[derive(Clone, Debug, Default)]
pub struct MemDtxLog {
    records: Vec<DtxLogRecord>,
}

impl MemDtxLog {
    pub fn new() -> Self {
        MemDtxLog::default()
    }

    pub fn from_records(records: Vec<DtxLogRecord>) -> Self {
        MemDtxLog { records }
    }
}

impl DtxLog for MemDtxLog {
    fn append(&mut self, rec: &DtxLogRecord) -> Result<(), Error> {
        self.records.push(*rec);
        Ok(())
    }

    fn replay(&self) -> Result<Vec<DtxLogRecord>, Error> {
        Ok(self.records.clone())
    }
}

/// A [DtxLog] backed by an append-only file of fixed-width records, synced on
/// every append.
///
/// A crash in the middle of an append leaves a partial last record. It was
/// never synced, so no commit point depends on it, and [FileDtxLog::open]
/// cuts it off.
pub struct FileDtxLog {
    path: PathBuf,
    file: File,
    // A failed append could not be cut back; further appends would land
    // misaligned.
    poisoned: bool,
}

impl FileDtxLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        let torn = len % RECORD_LEN as u64;
        if torn != 0 {
            warn!(
                "dropping a partial {}-byte record at the end of {:?}",
                torn, path
            );
            file.set_len(len - torn)?;
            file.sync_data()?;
        }
        debug!("opened distributed transaction log {:?}", path);
        Ok(FileDtxLog {
            path,
            file,
            poisoned: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DtxLog for FileDtxLog {
    fn append(&mut self, rec: &DtxLogRecord) -> Result<(), Error> {
        if self.poisoned {
            return Err(Error::LogIo(format!(
                "{:?} ends in a partial record; reopen it to repair",
                self.path
            )));
        }
        let bytes = rec.encode()?;
        let len = self.file.metadata()?.len();
        if let Err(e) = self
            .file
            .write_all(&bytes)
            .and_then(|()| self.file.sync_data())
        {
            error!("appending {:?} to {:?} failed: {}", rec, self.path, e);
            if let Err(cut) = self.file.set_len(len) {
                error!("could not cut {:?} back to {} bytes: {}", self.path, len, cut);
                self.poisoned = true;
            }
            return Err(e.into());
        }
        trace!("appended {:?} to {:?}", rec, self.path);
        Ok(())
    }

    fn replay(&self) -> Result<Vec<DtxLogRecord>, Error> {
        let bytes = fs::read(&self.path)?;
        decode_all(&bytes)
    }
}

/// The redo file used while the coordinator runs in utility mode: segments
/// are unreachable, so committed and forget redo is buffered here and
/// consumed by the next crash recovery in dispatch mode.
#[derive(Clone, Debug)]
pub struct RedoFile {
    path: PathBuf,
}

impl RedoFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        RedoFile {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, rec: &DtxLogRecord) -> Result<(), Error> {
        let bytes = rec.encode()?;
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let len = f.metadata()?.len();
        if let Err(e) = (&f).write_all(&bytes).and_then(|()| f.sync_data()) {
            error!("saving {:?} to redo file {:?} failed: {}", rec, self.path, e);
            f.set_len(len)?;
            return Err(e.into());
        }
        trace!("saved {:?} to redo file {:?}", rec, self.path);
        Ok(())
    }

    /// Buffered records, oldest first. A missing file holds nothing.
    pub fn replay(&self) -> Result<Vec<DtxLogRecord>, Error> {
        match fs::read(&self.path) {
            Ok(bytes) => {
                let whole = bytes.len() - bytes.len() % RECORD_LEN;
                if whole != bytes.len() {
                    warn!("ignoring a partial record at the end of {:?}", self.path);
                }
                decode_all(&bytes[..whole])
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove(&self) -> Result<(), Error> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("could not remove redo file {:?}: {}", self.path, e);
                Err(e.into())
            }
        }
    }
}
