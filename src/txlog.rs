//! Append-only journal of reference updates.
//!
//! Every compare-and-swap on the reference table is written here as an `intent` record before the
//! new value is published, and confirmed with an `applied` record afterwards. After a crash, an
//! intent without its confirmation is the source of truth for what the writer meant to do; see
//! [`crate::refs::RefTable::recover`].
//!
//! # Format
//!
//! One record per line:
//!
//! ```text
//! base 0
//! intent 1 1658312219 refs/heads/main 0000…0000 8d1f…3b2a	commit: initial
//! applied 1
//! ```
//!
//! The first line is always a `base` record: every intent in the file has a greater sequence
//! number. Truncation raises the base, so sequence numbers are never reused. Absent reference
//! values are written as the null digest.

use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_till1, take_while_m_n},
    character::complete::{char, i64 as parse_i64, u64 as parse_u64},
    combinator::{all_consuming, map, map_res, opt, rest},
    sequence::{preceded, tuple},
    IResult,
};
use parking_lot::Mutex;
use tracing::*;

use crate::digest::Digest;
use crate::refs::RefName;
use crate::util;
use crate::{Error, Result};

/// Log sequence number. Strictly increasing across the life of a repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reference update, as the writer intends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub name: RefName,
    pub old: Option<Digest>,
    pub new: Option<Digest>,
    pub message: String,
}

/// A logged [`RefUpdate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub lsn: Lsn,
    /// Wall-clock unix seconds, for display only. Ordering comes from `lsn`.
    pub at: i64,
    pub update: RefUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Base(Lsn),
    Intent(LogEntry),
    Applied(Lsn),
}

impl Record {
    fn parse(line: &str) -> Option<Self> {
        all_consuming(record)(line).ok().map(|(_, record)| record)
    }
}

fn digest_or_null(digest: &Option<Digest>) -> String {
    digest.as_ref().unwrap_or(&Digest::NULL).to_hex()
}

impl Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Record::Base(lsn) => write!(f, "base {lsn}"),
            Record::Applied(lsn) => write!(f, "applied {lsn}"),
            Record::Intent(entry) => {
                let update = &entry.update;
                write!(
                    f,
                    "intent {} {} {} {} {}",
                    entry.lsn,
                    entry.at,
                    update.name,
                    digest_or_null(&update.old),
                    digest_or_null(&update.new),
                )?;
                if !update.message.is_empty() {
                    write!(f, "\t{}", update.message)?;
                }
                Ok(())
            }
        }
    }
}

fn lsn(i: &str) -> IResult<&str, Lsn> {
    map(parse_u64, Lsn)(i)
}

fn digest(i: &str) -> IResult<&str, Option<Digest>> {
    map_res(
        take_while_m_n(64, 64, |c: char| c.is_ascii_hexdigit()),
        |hex: &str| hex.parse::<Digest>().map(|d| (!d.is_null()).then_some(d)),
    )(i)
}

fn ref_name(i: &str) -> IResult<&str, RefName> {
    map_res(take_till1(|c: char| c == ' ' || c == '\t'), |s: &str| {
        RefName::new(s)
    })(i)
}

fn intent(i: &str) -> IResult<&str, LogEntry> {
    map(
        tuple((
            preceded(tag("intent "), lsn),
            preceded(char(' '), parse_i64),
            preceded(char(' '), ref_name),
            preceded(char(' '), digest),
            preceded(char(' '), digest),
            opt(preceded(char('\t'), rest)),
        )),
        |(lsn, at, name, old, new, message)| LogEntry {
            lsn,
            at,
            update: RefUpdate {
                name,
                old,
                new,
                message: message.unwrap_or_default().to_owned(),
            },
        },
    )(i)
}

fn record(i: &str) -> IResult<&str, Record> {
    alt((
        map(preceded(tag("base "), lsn), Record::Base),
        map(preceded(tag("applied "), lsn), Record::Applied),
        map(intent, Record::Intent),
    ))(i)
}

/// What an appender needs to know about the end of the file.
#[derive(Debug, Default)]
struct Tail {
    base: Lsn,
    last: Lsn,
    len: u64,
}

pub struct TransactionLog {
    path: Utf8PathBuf,
    guard_path: Utf8PathBuf,
    fsync: bool,
    tail: Mutex<Option<Tail>>,
}

impl TransactionLog {
    pub fn new(path: impl AsRef<Utf8Path>, fsync: bool) -> Self {
        let path = path.as_ref().to_owned();
        let mut guard_path = path.as_str().to_owned();
        guard_path.push_str(".guard");
        Self {
            path,
            guard_path: guard_path.into(),
            fsync,
            tail: Mutex::new(None),
        }
    }

    /// Create an empty log, unless one exists already.
    pub fn create(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        util::write_atomic(
            &self.path,
            format!("{}\n", Record::Base(Lsn(0))).as_bytes(),
            self.fsync,
        )
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Run `f` with the log opened for appending, holding the cross-process guard, and with an
    /// up-to-date view of the tail.
    fn with_tail<T>(&self, f: impl FnOnce(&mut File, &mut Tail) -> Result<T>) -> Result<T> {
        let mut cached = self.tail.lock();

        let guard = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.guard_path)?;
        guard.lock_exclusive()?;

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)?;

        let tail = self.refresh(&mut file, cached.take())?;
        let tail = cached.insert(tail);
        let result = f(&mut file, tail);

        // A failed write may have left a partial record behind.
        if result.is_err() {
            *cached = None;
        }
        FileExt::unlock(&guard)?;
        result
    }

    /// Bring the cached tail up to date with the file, cutting off a torn final record.
    fn refresh(&self, file: &mut File, cached: Option<Tail>) -> Result<Tail> {
        let len = file.metadata()?.len();

        file.seek(SeekFrom::Start(0))?;
        let mut first = String::new();
        BufReader::new(&mut *file).read_line(&mut first)?;
        let base = match Record::parse(first.trim_end_matches('\n')) {
            Some(Record::Base(base)) => base,
            _ => {
                return Err(Error::CorruptLog {
                    line: 1,
                    reason: "missing base record".to_owned(),
                })
            }
        };

        let mut tail = match cached {
            Some(tail) if tail.base == base && tail.len <= len => tail,
            _ => Tail {
                base,
                last: base,
                len: 0,
            },
        };
        if tail.len == len {
            return Ok(tail);
        }

        file.seek(SeekFrom::Start(tail.len))?;
        let mut unread = Vec::new();
        file.read_to_end(&mut unread)?;

        let complete = match memchr::memrchr(b'\n', &unread) {
            Some(idx) => idx + 1,
            None => 0,
        };
        if complete < unread.len() {
            warn!(
                path = %self.path,
                bytes = unread.len() - complete,
                "Dropping torn record at end of transaction log"
            );
            file.set_len(tail.len + complete as u64)?;
        }

        for line in unread[..complete].split(|&b| b == b'\n') {
            if let Some(Record::Intent(entry)) =
                std::str::from_utf8(line).ok().and_then(Record::parse)
            {
                tail.last = tail.last.max(entry.lsn);
            }
        }
        tail.len += complete as u64;

        Ok(tail)
    }

    fn write_line(&self, file: &mut File, tail: &mut Tail, record: &Record) -> Result<()> {
        let line = format!("{record}\n");
        file.write_all(line.as_bytes())?;
        if self.fsync {
            file.sync_data()?;
        }
        tail.len += line.len() as u64;
        Ok(())
    }

    /// Durably record an intended update and return its sequence number.
    pub fn append(&self, update: &RefUpdate) -> Result<Lsn> {
        let mut update = update.clone();
        update.message = update.message.replace(['\n', '\t'], " ");

        self.with_tail(|file, tail| {
            let entry = LogEntry {
                lsn: tail.last.next(),
                at: chrono::Utc::now().timestamp(),
                update,
            };
            self.write_line(file, tail, &Record::Intent(entry.clone()))?;
            tail.last = entry.lsn;

            debug!(
                lsn = %entry.lsn,
                name = %entry.update.name,
                old = %digest_or_null(&entry.update.old),
                new = %digest_or_null(&entry.update.new),
                "Appended intent"
            );
            Ok(entry.lsn)
        })
    }

    /// Record that the update logged as `lsn` has been published.
    pub fn mark_applied(&self, lsn: Lsn) -> Result<()> {
        self.with_tail(|file, tail| self.write_line(file, tail, &Record::Applied(lsn)))?;
        trace!(%lsn, "Marked applied");
        Ok(())
    }

    /// Lazily read every record concerning sequence numbers at or after `from`.
    pub fn replay(&self, from: Lsn) -> Result<Replay> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::NotARepository(self.path.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Replay {
            reader: BufReader::new(file),
            from,
            line: 0,
            done: false,
        })
    }

    /// Intents at or after `from` that were never confirmed, oldest first.
    pub fn pending(&self, from: Lsn) -> Result<Vec<LogEntry>> {
        let mut intents = Vec::new();
        let mut applied = std::collections::HashSet::new();
        for record in self.replay(from)? {
            match record? {
                Record::Intent(entry) => intents.push(entry),
                Record::Applied(lsn) => {
                    applied.insert(lsn);
                }
                Record::Base(_) => {}
            }
        }
        intents.retain(|entry| !applied.contains(&entry.lsn));
        Ok(intents)
    }

    /// All logged updates of one reference, oldest first.
    pub fn entries_for(&self, name: &RefName) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        for record in self.replay(Lsn(0))? {
            if let Record::Intent(entry) = record? {
                if entry.update.name == *name {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    /// Drop every record with a sequence number below `before`.
    ///
    /// Fails with [`Error::Unsafe`] if one of them is an intent that was never confirmed, since
    /// recovery would still need it.
    pub fn truncate(&self, before: Lsn) -> Result<()> {
        self.with_tail(|_, tail| {
            let mut records = Vec::new();
            for record in self.replay(Lsn(0))? {
                records.push(record?);
            }

            let applied = records
                .iter()
                .filter_map(|r| match r {
                    Record::Applied(lsn) => Some(*lsn),
                    _ => None,
                })
                .collect::<std::collections::HashSet<_>>();

            if let Some(unconfirmed) = records.iter().find_map(|r| match r {
                Record::Intent(e) if e.lsn < before && !applied.contains(&e.lsn) => Some(e.lsn),
                _ => None,
            }) {
                return Err(Error::Unsafe(unconfirmed));
            }

            let before_count = records.len();
            records.retain(|r| match r {
                Record::Base(_) => false,
                Record::Intent(e) => e.lsn >= before,
                Record::Applied(lsn) => *lsn >= before,
            });
            if records.len() + 1 == before_count {
                trace!(%before, "Nothing to truncate");
                return Ok(());
            }

            let base = Lsn(before.0.saturating_sub(1).min(tail.last.0)).max(tail.base);
            let mut contents = format!("{}\n", Record::Base(base));
            for record in &records {
                contents.push_str(&format!("{record}\n"));
            }
            util::write_atomic(&self.path, contents.as_bytes(), self.fsync)?;

            debug!(%before, %base, kept = records.len(), "Truncated transaction log");
            *tail = Tail {
                base,
                last: tail.last,
                len: contents.len() as u64,
            };
            Ok(())
        })
    }
}

/// Iterator returned by [`TransactionLog::replay`].
///
/// A final line without a newline is a record whose write was cut short; it is never yielded.
pub struct Replay {
    reader: BufReader<File>,
    from: Lsn,
    line: usize,
    done: bool,
}

impl Iterator for Replay {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let mut buf = Vec::new();
            match self.reader.read_until(b'\n', &mut buf) {
                Ok(0) => self.done = true,
                Ok(_) if buf.last() != Some(&b'\n') => {
                    warn!(line = self.line + 1, "Ignoring torn record at end of transaction log");
                    self.done = true;
                }
                Ok(_) => {
                    self.line += 1;
                    let record = std::str::from_utf8(&buf[..buf.len() - 1])
                        .ok()
                        .and_then(Record::parse);
                    let record = match record {
                        Some(record) => record,
                        None => {
                            self.done = true;
                            return Some(Err(Error::CorruptLog {
                                line: self.line,
                                reason: "unparseable record".to_owned(),
                            }));
                        }
                    };
                    let lsn = match &record {
                        Record::Base(_) => continue,
                        Record::Intent(entry) => entry.lsn,
                        Record::Applied(lsn) => *lsn,
                    };
                    if lsn >= self.from {
                        return Some(Ok(record));
                    }
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempdir::TempDir;

    fn log(dir: &TempDir) -> TransactionLog {
        let path = Utf8Path::from_path(dir.path()).unwrap().join("txlog");
        let log = TransactionLog::new(path, false);
        log.create().unwrap();
        log
    }

    fn update(name: &str, new: &[u8]) -> RefUpdate {
        RefUpdate {
            name: RefName::branch(name).unwrap(),
            old: None,
            new: Some(Digest::new(new)),
            message: "test".to_owned(),
        }
    }

    #[test]
    fn test_record_format() {
        let entry = LogEntry {
            lsn: Lsn(7),
            at: 1658312219,
            update: RefUpdate {
                name: RefName::branch("main").unwrap(),
                old: None,
                new: Some(Digest::new(b"x")),
                message: "commit: hello world".to_owned(),
            },
        };
        let line = Record::Intent(entry.clone()).to_string();
        assert_eq!(
            line,
            format!(
                "intent 7 1658312219 refs/heads/main {} {}\tcommit: hello world",
                "0".repeat(64),
                Digest::new(b"x")
            )
        );
        assert_eq!(Record::parse(&line), Some(Record::Intent(entry)));
        assert_eq!(Record::parse("applied 3"), Some(Record::Applied(Lsn(3))));
        assert_eq!(Record::parse("applied 3 "), None);
        assert_eq!(Record::parse("intent x"), None);
    }

    #[test]
    fn test_lsns_increase() -> Result<()> {
        let dir = TempDir::new("")?;
        let log = log(&dir);

        let a = log.append(&update("a", b"1"))?;
        let b = log.append(&update("b", b"2"))?;
        assert_eq!(a, Lsn(1));
        assert_eq!(b, Lsn(2));

        // A second handle on the same file continues the sequence.
        let other = TransactionLog::new(log.path(), false);
        assert_eq!(other.append(&update("c", b"3"))?, Lsn(3));
        assert_eq!(log.append(&update("d", b"4"))?, Lsn(4));
        Ok(())
    }

    #[test]
    fn test_pending_and_replay() -> Result<()> {
        let dir = TempDir::new("")?;
        let log = log(&dir);

        let a = log.append(&update("a", b"1"))?;
        let b = log.append(&update("b", b"2"))?;
        log.mark_applied(a)?;

        let pending = log.pending(Lsn(0))?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].lsn, b);

        let replayed = log.replay(b)?.collect::<Result<Vec<_>>>()?;
        assert_eq!(replayed.len(), 1);
        assert!(matches!(&replayed[0], Record::Intent(e) if e.lsn == b));
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_ignored_and_cut() -> Result<()> {
        let dir = TempDir::new("")?;
        let log = log(&dir);
        log.append(&update("a", b"1"))?;

        std::fs::OpenOptions::new()
            .append(true)
            .open(log.path())?
            .write_all(b"intent 2 16583")?;

        let fresh = TransactionLog::new(log.path(), false);
        assert_eq!(fresh.replay(Lsn(0))?.count(), 1);

        assert_eq!(fresh.append(&update("b", b"2"))?, Lsn(2));
        let records = fresh.replay(Lsn(0))?.collect::<Result<Vec<_>>>()?;
        assert_eq!(records.len(), 2);
        Ok(())
    }

    #[test]
    fn test_garbage_line_is_corrupt() -> Result<()> {
        let dir = TempDir::new("")?;
        let log = log(&dir);
        std::fs::OpenOptions::new()
            .append(true)
            .open(log.path())?
            .write_all(b"nonsense\n")?;

        let err = log.replay(Lsn(0))?.next().unwrap().unwrap_err();
        assert!(matches!(err, Error::CorruptLog { line: 2, .. }));
        Ok(())
    }

    #[test]
    fn test_truncate() -> Result<()> {
        let dir = TempDir::new("")?;
        let log = log(&dir);

        let a = log.append(&update("a", b"1"))?;
        log.mark_applied(a)?;
        let b = log.append(&update("b", b"2"))?;

        assert!(matches!(log.truncate(Lsn(3)), Err(Error::Unsafe(lsn)) if lsn == b));

        log.truncate(b)?;
        let records = log.replay(Lsn(0))?.collect::<Result<Vec<_>>>()?;
        assert_eq!(records.len(), 1);
        assert!(std::fs::read_to_string(log.path())?.starts_with("base 1\n"));

        log.mark_applied(b)?;
        log.truncate(Lsn(3))?;
        assert_eq!(log.replay(Lsn(0))?.count(), 0);

        // Sequence numbers are not reused after the log is emptied.
        assert_eq!(log.append(&update("c", b"3"))?, Lsn(3));
        Ok(())
    }

    #[test]
    fn test_entries_for() -> Result<()> {
        let dir = TempDir::new("")?;
        let log = log(&dir);
        log.append(&update("a", b"1"))?;
        log.append(&update("b", b"2"))?;
        log.append(&update("a", b"3"))?;

        let entries = log.entries_for(&RefName::branch("a").unwrap())?;
        assert_eq!(
            entries.iter().map(|e| e.lsn).collect::<Vec<_>>(),
            vec![Lsn(1), Lsn(3)]
        );
        Ok(())
    }
}
