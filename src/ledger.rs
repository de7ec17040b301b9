// =============================================================================
// Lifecycle Ledger — append-only JSONL event log
// =============================================================================
//
// The ledger is the single source of truth for ordering. Every signal and
// position mutation is written here (and fsynced) before any in-memory index
// sees it. Indices are derived: on restart they are rebuilt from the latest
// snapshot plus the ledger tail.
//
// One JSON object per line keeps the format self-describing and resilient to
// torn writes: a crash mid-append leaves at most one incomplete final line,
// which `open` truncates.
//
// Writers go through `transact`, which holds the ledger lock for the whole
// validate → append → apply sequence. That keeps in-memory indices updated in
// exactly ledger order.
// =============================================================================

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::LedgerError;
use crate::gates::GateVerdict;
use crate::lifecycle::{Signal, SignalState};
use crate::position_store::Position;

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

/// One ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Strictly increasing, gap-free sequence number.
    pub seq: u64,
    /// Signal id or position key the event is about.
    pub subject_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: EventKind,
}

/// Event type + payload, serialised as `{"event_type": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    SignalGenerated(Signal),
    SignalTransition {
        from: SignalState,
        to: SignalState,
        #[serde(default)]
        reason: Option<String>,
    },
    GateVerdicts {
        verdicts: Vec<GateVerdict>,
        size_multiplier: f64,
    },
    PositionOpened(Position),
    PositionUpdated(Position),
    PositionClosed(Position),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SignalGenerated(_) => "signal_generated",
            Self::SignalTransition { .. } => "signal_transition",
            Self::GateVerdicts { .. } => "gate_verdicts",
            Self::PositionOpened(_) => "position_opened",
            Self::PositionUpdated(_) => "position_updated",
            Self::PositionClosed(_) => "position_closed",
        }
    }
}

/// Result of reading the ledger from disk.
#[derive(Debug, Default)]
pub struct LedgerScan {
    pub events: Vec<LedgerEvent>,
    /// 1-based line numbers that could not be decoded.
    pub corrupt_lines: Vec<usize>,
}

impl LedgerScan {
    pub fn is_clean(&self) -> bool {
        self.corrupt_lines.is_empty()
    }

    pub fn last_seq(&self) -> u64 {
        self.events.last().map(|e| e.seq).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

struct Writer {
    file: File,
    len: u64,
    next_seq: u64,
    /// Set when a partial record may still be on disk. No further appends
    /// are accepted until the ledger is reopened, which repairs the tail.
    poisoned: bool,
}

/// Durable append-only log shared by the signal lifecycle and position store.
pub struct Ledger {
    path: PathBuf,
    writer: Mutex<Writer>,
    lock_timeout: Duration,
}

/// Append handle valid for the duration of one `transact` call.
pub struct LedgerTx<'a> {
    writer: &'a mut Writer,
}

impl LedgerTx<'_> {
    /// Append one event and fsync it. On failure the file is cut back to its
    /// previous length, so no partial record survives.
    pub fn append(
        &mut self,
        subject_id: impl Into<String>,
        event: EventKind,
    ) -> Result<LedgerEvent, LedgerError> {
        let record = LedgerEvent {
            seq: self.writer.next_seq,
            subject_id: subject_id.into(),
            timestamp: Utc::now(),
            event,
        };

        let w = &mut *self.writer;
        if w.poisoned {
            return Err(LedgerError::Poisoned);
        }

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let result = w
            .file
            .write_all(&line)
            .and_then(|_| w.file.flush())
            .and_then(|_| w.file.sync_data());

        if let Err(e) = result {
            error!(seq = record.seq, error = %e, "ledger append failed — rolling back partial record");
            let rollback = w
                .file
                .set_len(w.len)
                .and_then(|_| w.file.seek(SeekFrom::End(0)));
            if let Err(rollback_err) = rollback {
                error!(
                    seq = record.seq,
                    error = %rollback_err,
                    "ledger rollback failed — refusing further appends until reopened"
                );
                w.poisoned = true;
            }
            return Err(LedgerError::Io(e));
        }

        w.len += line.len() as u64;
        w.next_seq += 1;

        debug!(
            seq = record.seq,
            subject = %record.subject_id,
            event_type = record.event.name(),
            "ledger event appended"
        );
        Ok(record)
    }

    /// Sequence number of the most recently appended event (0 if none).
    pub fn last_seq(&self) -> u64 {
        self.writer.next_seq - 1
    }
}

impl Ledger {
    /// Open (or create) the ledger at `path`.
    ///
    /// A torn final line left by a crash mid-append is truncated. Interior
    /// corruption is left in place and reported by `read_since`.
    pub fn open(path: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let (valid_len, last_seq) = repair_tail(&path)?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        file.seek(SeekFrom::End(0))?;

        info!(path = %path.display(), last_seq, bytes = valid_len, "ledger opened");

        Ok(Self {
            path,
            writer: Mutex::new(Writer {
                file,
                len: valid_len,
                next_seq: last_seq + 1,
                poisoned: false,
            }),
            lock_timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` while holding the ledger lock.
    ///
    /// Everything `f` appends is durable before it returns, and no other
    /// writer can interleave, so `f` may update an in-memory index directly
    /// after each append.
    pub fn transact<R, E>(&self, f: impl FnOnce(&mut LedgerTx<'_>) -> Result<R, E>) -> Result<R, E>
    where
        E: From<LedgerError>,
    {
        let mut guard = self
            .writer
            .try_lock_for(self.lock_timeout)
            .ok_or(LedgerError::LockTimeout(self.lock_timeout))?;
        let mut tx = LedgerTx { writer: &mut *guard };
        f(&mut tx)
    }

    /// Sequence number of the last durable event.
    pub fn last_seq(&self) -> Result<u64, LedgerError> {
        let guard = self
            .writer
            .try_lock_for(self.lock_timeout)
            .ok_or(LedgerError::LockTimeout(self.lock_timeout))?;
        Ok(guard.next_seq - 1)
    }

    /// Read every event with `seq > after` from disk.
    pub fn read_since(&self, after: u64) -> Result<LedgerScan, LedgerError> {
        read_events(&self.path, after)
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").field("path", &self.path).finish()
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Read events with `seq > after` from `path`. A missing file is an empty
/// ledger.
pub fn read_events(path: &Path, after: u64) -> Result<LedgerScan, LedgerError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LedgerScan::default()),
        Err(e) => return Err(e.into()),
    };

    let mut scan = LedgerScan::default();
    let mut prev_seq = 0u64;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut line_no = 0usize;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_no += 1;
        // A record without its newline is still being appended.
        if buf.last() != Some(&b'\n') {
            debug!(line = line_no, "stopping at unterminated ledger record");
            break;
        }
        let line = &buf[..buf.len() - 1];
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<LedgerEvent>(line) {
            Ok(event) if event.seq > prev_seq => {
                prev_seq = event.seq;
                if event.seq > after {
                    scan.events.push(event);
                }
            }
            Ok(event) => {
                error!(line = line_no, seq = event.seq, prev_seq, "ledger sequence went backwards");
                scan.corrupt_lines.push(line_no);
            }
            Err(e) => {
                error!(line = line_no, error = %e, "undecodable ledger record");
                scan.corrupt_lines.push(line_no);
            }
        }
    }

    Ok(scan)
}

/// Truncate an incomplete trailing record and return (valid length, last seq).
fn repair_tail(path: &Path) -> Result<(u64, u64), LedgerError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(e) => return Err(e.into()),
    };

    let mut valid_len = bytes.len();
    if !bytes.is_empty() && bytes[bytes.len() - 1] != b'\n' {
        // Everything after the last newline is a torn write.
        valid_len = bytes
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|p| p + 1)
            .unwrap_or(0);
        warn!(
            path = %path.display(),
            dropped_bytes = bytes.len() - valid_len,
            "truncating torn ledger tail left by an interrupted append"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_len as u64)?;
        file.sync_all()?;
    }

    let last_seq = bytes[..valid_len]
        .split(|b| *b == b'\n')
        .rev()
        .filter(|l| !l.is_empty())
        .find_map(|l| serde_json::from_slice::<LedgerEvent>(l).ok())
        .map(|e| e.seq)
        .unwrap_or(0);

    Ok((valid_len as u64, last_seq))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use std::sync::Arc;

    fn transition(from: SignalState, to: SignalState) -> EventKind {
        EventKind::SignalTransition {
            from,
            to,
            reason: None,
        }
    }

    fn open(dir: &tempfile::TempDir) -> Ledger {
        Ledger::open(dir.path().join("ledger.jsonl"), Duration::from_millis(200)).unwrap()
    }

    #[test]
    fn appends_are_sequenced_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(&dir);
        ledger
            .transact(|tx| {
                tx.append("s1", transition(SignalState::Generated, SignalState::Evaluating))?;
                tx.append("s1", transition(SignalState::Evaluating, SignalState::Approved))?;
                Ok::<_, LedgerError>(())
            })
            .unwrap();

        let scan = ledger.read_since(0).unwrap();
        assert!(scan.is_clean());
        assert_eq!(scan.events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(ledger.last_seq().unwrap(), 2);
        assert_eq!(ledger.read_since(1).unwrap().events.len(), 1);
    }

    #[test]
    fn records_are_self_describing_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(&dir);
        ledger
            .transact(|tx| tx.append("s1", transition(SignalState::Generated, SignalState::Expired)))
            .unwrap();
        let text = fs::read_to_string(ledger.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["event"]["event_type"], "signal_transition");
        assert_eq!(value["event"]["payload"]["to"], "EXPIRED");
        assert_eq!(value["subject_id"], "s1");
    }

    #[test]
    fn reopen_continues_sequence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = open(&dir);
            ledger
                .transact(|tx| tx.append("a", transition(SignalState::Generated, SignalState::Evaluating)))
                .unwrap();
        }
        let ledger = open(&dir);
        let ev = ledger
            .transact(|tx| tx.append("b", transition(SignalState::Generated, SignalState::Evaluating)))
            .unwrap();
        assert_eq!(ev.seq, 2);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        {
            let ledger = open(&dir);
            ledger
                .transact(|tx| tx.append("a", transition(SignalState::Generated, SignalState::Evaluating)))
                .unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"seq\":2,\"subject_id\":\"a\",\"timest").unwrap();
        drop(f);

        let ledger = open(&dir);
        let scan = ledger.read_since(0).unwrap();
        assert!(scan.is_clean());
        assert_eq!(scan.events.len(), 1);
        let ev = ledger
            .transact(|tx| tx.append("a", transition(SignalState::Evaluating, SignalState::Blocked)))
            .unwrap();
        assert_eq!(ev.seq, 2);
        assert_eq!(ledger.read_since(0).unwrap().events.len(), 2);
    }

    #[test]
    fn interior_garbage_is_reported_not_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        {
            let ledger = open(&dir);
            ledger
                .transact(|tx| tx.append("a", transition(SignalState::Generated, SignalState::Evaluating)))
                .unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"not json at all\n").unwrap();
        drop(f);

        let scan = read_events(&path, 0).unwrap();
        assert_eq!(scan.corrupt_lines, vec![2]);
        assert_eq!(scan.events.len(), 1);
    }

    #[test]
    fn unterminated_record_is_not_reported_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let ledger = open(&dir);
        ledger
            .transact(|tx| tx.append("a", transition(SignalState::Generated, SignalState::Evaluating)))
            .unwrap();
        // What a concurrent reader sees while the next append is mid-write.
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"seq\":2,\"subj").unwrap();
        drop(f);

        let scan = read_events(&path, 0).unwrap();
        assert!(scan.is_clean());
        assert_eq!(scan.events.len(), 1);
    }

    #[test]
    fn poisoned_writer_refuses_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let ledger = open(&dir);
        ledger
            .transact(|tx| tx.append("a", transition(SignalState::Generated, SignalState::Evaluating)))
            .unwrap();
        let before = fs::read(&path).unwrap();

        ledger.writer.lock().poisoned = true;
        let result = ledger.transact(|tx| tx.append("a", transition(SignalState::Evaluating, SignalState::Blocked)));
        assert!(matches!(result, Err(LedgerError::Poisoned)));
        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(ledger.last_seq().unwrap(), 1);

        // Reopening repairs the tail and clears the flag.
        drop(ledger);
        let ledger = open(&dir);
        let ev = ledger
            .transact(|tx| tx.append("a", transition(SignalState::Evaluating, SignalState::Blocked)))
            .unwrap();
        assert_eq!(ev.seq, 2);
    }

    #[test]
    fn failed_closure_still_leaves_prior_appends_durable() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(&dir);
        let result: Result<(), LedgerError> = ledger.transact(|tx| {
            tx.append("a", transition(SignalState::Generated, SignalState::Evaluating))?;
            Err(LedgerError::Corrupt {
                line: 0,
                detail: "caller bailed".into(),
            })
        });
        assert!(result.is_err());
        assert_eq!(ledger.read_since(0).unwrap().events.len(), 1);
    }

    #[test]
    fn lock_timeout_is_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(open(&dir));
        let inner = ledger.clone();
        let result: Result<(), LedgerError> = ledger.transact(|_| {
            // Re-entrant attempt from "another writer" while the lock is held.
            let nested = std::thread::spawn(move || inner.last_seq()).join().unwrap();
            assert!(matches!(nested, Err(LedgerError::LockTimeout(_))));
            Ok(())
        });
        assert!(result.is_ok());
    }

    #[test]
    fn position_events_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = open(&dir);
        let pos = Position::new_open("BTCUSDT", Direction::Long, 100.0, 2.0, Some("sig".into()));
        ledger
            .transact(|tx| tx.append(pos.key.to_string(), EventKind::PositionOpened(pos.clone())))
            .unwrap();
        let scan = ledger.read_since(0).unwrap();
        assert_eq!(scan.events[0].event, EventKind::PositionOpened(pos));
    }
}
