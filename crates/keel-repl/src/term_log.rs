//! Append-only log for one replication term.
//!
//! The index space is bytes. Data lands in fixed-capacity segment
//! files named by term and start index; an in-memory [`RangeSet`]
//! tracks which `[start, end)` ranges have arrived, possibly out of
//! order. Three indexes describe the log's progress:
//!
//! - `highest`: the end of the contiguous run from the start index.
//! - `commit`: the largest index durable by consensus, always
//!   `<= highest` and, once the term finishes, `<= end`.
//! - `end`: `u64::MAX` until [`TermLog::finish_term`] fixes it.
//!
//! Readers block for committed data; writers are truncated at the end
//! index; gaps are reported through
//! [`TermLog::check_for_missing_data`].

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use keel_common::error::{KeelError, KeelResult};
use keel_common::types::{LogIndex, Term};

use crate::range_set::RangeSet;

/// Commit callback: invoked with the reached commit index, or `-1` if
/// the term finished below the waited-for index.
type DelayedFn = Box<dyn FnOnce(i64) + Send>;

struct Delayed {
    wait_for: LogIndex,
    callback: DelayedFn,
}

struct Segment {
    start: LogIndex,
    file: std::fs::File,
}

struct LogState {
    ranges: RangeSet,
    highest: LogIndex,
    /// Requested commit index; the effective commit is clamped.
    pending_commit: LogIndex,
    /// Effective commit index: `min(pending, highest, end)`.
    commit: LogIndex,
    end: LogIndex,
    finished: bool,
    segments: BTreeMap<LogIndex, Segment>,
    delayed: Vec<Delayed>,
}

impl LogState {
    /// Recomputes the effective commit index and drains the delayed
    /// callbacks it satisfies.
    fn refresh_commit(&mut self, fired: &mut Vec<(DelayedFn, i64)>) -> bool {
        let effective = self.pending_commit.min(self.highest).min(self.end);
        if effective <= self.commit {
            return false;
        }
        self.commit = effective;
        let commit = self.commit;
        let mut kept = Vec::new();
        for delayed in self.delayed.drain(..) {
            if commit >= delayed.wait_for {
                fired.push((delayed.callback, commit as i64));
            } else {
                kept.push(delayed);
            }
        }
        self.delayed = kept;
        true
    }
}

/// Append-only, range-tracking log for one replication term.
pub struct TermLog {
    dir: PathBuf,
    term: Term,
    prev_term: Term,
    prev_index: LogIndex,
    start_index: LogIndex,
    segment_size: usize,
    state: Mutex<LogState>,
    commit_cond: Condvar,
}

impl TermLog {
    /// Opens (creating as needed) the log for one term.
    ///
    /// `start_index` is the first index of this term; `prev_term` and
    /// `prev_index` describe the entry just before it. Existing segment
    /// files of this term are picked up; a segment's written extent is
    /// taken from its file length.
    pub fn open(
        dir: impl AsRef<Path>,
        term: Term,
        prev_term: Term,
        prev_index: LogIndex,
        start_index: LogIndex,
        segment_size: usize,
    ) -> KeelResult<Arc<TermLog>> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut segments = BTreeMap::new();
        let mut ranges = RangeSet::new();
        let prefix = format!("term.{:016x}.", term);
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(rest) = name.strip_prefix(prefix.as_str()) else {
                continue;
            };
            let Some(hex) = rest.strip_suffix(".seg") else {
                continue;
            };
            let Ok(start) = LogIndex::from_str_radix(hex, 16) else {
                continue;
            };
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(entry.path())?;
            let len = file.metadata()?.len();
            if len > 0 {
                ranges.add(start, start + len);
            }
            segments.insert(start, Segment { start, file });
        }

        let highest = ranges.contiguous_from(start_index);
        let log = TermLog {
            dir,
            term,
            prev_term,
            prev_index,
            start_index,
            segment_size,
            state: Mutex::new(LogState {
                ranges,
                highest,
                pending_commit: start_index,
                commit: start_index,
                end: LogIndex::MAX,
                finished: false,
                segments,
                delayed: Vec::new(),
            }),
            commit_cond: Condvar::new(),
        };
        Ok(Arc::new(log))
    }

    /// Returns the term number.
    #[must_use]
    pub fn term(&self) -> Term {
        self.term
    }

    /// Returns the term of the entry preceding this log.
    #[must_use]
    pub fn prev_term(&self) -> Term {
        self.prev_term
    }

    /// Returns the index of the entry preceding this log.
    #[must_use]
    pub fn prev_index(&self) -> LogIndex {
        self.prev_index
    }

    /// Returns the first index of this term.
    #[must_use]
    pub fn start_index(&self) -> LogIndex {
        self.start_index
    }

    /// Returns the end index, `u64::MAX` until the term finishes.
    pub fn end_index(&self) -> LogIndex {
        self.state.lock().end
    }

    /// Returns the largest contiguous index written from the start.
    pub fn highest_index(&self) -> LogIndex {
        self.state.lock().highest
    }

    /// Returns the effective commit index.
    pub fn commit_index(&self) -> LogIndex {
        self.state.lock().commit
    }

    /// Opens a writer appending from `index`.
    ///
    /// Multiple writers may coexist over disjoint ranges.
    pub fn open_writer(self: &Arc<Self>, index: LogIndex) -> LogWriter {
        LogWriter {
            log: Arc::clone(self),
            index: index.max(self.start_index),
        }
    }

    /// Opens a reader positioned at `index`.
    pub fn open_reader(self: &Arc<Self>, index: LogIndex) -> LogReader {
        LogReader {
            log: Arc::clone(self),
            index: index.max(self.start_index),
        }
    }

    /// Advances the commit index. Monotonic: lower values are ignored.
    /// Waiters whose target is now covered wake in order.
    pub fn commit(&self, index: LogIndex) {
        let mut fired = Vec::new();
        {
            let mut state = self.state.lock();
            state.pending_commit = state.pending_commit.max(index);
            if state.refresh_commit(&mut fired) {
                self.commit_cond.notify_all();
            }
        }
        for (callback, value) in fired {
            callback(value);
        }
    }

    /// Blocks until the commit index reaches `wait_for`, the term
    /// finishes, or the timeout elapses.
    ///
    /// Returns the commit index (possibly below `wait_for` on timeout),
    /// or `-1` if the term finished with `end < wait_for`.
    pub fn wait_for_commit(&self, wait_for: LogIndex, timeout_nanos: i64) -> KeelResult<i64> {
        let deadline = if timeout_nanos == i64::MAX {
            None
        } else if timeout_nanos <= 0 {
            Some(Instant::now())
        } else {
            Some(Instant::now() + Duration::from_nanos(timeout_nanos as u64))
        };

        let mut state = self.state.lock();
        loop {
            if state.commit >= wait_for {
                return Ok(state.commit as i64);
            }
            if state.finished && state.end < wait_for {
                return Ok(-1);
            }
            match deadline {
                None => self.commit_cond.wait(&mut state),
                Some(deadline) => {
                    if self
                        .commit_cond
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        if state.finished && state.end < wait_for {
                            return Ok(-1);
                        }
                        return Ok(state.commit as i64);
                    }
                }
            }
        }
    }

    /// Registers a callback for when the commit index reaches
    /// `wait_for`. Fires with `-1` if the term finishes short of it.
    pub fn upon_commit(&self, wait_for: LogIndex, callback: impl FnOnce(i64) + Send + 'static) {
        let mut callback = Some(Box::new(callback) as DelayedFn);
        let immediate = {
            let mut state = self.state.lock();
            if state.commit >= wait_for {
                Some(state.commit as i64)
            } else if state.finished && state.end < wait_for {
                Some(-1)
            } else {
                state.delayed.push(Delayed {
                    wait_for,
                    callback: callback.take().unwrap(),
                });
                None
            }
        };
        if let (Some(value), Some(callback)) = (immediate, callback) {
            callback(value);
        }
    }

    /// Finishes the term at `index`.
    ///
    /// Ranges strictly past `index` are discarded, `highest` is
    /// clamped, and the commit index is never raised. Finishing at the
    /// current end is a no-op; past it is an illegal state; below the
    /// commit index is an illegal argument.
    pub fn finish_term(&self, index: LogIndex) -> KeelResult<()> {
        let mut fired = Vec::new();
        {
            let mut state = self.state.lock();
            if index == state.end {
                return Ok(());
            }
            if index > state.end {
                return Err(KeelError::illegal_state(format!(
                    "term already finished at {}, cannot extend to {}",
                    state.end, index
                )));
            }
            if index < state.commit {
                return Err(KeelError::invalid_argument(format!(
                    "cannot finish term at {} below commit index {}",
                    index, state.commit
                )));
            }

            state.end = index;
            state.finished = true;
            state.ranges.truncate_past(index);
            state.highest = state.highest.min(index);
            debug!(term = self.term, end = index, "term finished");

            // Drop whole segments past the end; clamp the straddler.
            let doomed: Vec<LogIndex> = state.segments.range(index..).map(|(&s, _)| s).collect();
            for start in doomed {
                state.segments.remove(&start);
                let _ = std::fs::remove_file(self.segment_path(start));
            }
            if let Some((_, segment)) = state.segments.range(..index).next_back() {
                let keep = index - segment.start;
                if segment.file.metadata()?.len() > keep {
                    segment.file.set_len(keep)?;
                }
            }

            state.refresh_commit(&mut fired);
            // Everyone delayed past the end gets the finish signal.
            let commit = state.commit;
            let mut kept = Vec::new();
            for delayed in state.delayed.drain(..) {
                if delayed.wait_for > index {
                    fired.push((delayed.callback, -1));
                } else if commit >= delayed.wait_for {
                    fired.push((delayed.callback, commit as i64));
                } else {
                    kept.push(delayed);
                }
            }
            state.delayed = kept;
        }
        self.commit_cond.notify_all();
        for (callback, value) in fired {
            callback(value);
        }
        Ok(())
    }

    /// Reports the gaps between `contiguous_up_to` and the end index
    /// (or the highest recorded range while unfinished) through `sink`,
    /// and returns the new contiguous bound.
    ///
    /// Passing `u64::MAX` only queries the bound and reports nothing.
    pub fn check_for_missing_data(
        &self,
        contiguous_up_to: LogIndex,
        sink: &mut dyn FnMut(LogIndex, LogIndex),
    ) -> LogIndex {
        let state = self.state.lock();
        let contiguous = state.highest;
        if contiguous_up_to == LogIndex::MAX {
            return contiguous;
        }

        let bound = if state.finished {
            state.end
        } else {
            state.ranges.max_end().unwrap_or(self.start_index)
        };
        let mut pos = contiguous_up_to.max(self.start_index);
        for (start, end) in state.ranges.iter() {
            if pos >= bound {
                break;
            }
            if end <= pos {
                continue;
            }
            if start > pos {
                sink(pos, start.min(bound));
            }
            pos = pos.max(end);
        }
        if pos < bound {
            sink(pos, bound);
        }
        contiguous
    }

    /// Syncs all segment files. The first call on an empty term is a
    /// no-op, because no segment exists yet.
    pub fn sync(&self) -> KeelResult<()> {
        let state = self.state.lock();
        for segment in state.segments.values() {
            segment.file.sync_all()?;
        }
        Ok(())
    }

    fn segment_path(&self, start: LogIndex) -> PathBuf {
        self.dir
            .join(format!("term.{:016x}.{:016x}.seg", self.term, start))
    }

    fn segment_start_for(&self, index: LogIndex) -> LogIndex {
        let offset = index - self.start_index;
        self.start_index + (offset / self.segment_size as u64) * self.segment_size as u64
    }

    /// Writes at an absolute index. Returns the bytes accepted: a write
    /// crossing the end index is truncated, one entirely past it
    /// accepts 0.
    fn write_at(&self, index: LogIndex, buf: &[u8], highest_hint: LogIndex) -> KeelResult<usize> {
        let mut fired = Vec::new();
        let accepted = {
            let mut state = self.state.lock();
            if index >= state.end {
                return Ok(0);
            }
            let accepted = (state.end - index).min(buf.len() as u64) as usize;

            let mut pos = index;
            let mut remaining = &buf[..accepted];
            while !remaining.is_empty() {
                let seg_start = self.segment_start_for(pos);
                let seg_room = self.segment_size - (pos - seg_start) as usize;
                let chunk = remaining.len().min(seg_room);

                if !state.segments.contains_key(&seg_start) {
                    let file = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .open(self.segment_path(seg_start))?;
                    state.segments.insert(
                        seg_start,
                        Segment {
                            start: seg_start,
                            file,
                        },
                    );
                }
                let segment = &state.segments[&seg_start];
                segment
                    .file
                    .write_all_at(&remaining[..chunk], pos - seg_start)?;

                pos += chunk as u64;
                remaining = &remaining[chunk..];
            }

            state.ranges.add(index, index + accepted as u64);
            // The writer vouches for contiguity up to its hint; the
            // range set bounds the claim from above.
            let contiguous = state.ranges.contiguous_from(self.start_index);
            let claimed = highest_hint.min(contiguous).min(state.end);
            state.highest = state.highest.max(claimed);

            if state.refresh_commit(&mut fired) {
                self.commit_cond.notify_all();
            }
            accepted
        };
        for (callback, value) in fired {
            callback(value);
        }
        Ok(accepted)
    }

    fn read_at(&self, index: LogIndex, buf: &mut [u8], block: bool) -> KeelResult<usize> {
        let mut state = self.state.lock();
        loop {
            let readable = state.commit.saturating_sub(index);
            if readable > 0 && !buf.is_empty() {
                let n = (readable as usize).min(buf.len());
                let mut pos = index;
                let mut filled = 0;
                while filled < n {
                    let seg_start = self.segment_start_for(pos);
                    let seg_room = self.segment_size - (pos - seg_start) as usize;
                    let chunk = (n - filled).min(seg_room);
                    let segment = state.segments.get(&seg_start).ok_or_else(|| {
                        KeelError::corruption(format!(
                            "term {} is missing the segment at {}",
                            self.term, seg_start
                        ))
                    })?;
                    segment
                        .file
                        .read_exact_at(&mut buf[filled..filled + chunk], pos - seg_start)?;
                    pos += chunk as u64;
                    filled += chunk;
                }
                return Ok(n);
            }
            if !block {
                return Ok(0);
            }
            if state.finished && (index >= state.end || state.commit == state.end) {
                // The term is over and nothing below the end remains
                // uncommitted ahead of this reader.
                return Ok(0);
            }
            self.commit_cond.wait(&mut state);
        }
    }
}

impl std::fmt::Debug for TermLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TermLog")
            .field("term", &self.term)
            .field("start_index", &self.start_index)
            .field("highest", &state.highest)
            .field("commit", &state.commit)
            .field("end", &state.end)
            .finish()
    }
}

/// Appends bytes into a term log from an advancing position.
pub struct LogWriter {
    log: Arc<TermLog>,
    index: LogIndex,
}

impl LogWriter {
    /// Returns the next index this writer appends at.
    #[must_use]
    pub fn index(&self) -> LogIndex {
        self.index
    }

    /// Writes `buf`, vouching that data is contiguous up to `highest`.
    ///
    /// Returns the bytes accepted: writes crossing the end index are
    /// truncated, and writes entirely past it return 0.
    pub fn write(&mut self, buf: &[u8], highest: LogIndex) -> KeelResult<usize> {
        let accepted = self.log.write_at(self.index, buf, highest)?;
        self.index += accepted as u64;
        Ok(accepted)
    }
}

/// Reads committed bytes out of a term log.
pub struct LogReader {
    log: Arc<TermLog>,
    index: LogIndex,
}

impl LogReader {
    /// Returns the next index this reader consumes.
    #[must_use]
    pub fn index(&self) -> LogIndex {
        self.index
    }

    /// Reads committed bytes, blocking until data is available or the
    /// term finishes. Returns 0 only at the finished end of the term.
    pub fn read(&mut self, buf: &mut [u8]) -> KeelResult<usize> {
        let n = self.log.read_at(self.index, buf, true)?;
        self.index += n as u64;
        Ok(n)
    }

    /// Reads committed bytes without blocking. Returns 0 at the
    /// committed tail.
    pub fn read_any(&mut self, buf: &mut [u8]) -> KeelResult<usize> {
        let n = self.log.read_at(self.index, buf, false)?;
        self.index += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::thread;
    use tempfile::tempdir;

    const SEG: usize = 4096;

    #[test]
    fn test_write_commit_read() {
        let dir = tempdir().unwrap();
        let log = TermLog::open(dir.path(), 1, 0, 0, 0, SEG).unwrap();

        let mut writer = log.open_writer(0);
        assert_eq!(writer.write(b"hello", 5).unwrap(), 5);
        assert_eq!(log.highest_index(), 5);

        log.commit(2);
        assert_eq!(log.commit_index(), 2);
        log.commit(5);
        assert_eq!(log.wait_for_commit(5, i64::MAX).unwrap(), 5);

        let mut reader = log.open_reader(0);
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_commit_is_monotonic_and_clamped() {
        let dir = tempdir().unwrap();
        let log = TermLog::open(dir.path(), 1, 0, 0, 0, SEG).unwrap();

        let mut writer = log.open_writer(0);
        writer.write(b"abc", 3).unwrap();

        // Committing past the contiguous data clamps to it.
        log.commit(10);
        assert_eq!(log.commit_index(), 3);

        // Lower commits are ignored.
        log.commit(1);
        assert_eq!(log.commit_index(), 3);

        // More data releases the pending remainder.
        writer.write(b"defg", 7).unwrap();
        assert_eq!(log.commit_index(), 7);
    }

    #[test]
    fn test_gap_reporting() {
        let dir = tempdir().unwrap();
        let log = TermLog::open(dir.path(), 1, 0, 0, 0, SEG).unwrap();

        // Write [50, 150) leaving [0, 50) missing.
        let mut writer = log.open_writer(50);
        writer.write(&vec![1u8; 100], 0).unwrap();

        let mut gaps = Vec::new();
        let contiguous = log.check_for_missing_data(0, &mut |s, e| gaps.push((s, e)));
        assert_eq!(contiguous, 0);
        assert_eq!(gaps, vec![(0, 50)]);

        // Fill [0, 55): no gaps remain and the bound advances to 150.
        let mut writer = log.open_writer(0);
        writer.write(&vec![2u8; 55], 55).unwrap();

        let mut gaps = Vec::new();
        let contiguous = log.check_for_missing_data(0, &mut |s, e| gaps.push((s, e)));
        assert_eq!(contiguous, 150);
        assert!(gaps.is_empty());

        // A max query only reads the bound.
        let mut gaps = Vec::new();
        let contiguous = log.check_for_missing_data(u64::MAX, &mut |s, e| gaps.push((s, e)));
        assert_eq!(contiguous, 150);
        assert!(gaps.is_empty());
    }

    #[test]
    fn test_finish_term_truncates() {
        let dir = tempdir().unwrap();
        let log = TermLog::open(dir.path(), 3, 2, 90, 100, SEG).unwrap();

        let mut writer = log.open_writer(100);
        writer.write(&vec![1u8; 50], 150).unwrap();
        log.commit(120);
        assert_eq!(log.commit_index(), 120);

        // Finishing below the commit index is refused.
        assert!(matches!(
            log.finish_term(110),
            Err(KeelError::InvalidArgument { .. })
        ));

        log.finish_term(130).unwrap();
        assert_eq!(log.end_index(), 130);
        assert_eq!(log.highest_index(), 130);

        // Finishing at the end again is a no-op; extending is illegal.
        log.finish_term(130).unwrap();
        assert!(matches!(
            log.finish_term(140),
            Err(KeelError::IllegalState { .. })
        ));

        // Writes past the end return 0; straddling writes truncate.
        let mut writer = log.open_writer(130);
        assert_eq!(writer.write(b"xyz", 0).unwrap(), 0);
        let mut writer = log.open_writer(128);
        assert_eq!(writer.write(b"abcdef", 0).unwrap(), 2);

        // Commits past the end clamp to it.
        log.commit(1000);
        assert_eq!(log.commit_index(), 130);
    }

    #[test]
    fn test_wait_for_commit_blocks_until_notified() {
        let dir = tempdir().unwrap();
        let log = TermLog::open(dir.path(), 1, 0, 0, 0, SEG).unwrap();

        let mut writer = log.open_writer(0);
        writer.write(&vec![0u8; 64], 64).unwrap();

        let log2 = Arc::clone(&log);
        let waiter = thread::spawn(move || log2.wait_for_commit(64, i64::MAX).unwrap());

        thread::sleep(Duration::from_millis(20));
        log.commit(64);
        assert_eq!(waiter.join().unwrap(), 64);
    }

    #[test]
    fn test_wait_for_commit_sees_finish() {
        let dir = tempdir().unwrap();
        let log = TermLog::open(dir.path(), 1, 0, 0, 0, SEG).unwrap();

        let log2 = Arc::clone(&log);
        let waiter = thread::spawn(move || log2.wait_for_commit(100, i64::MAX).unwrap());

        thread::sleep(Duration::from_millis(20));
        log.finish_term(0).unwrap();
        assert_eq!(waiter.join().unwrap(), -1);
    }

    #[test]
    fn test_upon_commit_callbacks() {
        let dir = tempdir().unwrap();
        let log = TermLog::open(dir.path(), 1, 0, 0, 0, SEG).unwrap();

        let reached = Arc::new(AtomicI64::new(i64::MIN));
        let reached2 = Arc::clone(&reached);
        log.upon_commit(5, move |value| {
            reached2.store(value, Ordering::SeqCst);
        });

        let mut writer = log.open_writer(0);
        writer.write(b"hello", 5).unwrap();
        log.commit(5);
        assert_eq!(reached.load(Ordering::SeqCst), 5);

        // Already-satisfied registration fires inline.
        let inline = Arc::new(AtomicI64::new(i64::MIN));
        let inline2 = Arc::clone(&inline);
        log.upon_commit(3, move |value| {
            inline2.store(value, Ordering::SeqCst);
        });
        assert_eq!(inline.load(Ordering::SeqCst), 5);

        // Unsatisfiable registration fires -1 at finish.
        let never = Arc::new(AtomicI64::new(i64::MIN));
        let never2 = Arc::clone(&never);
        log.upon_commit(1000, move |value| {
            never2.store(value, Ordering::SeqCst);
        });
        log.finish_term(5).unwrap();
        assert_eq!(never.load(Ordering::SeqCst), -1);
    }

    #[test]
    fn test_read_any_never_blocks() {
        let dir = tempdir().unwrap();
        let log = TermLog::open(dir.path(), 1, 0, 0, 0, SEG).unwrap();

        let mut reader = log.open_reader(0);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read_any(&mut buf).unwrap(), 0);

        let mut writer = log.open_writer(0);
        writer.write(b"abcd", 4).unwrap();
        // Written but not committed: still invisible.
        assert_eq!(reader.read_any(&mut buf).unwrap(), 0);

        log.commit(4);
        assert_eq!(reader.read_any(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"abcd");
    }

    #[test]
    fn test_writes_span_segments() {
        let dir = tempdir().unwrap();
        let log = TermLog::open(dir.path(), 1, 0, 0, 0, 64).unwrap();

        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        let mut writer = log.open_writer(0);
        writer.write(&data, 200).unwrap();
        log.commit(200);

        let mut reader = log.open_reader(0);
        let mut out = Vec::new();
        let mut buf = [0u8; 33];
        loop {
            let n = reader.read_any(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
    }

    #[test]
    fn test_reopen_recovers_extent() {
        let dir = tempdir().unwrap();
        {
            let log = TermLog::open(dir.path(), 1, 0, 0, 0, 64).unwrap();
            let mut writer = log.open_writer(0);
            writer.write(&vec![9u8; 100], 100).unwrap();
            log.sync().unwrap();
        }
        let log = TermLog::open(dir.path(), 1, 0, 0, 0, 64).unwrap();
        assert_eq!(log.highest_index(), 100);

        log.commit(100);
        let mut reader = log.open_reader(64);
        let mut buf = [0u8; 64];
        let n = reader.read_any(&mut buf).unwrap();
        assert_eq!(n, 36);
        assert!(buf[..n].iter().all(|&b| b == 9));
    }
}
