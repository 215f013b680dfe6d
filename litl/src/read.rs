//! Offline trace reader.
//!
//! Follows each thread's chunk chain through the file: the header pair
//! gives the first chunk, and every chunk's terminating offset event gives
//! the next one, until a zero link ends the chain. Chunks are read on
//! demand, one at a time, so a trace much larger than memory still reads
//! in bounded space.
//!
//! This is tooling, not the hot path: errors come back as ordinary
//! `io::Result`s, with `InvalidData` for a file that does not parse.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::types::{
    get_u16, get_u32, get_u64, packed_size, raw_size, regular_size, Code, EventType, Param, Tid,
    Time, BASE_SIZE, BUFFER_SLACK, CODE_OFFSET, COUNT_OFFSET, HEADER_ARCHIVE_OFFSET,
    HEADER_BUFFER_SIZE_OFFSET, HEADER_CHUNK_THREADS_OFFSET, HEADER_FILE_SIZE,
    HEADER_NB_THREADS_OFFSET, HEADER_PAIRS_OFFSET, HEADER_RESERVED_THREADS,
    HEADER_SYSINFO_OFFSET, HEADER_VERSION_OFFSET, MAX_DATA, MAX_PARAMS, PAIR_SIZE,
    RAW_DATA_OFFSET, RAW_FLAG, TYPE_OFFSET,
};

/// Payload of one decoded event.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Regular(Vec<Param>),
    Raw(Vec<u8>),
    Packed(Vec<u8>),
}

/// One event read back from a trace file.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub tid: Tid,
    pub time: Time,
    /// The application code; the raw marker bit is already stripped.
    pub code: Code,
    pub payload: Payload,
}

impl Event {
    pub fn is_raw(&self) -> bool {
        matches!(self.payload, Payload::Raw(_))
    }

    /// Regular parameters, empty for raw and packed events.
    pub fn params(&self) -> &[Param] {
        match &self.payload {
            Payload::Regular(p) => p,
            _ => &[],
        }
    }

    /// Raw or packed payload bytes, empty for regular events.
    pub fn data(&self) -> &[u8] {
        match &self.payload {
            Payload::Raw(d) | Payload::Packed(d) => d,
            Payload::Regular(_) => &[],
        }
    }
}

/// What the parser found at a cursor position.
enum Record {
    Event { time: Time, code: Code, payload: Payload },
    /// A chunk terminator carrying the absolute offset of the next chunk.
    Link(u64),
}

#[derive(Debug)]
struct ThreadChain {
    tid: Tid,
    /// Current chunk bytes and the parse cursor within them.
    chunk: Vec<u8>,
    pos: usize,
    /// File offset of the next chunk to load once `chunk` is consumed.
    next: u64,
    done: bool,
    /// Lookahead used by the merged iteration.
    pending: Option<Event>,
}

/// Reader over one trace file written by [`crate::Trace`].
#[derive(Debug)]
pub struct TraceReader {
    file: File,
    file_size: u64,
    buffer_size: u32,
    version: String,
    sysinfo: String,
    threads: Vec<ThreadChain>,
}

impl TraceReader {
    pub fn open(path: impl AsRef<Path>) -> io::Result<TraceReader> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();

        let mut header = vec![0u8; HEADER_FILE_SIZE];
        file.read_exact_at(&mut header, 0)?;
        if header[HEADER_ARCHIVE_OFFSET] != 0 {
            return Err(invalid(
                "file is an archive of traces; split it before reading",
            ));
        }
        let nb_threads = get_u16(&header, HEADER_NB_THREADS_OFFSET) as usize;
        let in_header = get_u16(&header, HEADER_CHUNK_THREADS_OFFSET) as usize;
        if in_header > HEADER_RESERVED_THREADS || in_header > nb_threads {
            return Err(invalid(format!(
                "corrupt thread counts in header: {nb_threads} total, {in_header} in header"
            )));
        }
        let buffer_size = get_u32(&header, HEADER_BUFFER_SIZE_OFFSET);

        let mut threads = Vec::with_capacity(in_header);
        for i in 0..in_header {
            let at = HEADER_PAIRS_OFFSET + i * PAIR_SIZE;
            let tid = get_u64(&header, at);
            let first = get_u64(&header, at + 8);
            threads.push(ThreadChain {
                tid,
                chunk: Vec::new(),
                pos: 0,
                next: first,
                // a zero offset means the thread never flushed
                done: first == 0,
                pending: None,
            });
        }

        Ok(TraceReader {
            file,
            file_size,
            buffer_size,
            version: text_field(&header[HEADER_VERSION_OFFSET..HEADER_VERSION_OFFSET + 8]),
            sysinfo: text_field(&header[HEADER_SYSINFO_OFFSET..HEADER_SYSINFO_OFFSET + 128]),
            threads,
        })
    }

    /// Number of thread chains in the file.
    pub fn nb_threads(&self) -> usize {
        self.threads.len()
    }

    /// The writer's configured per-thread buffer size.
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Library version recorded in the header.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// `uname` summary recorded in the header.
    pub fn sysinfo(&self) -> &str {
        &self.sysinfo
    }

    /// Thread ids in header order; indexes match [`Self::next_thread_event`].
    pub fn tids(&self) -> Vec<Tid> {
        self.threads.iter().map(|t| t.tid).collect()
    }

    /// Next event of one thread's chain, in recorded order.
    pub fn next_thread_event(&mut self, thread: usize) -> io::Result<Option<Event>> {
        if thread >= self.threads.len() {
            return Err(invalid(format!("no such thread chain: {thread}")));
        }
        if let Some(ev) = self.threads[thread].pending.take() {
            return Ok(Some(ev));
        }
        self.advance(thread)
    }

    /// Next event across all threads, smallest timestamp first. Per-thread
    /// order is preserved; ties go to the lower chain index.
    pub fn next_event(&mut self) -> io::Result<Option<Event>> {
        for i in 0..self.threads.len() {
            if self.threads[i].pending.is_none() && !self.threads[i].done {
                self.threads[i].pending = self.advance(i)?;
            }
        }
        let winner = self
            .threads
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.pending.as_ref().map(|ev| (i, ev.time)))
            .min_by_key(|&(_, time)| time)
            .map(|(i, _)| i);
        Ok(winner.and_then(|i| self.threads[i].pending.take()))
    }

    /// All events of every chain, merged by timestamp. Convenience for
    /// tools and tests on traces that fit in memory.
    pub fn read_all(&mut self) -> io::Result<Vec<Event>> {
        let mut out = Vec::new();
        while let Some(ev) = self.next_event()? {
            out.push(ev);
        }
        Ok(out)
    }

    fn advance(&mut self, i: usize) -> io::Result<Option<Event>> {
        loop {
            if self.threads[i].done {
                return Ok(None);
            }
            if self.threads[i].chunk.is_empty() {
                let at = self.threads[i].next;
                let cap = self.buffer_size as usize + BUFFER_SLACK;
                let chunk = read_chunk(&self.file, self.file_size, cap, at)?;
                let t = &mut self.threads[i];
                t.chunk = chunk;
                t.pos = 0;
            }
            let t = &mut self.threads[i];
            let (record, next_pos) = parse_record(&t.chunk, t.pos)?;
            match record {
                Record::Link(0) => {
                    t.done = true;
                    t.chunk = Vec::new();
                    return Ok(None);
                }
                Record::Link(next) => {
                    t.next = next;
                    t.chunk = Vec::new();
                }
                Record::Event { time, code, payload } => {
                    t.pos = next_pos;
                    return Ok(Some(Event {
                        tid: t.tid,
                        time,
                        code,
                        payload,
                    }));
                }
            }
        }
    }
}

/// Decode the record at `pos`, returning it and the following position.
fn parse_record(chunk: &[u8], pos: usize) -> io::Result<(Record, usize)> {
    let rest = chunk.len() - pos;
    if rest < BASE_SIZE {
        return Err(invalid("chunk ends inside an event record"));
    }
    let rec = &chunk[pos..];
    let time = get_u64(rec, 0);
    let code = get_u32(rec, CODE_OFFSET);
    let Some(kind) = EventType::from_wire(rec[TYPE_OFFSET]) else {
        return Err(invalid(format!(
            "unknown event type tag {} at chunk offset {pos}",
            rec[TYPE_OFFSET]
        )));
    };
    match kind {
        EventType::Offset => {
            if rest < regular_size(1) {
                return Err(invalid("truncated offset event"));
            }
            Ok((Record::Link(get_u64(rec, BASE_SIZE)), pos + regular_size(1)))
        }
        EventType::Regular => {
            let n = rec[COUNT_OFFSET] as usize;
            if n > MAX_PARAMS {
                return Err(invalid(format!("regular event with {n} parameters")));
            }
            let size = regular_size(n);
            if rest < size {
                return Err(invalid("truncated regular event"));
            }
            let params = (0..n).map(|i| get_u64(rec, BASE_SIZE + 8 * i)).collect();
            Ok((
                Record::Event {
                    time,
                    code,
                    payload: Payload::Regular(params),
                },
                pos + size,
            ))
        }
        EventType::Raw => {
            let len = get_u32(rec, COUNT_OFFSET) as usize;
            if len > MAX_DATA {
                return Err(invalid(format!("raw event with {len}-byte payload")));
            }
            let size = raw_size(len);
            if rest < size {
                return Err(invalid("truncated raw event"));
            }
            Ok((
                Record::Event {
                    time,
                    code: code & !RAW_FLAG,
                    payload: Payload::Raw(rec[RAW_DATA_OFFSET..RAW_DATA_OFFSET + len].to_vec()),
                },
                pos + size,
            ))
        }
        EventType::Packed => {
            let len = rec[COUNT_OFFSET] as usize;
            if len > MAX_DATA {
                return Err(invalid(format!("packed event with {len}-byte payload")));
            }
            let size = packed_size(len);
            if rest < size {
                return Err(invalid("truncated packed event"));
            }
            Ok((
                Record::Event {
                    time,
                    code,
                    payload: Payload::Packed(rec[BASE_SIZE..BASE_SIZE + len].to_vec()),
                },
                pos + size,
            ))
        }
    }
}

/// Read one chunk starting at `at`. A chunk is never longer than the
/// writer's buffer threshold plus slack, but may be shorter when it is the
/// last data in the file.
fn read_chunk(file: &File, file_size: u64, cap: usize, at: u64) -> io::Result<Vec<u8>> {
    if at >= file_size {
        return Err(invalid(format!(
            "chunk offset {at} past the end of the file ({file_size} bytes)"
        )));
    }
    let len = cap.min((file_size - at) as usize);
    let mut buf = vec![0u8; len];
    file.read_exact_at(&mut buf, at)?;
    Ok(buf)
}

fn text_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rejects_short_files() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"not a trace").unwrap();
        let err = TraceReader::open(f.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn rejects_archives() {
        let mut header = vec![0u8; HEADER_FILE_SIZE];
        header[HEADER_ARCHIVE_OFFSET] = 1;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&header).unwrap();
        let err = TraceReader::open(f.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_corrupt_thread_counts() {
        let mut header = vec![0u8; HEADER_FILE_SIZE];
        // more pairs in the header chunk than the reservation allows
        crate::types::put_u16(&mut header, HEADER_NB_THREADS_OFFSET, 200);
        crate::types::put_u16(&mut header, HEADER_CHUNK_THREADS_OFFSET, 200);
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&header).unwrap();
        let err = TraceReader::open(f.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn parse_rejects_unknown_tag() {
        let mut chunk = vec![0u8; BASE_SIZE + 8];
        chunk[TYPE_OFFSET] = 9;
        assert!(parse_record(&chunk, 0).is_err());
    }

    #[test]
    fn parse_rejects_oversized_counts() {
        let mut chunk = vec![0u8; 128];
        chunk[TYPE_OFFSET] = EventType::Regular as u8;
        chunk[COUNT_OFFSET] = 11;
        assert!(parse_record(&chunk, 0).is_err());

        let mut chunk = vec![0u8; 256];
        chunk[TYPE_OFFSET] = EventType::Raw as u8;
        crate::types::put_u32(&mut chunk, COUNT_OFFSET, 81);
        assert!(parse_record(&chunk, 0).is_err());
    }
}
