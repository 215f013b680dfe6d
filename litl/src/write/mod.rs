//! The write path: probe dispatch, per-thread buffers, and the flusher.
//!
//! # Architecture
//!
//! Every recording thread owns one buffer; a probe is a short-circuit
//! check, a thread-local slot lookup, and a bump-cursor append of one
//! record. No atomics are contended and no syscalls run on that path.
//! When a buffer fills, the owning thread spills it to the trace file as
//! one chunk, then keeps recording into the reset buffer.
//!
//! # File protocol
//!
//! The first flush of the trace writes the header with a 64-entry
//! `(tid, offset)` pair table. Each thread's pair points at its first
//! chunk; each chunk ends with an offset event whose final 8 bytes point
//! at the thread's next chunk. A flush therefore rewrites exactly one
//! 8-byte link in place (the header pair, or the previous chunk's tail)
//! before appending the new chunk at `general_offset`.
//!
//! Threads that register after the header hit the disk claim one of the
//! reserved pairs, and the thread counts are rewritten in place, so
//! nothing already written ever moves.
//!
//! # Safety mechanisms
//!
//! Flushes are serialized by `flush_lock` while thread safety is enabled.
//! Slot registration is serialized by `register_lock` and published with a
//! release store of `nb_threads`, so the flusher never observes a
//! half-built slot. Buffer contents are only ever touched by the owning
//! thread, or by `finalize` after recording has stopped.

mod buffer;

use std::cell::{Cell, UnsafeCell};
use std::env;
use std::ffi::CStr;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::clock;
use crate::config::Config;
use crate::types::{
    packed_size, put_u16, put_u32, put_u64, raw_size, regular_size, Code, EventType, Param, Tid,
    BASE_SIZE, CODE_OFFSET, COUNT_OFFSET, HEADER_ARCHIVE_OFFSET, HEADER_BUFFER_SIZE_OFFSET,
    HEADER_CHUNK_THREADS_OFFSET, HEADER_FILE_SIZE, HEADER_NB_THREADS_OFFSET, HEADER_PAIRS_OFFSET,
    HEADER_RESERVED_THREADS, HEADER_SYSINFO_OFFSET, HEADER_VERSION_OFFSET, MAX_DATA, MAX_PARAMS,
    OFFSET_CODE, OFFSET_EVENT_SIZE, PAIR_SIZE, RAW_DATA_OFFSET, RAW_FLAG, TYPE_OFFSET,
};

use buffer::ThreadBuffer;

/// Capacity of the thread table, matching the pair slots reserved in the
/// file header. One policy for both; no dynamic growth.
pub const NB_BUFFERS: usize = HEADER_RESERVED_THREADS;

/// Slot cache marker for a thread the table had no room for.
const REJECTED: u16 = u16::MAX;

static NEXT_TRACE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // (trace id, slot index) of the most recent trace this thread probed
    static CACHED_SLOT: Cell<(u64, u16)> = const { Cell::new((0, REJECTED)) };
}

/// File-side state, touched only inside the flusher critical section.
struct FileState {
    filename: Option<PathBuf>,
    file: Option<File>,
    /// Header image assembled at init and written by the first flush.
    header: Vec<u8>,
    /// Append position in the trace file.
    general_offset: u64,
    /// File position of the next free header pair, for late threads.
    header_offset: u64,
    header_flushed: bool,
}

/// One recording session and the trace file it writes.
///
/// Probes take `&self`, so a single `Trace` can be shared across the
/// instrumented application's threads (for example in an `Arc` or a
/// `static`). Configuration toggles are atomic flags; see [`Config`] for
/// the environment switches read by [`Trace::init`].
pub struct Trace {
    id: u64,
    buffer_size: u32,
    initialized: AtomicBool,
    paused: AtomicBool,
    buffer_full: AtomicBool,
    allow_flush: AtomicBool,
    thread_safe: AtomicBool,
    record_tid: AtomicBool,
    capacity_warned: AtomicBool,

    nb_threads: AtomicU16,
    tids: Box<[AtomicU64; NB_BUFFERS]>,
    /// Per thread, the file position of the pending 8-byte chain link.
    chain_offsets: Box<[AtomicU64; NB_BUFFERS]>,
    /// Whether the thread's `(tid, offset)` pair is already in the file.
    flushed: Box<[AtomicBool; NB_BUFFERS]>,
    slots: Box<[UnsafeCell<Option<ThreadBuffer>>; NB_BUFFERS]>,

    register_lock: Mutex<()>,
    flush_lock: Mutex<()>,
    file: UnsafeCell<FileState>,
}

// SAFETY: the UnsafeCell state is partitioned. Each `slots` entry is only
// accessed by the thread registered to it (probes and overflow flushes run
// on the owner; `finalize` takes `&mut self`), except that registration
// writes the slot before publishing it through the `nb_threads` release
// store. `file` is only dereferenced inside the flusher critical section,
// serialized by `flush_lock` — or by the caller's single-thread promise
// when thread safety is switched off, mirroring what disabling it means.
// Everything else is atomic.
unsafe impl Send for Trace {}
unsafe impl Sync for Trace {}

impl Trace {
    /// Start a recording session, seeding the switches from the
    /// environment. `buffer_size` is the per-thread spill threshold in
    /// bytes; each registered thread allocates that much plus slack.
    pub fn init(buffer_size: u32) -> Trace {
        Trace::with_config(buffer_size, Config::from_env())
    }

    /// Start a recording session with explicit switch positions.
    pub fn with_config(buffer_size: u32, cfg: Config) -> Trace {
        // a zero threshold would make the overflow check fail forever
        let buffer_size = buffer_size.max(1);
        let mut header = vec![0u8; HEADER_FILE_SIZE];
        header[HEADER_ARCHIVE_OFFSET] = 0;
        put_u32(&mut header, HEADER_BUFFER_SIZE_OFFSET, buffer_size);
        let version = env!("CARGO_PKG_VERSION").as_bytes();
        let n = version.len().min(8);
        header[HEADER_VERSION_OFFSET..HEADER_VERSION_OFFSET + n].copy_from_slice(&version[..n]);
        let info = sysinfo();
        let n = info.len().min(128);
        header[HEADER_SYSINFO_OFFSET..HEADER_SYSINFO_OFFSET + n]
            .copy_from_slice(&info.as_bytes()[..n]);

        Trace {
            id: NEXT_TRACE_ID.fetch_add(1, Ordering::Relaxed),
            buffer_size,
            initialized: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            buffer_full: AtomicBool::new(false),
            allow_flush: AtomicBool::new(cfg.buffer_flush),
            thread_safe: AtomicBool::new(cfg.thread_safety),
            record_tid: AtomicBool::new(cfg.record_tid),
            capacity_warned: AtomicBool::new(false),
            nb_threads: AtomicU16::new(0),
            tids: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            chain_offsets: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            flushed: Box::new(std::array::from_fn(|_| AtomicBool::new(false))),
            slots: Box::new(std::array::from_fn(|_| UnsafeCell::new(None))),
            register_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            file: UnsafeCell::new(FileState {
                filename: None,
                file: None,
                header,
                general_offset: 0,
                header_offset: 0,
                header_flushed: false,
            }),
        }
    }

    /// Replace the trace file name. Only effective before the first flush;
    /// afterwards the already-open file keeps receiving the data and a
    /// warning is logged.
    pub fn set_filename(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let _guard = lock(&self.flush_lock);
        // SAFETY: serialized with the flusher by `flush_lock`
        let fs = unsafe { &mut *self.file.get() };
        if fs.header_flushed {
            log::warn!(
                "trace file name changed to {} after events were already written to {}",
                path.display(),
                fs.filename
                    .as_deref()
                    .unwrap_or_else(|| std::path::Path::new("?"))
                    .display(),
            );
        }
        fs.filename = Some(path);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn buffer_flush_on(&self) {
        self.allow_flush.store(true, Ordering::Relaxed);
    }

    pub fn buffer_flush_off(&self) {
        self.allow_flush.store(false, Ordering::Relaxed);
    }

    pub fn thread_safety_on(&self) {
        self.thread_safe.store(true, Ordering::Relaxed);
    }

    pub fn thread_safety_off(&self) {
        self.thread_safe.store(false, Ordering::Relaxed);
    }

    pub fn tid_recording_on(&self) {
        self.record_tid.store(true, Ordering::Relaxed);
    }

    pub fn tid_recording_off(&self) {
        self.record_tid.store(false, Ordering::Relaxed);
    }

    pub fn tid_recording(&self) -> bool {
        self.record_tid.load(Ordering::Relaxed)
    }

    /// Whether a buffer filled up while flushing was disabled. Latches
    /// until finalization; all further events are dropped.
    pub fn is_buffer_full(&self) -> bool {
        self.buffer_full.load(Ordering::Relaxed)
    }

    pub fn nb_threads(&self) -> u16 {
        self.nb_threads.load(Ordering::Acquire)
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    // Probe family. Each records one event, or nothing at all when the
    // trace is uninitialized, paused, or saturated.

    pub fn probe0(&self, code: Code) {
        self.probe_params(code, &[]);
    }

    pub fn probe1(&self, code: Code, p1: Param) {
        self.probe_params(code, &[p1]);
    }

    pub fn probe2(&self, code: Code, p1: Param, p2: Param) {
        self.probe_params(code, &[p1, p2]);
    }

    pub fn probe3(&self, code: Code, p1: Param, p2: Param, p3: Param) {
        self.probe_params(code, &[p1, p2, p3]);
    }

    pub fn probe4(&self, code: Code, p1: Param, p2: Param, p3: Param, p4: Param) {
        self.probe_params(code, &[p1, p2, p3, p4]);
    }

    pub fn probe5(&self, code: Code, p1: Param, p2: Param, p3: Param, p4: Param, p5: Param) {
        self.probe_params(code, &[p1, p2, p3, p4, p5]);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn probe6(
        &self,
        code: Code,
        p1: Param,
        p2: Param,
        p3: Param,
        p4: Param,
        p5: Param,
        p6: Param,
    ) {
        self.probe_params(code, &[p1, p2, p3, p4, p5, p6]);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn probe7(
        &self,
        code: Code,
        p1: Param,
        p2: Param,
        p3: Param,
        p4: Param,
        p5: Param,
        p6: Param,
        p7: Param,
    ) {
        self.probe_params(code, &[p1, p2, p3, p4, p5, p6, p7]);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn probe8(
        &self,
        code: Code,
        p1: Param,
        p2: Param,
        p3: Param,
        p4: Param,
        p5: Param,
        p6: Param,
        p7: Param,
        p8: Param,
    ) {
        self.probe_params(code, &[p1, p2, p3, p4, p5, p6, p7, p8]);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn probe9(
        &self,
        code: Code,
        p1: Param,
        p2: Param,
        p3: Param,
        p4: Param,
        p5: Param,
        p6: Param,
        p7: Param,
        p8: Param,
        p9: Param,
    ) {
        self.probe_params(code, &[p1, p2, p3, p4, p5, p6, p7, p8, p9]);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn probe10(
        &self,
        code: Code,
        p1: Param,
        p2: Param,
        p3: Param,
        p4: Param,
        p5: Param,
        p6: Param,
        p7: Param,
        p8: Param,
        p9: Param,
        p10: Param,
    ) {
        self.probe_params(code, &[p1, p2, p3, p4, p5, p6, p7, p8, p9, p10]);
    }

    /// Record a slice of 64-bit parameters (at most [`MAX_PARAMS`]).
    #[inline]
    pub fn probe_params(&self, code: Code, params: &[Param]) {
        debug_assert!(params.len() <= MAX_PARAMS);
        if !self.recording() {
            return;
        }
        let Some(idx) = self.slot_index() else {
            return;
        };
        let Some(rec) = self.reserve(idx, regular_size(params.len())) else {
            return;
        };
        put_u64(rec, 0, clock::now());
        put_u32(rec, CODE_OFFSET, code);
        rec[TYPE_OFFSET] = EventType::Regular as u8;
        rec[COUNT_OFFSET] = params.len() as u8;
        for (i, p) in params.iter().enumerate() {
            put_u64(rec, BASE_SIZE + 8 * i, *p);
        }
    }

    /// Record opaque bytes (at most [`MAX_DATA`]). The stored code carries
    /// the raw marker bit; readers strip it again.
    pub fn raw_probe(&self, code: Code, data: &[u8]) {
        debug_assert!(data.len() <= MAX_DATA);
        let len = data.len().min(MAX_DATA);
        if !self.recording() {
            return;
        }
        let Some(idx) = self.slot_index() else {
            return;
        };
        let Some(rec) = self.reserve(idx, raw_size(len)) else {
            return;
        };
        put_u64(rec, 0, clock::now());
        put_u32(rec, CODE_OFFSET, code | RAW_FLAG);
        rec[TYPE_OFFSET] = EventType::Raw as u8;
        put_u32(rec, COUNT_OFFSET, len as u32);
        rec[RAW_DATA_OFFSET..RAW_DATA_OFFSET + len].copy_from_slice(&data[..len]);
    }

    /// Record an already-packed payload (at most [`MAX_DATA`] bytes),
    /// usually built with a [`crate::Packer`].
    pub fn probe_pack(&self, code: Code, data: &[u8]) {
        debug_assert!(data.len() <= MAX_DATA);
        let len = data.len().min(MAX_DATA);
        if !self.recording() {
            return;
        }
        let Some(idx) = self.slot_index() else {
            return;
        };
        let Some(rec) = self.reserve(idx, packed_size(len)) else {
            return;
        };
        put_u64(rec, 0, clock::now());
        put_u32(rec, CODE_OFFSET, code);
        rec[TYPE_OFFSET] = EventType::Packed as u8;
        rec[COUNT_OFFSET] = len as u8;
        rec[BASE_SIZE..BASE_SIZE + len].copy_from_slice(&data[..len]);
    }

    /// Spill every registered buffer in index order, close the trace file,
    /// and release the buffers. The trace records nothing afterwards.
    pub fn finalize(&mut self) {
        if !self.initialized.load(Ordering::Relaxed) {
            return;
        }
        let n = self.nb_threads.load(Ordering::Acquire) as usize;
        if n == 0 {
            log::debug!("finalizing a trace that recorded no events: no file written");
        }
        for idx in 0..n {
            self.flush_slot(idx);
        }
        self.initialized.store(false, Ordering::Relaxed);
        let fs = self.file.get_mut();
        fs.file = None;
        fs.header_flushed = false;
        for slot in self.slots.iter_mut() {
            *slot.get_mut() = None;
        }
    }

    #[inline]
    fn recording(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
            && !self.paused.load(Ordering::Relaxed)
            && !self.buffer_full.load(Ordering::Relaxed)
    }

    /// This thread's slot in the buffer table, registering on first use.
    #[inline]
    fn slot_index(&self) -> Option<usize> {
        let (trace, idx) = CACHED_SLOT.get();
        if trace == self.id {
            if idx == REJECTED {
                return None;
            }
            return Some(idx as usize);
        }
        self.register_thread()
    }

    #[cold]
    fn register_thread(&self) -> Option<usize> {
        let _guard = lock(&self.register_lock);
        let tid = current_tid();
        let n = self.nb_threads.load(Ordering::Relaxed) as usize;
        // the slot cache is a single entry, so a thread alternating
        // between traces re-enters here; find its existing slot by tid
        for i in 0..n {
            if self.tids[i].load(Ordering::Relaxed) == tid {
                CACHED_SLOT.set((self.id, i as u16));
                return Some(i);
            }
        }
        if n >= NB_BUFFERS {
            if !self.capacity_warned.swap(true, Ordering::Relaxed) {
                log::warn!(
                    "thread table full ({NB_BUFFERS} threads): events from tid {tid} \
                     and any later thread will not be recorded"
                );
            }
            CACHED_SLOT.set((self.id, REJECTED));
            return None;
        }
        // SAFETY: slot `n` is unpublished and we hold `register_lock`, so
        // nothing else can be touching it
        unsafe {
            *self.slots[n].get() = Some(ThreadBuffer::new(self.buffer_size as usize));
        }
        self.tids[n].store(tid, Ordering::Relaxed);
        self.flushed[n].store(false, Ordering::Relaxed);
        self.chain_offsets[n].store(0, Ordering::Relaxed);
        // publish: the flusher loads with acquire before walking the table
        self.nb_threads.store((n + 1) as u16, Ordering::Release);
        CACHED_SLOT.set((self.id, n as u16));
        Some(n)
    }

    /// Reserve room for one record in this thread's buffer, spilling (or
    /// latching the saturation flag) when the buffer is at its threshold.
    #[inline]
    fn reserve(&self, idx: usize, size: usize) -> Option<&mut [u8]> {
        loop {
            // SAFETY: `idx` was returned by `slot_index`, so it is this
            // thread's own slot
            let slot = unsafe { &mut *self.slots[idx].get() };
            let buf = slot.as_mut()?;
            if buf.used() < self.buffer_size as usize {
                return Some(buf.append(size));
            }
            if self.allow_flush.load(Ordering::Relaxed) {
                self.flush_slot(idx);
            } else {
                self.buffer_full.store(true, Ordering::Relaxed);
                return None;
            }
        }
    }

    /// Write one thread's buffer to the trace file as a chunk and relink
    /// the thread's chain. Serialized by `flush_lock` while thread safety
    /// is enabled. I/O failures are fatal.
    fn flush_slot(&self, idx: usize) {
        if !self.initialized.load(Ordering::Relaxed) {
            return;
        }
        let _guard = if self.thread_safe.load(Ordering::Relaxed) {
            Some(lock(&self.flush_lock))
        } else {
            None
        };

        // SAFETY: inside the flusher critical section (see the Sync impl)
        let fs = unsafe { &mut *self.file.get() };
        if !fs.header_flushed {
            self.flush_header(fs);
        }
        let Some(file) = fs.file.as_ref() else {
            // flush_header either set the handle or exited the process
            return;
        };

        if !self.flushed[idx].load(Ordering::Relaxed) {
            // thread arrived after the header hit the disk: claim the next
            // reserved pair and refresh both thread counts in place
            let mut pair = [0u8; PAIR_SIZE];
            put_u64(&mut pair, 0, self.tids[idx].load(Ordering::Relaxed));
            put_u64(&mut pair, 8, fs.general_offset);
            write_all_at(file, &pair, fs.header_offset);
            fs.header_offset += PAIR_SIZE as u64;

            let mut count = [0u8; 2];
            put_u16(&mut count, 0, self.nb_threads.load(Ordering::Acquire));
            write_all_at(file, &count, HEADER_NB_THREADS_OFFSET as u64);
            write_all_at(file, &count, HEADER_CHUNK_THREADS_OFFSET as u64);
            self.flushed[idx].store(true, Ordering::Relaxed);
        } else {
            // point the pending link (header pair or the offset event of
            // the previous chunk) at the chunk about to be written
            let mut link = [0u8; 8];
            put_u64(&mut link, 0, fs.general_offset);
            write_all_at(file, &link, self.chain_offsets[idx].load(Ordering::Relaxed));
        }

        // SAFETY: flushes of a slot run on its owner thread or during
        // finalize, never concurrently with the owner's appends
        let slot = unsafe { &mut *self.slots[idx].get() };
        let Some(buf) = slot.as_mut() else {
            return;
        };
        append_offset_event(buf);
        write_all_at(file, buf.bytes(), fs.general_offset);
        let written = buf.used() as u64;
        // the link field is the final 8 bytes of the chunk just written
        self.chain_offsets[idx].store(fs.general_offset + written - 8, Ordering::Relaxed);
        fs.general_offset += written;
        buf.reset();
    }

    /// First flush of the trace: create the file and write the header
    /// image with the pair table, reserving slots up to 64 threads.
    fn flush_header(&self, fs: &mut FileState) {
        let path = fs.filename.get_or_insert_with(default_trace_path);
        let file = match File::create(&path) {
            Ok(f) => f,
            Err(err) => fatal(&format!("cannot open trace file {}", path.display()), err),
        };

        let n = self.nb_threads.load(Ordering::Acquire) as usize;
        put_u16(&mut fs.header, HEADER_NB_THREADS_OFFSET, n as u16);
        put_u16(&mut fs.header, HEADER_CHUNK_THREADS_OFFSET, n as u16);
        for i in 0..n {
            let at = HEADER_PAIRS_OFFSET + i * PAIR_SIZE;
            put_u64(&mut fs.header, at, self.tids[i].load(Ordering::Relaxed));
            put_u64(&mut fs.header, at + 8, 0);
            // each thread's pending link is its pair's offset field
            self.chain_offsets[i].store((at + 8) as u64, Ordering::Relaxed);
            self.flushed[i].store(true, Ordering::Relaxed);
        }
        write_all_at(&file, &fs.header, 0);
        fs.header_offset = (HEADER_PAIRS_OFFSET + n * PAIR_SIZE) as u64;
        fs.general_offset = HEADER_FILE_SIZE as u64;
        fs.file = Some(file);
        fs.header_flushed = true;
        log::debug!(
            "trace header written to {} ({} threads registered)",
            path.display(),
            n
        );
    }
}

impl Drop for Trace {
    fn drop(&mut self) {
        self.finalize();
    }
}

fn append_offset_event(buf: &mut ThreadBuffer) {
    let rec = buf.append(OFFSET_EVENT_SIZE);
    put_u64(rec, 0, 0);
    put_u32(rec, CODE_OFFSET, OFFSET_CODE);
    rec[TYPE_OFFSET] = EventType::Offset as u8;
    rec[COUNT_OFFSET] = 1;
    // placeholder link, rewritten in place by the thread's next flush
    put_u64(rec, BASE_SIZE, 0);
}

fn write_all_at(file: &File, buf: &[u8], at: u64) {
    if let Err(err) = file.write_all_at(buf, at) {
        fatal("cannot write to the trace file", err);
    }
}

/// The write path has no recovery story for I/O failures: report on stderr
/// (the `log` backend may not exist) and terminate nonzero.
fn fatal(what: &str, err: io::Error) -> ! {
    eprintln!("litl: {what}: {err}");
    process::exit(1);
}

fn lock(m: &Mutex<()>) -> MutexGuard<'_, ()> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn current_tid() -> Tid {
    // SAFETY: gettid takes no arguments and cannot fail
    (unsafe { libc::syscall(libc::SYS_gettid) }) as Tid
}

fn default_trace_path() -> PathBuf {
    let user = env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/{user}_litl_log_rank_1"))
}

/// `uname` summary stamped into the trace header.
fn sysinfo() -> String {
    let mut uts = std::mem::MaybeUninit::<libc::utsname>::zeroed();
    // SAFETY: uname fills the struct when it returns 0
    if unsafe { libc::uname(uts.as_mut_ptr()) } != 0 {
        log::warn!("uname failed: {}", io::Error::last_os_error());
        return String::new();
    }
    // SAFETY: initialized by the successful uname call above
    let uts = unsafe { uts.assume_init() };
    [
        &uts.sysname[..],
        &uts.nodename[..],
        &uts.release[..],
        &uts.version[..],
        &uts.machine[..],
    ]
    .iter()
    .map(|f| cstr_field(f))
    .collect::<Vec<_>>()
    .join(" ")
}

fn cstr_field(field: &[libc::c_char]) -> String {
    // SAFETY: uname NUL-terminates every utsname field
    unsafe { CStr::from_ptr(field.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}
