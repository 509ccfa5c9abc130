//! Process-wide quiescence around code rewrites
//!
//! Rewriting a function entry is not atomic: another thread executing those
//! bytes mid-write would run a torn instruction sequence. [`SignalPause`]
//! freezes every other thread of the process for the length of the rewrite:
//!
//! ```text
//! patching thread              other threads
//! ───────────────              ─────────────
//! HALTED = gen
//! tgkill(tid, SIGRTMIN+n) ──▶  park_handler: join gen, record PC
//! wait parked == expected       spin while HALTED == gen
//! rescan /proc/self/task
//! write redirects
//! HALTED = 0              ──▶  leave gen, return
//! wait parked == 0
//! ```
//!
//! A frozen thread may hold any lock (allocator, logger, stdout), so the
//! success path between `pause` and `resume` neither allocates nor logs.
//!
//! A thread interrupted inside the bytes a redirect replaces would resume in
//! the middle of the new sequence. The interrupted program counter of every
//! parked thread is recorded, and [`PauseCoordinator`] reopens the window
//! until no thread sits inside a patched range.
//!
//! Limitations: threads blocking the signal never park (the pause times
//! out), and only the program counter is checked, not return addresses.

#![allow(unsafe_code)] // sigaction, tgkill, getdents64, ucontext

use log::debug;
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::domain::{Address, PauseError};
use crate::session::panic_trap;
use crate::session::SessionLog;

/// Offset above `SIGRTMIN` of the signal used to park threads
const PAUSE_SIGNAL_OFFSET: libc::c_int = 3;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Threads whose interrupted program counter can be recorded
pub const MAX_PARKED: usize = 1024;

/// Room for threads spawned between enumeration and parking
const SPAWN_SLACK: usize = 64;

/// Task list rescans before giving up on a process that keeps spawning
const MAX_RESCANS: usize = 8;

/// Windows opened before a thread inside a patch range fails the pause
const MAX_ATTEMPTS: usize = 16;

const RETRY_DELAY: Duration = Duration::from_millis(1);

/// Proof that a pause window is open; consumed by `resume`
#[derive(Debug)]
#[must_use = "a pause window stays open until the token is passed to resume"]
pub struct PauseToken {
    frozen: usize,
    /// Freed only after the threads run again
    threads: Vec<libc::pid_t>,
    /// Where each frozen thread was stopped
    interrupted: Vec<Address>,
}

impl PauseToken {
    pub fn new(frozen: usize) -> Self {
        Self { frozen, threads: Vec::new(), interrupted: Vec::new() }
    }

    /// Token reporting where the frozen threads were stopped
    pub fn with_interrupted(frozen: usize, interrupted: Vec<Address>) -> Self {
        Self { frozen, threads: Vec::new(), interrupted }
    }

    /// Number of threads frozen by the pause
    #[must_use]
    pub fn frozen(&self) -> usize {
        self.frozen
    }

    /// Program counters of the frozen threads
    #[must_use]
    pub fn interrupted(&self) -> &[Address] {
        &self.interrupted
    }
}

/// Stop-the-world capability of the host
pub trait PauseController: Send + Sync {
    /// Freeze every other thread of the process
    ///
    /// # Errors
    /// Returns an error if the pause could not be established; no thread is
    /// left frozen in that case
    fn pause(&self) -> Result<PauseToken, PauseError>;

    /// Let every frozen thread run again
    fn resume(&self, token: PauseToken);
}

/// Generation threads must stay parked for; 0 when none
static HALTED: AtomicU32 = AtomicU32::new(0);
/// Last generation handed out
static GENERATION: AtomicU32 = AtomicU32::new(0);
/// `generation << 32 | parked`; a handler only counts for its own generation
static STATE: AtomicU64 = AtomicU64::new(0);
/// Set while a pause window is open anywhere in the process
static ACTIVE: AtomicBool = AtomicBool::new(false);
/// Interrupted program counter per parking slot; 0 until recorded
static INTERRUPTED: [AtomicUsize; MAX_PARKED] = [const { AtomicUsize::new(0) }; MAX_PARKED];

#[allow(clippy::cast_possible_truncation)]
fn parked_in(state: u64) -> usize {
    (state & 0xffff_ffff) as usize
}

#[allow(clippy::cast_possible_truncation)]
fn generation_of(state: u64) -> u32 {
    (state >> 32) as u32
}

fn parked() -> usize {
    parked_in(STATE.load(Ordering::SeqCst))
}

/// Count a thread into `generation`; returns its slot, or `None` if that
/// generation is over
fn join(generation: u32) -> Option<usize> {
    STATE
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
            (generation_of(state) == generation).then_some(state + 1)
        })
        .ok()
        .map(parked_in)
}

fn leave(generation: u32) {
    let _ = STATE.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |state| {
        (generation_of(state) == generation && parked_in(state) > 0).then_some(state - 1)
    });
}

fn next_generation() -> u32 {
    let mut generation = GENERATION.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
    if generation == 0 {
        generation = GENERATION.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
    }
    generation
}

/// Program counter saved by the kernel for the interrupted code
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
unsafe fn interrupted_pc(context: *mut libc::c_void) -> usize {
    if context.is_null() {
        return usize::MAX;
    }
    // SAFETY: the caller passes the ucontext the kernel handed the handler
    let context = unsafe { &*context.cast::<libc::ucontext_t>() };
    #[cfg(target_arch = "x86_64")]
    let pc = context.uc_mcontext.gregs[libc::REG_RIP as usize] as usize;
    #[cfg(target_arch = "x86")]
    let pc = context.uc_mcontext.gregs[libc::REG_EIP as usize] as usize;
    #[cfg(target_arch = "aarch64")]
    let pc = context.uc_mcontext.pc as usize;
    pc.max(1)
}

extern "C" fn park_handler(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let generation = HALTED.load(Ordering::Acquire);
    // Late delivery after its window closed
    if generation == 0 {
        return;
    }
    let Some(slot) = join(generation) else {
        return;
    };
    if let Some(cell) = INTERRUPTED.get(slot) {
        // SAFETY: the kernel passes the interrupted ucontext with SA_SIGINFO
        cell.store(unsafe { interrupted_pc(context) }, Ordering::SeqCst);
    }
    while HALTED.load(Ordering::Acquire) == generation {
        // SAFETY: sched_yield is async-signal-safe and never fails on Linux
        unsafe { libc::sched_yield() };
    }
    leave(generation);
}

/// Install the park handler once per process; returns the signal number
fn install_handler() -> Result<libc::c_int, PauseError> {
    static INSTALLED: OnceLock<Result<libc::c_int, i32>> = OnceLock::new();

    let installed = INSTALLED.get_or_init(|| {
        let signal = libc::SIGRTMIN() + PAUSE_SIGNAL_OFFSET;
        // SAFETY: the action is fully initialized before use and the handler
        // only touches atomics.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = park_handler as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL));
            }
        }
        debug!("Installed pause handler on signal {signal}");
        Ok(signal)
    });

    (*installed).map_err(|errno| PauseError::Handler(io::Error::from_raw_os_error(errno)))
}

#[allow(clippy::cast_possible_truncation)]
fn current_tid() -> libc::pid_t {
    // SAFETY: gettid has no preconditions
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Thread id from a `/proc/self/task` entry name
fn parse_tid(name: &[u8]) -> Option<libc::pid_t> {
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    let digits = &name[..end];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    digits.iter().try_fold(0, |tid: libc::pid_t, &b| {
        tid.checked_mul(10)?.checked_add(libc::pid_t::from(b - b'0'))
    })
}

/// Visit every thread id of the process without allocating
fn for_each_task(mut visit: impl FnMut(libc::pid_t)) -> io::Result<()> {
    // linux_dirent64: d_ino u64, d_off i64, d_reclen u16, d_type u8, d_name
    const RECLEN_AT: usize = 16;
    const NAME_AT: usize = 19;

    // SAFETY: the path is NUL terminated and the descriptor is closed below
    let fd = unsafe {
        libc::open(
            c"/proc/self/task".as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut buf = [0u8; 4096];
    let result = loop {
        // SAFETY: the kernel writes at most buf.len() bytes into buf
        let read = unsafe { libc::syscall(libc::SYS_getdents64, fd, buf.as_mut_ptr(), buf.len()) };
        let Ok(read) = usize::try_from(read) else {
            break Err(io::Error::last_os_error());
        };
        if read == 0 {
            break Ok(());
        }
        let mut offset = 0;
        while offset + NAME_AT <= read {
            let reclen =
                usize::from(u16::from_ne_bytes([buf[offset + RECLEN_AT], buf[offset + RECLEN_AT + 1]]));
            if reclen == 0 || offset + reclen > read {
                break;
            }
            if let Some(tid) = parse_tid(&buf[offset + NAME_AT..offset + reclen]) {
                visit(tid);
            }
            offset += reclen;
        }
    };

    // SAFETY: fd was opened above and is not used afterwards
    unsafe { libc::close(fd) };
    result
}

/// Every thread of the process except the caller
fn other_threads() -> io::Result<Vec<libc::pid_t>> {
    let own = current_tid();
    let mut tids = Vec::new();
    for_each_task(|tid| {
        if tid != own {
            tids.push(tid);
        }
    })?;
    Ok(tids)
}

/// Wait until `done` holds or `timeout` expires; true on success
fn wait_until(timeout: Duration, done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::yield_now();
    }
    true
}

/// Every parked thread has recorded where it stopped
fn all_recorded(count: usize) -> bool {
    INTERRUPTED[..count.min(MAX_PARKED)].iter().all(|cell| cell.load(Ordering::SeqCst) != 0)
}

/// Signal-based stop-the-world for Linux
#[derive(Debug, Clone, Copy)]
pub struct SignalPause {
    timeout: Duration,
}

impl Default for SignalPause {
    fn default() -> Self {
        Self { timeout: DEFAULT_TIMEOUT }
    }
}

impl SignalPause {
    /// How long `pause` waits for every thread to park
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn release(&self) {
        HALTED.store(0, Ordering::Release);
        wait_until(self.timeout, || parked() == 0);
        ACTIVE.store(false, Ordering::Release);
    }

    /// Signal `tids`; returns how many were still alive
    fn signal(pid: libc::pid_t, tids: &[libc::pid_t], signal: libc::c_int) -> io::Result<usize> {
        let mut delivered = 0;
        for &tid in tids {
            // SAFETY: tgkill only delivers a signal whose handler is installed
            let rc = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, signal) };
            if rc == 0 {
                delivered += 1;
                continue;
            }
            let err = io::Error::last_os_error();
            // The thread exited after enumeration
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
        Ok(delivered)
    }

    /// Append threads missing from `tids`, within its capacity
    fn rescan(own: libc::pid_t, tids: &mut Vec<libc::pid_t>) -> Result<(), PauseError> {
        let mut overflow = false;
        for_each_task(|tid| {
            if tid == own || tids.contains(&tid) {
                return;
            }
            if tids.len() < tids.capacity() {
                tids.push(tid);
            } else {
                overflow = true;
            }
        })
        .map_err(PauseError::Threads)?;
        if overflow {
            return Err(PauseError::TooManyThreads { max: tids.capacity() });
        }
        Ok(())
    }

    /// Everything after `HALTED` is set; the caller releases on error
    fn park(
        &self,
        signal: libc::c_int,
        tids: &mut Vec<libc::pid_t>,
        interrupted: &mut Vec<Address>,
    ) -> Result<usize, PauseError> {
        // SAFETY: getpid has no preconditions
        let pid = unsafe { libc::getpid() };
        let own = current_tid();

        let mut expected = Self::signal(pid, tids, signal).map_err(PauseError::Threads)?;
        for _ in 0..=MAX_RESCANS {
            if !wait_until(self.timeout, || parked() >= expected && all_recorded(expected)) {
                return Err(PauseError::Timeout { parked: parked(), expected });
            }
            let signalled = tids.len();
            Self::rescan(own, tids)?;
            if tids.len() == signalled {
                for cell in &INTERRUPTED[..expected.min(MAX_PARKED)] {
                    if interrupted.len() < interrupted.capacity() {
                        interrupted.push(Address(cell.load(Ordering::SeqCst) as u64));
                    }
                }
                return Ok(expected);
            }
            expected += Self::signal(pid, &tids[signalled..], signal).map_err(PauseError::Threads)?;
        }
        Err(PauseError::Spawning { rescans: MAX_RESCANS, threads: tids.len() })
    }
}

impl PauseController for SignalPause {
    fn pause(&self) -> Result<PauseToken, PauseError> {
        let signal = install_handler()?;
        if ACTIVE.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(PauseError::AlreadyPaused);
        }

        let mut tids = match other_threads() {
            Ok(tids) if tids.len() < MAX_PARKED => tids,
            Ok(_) => {
                ACTIVE.store(false, Ordering::Release);
                return Err(PauseError::TooManyThreads { max: MAX_PARKED });
            }
            Err(err) => {
                ACTIVE.store(false, Ordering::Release);
                return Err(PauseError::Threads(err));
            }
        };
        // Nothing may allocate once threads start parking
        let capacity = (tids.len() + SPAWN_SLACK).min(MAX_PARKED);
        tids.reserve_exact(capacity - tids.len());
        let mut interrupted = Vec::with_capacity(capacity);
        for cell in &INTERRUPTED {
            cell.store(0, Ordering::SeqCst);
        }

        let generation = next_generation();
        STATE.store(u64::from(generation) << 32, Ordering::SeqCst);
        HALTED.store(generation, Ordering::Release);

        match self.park(signal, &mut tids, &mut interrupted) {
            Ok(frozen) => Ok(PauseToken { frozen, threads: tids, interrupted }),
            Err(err) => {
                self.release();
                Err(err)
            }
        }
    }

    fn resume(&self, token: PauseToken) {
        self.release();
        debug!("Resumed {} of {} threads", token.frozen, token.threads.len());
    }
}

/// Resumes on drop, including while unwinding
struct PauseGuard<'a> {
    controller: &'a dyn PauseController,
    token: Option<PauseToken>,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.controller.resume(token);
        }
    }
}

/// First interrupted address inside one of `busy`
fn inside(token: &PauseToken, busy: &[Range<u64>]) -> Option<Address> {
    token.interrupted().iter().copied().find(|pc| busy.iter().any(|range| range.contains(&pc.0)))
}

/// Runs a closure inside a pause window, or directly in thread-safe mode
pub struct PauseCoordinator<'a> {
    controller: &'a dyn PauseController,
}

impl<'a> PauseCoordinator<'a> {
    pub fn new(controller: &'a dyn PauseController) -> Self {
        Self { controller }
    }

    /// Run `f` with every other thread frozen unless `thread_safe`
    ///
    /// `busy` holds the byte ranges `f` will rewrite, excluding each first
    /// byte: a thread stopped at an entry runs the new sequence from its
    /// start. A window with a thread stopped inside a range is closed and
    /// reopened. Log forwarding is held for the length of the window.
    ///
    /// # Errors
    /// Returns the pause failure, or [`PauseError::UnsafePoint`] if threads
    /// kept stopping inside a busy range; `f` does not run in either case
    pub fn run<T>(
        &self,
        thread_safe: bool,
        busy: &[Range<u64>],
        log: &mut SessionLog,
        f: impl FnOnce(&mut SessionLog) -> T,
    ) -> Result<T, PauseError> {
        if thread_safe {
            crate::session_log!(log, "thread-safe mode, patching without pause");
            return Ok(f(log));
        }

        crate::session_log!(log, "entering pause window ...");
        let mut attempt = 1;
        let token = loop {
            log.hold(busy.len());
            let token = match self.controller.pause() {
                Ok(token) => token,
                Err(err) => {
                    log.release();
                    return Err(err);
                }
            };
            let Some(address) = inside(&token, busy) else {
                break token;
            };
            self.controller.resume(token);
            log.release();
            if attempt == MAX_ATTEMPTS {
                return Err(PauseError::UnsafePoint { address: address.0, attempts: attempt });
            }
            crate::session_log!(
                log,
                "thread stopped at {address} inside a patch range, retrying ({attempt}/{MAX_ATTEMPTS})"
            );
            attempt += 1;
            std::thread::sleep(RETRY_DELAY);
        };
        let frozen = token.frozen();
        let paused_at = Instant::now();

        let guard = PauseGuard { controller: self.controller, token: Some(token) };
        let output = panic_trap::without_backtrace(|| f(log));
        drop(guard);

        let held = paused_at.elapsed();
        log.release();
        crate::session_log!(log, "left pause window, {frozen} threads frozen for {held:?}");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::thread;

    /// Real pauses share process-wide state
    static REAL_PAUSE: Mutex<()> = Mutex::new(());

    #[derive(Default)]
    struct Counting {
        pauses: AtomicUsize,
        resumes: AtomicUsize,
    }

    impl PauseController for Counting {
        fn pause(&self) -> Result<PauseToken, PauseError> {
            self.pauses.fetch_add(1, Ordering::SeqCst);
            Ok(PauseToken::new(4))
        }

        fn resume(&self, _token: PauseToken) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Refusing;

    impl PauseController for Refusing {
        fn pause(&self) -> Result<PauseToken, PauseError> {
            Err(PauseError::Timeout { parked: 1, expected: 2 })
        }

        fn resume(&self, _token: PauseToken) {
            unreachable!("never paused");
        }
    }

    /// Reports one thread at each address in turn, then at `settled`
    struct Wandering {
        stops: Mutex<Vec<u64>>,
        settled: u64,
        resumes: AtomicUsize,
    }

    impl PauseController for Wandering {
        fn pause(&self) -> Result<PauseToken, PauseError> {
            let mut stops = self.stops.lock().unwrap();
            let pc = if stops.is_empty() { self.settled } else { stops.remove(0) };
            Ok(PauseToken::with_interrupted(1, vec![Address(pc)]))
        }

        fn resume(&self, _token: PauseToken) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_thread_safe_skips_pause() {
        let controller = Counting::default();
        let mut log = SessionLog::new();
        let out = PauseCoordinator::new(&controller).run(true, &[], &mut log, |_| 7).unwrap();
        assert_eq!(out, 7);
        assert_eq!(controller.pauses.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_window_holds_log_and_resumes() {
        let controller = Counting::default();
        let mut log = SessionLog::new();
        let held = PauseCoordinator::new(&controller)
            .run(false, &[], &mut log, |log| log.is_held())
            .unwrap();
        assert!(held);
        assert!(!log.is_held());
        assert_eq!(controller.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(controller.resumes.load(Ordering::SeqCst), 1);
        assert!(log.as_str().contains("4 threads frozen"));
    }

    #[test]
    fn test_resume_on_panic() {
        let controller = Counting::default();
        let mut log = SessionLog::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            PauseCoordinator::new(&controller).run(false, &[], &mut log, |_| panic!("boom"))
        }));
        assert!(result.is_err());
        assert_eq!(controller.resumes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pause_failure_skips_closure() {
        let mut log = SessionLog::new();
        let mut ran = false;
        let err =
            PauseCoordinator::new(&Refusing).run(false, &[], &mut log, |_| ran = true).unwrap_err();
        assert!(matches!(err, PauseError::Timeout { .. }));
        assert!(!ran);
        assert!(!log.is_held());
    }

    #[test]
    fn test_reopens_window_while_thread_inside_range() {
        let controller = Wandering {
            stops: Mutex::new(vec![0x1004, 0x100c]),
            settled: 0x1000,
            resumes: AtomicUsize::new(0),
        };
        let mut log = SessionLog::new();
        let ran = PauseCoordinator::new(&controller)
            .run(false, &[0x1001..0x100d], &mut log, |_| true)
            .unwrap();

        assert!(ran);
        assert_eq!(controller.resumes.load(Ordering::SeqCst), 3);
        assert!(log.as_str().contains("thread stopped at 0x1004 inside a patch range, retrying (1/"));
        assert!(log.as_str().contains("thread stopped at 0x100c"));
    }

    #[test]
    fn test_gives_up_when_thread_stays_inside_range() {
        let controller =
            Wandering { stops: Mutex::new(Vec::new()), settled: 0x2008, resumes: AtomicUsize::new(0) };
        let mut log = SessionLog::new();
        let mut ran = false;
        let err = PauseCoordinator::new(&controller)
            .run(false, &[0x2001..0x200d], &mut log, |_| ran = true)
            .unwrap_err();

        assert!(matches!(err, PauseError::UnsafePoint { address: 0x2008, attempts: MAX_ATTEMPTS }));
        assert!(!ran);
        assert_eq!(controller.resumes.load(Ordering::SeqCst), MAX_ATTEMPTS);
        assert!(!log.is_held());
    }

    #[test]
    fn test_stale_generation_is_not_counted() {
        let _serial = REAL_PAUSE.lock().unwrap_or_else(PoisonError::into_inner);
        let before = STATE.load(Ordering::SeqCst);
        let current = generation_of(before);
        let stale = current.wrapping_sub(1).max(1);

        if stale != current {
            assert_eq!(join(stale), None);
            leave(stale);
            assert_eq!(STATE.load(Ordering::SeqCst), before);
        }
    }

    #[test]
    fn test_parse_tid() {
        assert_eq!(parse_tid(b"1234\0\0\0"), Some(1234));
        assert_eq!(parse_tid(b".\0"), None);
        assert_eq!(parse_tid(b"..\0"), None);
        assert_eq!(parse_tid(b"\0"), None);
    }

    #[test]
    fn test_for_each_task_matches_proc() {
        let mut raw = Vec::new();
        for_each_task(|tid| raw.push(tid)).unwrap();
        raw.sort_unstable();

        let mut listed: Vec<libc::pid_t> = std::fs::read_dir("/proc/self/task")
            .unwrap()
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect();
        listed.sort_unstable();

        // Test threads come and go; our own thread is in both
        assert!(raw.contains(&current_tid()));
        assert!(listed.contains(&current_tid()));
        assert!(!raw.is_empty());
    }

    #[test]
    fn test_signal_pause_freezes_threads() {
        let _serial = REAL_PAUSE.lock().unwrap_or_else(PoisonError::into_inner);
        let stop = Arc::new(AtomicBool::new(false));
        let counters: Vec<Arc<AtomicU64>> = (0..3).map(|_| Arc::new(AtomicU64::new(0))).collect();
        let workers: Vec<_> = counters
            .iter()
            .map(|counter| {
                let counter = Arc::clone(counter);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        thread::sleep(Duration::from_millis(20));

        let pause = SignalPause::default();
        let token = pause.pause().expect("pause");
        assert!(token.frozen() >= 3);
        assert_eq!(token.interrupted().len(), token.frozen());
        assert!(matches!(pause.pause(), Err(PauseError::AlreadyPaused)));

        // No allocation inside the window
        let frozen: [u64; 3] = std::array::from_fn(|i| counters[i].load(Ordering::SeqCst));
        thread::sleep(Duration::from_millis(50));
        let still: [u64; 3] = std::array::from_fn(|i| counters[i].load(Ordering::SeqCst));
        pause.resume(token);
        assert_eq!(frozen, still);

        thread::sleep(Duration::from_millis(50));
        let resumed: [u64; 3] = std::array::from_fn(|i| counters[i].load(Ordering::SeqCst));
        assert!(resumed.iter().zip(&still).all(|(after, before)| after > before));

        stop.store(true, Ordering::Relaxed);
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(parked(), 0);
    }

    static SPIN_STOP: AtomicU64 = AtomicU64::new(0);
    static SPIN_STARTED: AtomicBool = AtomicBool::new(false);

    /// Spins in its own body until `SPIN_STOP` is set
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[inline(never)]
    fn spin_target() {
        SPIN_STARTED.store(true, Ordering::SeqCst);
        let flag = SPIN_STOP.as_ptr();
        // SAFETY: reads an aligned static that outlives the loop
        unsafe {
            #[cfg(target_arch = "x86_64")]
            std::arch::asm!(
                "2:",
                "mov {t}, qword ptr [{flag}]",
                "test {t}, {t}",
                "jz 2b",
                flag = in(reg) flag,
                t = out(reg) _,
            );
            #[cfg(target_arch = "aarch64")]
            std::arch::asm!(
                "2:",
                "ldr {t}, [{flag}]",
                "cbz {t}, 2b",
                flag = in(reg) flag,
                t = out(reg) _,
            );
        }
    }

    #[test]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn test_records_where_threads_stopped() {
        let _serial = REAL_PAUSE.lock().unwrap_or_else(PoisonError::into_inner);
        SPIN_STOP.store(0, Ordering::SeqCst);
        let spinner = thread::spawn(spin_target);
        while !SPIN_STARTED.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(10));

        let start = spin_target as *const () as u64;
        let body = [start + 1..start + 4096];
        let mut log = SessionLog::new();
        let err = PauseCoordinator::new(&SignalPause::default())
            .run(false, &body, &mut log, |_| ())
            .unwrap_err();

        SPIN_STOP.store(1, Ordering::SeqCst);
        spinner.join().unwrap();
        let PauseError::UnsafePoint { address, attempts } = err else {
            panic!("expected the spinning thread to block the window, got {err:?}");
        };
        assert!(body[0].contains(&address));
        assert_eq!(attempts, MAX_ATTEMPTS);
        assert!(log.as_str().contains("inside a patch range, retrying"));
        assert_eq!(parked(), 0);
    }

    static SPAWNED: AtomicUsize = AtomicUsize::new(0);
    static CHILD_TICKS: [AtomicU64; 16] = [const { AtomicU64::new(0) }; 16];
    static SPAWN_STOP: AtomicBool = AtomicBool::new(false);

    #[test]
    fn test_freezes_threads_spawned_during_pause() {
        let _serial = REAL_PAUSE.lock().unwrap_or_else(PoisonError::into_inner);
        SPAWN_STOP.store(false, Ordering::SeqCst);
        let spawner = thread::spawn(|| {
            let mut children = Vec::new();
            for slot in 0..CHILD_TICKS.len() {
                if SPAWN_STOP.load(Ordering::SeqCst) {
                    break;
                }
                children.push(thread::spawn(move || {
                    while !SPAWN_STOP.load(Ordering::Relaxed) {
                        CHILD_TICKS[slot].fetch_add(1, Ordering::Relaxed);
                    }
                }));
                SPAWNED.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
            }
            for child in children {
                child.join().unwrap();
            }
        });
        while SPAWNED.load(Ordering::SeqCst) < 2 {
            thread::yield_now();
        }

        let pause = SignalPause::default();
        let token = pause.pause().expect("pause");
        let spawned = SPAWNED.load(Ordering::SeqCst);
        let ticks: [u64; 16] = std::array::from_fn(|i| CHILD_TICKS[i].load(Ordering::SeqCst));
        thread::sleep(Duration::from_millis(30));
        let later: [u64; 16] = std::array::from_fn(|i| CHILD_TICKS[i].load(Ordering::SeqCst));
        let spawned_later = SPAWNED.load(Ordering::SeqCst);
        pause.resume(token);

        SPAWN_STOP.store(true, Ordering::SeqCst);
        spawner.join().unwrap();
        assert_eq!(spawned, spawned_later, "a thread kept spawning inside the window");
        assert_eq!(ticks, later, "a thread kept running inside the window");
    }
}
