//! embedded-datalog - log file lifecycle controller
//!
//! Drains the shared ring buffer into numbered files on a mounted
//! filesystem. Each write cycle is sized to land exactly on the
//! filesystem's per-block bookkeeping boundary and is followed by a sync,
//! which keeps the filesystem from ever having to relocate a half-written
//! block. Ring bytes are only consumed after the sync succeeds, so a
//! failed cycle leaves them in the buffer to be retried into a fresh file.
//!
//! The controller is paced externally: the owner calls
//! [`poll`](LogFileController::poll) from its drain task, and each poll
//! performs at most one state transition or one write cycle.

use core::mem;

use crate::fs::Filesystem;
use crate::ringlog::LogDrain;

#[cfg(feature = "log")]
use log::{debug, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};

/// A monotonic microsecond clock for latency accounting.
pub trait Monotonic {
    /// Microseconds since an arbitrary epoch. Never goes backwards.
    fn now_micros(&mut self) -> u64;
}

/// Min/max/average tracking for one class of filesystem call.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone)]
pub struct LatencyStats {
    /// Shortest observed duration. Meaningless while `count` is zero.
    pub min_micros: u64,
    /// Longest observed duration.
    pub max_micros: u64,
    /// Sum of all observed durations.
    pub total_micros: u64,
    /// How many durations have been recorded.
    pub count: u32,
}

impl LatencyStats {
    fn record(&mut self, micros: u64) {
        if self.count == 0 || micros < self.min_micros {
            self.min_micros = micros;
        }
        if micros > self.max_micros {
            self.max_micros = micros;
        }
        self.total_micros += micros;
        self.count += 1;
    }

    /// The mean duration, or zero if nothing was recorded yet.
    pub fn average_micros(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_micros / u64::from(self.count)
        }
    }
}

/// Latency accounting for the current mount session.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone)]
pub struct ControllerStats {
    /// Durations of the append calls of each write cycle.
    pub append: LatencyStats,
    /// Durations of the sync call of each write cycle.
    pub sync: LatencyStats,
}

/// Notification that a log file was closed, fired exactly once per file
/// whether the close was a size rotation, a write failure or an unmount.
pub trait RotationHook {
    /// `name` is the closed file's name.
    fn file_rotated(&mut self, name: &str);
}

/// Tuning for the controller.
#[derive(Debug, Copy, Clone)]
pub struct ControllerConfig {
    /// Leading part of every log file name.
    pub prefix: &'static str,
    /// Trailing part of every log file name.
    pub suffix: &'static str,
    /// Rotate to a new file once this many bytes have been written.
    pub max_file_len: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            prefix: "log_",
            suffix: ".bin",
            max_file_len: 1024 * 1024,
        }
    }
}

/// Highest index a log file name may carry; the next file wraps to 1.
const MAX_FILE_INDEX: u32 = 99_999;

/// A log file name in a fixed buffer, so name handling never allocates.
#[derive(Debug, Copy, Clone)]
pub struct FileName {
    buf: [u8; Self::MAX_LEN],
    len: usize,
}

impl FileName {
    const MAX_LEN: usize = 32;

    fn format(prefix: &str, index: u32, suffix: &str) -> FileName {
        let mut name = FileName {
            buf: [0u8; Self::MAX_LEN],
            len: 0,
        };
        name.push_bytes(prefix.as_bytes());
        name.push_index(index);
        name.push_bytes(suffix.as_bytes());
        name
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        let space = Self::MAX_LEN - self.len;
        let take = bytes.len().min(space);
        self.buf[self.len..self.len + take].copy_from_slice(&bytes[..take]);
        self.len += take;
    }

    fn push_index(&mut self, index: u32) {
        let mut digits = [0u8; 10];
        let mut value = index;
        let mut count = 0;
        loop {
            digits[count] = b'0' + (value % 10) as u8;
            value /= 10;
            count += 1;
            if value == 0 {
                break;
            }
        }
        while count > 0 {
            count -= 1;
            self.push_bytes(&[digits[count]]);
        }
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        // Built exclusively from `str` slices and ASCII digits.
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

/// The index carried by a well-formed log file name, or `None` for any
/// name that does not match `<prefix><digits><suffix>` with one to five
/// digits and no leading zero. Malformed names are simply ignored by the
/// directory scan rather than treated as errors.
fn parse_index(name: &str, prefix: &str, suffix: &str) -> Option<u32> {
    let digits = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
    if digits.is_empty() || digits.len() > 5 {
        return None;
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

/// What one [`poll`](LogFileController::poll) call accomplished.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Poll {
    /// Not mounted; nothing to do until [`on_mount`](LogFileController::on_mount).
    Idle,
    /// Waiting for the buffer to fill up to the next write target; the
    /// caller may sleep until more data arrives.
    WaitingForData,
    /// A transition or a full write cycle completed; poll again promptly.
    Progress,
}

/// One open log file plus its running byte count.
struct Session<F> {
    file: F,
    name: FileName,
    written: u32,
}

enum State<F> {
    Unmounted,
    OpenLog,
    CalcWriteSize { session: Session<F> },
    WaitForData { session: Session<F>, target: u32 },
}

/// Drives numbered log files on a mounted [`Filesystem`] from a
/// [`LogDrain`].
pub struct LogFileController<FS, H>
where
    FS: Filesystem,
    H: RotationHook,
{
    hooks: H,
    config: ControllerConfig,
    state: State<FS::File>,
    stats: ControllerStats,
}

impl<FS, H> LogFileController<FS, H>
where
    FS: Filesystem,
    H: RotationHook,
{
    /// Create a controller in the unmounted state.
    pub fn new(hooks: H, config: ControllerConfig) -> Self {
        LogFileController {
            hooks,
            config,
            state: State::Unmounted,
            stats: ControllerStats::default(),
        }
    }

    /// Latency figures for the current mount session.
    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    /// The filesystem came up; start a new session on the next poll.
    pub fn on_mount(&mut self) {
        if let State::Unmounted = self.state {
            self.stats = ControllerStats::default();
            self.state = State::OpenLog;
        }
    }

    /// The filesystem is going away; close the open file first.
    pub fn on_unmount(&mut self, fs: &mut FS) {
        match mem::replace(&mut self.state, State::Unmounted) {
            State::CalcWriteSize { session } | State::WaitForData { session, .. } => {
                self.close_session(fs, session);
            }
            State::Unmounted | State::OpenLog => {}
        }
        self.state = State::Unmounted;
    }

    /// Close the session's file and announce it, tolerating a close error
    /// since the bytes up to the last sync are already durable.
    fn close_session(&mut self, fs: &mut FS, session: Session<FS::File>) {
        let Session { file, name, .. } = session;
        if let Err(e) = fs.close(file) {
            warn!("Closing {} failed: {:?}", name.as_str(), e);
        }
        self.hooks.file_rotated(name.as_str());
        self.state = State::OpenLog;
    }

    /// Scan the directory and create the successor of the highest numbered
    /// log file present, starting from 1 on an empty card and wrapping
    /// back to 1 past [`MAX_FILE_INDEX`].
    fn open_next_file(&mut self, fs: &mut FS) -> Result<Session<FS::File>, FS::Error> {
        let prefix = self.config.prefix;
        let suffix = self.config.suffix;
        let mut max_index: Option<u32> = None;
        fs.for_each_name(|name| {
            if let Some(index) = parse_index(name, prefix, suffix) {
                max_index = Some(max_index.map_or(index, |m| m.max(index)));
            }
        })?;
        let index = match max_index {
            Some(n) if n >= MAX_FILE_INDEX => 1,
            Some(n) => n + 1,
            None => 1,
        };
        let name = FileName::format(prefix, index, suffix);
        debug!("Opening {}", name.as_str());
        let file = fs.create(name.as_str())?;
        Ok(Session {
            file,
            name,
            written: 0,
        })
    }

    /// Run one step. Call from the drain task whenever the buffer may have
    /// filled, and at least occasionally regardless.
    pub fn poll<D, M>(&mut self, fs: &mut FS, drain: &mut D, clock: &mut M) -> Poll
    where
        D: LogDrain,
        M: Monotonic,
    {
        match mem::replace(&mut self.state, State::Unmounted) {
            State::Unmounted => Poll::Idle,
            State::OpenLog => {
                match self.open_next_file(fs) {
                    Ok(session) => self.state = State::CalcWriteSize { session },
                    Err(e) => {
                        // Stay here and retry on the next poll.
                        warn!("Opening a log file failed: {:?}", e);
                        self.state = State::OpenLog;
                    }
                }
                Poll::Progress
            }
            State::CalcWriteSize { session } => {
                if session.written >= self.config.max_file_len {
                    debug!(
                        "Rotating {} after {} bytes",
                        session.name.as_str(),
                        session.written
                    );
                    self.close_session(fs, session);
                } else {
                    let boundary = fs.bytes_until_sync_boundary(&session.file);
                    // A target above the ring capacity could never fill.
                    let target = boundary.min(drain.capacity());
                    self.state = State::WaitForData { session, target };
                }
                Poll::Progress
            }
            State::WaitForData { mut session, target } => {
                if drain.bytes_available() < target {
                    self.state = State::WaitForData { session, target };
                    return Poll::WaitingForData;
                }
                let outcome = {
                    let (first, second) = drain.peek_slices(target);
                    let start = clock.now_micros();
                    let mut result = fs.append(&mut session.file, first);
                    if result.is_ok() && !second.is_empty() {
                        result = fs.append(&mut session.file, second);
                    }
                    let appended = clock.now_micros();
                    if result.is_ok() {
                        self.stats.append.record(appended - start);
                        result = fs.sync_file(&mut session.file);
                        if result.is_ok() {
                            self.stats.sync.record(clock.now_micros() - appended);
                        }
                    }
                    result
                };
                match outcome {
                    Ok(()) => {
                        // The bytes are durable; only now consume them.
                        drain.release(target);
                        session.written += target;
                        self.state = State::CalcWriteSize { session };
                    }
                    Err(e) => {
                        // Leave the bytes in the ring; they are retried
                        // into the successor file.
                        warn!("Write cycle failed: {:?}", e);
                        self.close_session(fs, session);
                    }
                }
                Poll::Progress
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ringlog::RingLog;

    struct StubFile {
        index: usize,
        synced: usize,
    }

    /// An in-memory filesystem with a fixed sync-boundary period and
    /// scriptable fault injection.
    struct StubFs {
        files: Vec<(String, Vec<u8>)>,
        boundary: u32,
        fail_syncs: u32,
        fail_appends: u32,
        append_lens: Vec<usize>,
        syncs: u32,
    }

    impl StubFs {
        fn new(boundary: u32) -> Self {
            StubFs {
                files: Vec::new(),
                boundary,
                fail_syncs: 0,
                fail_appends: 0,
                append_lens: Vec::new(),
                syncs: 0,
            }
        }

        fn with_names(boundary: u32, names: &[&str]) -> Self {
            let mut fs = Self::new(boundary);
            for name in names {
                fs.files.push((name.to_string(), Vec::new()));
            }
            fs
        }

        fn contents(&self, name: &str) -> &[u8] {
            &self
                .files
                .iter()
                .find(|(n, _)| n == name)
                .expect("no such file")
                .1
        }
    }

    impl Filesystem for StubFs {
        type File = StubFile;
        type Error = &'static str;

        fn for_each_name<F>(&mut self, mut f: F) -> Result<(), Self::Error>
        where
            F: FnMut(&str),
        {
            for (name, _) in &self.files {
                f(name);
            }
            Ok(())
        }

        fn create(&mut self, name: &str) -> Result<StubFile, Self::Error> {
            self.files.push((name.to_string(), Vec::new()));
            Ok(StubFile {
                index: self.files.len() - 1,
                synced: 0,
            })
        }

        fn append(&mut self, file: &mut StubFile, data: &[u8]) -> Result<(), Self::Error> {
            if self.fail_appends > 0 {
                self.fail_appends -= 1;
                return Err("append fault");
            }
            self.append_lens.push(data.len());
            self.files[file.index].1.extend_from_slice(data);
            Ok(())
        }

        fn sync_file(&mut self, file: &mut StubFile) -> Result<(), Self::Error> {
            if self.fail_syncs > 0 {
                self.fail_syncs -= 1;
                // What the failed cycle appended never became durable.
                self.files[file.index].1.truncate(file.synced);
                return Err("sync fault");
            }
            file.synced = self.files[file.index].1.len();
            self.syncs += 1;
            Ok(())
        }

        fn close(&mut self, _file: StubFile) -> Result<(), Self::Error> {
            Ok(())
        }

        fn bytes_until_sync_boundary(&self, file: &StubFile) -> u32 {
            let len = self.files[file.index].1.len() as u32;
            self.boundary - (len % self.boundary)
        }
    }

    struct FakeClock {
        now: u64,
        step: u64,
    }

    impl Monotonic for FakeClock {
        fn now_micros(&mut self) -> u64 {
            self.now += self.step;
            self.now
        }
    }

    #[derive(Default)]
    struct RotationLog {
        names: Vec<String>,
    }

    impl RotationHook for &mut RotationLog {
        fn file_rotated(&mut self, name: &str) {
            self.names.push(name.to_string());
        }
    }

    fn drive<FS: Filesystem, H: RotationHook, D: LogDrain>(
        controller: &mut LogFileController<FS, H>,
        fs: &mut FS,
        drain: &mut D,
        clock: &mut FakeClock,
        polls: u32,
    ) {
        for _ in 0..polls {
            controller.poll(fs, drain, clock);
        }
    }

    #[test]
    fn parses_only_well_formed_names() {
        assert_eq!(parse_index("log_8.bin", "log_", ".bin"), Some(8));
        assert_eq!(parse_index("log_99999.bin", "log_", ".bin"), Some(99_999));
        assert_eq!(parse_index("log_x.bin", "log_", ".bin"), None);
        assert_eq!(parse_index("log_.bin", "log_", ".bin"), None);
        assert_eq!(parse_index("log_007.bin", "log_", ".bin"), None);
        assert_eq!(parse_index("log_123456.bin", "log_", ".bin"), None);
        assert_eq!(parse_index("other.txt", "log_", ".bin"), None);
    }

    #[test]
    fn next_name_succeeds_highest_and_skips_malformed() {
        let mut fs = StubFs::with_names(
            64,
            &["log_3.bin", "log_7.bin", "log_x.bin", "log_007.bin", "notes.txt"],
        );
        let ring: RingLog<64> = RingLog::new();
        let mut drain = ring.claim_consumer().unwrap();
        let mut clock = FakeClock { now: 0, step: 5 };
        let mut hooks = RotationLog::default();
        let mut controller = LogFileController::new(&mut hooks, ControllerConfig::default());

        assert_eq!(controller.poll(&mut fs, &mut drain, &mut clock), Poll::Idle);
        controller.on_mount();
        controller.poll(&mut fs, &mut drain, &mut clock);

        assert_eq!(fs.files.last().unwrap().0, "log_8.bin");
    }

    #[test]
    fn index_wraps_back_to_one() {
        let mut fs = StubFs::with_names(64, &["log_99999.bin"]);
        let ring: RingLog<64> = RingLog::new();
        let mut drain = ring.claim_consumer().unwrap();
        let mut clock = FakeClock { now: 0, step: 5 };
        let mut hooks = RotationLog::default();
        let mut controller = LogFileController::new(&mut hooks, ControllerConfig::default());

        controller.on_mount();
        controller.poll(&mut fs, &mut drain, &mut clock);
        assert_eq!(fs.files.last().unwrap().0, "log_1.bin");
    }

    #[test]
    fn cycles_land_on_sync_boundaries() {
        let mut fs = StubFs::new(16);
        let ring: RingLog<64> = RingLog::new();
        let mut drain = ring.claim_consumer().unwrap();
        let mut clock = FakeClock { now: 0, step: 5 };
        let mut hooks = RotationLog::default();
        let mut controller = LogFileController::new(&mut hooks, ControllerConfig::default());
        controller.on_mount();

        for i in 0..10u8 {
            assert!(ring.append(0x10, &[i; 4]));
        }
        drive(&mut controller, &mut fs, &mut drain, &mut clock, 12);

        // Every completed cycle synced exactly on a 16-byte boundary.
        assert!(fs.syncs >= 3);
        assert_eq!(fs.contents("log_1.bin").len() % 16, 0);
        let mut cycle = 0;
        for len in &fs.append_lens {
            cycle += len;
            assert!(cycle <= 16);
            if cycle == 16 {
                cycle = 0;
            }
        }
    }

    #[test]
    fn boundary_target_is_clamped_to_ring_capacity() {
        // A boundary far beyond the ring could otherwise never fill.
        let mut fs = StubFs::new(1 << 20);
        let ring: RingLog<64> = RingLog::new();
        let mut drain = ring.claim_consumer().unwrap();
        let mut clock = FakeClock { now: 0, step: 5 };
        let mut hooks = RotationLog::default();
        let mut controller = LogFileController::new(&mut hooks, ControllerConfig::default());
        controller.on_mount();

        // 64 bytes: 16 entries of tag + 3 payload bytes fill the ring.
        for i in 0..16u8 {
            assert!(ring.append(0x20, &[i, i, i]));
        }
        drive(&mut controller, &mut fs, &mut drain, &mut clock, 4);

        assert_eq!(fs.contents("log_1.bin").len(), 64);
        assert_eq!(drain.bytes_available(), 0);
    }

    #[test]
    fn sync_failure_rotates_and_retries_the_bytes() {
        let mut fs = StubFs::new(16);
        fs.fail_syncs = 1;
        let ring: RingLog<64> = RingLog::new();
        let mut drain = ring.claim_consumer().unwrap();
        let mut clock = FakeClock { now: 0, step: 5 };
        let mut hooks = RotationLog::default();
        let mut controller = LogFileController::new(&mut hooks, ControllerConfig::default());
        controller.on_mount();

        for i in 0..4u8 {
            assert!(ring.append(0x30, &[i, i, i]));
        }
        drive(&mut controller, &mut fs, &mut drain, &mut clock, 8);

        // The failed file was announced and the same bytes landed in its
        // successor.
        assert_eq!(hooks.names, vec!["log_1.bin".to_string()]);
        let expected: Vec<u8> = (0..4u8).flat_map(|i| vec![0x30, i, i, i]).collect();
        assert_eq!(fs.contents("log_2.bin"), &expected[..]);
        assert_eq!(drain.bytes_available(), 0);
    }

    #[test]
    fn rotation_hook_carries_the_closed_name() {
        let mut fs = StubFs::new(16);
        let ring: RingLog<64> = RingLog::new();
        let mut drain = ring.claim_consumer().unwrap();
        let mut clock = FakeClock { now: 0, step: 5 };
        let mut hooks = RotationLog::default();
        let config = ControllerConfig {
            max_file_len: 32,
            ..ControllerConfig::default()
        };
        let mut controller = LogFileController::new(&mut hooks, config);
        controller.on_mount();

        for i in 0..12u8 {
            assert!(ring.append(0x40, &[i, i, i]));
        }
        drive(&mut controller, &mut fs, &mut drain, &mut clock, 16);

        // 48 buffered bytes with a 32-byte cap: the first file fills and
        // rotates, the rest lands in the second.
        assert_eq!(hooks.names, vec!["log_1.bin".to_string()]);
        assert_eq!(fs.contents("log_1.bin").len(), 32);
        assert_eq!(fs.contents("log_2.bin").len(), 16);
    }

    #[test]
    fn unmount_closes_and_announces_the_open_file() {
        let mut fs = StubFs::new(16);
        let ring: RingLog<64> = RingLog::new();
        let mut drain = ring.claim_consumer().unwrap();
        let mut clock = FakeClock { now: 0, step: 5 };
        let mut hooks = RotationLog::default();
        let mut controller = LogFileController::new(&mut hooks, ControllerConfig::default());
        controller.on_mount();
        controller.poll(&mut fs, &mut drain, &mut clock);

        controller.on_unmount(&mut fs);
        assert_eq!(controller.poll(&mut fs, &mut drain, &mut clock), Poll::Idle);
        drop(controller);
        assert_eq!(hooks.names, vec!["log_1.bin".to_string()]);
    }

    #[test]
    fn latency_stats_cover_each_cycle() {
        let mut fs = StubFs::new(16);
        let ring: RingLog<64> = RingLog::new();
        let mut drain = ring.claim_consumer().unwrap();
        let mut clock = FakeClock { now: 0, step: 250 };
        let mut hooks = RotationLog::default();
        let mut controller = LogFileController::new(&mut hooks, ControllerConfig::default());
        controller.on_mount();

        for i in 0..8u8 {
            assert!(ring.append(0x50, &[i, i, i]));
        }
        drive(&mut controller, &mut fs, &mut drain, &mut clock, 8);

        let stats = *controller.stats();
        assert_eq!(stats.append.count, 2);
        assert_eq!(stats.sync.count, 2);
        assert!(stats.append.min_micros > 0);
        assert!(stats.append.average_micros() >= stats.append.min_micros);
        assert!(stats.append.average_micros() <= stats.append.max_micros);
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
