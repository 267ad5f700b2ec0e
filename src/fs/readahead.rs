//! Per-file readahead state.
//!
//! Tracks the application read pattern for one file and recommends
//! readahead offsets. Files are divided into 1 GiB logical sections;
//! whenever access moves to a section that sequential progress does not
//! explain, pattern tracking is reset and sequential-ness must be proven
//! afresh. A pattern counts as sequential once at least three reads have
//! landed in the current section and their bytes cover more than
//! `ACCESS_DENSITY_MIN` percent of the touched range, which tolerates the
//! reordering produced by concurrent async reads without classifying
//! random or widely-spaced reads as sequential.
//!
//! The contract with the read path:
//! - every application read is reported through [`RaState::on_application_read`]
//!   *before* it is issued;
//! - a non-zero return from [`RaState::get_next_ra`] obliges the caller to
//!   issue that readahead and later call [`RaState::on_readahead_complete`]
//!   with the same length, whether the read succeeded or not.
//!
//! Only a single reader stream per file is tracked; interleaved streams
//! from multiple readers can defeat the detector.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tracing::info;

/// Logical section size. Crossing into an unexpected section resets
/// pattern detection.
pub const SECTION_SIZE: u64 = 1024 * 1024 * 1024;

/// Minimum percentage of the touched byte range that must actually have
/// been read for the pattern to count as sequential.
pub const ACCESS_DENSITY_MIN: u64 = 70;

/// Server-side object size ceiling; no readahead is suggested past it.
pub const MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024 * 1024;

/// Smallest effective readahead window.
pub const MIN_RA_KIB: u64 = 128;
/// Largest useful readahead window (1 GiB).
pub const MAX_RA_KIB: u64 = 1024 * 1024;

/// Readahead state for one regular file.
///
/// Counters are atomics updated under a reader/writer lock; the lock
/// orders resets against concurrent window reservations while leaving the
/// completion path lock-free.
pub struct RaState {
    /// Readahead window size in bytes; outstanding readahead never
    /// exceeds it.
    ra_bytes: u64,

    /// Last byte of readahead recommended so far. The next recommendation
    /// starts just past it. Monotone non-decreasing between resets.
    last_byte_readahead: AtomicU64,

    /// Smallest and largest byte read in the current section.
    min_byte_read: AtomicU64,
    max_byte_read: AtomicU64,

    /// Bytes of readahead currently in flight. Not reset with the pattern
    /// tracker: already-issued readaheads keep counting until complete.
    ra_ongoing: AtomicU64,

    /// Reads and bytes observed in the current section.
    num_reads: AtomicU64,
    num_bytes_read: AtomicU64,

    lock: RwLock<()>,
}

#[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
impl RaState {
    /// Create readahead state with a window of `ra_kib` KiB. The inode is
    /// only for logging.
    pub fn new(ino: u64, ra_kib: u64) -> Self {
        debug_assert!((MIN_RA_KIB..=MAX_RA_KIB).contains(&ra_kib));
        info!(ino, ra_kib, "readahead window configured");

        Self {
            ra_bytes: ra_kib * 1024,
            last_byte_readahead: AtomicU64::new(0),
            min_byte_read: AtomicU64::new(0),
            // Sentinel: no read seen yet. The first report lands in a
            // "different section" and resets the tracker.
            max_byte_read: AtomicU64::new(u64::MAX),
            ra_ongoing: AtomicU64::new(0),
            num_reads: AtomicU64::new(0),
            num_bytes_read: AtomicU64::new(0),
            lock: RwLock::new(()),
        }
    }

    /// Report an application read. Must be called before the read is
    /// issued so recommendations never lag the application.
    pub fn on_application_read(&self, offset: u64, length: u64) {
        debug_assert!(length > 0);
        debug_assert!(offset.saturating_add(length) <= MAX_FILE_SIZE);
        if length == 0 {
            return;
        }

        let _guard = self.lock.write().expect("poisoned");

        let max = self.max_byte_read.load(Ordering::Relaxed);
        let curr_section = max / SECTION_SIZE;
        let this_section = offset / SECTION_SIZE;
        let read_gap = (offset.wrapping_sub(max) as i64).unsigned_abs();

        let reset = if read_gap > self.ra_bytes {
            // A jump wider than the window: treat as random until the
            // pattern proves itself again.
            true
        } else if this_section != curr_section {
            if this_section == curr_section + 1 {
                // Sequential progress into the next section keeps its
                // history.
                !self.is_sequential_locked()
            } else {
                true
            }
        } else {
            false
        };

        if reset {
            self.num_reads.store(1, Ordering::Relaxed);
            self.num_bytes_read.store(length, Ordering::Relaxed);
            self.min_byte_read.store(offset, Ordering::Relaxed);
            self.max_byte_read
                .store(offset + length - 1, Ordering::Relaxed);
            self.last_byte_readahead.store(0, Ordering::Relaxed);
        } else {
            self.num_reads.fetch_add(1, Ordering::Relaxed);
            self.num_bytes_read.fetch_add(length, Ordering::Relaxed);
            self.max_byte_read
                .fetch_max(offset + length - 1, Ordering::Relaxed);
            self.min_byte_read.fetch_min(offset, Ordering::Relaxed);
        }

        // Readahead must stay ahead of what the application already read.
        let max = self.max_byte_read.load(Ordering::Relaxed);
        let mut last = self.last_byte_readahead.load(Ordering::Relaxed);
        while last < max {
            match self.last_byte_readahead.compare_exchange_weak(
                last,
                max,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => last = observed,
            }
        }
    }

    /// Offset for the next readahead of `length` bytes, or 0 if readahead
    /// should not be issued right now. Concurrent callers never receive
    /// overlapping ranges.
    pub fn get_next_ra(&self, length: u64) -> u64 {
        debug_assert!(length > 0);

        if self
            .last_byte_readahead
            .load(Ordering::Relaxed)
            .saturating_add(1 + length)
            > MAX_FILE_SIZE
        {
            return 0;
        }

        if !self.is_sequential() {
            return 0;
        }

        // Reserve the bytes, undoing the reservation if it would push the
        // in-flight total over the window.
        let prev = self.ra_ongoing.fetch_add(length, Ordering::Relaxed);
        if prev + length > self.ra_bytes {
            self.ra_ongoing.fetch_sub(length, Ordering::Relaxed);
            return 0;
        }

        let _guard = self.lock.write().expect("poisoned");
        self.last_byte_readahead.fetch_add(length, Ordering::Relaxed) + 1
    }

    /// Report completion of a readahead previously suggested by
    /// [`Self::get_next_ra`]. `length` must match the requested length even
    /// if the read came up short or failed.
    pub fn on_readahead_complete(&self, _offset: u64, length: u64) {
        debug_assert!(self.ra_ongoing.load(Ordering::Relaxed) >= length);
        self.ra_ongoing.fetch_sub(length, Ordering::Relaxed);
    }

    /// Whether the observed pattern currently qualifies as sequential.
    pub fn is_sequential(&self) -> bool {
        let _guard = self.lock.read().expect("poisoned");
        self.is_sequential_locked()
    }

    fn is_sequential_locked(&self) -> bool {
        if self.num_reads.load(Ordering::Relaxed) < 3 {
            return false;
        }

        let max = self.max_byte_read.load(Ordering::Relaxed);
        let min = self.min_byte_read.load(Ordering::Relaxed);
        let access_range = max.wrapping_sub(min);
        if access_range == 0 {
            // Identical reads repeated; not a forward-moving stream.
            return false;
        }

        let density = (self.num_bytes_read.load(Ordering::Relaxed) * 100) / access_range;
        density > ACCESS_DENSITY_MIN
    }

    /// Bytes of readahead currently in flight.
    pub fn ongoing(&self) -> u64 {
        self.ra_ongoing.load(Ordering::Relaxed)
    }

    /// Configured window size in bytes.
    pub fn window(&self) -> u64 {
        self.ra_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const KIB: u64 = 1024;

    fn state_1mib() -> RaState {
        RaState::new(7, 1024)
    }

    #[test]
    fn three_dense_reads_qualify_as_sequential() {
        let ra = state_1mib();
        ra.on_application_read(0, 64 * KIB);
        assert!(!ra.is_sequential(), "one read is not a pattern");
        ra.on_application_read(64 * KIB, 64 * KIB);
        assert!(!ra.is_sequential(), "two reads are not a pattern");
        ra.on_application_read(128 * KIB, 64 * KIB);
        assert!(ra.is_sequential(), "three dense reads are sequential");

        let off = ra.get_next_ra(256 * KIB);
        assert_eq!(off, 192 * KIB, "window starts just past the last read");
        assert_eq!(ra.ongoing(), 256 * KIB);
    }

    #[test]
    fn section_jumps_reset_the_detector() {
        let ra = state_1mib();
        ra.on_application_read(0, 64 * KIB);
        ra.on_application_read(2 * SECTION_SIZE, 64 * KIB);
        ra.on_application_read(4 * SECTION_SIZE, 64 * KIB);
        assert!(!ra.is_sequential(), "section jumps are not sequential");
        assert_eq!(ra.get_next_ra(256 * KIB), 0);
    }

    #[test]
    fn sparse_reads_fail_the_density_check() {
        let ra = state_1mib();
        // 4 KiB reads with 256 KiB gaps: low density, within one window.
        ra.on_application_read(0, 4 * KIB);
        ra.on_application_read(256 * KIB, 4 * KIB);
        ra.on_application_read(512 * KIB, 4 * KIB);
        assert!(!ra.is_sequential());
    }

    #[test]
    fn window_reservation_is_capped() {
        let ra = state_1mib();
        for i in 0..3 {
            ra.on_application_read(i * 64 * KIB, 64 * KIB);
        }
        assert!(ra.is_sequential());

        let mut got = 0;
        while ra.get_next_ra(256 * KIB) != 0 {
            got += 1;
        }
        assert_eq!(got, 4, "1 MiB window fits four 256 KiB chunks");
        assert_eq!(ra.ongoing(), 1024 * KIB);

        // Completion frees window for further recommendations.
        ra.on_readahead_complete(0, 256 * KIB);
        assert_ne!(ra.get_next_ra(256 * KIB), 0);
    }

    #[test]
    fn recommendations_never_overlap_across_threads() {
        let ra = Arc::new(RaState::new(7, MAX_RA_KIB));
        for i in 0..3 {
            ra.on_application_read(i * 64 * KIB, 64 * KIB);
        }
        assert!(ra.is_sequential());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ra = Arc::clone(&ra);
            handles.push(std::thread::spawn(move || {
                let mut offsets = Vec::new();
                for _ in 0..64 {
                    let off = ra.get_next_ra(128 * KIB);
                    if off != 0 {
                        offsets.push(off);
                    }
                }
                offsets
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();
        assert!(!all.is_empty());
        all.sort_unstable();
        for pair in all.windows(2) {
            assert!(
                pair[0] + 128 * KIB <= pair[1],
                "ranges {} and {} overlap",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn reset_after_jump_requires_fresh_proof() {
        let ra = state_1mib();
        for i in 0..3 {
            ra.on_application_read(i * 64 * KIB, 64 * KIB);
        }
        assert!(ra.is_sequential());

        // A jump past the window resets everything.
        ra.on_application_read(SECTION_SIZE + 512 * KIB, 64 * KIB);
        assert!(!ra.is_sequential(), "jump must reset the pattern");
        assert_eq!(ra.get_next_ra(128 * KIB), 0);

        // Three dense reads at the new location re-qualify.
        ra.on_application_read(SECTION_SIZE + 576 * KIB, 64 * KIB);
        ra.on_application_read(SECTION_SIZE + 640 * KIB, 64 * KIB);
        assert!(ra.is_sequential());
    }

    #[test]
    fn no_recommendation_past_the_file_size_ceiling() {
        let ra = state_1mib();
        let tail = MAX_FILE_SIZE - 128 * KIB;
        ra.on_application_read(tail, 32 * KIB);
        ra.on_application_read(tail + 32 * KIB, 32 * KIB);
        ra.on_application_read(tail + 64 * KIB, 32 * KIB);
        assert!(ra.is_sequential());
        assert_eq!(
            ra.get_next_ra(256 * KIB),
            0,
            "would run past the object size ceiling"
        );
    }
}
