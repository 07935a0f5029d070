//! Port allocation for concurrently running jobs.
//!
//! The port space starting at `base_port` is cut into fixed-size blocks, one
//! per job.  Each block starts with a small range reserved for fixture
//! processes; the remainder is handed to tests that start their own
//! processes.
//!
//! ```text
//! job 0                          job 1
//! ├─ fixture ─┼──── tests ──────┤├─ fixture ─┼──── tests ──────┤
//! base        base+20     base+249 base+250   base+270  base+499
//! ```

use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;

/// Default first port of job 0.
pub const DEFAULT_BASE_PORT: u16 = 20000;

/// Default number of ports in each job's block.
pub const DEFAULT_PORTS_PER_JOB: u16 = 250;

/// Default number of ports at the start of each block reserved for fixtures.
pub const DEFAULT_PORTS_PER_FIXTURE: u16 = 20;

/// Largest valid TCP port.
pub const MAX_PORT: u32 = 65535;

/// Errors from the port allocator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("job {job} requested more than the {reserved} ports reserved for its fixtures")]
    FixtureRangeExhausted { job: usize, reserved: u16 },

    #[error("port {port} for job {job} exceeds the maximum port {MAX_PORT}")]
    OutOfRange { job: usize, port: u64 },

    #[error("invalid port layout: {0}")]
    InvalidLayout(String),
}

/// Hands out ports from per-job blocks.
///
/// One allocator is created per run and shared by every fixture.  The only
/// mutable state is the per-job fixture counter table, guarded by one lock.
///
/// # Example
///
/// ```
/// use testrig_fixture::ports::PortAllocator;
///
/// let ports = PortAllocator::new(20000);
/// assert_eq!(ports.next_fixture_port(0).unwrap(), 20000);
/// assert_eq!(ports.next_fixture_port(0).unwrap(), 20001);
/// assert_eq!(ports.min_test_port(0).unwrap(), 20020);
/// assert_eq!(ports.max_test_port(0).unwrap(), 20249);
/// ```
#[derive(Debug)]
pub struct PortAllocator {
    base_port: u16,
    ports_per_job: u16,
    ports_per_fixture: u16,
    next_fixture: Mutex<HashMap<usize, u16>>,
}

impl PortAllocator {
    /// Create an allocator with the default block layout.
    pub fn new(base_port: u16) -> Self {
        Self {
            base_port,
            ports_per_job: DEFAULT_PORTS_PER_JOB,
            ports_per_fixture: DEFAULT_PORTS_PER_FIXTURE,
            next_fixture: Mutex::new(HashMap::new()),
        }
    }

    /// Create an allocator with a custom block layout.
    pub fn with_layout(
        base_port: u16,
        ports_per_job: u16,
        ports_per_fixture: u16,
    ) -> Result<Self, PortError> {
        if ports_per_fixture >= ports_per_job {
            return Err(PortError::InvalidLayout(format!(
                "{} fixture ports leave no test ports in a block of {}",
                ports_per_fixture, ports_per_job
            )));
        }
        Ok(Self {
            base_port,
            ports_per_job,
            ports_per_fixture,
            next_fixture: Mutex::new(HashMap::new()),
        })
    }

    /// The first port of job 0.
    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Return the next unused port in `job`'s fixture range.
    pub fn next_fixture_port(&self, job: usize) -> Result<u16, PortError> {
        let mut counters = self.next_fixture.lock();
        let used = counters.entry(job).or_insert(0);
        if *used >= self.ports_per_fixture {
            return Err(PortError::FixtureRangeExhausted {
                job,
                reserved: self.ports_per_fixture,
            });
        }

        let port = self.check_port(job, self.block_start(job) + u64::from(*used))?;
        *used += 1;
        Ok(port)
    }

    /// Lowest port a test running in `job` may use.
    pub fn min_test_port(&self, job: usize) -> Result<u16, PortError> {
        self.check_port(job, self.block_start(job) + u64::from(self.ports_per_fixture))
    }

    /// Highest port a test running in `job` may use.
    ///
    /// One less than the first port of the next job's block.
    pub fn max_test_port(&self, job: usize) -> Result<u16, PortError> {
        self.check_port(job, self.block_start(job + 1) - 1)
    }

    /// Forget every fixture allocation.  Used between independent suites.
    pub fn reset(&self) {
        self.next_fixture.lock().clear();
    }

    fn block_start(&self, job: usize) -> u64 {
        u64::from(self.base_port) + job as u64 * u64::from(self.ports_per_job)
    }

    fn check_port(&self, job: usize, port: u64) -> Result<u16, PortError> {
        if port > u64::from(MAX_PORT) {
            return Err(PortError::OutOfRange { job, port });
        }
        Ok(port as u16)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fixture_ports_are_sequential_from_block_start() {
        let ports = PortAllocator::new(20000);
        assert_eq!(ports.next_fixture_port(0).unwrap(), 20000);
        assert_eq!(ports.next_fixture_port(0).unwrap(), 20001);
        assert_eq!(ports.next_fixture_port(0).unwrap(), 20002);
        assert_eq!(ports.next_fixture_port(1).unwrap(), 20250);
    }

    #[test]
    fn test_port_bounds() {
        let ports = PortAllocator::new(20000);
        assert_eq!(ports.min_test_port(0).unwrap(), 20020);
        assert_eq!(ports.max_test_port(0).unwrap(), 20249);
        assert_eq!(ports.min_test_port(1).unwrap(), 20270);
        assert_eq!(ports.max_test_port(1).unwrap(), 20499);
    }

    #[test]
    fn test_ranges_are_disjoint_and_follow_fixture_range() {
        let ports = PortAllocator::new(20000);
        for j1 in 0..20 {
            let (lo1, hi1) = (ports.min_test_port(j1).unwrap(), ports.max_test_port(j1).unwrap());
            assert!(ports.block_start(j1) < u64::from(lo1));
            assert!(lo1 <= hi1);
            for j2 in 0..20 {
                if j1 == j2 {
                    continue;
                }
                let (lo2, hi2) =
                    (ports.min_test_port(j2).unwrap(), ports.max_test_port(j2).unwrap());
                assert!(hi1 < lo2 || hi2 < lo1, "jobs {} and {} overlap", j1, j2);
            }
        }
    }

    #[test]
    fn fixture_range_exhaustion_and_reset() {
        let ports = PortAllocator::new(20000);
        for i in 0..20 {
            assert_eq!(ports.next_fixture_port(3).unwrap(), 20750 + i);
        }
        assert_eq!(
            ports.next_fixture_port(3),
            Err(PortError::FixtureRangeExhausted { job: 3, reserved: 20 })
        );
        // Other jobs are unaffected.
        assert_eq!(ports.next_fixture_port(4).unwrap(), 21000);

        ports.reset();
        assert_eq!(ports.next_fixture_port(3).unwrap(), 20750);
    }

    #[test]
    fn ports_beyond_maximum_are_rejected() {
        let ports = PortAllocator::new(65000);
        assert!(ports.next_fixture_port(2).is_ok());
        assert!(matches!(
            ports.next_fixture_port(3),
            Err(PortError::OutOfRange { job: 3, port: 65750 })
        ));
        assert!(matches!(ports.max_test_port(2), Err(PortError::OutOfRange { .. })));
    }

    #[test]
    fn custom_layout_must_leave_test_ports() {
        assert!(PortAllocator::with_layout(20000, 10, 10).is_err());
        let ports = PortAllocator::with_layout(20000, 10, 2).unwrap();
        assert_eq!(ports.min_test_port(1).unwrap(), 20012);
        assert_eq!(ports.max_test_port(1).unwrap(), 20019);
    }

    #[test]
    fn concurrent_allocation_never_hands_out_duplicates() {
        let ports = Arc::new(PortAllocator::new(20000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ports = Arc::clone(&ports);
                std::thread::spawn(move || {
                    (0..5).map(|_| ports.next_fixture_port(0).unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u16> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        let expected: Vec<u16> = (20000..20020).collect();
        assert_eq!(all, expected);
    }
}
