//! Closing every descriptor that was not collected.
//!
//! Everything reachable from [`enforce`] and [`FdRestrict::on_exec_setup`]
//! runs between duplication and program replacement: it must not allocate,
//! lock or log. See signal-safety(7).

use std::os::fd::RawFd;

use crate::{
    collector::{LaunchConfiguration, ProtectedSet},
    config::{Ceiling, CloseStrategy, RestrictConfig},
    contribute::Pass,
    error::{FenceError, Result},
};

/// Used when `sysconf(_SC_OPEN_MAX)` reports no limit or fails.
pub const FALLBACK_OPEN_MAX: RawFd = 1024;

/// The process descriptor table, as seen by the closer.
pub trait DescriptorTable {
    /// Exclusive upper bound of descriptor numbers to consider.
    fn max_fd(&self) -> RawFd;

    /// Close `fd`. Failures are ignored: a descriptor that cannot be closed
    /// was not open.
    fn close(&mut self, fd: RawFd);

    /// Close `first..=last` in one call. Returns false when unsupported, the
    /// caller then closes one by one.
    fn close_range(&mut self, _first: RawFd, _last: RawFd) -> bool {
        false
    }
}

/// The real descriptor table of the calling process.
#[derive(Debug, Clone, Copy, Default)]
pub struct Os {
    ceiling: Ceiling,
}

impl Os {
    pub fn new(ceiling: Ceiling) -> Self {
        Self { ceiling }
    }
}

/// `sysconf(_SC_OPEN_MAX)`, clamped to a usable descriptor number.
///
/// # Signal Safety
/// This function is signal safe.
pub fn sysconf_open_max() -> RawFd {
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if max <= 0 {
        FALLBACK_OPEN_MAX
    } else {
        max.min(RawFd::MAX as libc::c_long) as RawFd
    }
}

impl DescriptorTable for Os {
    fn max_fd(&self) -> RawFd {
        match self.ceiling {
            Ceiling::Sysconf => sysconf_open_max(),
            Ceiling::Fixed(max) => max,
        }
    }

    fn close(&mut self, fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[cfg(target_os = "linux")]
    fn close_range(&mut self, first: RawFd, last: RawFd) -> bool {
        crate::close_range::CloseRange::new(first as u32, last as u32)
            .close()
            .is_ok()
    }
}

/// Close every descriptor in `[0, table.max_fd())` that is not in `set`.
///
/// Sorts `set` in place. Protected descriptors are never touched, whether
/// they are open or not.
///
/// # Signal Safety
/// This function is signal safe as long as `table` is.
pub fn enforce<T>(
    set: &mut ProtectedSet,
    table: &mut T,
    strategy: CloseStrategy,
) where
    T: DescriptorTable + ?Sized,
{
    let protected = set.sort();
    let ceiling = table.max_fd();

    match strategy {
        CloseStrategy::Scan => close_unprotected(protected, 0, ceiling, table),
        CloseStrategy::Ranges => close_gaps(protected, ceiling, table),
    }
}

fn close_unprotected<T>(
    protected: &[RawFd],
    from: RawFd,
    to: RawFd,
    table: &mut T,
) where
    T: DescriptorTable + ?Sized,
{
    for fd in from..to {
        if protected.binary_search(&fd).is_err() {
            table.close(fd);
        }
    }
}

fn close_gaps<T>(protected: &[RawFd], ceiling: RawFd, table: &mut T)
where
    T: DescriptorTable + ?Sized,
{
    let mut next = 0;

    // sorted, so duplicates and negatives fall below `next`
    for &fd in protected {
        if fd >= ceiling {
            break;
        }
        if fd < next {
            continue;
        }
        if fd > next {
            close_span(next, fd - 1, table);
        }
        next = fd + 1;
    }

    if next < ceiling {
        close_span(next, ceiling - 1, table);
    }
}

fn close_span<T>(first: RawFd, last: RawFd, table: &mut T)
where
    T: DescriptorTable + ?Sized,
{
    if !table.close_range(first, last) {
        for fd in first..=last {
            table.close(fd);
        }
    }
}

/// The descriptor restriction of one launch.
///
/// Call [`FdRestrict::prepare`] before duplicating, then
/// [`FdRestrict::on_exec_setup`] in the child right before `execve`.
#[derive(Debug)]
pub struct FdRestrict<T: DescriptorTable = Os> {
    set: ProtectedSet,
    table: T,
    strategy: CloseStrategy,
}

impl FdRestrict<Os> {
    /// Reserve room for `capacity` protected descriptors up front.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_table(capacity, Os::default())
    }

    /// Build from a configuration, using `default_capacity` unless the
    /// configuration carries a hint.
    pub fn from_config(
        config: &RestrictConfig,
        default_capacity: usize,
    ) -> Result<Self> {
        let capacity = config.capacity_hint.unwrap_or(default_capacity);
        Ok(Self::with_table(capacity, Os::new(config.ceiling))?
            .strategy(config.strategy))
    }
}

impl<T: DescriptorTable> FdRestrict<T> {
    pub fn with_table(capacity: usize, table: T) -> Result<Self> {
        Ok(Self {
            set: ProtectedSet::with_capacity(capacity)?,
            table,
            strategy: CloseStrategy::default(),
        })
    }

    pub fn strategy(mut self, strategy: CloseStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Run a collection pass ahead of duplication.
    ///
    /// Grows the reserved storage if the configuration contributes more than
    /// expected, so the pass in the child fits, and rejects negative
    /// descriptors.
    pub fn prepare<C>(&mut self, config: &C) -> Result<()>
    where
        C: LaunchConfiguration + ?Sized,
    {
        let reserved = self.set.capacity();
        self.set.refill(config, Pass::Prepare)?;

        if self.set.capacity() != reserved {
            tracing::warn!(
                reserved,
                needed = self.set.len(),
                "capacity hint was too small for the protected descriptors"
            );
        }

        if let Some(&fd) = self.set.as_slice().iter().find(|&&fd| fd < 0) {
            return Err(FenceError::InvalidDescriptor(fd));
        }

        tracing::debug!(
            protected = ?self.set.as_slice(),
            strategy = ?self.strategy,
            "collected protected descriptors"
        );
        Ok(())
    }

    /// Collect again and close everything not protected.
    ///
    /// Fails without closing anything if the configuration contributes more
    /// descriptors than were reserved.
    ///
    /// # Signal Safety
    /// This function is signal safe as long as the configuration's
    /// contributions and the descriptor table are.
    pub fn on_exec_setup<C>(&mut self, config: &C) -> Result<()>
    where
        C: LaunchConfiguration + ?Sized,
    {
        self.set.refill(config, Pass::Critical)?;
        enforce(&mut self.set, &mut self.table, self.strategy);
        Ok(())
    }

    pub fn protected(&self) -> &ProtectedSet {
        &self.set
    }

    pub fn table(&self) -> &T {
        &self.table
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use crate::{
        contribute::{CollectFds, FdSink, OutTargets},
        options::{FileIn, LaunchOption, PipeOut},
    };

    use super::*;

    /// Records every close instead of performing it.
    #[derive(Default)]
    struct Recorder {
        max: RawFd,
        ranges: bool,
        closed: Vec<RawFd>,
        range_calls: usize,
    }

    impl Recorder {
        fn new(max: RawFd) -> Self {
            Self {
                max,
                ..Self::default()
            }
        }

        fn closed(&self) -> BTreeSet<RawFd> {
            self.closed.iter().copied().collect()
        }
    }

    impl DescriptorTable for Recorder {
        fn max_fd(&self) -> RawFd {
            self.max
        }

        fn close(&mut self, fd: RawFd) {
            self.closed.push(fd);
        }

        fn close_range(&mut self, first: RawFd, last: RawFd) -> bool {
            if !self.ranges {
                return false;
            }
            self.range_calls += 1;
            self.closed.extend(first..=last);
            true
        }
    }

    struct Keep(RawFd);
    impl CollectFds for Keep {
        fn collect_fds(&self, sink: &mut FdSink<'_>) {
            sink.push(self.0);
        }
    }

    fn enforced(fds: &[RawFd], table: &mut Recorder, strategy: CloseStrategy) {
        let keep: Vec<Keep> = fds.iter().copied().map(Keep).collect();
        let mut set = crate::collect(keep.as_slice(), keep.len()).unwrap();
        enforce(&mut set, table, strategy);
    }

    fn all_but(max: RawFd, keep: &[RawFd]) -> BTreeSet<RawFd> {
        (0..max).filter(|fd| !keep.contains(fd)).collect()
    }

    #[test]
    fn stdin_file_and_stdout_pipe_keep_zero_and_one() {
        let options: Vec<Box<dyn LaunchOption>> = vec![
            Box::new(FileIn::new("/etc/passwd").unwrap()),
            Box::new(PipeOut::new(7, OutTargets::stdout())),
        ];
        let mut restrict =
            FdRestrict::with_table(options.len(), Recorder::new(64)).unwrap();
        restrict.prepare(options.as_slice()).unwrap();
        restrict.on_exec_setup(options.as_slice()).unwrap();

        assert_eq!(restrict.protected().as_slice(), [0, 1]);
        assert_eq!(restrict.table().closed(), all_but(64, &[0, 1]));
        assert!(restrict.table().closed().contains(&2));
    }

    #[test]
    fn empty_configuration_closes_everything() {
        let mut table = Recorder::new(32);
        enforced(&[], &mut table, CloseStrategy::Scan);
        assert_eq!(table.closed(), all_but(32, &[]));
    }

    #[test]
    fn duplicates_behave_like_one_entry() {
        let mut once = Recorder::new(16);
        let mut twice = Recorder::new(16);
        enforced(&[1], &mut once, CloseStrategy::Scan);
        enforced(&[1, 1], &mut twice, CloseStrategy::Scan);
        assert_eq!(once.closed, twice.closed);
    }

    #[test]
    fn each_descriptor_is_closed_once_in_ascending_order() {
        let mut table = Recorder::new(10);
        enforced(&[5, 2], &mut table, CloseStrategy::Scan);
        assert_eq!(table.closed, [0, 1, 3, 4, 6, 7, 8, 9]);
    }

    #[test]
    fn descriptors_beyond_the_ceiling_are_ignored() {
        let mut table = Recorder::new(4);
        enforced(&[2, 100, -1], &mut table, CloseStrategy::Scan);
        assert_eq!(table.closed, [0, 1, 3]);
    }

    #[test]
    fn ranges_close_the_same_descriptors_as_scan() {
        let cases: [&[RawFd]; 6] = [
            &[],
            &[0, 1, 2],
            &[3, 3, 7],
            &[-4, 0, 63],
            &[12, 1, 40, 2],
            &[64, 70],
        ];
        for keep in cases {
            let mut scan = Recorder::new(64);
            let mut ranges = Recorder {
                ranges: true,
                ..Recorder::new(64)
            };
            enforced(keep, &mut scan, CloseStrategy::Scan);
            enforced(keep, &mut ranges, CloseStrategy::Ranges);
            assert_eq!(scan.closed(), ranges.closed(), "keep = {keep:?}");
        }
    }

    #[test]
    fn ranges_close_one_span_per_gap() {
        let mut table = Recorder {
            ranges: true,
            ..Recorder::new(100)
        };
        enforced(&[0, 1, 2, 50], &mut table, CloseStrategy::Ranges);
        assert_eq!(table.range_calls, 2);
    }

    #[test]
    fn ranges_fall_back_to_single_closes() {
        let mut table = Recorder::new(8);
        enforced(&[4], &mut table, CloseStrategy::Ranges);
        assert_eq!(table.closed, [0, 1, 2, 3, 5, 6, 7]);
        assert_eq!(table.range_calls, 0);
    }

    #[test]
    fn enforcing_twice_closes_the_same_set() {
        let keep = [Keep(0), Keep(9)];
        let mut restrict =
            FdRestrict::with_table(2, Recorder::new(20)).unwrap();
        restrict.on_exec_setup(&keep[..]).unwrap();
        let first = restrict.table().closed.clone();
        restrict.on_exec_setup(&keep[..]).unwrap();
        let second = &restrict.table().closed[first.len()..];
        assert_eq!(first, second);
    }

    #[test]
    fn undersized_set_closes_nothing() {
        let keep = [Keep(0), Keep(1), Keep(2)];
        let mut restrict =
            FdRestrict::with_table(1, Recorder::new(20)).unwrap();
        let err = restrict.on_exec_setup(&keep[..]).unwrap_err();
        assert!(matches!(err, FenceError::CapacityExceeded { .. }));
        assert!(restrict.table().closed.is_empty());
    }

    #[test]
    fn prepare_rejects_negative_descriptors() {
        let keep = [Keep(-3)];
        let mut restrict =
            FdRestrict::with_table(1, Recorder::new(20)).unwrap();
        let err = restrict.prepare(&keep[..]).unwrap_err();
        assert!(matches!(err, FenceError::InvalidDescriptor(-3)));
    }

    #[test]
    fn prepare_grows_a_small_hint() {
        let keep = [Keep(3), Keep(4), Keep(5)];
        let mut restrict =
            FdRestrict::with_table(0, Recorder::new(8)).unwrap();
        restrict.prepare(&keep[..]).unwrap();
        assert!(restrict.protected().capacity() >= 3);
        restrict.on_exec_setup(&keep[..]).unwrap();
        assert_eq!(restrict.table().closed, [0, 1, 2, 6, 7]);
    }

    #[test]
    fn fixed_ceiling_is_used_verbatim() {
        assert_eq!(Os::new(Ceiling::Fixed(77)).max_fd(), 77);
    }

    #[test]
    fn sysconf_ceiling_is_positive() {
        assert!(Os::default().max_fd() > 2);
    }
}
