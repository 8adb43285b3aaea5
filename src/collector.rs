//! Gathering the protected descriptors of one launch.

use std::os::fd::RawFd;

use crate::{
    contribute::{CollectFds, FdSink, Pass},
    error::{FenceError, Result},
};

/// A fully assembled launch: a top-level context plus its options.
pub trait LaunchConfiguration {
    /// Call `visit` on the launch context, then on every option.
    ///
    /// Must not allocate: it runs again in the child.
    fn visit_contributors(&self, visit: &mut dyn FnMut(&dyn CollectFds));
}

impl<T: CollectFds> LaunchConfiguration for [T] {
    fn visit_contributors(&self, visit: &mut dyn FnMut(&dyn CollectFds)) {
        for option in self {
            visit(option);
        }
    }
}

/// Descriptors that must stay open in the child.
///
/// Storage is reserved up front and reused by every pass. Entries are in
/// contribution order until [`ProtectedSet::sort`] is called; duplicates
/// are kept.
#[derive(Debug, Default)]
pub struct ProtectedSet {
    fds: Vec<RawFd>,
}

impl ProtectedSet {
    /// Create a set able to hold `capacity` descriptors without allocating.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut set = Self::default();
        set.reserve(capacity)?;
        Ok(set)
    }

    /// Make room for at least `additional` more descriptors than the set
    /// currently holds.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        self.fds
            .try_reserve_exact(additional)
            .map_err(FenceError::Reserve)
    }

    /// Clear the set and collect every contribution of `config` into it.
    ///
    /// With [`Pass::Critical`] this never allocates and fails with
    /// [`FenceError::CapacityExceeded`] when the reserved storage is too
    /// small. The set then holds only the contributions that fit and must
    /// not be enforced.
    pub fn refill<C>(&mut self, config: &C, pass: Pass) -> Result<()>
    where
        C: LaunchConfiguration + ?Sized,
    {
        self.fds.clear();

        let mut sink = FdSink::new(&mut self.fds, pass);
        config.visit_contributors(&mut |contributor: &dyn CollectFds| {
            contributor.collect_fds(&mut sink)
        });
        let (dropped, reserve_error) = sink.finish();

        if let Some(e) = reserve_error {
            return Err(FenceError::Reserve(e));
        }
        if dropped > 0 {
            return Err(FenceError::CapacityExceeded {
                needed: self.fds.len() + dropped,
                capacity: self.fds.capacity(),
            });
        }
        Ok(())
    }

    /// Sort in place and return the sorted descriptors.
    ///
    /// # Signal Safety
    /// This function is signal safe, `sort_unstable` does not allocate.
    pub fn sort(&mut self) -> &[RawFd] {
        self.fds.sort_unstable();
        &self.fds
    }

    /// Membership test. Only meaningful after [`ProtectedSet::sort`].
    pub fn contains(&self, fd: RawFd) -> bool {
        self.fds.binary_search(&fd).is_ok()
    }

    pub fn as_slice(&self) -> &[RawFd] {
        &self.fds
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.fds.capacity()
    }
}

/// Collect the protected descriptors of `config` into a new set reserved for
/// `capacity_hint` entries.
///
/// Runs as a [`Pass::Prepare`] pass, so it may grow past the hint. Size the
/// hint for the later critical pass, the number of options is a good start.
pub fn collect<C>(config: &C, capacity_hint: usize) -> Result<ProtectedSet>
where
    C: LaunchConfiguration + ?Sized,
{
    let mut set = ProtectedSet::with_capacity(capacity_hint)?;
    set.refill(config, Pass::Prepare)?;
    Ok(set)
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use crate::{
        contribute::{OutTargets, StdStream},
        options::{FileIn, LaunchOption, NullOut, PipeIn, PipeOut},
    };

    use super::*;

    struct Keep(RawFd);
    impl CollectFds for Keep {
        fn collect_fds(&self, sink: &mut FdSink<'_>) {
            sink.push(self.0);
        }
    }

    struct Unregistered;
    impl CollectFds for Unregistered {}
    impl LaunchOption for Unregistered {}

    struct Launch {
        context: Keep,
        options: Vec<Box<dyn LaunchOption>>,
    }

    impl LaunchConfiguration for Launch {
        fn visit_contributors(&self, visit: &mut dyn FnMut(&dyn CollectFds)) {
            visit(&self.context);
            for option in &self.options {
                visit(option);
            }
        }
    }

    fn unordered(set: &ProtectedSet) -> BTreeSet<RawFd> {
        set.as_slice().iter().copied().collect()
    }

    #[test]
    fn collects_context_and_every_option() {
        let launch = Launch {
            context: Keep(5),
            options: vec![
                Box::new(FileIn::new("/dev/null").unwrap()),
                Box::new(PipeOut::new(8, OutTargets::stdout())),
            ],
        };
        let mut set = collect(&launch, launch.options.len()).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.sort(), [0, 1, 5]);
        assert!(set.contains(5));
        assert!(!set.contains(2));
    }

    #[test]
    fn equals_union_of_independent_contributions() {
        let options: Vec<Box<dyn LaunchOption>> = vec![
            Box::new(PipeIn::new(10)),
            Box::new(NullOut::new(OutTargets::both())),
            Box::new(PipeOut::new(11, OutTargets::stdout())),
        ];
        let set = collect(options.as_slice(), 1).unwrap();

        let mut expected = BTreeSet::new();
        for option in &options {
            let one = collect(std::slice::from_ref(option), 0).unwrap();
            expected.extend(unordered(&one));
        }
        assert_eq!(unordered(&set), expected);
        // duplicates are stored, not merged
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn unregistered_option_changes_nothing() {
        let with: Vec<Box<dyn LaunchOption>> =
            vec![Box::new(PipeIn::new(3)), Box::new(Unregistered)];
        let without: Vec<Box<dyn LaunchOption>> =
            vec![Box::new(PipeIn::new(3))];
        assert_eq!(
            collect(with.as_slice(), 2).unwrap().as_slice(),
            collect(without.as_slice(), 2).unwrap().as_slice()
        );
    }

    #[test]
    fn order_does_not_matter() {
        let forward = [Keep(4), Keep(StdStream::Stderr.fd()), Keep(9)];
        let backward = [Keep(9), Keep(StdStream::Stderr.fd()), Keep(4)];
        let a = collect(&forward[..], 3).unwrap();
        let b = collect(&backward[..], 3).unwrap();
        assert_eq!(unordered(&a), unordered(&b));
    }

    #[test]
    fn refill_reuses_storage() {
        let launch = [Keep(1), Keep(2)];
        let mut set = ProtectedSet::with_capacity(8).unwrap();
        let capacity = set.capacity();

        set.refill(&launch[..], Pass::Prepare).unwrap();
        set.refill(&launch[..], Pass::Critical).unwrap();

        assert_eq!(set.as_slice(), [1, 2]);
        assert_eq!(set.capacity(), capacity);
    }

    #[test]
    fn critical_pass_reports_undersized_storage() {
        let launch = [Keep(1), Keep(2), Keep(3)];
        let mut set = ProtectedSet::with_capacity(1).unwrap();
        let capacity = set.capacity();
        assert!(capacity < launch.len());

        let err = set.refill(&launch[..], Pass::Critical).unwrap_err();
        assert!(matches!(
            err,
            FenceError::CapacityExceeded { needed: 3, capacity: c } if c == capacity
        ));
        assert_eq!(set.capacity(), capacity);
    }

    #[test]
    fn prepare_pass_grows_past_hint() {
        let launch = [Keep(1), Keep(2), Keep(3)];
        let set = collect(&launch[..], 0).unwrap();
        assert_eq!(set.as_slice(), [1, 2, 3]);
    }

    #[test]
    fn empty_configuration_collects_nothing() {
        let launch: [Keep; 0] = [];
        let set = collect(&launch[..], 0).unwrap();
        assert!(set.is_empty());
    }
}
