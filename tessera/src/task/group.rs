use parking_lot::Mutex;
use std::sync::Arc;

/// Set of tasks connected by edges while a graph is being built.
///
/// Every task starts in a group of its own. `add_dependent` merges the groups
/// of both ends, so the root of a group always knows how many tasks a
/// submission of any of its roots makes reachable. Merges and submissions are
/// serialized by the owning scope's graph lock.
#[derive(Debug)]
pub(crate) struct Group {
    inner: Mutex<GroupInner>,
}

#[derive(Debug)]
struct GroupInner {
    parent: Option<Arc<Group>>,
    tasks: usize,
    submitted: bool,
}

impl Group {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(GroupInner {
                parent: None,
                tasks: 1,
                submitted: false,
            }),
        })
    }

    /// Representative of the set `group` belongs to. Compresses the path it
    /// walked so later lookups stay short.
    pub(crate) fn root(group: &Arc<Group>) -> Arc<Group> {
        let mut root = Arc::clone(group);
        loop {
            let parent = root.inner.lock().parent.clone();
            match parent {
                Some(parent) => root = parent,
                None => break,
            }
        }

        let mut node = Arc::clone(group);
        while !Arc::ptr_eq(&node, &root) {
            let next = node.inner.lock().parent.replace(Arc::clone(&root));
            match next {
                Some(next) => node = next,
                None => break,
            }
        }

        root
    }

    /// Merges the sets of `a` and `b`. The larger set absorbs the smaller one.
    pub(crate) fn union(a: &Arc<Group>, b: &Arc<Group>) {
        let a = Group::root(a);
        let b = Group::root(b);
        if Arc::ptr_eq(&a, &b) {
            return;
        }

        let (big, small) = if a.tasks() >= b.tasks() { (a, b) } else { (b, a) };

        let mut small_inner = small.inner.lock();
        let mut big_inner = big.inner.lock();
        big_inner.tasks += small_inner.tasks;
        big_inner.submitted |= small_inner.submitted;
        small_inner.parent = Some(Arc::clone(&big));
    }

    pub(crate) fn tasks(&self) -> usize {
        self.inner.lock().tasks
    }

    pub(crate) fn is_submitted(&self) -> bool {
        self.inner.lock().submitted
    }

    /// Marks the set submitted and returns how many tasks it had not
    /// accounted for yet. Call on a root only.
    pub(crate) fn mark_submitted(&self) -> usize {
        let mut inner = self.inner.lock();
        debug_assert!(inner.parent.is_none(), "mark_submitted on a non-root group");
        if inner.submitted {
            return 0;
        }
        inner.submitted = true;
        inner.tasks
    }
}
