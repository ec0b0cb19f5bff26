//! Pend and wake primitives shared by every blocking object.
use crate::error::WakeError;
use crate::klock::{CpuLockCell, CpuLockTokenRefMut};
use crate::obj::{BlockObj, QueueOrder};
use crate::task::readyqueue::Queue as _;
use crate::task::{TaskCb, TaskState, WakeReason};
use crate::tick;
use crate::utils::intrusive_list::{Link, ListAccessor, ListHead};
use crate::{KernelTraits, Tick};

/// The object a task is pending on. Stored in the task so that wake paths
/// can find both the pend list and, for a mutex, the inheritance chain.
pub(crate) enum BlkSource<Traits: KernelTraits> {
    Semaphore(&'static crate::semaphore::SemaphoreCb<Traits>),
    Queue(&'static crate::queue::QueueCb<Traits>),
    Mutex(&'static crate::mutex::MutexCb<Traits>),
}

impl<Traits: KernelTraits> Clone for BlkSource<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: KernelTraits> Copy for BlkSource<Traits> {}

impl<Traits: KernelTraits> BlkSource<Traits> {
    pub(crate) fn obj(self) -> &'static BlockObj<Traits> {
        match self {
            Self::Semaphore(cb) => &cb.blk_obj,
            Self::Queue(cb) => &cb.blk_obj,
            Self::Mutex(cb) => &cb.blk_obj,
        }
    }
}

/// An accessor for a list of tasks linked through `TaskCb::run_link`
/// (a pend list, or the dead/pool lists of dynamic task reclamation).
pub(crate) fn run_list_accessor<'a, Traits: KernelTraits>(
    head: &'a CpuLockCell<Traits, ListHead<TaskCb<Traits>>>,
) -> ListAccessor<
    'a,
    Traits,
    TaskCb<Traits>,
    impl Fn(&'static TaskCb<Traits>) -> &'static CpuLockCell<Traits, Option<Link<TaskCb<Traits>>>>,
> {
    ListAccessor::new(head, |task: &'static TaskCb<Traits>| &task.run_link)
}

#[cfg(feature = "system_stats")]
pub(crate) fn registry_task_accessor<'a, Traits: KernelTraits>(
    head: &'a CpuLockCell<Traits, ListHead<TaskCb<Traits>>>,
) -> ListAccessor<
    'a,
    Traits,
    TaskCb<Traits>,
    impl Fn(&'static TaskCb<Traits>) -> &'static CpuLockCell<Traits, Option<Link<TaskCb<Traits>>>>,
> {
    ListAccessor::new(head, |task: &'static TaskCb<Traits>| &task.registry_link)
}

/// The head task of an object's pend list.
pub(crate) fn pend_list_front<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    obj: &'static BlockObj<Traits>,
) -> Option<&'static TaskCb<Traits>> {
    run_list_accessor(&obj.pend_list).front(lock.borrow_mut())
}

/// Transition `task` (the current task) into the Pend state: insert it into
/// the object's pend list in policy order, remove it from the ready queue,
/// and arm a deadline if the wait is bounded.
pub(crate) fn pend_to_blk_obj<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    source: BlkSource<Traits>,
    deadline: Option<Tick>,
) {
    task.state.replace(&mut *lock, TaskState::Pend);
    task.wake_reason.replace(&mut *lock, WakeReason::Finish);
    task.blk_on.replace(&mut *lock, Some(source));

    if let Some(ticks) = deadline {
        tick::tick_list_insert(lock.borrow_mut(), task, ticks);
    }

    Traits::state().ready_queue.remove(lock.borrow_mut(), task);

    let obj = source.obj();
    let list = run_list_accessor(&obj.pend_list);
    match obj.order.get(&*lock) {
        QueueOrder::Fifo => list.push_back(lock, task),
        QueueOrder::TaskPriority => {
            let anchor = pend_insert_anchor(lock.borrow_mut(), obj, task);
            list.insert_before(lock, task, anchor);
        }
    }
}

/// Find the first pend-list entry with a strictly worse priority than
/// `task`, preserving FIFO order among equal priorities.
fn pend_insert_anchor<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    obj: &'static BlockObj<Traits>,
    task: &'static TaskCb<Traits>,
) -> Option<&'static TaskCb<Traits>> {
    let list = run_list_accessor(&obj.pend_list);
    let prio = task.prio.get(&*lock);
    let mut cursor = list.front(lock.borrow_mut());
    while let Some(entry) = cursor {
        if prio.is_higher_than(entry.prio.get(&*lock)) {
            return Some(entry);
        }
        cursor = list.next(lock.borrow_mut(), entry);
    }
    None
}

/// Unlink `task` from the pend list it is on and clear its block source.
/// Returns the source for the caller's inspection.
fn pend_list_unlink<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) -> BlkSource<Traits> {
    let source = task
        .blk_on
        .replace(&mut *lock, None)
        .expect("pending task without a block source");
    run_list_accessor(&source.obj().pend_list).remove(lock, task);
    source
}

/// Unlink `task` from its pend list because the wait is being torn down
/// (abort, timeout, or task/object deletion). If the task was a mutex
/// waiter, the holder's inherited priority is recomputed.
pub(crate) fn pend_list_rm<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    let source = pend_list_unlink(lock.borrow_mut(), task);
    if let BlkSource::Mutex(mutex) = source {
        crate::mutex::pend_removed_pri_reset(lock, mutex, task);
    }
}

/// Reposition `task` in its pend list after a priority change. FIFO lists
/// are left untouched.
pub(crate) fn pend_list_reorder<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    let Some(source) = task.blk_on.get(&*lock) else { return };
    let obj = source.obj();

    if obj.order.get(&*lock) != QueueOrder::TaskPriority {
        return;
    }

    let list = run_list_accessor(&obj.pend_list);
    list.remove(lock.borrow_mut(), task);
    let anchor = pend_insert_anchor(lock.borrow_mut(), obj, task);
    list.insert_before(lock, task, anchor);
}

/// Wake a waiting task with the given reason.
///
/// The task leaves both the timeout list and its pend list. A plain wait
/// returns to the ready queue; a wait with pending suspensions parks in
/// `Suspended` and delivers the reason when it is resumed. For reasons
/// other than `Finish` on a mutex wait, the holder's inherited priority is
/// recomputed.
pub(crate) fn wake_task<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    reason: WakeReason,
) {
    tick::tick_list_rm(lock.borrow_mut(), task);

    let state = task.state.get(&*lock);
    match state {
        TaskState::Pend | TaskState::PendSuspended => {
            if reason == WakeReason::Finish {
                pend_list_unlink(lock.borrow_mut(), task);
            } else {
                pend_list_rm(lock.borrow_mut(), task);
            }
        }
        TaskState::Sleep | TaskState::SleepSuspended => {}
        // Not waiting (e.g. already woken within the same critical section)
        _ => return,
    }

    task.wake_reason.replace(&mut *lock, reason);

    match state {
        TaskState::Pend | TaskState::Sleep => {
            task.state.replace(&mut *lock, TaskState::Ready);
            Traits::state().ready_queue.add(lock, task);
        }
        TaskState::PendSuspended | TaskState::SleepSuspended => {
            task.state.replace(&mut *lock, TaskState::Suspended);
        }
        _ => unreachable!(),
    }
}

/// Wake every task pending on the object with the given reason. Used by
/// object deletion and wake-all signal variants.
pub(crate) fn wake_all_pending<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    obj: &'static BlockObj<Traits>,
    reason: WakeReason,
) {
    while let Some(front) = pend_list_front(lock.borrow_mut(), obj) {
        wake_task(lock.borrow_mut(), front, reason);
    }
}

/// Report why the current task's wait ended. Called by blocking APIs after
/// they regain the CPU.
pub(crate) fn pend_end<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) -> Result<(), WakeError> {
    match task.wake_reason.get(&*lock) {
        WakeReason::Finish => Ok(()),
        WakeReason::Timeout => Err(WakeError::Timeout),
        WakeReason::Abort => Err(WakeError::Interrupted),
        WakeReason::Deleted => Err(WakeError::Deleted),
    }
}
