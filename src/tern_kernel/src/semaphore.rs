//! Counting semaphores
use core::fmt;

use crate::error::{
    QueryKobjError, SetSemaphoreError, SignalSemaphoreError, WaitSemaphoreError,
};
use crate::klock::{self, CpuLockCell, CpuLockTokenRefMut};
use crate::obj::{AllocKind, BlockObj, ObjKind, QueueOrder};
use crate::sched;
use crate::task::WakeReason;
use crate::trace;
use crate::utils::Init;
use crate::wait::{self, BlkSource};
use crate::{KernelTraits, Timeout};

#[cfg(feature = "dyn_alloc")]
use crate::error::CreateKobjError;
#[cfg(feature = "system_stats")]
use crate::utils::intrusive_list::{Link, ListAccessor, ListHead};

/// The semaphore count type.
pub type SemCount = u32;

/// *Semaphore control block* - the state data of a semaphore.
pub struct SemaphoreCb<Traits: KernelTraits> {
    pub(crate) blk_obj: BlockObj<Traits>,
    pub(crate) count: CpuLockCell<Traits, SemCount>,
    /// The highest count ever observed.
    #[cfg(feature = "system_stats")]
    pub(crate) peak_count: CpuLockCell<Traits, SemCount>,
    pub(crate) alloc_kind: CpuLockCell<Traits, AllocKind>,
    #[cfg(feature = "system_stats")]
    pub(crate) registry_link: CpuLockCell<Traits, Option<Link<SemaphoreCb<Traits>>>>,
    #[cfg(feature = "dyn_alloc")]
    pub(crate) pool_link:
        CpuLockCell<Traits, Option<crate::utils::intrusive_list::Link<SemaphoreCb<Traits>>>>,
}

impl<Traits: KernelTraits> Init for SemaphoreCb<Traits> {
    const INIT: Self = Self {
        blk_obj: Init::INIT,
        count: Init::INIT,
        #[cfg(feature = "system_stats")]
        peak_count: Init::INIT,
        alloc_kind: Init::INIT,
        #[cfg(feature = "system_stats")]
        registry_link: Init::INIT,
        #[cfg(feature = "dyn_alloc")]
        pool_link: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for SemaphoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("self", &(self as *const _))
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "system_stats")]
fn registry_accessor<'a, Traits: KernelTraits>(
    head: &'a CpuLockCell<Traits, ListHead<SemaphoreCb<Traits>>>,
) -> ListAccessor<
    'a,
    Traits,
    SemaphoreCb<Traits>,
    impl Fn(
        &'static SemaphoreCb<Traits>,
    ) -> &'static CpuLockCell<Traits, Option<Link<SemaphoreCb<Traits>>>>,
> {
    ListAccessor::new(head, |cb: &'static SemaphoreCb<Traits>| &cb.registry_link)
}

/// A handle to a counting semaphore.
pub struct Semaphore<Traits: KernelTraits>(&'static SemaphoreCb<Traits>);

impl<Traits: KernelTraits> Clone for Semaphore<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: KernelTraits> Copy for Semaphore<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for Semaphore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Semaphore")
            .field(&(self.0 as *const _))
            .finish()
    }
}

impl<Traits: KernelTraits> Semaphore<Traits> {
    pub(crate) fn from_cb(cb: &'static SemaphoreCb<Traits>) -> Self {
        Self(cb)
    }

    /// Initialize a semaphore control block with the given initial count.
    pub fn create(
        cb: &'static SemaphoreCb<Traits>,
        name: &'static str,
        count: SemCount,
    ) -> Semaphore<Traits> {
        create_semaphore(cb, name, count, AllocKind::Static)
    }

    /// Like [`Self::create`], but the control block is allocated from the
    /// kernel heap.
    #[cfg(feature = "dyn_alloc")]
    pub fn create_dyn(
        name: &'static str,
        count: SemCount,
    ) -> Result<Semaphore<Traits>, CreateKobjError> {
        use alloc::boxed::Box;

        let cb = {
            let mut lock = klock::relock_cpu::<Traits>();
            pool_accessor(&Traits::state().sem_pool).pop_front(lock.borrow_mut())
        };
        let cb = match cb {
            Some(cb) => cb,
            None => Box::leak(Box::new(SemaphoreCb::INIT)),
        };

        Ok(create_semaphore(cb, name, count, AllocKind::Dynamic))
    }

    /// Release one permit. If tasks are waiting, the head waiter is woken
    /// instead of the count changing.
    pub fn give(self) -> Result<(), SignalSemaphoreError> {
        self.signal(false)
    }

    /// Release to every waiter: all pending tasks are woken at once. With
    /// no waiters this is identical to [`Self::give`].
    pub fn give_all(self) -> Result<(), SignalSemaphoreError> {
        self.signal(true)
    }

    fn signal(self, wake_all: bool) -> Result<(), SignalSemaphoreError> {
        let mut lock = klock::relock_cpu::<Traits>();
        match signal_locked(lock.borrow_mut(), self.0, wake_all) {
            Ok(true) => {
                sched::critical_exit_sched(lock);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Acquire one permit, waiting up to `timeout` for one to appear.
    pub fn take(self, timeout: Timeout) -> Result<(), WaitSemaphoreError> {
        let cb = self.0;
        let mut lock = klock::lock_cpu::<Traits>()?;
        cb.blk_obj
            .expect_kind(lock.borrow_mut(), ObjKind::Semaphore)?;

        let count = cb.count.get(&*lock);
        if count > 0 {
            cb.count.replace(&mut *lock, count - 1);
            return Ok(());
        }

        if timeout.is_no_wait() {
            return Err(WaitSemaphoreError::WouldBlock);
        }

        sched::expect_no_isr(lock.borrow_mut())?;
        let task = sched::expect_task_context(lock.borrow_mut())?;
        if Traits::state().cpu_current().sched_lock.get(&*lock) > 0 {
            return Err(WaitSemaphoreError::SchedulerLocked);
        }

        wait::pend_to_blk_obj(
            lock.borrow_mut(),
            task,
            BlkSource::Semaphore(cb),
            timeout.deadline_ticks(),
        );

        Traits::trace(trace::Event::SemGetBlk { sem: cb, task });

        sched::critical_exit_sched(lock);

        // The task was rescheduled; report why it woke up
        let mut lock = klock::relock_cpu::<Traits>();
        let reason = wait::pend_end(lock.borrow_mut(), task);
        drop(lock);
        reason.map_err(Into::into)
    }

    /// The current count.
    pub fn count(self) -> Result<SemCount, QueryKobjError> {
        let mut lock = klock::relock_cpu::<Traits>();
        self.0
            .blk_obj
            .expect_kind(lock.borrow_mut(), ObjKind::Semaphore)?;
        Ok(self.0.count.get(&*lock))
    }

    /// The highest count ever observed.
    #[cfg(feature = "system_stats")]
    pub fn peak_count(self) -> Result<SemCount, QueryKobjError> {
        let mut lock = klock::relock_cpu::<Traits>();
        self.0
            .blk_obj
            .expect_kind(lock.borrow_mut(), ObjKind::Semaphore)?;
        Ok(self.0.peak_count.get(&*lock))
    }

    /// Overwrite the count. Refused while tasks are waiting.
    pub fn count_set(self, count: SemCount) -> Result<(), SetSemaphoreError> {
        let cb = self.0;
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_no_isr(lock.borrow_mut())?;
        cb.blk_obj
            .expect_kind(lock.borrow_mut(), ObjKind::Semaphore)?;

        if cb.count.get(&*lock) == 0
            && !cb.blk_obj.pend_list.get(&*lock).is_empty()
        {
            return Err(SetSemaphoreError::TasksWaiting);
        }
        cb.count.replace(&mut *lock, count);

        #[cfg(feature = "system_stats")]
        if count > cb.peak_count.get(&*lock) {
            cb.peak_count.replace(&mut *lock, count);
        }

        Ok(())
    }

    /// Delete the semaphore, waking every waiter with the `Deleted` reason.
    pub fn delete(self) -> Result<(), crate::error::DeleteKobjError> {
        delete_semaphore(self.0, AllocKind::Static)
    }

    /// Delete a dynamically created semaphore and recycle its control
    /// block.
    #[cfg(feature = "dyn_alloc")]
    pub fn delete_dyn(self) -> Result<(), crate::error::DeleteKobjError> {
        delete_semaphore(self.0, AllocKind::Dynamic)?;
        let mut lock = klock::relock_cpu::<Traits>();
        pool_accessor(&Traits::state().sem_pool).push_back(lock.borrow_mut(), self.0);
        Ok(())
    }
}

#[cfg(feature = "dyn_alloc")]
fn pool_accessor<'a, Traits: KernelTraits>(
    head: &'a CpuLockCell<Traits, crate::utils::intrusive_list::ListHead<SemaphoreCb<Traits>>>,
) -> crate::utils::intrusive_list::ListAccessor<
    'a,
    Traits,
    SemaphoreCb<Traits>,
    impl Fn(
        &'static SemaphoreCb<Traits>,
    ) -> &'static CpuLockCell<
        Traits,
        Option<crate::utils::intrusive_list::Link<SemaphoreCb<Traits>>>,
    >,
> {
    crate::utils::intrusive_list::ListAccessor::new(head, |cb: &'static SemaphoreCb<Traits>| {
        &cb.pool_link
    })
}

fn create_semaphore<Traits: KernelTraits>(
    cb: &'static SemaphoreCb<Traits>,
    name: &'static str,
    count: SemCount,
    alloc_kind: AllocKind,
) -> Semaphore<Traits> {
    let mut lock = klock::relock_cpu::<Traits>();

    cb.count.replace(&mut *lock, count);
    #[cfg(feature = "system_stats")]
    cb.peak_count.replace(&mut *lock, count);
    cb.alloc_kind.replace(&mut *lock, alloc_kind);

    #[cfg(feature = "system_stats")]
    registry_accessor(&Traits::state().registry.semaphores).push_back(lock.borrow_mut(), cb);

    cb.blk_obj.init(
        lock.borrow_mut(),
        name,
        ObjKind::Semaphore,
        QueueOrder::TaskPriority,
    );

    Traits::trace(trace::Event::SemCreate { sem: cb });

    Semaphore(cb)
}

fn delete_semaphore<Traits: KernelTraits>(
    cb: &'static SemaphoreCb<Traits>,
    expected_kind: AllocKind,
) -> Result<(), crate::error::DeleteKobjError> {
    use crate::error::DeleteKobjError;

    let mut lock = klock::lock_cpu::<Traits>()?;
    sched::expect_no_isr(lock.borrow_mut())?;
    cb.blk_obj
        .expect_kind(lock.borrow_mut(), ObjKind::Semaphore)?;

    if cb.alloc_kind.get(&*lock) != expected_kind {
        return Err(DeleteKobjError::BadKind);
    }

    cb.blk_obj.kind.replace(&mut *lock, ObjKind::None);

    wait::wake_all_pending(lock.borrow_mut(), &cb.blk_obj, WakeReason::Deleted);

    #[cfg(feature = "system_stats")]
    registry_accessor(&Traits::state().registry.semaphores).remove(lock.borrow_mut(), cb);

    Traits::trace(trace::Event::SemDel { sem: cb });

    sched::critical_exit_sched(lock);
    Ok(())
}

/// The lock-held half of `give`/`give_all`, shared with the task-deletion
/// path (which signals the reaper under a scheduler lock). Returns whether
/// at least one waiter was woken, in which case the caller must reschedule.
pub(crate) fn signal_locked<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    cb: &'static SemaphoreCb<Traits>,
    wake_all: bool,
) -> Result<bool, SignalSemaphoreError> {
    cb.blk_obj
        .expect_kind(lock.borrow_mut(), ObjKind::Semaphore)?;

    if cb.blk_obj.pend_list.get(&*lock).is_empty() {
        let count = cb.count.get(&*lock);
        if count == SemCount::MAX {
            return Err(SignalSemaphoreError::Overflow);
        }
        cb.count.replace(&mut *lock, count + 1);

        #[cfg(feature = "system_stats")]
        if count + 1 > cb.peak_count.get(&*lock) {
            cb.peak_count.replace(&mut *lock, count + 1);
        }

        Traits::trace(trace::Event::SemGive { sem: cb });
        return Ok(false);
    }

    if wake_all {
        wait::wake_all_pending(lock.borrow_mut(), &cb.blk_obj, WakeReason::Finish);
    } else {
        let front = wait::pend_list_front(lock.borrow_mut(), &cb.blk_obj)
            .expect("non-empty pend list without a head");
        wait::wake_task(lock.borrow_mut(), front, WakeReason::Finish);
    }

    Traits::trace(trace::Event::SemGive { sem: cb });
    Ok(true)
}

#[cfg(test)]
mod tests {
    /// `give` then `take` with the count starting at zero returns `Ok` and
    /// leaves the count at zero; giving at the saturation point fails.
    mod give_take_laws {
        use crate::error::{SignalSemaphoreError, WaitSemaphoreError};
        use crate::semaphore::{SemCount, Semaphore, SemaphoreCb};
        use crate::task::{Task, TaskCb, TaskOptions, TaskStack};
        use crate::test_utils::kick;
        use crate::utils::Init;
        use crate::Timeout;

        mock_kernel!(struct K, cpus: 1);

        static T_CB: TaskCb<K> = Init::INIT;
        static T_STACK: TaskStack<64> = TaskStack::new();
        static SEM_CB: SemaphoreCb<K> = Init::INIT;

        fn body(_: usize) {}

        #[test]
        fn scenario() {
            Task::create(&T_CB, "T", body, 0, 3, 0, &T_STACK, TaskOptions::AUTO_START, None)
                .unwrap();
            let sem = Semaphore::create(&SEM_CB, "s", 0);
            kick::<K>();

            sem.give().unwrap();
            assert_eq!(sem.count().unwrap(), 1);
            assert_eq!(sem.take(Timeout::Forever), Ok(()));
            assert_eq!(sem.count().unwrap(), 0);

            assert_eq!(
                sem.take(Timeout::NoWait),
                Err(WaitSemaphoreError::WouldBlock)
            );

            sem.count_set(SemCount::MAX).unwrap();
            assert_eq!(sem.give(), Err(SignalSemaphoreError::Overflow));
        }
    }

    /// `count_set` refuses while tasks are waiting.
    mod count_set_with_waiters {
        use crate::error::SetSemaphoreError;
        use crate::klock;
        use crate::sched;
        use crate::semaphore::{Semaphore, SemaphoreCb};
        use crate::task::{Task, TaskCb, TaskOptions, TaskState, TaskStack};
        use crate::test_utils::kick;
        use crate::utils::Init;
        use crate::wait::{self, BlkSource};

        mock_kernel!(struct K, cpus: 1);

        static T1_CB: TaskCb<K> = Init::INIT;
        static T1_STACK: TaskStack<64> = TaskStack::new();
        static T2_CB: TaskCb<K> = Init::INIT;
        static T2_STACK: TaskStack<64> = TaskStack::new();
        static SEM_CB: SemaphoreCb<K> = Init::INIT;

        fn body(_: usize) {}

        #[test]
        fn scenario() {
            Task::create(&T1_CB, "T1", body, 0, 3, 0, &T1_STACK, TaskOptions::AUTO_START, None)
                .unwrap();
            Task::create(&T2_CB, "T2", body, 0, 4, 0, &T2_STACK, TaskOptions::AUTO_START, None)
                .unwrap();
            let sem = Semaphore::create(&SEM_CB, "s", 0);
            kick::<K>();

            {
                let mut lock = klock::lock_cpu::<K>().unwrap();
                wait::pend_to_blk_obj(
                    lock.borrow_mut(),
                    &T2_CB,
                    BlkSource::Semaphore(&SEM_CB),
                    None,
                );
                sched::critical_exit_sched(lock);
            }

            assert_eq!(sem.count_set(3), Err(SetSemaphoreError::TasksWaiting));

            // A give hands the permit straight to the waiter
            sem.give().unwrap();
            let lock = klock::relock_cpu::<K>();
            assert_eq!(T2_CB.state.get(&*lock), TaskState::Ready);
            assert_eq!(SEM_CB.count.get(&*lock), 0);
        }
    }
}
