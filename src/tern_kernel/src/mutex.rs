//! Mutexes with priority inheritance
//!
//! Each task keeps an intrusive stack of the mutexes it holds
//! (`TaskCb::mutex_list`, linked through `MutexCb::next_owned`). A holder's
//! effective priority is never allowed to drop below the best head waiter
//! across that stack; the inheritance walk in
//! [`task_pri_change`](crate::task::task_pri_change) follows
//! `waiter → mutex → holder` chains so that nested blocking propagates a
//! priority raise all the way down.
use core::fmt;

use crate::error::{DeleteKobjError, LockMutexError, UnlockMutexError};
use crate::klock::{self, CpuLockCell, CpuLockTokenRefMut};
use crate::obj::{AllocKind, BlockObj, ObjKind, QueueOrder};
use crate::sched;
use crate::task::{self, task_pri_change, Priority, TaskCb, WakeReason};
use crate::trace;
use crate::utils::Init;
use crate::wait::{self, BlkSource};
use crate::{KernelTraits, ResultCode, Timeout};

#[cfg(feature = "system_stats")]
use crate::utils::intrusive_list::ListAccessor;
#[cfg(any(feature = "system_stats", feature = "dyn_alloc"))]
use crate::utils::intrusive_list::{Link, ListHead};

/// The nesting counter type for recursive acquisition by the owner.
pub type MutexNested = u32;

/// *Mutex control block* - the state data of a mutex.
pub struct MutexCb<Traits: KernelTraits> {
    pub(crate) blk_obj: BlockObj<Traits>,

    /// The task that currently owns the mutex lock.
    pub(crate) holder: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,

    /// How many times the holder has acquired the mutex without releasing.
    pub(crate) owner_nested: CpuLockCell<Traits, MutexNested>,

    /// The next element in the singly-linked stack headed by
    /// `TaskCb::mutex_list`, containing all mutexes currently held by the
    /// holder.
    pub(crate) next_owned: CpuLockCell<Traits, Option<&'static MutexCb<Traits>>>,

    pub(crate) alloc_kind: CpuLockCell<Traits, AllocKind>,

    #[cfg(feature = "system_stats")]
    pub(crate) registry_link: CpuLockCell<Traits, Option<Link<MutexCb<Traits>>>>,

    #[cfg(feature = "dyn_alloc")]
    pub(crate) pool_link: CpuLockCell<Traits, Option<Link<MutexCb<Traits>>>>,
}

impl<Traits: KernelTraits> Init for MutexCb<Traits> {
    const INIT: Self = Self {
        blk_obj: Init::INIT,
        holder: Init::INIT,
        owner_nested: Init::INIT,
        next_owned: Init::INIT,
        alloc_kind: Init::INIT,
        #[cfg(feature = "system_stats")]
        registry_link: Init::INIT,
        #[cfg(feature = "dyn_alloc")]
        pool_link: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("owner_nested", &self.owner_nested)
            .field(
                "holder",
                // break infinite recursion (TaskCb → MutexCb → TaskCb → ...)
                &self
                    .holder
                    .debug_fmt_with_ref(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .finish_non_exhaustive()
    }
}

/// Distinguishes a fresh acquisition from a recursive one by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexLockScope {
    /// The caller became the holder.
    Acquired,
    /// The caller already held the mutex; the nesting counter was bumped.
    Nested,
}

/// Distinguishes a final release from unwinding one nesting level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexUnlockScope {
    /// Ownership was released (possibly transferred to the next waiter).
    Released,
    /// The caller still owns the mutex; only the nesting counter dropped.
    StillOwned,
}

/// A handle to a mutex.
pub struct Mutex<Traits: KernelTraits>(&'static MutexCb<Traits>);

impl<Traits: KernelTraits> Clone for Mutex<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: KernelTraits> Copy for Mutex<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Mutex").field(&(self.0 as *const _)).finish()
    }
}

#[cfg(feature = "system_stats")]
fn registry_accessor<'a, Traits: KernelTraits>(
    head: &'a CpuLockCell<Traits, ListHead<MutexCb<Traits>>>,
) -> ListAccessor<
    'a,
    Traits,
    MutexCb<Traits>,
    impl Fn(&'static MutexCb<Traits>) -> &'static CpuLockCell<Traits, Option<Link<MutexCb<Traits>>>>,
> {
    ListAccessor::new(head, |cb: &'static MutexCb<Traits>| &cb.registry_link)
}

#[cfg(feature = "dyn_alloc")]
fn pool_accessor<'a, Traits: KernelTraits>(
    head: &'a CpuLockCell<Traits, ListHead<MutexCb<Traits>>>,
) -> crate::utils::intrusive_list::ListAccessor<
    'a,
    Traits,
    MutexCb<Traits>,
    impl Fn(&'static MutexCb<Traits>) -> &'static CpuLockCell<Traits, Option<Link<MutexCb<Traits>>>>,
> {
    crate::utils::intrusive_list::ListAccessor::new(head, |cb: &'static MutexCb<Traits>| {
        &cb.pool_link
    })
}

impl<Traits: KernelTraits> Mutex<Traits> {
    /// Initialize a mutex control block.
    pub fn create(cb: &'static MutexCb<Traits>, name: &'static str) -> Mutex<Traits> {
        create_mutex(cb, name, AllocKind::Static)
    }

    /// Like [`Self::create`], but the control block is allocated from the
    /// kernel heap.
    #[cfg(feature = "dyn_alloc")]
    pub fn create_dyn(name: &'static str) -> Result<Mutex<Traits>, crate::error::CreateKobjError> {
        use alloc::boxed::Box;

        let cb = {
            let mut lock = klock::relock_cpu::<Traits>();
            pool_accessor(&Traits::state().mutex_pool).pop_front(lock.borrow_mut())
        };
        let cb = match cb {
            Some(cb) => cb,
            None => Box::leak(Box::new(MutexCb::INIT)),
        };

        Ok(create_mutex(cb, name, AllocKind::Dynamic))
    }

    /// Acquire the mutex, waiting up to `timeout` while another task holds
    /// it.
    ///
    /// If the caller outranks the holder, the holder inherits the caller's
    /// priority for the duration of the wait; the raise propagates through
    /// the holder's own pending waits.
    pub fn lock(self, timeout: Timeout) -> Result<MutexLockScope, LockMutexError> {
        let cb = self.0;
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_no_isr(lock.borrow_mut())?;
        cb.blk_obj.expect_kind(lock.borrow_mut(), ObjKind::Mutex)?;
        let cur = sched::expect_task_context(lock.borrow_mut())?;

        let holder = cb.holder.get(&*lock);

        // Re-acquisition by the owner bumps the nesting counter
        if task::ptr_eq_opt(holder, Some(cur)) {
            let nested = cb.owner_nested.get(&*lock);
            if nested == MutexNested::MAX {
                drop(lock);
                Traits::fatal_error(ResultCode::NestingOverflow);
            }
            cb.owner_nested.replace(&mut *lock, nested + 1);
            return Ok(MutexLockScope::Nested);
        }

        let Some(holder) = holder else {
            // Unheld: take ownership and push the mutex on the caller's
            // owned stack
            cb.holder.replace(&mut *lock, Some(cur));
            let cur_next_owned = cur.mutex_list.get(&*lock);
            cb.next_owned.replace(&mut *lock, cur_next_owned);
            cur.mutex_list.replace(&mut *lock, Some(cb));
            cb.owner_nested.replace(&mut *lock, 1);

            Traits::trace(trace::Event::MutexGet {
                mutex: cb,
                task: cur,
            });
            return Ok(MutexLockScope::Acquired);
        };

        if timeout.is_no_wait() {
            return Err(LockMutexError::WouldBlock);
        }

        if Traits::state().cpu_current().sched_lock.get(&*lock) > 0 {
            return Err(LockMutexError::SchedulerLocked);
        }

        // Priority inversion: raise the holder to the caller's priority.
        // If the holder is itself pending on another mutex, the raise
        // propagates along the chain inside `task_pri_change`.
        if cur.prio.get(&*lock).is_higher_than(holder.prio.get(&*lock)) {
            let raised = cur.prio.get(&*lock);
            task_pri_change(lock.borrow_mut(), holder, raised);

            Traits::trace(trace::Event::PriInvert {
                task: cur,
                holder,
            });
        }

        wait::pend_to_blk_obj(
            lock.borrow_mut(),
            cur,
            BlkSource::Mutex(cb),
            timeout.deadline_ticks(),
        );

        Traits::trace(trace::Event::MutexGetBlk {
            mutex: cb,
            task: cur,
        });

        sched::critical_exit_sched(lock);

        // The task was rescheduled; on a successful wake the releaser has
        // already transferred ownership to us
        let mut lock = klock::relock_cpu::<Traits>();
        let reason = wait::pend_end(lock.borrow_mut(), cur);
        drop(lock);

        match reason {
            Ok(()) => Ok(MutexLockScope::Acquired),
            Err(e) => Err(e.into()),
        }
    }

    /// Release the mutex. Must be called by the holder.
    ///
    /// The final release restores the caller's inherited priority and hands
    /// ownership to the head waiter, if any.
    pub fn unlock(self) -> Result<MutexUnlockScope, UnlockMutexError> {
        let cb = self.0;
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_no_isr(lock.borrow_mut())?;
        cb.blk_obj.expect_kind(lock.borrow_mut(), ObjKind::Mutex)?;
        let cur = sched::expect_task_context(lock.borrow_mut())?;

        if !task::ptr_eq_opt(cb.holder.get(&*lock), Some(cur)) {
            return Err(UnlockMutexError::NotOwner);
        }

        let nested = cb.owner_nested.get(&*lock) - 1;
        cb.owner_nested.replace(&mut *lock, nested);
        if nested > 0 {
            return Ok(MutexUnlockScope::StillOwned);
        }

        // Pop the mutex from the owned stack and drop back to the best
        // priority the remaining stack allows. Demotion re-queues the task
        // at the tail of its new level, preserving fairness there.
        release_and_restore(lock.borrow_mut(), cur, cb);

        let Some(front) = wait::pend_list_front(lock.borrow_mut(), &cb.blk_obj) else {
            cb.holder.replace(&mut *lock, None);

            Traits::trace(trace::Event::MutexRelease {
                mutex: cb,
                task: cur,
            });
            return Ok(MutexUnlockScope::Released);
        };

        // Transfer ownership to the head waiter and wake it
        wait::wake_task(lock.borrow_mut(), front, WakeReason::Finish);
        cb.holder.replace(&mut *lock, Some(front));
        let front_next_owned = front.mutex_list.get(&*lock);
        cb.next_owned.replace(&mut *lock, front_next_owned);
        front.mutex_list.replace(&mut *lock, Some(cb));
        cb.owner_nested.replace(&mut *lock, 1);

        Traits::trace(trace::Event::MutexRelease {
            mutex: cb,
            task: cur,
        });

        sched::critical_exit_sched(lock);
        Ok(MutexUnlockScope::Released)
    }

    /// Delete the mutex, waking every waiter with the `Deleted` reason. If
    /// held, the outgoing holder's priority is restored.
    pub fn delete(self) -> Result<(), DeleteKobjError> {
        delete_mutex(self.0, AllocKind::Static)
    }

    /// Delete a dynamically created mutex and recycle its control block.
    #[cfg(feature = "dyn_alloc")]
    pub fn delete_dyn(self) -> Result<(), DeleteKobjError> {
        delete_mutex(self.0, AllocKind::Dynamic)?;
        let mut lock = klock::relock_cpu::<Traits>();
        pool_accessor(&Traits::state().mutex_pool).push_back(lock.borrow_mut(), self.0);
        Ok(())
    }
}

fn create_mutex<Traits: KernelTraits>(
    cb: &'static MutexCb<Traits>,
    name: &'static str,
    alloc_kind: AllocKind,
) -> Mutex<Traits> {
    let mut lock = klock::relock_cpu::<Traits>();

    cb.holder.replace(&mut *lock, None);
    cb.owner_nested.replace(&mut *lock, 0);
    cb.next_owned.replace(&mut *lock, None);
    cb.alloc_kind.replace(&mut *lock, alloc_kind);

    #[cfg(feature = "system_stats")]
    registry_accessor(&Traits::state().registry.mutexes).push_back(lock.borrow_mut(), cb);

    cb.blk_obj.init(
        lock.borrow_mut(),
        name,
        ObjKind::Mutex,
        QueueOrder::TaskPriority,
    );

    Traits::trace(trace::Event::MutexCreate { mutex: cb });

    Mutex(cb)
}

fn delete_mutex<Traits: KernelTraits>(
    cb: &'static MutexCb<Traits>,
    expected_kind: AllocKind,
) -> Result<(), DeleteKobjError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    sched::expect_no_isr(lock.borrow_mut())?;
    cb.blk_obj.expect_kind(lock.borrow_mut(), ObjKind::Mutex)?;

    if cb.alloc_kind.get(&*lock) != expected_kind {
        return Err(DeleteKobjError::BadKind);
    }

    cb.blk_obj.kind.replace(&mut *lock, ObjKind::None);

    // Restore the holder's priority as a final release would
    if let Some(holder) = cb.holder.get(&*lock) {
        release_and_restore(lock.borrow_mut(), holder, cb);
        cb.holder.replace(&mut *lock, None);
        cb.owner_nested.replace(&mut *lock, 0);
    }

    wait::wake_all_pending(lock.borrow_mut(), &cb.blk_obj, WakeReason::Deleted);

    #[cfg(feature = "system_stats")]
    registry_accessor(&Traits::state().registry.mutexes).remove(lock.borrow_mut(), cb);

    Traits::trace(trace::Event::MutexDel { mutex: cb });

    sched::critical_exit_sched(lock);
    Ok(())
}

/// Pop `released` from `task`'s owned stack and reapply the best priority
/// the remaining stack allows.
fn release_and_restore<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    released: &'static MutexCb<Traits>,
) {
    let new_pri = mutex_pri_look(lock.borrow_mut(), task, Some(released));
    if new_pri != task.prio.get(&*lock) {
        task_pri_change(lock.borrow_mut(), task, new_pri);
    }
}

/// The lowest priority `task` may be assigned without dropping below a
/// waiter on one of its held mutexes. Used by `set_priority`.
pub(crate) fn mutex_pri_limit<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    pri: Priority,
) -> Priority {
    let mut high = pri;
    let mut cursor = task.mutex_list.get(&*lock);
    while let Some(mutex) = cursor {
        if let Some(front) = wait::pend_list_front(lock.borrow_mut(), &mutex.blk_obj) {
            high = high.highest_of(front.prio.get(&*lock));
        }
        cursor = mutex.next_owned.get(&*lock);
    }
    high
}

/// Compute the priority `task` should run at: the best of its base priority
/// and the head waiters of every mutex it holds. `released`, if given, is
/// unlinked from the owned stack as a side effect and excluded from the
/// computation; `None` means "recompute without changing ownership".
pub(crate) fn mutex_pri_look<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    released: Option<&'static MutexCb<Traits>>,
) -> Priority {
    let mut new_pri = task.base_prio.get(&*lock);

    let mut prev: Option<&'static MutexCb<Traits>> = None;
    let mut cursor = task.mutex_list.get(&*lock);
    while let Some(mutex) = cursor {
        let next = mutex.next_owned.get(&*lock);

        if released.map_or(false, |r| core::ptr::eq(mutex, r)) {
            // Unlink the released mutex from the owned stack
            match prev {
                None => task.mutex_list.replace(&mut *lock, next),
                Some(prev) => prev.next_owned.replace(&mut *lock, next),
            };
            mutex.next_owned.replace(&mut *lock, None);
            cursor = next;
            continue;
        }

        if let Some(front) = wait::pend_list_front(lock.borrow_mut(), &mutex.blk_obj) {
            new_pri = new_pri.highest_of(front.prio.get(&*lock));
        }

        prev = Some(mutex);
        cursor = next;
    }

    new_pri
}

/// A waiter left `mutex`'s pend list for a reason other than acquiring it
/// (timeout, abort, or task deletion). If that waiter defined the holder's
/// inherited priority, recompute it.
pub(crate) fn pend_removed_pri_reset<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    mutex: &'static MutexCb<Traits>,
    removed: &'static TaskCb<Traits>,
) {
    let Some(holder) = mutex.holder.get(&*lock) else { return };

    if holder.prio.get(&*lock) == removed.prio.get(&*lock) {
        let new_pri = mutex_pri_look(lock.borrow_mut(), holder, None);
        if new_pri != holder.prio.get(&*lock) {
            task_pri_change(lock.borrow_mut(), holder, new_pri);
        }
    }
}

/// Hand every mutex held by a dying task to its next waiter (or mark it
/// unheld). The dying task's own priority is left alone.
pub(crate) fn release_all_held<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    let mut cursor = task.mutex_list.replace(&mut *lock, None);
    while let Some(mutex) = cursor {
        cursor = mutex.next_owned.get(&*lock);
        mutex.next_owned.replace(&mut *lock, None);

        if let Some(front) = wait::pend_list_front(lock.borrow_mut(), &mutex.blk_obj) {
            wait::wake_task(lock.borrow_mut(), front, WakeReason::Finish);
            mutex.holder.replace(&mut *lock, Some(front));
            let front_next_owned = front.mutex_list.get(&*lock);
            mutex.next_owned.replace(&mut *lock, front_next_owned);
            front.mutex_list.replace(&mut *lock, Some(mutex));
            mutex.owner_nested.replace(&mut *lock, 1);
        } else {
            mutex.holder.replace(&mut *lock, None);
            mutex.owner_nested.replace(&mut *lock, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    /// `lock` then `unlock` with no contention restores the caller's
    /// priority and leaves its owned stack empty; re-acquisition nests.
    mod uncontended_laws {
        use crate::klock;
        use crate::mutex::{Mutex, MutexCb, MutexLockScope, MutexUnlockScope};
        use crate::task::{Task, TaskCb, TaskOptions, TaskStack};
        use crate::test_utils::kick;
        use crate::utils::Init;
        use crate::Timeout;

        mock_kernel!(struct K, cpus: 1);

        static T_CB: TaskCb<K> = Init::INIT;
        static T_STACK: TaskStack<64> = TaskStack::new();
        static X_CB: MutexCb<K> = Init::INIT;

        fn body(_: usize) {}

        #[test]
        fn scenario() {
            Task::create(&T_CB, "T", body, 0, 5, 0, &T_STACK, TaskOptions::AUTO_START, None)
                .unwrap();
            let x = Mutex::create(&X_CB, "X");
            kick::<K>();

            assert_eq!(x.lock(Timeout::Forever), Ok(MutexLockScope::Acquired));
            {
                let lock = klock::relock_cpu::<K>();
                assert!(crate::task::ptr_eq_opt(
                    T_CB.mutex_list.get(&*lock).map(|m| m as &MutexCb<K>),
                    Some(&X_CB),
                ));
            }

            assert_eq!(x.lock(Timeout::Forever), Ok(MutexLockScope::Nested));
            assert_eq!(x.unlock(), Ok(MutexUnlockScope::StillOwned));
            assert_eq!(x.unlock(), Ok(MutexUnlockScope::Released));

            let lock = klock::relock_cpu::<K>();
            assert!(T_CB.mutex_list.get(&*lock).is_none());
            assert!(X_CB.holder.get(&*lock).is_none());
            assert_eq!(T_CB.prio.get(&*lock), T_CB.base_prio.get(&*lock));
        }
    }

    /// Only the holder may release (`NotOwner` otherwise), and a try-lock
    /// on a held mutex reports `WouldBlock`.
    mod ownership_checks {
        use crate::error::LockMutexError;
        use crate::mutex::{Mutex, MutexCb};
        use crate::task::{Task, TaskCb, TaskOptions, TaskStack};
        use crate::test_utils::{kick, set_active};
        use crate::utils::Init;
        use crate::Timeout;

        mock_kernel!(struct K, cpus: 1);

        static T1_CB: TaskCb<K> = Init::INIT;
        static T1_STACK: TaskStack<64> = TaskStack::new();
        static T2_CB: TaskCb<K> = Init::INIT;
        static T2_STACK: TaskStack<64> = TaskStack::new();
        static X_CB: MutexCb<K> = Init::INIT;

        fn body(_: usize) {}

        #[test]
        fn scenario() {
            Task::create(&T1_CB, "T1", body, 0, 5, 0, &T1_STACK, TaskOptions::AUTO_START, None)
                .unwrap();
            Task::create(&T2_CB, "T2", body, 0, 6, 0, &T2_STACK, TaskOptions::AUTO_START, None)
                .unwrap();
            let x = Mutex::create(&X_CB, "X");
            kick::<K>();

            set_active::<K>(0, Some(&T1_CB));
            x.lock(Timeout::Forever).unwrap();

            set_active::<K>(0, Some(&T2_CB));
            assert_eq!(
                x.unlock(),
                Err(crate::error::UnlockMutexError::NotOwner)
            );
            assert_eq!(x.lock(Timeout::NoWait), Err(LockMutexError::WouldBlock));
        }
    }

    /// Chained inheritance: C's priority propagates through B (pending on
    /// X) to A, and removing C's wait unwinds the chain.
    mod inheritance_chain {
        use crate::klock;
        use crate::mutex::{Mutex, MutexCb};
        use crate::task::{task_pri_change, Priority, Task, TaskCb, TaskOptions, TaskStack};
        use crate::test_utils::kick;
        use crate::utils::Init;
        use crate::wait::{self, BlkSource};

        mock_kernel!(struct K, cpus: 1);

        static A_CB: TaskCb<K> = Init::INIT;
        static A_STACK: TaskStack<64> = TaskStack::new();
        static B_CB: TaskCb<K> = Init::INIT;
        static B_STACK: TaskStack<64> = TaskStack::new();
        static C_CB: TaskCb<K> = Init::INIT;
        static C_STACK: TaskStack<64> = TaskStack::new();
        static X_CB: MutexCb<K> = Init::INIT;
        static Y_CB: MutexCb<K> = Init::INIT;

        fn body(_: usize) {}

        #[test]
        fn scenario() {
            Task::create(&A_CB, "A", body, 0, 13, 0, &A_STACK, TaskOptions::AUTO_START, None)
                .unwrap();
            Task::create(&B_CB, "B", body, 0, 11, 0, &B_STACK, TaskOptions::AUTO_START, None)
                .unwrap();
            Task::create(&C_CB, "C", body, 0, 2, 0, &C_STACK, TaskOptions::AUTO_START, None)
                .unwrap();
            Mutex::create(&X_CB, "X");
            Mutex::create(&Y_CB, "Y");
            kick::<K>();

            let c = Task::from_cb(&C_CB);

            {
                let mut lock = klock::relock_cpu::<K>();

                // A holds X, B holds Y
                X_CB.holder.replace(&mut *lock, Some(&A_CB));
                X_CB.owner_nested.replace(&mut *lock, 1);
                A_CB.mutex_list.replace(&mut *lock, Some(&X_CB));
                Y_CB.holder.replace(&mut *lock, Some(&B_CB));
                Y_CB.owner_nested.replace(&mut *lock, 1);
                B_CB.mutex_list.replace(&mut *lock, Some(&Y_CB));

                // B blocks on X, raising A to B's priority
                task_pri_change(lock.borrow_mut(), &A_CB, Priority::new(11));
                wait::pend_to_blk_obj(
                    lock.borrow_mut(),
                    &B_CB,
                    BlkSource::Mutex(&X_CB),
                    None,
                );

                // C blocks on Y; the raise must walk B's own wait to A
                task_pri_change(lock.borrow_mut(), &B_CB, Priority::new(2));
                wait::pend_to_blk_obj(
                    lock.borrow_mut(),
                    &C_CB,
                    BlkSource::Mutex(&Y_CB),
                    None,
                );

                assert_eq!(A_CB.prio.get(&*lock), Priority::new(2));
                assert_eq!(B_CB.prio.get(&*lock), Priority::new(2));
            }

            // Aborting C's wait unwinds the whole chain to B's base
            c.wait_abort().unwrap();

            let lock = klock::relock_cpu::<K>();
            assert_eq!(B_CB.prio.get(&*lock), Priority::new(11));
            assert_eq!(A_CB.prio.get(&*lock), Priority::new(11));
            assert_eq!(A_CB.base_prio.get(&*lock), Priority::new(13));
        }
    }
}
