//! The tick counter and the timeout list.
//!
//! One global list holds every task with an armed deadline, sorted by
//! absolute expiry tick. Insertion is O(n) — the list is short in practice —
//! and removal is O(1) through the task's embedded link.
use crate::klock::{CpuLockCell, CpuLockTokenRefMut};
use crate::task::{TaskCb, WakeReason};
use crate::utils::intrusive_list::{Link, ListAccessor, ListHead};
use crate::utils::Init;
use crate::wait;
use crate::{trace, KernelTraits, Tick};

/// Expiry comparisons are done relative to the current tick so that the
/// counter may wrap.
pub(crate) const HALF_RANGE: Tick = 1 << (Tick::BITS - 1);

pub(crate) struct TickGlobals<Traits: KernelTraits> {
    pub(crate) count: CpuLockCell<Traits, Tick>,
    pub(crate) list: CpuLockCell<Traits, ListHead<TaskCb<Traits>>>,
}

impl<Traits: KernelTraits> Init for TickGlobals<Traits> {
    const INIT: Self = Self {
        count: Init::INIT,
        list: CpuLockCell::new(ListHead::INIT),
    };
}

fn tick_list<Traits: KernelTraits>(
) -> ListAccessor<
    'static,
    Traits,
    TaskCb<Traits>,
    impl Fn(&'static TaskCb<Traits>) -> &'static CpuLockCell<Traits, Option<Link<TaskCb<Traits>>>>,
> {
    ListAccessor::new(&Traits::state().tick.list, |task: &'static TaskCb<Traits>| {
        &task.tick_link
    })
}

/// Arm a deadline `ticks` from now and insert the task into the timeout
/// list, keeping it sorted by expiry.
pub(crate) fn tick_list_insert<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    ticks: Tick,
) {
    let count = Traits::state().tick.count.get(&*lock);
    let match_at = count.wrapping_add(ticks);
    task.tick_match.replace(&mut *lock, match_at);

    let list = tick_list::<Traits>();
    let mut anchor = None;
    let mut cursor = list.front(lock.borrow_mut());
    while let Some(entry) = cursor {
        if entry.tick_match.get(&*lock).wrapping_sub(count) > ticks {
            anchor = Some(entry);
            break;
        }
        cursor = list.next(lock.borrow_mut(), entry);
    }
    list.insert_before(lock, task, anchor);
}

/// Disarm the task's deadline if one is armed.
pub(crate) fn tick_list_rm<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    if task.tick_link.get(&*lock).is_some() {
        tick_list::<Traits>().remove(lock, task);
    }
}

/// Advance the tick counter by one and wake every task whose deadline has
/// been reached.
pub(crate) fn tick_proc<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let globals = &Traits::state().tick;
    let count = globals.count.get(&*lock).wrapping_add(1);
    globals.count.replace(&mut *lock, count);

    Traits::trace(trace::Event::Tick { count });

    let list = tick_list::<Traits>();
    while let Some(front) = list.front(lock.borrow_mut()) {
        let remaining = front.tick_match.get(&*lock).wrapping_sub(count);
        if remaining != 0 && remaining < HALF_RANGE {
            break;
        }

        // The wakeup primitive unlinks the task from the timeout list (and
        // its pend list, restoring inheritance for a mutex waiter)
        wait::wake_task(lock.borrow_mut(), front, WakeReason::Timeout);
    }
}

#[cfg(test)]
mod tests {
    /// A pend armed with a five-tick deadline at tick 100 expires exactly
    /// at tick 105: the task leaves both the pend list and the timeout
    /// list and reports `Timeout`.
    mod pend_deadline_expires {
        use crate::error::WakeError;
        use crate::klock;
        use crate::sched;
        use crate::semaphore::{Semaphore, SemaphoreCb};
        use crate::task::readyqueue::Queue as _;
        use crate::task::{Task, TaskCb, TaskOptions, TaskState, TaskStack};
        use crate::test_utils::kick;
        use crate::utils::Init;
        use crate::wait::{self, BlkSource};
        use crate::{KernelCfg, PortToKernel};

        mock_kernel!(struct K, cpus: 1);

        static T_CB: TaskCb<K> = Init::INIT;
        static T_STACK: TaskStack<64> = TaskStack::new();
        static SEM_CB: SemaphoreCb<K> = Init::INIT;

        fn body(_: usize) {}

        #[test]
        fn scenario() {
            Task::create(&T_CB, "T", body, 0, 3, 0, &T_STACK, TaskOptions::AUTO_START, None)
                .unwrap();
            Semaphore::create(&SEM_CB, "s", 0);
            kick::<K>();

            for _ in 0..100 {
                // Safety: the mock port delivers ticks inline
                unsafe { K::timer_tick() };
            }

            {
                let mut lock = klock::lock_cpu::<K>().unwrap();
                assert_eq!(K::state().tick.count.get(&*lock), 100);
                wait::pend_to_blk_obj(
                    lock.borrow_mut(),
                    &T_CB,
                    BlkSource::Semaphore(&SEM_CB),
                    Some(5),
                );
                sched::critical_exit_sched(lock);
            }

            for now in 101..105 {
                unsafe { K::timer_tick() };
                let lock = klock::relock_cpu::<K>();
                assert_eq!(K::state().tick.count.get(&*lock), now);
                assert_eq!(T_CB.state.get(&*lock), TaskState::Pend);
            }

            unsafe { K::timer_tick() };

            let mut lock = klock::relock_cpu::<K>();
            assert_eq!(T_CB.state.get(&*lock), TaskState::Ready);
            assert!(T_CB.tick_link.get(&*lock).is_none());
            assert!(T_CB.blk_on.get(&*lock).is_none());
            assert!(SEM_CB.blk_obj.pend_list.get(&*lock).is_empty());
            assert_eq!(
                wait::pend_end(lock.borrow_mut(), &T_CB),
                Err(WakeError::Timeout)
            );
            // The task went back to the ready queue, nowhere else
            let prio = T_CB.prio.get(&*lock);
            assert!(crate::task::ptr_eq_opt(
                K::state().ready_queue.front_of(lock.borrow_mut(), prio),
                Some(&T_CB),
            ));
        }
    }

    /// The timeout list is kept sorted by expiry, FIFO among equal
    /// deadlines, and removal keeps it sorted.
    mod tick_list_stays_sorted {
        use crate::klock;
        use crate::task::{Task, TaskCb, TaskOptions, TaskStack};
        use crate::tick::{tick_list, tick_list_insert, tick_list_rm};
        use crate::utils::Init;

        mock_kernel!(struct K, cpus: 1);

        static S2_CB: TaskCb<K> = Init::INIT;
        static S2_STACK: TaskStack<64> = TaskStack::new();
        static S3_CB: TaskCb<K> = Init::INIT;
        static S3_STACK: TaskStack<64> = TaskStack::new();
        static S4_CB: TaskCb<K> = Init::INIT;
        static S4_STACK: TaskStack<64> = TaskStack::new();

        fn body(_: usize) {}

        #[test]
        fn scenario() {
            Task::create(&S2_CB, "S2", body, 0, 4, 0, &S2_STACK, TaskOptions::AUTO_START, None)
                .unwrap();
            Task::create(&S3_CB, "S3", body, 0, 4, 0, &S3_STACK, TaskOptions::AUTO_START, None)
                .unwrap();
            Task::create(&S4_CB, "S4", body, 0, 4, 0, &S4_STACK, TaskOptions::AUTO_START, None)
                .unwrap();

            let mut lock = klock::lock_cpu::<K>().unwrap();
            tick_list_insert(lock.borrow_mut(), &S2_CB, 5);
            tick_list_insert(lock.borrow_mut(), &S3_CB, 1);
            tick_list_insert(lock.borrow_mut(), &S4_CB, 5);

            let list = tick_list::<K>();
            let mut prev = 0;
            let mut order = Vec::new();
            let mut cursor = list.front(lock.borrow_mut());
            while let Some(entry) = cursor {
                let match_at = entry.tick_match.get(&*lock);
                assert!(match_at >= prev, "timeout list out of order");
                prev = match_at;
                // Safety: entries were created above
                order.push(unsafe { entry.attr() }.name);
                cursor = list.next(lock.borrow_mut(), entry);
            }
            // FIFO among the equal deadlines: S2 was inserted before S4
            assert_eq!(order, ["S3", "S2", "S4"]);

            tick_list_rm(lock.borrow_mut(), &S2_CB);
            assert!(S2_CB.tick_link.get(&*lock).is_none());
            assert_eq!(
                list.front(lock.borrow_mut())
                    .map(|t| t.tick_match.get(&*lock)),
                Some(1)
            );
        }
    }
}
