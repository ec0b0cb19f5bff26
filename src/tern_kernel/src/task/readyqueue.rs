//! Task ready queue implementation (internal use only).
//!
//! **This module is exempt from the API stability guarantee.**
//!
//! One queue serves the whole system: an array of per-priority FIFO lists, a
//! priority bitmap, and a cached best priority. The active task of each
//! processor stays in the queue while it runs; on a multi-processor
//! configuration the `cur_exc` flag keeps a second processor from electing
//! it.
use crate::klock::{CpuLockCell, CpuLockTokenRefMut};
use crate::task::TaskCb;
use crate::utils::intrusive_list::{ListAccessor, ListHead};
use crate::utils::{Init, PrioBitmap};
use crate::{KernelTraits, Priority, ResultCode};

/// Represents a task ready queue.
///
/// This trait is not intended to be implemented on custom types; the
/// `build!` macro selects [`BitmapQueue`] with the configured priority
/// count.
pub trait Queue<Traits>: 'static {
    /// Insert a runnable task at the head of its priority level.
    fn add_head(&self, lock: CpuLockTokenRefMut<'_, Traits>, task: &'static TaskCb<Traits>)
    where
        Traits: KernelTraits;

    /// Insert a runnable task at the tail of its priority level.
    fn add_tail(&self, lock: CpuLockTokenRefMut<'_, Traits>, task: &'static TaskCb<Traits>)
    where
        Traits: KernelTraits;

    /// Insert a woken or resumed task: at the tail if it shares the current
    /// task's priority, at the head otherwise.
    fn add(&self, lock: CpuLockTokenRefMut<'_, Traits>, task: &'static TaskCb<Traits>)
    where
        Traits: KernelTraits;

    /// Remove a task, clearing its priority bit and recomputing the cached
    /// best priority as needed.
    fn remove(&self, lock: CpuLockTokenRefMut<'_, Traits>, task: &'static TaskCb<Traits>)
    where
        Traits: KernelTraits;

    /// Move the head of the given priority level to its tail.
    fn rotate(&self, lock: CpuLockTokenRefMut<'_, Traits>, prio: Priority)
    where
        Traits: KernelTraits;

    /// The head task of the given priority level.
    fn front_of(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        prio: Priority,
    ) -> Option<&'static TaskCb<Traits>>
    where
        Traits: KernelTraits;

    /// The number of tasks queued at the given priority level.
    fn len_of(&self, lock: CpuLockTokenRefMut<'_, Traits>, prio: Priority) -> usize
    where
        Traits: KernelTraits;

    /// Elect the task processor `cpu` should run next, or `None` if no
    /// eligible task is ready.
    fn preferred_task(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        cpu: usize,
    ) -> Option<&'static TaskCb<Traits>>
    where
        Traits: KernelTraits;

    /// The cached best ready priority, or `NUM_PRIORITY_LEVELS` if the
    /// queue is empty.
    fn highest_priority(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> usize
    where
        Traits: KernelTraits;
}

/// The ready queue implementation: per-priority list heads, a word-array
/// priority bitmap, and the cached best priority.
///
/// Invariant: bit *p* is set iff the list at *p* is non-empty, and
/// `highest` is the index of the first set bit (`LEN` if none).
pub struct BitmapQueue<Traits: KernelTraits, const LEN: usize, const WORDS: usize> {
    heads: [CpuLockCell<Traits, ListHead<TaskCb<Traits>>>; LEN],
    bitmap: CpuLockCell<Traits, PrioBitmap<WORDS>>,
    highest: CpuLockCell<Traits, usize>,
}

impl<Traits: KernelTraits, const LEN: usize, const WORDS: usize> Init
    for BitmapQueue<Traits, LEN, WORDS>
{
    const INIT: Self = Self {
        heads: [const { CpuLockCell::new(ListHead::INIT) }; LEN],
        bitmap: CpuLockCell::new(PrioBitmap::INIT),
        highest: CpuLockCell::new(LEN),
    };
}

impl<Traits: KernelTraits, const LEN: usize, const WORDS: usize> BitmapQueue<Traits, LEN, WORDS> {
    fn list(
        &self,
        prio: usize,
    ) -> ListAccessor<
        '_,
        Traits,
        TaskCb<Traits>,
        impl Fn(&'static TaskCb<Traits>) -> &'static CpuLockCell<Traits, Option<crate::utils::intrusive_list::Link<TaskCb<Traits>>>>,
    > {
        ListAccessor::new(&self.heads[prio], |task: &'static TaskCb<Traits>| {
            &task.run_link
        })
    }

    /// Update the bitmap and cached best priority after an insertion at
    /// `prio`.
    fn note_inserted(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, prio: usize) {
        let mut bitmap = self.bitmap.get(&*lock);
        bitmap.set(prio);
        self.bitmap.replace(&mut *lock, bitmap);

        if prio < self.highest.get(&*lock) {
            self.highest.replace(&mut *lock, prio);
        }
    }

    /// On a multi-processor configuration, decide whether another processor
    /// should be interrupted to pick up the task that just became ready.
    fn signal_cpu_for(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static TaskCb<Traits>,
    ) where
        Traits: KernelTraits,
    {
        if Traits::NUM_CPUS == 1 || !Traits::state().started.get(&*lock) {
            return;
        }

        let state = Traits::state();
        let cur_cpu = Traits::cpu_current();

        if task.cpu_bound.get(&*lock) {
            let target = task.cpu.get(&*lock) as usize;
            if target != cur_cpu {
                let preempt = match state.cpu(target).active.get(&*lock) {
                    Some(active) => {
                        let tp = task.prio.get(&*lock);
                        let ap = active.prio.get(&*lock);
                        tp.is_higher_than(ap) || tp == ap
                    }
                    None => true,
                };
                if preempt {
                    // Safety: `target` is a valid processor index
                    unsafe { Traits::cpu_signal(target) };
                }
            }
            return;
        }

        // Find the processor running the worst-priority task; an idle
        // processor is the best possible target
        let mut worst_cpu = 0;
        let mut worst: Option<Priority> = state.cpu(0).active.get(&*lock).map(|t| t.prio.get(&*lock));
        for i in 1..Traits::NUM_CPUS {
            let prio = state.cpu(i).active.get(&*lock).map(|t| t.prio.get(&*lock));
            let is_worse = match (worst, prio) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(w), Some(p)) => w.is_higher_than(p),
            };
            if is_worse {
                worst_cpu = i;
                worst = prio;
            }
        }
        if worst_cpu != cur_cpu {
            // Safety: `worst_cpu` is a valid processor index
            unsafe { Traits::cpu_signal(worst_cpu) };
        }
    }
}

impl<Traits: KernelTraits, const LEN: usize, const WORDS: usize> Queue<Traits>
    for BitmapQueue<Traits, LEN, WORDS>
{
    fn add_head(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, task: &'static TaskCb<Traits>) {
        let prio = task.prio.get(&*lock).index();
        self.list(prio).push_front(lock.borrow_mut(), task);
        self.note_inserted(lock.borrow_mut(), prio);
        self.signal_cpu_for(lock, task);
    }

    fn add_tail(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, task: &'static TaskCb<Traits>) {
        let prio = task.prio.get(&*lock).index();
        self.list(prio).push_back(lock.borrow_mut(), task);
        self.note_inserted(lock.borrow_mut(), prio);
        self.signal_cpu_for(lock, task);
    }

    fn add(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, task: &'static TaskCb<Traits>) {
        let active_prio = Traits::state()
            .cpu_current()
            .active
            .get(&*lock)
            .map(|t| t.prio.get(&*lock));
        if active_prio == Some(task.prio.get(&*lock)) {
            self.add_tail(lock, task);
        } else {
            self.add_head(lock, task);
        }
    }

    fn remove(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, task: &'static TaskCb<Traits>) {
        let prio = task.prio.get(&*lock).index();
        let list = self.list(prio);
        list.remove(lock.borrow_mut(), task);

        if !list.is_empty(lock.borrow_mut()) {
            return;
        }

        let mut bitmap = self.bitmap.get(&*lock);
        bitmap.clear(prio);
        self.bitmap.replace(&mut *lock, bitmap);

        // Only the best level's emptying forces a rescan
        if prio != self.highest.get(&*lock) {
            return;
        }
        let highest = bitmap.find_first_set().unwrap_or(LEN);
        self.highest.replace(&mut *lock, highest);
    }

    fn rotate(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, prio: Priority) {
        self.list(prio.index()).rotate(lock.borrow_mut());
    }

    fn front_of(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        prio: Priority,
    ) -> Option<&'static TaskCb<Traits>> {
        self.heads[prio.index()].get(&*lock).first
    }

    fn len_of(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, prio: Priority) -> usize {
        let list = self.list(prio.index());
        let mut n = 0;
        let mut cursor = list.front(lock.borrow_mut());
        while let Some(task) = cursor {
            n += 1;
            cursor = list.next(lock.borrow_mut(), task);
        }
        n
    }

    fn preferred_task(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        cpu: usize,
    ) -> Option<&'static TaskCb<Traits>> {
        let highest = self.highest.get(&*lock);
        if highest >= LEN {
            return None;
        }

        if Traits::NUM_CPUS == 1 {
            // No binding or execution marks to honor: the head of the best
            // level wins
            return self.heads[highest].get(&*lock).first;
        }

        let active = Traits::state().cpu(cpu).active.get(&*lock);

        // Scan priorities from the best downward, skipping tasks that are
        // executing elsewhere or bound to another processor. The scratch
        // bitmap records levels exhausted by the scan.
        let mut scratch = self.bitmap.get(&*lock);
        let mut prio = highest;
        loop {
            let list = self.list(prio);
            let mut cursor = list.front(lock.borrow_mut());
            while let Some(task) = cursor {
                if crate::task::ptr_eq_opt(active, Some(task)) {
                    // The current task is still the best choice
                    return active;
                }

                let eligible = !task.cur_exc.get(&*lock)
                    && (!task.cpu_bound.get(&*lock) || task.cpu.get(&*lock) as usize == cpu);
                if eligible {
                    task.cpu.replace(&mut *lock, cpu as u8);
                    task.cur_exc.replace(&mut *lock, true);
                    return Some(task);
                }

                cursor = list.next(lock.borrow_mut(), task);
            }

            scratch.clear(prio);
            match scratch.find_first_set() {
                Some(p) => prio = p,
                None => return None,
            }
        }
    }

    fn highest_priority(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
        self.highest.get(&*lock)
    }
}

/// The ready-queue invariant checks used by the kernel's own tests and
/// debug assertions.
#[allow(dead_code)]
pub(crate) fn debug_check_invariants<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    use crate::task::readyqueue::Queue as _;
    let rq = &Traits::state().ready_queue;

    let highest = rq.highest_priority(lock.borrow_mut());
    for prio in 0..Traits::NUM_PRIORITY_LEVELS {
        let front = rq.front_of(lock.borrow_mut(), Priority::new(prio as u8));
        if front.is_some() && prio < highest {
            Traits::fatal_error(ResultCode::FatalError);
        }
    }
}

#[cfg(test)]
mod tests {
    /// The multi-processor election skips tasks bound elsewhere and tasks
    /// already executing, and terminates early on the current task.
    mod smp_election {
        use crate::klock;
        use crate::task::readyqueue::Queue as _;
        use crate::task::{Task, TaskCb, TaskOptions, TaskStack};
        use crate::test_utils::kick;
        use crate::utils::Init;
        use crate::KernelCfg;

        mock_kernel!(struct K, cpus: 2);

        static A_CB: TaskCb<K> = Init::INIT;
        static A_STACK: TaskStack<64> = TaskStack::new();
        static B_CB: TaskCb<K> = Init::INIT;
        static B_STACK: TaskStack<64> = TaskStack::new();

        fn body(_: usize) {}

        #[test]
        fn scenario() {
            // A is the better task but is bound to processor 1
            Task::create(
                &A_CB, "A", body, 0, 3, 0, &A_STACK, TaskOptions::AUTO_START, Some(1),
            )
            .unwrap();
            Task::create(&B_CB, "B", body, 0, 4, 0, &B_STACK, TaskOptions::AUTO_START, None)
                .unwrap();
            kick::<K>();

            let mut lock = klock::relock_cpu::<K>();
            let rq = &K::state().ready_queue;

            // `kick` elected for processor 0: A must have been skipped
            assert!(crate::task::ptr_eq_opt(
                K::state().cpu(0).active.get(&*lock),
                Some(&B_CB),
            ));
            assert!(B_CB.cur_exc.get(&*lock));

            // Processor 1 skips B (executing on 0) and elects its bound task
            let elected = rq.preferred_task(lock.borrow_mut(), 1);
            assert!(crate::task::ptr_eq_opt(elected, Some(&A_CB)));
            assert!(A_CB.cur_exc.get(&*lock));
            assert_eq!(A_CB.cpu.get(&*lock), 1);

            // With both marked executing, a re-election on processor 1
            // terminates early at its own active task
            K::state().cpu(1).active.replace(&mut *lock, Some(&A_CB));
            let again = rq.preferred_task(lock.borrow_mut(), 1);
            assert!(crate::task::ptr_eq_opt(again, Some(&A_CB)));
        }
    }

    /// Waking a task that outranks another processor's active task raises
    /// an IPI toward that processor.
    mod cross_cpu_signal {
        use crate::klock;
        use crate::sched;
        use crate::task::{Task, TaskCb, TaskOptions, TaskState, TaskStack};
        use crate::test_utils::kick;
        use crate::utils::Init;
        use crate::KernelCfg;

        mock_kernel!(struct K, cpus: 2);

        static LOW_CB: TaskCb<K> = Init::INIT;
        static LOW_STACK: TaskStack<64> = TaskStack::new();
        static HIGH_CB: TaskCb<K> = Init::INIT;
        static HIGH_STACK: TaskStack<64> = TaskStack::new();

        fn body(_: usize) {}

        #[test]
        fn scenario() {
            Task::create(
                &LOW_CB, "low", body, 0, 9, 0, &LOW_STACK, TaskOptions::AUTO_START, Some(1),
            )
            .unwrap();
            let high = Task::create(
                &HIGH_CB, "high", body, 0, 1, 0, &HIGH_STACK, TaskOptions::empty(), Some(1),
            )
            .unwrap();
            kick::<K>();

            // Pretend processor 1 picked up its bound task
            {
                let mut lock = klock::relock_cpu::<K>();
                K::state().cpu(1).active.replace(&mut *lock, Some(&LOW_CB));
                K::state().cpu(1).preferred.replace(&mut *lock, Some(&LOW_CB));
                sched::critical_exit_sched(lock);
            }

            let before = K::signal_count().load(std::sync::atomic::Ordering::SeqCst);

            // Releasing the suspended high-priority task (bound to
            // processor 1) must interrupt processor 1
            high.resume().unwrap();

            let after = K::signal_count().load(std::sync::atomic::Ordering::SeqCst);
            assert!(after > before, "no IPI was raised");

            let lock = klock::relock_cpu::<K>();
            assert_eq!(HIGH_CB.state.get(&*lock), TaskState::Ready);
        }
    }
}
