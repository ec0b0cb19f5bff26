//! The scheduler core.
//!
//! `core_sched` makes exactly one scheduling decision and is called at
//! critical-section exit (`critical_exit_sched`), at interrupt-nesting exit,
//! and when the scheduler lock is released. It is a no-op while an interrupt
//! handler is active or the scheduler is locked.
use crate::error::BadContextError;
use crate::klock::{CpuLockGuard, CpuLockTokenRefMut};
use crate::task::readyqueue::Queue as _;
use crate::task::{ptr_eq_opt, SchedPolicy, TaskCb, STACK_SENTINEL};
use crate::trace;
use crate::{KernelTraits, ResultCode};

/// Fail unless no interrupt handler is active on the current processor.
pub(crate) fn expect_no_isr<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<(), BadContextError> {
    if Traits::state().cpu_current().intrpt_nested.get(&*lock) > 0 {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// Fail unless a task is running and the caller is executing in its
/// context. Returns the current task for the caller's convenience.
pub(crate) fn expect_task_context<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<&'static TaskCb<Traits>, BadContextError> {
    if !Traits::is_task_context() {
        return Err(BadContextError::BadContext);
    }
    Traits::state()
        .cpu_current()
        .active
        .get(&*lock)
        .ok_or(BadContextError::BadContext)
}

/// Run one scheduling decision and release the CPU Lock. If a better task
/// was elected, the port switches contexts as the lock is released.
pub(crate) fn critical_exit_sched<Traits: KernelTraits>(mut lock: CpuLockGuard<Traits>) {
    core_sched(lock.borrow_mut());
    drop(lock);
}

/// Elect the preferred task for the current processor and request a context
/// switch if it differs from the active task.
pub(crate) fn core_sched<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let cpu = Traits::cpu_current();
    let pc = Traits::state().cpu(cpu);

    if pc.intrpt_nested.get(&*lock) > 0 {
        return;
    }
    if pc.sched_lock.get(&*lock) > 0 {
        return;
    }

    let preferred = Traits::state()
        .ready_queue
        .preferred_task(lock.borrow_mut(), cpu);
    let active = pc.active.get(&*lock);
    pc.preferred.replace(&mut *lock, preferred);

    if ptr_eq_opt(preferred, active) {
        return;
    }

    if let Some(task) = active {
        stack_ovf_check(lock.borrow_mut(), task);
        if Traits::NUM_CPUS > 1 {
            task.cur_exc.replace(&mut *lock, false);
        }
    }

    Traits::trace(trace::Event::TaskSwitch {
        from: active,
        to: preferred,
    });

    // Safety: CPU Lock active
    unsafe { Traits::task_switch() };
}

/// Verify the sentinel at the far end of the task's stack. Tripped
/// sentinels halt the kernel through the fatal-error hook.
pub(crate) fn stack_ovf_check<Traits: KernelTraits>(
    _lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
) {
    // Safety: the active task was created, so its attributes are valid
    let stack = unsafe { task.attr() }.stack;
    if stack.words == 0 {
        return;
    }

    // Safety: in-bounds read of the task's stack region
    let sentinel = unsafe {
        if Traits::STACK_GROWS_DOWN {
            stack.base.read_volatile()
        } else {
            stack.base.add(stack.words - 1).read_volatile()
        }
    };

    if sentinel != STACK_SENTINEL {
        Traits::fatal_error(ResultCode::StackOverflow);
    }
}

/// Round-robin slice accounting, run once per tick: decrement the active
/// task's slice and rotate its priority level when the slice is exhausted.
pub(crate) fn time_slice_update<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let state = Traits::state();
    let rq = &state.ready_queue;

    for i in 0..Traits::NUM_CPUS {
        let Some(task) = state.cpu(i).active.get(&*lock) else {
            continue;
        };

        if task.policy.get(&*lock) != SchedPolicy::RoundRobin {
            continue;
        }

        let prio = task.prio.get(&*lock);

        // Slices only matter while another task shares the level. The
        // rotation below assumes the active task sits at the head.
        if !ptr_eq_opt(rq.front_of(lock.borrow_mut(), prio), Some(task)) {
            continue;
        }
        if rq.len_of(lock.borrow_mut(), prio) <= 1 {
            continue;
        }

        let slice = task.time_slice.get(&*lock).saturating_sub(1);
        task.time_slice.replace(&mut *lock, slice);
        if slice > 0 {
            continue;
        }

        rq.rotate(lock.borrow_mut(), prio);
        let time_total = task.time_total.get(&*lock);
        task.time_slice.replace(&mut *lock, time_total);

        if Traits::NUM_CPUS > 1 && i != Traits::cpu_current() {
            // Safety: `i` is a valid processor index
            unsafe { Traits::cpu_signal(i) };
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::task::{Task, TaskCb, TaskOptions, TaskStack};
    use crate::test_utils::{active_name, kick};
    use crate::utils::Init;
    use crate::PortToKernel;

    mock_kernel!(struct K, cpus: 1);

    static T1_CB: TaskCb<K> = Init::INIT;
    static T1_STACK: TaskStack<64> = TaskStack::new();
    static T2_CB: TaskCb<K> = Init::INIT;
    static T2_STACK: TaskStack<64> = TaskStack::new();
    static T3_CB: TaskCb<K> = Init::INIT;
    static T3_STACK: TaskStack<64> = TaskStack::new();

    fn body(_: usize) {}

    /// Three same-priority tasks with a two-tick slice execute in the order
    /// T1,T1,T2,T2,T3,T3,… with FIFO rotation at slice expiry.
    #[test]
    fn round_robin_rotation() {
        Task::create(&T1_CB, "T1", body, 0, 3, 2, &T1_STACK, TaskOptions::AUTO_START, None)
            .unwrap();
        Task::create(&T2_CB, "T2", body, 0, 3, 2, &T2_STACK, TaskOptions::AUTO_START, None)
            .unwrap();
        Task::create(&T3_CB, "T3", body, 0, 3, 2, &T3_STACK, TaskOptions::AUTO_START, None)
            .unwrap();
        kick::<K>();

        let mut order = Vec::new();
        for _ in 0..12 {
            order.push(active_name::<K>());
            // Safety: the mock port delivers ticks inline
            unsafe { K::timer_tick() };
        }

        assert_eq!(
            order,
            ["T1", "T1", "T2", "T2", "T3", "T3", "T1", "T1", "T2", "T2", "T3", "T3"]
        );
    }
}
