//! Test plumbing: an inert port whose context switches commit
//! synchronously, letting the scheduler state machine be driven from a
//! single thread.

macro_rules! mock_kernel {
    (struct $Traits:ident, cpus: $cpus:expr) => {
        struct $Traits;

        impl $Traits {
            fn lock_flag() -> &'static std::sync::atomic::AtomicBool {
                static FLAG: std::sync::atomic::AtomicBool =
                    std::sync::atomic::AtomicBool::new(false);
                &FLAG
            }

            #[allow(dead_code)]
            fn current_cpu_cell() -> &'static std::sync::atomic::AtomicUsize {
                static CPU: std::sync::atomic::AtomicUsize =
                    std::sync::atomic::AtomicUsize::new(0);
                &CPU
            }

            /// The number of IPIs raised so far.
            #[allow(dead_code)]
            fn signal_count() -> &'static std::sync::atomic::AtomicUsize {
                static SIGNALS: std::sync::atomic::AtomicUsize =
                    std::sync::atomic::AtomicUsize::new(0);
                &SIGNALS
            }
        }

        unsafe impl $crate::PortThreading for $Traits {
            type PortTaskState = ();
            const PORT_TASK_STATE_INIT: () = ();

            unsafe fn enter_cpu_lock() {
                let was = Self::lock_flag().swap(true, std::sync::atomic::Ordering::SeqCst);
                assert!(!was, "nested CPU Lock in a mock kernel");
            }

            unsafe fn try_enter_cpu_lock() -> bool {
                !Self::lock_flag().swap(true, std::sync::atomic::Ordering::SeqCst)
            }

            unsafe fn leave_cpu_lock() {
                Self::lock_flag().store(false, std::sync::atomic::Ordering::SeqCst);
            }

            fn is_cpu_lock_active() -> bool {
                Self::lock_flag().load(std::sync::atomic::Ordering::SeqCst)
            }

            fn is_task_context() -> bool {
                true
            }

            fn cpu_current() -> usize {
                Self::current_cpu_cell().load(std::sync::atomic::Ordering::SeqCst)
            }

            unsafe fn initialize_task_state(_task: &'static $crate::TaskCb<Self>) {}

            unsafe fn task_switch() {
                // There is no real context to switch; commit the decision
                // on the spot
                let _ = unsafe {
                    <Self as $crate::PortToKernel>::commit_task_switch(Self::cpu_current())
                };
            }

            unsafe fn exit_and_dispatch(_task: &'static $crate::TaskCb<Self>) -> ! {
                unreachable!("mock kernels never run task bodies");
            }

            unsafe fn cpu_signal(_cpu: usize) {
                Self::signal_count().fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        $crate::build! {
            impl KernelCfg for $Traits {
                num_priority_levels: 16,
                num_cpus: $cpus,
                ticks_per_second: 100,
                time_slice_default: 10,
                timer: {
                    task_priority: 5,
                    task_stack_words: 256,
                    queue_len: 8,
                },
                reaper: {
                    task_stack_words: 256,
                },
            }
        }
    };
}

use crate::{klock, sched, KernelTraits};

/// Mark the kernel as running and elect the first task.
pub(crate) fn kick<Traits: KernelTraits>() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    Traits::state().started.replace(&mut *lock, true);
    sched::critical_exit_sched(lock);
}

/// The name of the task currently active on processor 0.
pub(crate) fn active_name<Traits: KernelTraits>() -> &'static str {
    let lock = klock::relock_cpu::<Traits>();
    let task = Traits::state().cpu(0).active.get(&*lock).expect("no active task");
    // Safety: active tasks have been created
    unsafe { task.attr() }.name
}

/// Force the active task on a processor, bypassing the scheduler. Used to
/// impersonate "the current task" in state-machine tests.
pub(crate) fn set_active<Traits: KernelTraits>(
    cpu: usize,
    task: Option<&'static crate::TaskCb<Traits>>,
) {
    let mut lock = klock::relock_cpu::<Traits>();
    Traits::state().cpu(cpu).active.replace(&mut *lock, task);
    Traits::state().cpu(cpu).preferred.replace(&mut *lock, task);
}
