//! Static configuration mechanism for the kernel

/// Implement [`KernelCfg`](crate::KernelCfg) on a kernel trait type,
/// instantiating the kernel state for the given configuration.
///
/// The `timer` and `reaper` blocks configure the built-in service tasks;
/// they are ignored (but still required) when the corresponding Cargo
/// feature is disabled.
///
/// # Example
///
/// ```ignore
/// tern_port_std::use_port!(unsafe struct SystemTraits);
///
/// tern_kernel::build! {
///     impl KernelCfg for SystemTraits {
///         num_priority_levels: 32,
///         num_cpus: 1,
///         ticks_per_second: 100,
///         time_slice_default: 50,
///         timer: {
///             task_priority: 5,
///             task_stack_words: 2048,
///             queue_len: 20,
///         },
///         reaper: {
///             task_stack_words: 2048,
///         },
///     }
/// }
/// ```
#[macro_export]
macro_rules! build {
    (
        impl KernelCfg for $Traits:ty {
            num_priority_levels: $pri:expr,
            num_cpus: $cpus:expr,
            ticks_per_second: $hz:expr,
            time_slice_default: $slice:expr,
            timer: {
                task_priority: $timer_pri:expr,
                task_stack_words: $timer_stack:expr,
                queue_len: $timer_qlen:expr $(,)?
            },
            reaper: {
                task_stack_words: $reaper_stack:expr $(,)?
            } $(,)?
        }
    ) => {
        const _: () = {
            assert!(
                $pri >= 2 && $pri <= 256,
                "`num_priority_levels` must be in `2..=256`"
            );
            assert!(
                $cpus >= 1 && $cpus <= $crate::CPU_NUM_MAX,
                "`num_cpus` must be in `1..=CPU_NUM_MAX`"
            );
        };

        // Safety: this macro is the designated implementor of `KernelCfg`
        unsafe impl $crate::KernelCfg for $Traits {
            const NUM_PRIORITY_LEVELS: usize = $pri;
            const NUM_CPUS: usize = $cpus;
            const TICKS_PER_SECOND: u32 = $hz;
            const TIME_SLICE_DEFAULT: u32 = $slice;

            type ReadyQueue = $crate::task::readyqueue::BitmapQueue<
                $Traits,
                { $pri },
                { $crate::utils::prio_bitmap_words($pri) },
            >;

            #[inline(always)]
            fn state() -> &'static $crate::State<Self> {
                static KERNEL_STATE: $crate::State<$Traits> =
                    <$crate::State<$Traits> as $crate::utils::Init>::INIT;
                &KERNEL_STATE
            }

            $crate::__build_timer_cfg! {
                $Traits, $timer_pri, $timer_stack, $timer_qlen
            }

            $crate::__build_reaper_cfg! {
                $Traits, $reaper_stack
            }
        }
    };
}

#[cfg(feature = "timer")]
#[doc(hidden)]
#[macro_export]
macro_rules! __build_timer_cfg {
    ( $Traits:ty, $timer_pri:expr, $timer_stack:expr, $timer_qlen:expr ) => {
        const TIMER_TASK_PRIORITY: u8 = $timer_pri;

        #[inline(always)]
        fn timer_globals() -> &'static $crate::timer::TimerGlobals<Self> {
            static TIMER_GLOBALS: $crate::timer::TimerGlobals<$Traits> =
                <$crate::timer::TimerGlobals<$Traits> as $crate::utils::Init>::INIT;
            &TIMER_GLOBALS
        }

        #[inline(always)]
        fn timer_queue_storage() -> &'static [$crate::utils::ring_buffer::MsgSlot<Self>] {
            static TIMER_QUEUE_STORAGE: $crate::queue::QueueStorage<$Traits, { $timer_qlen }> =
                $crate::queue::QueueStorage::new();
            TIMER_QUEUE_STORAGE.slots()
        }

        fn timer_task_stack() -> $crate::StackRegion {
            static TIMER_TASK_STACK: $crate::TaskStack<{ $timer_stack }> =
                $crate::TaskStack::new();
            TIMER_TASK_STACK.region()
        }
    };
}

#[cfg(not(feature = "timer"))]
#[doc(hidden)]
#[macro_export]
macro_rules! __build_timer_cfg {
    ( $Traits:ty, $timer_pri:expr, $timer_stack:expr, $timer_qlen:expr ) => {};
}

#[cfg(feature = "dyn_alloc")]
#[doc(hidden)]
#[macro_export]
macro_rules! __build_reaper_cfg {
    ( $Traits:ty, $reaper_stack:expr ) => {
        #[inline(always)]
        fn reaper_globals() -> &'static $crate::task::ReaperGlobals<Self> {
            static REAPER_GLOBALS: $crate::task::ReaperGlobals<$Traits> =
                <$crate::task::ReaperGlobals<$Traits> as $crate::utils::Init>::INIT;
            &REAPER_GLOBALS
        }

        fn reaper_task_stack() -> $crate::StackRegion {
            static REAPER_TASK_STACK: $crate::TaskStack<{ $reaper_stack }> =
                $crate::TaskStack::new();
            REAPER_TASK_STACK.region()
        }
    };
}

#[cfg(not(feature = "dyn_alloc"))]
#[doc(hidden)]
#[macro_export]
macro_rules! __build_reaper_cfg {
    ( $Traits:ty, $reaper_stack:expr ) => {};
}
