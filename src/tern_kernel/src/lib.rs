//! The Tern kernel: a fixed-priority preemptive RTOS core with
//! priority-inheritance mutexes, counting semaphores, message queues, and a
//! software-timer service.
//!
//! # Kernel trait type
//!
//! The whole kernel is generic over a *kernel trait type* — a unit struct
//! supplied by the embedder. A port implements [`PortThreading`] on it
//! (usually through the port's `use_port!` macro), and the
//! [`build!`] macro implements [`KernelCfg`], instantiating the kernel
//! state for the configured number of priority levels and processors.
//!
//! # Contexts
//!
//! APIs that can block require a *task context*: a task must be running, no
//! interrupt handler may be active, and the scheduler must not be locked.
//! Everything else may additionally be called from an interrupt handler or
//! from the boot path.
#![cfg_attr(not(test), no_std)]

#[cfg(feature = "dyn_alloc")]
extern crate alloc;

use core::fmt;
use core::marker::PhantomData;

#[cfg(test)]
#[macro_use]
mod test_utils;

pub mod error;
mod klock;
mod obj;
mod sched;
mod tick;
mod wait;
pub mod utils;
pub mod mutex;
pub mod queue;
pub mod semaphore;
pub mod task;
#[cfg(feature = "timer")]
pub mod timer;
pub mod trace;

mod cfg;

pub use crate::error::ResultCode;
pub use crate::obj::QueueOrder;
pub use crate::task::{
    Priority, SchedPolicy, StackRegion, Task, TaskCb, TaskOptions, TaskStack,
};

use crate::klock::CpuLockCell;
use crate::utils::Init;

/// A point in time or a duration, measured in timer-interrupt periods.
pub type Tick = u64;

/// How long a blocking operation may wait for its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Fail with `WouldBlock` instead of waiting.
    NoWait,
    /// Wait for at most the given number of ticks. Zero is equivalent to
    /// [`Timeout::NoWait`].
    Ticks(Tick),
    /// Wait until the resource becomes available.
    Forever,
}

impl Timeout {
    /// The tick-list deadline for this timeout: `None` means no deadline is
    /// armed.
    pub(crate) fn deadline_ticks(self) -> Option<Tick> {
        match self {
            Self::NoWait | Self::Ticks(0) => None,
            Self::Ticks(t) => Some(t),
            Self::Forever => None,
        }
    }

    pub(crate) fn is_no_wait(self) -> bool {
        matches!(self, Self::NoWait | Self::Ticks(0))
    }
}

/// The hard cap on `KernelCfg::NUM_CPUS`. Per-processor kernel state is
/// sized by this constant.
pub const CPU_NUM_MAX: usize = 8;

/// Implemented by a port on a kernel trait type to provide the low-level
/// CPU services: the CPU Lock (interrupt masking plus, on SMP, the kernel
/// spin-lock), context initialization, and context switching.
///
/// # Safety
///
/// The implementation must uphold each method's contract; the kernel's
/// soundness rests on them.
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// Port-specific per-task state stored in each task control block.
    type PortTaskState: Send + Sync + fmt::Debug + 'static;

    /// The initial value of [`Self::PortTaskState`] for each task.
    const PORT_TASK_STATE_INIT: Self::PortTaskState;

    /// Whether the stack grows toward lower addresses on this processor.
    const STACK_GROWS_DOWN: bool = true;

    /// Enter the CPU Lock: disable interrupts on the current processor and,
    /// on SMP, acquire the kernel spin-lock (in that order).
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn enter_cpu_lock();

    /// Try to enter the CPU Lock. Returns `false` iff the current context
    /// already holds it.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Leave the CPU Lock. If a context switch was requested by
    /// [`Self::task_switch`], the port performs it here (or at the next
    /// interrupt-mask restore), calling
    /// [`PortToKernel::commit_task_switch`] when it happens.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn leave_cpu_lock();

    /// Whether the current context holds the CPU Lock.
    fn is_cpu_lock_active() -> bool;

    /// Whether the current context is a task context.
    fn is_task_context() -> bool;

    /// The index of the current processor (`0..NUM_CPUS`).
    fn cpu_current() -> usize;

    /// Prepare the task's machine context so that its first dispatch enters
    /// the task entry function.
    ///
    /// # Safety
    ///
    /// Called with the CPU Lock held, on a task that is not running.
    unsafe fn initialize_task_state(task: &'static task::TaskCb<Self>)
    where
        Self: KernelTraits;

    /// Request a context switch to the current processor's preferred task
    /// at the next safe point (when the CPU Lock is released).
    ///
    /// # Safety
    ///
    /// Called with the CPU Lock held.
    unsafe fn task_switch()
    where
        Self: KernelTraits;

    /// Terminate the calling task's context and dispatch the preferred
    /// task. The task's stack must not be used afterwards.
    ///
    /// # Safety
    ///
    /// Called with the CPU Lock held, from the context of `task`.
    unsafe fn exit_and_dispatch(task: &'static task::TaskCb<Self>) -> !
    where
        Self: KernelTraits;

    /// Raise an inter-processor interrupt so that processor `cpu` runs the
    /// scheduler at its next safe point. Never called on a single-processor
    /// configuration.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn cpu_signal(cpu: usize) {
        let _ = cpu;
        unreachable!("cpu_signal is not implemented by this port");
    }

    /// Called when the kernel detects an unrecoverable error. Must not
    /// return.
    fn fatal_error(code: ResultCode) -> ! {
        panic!("fatal kernel error: {code:?}");
    }

    /// Tracing hook. The kernel calls this for the fixed set of events in
    /// [`trace::Event`]; the default implementation discards them.
    fn trace(event: trace::Event<'_, Self>)
    where
        Self: KernelTraits,
    {
        let _ = event;
    }
}

/// The top-level port trait.
pub trait Port: PortThreading {}
impl<T: PortThreading> Port for T {}

/// The compile-time kernel configuration, implemented on a kernel trait
/// type by the [`build!`] macro.
///
/// # Safety
///
/// Only meant to be implemented by [`build!`].
pub unsafe trait KernelCfg: Port + Sized {
    /// The number of priority levels. Valid priorities are
    /// `0..NUM_PRIORITY_LEVELS`; numerically lower is better. The greatest
    /// level is reserved for an idle task.
    const NUM_PRIORITY_LEVELS: usize;

    /// The number of processors (`1..=CPU_NUM_MAX`).
    const NUM_CPUS: usize;

    /// The tick rate of the system timer interrupt.
    const TICKS_PER_SECOND: u32;

    /// The time slice, in ticks, given to round-robin tasks that don't
    /// specify one.
    const TIME_SLICE_DEFAULT: u32;

    /// The ready-queue type instantiated for `NUM_PRIORITY_LEVELS`.
    type ReadyQueue: task::readyqueue::Queue<Self> + Init + Send + Sync + 'static;

    /// The kernel state instance for this kernel trait type.
    fn state() -> &'static State<Self>
    where
        Self: KernelTraits;

    /// The priority of the software-timer service task.
    #[cfg(feature = "timer")]
    const TIMER_TASK_PRIORITY: u8;

    /// The statics backing the software-timer service.
    #[cfg(feature = "timer")]
    fn timer_globals() -> &'static timer::TimerGlobals<Self>
    where
        Self: KernelTraits;

    /// The slots backing the timer service's command queue.
    #[cfg(feature = "timer")]
    fn timer_queue_storage() -> &'static [utils::ring_buffer::MsgSlot<Self>];

    /// The stack of the software-timer service task.
    #[cfg(feature = "timer")]
    fn timer_task_stack() -> StackRegion;

    /// The statics backing the reaper task.
    #[cfg(feature = "dyn_alloc")]
    fn reaper_globals() -> &'static task::ReaperGlobals<Self>
    where
        Self: KernelTraits;

    /// The stack of the reaper task.
    #[cfg(feature = "dyn_alloc")]
    fn reaper_task_stack() -> StackRegion;
}

/// The combination of traits a fully configured kernel trait type
/// implements.
pub trait KernelTraits: Port + KernelCfg + 'static {}
impl<T: Port + KernelCfg + 'static> KernelTraits for T {}

/// Per-processor kernel state.
pub(crate) struct PerCpu<Traits: KernelTraits> {
    /// The task currently executing on this processor, if any. The active
    /// task remains in the ready queue while it runs.
    pub(crate) active: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,
    /// The task elected by the last scheduling decision. The port switches
    /// to this task and then commits it as `active`.
    pub(crate) preferred: CpuLockCell<Traits, Option<&'static TaskCb<Traits>>>,
    /// Scheduler-lock nesting counter. While non-zero, `core_sched` is a
    /// no-op and blocking APIs fail with `SchedulerLocked`.
    pub(crate) sched_lock: CpuLockCell<Traits, u8>,
    /// Interrupt-nesting counter, maintained by `intrpt_enter`/`intrpt_exit`.
    pub(crate) intrpt_nested: CpuLockCell<Traits, u8>,
    /// Whether an idle-priority task was already created on this processor.
    pub(crate) idle_spawned: CpuLockCell<Traits, bool>,
}

impl<Traits: KernelTraits> Init for PerCpu<Traits> {
    const INIT: Self = Self {
        active: Init::INIT,
        preferred: Init::INIT,
        sched_lock: Init::INIT,
        intrpt_nested: Init::INIT,
        idle_spawned: Init::INIT,
    };
}

/// The global mutable state of one kernel instance. Initialized before the
/// first task is created, never torn down.
pub struct State<Traits: KernelTraits> {
    pub(crate) ready_queue: Traits::ReadyQueue,
    pub(crate) tick: tick::TickGlobals<Traits>,
    pub(crate) cpus: [PerCpu<Traits>; CPU_NUM_MAX],
    /// Becomes `true` when `PortToKernel::boot` runs. Until then, task
    /// creation does not cause scheduling.
    pub(crate) started: CpuLockCell<Traits, bool>,
    #[cfg(feature = "system_stats")]
    pub(crate) registry: obj::KObjRegistry<Traits>,
    /// Control blocks of dynamically created tasks awaiting reclamation,
    /// linked through `TaskCb::run_link`.
    #[cfg(feature = "dyn_alloc")]
    pub(crate) dead_tasks: CpuLockCell<Traits, utils::intrusive_list::ListHead<TaskCb<Traits>>>,
    /// Recycled dynamic task control blocks, linked through
    /// `TaskCb::run_link`.
    #[cfg(feature = "dyn_alloc")]
    pub(crate) task_pool: CpuLockCell<Traits, utils::intrusive_list::ListHead<TaskCb<Traits>>>,
    /// Recycled dynamic control blocks of the other object types. Deleted
    /// dynamic objects are recycled rather than freed so that a stale
    /// handle can never read reclaimed memory.
    #[cfg(feature = "dyn_alloc")]
    pub(crate) sem_pool:
        CpuLockCell<Traits, utils::intrusive_list::ListHead<semaphore::SemaphoreCb<Traits>>>,
    #[cfg(feature = "dyn_alloc")]
    pub(crate) queue_pool:
        CpuLockCell<Traits, utils::intrusive_list::ListHead<queue::QueueCb<Traits>>>,
    #[cfg(feature = "dyn_alloc")]
    pub(crate) mutex_pool:
        CpuLockCell<Traits, utils::intrusive_list::ListHead<mutex::MutexCb<Traits>>>,
    #[cfg(all(feature = "dyn_alloc", feature = "timer"))]
    pub(crate) timer_pool:
        CpuLockCell<Traits, utils::intrusive_list::ListHead<timer::TimerCb<Traits>>>,
}

impl<Traits: KernelTraits> Init for State<Traits> {
    const INIT: Self = Self {
        ready_queue: Init::INIT,
        tick: Init::INIT,
        cpus: Init::INIT,
        started: Init::INIT,
        #[cfg(feature = "system_stats")]
        registry: Init::INIT,
        #[cfg(feature = "dyn_alloc")]
        dead_tasks: CpuLockCell::new(Init::INIT),
        #[cfg(feature = "dyn_alloc")]
        task_pool: CpuLockCell::new(Init::INIT),
        #[cfg(feature = "dyn_alloc")]
        sem_pool: CpuLockCell::new(Init::INIT),
        #[cfg(feature = "dyn_alloc")]
        queue_pool: CpuLockCell::new(Init::INIT),
        #[cfg(feature = "dyn_alloc")]
        mutex_pool: CpuLockCell::new(Init::INIT),
        #[cfg(all(feature = "dyn_alloc", feature = "timer"))]
        timer_pool: CpuLockCell::new(Init::INIT),
    };
}

impl<Traits: KernelTraits> State<Traits> {
    #[inline]
    pub(crate) fn cpu(&self, cpu: usize) -> &PerCpu<Traits> {
        &self.cpus[cpu]
    }

    #[inline]
    pub(crate) fn cpu_current(&self) -> &PerCpu<Traits> {
        &self.cpus[Traits::cpu_current()]
    }
}

/// The port-facing entry points of the kernel, implemented automatically
/// for every kernel trait type.
pub trait PortToKernel: KernelTraits {
    /// Initialize the kernel: spawn the built-in service tasks, mark the
    /// system as running, and elect the first task. The port dispatches
    /// the elected task when this returns.
    ///
    /// # Safety
    ///
    /// Called exactly once, with the CPU Lock inactive, before any other
    /// kernel API.
    unsafe fn boot();

    /// The periodic timer-interrupt handler: advances the tick counter,
    /// expires timed waits, updates round-robin slices, and reschedules.
    ///
    /// # Safety
    ///
    /// Called from the port's timer interrupt with the CPU Lock inactive.
    unsafe fn timer_tick();

    /// Commit the pending context switch on processor `cpu`: the preferred
    /// task becomes the active task. Returns the new active task so the
    /// port can locate its machine context.
    ///
    /// # Safety
    ///
    /// Called by the port while performing the switch requested by
    /// [`PortThreading::task_switch`], with the CPU Lock held.
    unsafe fn commit_task_switch(cpu: usize) -> Option<&'static TaskCb<Self>>;
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() {
        let mut lock = klock::lock_cpu::<Traits>().unwrap();
        Traits::state().started.replace(&mut *lock.borrow_mut(), true);
        drop(lock);

        #[cfg(feature = "dyn_alloc")]
        task::reaper_init::<Traits>();

        #[cfg(feature = "timer")]
        timer::timer_service_init::<Traits>();

        // Elect the first task
        let lock = klock::lock_cpu::<Traits>().unwrap();
        sched::critical_exit_sched(lock);
    }

    unsafe fn timer_tick() {
        System::<Traits>::intrpt_enter();
        {
            let mut lock = klock::relock_cpu::<Traits>();
            tick::tick_proc(lock.borrow_mut());
            sched::time_slice_update(lock.borrow_mut());
        }
        System::<Traits>::intrpt_exit();
    }

    unsafe fn commit_task_switch(cpu: usize) -> Option<&'static TaskCb<Traits>> {
        // Safety: the port holds the CPU Lock per this method's contract
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };
        let preferred = Traits::state().cpu(cpu).preferred.get(&*lock);
        Traits::state()
            .cpu(cpu)
            .active
            .replace(&mut *lock.borrow_mut(), preferred);
        core::mem::forget(lock);
        preferred
    }
}

/// Kernel-wide operations that are not tied to one object.
pub struct System<Traits>(PhantomData<Traits>);

impl<Traits: KernelTraits> System<Traits> {
    /// The current value of the tick counter.
    pub fn tick_count() -> Tick {
        let mut lock = klock::relock_cpu::<Traits>();
        let count = Traits::state().tick.count.get(&*lock.borrow_mut());
        count
    }

    /// Convert a duration in milliseconds to ticks, rounding up.
    pub fn ticks_from_ms(ms: u64) -> Tick {
        num_integer::Integer::div_ceil(
            &ms.saturating_mul(Traits::TICKS_PER_SECOND as u64),
            &1000,
        )
    }

    /// A handle to the currently running task.
    pub fn current_task() -> Option<Task<Traits>> {
        let mut lock = klock::relock_cpu::<Traits>();
        let active = Traits::state().cpu_current().active.get(&*lock.borrow_mut());
        active.map(Task::from_cb)
    }

    /// Disable rescheduling on the current processor without masking
    /// interrupts. Nests.
    pub fn sched_disable() -> Result<(), error::SchedDisableError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let pc = Traits::state().cpu_current();

        if pc.intrpt_nested.get(&*lock.borrow_mut()) > 0 {
            return Err(error::SchedDisableError::BadContext);
        }

        let count = pc.sched_lock.get(&*lock.borrow_mut());
        if count == u8::MAX {
            return Err(error::SchedDisableError::LockCountOverflow);
        }
        pc.sched_lock.replace(&mut *lock.borrow_mut(), count + 1);
        Ok(())
    }

    /// Re-enable rescheduling on the current processor. When the last lock
    /// is released a scheduling decision is made immediately.
    pub fn sched_enable() -> Result<(), error::SchedEnableError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let pc = Traits::state().cpu_current();

        if pc.intrpt_nested.get(&*lock.borrow_mut()) > 0 {
            return Err(error::SchedEnableError::BadContext);
        }

        let count = pc.sched_lock.get(&*lock.borrow_mut());
        if count == 0 {
            return Err(error::SchedEnableError::AlreadyEnabled);
        }
        pc.sched_lock.replace(&mut *lock.borrow_mut(), count - 1);

        if count == 1 {
            sched::critical_exit_sched(lock);
        }
        Ok(())
    }

    /// Note the entry into an interrupt handler. Ports bracket every ISR
    /// with this and [`Self::intrpt_exit`].
    pub fn intrpt_enter() {
        let mut lock = klock::relock_cpu::<Traits>();
        let pc = Traits::state().cpu_current();
        let nested = pc.intrpt_nested.get(&*lock.borrow_mut());
        if nested == u8::MAX {
            Traits::fatal_error(ResultCode::FatalError);
        }
        pc.intrpt_nested.replace(&mut *lock.borrow_mut(), nested + 1);
    }

    /// Note the exit from an interrupt handler. When the outermost handler
    /// exits, a scheduling decision is made.
    pub fn intrpt_exit() {
        let mut lock = klock::relock_cpu::<Traits>();
        let pc = Traits::state().cpu_current();
        let nested = pc.intrpt_nested.get(&*lock.borrow_mut());
        debug_assert!(nested > 0);
        pc.intrpt_nested.replace(&mut *lock.borrow_mut(), nested - 1);

        if nested == 1 {
            sched::critical_exit_sched(lock);
        }
    }
}
