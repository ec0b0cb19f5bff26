//! Tasks
use core::cell::UnsafeCell;
use core::fmt;

use crate::error::{
    CreateTaskError, DeleteTaskError, ResumeTaskError, SetPriorityError, SetSchedParamError,
    SleepError, StackProbeError, SuspendTaskError, WaitAbortError, WakeError,
};
use crate::klock::{self, CpuLockCell, CpuLockTokenRefMut};
use crate::obj::AllocKind;
use crate::sched;
use crate::tick;
use crate::trace;
use crate::utils::intrusive_list::Link;
use crate::utils::ring_buffer::RawMessage;
use crate::utils::Init;
use crate::wait::{self, BlkSource};
use crate::{KernelTraits, Tick as TickCount};

#[doc(hidden)]
pub mod readyqueue;
use self::readyqueue::Queue as _;

/// A task priority. Numerically lower is better; `>` on raw values is
/// deliberately unavailable so that "higher priority" is always spelled out.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Priority(u8);

impl Priority {
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// `true` iff `self` is a better priority than `other`.
    #[inline]
    pub fn is_higher_than(self, other: Priority) -> bool {
        self.0 < other.0
    }

    /// The better of the two priorities.
    #[inline]
    pub(crate) fn highest_of(self, other: Priority) -> Priority {
        if other.is_higher_than(self) {
            other
        } else {
            self
        }
    }
}

impl fmt::Debug for Priority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Priority({})", self.0)
    }
}

impl Init for Priority {
    const INIT: Self = Self(0);
}

/// The idle priority level: the numerically greatest configured level,
/// reserved for at most one task per processor.
pub(crate) fn idle_priority<Traits: KernelTraits>() -> Priority {
    Priority((Traits::NUM_PRIORITY_LEVELS - 1) as u8)
}

/// The scheduling policy applied among tasks of one priority level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Run until blocked or preempted by a better priority.
    Fifo,
    /// Round-robin: rotate to the tail of the level when the time slice
    /// is exhausted.
    RoundRobin,
}

impl Init for SchedPolicy {
    const INIT: Self = Self::RoundRobin;
}

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// The control block was never initialized by `create`.
    Seed,
    /// Runnable (and possibly running). A `Ready` task is always in the
    /// ready queue.
    Ready,
    /// Sleeping until a tick deadline.
    Sleep,
    /// Blocked on a synchronization object's pend list.
    Pend,
    /// Suspended while runnable.
    Suspended,
    /// A suspend arrived while sleeping; `resume` returns to `Sleep`.
    SleepSuspended,
    /// A suspend arrived while pending; `resume` returns to `Pend`.
    PendSuspended,
    /// Terminal state.
    Deleted,
}

impl Init for TaskState {
    const INIT: Self = Self::Seed;
}

/// The reason the last wait ended. Reported to the woken task by the
/// blocking API it was parked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeReason {
    /// The awaited resource was handed to the task.
    Finish,
    /// The tick deadline was reached.
    Timeout,
    /// A peer called `wait_abort`.
    Abort,
    /// The awaited object was deleted.
    Deleted,
}

impl Init for WakeReason {
    const INIT: Self = Self::Finish;
}

bitflags::bitflags! {
    /// Flags for task creation.
    pub struct TaskOptions: u8 {
        /// Insert the task into the ready queue immediately. Without this
        /// the task starts suspended and is released by `resume`.
        const AUTO_START = 1 << 0;
    }
}

/// Stack storage for one task, supplied by the embedder.
#[repr(align(16))]
pub struct TaskStack<const WORDS: usize> {
    storage: UnsafeCell<[usize; WORDS]>,
}

// Safety: the contents are only touched by the owning task and the port
unsafe impl<const WORDS: usize> Sync for TaskStack<WORDS> {}

impl<const WORDS: usize> TaskStack<WORDS> {
    pub const fn new() -> Self {
        Self {
            storage: UnsafeCell::new([0; WORDS]),
        }
    }

    pub fn region(&'static self) -> StackRegion {
        StackRegion {
            base: self.storage.get() as *mut usize,
            words: WORDS,
        }
    }
}

/// A raw stack region: base address and length in words.
#[derive(Debug, Clone, Copy)]
pub struct StackRegion {
    pub base: *mut usize,
    pub words: usize,
}

// Safety: a stack region is just an address range descriptor
unsafe impl Send for StackRegion {}
unsafe impl Sync for StackRegion {}

impl Init for StackRegion {
    const INIT: Self = Self {
        base: core::ptr::null_mut(),
        words: 0,
    };
}

/// The value written to the far end of every stack at creation. Checked on
/// every context switch away from the task.
pub(crate) const STACK_SENTINEL: usize = 0x5AA5_F00D;

fn noop_entry(_: usize) {}

/// The static properties of a task, written once by `create` and stable
/// for the task's lifetime.
pub struct TaskAttr {
    pub name: &'static str,
    pub entry: fn(usize),
    pub param: usize,
    pub stack: StackRegion,
}

impl Init for TaskAttr {
    const INIT: Self = Self {
        name: "",
        entry: noop_entry,
        param: 0,
        stack: StackRegion::INIT,
    };
}

/// *Task control block* - the state data of a task.
#[repr(C)]
pub struct TaskCb<Traits: KernelTraits> {
    /// Port-specific state.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so
    /// that assembler code can refer to it easily.
    pub port_task_state: Traits::PortTaskState,

    /// Written once during `create`; read-only afterwards.
    pub(crate) attr: UnsafeCell<TaskAttr>,

    pub(crate) state: CpuLockCell<Traits, TaskState>,

    /// The task's current priority. May be temporarily raised above
    /// `base_prio` by priority inheritance.
    pub(crate) prio: CpuLockCell<Traits, Priority>,

    /// The priority the task returns to when it holds no contended mutex.
    pub(crate) base_prio: CpuLockCell<Traits, Priority>,

    pub(crate) policy: CpuLockCell<Traits, SchedPolicy>,

    /// Remaining ticks of the current time slice.
    pub(crate) time_slice: CpuLockCell<Traits, u32>,

    /// The value the slice is reloaded from.
    pub(crate) time_total: CpuLockCell<Traits, u32>,

    pub(crate) suspend_count: CpuLockCell<Traits, u8>,

    pub(crate) wake_reason: CpuLockCell<Traits, WakeReason>,

    /// The object this task is pending on, if any.
    pub(crate) blk_on: CpuLockCell<Traits, Option<BlkSource<Traits>>>,

    /// Membership in exactly one of the ready queue or a pend list
    /// (and, for dead dynamic tasks, the reclamation lists).
    pub(crate) run_link: CpuLockCell<Traits, Option<Link<TaskCb<Traits>>>>,

    /// Membership in the tick list while a deadline is armed.
    pub(crate) tick_link: CpuLockCell<Traits, Option<Link<TaskCb<Traits>>>>,

    /// The absolute tick at which an armed deadline expires.
    pub(crate) tick_match: CpuLockCell<Traits, TickCount>,

    /// Head of the intrusive stack of mutexes this task currently holds.
    pub(crate) mutex_list: CpuLockCell<Traits, Option<&'static crate::mutex::MutexCb<Traits>>>,

    /// Slot for a message handed directly to this task by a queue sender.
    pub(crate) msg: CpuLockCell<Traits, RawMessage>,

    /// The processor this task last ran on, or is bound to.
    pub(crate) cpu: CpuLockCell<Traits, u8>,

    pub(crate) cpu_bound: CpuLockCell<Traits, bool>,

    /// Set while the task is executing on some processor. Prevents a second
    /// processor from electing it.
    pub(crate) cur_exc: CpuLockCell<Traits, bool>,

    pub(crate) alloc_kind: CpuLockCell<Traits, AllocKind>,

    #[cfg(feature = "system_stats")]
    pub(crate) registry_link: CpuLockCell<Traits, Option<Link<TaskCb<Traits>>>>,
}

// Safety: `attr` is written only during `create`, before the task is
// visible to any other context
unsafe impl<Traits: KernelTraits> Sync for TaskCb<Traits> {}

impl<Traits: KernelTraits> Init for TaskCb<Traits> {
    const INIT: Self = Self {
        port_task_state: Traits::PORT_TASK_STATE_INIT,
        attr: UnsafeCell::new(TaskAttr::INIT),
        state: Init::INIT,
        prio: Init::INIT,
        base_prio: Init::INIT,
        policy: Init::INIT,
        time_slice: Init::INIT,
        time_total: Init::INIT,
        suspend_count: Init::INIT,
        wake_reason: Init::INIT,
        blk_on: Init::INIT,
        run_link: Init::INIT,
        tick_link: Init::INIT,
        tick_match: Init::INIT,
        mutex_list: Init::INIT,
        msg: Init::INIT,
        cpu: Init::INIT,
        cpu_bound: Init::INIT,
        cur_exc: Init::INIT,
        alloc_kind: Init::INIT,
        #[cfg(feature = "system_stats")]
        registry_link: Init::INIT,
    };
}

impl<Traits: KernelTraits> TaskCb<Traits> {
    /// The task's static attributes.
    ///
    /// # Safety
    ///
    /// Valid only after `create` has initialized this control block.
    pub unsafe fn attr(&self) -> &TaskAttr {
        // Safety: `attr` is never written again after `create`
        unsafe { &*self.attr.get() }
    }
}

impl<Traits: KernelTraits> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("state", &self.state)
            .field("prio", &self.prio)
            .field("base_prio", &self.base_prio)
            .field("suspend_count", &self.suspend_count)
            .finish_non_exhaustive()
    }
}

/// A handle to a task.
pub struct Task<Traits: KernelTraits>(&'static TaskCb<Traits>);

impl<Traits: KernelTraits> Clone for Task<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: KernelTraits> Copy for Task<Traits> {}

impl<Traits: KernelTraits> PartialEq for Task<Traits> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}
impl<Traits: KernelTraits> Eq for Task<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for Task<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Task").field(&(self.0 as *const _)).finish()
    }
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}

#[inline]
pub(crate) fn ptr_eq_opt<T>(a: Option<&T>, b: Option<&T>) -> bool {
    core::ptr::eq(ptr_from_option_ref(a), ptr_from_option_ref(b))
}

impl<Traits: KernelTraits> Task<Traits> {
    pub(crate) fn from_cb(cb: &'static TaskCb<Traits>) -> Self {
        Self(cb)
    }

    /// The task's name.
    pub fn name(self) -> &'static str {
        // Safety: handles are only constructed for created tasks
        unsafe { self.0.attr() }.name
    }

    /// The task's current (possibly inherited) priority.
    pub fn priority(self) -> u8 {
        let lock = klock::relock_cpu::<Traits>();
        self.0.prio.get(&*lock).get()
    }

    /// The task's base priority.
    pub fn base_priority(self) -> u8 {
        let lock = klock::relock_cpu::<Traits>();
        self.0.base_prio.get(&*lock).get()
    }

    /// Initialize a task control block and, with
    /// [`TaskOptions::AUTO_START`], make the task runnable.
    ///
    /// `time_slice == 0` selects the configured default slice. `cpu`
    /// restricts the task to one processor (multi-processor configurations
    /// only).
    pub fn create<const WORDS: usize>(
        cb: &'static TaskCb<Traits>,
        name: &'static str,
        entry: fn(usize),
        param: usize,
        priority: u8,
        time_slice: u32,
        stack: &'static TaskStack<WORDS>,
        options: TaskOptions,
        cpu: Option<usize>,
    ) -> Result<Task<Traits>, CreateTaskError> {
        create_task(
            cb,
            name,
            entry,
            param,
            priority,
            time_slice,
            stack.region(),
            options,
            cpu,
            AllocKind::Static,
        )
    }

    /// Like [`Self::create`], but over a raw stack region. Used by the
    /// kernel's built-in service tasks.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_raw(
        cb: &'static TaskCb<Traits>,
        name: &'static str,
        entry: fn(usize),
        param: usize,
        priority: u8,
        time_slice: u32,
        stack: StackRegion,
        options: TaskOptions,
        cpu: Option<usize>,
    ) -> Result<Task<Traits>, CreateTaskError> {
        create_task(
            cb,
            name,
            entry,
            param,
            priority,
            time_slice,
            stack,
            options,
            cpu,
            AllocKind::Static,
        )
    }

    /// Like [`Self::create`], but the control block and stack are allocated
    /// from the kernel heap. The resources are reclaimed by the reaper task
    /// after the task is deleted.
    #[cfg(feature = "dyn_alloc")]
    pub fn create_dyn(
        name: &'static str,
        entry: fn(usize),
        param: usize,
        priority: u8,
        time_slice: u32,
        stack_words: usize,
        options: TaskOptions,
        cpu: Option<usize>,
    ) -> Result<Task<Traits>, CreateTaskError> {
        use alloc::boxed::Box;

        if stack_words == 0 {
            return Err(CreateTaskError::StackTooSmall);
        }

        let stack = Box::leak(alloc::vec![0usize; stack_words].into_boxed_slice());
        let region = StackRegion {
            base: stack.as_mut_ptr(),
            words: stack_words,
        };

        let cb = {
            let mut lock = match klock::lock_cpu::<Traits>() {
                Ok(lock) => lock,
                Err(_) => return Err(CreateTaskError::BadContext),
            };
            let pool = wait::run_list_accessor(&Traits::state().task_pool);
            pool.pop_front(lock.borrow_mut())
        };
        let cb = match cb {
            Some(cb) => cb,
            None => Box::leak(Box::new(TaskCb::INIT)),
        };

        let result = create_task(
            cb,
            name,
            entry,
            param,
            priority,
            time_slice,
            region,
            options,
            cpu,
            AllocKind::Dynamic,
        );

        if result.is_err() {
            // Return the resources; the control block goes back to the pool
            let mut lock = klock::relock_cpu::<Traits>();
            let pool = wait::run_list_accessor(&Traits::state().task_pool);
            pool.push_back(lock.borrow_mut(), cb);
            drop(lock);
            // Safety: the region was leaked from a boxed slice just above
            drop(unsafe {
                Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                    region.base,
                    region.words,
                ))
            });
        }

        result
    }

    /// Put the calling task to sleep for the given number of ticks.
    ///
    /// Returns `Ok` when the deadline expired normally and
    /// `Err(Interrupted)` when a peer aborted the sleep.
    pub fn sleep(ticks: TickCount) -> Result<(), SleepError> {
        if ticks == 0 {
            return Err(SleepError::BadParam);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_no_isr(lock.borrow_mut())?;
        let task = sched::expect_task_context(lock.borrow_mut())?;

        if Traits::state().cpu_current().sched_lock.get(&*lock) > 0 {
            return Err(SleepError::SchedulerLocked);
        }

        task.state.replace(&mut *lock, TaskState::Sleep);
        task.wake_reason.replace(&mut *lock, WakeReason::Finish);
        tick::tick_list_insert(lock.borrow_mut(), task, ticks);
        Traits::state().ready_queue.remove(lock.borrow_mut(), task);

        Traits::trace(trace::Event::TaskSleep { task, ticks });

        sched::critical_exit_sched(lock);

        // The task was rescheduled; report why it woke up
        let mut lock = klock::relock_cpu::<Traits>();
        let reason = wait::pend_end(lock.borrow_mut(), task);
        drop(lock);

        match reason {
            Err(WakeError::Timeout) => Ok(()),
            Err(WakeError::Interrupted) => Err(SleepError::Interrupted),
            // A sleeping task pends on no object, so neither a normal wake
            // nor an object deletion can end the wait
            Ok(()) | Err(WakeError::Deleted) => unreachable!(),
        }
    }

    /// Rotate the calling task to the tail of its priority level and
    /// reschedule.
    pub fn yield_now() {
        let Ok(mut lock) = klock::lock_cpu::<Traits>() else { return };

        if let Some(task) = Traits::state().cpu_current().active.get(&*lock) {
            let prio = task.prio.get(&*lock);
            Traits::state().ready_queue.rotate(lock.borrow_mut(), prio);
        }

        sched::critical_exit_sched(lock);
    }

    /// Suspend the task. Nests: the task becomes runnable again after a
    /// matching number of [`Self::resume`] calls.
    pub fn suspend(self) -> Result<(), SuspendTaskError> {
        let cb = self.0;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let pc = Traits::state().cpu_current();

        if cb.prio.get(&*lock) == idle_priority::<Traits>() {
            return Err(SuspendTaskError::Forbidden);
        }

        if Traits::NUM_CPUS > 1
            && cb.cpu.get(&*lock) as usize != Traits::cpu_current()
            && cb.cur_exc.get(&*lock)
        {
            return Err(SuspendTaskError::Busy);
        }

        if ptr_from_option_ref(pc.active.get(&*lock)) == cb as *const _
            && pc.sched_lock.get(&*lock) > 0
        {
            return Err(SuspendTaskError::SchedulerLocked);
        }

        match cb.state.get(&*lock) {
            TaskState::Ready => {
                cb.suspend_count.replace(&mut *lock, 1);
                cb.state.replace(&mut *lock, TaskState::Suspended);
                Traits::state().ready_queue.remove(lock.borrow_mut(), cb);
            }
            TaskState::Sleep => {
                cb.suspend_count.replace(&mut *lock, 1);
                cb.state.replace(&mut *lock, TaskState::SleepSuspended);
            }
            TaskState::Pend => {
                cb.suspend_count.replace(&mut *lock, 1);
                cb.state.replace(&mut *lock, TaskState::PendSuspended);
            }
            TaskState::Suspended | TaskState::SleepSuspended | TaskState::PendSuspended => {
                let count = cb.suspend_count.get(&*lock);
                if count == u8::MAX {
                    return Err(SuspendTaskError::SuspendCountOverflow);
                }
                cb.suspend_count.replace(&mut *lock, count + 1);
            }
            TaskState::Seed | TaskState::Deleted => {
                return Err(SuspendTaskError::BadObjectState);
            }
        }

        Traits::trace(trace::Event::TaskSuspend { task: cb });

        sched::critical_exit_sched(lock);
        Ok(())
    }

    /// Undo one [`Self::suspend`]. The last resume returns the task to the
    /// state it was suspended in.
    pub fn resume(self) -> Result<(), ResumeTaskError> {
        let cb = self.0;
        let mut lock = klock::lock_cpu::<Traits>()?;

        match cb.state.get(&*lock) {
            TaskState::Ready | TaskState::Sleep | TaskState::Pend => {
                return Err(ResumeTaskError::NotSuspended);
            }
            TaskState::Suspended => {
                let count = cb.suspend_count.get(&*lock) - 1;
                cb.suspend_count.replace(&mut *lock, count);
                if count == 0 {
                    cb.state.replace(&mut *lock, TaskState::Ready);
                    Traits::state().ready_queue.add(lock.borrow_mut(), cb);
                }
            }
            TaskState::SleepSuspended => {
                let count = cb.suspend_count.get(&*lock) - 1;
                cb.suspend_count.replace(&mut *lock, count);
                if count == 0 {
                    cb.state.replace(&mut *lock, TaskState::Sleep);
                }
            }
            TaskState::PendSuspended => {
                let count = cb.suspend_count.get(&*lock) - 1;
                cb.suspend_count.replace(&mut *lock, count);
                if count == 0 {
                    cb.state.replace(&mut *lock, TaskState::Pend);
                }
            }
            TaskState::Seed | TaskState::Deleted => {
                return Err(ResumeTaskError::BadObjectState);
            }
        }

        Traits::trace(trace::Event::TaskResume { task: cb });

        sched::critical_exit_sched(lock);
        Ok(())
    }

    /// Wake the task out of any wait with the `Interrupted` reason. A
    /// suspended task is released back to the ready queue.
    pub fn wait_abort(self) -> Result<(), WaitAbortError> {
        let cb = self.0;
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_no_isr(lock.borrow_mut())?;

        match cb.state.get(&*lock) {
            TaskState::Ready => {}
            TaskState::Suspended => {
                cb.state.replace(&mut *lock, TaskState::Ready);
                Traits::state().ready_queue.add(lock.borrow_mut(), cb);
            }
            TaskState::Sleep | TaskState::SleepSuspended => {
                tick::tick_list_rm(lock.borrow_mut(), cb);
                cb.state.replace(&mut *lock, TaskState::Ready);
                cb.wake_reason.replace(&mut *lock, WakeReason::Abort);
                Traits::state().ready_queue.add(lock.borrow_mut(), cb);
            }
            TaskState::Pend | TaskState::PendSuspended => {
                tick::tick_list_rm(lock.borrow_mut(), cb);
                wait::pend_list_rm(lock.borrow_mut(), cb);
                cb.state.replace(&mut *lock, TaskState::Ready);
                cb.wake_reason.replace(&mut *lock, WakeReason::Abort);
                Traits::state().ready_queue.add(lock.borrow_mut(), cb);
            }
            TaskState::Seed | TaskState::Deleted => {
                return Err(WaitAbortError::BadObjectState);
            }
        }

        Traits::trace(trace::Event::TaskWaitAbort { task: cb });

        sched::critical_exit_sched(lock);
        Ok(())
    }

    /// Change the task's base priority, returning the previous effective
    /// priority.
    ///
    /// A holder of contended mutexes cannot drop below its highest waiter;
    /// the effective priority is clamped accordingly and restored when the
    /// mutexes are released.
    pub fn set_priority(self, priority: u8) -> Result<u8, SetPriorityError> {
        let cb = self.0;

        if priority as usize >= Traits::NUM_PRIORITY_LEVELS {
            return Err(SetPriorityError::PriorityTooHigh);
        }
        let priority = Priority::new(priority);

        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_no_isr(lock.borrow_mut())?;

        // Neither the idle task nor a move into the idle level is allowed
        if cb.prio.get(&*lock) == idle_priority::<Traits>()
            || priority == idle_priority::<Traits>()
        {
            return Err(SetPriorityError::Forbidden);
        }

        match cb.state.get(&*lock) {
            TaskState::Seed | TaskState::Deleted => {
                return Err(SetPriorityError::BadObjectState);
            }
            _ => {}
        }

        // A mutex holder must stay at least as high as its best waiter
        let limit = crate::mutex::mutex_pri_limit(lock.borrow_mut(), cb, priority);
        cb.base_prio.replace(&mut *lock, priority);
        let old = cb.prio.get(&*lock);

        task_pri_change(lock.borrow_mut(), cb, limit);

        Traits::trace(trace::Event::TaskPriChange {
            task: cb,
            new: limit,
        });

        sched::critical_exit_sched(lock);
        Ok(old.get())
    }

    /// Set the task's round-robin time slice in ticks; zero selects the
    /// configured default.
    pub fn set_time_slice(self, slice: u32) -> Result<(), SetSchedParamError> {
        let cb = self.0;
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_no_isr(lock.borrow_mut())?;

        let total = if slice > 0 {
            slice
        } else {
            Traits::TIME_SLICE_DEFAULT
        };
        cb.time_total.replace(&mut *lock, total);
        cb.time_slice.replace(&mut *lock, total);
        Ok(())
    }

    /// Set the task's scheduling policy.
    pub fn set_sched_policy(self, policy: SchedPolicy) -> Result<(), SetSchedParamError> {
        let cb = self.0;
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_no_isr(lock.borrow_mut())?;
        cb.policy.replace(&mut *lock, policy);
        Ok(())
    }

    /// Get the task's scheduling policy.
    pub fn sched_policy(self) -> Result<SchedPolicy, SetSchedParamError> {
        let cb = self.0;
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(cb.policy.get(&*lock))
    }

    /// Bind the calling task to the given processor. Only a task may bind
    /// itself.
    pub fn bind_cpu(self, cpu: usize) -> Result<(), crate::error::BindTaskError> {
        use crate::error::BindTaskError;

        let cb = self.0;
        if cpu >= Traits::NUM_CPUS {
            return Err(BindTaskError::BadParam);
        }

        let mut lock = klock::lock_cpu::<Traits>()?;
        let active = Traits::state().cpu_current().active.get(&*lock);
        if ptr_from_option_ref(active) != cb as *const _ {
            return Err(BindTaskError::BadParam);
        }

        cb.cpu.replace(&mut *lock, cpu as u8);
        cb.cpu_bound.replace(&mut *lock, true);
        sched::critical_exit_sched(lock);
        Ok(())
    }

    /// Remove the calling task's processor binding.
    pub fn unbind_cpu(self) -> Result<(), crate::error::BindTaskError> {
        use crate::error::BindTaskError;

        let cb = self.0;
        let mut lock = klock::lock_cpu::<Traits>()?;
        let active = Traits::state().cpu_current().active.get(&*lock);
        if ptr_from_option_ref(active) != cb as *const _ {
            return Err(BindTaskError::BadParam);
        }

        cb.cpu_bound.replace(&mut *lock, false);
        sched::critical_exit_sched(lock);
        Ok(())
    }

    /// The number of stack words that were never written, measured from the
    /// sentinel end. The stack is zero-filled at creation, so this is a
    /// high-water estimate.
    pub fn stack_min_free(self) -> Result<usize, StackProbeError> {
        let cb = self.0;
        {
            let lock = klock::relock_cpu::<Traits>();
            if cb.state.get(&*lock) == TaskState::Deleted {
                return Err(StackProbeError::BadObjectState);
            }
        }

        // Safety: the control block was created, or the state check above
        // would have failed
        let stack = unsafe { cb.attr() }.stack;
        let mut free = 0;
        // Skip the sentinel word itself
        if Traits::STACK_GROWS_DOWN {
            for i in 1..stack.words {
                // Safety: in-bounds read of the task's stack region
                if unsafe { stack.base.add(i).read_volatile() } != 0 {
                    break;
                }
                free += 1;
            }
        } else {
            for i in (0..stack.words - 1).rev() {
                // Safety: in-bounds read of the task's stack region
                if unsafe { stack.base.add(i).read_volatile() } != 0 {
                    break;
                }
                free += 1;
            }
        }
        Ok(free)
    }

    /// Delete the task: release every mutex it holds (waking their next
    /// waiters), remove it from any list, and mark it `Deleted`.
    pub fn delete(self) -> Result<(), DeleteTaskError> {
        delete_task(self.0, AllocKind::Static)
    }

    /// Delete a dynamically created task and hand its resources to the
    /// reaper for reclamation.
    #[cfg(feature = "dyn_alloc")]
    pub fn delete_dyn(self) -> Result<(), DeleteTaskError> {
        delete_task(self.0, AllocKind::Dynamic)
    }
}

/// The shared part of `create` and `create_dyn`.
fn create_task<Traits: KernelTraits>(
    cb: &'static TaskCb<Traits>,
    name: &'static str,
    entry: fn(usize),
    param: usize,
    priority: u8,
    time_slice: u32,
    stack: StackRegion,
    options: TaskOptions,
    cpu: Option<usize>,
    alloc_kind: AllocKind,
) -> Result<Task<Traits>, CreateTaskError> {
    if stack.words == 0 {
        return Err(CreateTaskError::StackTooSmall);
    }
    if priority as usize >= Traits::NUM_PRIORITY_LEVELS {
        return Err(CreateTaskError::PriorityTooHigh);
    }
    if let Some(cpu) = cpu {
        if cpu >= Traits::NUM_CPUS {
            return Err(CreateTaskError::BadParam);
        }
    }
    let target_cpu = cpu.unwrap_or(0);

    {
        let mut lock = klock::lock_cpu::<Traits>()?;
        sched::expect_no_isr(lock.borrow_mut())?;

        // The idle level takes a single task per processor
        if priority as usize == Traits::NUM_PRIORITY_LEVELS - 1 {
            let pc = Traits::state().cpu(target_cpu);
            if pc.idle_spawned.get(&*lock) {
                return Err(CreateTaskError::IdleTaskExists);
            }
            pc.idle_spawned.replace(&mut *lock, true);
        }
    }

    // Safety: the control block is not yet visible to the scheduler, so
    // the kernel owns it and its stack exclusively
    unsafe {
        *cb.attr.get() = TaskAttr {
            name,
            entry,
            param,
            stack,
        };
        core::ptr::write_bytes(stack.base, 0, stack.words);
        if Traits::STACK_GROWS_DOWN {
            *stack.base = STACK_SENTINEL;
        } else {
            *stack.base.add(stack.words - 1) = STACK_SENTINEL;
        }
    }

    let mut lock = klock::relock_cpu::<Traits>();

    cb.prio.replace(&mut *lock, Priority::new(priority));
    cb.base_prio.replace(&mut *lock, Priority::new(priority));
    cb.policy.replace(&mut *lock, SchedPolicy::RoundRobin);
    let total = if time_slice > 0 {
        time_slice
    } else {
        Traits::TIME_SLICE_DEFAULT
    };
    cb.time_total.replace(&mut *lock, total);
    cb.time_slice.replace(&mut *lock, total);
    cb.wake_reason.replace(&mut *lock, WakeReason::Finish);
    cb.blk_on.replace(&mut *lock, None);
    cb.run_link.replace(&mut *lock, None);
    cb.tick_link.replace(&mut *lock, None);
    cb.tick_match.replace(&mut *lock, 0);
    cb.mutex_list.replace(&mut *lock, None);
    cb.msg.replace(&mut *lock, RawMessage::NULL);
    cb.cpu.replace(&mut *lock, target_cpu as u8);
    cb.cpu_bound.replace(&mut *lock, cpu.is_some());
    cb.cur_exc.replace(&mut *lock, false);
    cb.alloc_kind.replace(&mut *lock, alloc_kind);

    if options.contains(TaskOptions::AUTO_START) {
        cb.state.replace(&mut *lock, TaskState::Ready);
        cb.suspend_count.replace(&mut *lock, 0);
    } else {
        cb.state.replace(&mut *lock, TaskState::Suspended);
        cb.suspend_count.replace(&mut *lock, 1);
    }

    #[cfg(feature = "system_stats")]
    {
        let registry = wait::registry_task_accessor(&Traits::state().registry.tasks);
        registry.push_back(lock.borrow_mut(), cb);
    }

    // Safety: CPU Lock active, the task has never run
    unsafe { Traits::initialize_task_state(cb) };

    Traits::trace(trace::Event::TaskCreate { task: cb });

    if options.contains(TaskOptions::AUTO_START) {
        Traits::state().ready_queue.add_tail(lock.borrow_mut(), cb);
        if Traits::state().started.get(&*lock) {
            sched::critical_exit_sched(lock);
            return Ok(Task(cb));
        }
    }

    Ok(Task(cb))
}

/// The shared part of `delete` and `delete_dyn`.
fn delete_task<Traits: KernelTraits>(
    cb: &'static TaskCb<Traits>,
    expected_kind: AllocKind,
) -> Result<(), DeleteTaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    sched::expect_no_isr(lock.borrow_mut())?;
    let pc = Traits::state().cpu_current();

    if cb.prio.get(&*lock) == idle_priority::<Traits>() {
        return Err(DeleteTaskError::Forbidden);
    }
    if cb.alloc_kind.get(&*lock) != expected_kind {
        return Err(DeleteTaskError::BadKind);
    }
    if Traits::NUM_CPUS > 1
        && cb.cpu.get(&*lock) as usize != Traits::cpu_current()
        && cb.cur_exc.get(&*lock)
    {
        return Err(DeleteTaskError::Busy);
    }
    if ptr_from_option_ref(pc.active.get(&*lock)) == cb as *const _
        && pc.sched_lock.get(&*lock) > 0
    {
        return Err(DeleteTaskError::SchedulerLocked);
    }

    // Hand every held mutex to its next waiter
    crate::mutex::release_all_held(lock.borrow_mut(), cb);

    match cb.state.get(&*lock) {
        TaskState::Ready => {
            Traits::state().ready_queue.remove(lock.borrow_mut(), cb);
        }
        TaskState::Suspended => {}
        TaskState::Sleep | TaskState::SleepSuspended => {
            tick::tick_list_rm(lock.borrow_mut(), cb);
        }
        TaskState::Pend | TaskState::PendSuspended => {
            tick::tick_list_rm(lock.borrow_mut(), cb);
            wait::pend_list_rm(lock.borrow_mut(), cb);
        }
        TaskState::Seed | TaskState::Deleted => {
            return Err(DeleteTaskError::BadObjectState);
        }
    }
    cb.state.replace(&mut *lock, TaskState::Deleted);

    #[cfg(feature = "system_stats")]
    {
        let registry = wait::registry_task_accessor(&Traits::state().registry.tasks);
        registry.remove(lock.borrow_mut(), cb);
    }

    Traits::trace(trace::Event::TaskDel { task: cb });

    #[cfg(feature = "dyn_alloc")]
    if expected_kind == AllocKind::Dynamic {
        // Queue the task for reclamation and poke the reaper. The
        // scheduler lock spans the semaphore signal so the reaper (which
        // may outrank us) cannot run before the bookkeeping is complete.
        let dead = wait::run_list_accessor(&Traits::state().dead_tasks);
        dead.push_back(lock.borrow_mut(), cb);

        let pc = Traits::state().cpu_current();
        let count = pc.sched_lock.get(&*lock);
        pc.sched_lock.replace(&mut *lock, count + 1);
        let _ = crate::semaphore::signal_locked(
            lock.borrow_mut(),
            &Traits::reaper_globals().sem,
            false,
        );
        pc.sched_lock.replace(&mut *lock, count);
    }

    sched::critical_exit_sched(lock);
    Ok(())
}

/// Change a task's effective priority, maintaining its position in the
/// ready queue or pend list, and propagate the change along the chain of
/// mutex holders.
///
/// If the target is pending on a mutex, reordering its pend list can change
/// what the mutex's holder's priority must be; the walk continues with the
/// holder until a task absorbs the change.
pub(crate) fn task_pri_change<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static TaskCb<Traits>,
    new_pri: Priority,
) {
    let mut task = Some(task);
    let mut new_pri = new_pri;

    while let Some(cur) = task {
        if cur.prio.get(&*lock) == new_pri {
            break;
        }

        match cur.state.get(&*lock) {
            TaskState::Ready => {
                let rq = &Traits::state().ready_queue;
                let old_pri = cur.prio.get(&*lock);
                rq.remove(lock.borrow_mut(), cur);
                cur.prio.replace(&mut *lock, new_pri);

                // A running task keeps the head of its level while being
                // raised, but a demotion re-queues it at the tail of the
                // new level so that peers already waiting there run first
                let active = Traits::state().cpu_current().active.get(&*lock);
                if ptr_from_option_ref(active) == cur as *const _
                    && new_pri.is_higher_than(old_pri)
                {
                    rq.add_head(lock.borrow_mut(), cur);
                } else {
                    rq.add_tail(lock.borrow_mut(), cur);
                }
                task = None;
            }
            TaskState::Sleep
            | TaskState::Suspended
            | TaskState::SleepSuspended => {
                cur.prio.replace(&mut *lock, new_pri);
                task = None;
            }
            TaskState::Pend | TaskState::PendSuspended => {
                let old_pri = cur.prio.get(&*lock);
                cur.prio.replace(&mut *lock, new_pri);
                wait::pend_list_reorder(lock.borrow_mut(), cur);

                if let Some(BlkSource::Mutex(mutex)) = cur.blk_on.get(&*lock) {
                    let holder = mutex
                        .holder
                        .get(&*lock)
                        .expect("contended mutex without holder");

                    if cur.prio.get(&*lock).is_higher_than(holder.prio.get(&*lock)) {
                        // The best waiter got better; the inheritance must
                        // follow the holder chain
                        task = Some(holder);
                    } else if holder.prio.get(&*lock) == old_pri {
                        // The holder's priority may have been defined by
                        // this waiter; recompute it from scratch
                        let np = crate::mutex::mutex_pri_look(lock.borrow_mut(), holder, None);
                        if np != holder.prio.get(&*lock) {
                            task = Some(holder);
                            new_pri = np;
                        } else {
                            task = None;
                        }
                    } else {
                        task = None;
                    }
                } else {
                    task = None;
                }
            }
            TaskState::Seed | TaskState::Deleted => {
                debug_assert!(false, "priority change on a dead task");
                task = None;
            }
        }
    }
}

/// The routine a task lands in when it returns from its entry function:
/// self-deletion through the path matching the task's allocation kind.
pub fn task_deathbed<Traits: KernelTraits>() -> ! {
    let mut lock = klock::relock_cpu::<Traits>();
    let task = Traits::state()
        .cpu_current()
        .active
        .get(&*lock)
        .expect("deathbed outside a task");

    // Hand every held mutex to its next waiter
    crate::mutex::release_all_held(lock.borrow_mut(), task);

    Traits::state().ready_queue.remove(lock.borrow_mut(), task);
    task.state.replace(&mut *lock, TaskState::Deleted);

    #[cfg(feature = "system_stats")]
    {
        let registry = wait::registry_task_accessor(&Traits::state().registry.tasks);
        registry.remove(lock.borrow_mut(), task);
    }

    Traits::trace(trace::Event::TaskDel { task });

    #[cfg(feature = "dyn_alloc")]
    if task.alloc_kind.get(&*lock) == AllocKind::Dynamic {
        let dead = wait::run_list_accessor(&Traits::state().dead_tasks);
        dead.push_back(lock.borrow_mut(), task);
        let _ = crate::semaphore::signal_locked(
            lock.borrow_mut(),
            &Traits::reaper_globals().sem,
            false,
        );
    }

    if task.prio.get(&*lock) == idle_priority::<Traits>() {
        let pc = Traits::state().cpu(task.cpu.get(&*lock) as usize);
        pc.idle_spawned.replace(&mut *lock, false);
    }

    sched::core_sched(lock.borrow_mut());
    core::mem::forget(lock);

    // Safety: CPU Lock active, and we are running in `task`'s context
    unsafe { Traits::exit_and_dispatch(task) }
}

/// The statics backing the reaper task, instantiated by the `build!` macro.
#[cfg(feature = "dyn_alloc")]
pub struct ReaperGlobals<Traits: KernelTraits> {
    pub(crate) task: TaskCb<Traits>,
    pub(crate) sem: crate::semaphore::SemaphoreCb<Traits>,
}

#[cfg(feature = "dyn_alloc")]
impl<Traits: KernelTraits> Init for ReaperGlobals<Traits> {
    const INIT: Self = Self {
        task: Init::INIT,
        sem: Init::INIT,
    };
}

/// Reclaim the resources of dead dynamic tasks: the stack is freed and the
/// control block is recycled into the creation pool. A task cannot free its
/// own stack while running on it, which is why this runs in a dedicated
/// task at the best priority.
#[cfg(feature = "dyn_alloc")]
fn reaper_entry<Traits: KernelTraits>(_: usize) {
    use alloc::boxed::Box;

    let sem = crate::semaphore::Semaphore::from_cb(&Traits::reaper_globals().sem);

    loop {
        if sem.take(crate::Timeout::Forever).is_err() {
            continue;
        }

        loop {
            let dead = {
                let mut lock = klock::relock_cpu::<Traits>();
                let list = wait::run_list_accessor(&Traits::state().dead_tasks);
                list.pop_front(lock.borrow_mut())
            };
            let Some(dead) = dead else { break };

            // Safety: the task was fully created; its stack was leaked from
            // a boxed slice by `create_dyn` and nothing points into it now
            let stack = unsafe { dead.attr() }.stack;
            drop(unsafe {
                Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                    stack.base,
                    stack.words,
                ))
            });

            let mut lock = klock::relock_cpu::<Traits>();
            let pool = wait::run_list_accessor(&Traits::state().task_pool);
            pool.push_back(lock.borrow_mut(), dead);
        }
    }
}

/// Spawn the reaper task. Called once during `PortToKernel::boot`.
#[cfg(feature = "dyn_alloc")]
pub(crate) fn reaper_init<Traits: KernelTraits>() {
    let globals = Traits::reaper_globals();

    crate::semaphore::Semaphore::create(&globals.sem, "reaper_sem", 0);

    create_task(
        &globals.task,
        "reaper_task",
        reaper_entry::<Traits>,
        0,
        0,
        0,
        Traits::reaper_task_stack(),
        TaskOptions::AUTO_START,
        None,
        AllocKind::Static,
    )
    .expect("reaper task creation failed");
}

#[cfg(test)]
mod tests {
    /// `suspend` repeated k times requires `resume` k times to make the
    /// task runnable again.
    mod suspend_resume_nesting {
        use crate::error::ResumeTaskError;
        use crate::klock;
        use crate::task::{Task, TaskCb, TaskOptions, TaskState, TaskStack};
        use crate::test_utils::kick;
        use crate::utils::Init;

        mock_kernel!(struct K, cpus: 1);

        static T1_CB: TaskCb<K> = Init::INIT;
        static T1_STACK: TaskStack<64> = TaskStack::new();
        static T2_CB: TaskCb<K> = Init::INIT;
        static T2_STACK: TaskStack<64> = TaskStack::new();

        fn body(_: usize) {}

        #[test]
        fn scenario() {
            Task::create(&T1_CB, "T1", body, 0, 3, 0, &T1_STACK, TaskOptions::AUTO_START, None)
                .unwrap();
            let t2 = Task::create(
                &T2_CB, "T2", body, 0, 4, 0, &T2_STACK, TaskOptions::AUTO_START, None,
            )
            .unwrap();
            kick::<K>();

            for _ in 0..3 {
                t2.suspend().unwrap();
            }
            {
                let lock = klock::relock_cpu::<K>();
                assert_eq!(T2_CB.state.get(&*lock), TaskState::Suspended);
                assert_eq!(T2_CB.suspend_count.get(&*lock), 3);
            }

            t2.resume().unwrap();
            t2.resume().unwrap();
            {
                let lock = klock::relock_cpu::<K>();
                assert_eq!(T2_CB.state.get(&*lock), TaskState::Suspended);
            }

            t2.resume().unwrap();
            {
                let lock = klock::relock_cpu::<K>();
                assert_eq!(T2_CB.state.get(&*lock), TaskState::Ready);
            }
            assert_eq!(t2.resume(), Err(ResumeTaskError::NotSuspended));
        }
    }

    /// The idle level admits a single task per processor, and priorities
    /// beyond the configured range are rejected.
    mod creation_limits {
        use crate::error::CreateTaskError;
        use crate::task::{Task, TaskCb, TaskOptions, TaskStack};
        use crate::utils::Init;

        mock_kernel!(struct K, cpus: 1);

        static IDLE1_CB: TaskCb<K> = Init::INIT;
        static IDLE1_STACK: TaskStack<64> = TaskStack::new();
        static IDLE2_CB: TaskCb<K> = Init::INIT;
        static IDLE2_STACK: TaskStack<64> = TaskStack::new();

        fn body(_: usize) {}

        #[test]
        fn scenario() {
            assert_eq!(
                Task::create(
                    &IDLE1_CB, "bad", body, 0, 16, 0, &IDLE1_STACK,
                    TaskOptions::AUTO_START, None,
                )
                .err(),
                Some(CreateTaskError::PriorityTooHigh)
            );

            Task::create(
                &IDLE1_CB, "idle", body, 0, 15, 0, &IDLE1_STACK,
                TaskOptions::AUTO_START, None,
            )
            .unwrap();
            assert_eq!(
                Task::create(
                    &IDLE2_CB, "idle2", body, 0, 15, 0, &IDLE2_STACK,
                    TaskOptions::AUTO_START, None,
                )
                .err(),
                Some(CreateTaskError::IdleTaskExists)
            );
        }
    }

    /// Changing a ready task's priority moves it between priority levels
    /// and updates the bitmap and cached best priority.
    mod priority_change_requeues {
        use crate::klock;
        use crate::task::readyqueue::Queue as _;
        use crate::task::{Priority, Task, TaskCb, TaskOptions, TaskStack};
        use crate::test_utils::kick;
        use crate::utils::Init;
        use crate::KernelCfg;

        mock_kernel!(struct K, cpus: 1);

        static T1_CB: TaskCb<K> = Init::INIT;
        static T1_STACK: TaskStack<64> = TaskStack::new();
        static T2_CB: TaskCb<K> = Init::INIT;
        static T2_STACK: TaskStack<64> = TaskStack::new();

        fn body(_: usize) {}

        #[test]
        fn scenario() {
            Task::create(&T1_CB, "T1", body, 0, 5, 0, &T1_STACK, TaskOptions::AUTO_START, None)
                .unwrap();
            let t2 = Task::create(
                &T2_CB, "T2", body, 0, 8, 0, &T2_STACK, TaskOptions::AUTO_START, None,
            )
            .unwrap();
            kick::<K>();

            let old = t2.set_priority(3).unwrap();
            assert_eq!(old, 8);

            let mut lock = klock::relock_cpu::<K>();
            let rq = &K::state().ready_queue;
            assert_eq!(rq.highest_priority(lock.borrow_mut()), 3);
            assert!(crate::task::ptr_eq_opt(
                rq.front_of(lock.borrow_mut(), Priority::new(3)),
                Some(&T2_CB),
            ));
            assert!(rq.front_of(lock.borrow_mut(), Priority::new(8)).is_none());
        }
    }
}
