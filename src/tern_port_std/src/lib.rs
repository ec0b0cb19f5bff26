//! Simulation environment for running the Tern kernel on a hosted target.
//!
//! Each task is backed by an OS thread, but the port serializes them so
//! that — like on the real single-processor target — at most one task
//! executes at a time: a thread runs only while its task is the committed
//! active task and parks inside the port otherwise. The CPU Lock is a real
//! mutual exclusion, so a test-controlled thread may call kernel APIs (and
//! deliver tick interrupts) concurrently with running tasks.
//!
//! # Driving time
//!
//! There is no free-running timer. Tests deliver tick interrupts explicitly
//! with [`advance_time`] and synchronize on quiescence with
//! [`wait_until_idle`], which makes every scenario deterministic.
use std::cell::Cell;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;

use once_cell::sync::Lazy;
use slab::Slab;
use spin::Mutex as SpinMutex;
use tern_kernel::task::{task_deathbed, TaskCb};
use tern_kernel::utils::Init;
use tern_kernel::{KernelTraits, PortToKernel, PortThreading};

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    KernelTraits + PortThreading<PortTaskState = TaskState>
{
    fn port_state() -> &'static State;
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    /// The test-controlled thread that boots the kernel and delivers
    /// interrupts.
    Boot,
    /// The backing thread for a task.
    Task,
}

thread_local! {
    /// The current thread's role. Assigned when the thread first interacts
    /// with the port.
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);

    /// The worker key of the current thread, if it backs a task.
    static WORKER_ID: Cell<Option<usize>> = Cell::new(None);
}

/// The panic payload used to unwind a task thread out of
/// `exit_and_dispatch`.
struct ExitToken;

/// Task state machine
///
/// These don't exactly align with the task states defined in the kernel.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Tsm {
    /// The task's context state is not initialized.
    Uninit,
    /// The task's context state is initialized but hasn't started running.
    Dormant,
    /// The task is backed by the worker thread with the given key.
    Running(usize),
}

/// The port-specific per-task state.
#[derive(Debug)]
pub struct TaskState {
    /// This field is expected to be accessed with the CPU Lock or the port
    /// scheduler lock held, so `SpinMutex` is sufficient. The runtime
    /// performance is not a concern in `tern_port_std`.
    tsm: SpinMutex<Tsm>,
}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            tsm: SpinMutex::new(Tsm::Uninit),
        }
    }
}

impl Init for TaskState {
    const INIT: Self = Self::new();
}

struct Worker {
    recycled: bool,
    /// Whether the backing thread is parked in the port waiting to become
    /// the active task again. Only a parked worker is at a safe point for
    /// a context switch performed by another thread.
    parked: bool,
}

struct SchedCore {
    /// Whether some context holds the CPU Lock.
    cpu_lock: bool,
    /// The thread holding the CPU Lock; used to detect re-entry.
    cpu_lock_owner: Option<thread::ThreadId>,
    /// A context switch was requested and will be performed at the next
    /// CPU Lock release.
    dispatch_pending: bool,
    /// The worker whose task is the committed active task.
    current: Option<usize>,
    workers: Slab<Worker>,
}

/// The internal state of the port.
pub struct State {
    sched: Lazy<Mutex<SchedCore>>,
    cv: Condvar,
    /// Mirror of `SchedCore::cpu_lock` readable without the mutex.
    cpu_lock_flag: AtomicBool,
}

fn sched_core_init() -> Mutex<SchedCore> {
    Mutex::new(SchedCore {
        cpu_lock: false,
        cpu_lock_owner: None,
        dispatch_pending: false,
        current: None,
        workers: Slab::new(),
    })
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            sched: Lazy::new(sched_core_init),
            cv: Condvar::new(),
            cpu_lock_flag: AtomicBool::new(false),
        }
    }

    pub unsafe fn enter_cpu_lock<Traits: PortInstance>(&'static self) {
        assert!(self.try_enter_cpu_lock_inner(), "CPU Lock is already held by this context");
    }

    pub unsafe fn try_enter_cpu_lock<Traits: PortInstance>(&'static self) -> bool {
        self.try_enter_cpu_lock_inner()
    }

    /// Block until the CPU Lock is available and take it. Returns `false`
    /// iff the calling thread already holds it.
    fn try_enter_cpu_lock_inner(&'static self) -> bool {
        let mut sched = self.sched.lock().unwrap();
        loop {
            if !sched.cpu_lock {
                sched.cpu_lock = true;
                sched.cpu_lock_owner = Some(thread::current().id());
                self.cpu_lock_flag.store(true, Ordering::Release);
                log::trace!("enter_cpu_lock");
                return true;
            }
            if sched.cpu_lock_owner == Some(thread::current().id()) {
                return false;
            }
            sched = self.cv.wait(sched).unwrap();
        }
    }

    pub unsafe fn leave_cpu_lock<Traits: PortInstance>(&'static self) {
        let mut sched = self.sched.lock().unwrap();
        debug_assert!(sched.cpu_lock);
        debug_assert_eq!(sched.cpu_lock_owner, Some(thread::current().id()));

        if sched.dispatch_pending && self.switch_is_safe(&sched) {
            sched.dispatch_pending = false;
            // Safety: the CPU Lock is still held while we commit
            unsafe { self.dispatch::<Traits>(&mut sched) };
        }

        sched.cpu_lock = false;
        sched.cpu_lock_owner = None;
        self.cpu_lock_flag.store(false, Ordering::Release);
        log::trace!("leave_cpu_lock");
        self.cv.notify_all();

        // A task thread whose task lost the processor parks here until the
        // scheduler hands it back
        if THREAD_ROLE.with(|role| role.get()) == ThreadRole::Task {
            let my = WORKER_ID.with(|id| id.get()).unwrap();
            while sched.current != Some(my) && !sched.workers[my].recycled {
                sched.workers[my].parked = true;
                self.cv.notify_all();
                sched = self.cv.wait(sched).unwrap();
            }
            sched.workers[my].parked = false;
        }
    }

    /// A pending switch may only be committed from the outgoing worker's
    /// own thread or while that worker is parked; the real target preempts
    /// with an interrupt, but here the preempted thread must reach a port
    /// call first.
    fn switch_is_safe(&'static self, sched: &SchedCore) -> bool {
        match sched.current {
            None => true,
            Some(cur) => {
                sched.workers[cur].parked || WORKER_ID.with(|id| id.get()) == Some(cur)
            }
        }
    }

    pub fn is_cpu_lock_active<Traits: PortInstance>(&'static self) -> bool {
        self.cpu_lock_flag.load(Ordering::Acquire)
    }

    pub fn is_task_context<Traits: PortInstance>(&'static self) -> bool {
        THREAD_ROLE.with(|role| role.get()) == ThreadRole::Task
    }

    pub unsafe fn initialize_task_state<Traits: PortInstance>(
        &'static self,
        task: &'static TaskCb<Traits>,
    ) {
        log::trace!("initialize_task_state {:p}", task);
        let mut tsm = task.port_task_state.tsm.lock();
        match &*tsm {
            Tsm::Dormant => {}
            _ => {
                *tsm = Tsm::Dormant;
            }
        }
    }

    pub unsafe fn task_switch<Traits: PortInstance>(&'static self) {
        log::trace!("task_switch requested");
        let mut sched = self.sched.lock().unwrap();
        debug_assert!(sched.cpu_lock);
        sched.dispatch_pending = true;
    }

    pub unsafe fn exit_and_dispatch<Traits: PortInstance>(
        &'static self,
        task: &'static TaskCb<Traits>,
    ) -> ! {
        log::trace!("exit_and_dispatch({:p})", task);
        debug_assert_eq!(THREAD_ROLE.with(|role| role.get()), ThreadRole::Task);

        let mut sched = self.sched.lock().unwrap();
        let my = WORKER_ID.with(|id| id.get()).unwrap();
        sched.workers[my].recycled = true;

        if sched.dispatch_pending {
            sched.dispatch_pending = false;
            // Safety: the CPU Lock is still held while we commit
            unsafe { self.dispatch::<Traits>(&mut sched) };
        }

        sched.cpu_lock = false;
        sched.cpu_lock_owner = None;
        self.cpu_lock_flag.store(false, Ordering::Release);
        self.cv.notify_all();
        drop(sched);

        // Unwind the task thread's stack; the worker body catches this
        resume_unwind(Box::new(ExitToken));
    }

    /// Commit the pending context switch and hand the processor to the new
    /// active task's thread, spawning it on first dispatch.
    ///
    /// # Safety
    ///
    /// Must be called with both the scheduler mutex and the CPU Lock held.
    unsafe fn dispatch<Traits: PortInstance>(&'static self, sched: &mut SchedCore) {
        // Safety: the CPU Lock is held per this function's contract
        let next = unsafe { Traits::commit_task_switch(0) };

        sched.current = next.map(|task| {
            let mut tsm = task.port_task_state.tsm.lock();
            match &*tsm {
                Tsm::Running(id) => *id,
                Tsm::Dormant => {
                    let id = sched.workers.insert(Worker {
                        recycled: false,
                        parked: true,
                    });
                    *tsm = Tsm::Running(id);
                    log::trace!("spawning a worker thread for task {:p}", task);
                    thread::spawn(move || worker_body::<Traits>(task, id));
                    id
                }
                Tsm::Uninit => unreachable!("dispatching an uninitialized task"),
            }
        });

        log::trace!("dispatch: current = {:?}", sched.current);
        self.cv.notify_all();
    }
}

fn worker_body<Traits: PortInstance>(task: &'static TaskCb<Traits>, id: usize) {
    THREAD_ROLE.with(|role| role.set(ThreadRole::Task));
    WORKER_ID.with(|cell| cell.set(Some(id)));

    let state = Traits::port_state();

    // Wait until the task is actually dispatched
    {
        let mut sched = state.sched.lock().unwrap();
        while sched.current != Some(id) && !sched.workers[id].recycled {
            sched.workers[id].parked = true;
            state.cv.notify_all();
            sched = state.cv.wait(sched).unwrap();
        }
        if sched.workers[id].recycled {
            sched.workers.remove(id);
            state.cv.notify_all();
            return;
        }
        sched.workers[id].parked = false;
    }

    // Safety: the task was created, or it could not have been dispatched
    let (entry, param) = {
        let attr = unsafe { task.attr() };
        (attr.entry, attr.param)
    };

    log::debug!("task {:p} is now running", task);

    let result = catch_unwind(AssertUnwindSafe(|| {
        entry(param);
        // Returning from the entry function transfers to the deathbed
        task_deathbed::<Traits>()
    }));

    match result {
        Err(payload) if payload.is::<ExitToken>() => {}
        Err(payload) => resume_unwind(payload),
        Ok(never) => never,
    }

    let mut sched = state.sched.lock().unwrap();
    sched.workers.remove(id);
    state.cv.notify_all();
}

/// Boot the kernel: spawn the built-in service tasks and dispatch the first
/// task. Returns once the system is quiescent, with the calling thread
/// established as the test-controlled "interrupt" context.
pub fn boot<Traits: PortInstance>() {
    THREAD_ROLE.with(|role| role.set(ThreadRole::Boot));
    log::trace!("boot");

    // Safety: we are the port
    unsafe { Traits::boot() };

    wait_until_idle::<Traits>();
}

/// Deliver `ticks` timer interrupts back to back.
pub fn advance_time<Traits: PortInstance>(ticks: u64) {
    for _ in 0..ticks {
        // Safety: we are the port; the CPU Lock is not held by this thread
        unsafe { Traits::timer_tick() };
    }
}

/// Block until no task is runnable: every task thread is parked (or
/// finished) and nothing holds the CPU Lock.
pub fn wait_until_idle<Traits: PortInstance>() {
    let state = Traits::port_state();
    let mut sched = state.sched.lock().unwrap();
    while sched.current.is_some() || sched.cpu_lock || sched.dispatch_pending {
        sched = state.cv.wait(sched).unwrap();
    }
}

/// Initialize `env_logger` once for the calling process.
pub fn log_init() {
    static LOGGER: Lazy<()> = Lazy::new(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
    Lazy::force(&LOGGER);
}

/// Define a kernel trait type and implement the port on it.
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::tern_kernel::PortThreading;
            use $crate::{PortInstance, State, TaskState};

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            // Assume `$SystemTraits: KernelCfg`
            unsafe impl PortThreading for $SystemTraits {
                type PortTaskState = TaskState;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_TASK_STATE_INIT: Self::PortTaskState = TaskState::new();

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock::<Self>() }
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_cpu_lock::<Self>() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock::<Self>() }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active::<Self>()
                }

                fn is_task_context() -> bool {
                    PORT_STATE.is_task_context::<Self>()
                }

                fn cpu_current() -> usize {
                    0
                }

                unsafe fn initialize_task_state(
                    task: &'static $crate::tern_kernel::TaskCb<Self>,
                ) {
                    unsafe { PORT_STATE.initialize_task_state::<Self>(task) }
                }

                unsafe fn task_switch() {
                    unsafe { PORT_STATE.task_switch::<Self>() }
                }

                unsafe fn exit_and_dispatch(
                    task: &'static $crate::tern_kernel::TaskCb<Self>,
                ) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch::<Self>(task) }
                }
            }
        }
    };
}

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate tern_kernel;
