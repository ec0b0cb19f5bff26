//! Tracing hooks
//!
//! The kernel reports a fixed set of events through
//! [`PortThreading::trace`](crate::PortThreading::trace). Hooks are
//! side-effect-free observers; the kernel never depends on their output.
use crate::mutex::MutexCb;
use crate::queue::QueueCb;
use crate::semaphore::SemaphoreCb;
use crate::task::{Priority, TaskCb};
use crate::{KernelTraits, Tick};

/// A kernel trace event.
#[non_exhaustive]
pub enum Event<'a, Traits: KernelTraits> {
    TaskCreate {
        task: &'a TaskCb<Traits>,
    },
    TaskDel {
        task: &'a TaskCb<Traits>,
    },
    TaskSwitch {
        from: Option<&'a TaskCb<Traits>>,
        to: Option<&'a TaskCb<Traits>>,
    },
    TaskSleep {
        task: &'a TaskCb<Traits>,
        ticks: Tick,
    },
    TaskSuspend {
        task: &'a TaskCb<Traits>,
    },
    TaskResume {
        task: &'a TaskCb<Traits>,
    },
    TaskWaitAbort {
        task: &'a TaskCb<Traits>,
    },
    TaskPriChange {
        task: &'a TaskCb<Traits>,
        new: Priority,
    },
    /// A priority inversion was detected: `task` outranks the `holder` of
    /// the mutex it is about to block on, so `holder` inherits `task`'s
    /// priority.
    PriInvert {
        task: &'a TaskCb<Traits>,
        holder: &'a TaskCb<Traits>,
    },
    MutexCreate {
        mutex: &'a MutexCb<Traits>,
    },
    MutexGet {
        mutex: &'a MutexCb<Traits>,
        task: &'a TaskCb<Traits>,
    },
    MutexGetBlk {
        mutex: &'a MutexCb<Traits>,
        task: &'a TaskCb<Traits>,
    },
    MutexRelease {
        mutex: &'a MutexCb<Traits>,
        task: &'a TaskCb<Traits>,
    },
    MutexDel {
        mutex: &'a MutexCb<Traits>,
    },
    SemCreate {
        sem: &'a SemaphoreCb<Traits>,
    },
    SemGive {
        sem: &'a SemaphoreCb<Traits>,
    },
    SemGetBlk {
        sem: &'a SemaphoreCb<Traits>,
        task: &'a TaskCb<Traits>,
    },
    SemDel {
        sem: &'a SemaphoreCb<Traits>,
    },
    QueueSend {
        queue: &'a QueueCb<Traits>,
    },
    QueueRecvBlk {
        queue: &'a QueueCb<Traits>,
        task: &'a TaskCb<Traits>,
    },
    #[cfg(feature = "timer")]
    TimerCreate {
        timer: &'a crate::timer::TimerCb<Traits>,
    },
    #[cfg(feature = "timer")]
    TimerFire {
        timer: &'a crate::timer::TimerCb<Traits>,
    },
    #[cfg(feature = "timer")]
    TimerDel {
        timer: &'a crate::timer::TimerCb<Traits>,
    },
    Tick {
        count: Tick,
    },
}
