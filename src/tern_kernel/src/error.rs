//! Error codes
//!
//! Every public operation returns a dedicated error enum listing exactly the
//! codes it can produce. All enums share their discriminants with
//! [`ResultCode`], the kernel-wide code space, so a status can be normalized
//! (e.g. for the fatal-error hook or a trace sink) without losing identity.
use core::fmt;

/// The kernel-wide status code space.
#[repr(i8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ResultCode {
    /// The operation completed successfully.
    Success = 0,
    /// The object-type tag did not match, typically because the object was
    /// deleted or never created.
    BadId = -1,
    /// The operation is not valid for the object's allocation kind
    /// (static vs. dynamic).
    BadKind = -2,
    /// The operation was called from a context that cannot block
    /// (interrupt handler or non-task context).
    BadContext = -3,
    /// The scheduler is locked, so the caller cannot lose the CPU.
    SchedulerLocked = -4,
    /// A parameter was out of range or otherwise invalid.
    BadParam = -5,
    /// The requested scheduling policy does not exist.
    BadPolicy = -6,
    /// The requested priority is beyond the configured maximum.
    PriorityTooHigh = -7,
    /// The supplied stack is empty or too small.
    StackTooSmall = -8,
    /// An idle-priority task already exists on the target processor.
    IdleTaskExists = -9,
    /// The task is in a state that does not permit the operation.
    BadObjectState = -10,
    /// The task is not suspended.
    NotSuspended = -11,
    /// The mutex is not held by the caller.
    NotOwner = -12,
    /// Tasks are waiting on the semaphore.
    TasksWaiting = -13,
    /// The operation is never permitted on this object (e.g. the idle task).
    Forbidden = -14,
    /// The resource was unavailable and no waiting was requested.
    WouldBlock = -15,
    /// The wait ended because the deadline was reached.
    Timeout = -16,
    /// The wait was aborted by another task.
    Interrupted = -17,
    /// The wait ended because the waited-on object was deleted.
    Deleted = -18,
    /// Allocation from the kernel heap failed.
    NoMemory = -19,
    /// The message queue is full.
    QueueFull = -20,
    /// The semaphore count is saturated.
    Overflow = -21,
    /// The mutex owner-nesting counter is saturated.
    NestingOverflow = -22,
    /// The scheduler-lock counter is saturated.
    LockCountOverflow = -23,
    /// The suspension counter is saturated.
    SuspendCountOverflow = -24,
    /// The scheduler is not locked.
    AlreadyEnabled = -25,
    /// The object is transiently busy; retry later.
    Busy = -26,
    /// An unrecoverable internal inconsistency.
    FatalError = -64,
    /// A task overran its stack.
    StackOverflow = -65,
    /// A stack pointer was found outside its task's stack region.
    StackPointerCorrupt = -66,
}

macro_rules! define_error {
    (
        $( #[doc $( $doc:tt )*] )*
        $vis:vis enum $Name:ident {
            $(
                $( #[doc $( $vdoc:tt )*] )*
                $Variant:ident,
            )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $(
                $( #[doc $( $vdoc )*] )*
                $Variant = ResultCode::$Variant as _,
            )*
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }
    };
}

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        define_error! {
            $( #[doc $( $doc )*] )*
            $vis enum $Name {
                $( $Variant, )*
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

// Public per-operation errors
// ---------------------------------------------------------------------------

define_error! {
    /// Error type for task creation.
    pub enum CreateTaskError {
        BadContext,
        BadParam,
        PriorityTooHigh,
        StackTooSmall,
        IdleTaskExists,
        NoMemory,
    }
}

define_error! {
    /// Error type for [`Task::sleep`](crate::task::Task::sleep).
    pub enum SleepError {
        BadContext,
        SchedulerLocked,
        BadParam,
        Interrupted,
    }
}

define_error! {
    /// Error type for [`Task::suspend`](crate::task::Task::suspend).
    pub enum SuspendTaskError {
        BadContext,
        SchedulerLocked,
        BadObjectState,
        SuspendCountOverflow,
        Forbidden,
        Busy,
    }
}

define_error! {
    /// Error type for [`Task::resume`](crate::task::Task::resume).
    pub enum ResumeTaskError {
        BadContext,
        NotSuspended,
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`Task::wait_abort`](crate::task::Task::wait_abort).
    pub enum WaitAbortError {
        BadContext,
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`Task::set_priority`](crate::task::Task::set_priority).
    pub enum SetPriorityError {
        BadContext,
        Forbidden,
        BadObjectState,
        PriorityTooHigh,
    }
}

define_error! {
    /// Error type for [`Task::delete`](crate::task::Task::delete).
    pub enum DeleteTaskError {
        BadContext,
        SchedulerLocked,
        BadObjectState,
        Forbidden,
        BadKind,
        Busy,
    }
}

define_error! {
    /// Error type for time-slice and scheduling-policy updates.
    pub enum SetSchedParamError {
        BadContext,
        BadPolicy,
        BadObjectState,
    }
}

define_error! {
    /// Error type for CPU binding updates.
    pub enum BindTaskError {
        BadContext,
        BadParam,
    }
}

define_error! {
    /// Error type for the stack high-water probe.
    pub enum StackProbeError {
        BadObjectState,
    }
}

define_error! {
    /// Error type for [`System::sched_disable`](crate::System::sched_disable).
    pub enum SchedDisableError {
        BadContext,
        LockCountOverflow,
    }
}

define_error! {
    /// Error type for [`System::sched_enable`](crate::System::sched_enable).
    pub enum SchedEnableError {
        BadContext,
        AlreadyEnabled,
    }
}

define_error! {
    /// Error type for dynamic object creation.
    pub enum CreateKobjError {
        BadParam,
        NoMemory,
    }
}

define_error! {
    /// Error type for semaphore signal operations.
    pub enum SignalSemaphoreError {
        BadId,
        Overflow,
    }
}

define_error! {
    /// Error type for semaphore take operations.
    pub enum WaitSemaphoreError {
        BadId,
        BadContext,
        SchedulerLocked,
        WouldBlock,
        Timeout,
        Interrupted,
        Deleted,
    }
}

define_error! {
    /// Error type for [`Semaphore::count_set`](crate::semaphore::Semaphore::count_set).
    pub enum SetSemaphoreError {
        BadId,
        BadContext,
        TasksWaiting,
    }
}

define_error! {
    /// Error type for object deletion.
    pub enum DeleteKobjError {
        BadId,
        BadContext,
        BadKind,
    }
}

define_error! {
    /// Error type for non-blocking object queries.
    pub enum QueryKobjError {
        BadId,
    }
}

define_error! {
    /// Error type for queue send operations.
    pub enum SendQueueError {
        BadId,
        QueueFull,
    }
}

define_error! {
    /// Error type for queue receive operations.
    pub enum RecvQueueError {
        BadId,
        BadContext,
        SchedulerLocked,
        WouldBlock,
        Timeout,
        Interrupted,
        Deleted,
    }
}

define_error! {
    /// Error type for [`Queue::flush`](crate::queue::Queue::flush).
    pub enum FlushQueueError {
        BadId,
        BadContext,
    }
}

define_error! {
    /// Error type for mutex lock operations.
    pub enum LockMutexError {
        BadId,
        BadContext,
        SchedulerLocked,
        WouldBlock,
        Timeout,
        Interrupted,
        Deleted,
        NestingOverflow,
    }
}

define_error! {
    /// Error type for [`Mutex::unlock`](crate::mutex::Mutex::unlock).
    pub enum UnlockMutexError {
        BadId,
        BadContext,
        NotOwner,
    }
}

define_error! {
    /// Error type for timer creation.
    pub enum CreateTimerError {
        BadParam,
        NoMemory,
    }
}

define_error! {
    /// Error type for timer control operations.
    pub enum TimerOpError {
        BadId,
        BadObjectState,
        BadParam,
        BadKind,
        Busy,
        QueueFull,
    }
}

// Internal sub-errors
// ---------------------------------------------------------------------------

define_suberror! {
    /// `BadContext`
    #[into(CreateTaskError)]
    #[into(SleepError)]
    #[into(SuspendTaskError)]
    #[into(ResumeTaskError)]
    #[into(WaitAbortError)]
    #[into(SetPriorityError)]
    #[into(DeleteTaskError)]
    #[into(SetSchedParamError)]
    #[into(BindTaskError)]
    #[into(SchedDisableError)]
    #[into(SchedEnableError)]
    #[into(WaitSemaphoreError)]
    #[into(SetSemaphoreError)]
    #[into(DeleteKobjError)]
    #[into(RecvQueueError)]
    #[into(FlushQueueError)]
    #[into(LockMutexError)]
    #[into(UnlockMutexError)]
    pub(crate) enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// `BadId`
    #[into(SignalSemaphoreError)]
    #[into(WaitSemaphoreError)]
    #[into(SetSemaphoreError)]
    #[into(DeleteKobjError)]
    #[into(QueryKobjError)]
    #[into(SendQueueError)]
    #[into(RecvQueueError)]
    #[into(FlushQueueError)]
    #[into(LockMutexError)]
    #[into(UnlockMutexError)]
    #[into(TimerOpError)]
    pub(crate) enum BadIdError {
        BadId,
    }
}

define_suberror! {
    /// The reason a wait ended, as seen by the woken task. `Finish` maps to
    /// a successful return and has no error-side representation.
    #[into(WaitSemaphoreError)]
    #[into(RecvQueueError)]
    #[into(LockMutexError)]
    pub(crate) enum WakeError {
        Timeout,
        Interrupted,
        Deleted,
    }
}
