//! The software-timer service
//!
//! All timer state lives with a dedicated service task: external callers
//! only post commands. The command rides in a single-entry slot inside the
//! timer control block; the message posted to the service's queue is the
//! timer's address. The service loop is a two-phase wait — it receives from
//! the command queue with the delta to the nearest expiry as the timeout,
//! and runs the expired callbacks when the receive times out.
use core::fmt;

use crate::error::{CreateTimerError, TimerOpError};
use crate::klock::{self, CpuLockCell, CpuLockTokenRefMut};
use crate::obj::{AllocKind, ObjKind};
use crate::queue::{Queue, QueueCb};
use crate::task::{TaskCb, TaskOptions};
use crate::tick::HALF_RANGE;
use crate::trace;
use crate::utils::intrusive_list::{Link, ListAccessor, ListHead};
use crate::utils::ring_buffer::RawMessage;
use crate::utils::Init;
use crate::{KernelTraits, System, Tick, Timeout};

/// The timer callback type. Callbacks execute in the service task's context
/// with the CPU Lock released and must not block.
pub type TimerFn<Traits> = fn(Timer<Traits>, *mut ());

/// Durations at or beyond this limit cannot be represented on the wrapping
/// tick line.
const MAX_TIMER_TICKS: Tick = HALF_RANGE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Active,
    Deactive,
}

impl Init for TimerState {
    const INIT: Self = Self::Deactive;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TimerOp {
    Start,
    Stop,
    Change,
    ArgChange,
    ArgChangeAuto,
    Del,
    #[cfg(feature = "dyn_alloc")]
    DynDel,
}

/// One posted command. The fields beyond `op` are meaningful only for
/// `Change` and the argument ops.
pub(crate) struct TimerCmd {
    op: TimerOp,
    first: Tick,
    round: Tick,
    arg: RawMessage,
}

impl Clone for TimerCmd {
    fn clone(&self) -> Self {
        *self
    }
}
impl Copy for TimerCmd {}

/// *Timer control block* - the state data of a software timer.
pub struct TimerCb<Traits: KernelTraits> {
    pub(crate) name: CpuLockCell<Traits, &'static str>,
    pub(crate) kind: CpuLockCell<Traits, ObjKind>,
    pub(crate) callback: CpuLockCell<Traits, Option<TimerFn<Traits>>>,
    pub(crate) arg: CpuLockCell<Traits, RawMessage>,
    /// Ticks until the first shot.
    pub(crate) init_count: CpuLockCell<Traits, Tick>,
    /// The period; zero makes the timer one-shot.
    pub(crate) round_ticks: CpuLockCell<Traits, Tick>,
    /// Ticks remaining when the timer was (re-)armed; the list sort key.
    pub(crate) remain: CpuLockCell<Traits, Tick>,
    /// The absolute service-count tick the timer fires at.
    pub(crate) match_at: CpuLockCell<Traits, Tick>,
    pub(crate) state: CpuLockCell<Traits, TimerState>,
    /// Membership in the service task's sorted timer list.
    pub(crate) list_link: CpuLockCell<Traits, Option<Link<TimerCb<Traits>>>>,
    /// The single in-flight command slot.
    pub(crate) cmd: CpuLockCell<Traits, Option<TimerCmd>>,
    pub(crate) alloc_kind: CpuLockCell<Traits, AllocKind>,
    #[cfg(feature = "dyn_alloc")]
    pub(crate) pool_link: CpuLockCell<Traits, Option<Link<TimerCb<Traits>>>>,
}

impl<Traits: KernelTraits> Init for TimerCb<Traits> {
    const INIT: Self = Self {
        name: Init::INIT,
        kind: Init::INIT,
        callback: Init::INIT,
        arg: Init::INIT,
        init_count: Init::INIT,
        round_ticks: Init::INIT,
        remain: Init::INIT,
        match_at: Init::INIT,
        state: Init::INIT,
        list_link: Init::INIT,
        cmd: Init::INIT,
        alloc_kind: Init::INIT,
        #[cfg(feature = "dyn_alloc")]
        pool_link: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for TimerCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("self", &(self as *const _))
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// A handle to a software timer.
pub struct Timer<Traits: KernelTraits>(&'static TimerCb<Traits>);

impl<Traits: KernelTraits> Clone for Timer<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: KernelTraits> Copy for Timer<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for Timer<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Timer").field(&(self.0 as *const _)).finish()
    }
}

/// The statics backing the software-timer service, instantiated by the
/// `build!` macro.
pub struct TimerGlobals<Traits: KernelTraits> {
    pub(crate) task: TaskCb<Traits>,
    pub(crate) queue: QueueCb<Traits>,
    /// The sorted timer list. Mutated only by the service task.
    pub(crate) list: CpuLockCell<Traits, ListHead<TimerCb<Traits>>>,
    /// The service task's snapshot of the tick counter.
    pub(crate) count: CpuLockCell<Traits, Tick>,
}

impl<Traits: KernelTraits> Init for TimerGlobals<Traits> {
    const INIT: Self = Self {
        task: Init::INIT,
        queue: Init::INIT,
        list: CpuLockCell::new(ListHead::INIT),
        count: Init::INIT,
    };
}

fn timer_list<Traits: KernelTraits>(
) -> ListAccessor<
    'static,
    Traits,
    TimerCb<Traits>,
    impl Fn(&'static TimerCb<Traits>) -> &'static CpuLockCell<Traits, Option<Link<TimerCb<Traits>>>>,
> {
    ListAccessor::new(
        &Traits::timer_globals().list,
        |timer: &'static TimerCb<Traits>| &timer.list_link,
    )
}

#[cfg(feature = "dyn_alloc")]
fn pool_accessor<'a, Traits: KernelTraits>(
    head: &'a CpuLockCell<Traits, ListHead<TimerCb<Traits>>>,
) -> ListAccessor<
    'a,
    Traits,
    TimerCb<Traits>,
    impl Fn(&'static TimerCb<Traits>) -> &'static CpuLockCell<Traits, Option<Link<TimerCb<Traits>>>>,
> {
    ListAccessor::new(head, |cb: &'static TimerCb<Traits>| &cb.pool_link)
}

impl<Traits: KernelTraits> Timer<Traits> {
    /// Initialize a timer control block.
    ///
    /// `first` is the delay of the first shot, `round` the period
    /// (zero = one-shot). With `auto_run` a `START` command is posted
    /// immediately.
    pub fn create(
        cb: &'static TimerCb<Traits>,
        name: &'static str,
        callback: TimerFn<Traits>,
        first: Tick,
        round: Tick,
        arg: *mut (),
        auto_run: bool,
    ) -> Result<Timer<Traits>, CreateTimerError> {
        create_timer(cb, name, callback, first, round, arg, AllocKind::Static)?;

        let timer = Timer(cb);
        if auto_run {
            // Surface a full command queue as an allocation-ish failure
            timer.start().map_err(|_| CreateTimerError::NoMemory)?;
        }
        Ok(timer)
    }

    /// Like [`Self::create`], but the control block is allocated from the
    /// kernel heap.
    #[cfg(feature = "dyn_alloc")]
    pub fn create_dyn(
        name: &'static str,
        callback: TimerFn<Traits>,
        first: Tick,
        round: Tick,
        arg: *mut (),
        auto_run: bool,
    ) -> Result<Timer<Traits>, CreateTimerError> {
        use alloc::boxed::Box;

        let cb = {
            let mut lock = klock::relock_cpu::<Traits>();
            pool_accessor(&Traits::state().timer_pool).pop_front(lock.borrow_mut())
        };
        let cb = match cb {
            Some(cb) => cb,
            None => Box::leak(Box::new(TimerCb::INIT)),
        };

        create_timer(cb, name, callback, first, round, arg, AllocKind::Dynamic)?;

        let timer = Timer(cb);
        if auto_run {
            timer.start().map_err(|_| CreateTimerError::NoMemory)?;
        }
        Ok(timer)
    }

    /// Post a `START` command. Starting an already-active timer is a no-op.
    pub fn start(self) -> Result<(), TimerOpError> {
        self.post(TimerOp::Start, 0, 0, RawMessage::NULL)
    }

    /// Post a `STOP` command. Stopping an inactive timer is a no-op.
    pub fn stop(self) -> Result<(), TimerOpError> {
        self.post(TimerOp::Stop, 0, 0, RawMessage::NULL)
    }

    /// Post a `CHANGE` command updating the first-shot delay and period.
    /// The timer must be stopped first.
    pub fn change(self, first: Tick, round: Tick) -> Result<(), TimerOpError> {
        if first == 0 || first >= MAX_TIMER_TICKS || round >= MAX_TIMER_TICKS {
            return Err(TimerOpError::BadParam);
        }
        self.post(TimerOp::Change, first, round, RawMessage::NULL)
    }

    /// Post an `ARG_CHANGE` command updating the callback argument. The
    /// timer must be stopped first.
    pub fn arg_change(self, arg: *mut ()) -> Result<(), TimerOpError> {
        self.post(TimerOp::ArgChange, 0, 0, RawMessage(arg))
    }

    /// Post a stop–change-argument–start sequence as one command.
    pub fn arg_change_auto(self, arg: *mut ()) -> Result<(), TimerOpError> {
        self.post(TimerOp::ArgChangeAuto, 0, 0, RawMessage(arg))
    }

    /// Post a `DEL` command. The timer must be stopped first.
    pub fn delete(self) -> Result<(), TimerOpError> {
        self.post(TimerOp::Del, 0, 0, RawMessage::NULL)
    }

    /// Post a `DYN_DEL` command: like `DEL`, but the control block is
    /// recycled for future dynamic creations.
    #[cfg(feature = "dyn_alloc")]
    pub fn delete_dyn(self) -> Result<(), TimerOpError> {
        self.post(TimerOp::DynDel, 0, 0, RawMessage::NULL)
    }

    /// The timer's current state.
    pub fn state(self) -> Result<TimerState, TimerOpError> {
        let lock = klock::relock_cpu::<Traits>();
        if self.0.kind.get(&*lock) != ObjKind::Timer {
            return Err(TimerOpError::BadId);
        }
        Ok(self.0.state.get(&*lock))
    }

    /// Validate the operation against the timer's current state, stash the
    /// command in the timer's slot, and post the timer to the service.
    fn post(self, op: TimerOp, first: Tick, round: Tick, arg: RawMessage) -> Result<(), TimerOpError> {
        let cb = self.0;

        {
            let mut lock = klock::relock_cpu::<Traits>();

            if cb.kind.get(&*lock) != ObjKind::Timer {
                return Err(TimerOpError::BadId);
            }

            let state = cb.state.get(&*lock);
            match op {
                // Mutating a timer's configuration or deleting it requires
                // it to be stopped
                TimerOp::Change | TimerOp::ArgChange | TimerOp::Del => {
                    if state != TimerState::Deactive {
                        return Err(TimerOpError::BadObjectState);
                    }
                }
                #[cfg(feature = "dyn_alloc")]
                TimerOp::DynDel => {
                    if state != TimerState::Deactive {
                        return Err(TimerOpError::BadObjectState);
                    }
                }
                TimerOp::Start | TimerOp::Stop | TimerOp::ArgChangeAuto => {}
            }

            match op {
                TimerOp::Del => {
                    if cb.alloc_kind.get(&*lock) != AllocKind::Static {
                        return Err(TimerOpError::BadKind);
                    }
                }
                #[cfg(feature = "dyn_alloc")]
                TimerOp::DynDel => {
                    if cb.alloc_kind.get(&*lock) != AllocKind::Dynamic {
                        return Err(TimerOpError::BadKind);
                    }
                }
                _ => {}
            }

            // One command may be in flight per timer
            if cb.cmd.get(&*lock).is_some() {
                return Err(TimerOpError::Busy);
            }
            cb.cmd.replace(
                &mut *lock,
                Some(TimerCmd {
                    op,
                    first,
                    round,
                    arg,
                }),
            );
        }

        let queue = Queue::from_cb(&Traits::timer_globals().queue);
        match queue.send(cb as *const TimerCb<Traits> as *mut ()) {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut lock = klock::relock_cpu::<Traits>();
                cb.cmd.replace(&mut *lock, None);
                drop(lock);
                Err(match e {
                    crate::error::SendQueueError::QueueFull => TimerOpError::QueueFull,
                    crate::error::SendQueueError::BadId => TimerOpError::BadId,
                })
            }
        }
    }
}

fn create_timer<Traits: KernelTraits>(
    cb: &'static TimerCb<Traits>,
    name: &'static str,
    callback: TimerFn<Traits>,
    first: Tick,
    round: Tick,
    arg: *mut (),
    alloc_kind: AllocKind,
) -> Result<(), CreateTimerError> {
    if first == 0 || first >= MAX_TIMER_TICKS || round >= MAX_TIMER_TICKS {
        return Err(CreateTimerError::BadParam);
    }

    let mut lock = klock::relock_cpu::<Traits>();

    cb.name.replace(&mut *lock, name);
    cb.callback.replace(&mut *lock, Some(callback));
    cb.arg.replace(&mut *lock, RawMessage(arg));
    cb.init_count.replace(&mut *lock, first);
    cb.round_ticks.replace(&mut *lock, round);
    cb.remain.replace(&mut *lock, 0);
    cb.match_at.replace(&mut *lock, 0);
    cb.state.replace(&mut *lock, TimerState::Deactive);
    cb.list_link.replace(&mut *lock, None);
    cb.cmd.replace(&mut *lock, None);
    cb.alloc_kind.replace(&mut *lock, alloc_kind);
    cb.kind.replace(&mut *lock, ObjKind::Timer);

    Traits::trace(trace::Event::TimerCreate { timer: cb });

    Ok(())
}

/// Insert a timer into the service's list, keeping the list sorted by
/// remaining time.
fn timer_list_insert<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    timer: &'static TimerCb<Traits>,
) {
    let count = Traits::timer_globals().count.get(&*lock);
    let remain = timer.remain.get(&*lock);

    let list = timer_list::<Traits>();
    let mut anchor = None;
    let mut cursor = list.front(lock.borrow_mut());
    while let Some(entry) = cursor {
        if entry.match_at.get(&*lock).wrapping_sub(count) > remain {
            anchor = Some(entry);
            break;
        }
        cursor = list.next(lock.borrow_mut(), entry);
    }
    list.insert_before(lock, timer, anchor);
}

/// Apply one posted command in the service task.
fn cmd_proc<Traits: KernelTraits>(timer: &'static TimerCb<Traits>) {
    let cmd = {
        let mut lock = klock::relock_cpu::<Traits>();
        timer.cmd.replace(&mut *lock, None)
    };
    let Some(cmd) = cmd else { return };

    if cmd.op == TimerOp::ArgChangeAuto {
        apply_cmd::<Traits>(timer, TimerOp::Stop, &cmd);
        apply_cmd::<Traits>(timer, TimerOp::ArgChange, &cmd);
        apply_cmd::<Traits>(timer, TimerOp::Start, &cmd);
    } else {
        apply_cmd::<Traits>(timer, cmd.op, &cmd);
    }
}

fn apply_cmd<Traits: KernelTraits>(timer: &'static TimerCb<Traits>, op: TimerOp, cmd: &TimerCmd) {
    let mut lock = klock::relock_cpu::<Traits>();

    // The command was validated at post time, but the timer may have been
    // operated on since; stale commands are dropped
    if timer.kind.get(&*lock) != ObjKind::Timer {
        return;
    }

    match op {
        TimerOp::Start => {
            if timer.state.get(&*lock) == TimerState::Active {
                return;
            }
            let count = Traits::timer_globals().count.get(&*lock);
            let first = timer.init_count.get(&*lock);
            timer.match_at.replace(&mut *lock, count.wrapping_add(first));
            timer.remain.replace(&mut *lock, first);
            timer_list_insert(lock.borrow_mut(), timer);
            timer.state.replace(&mut *lock, TimerState::Active);
        }
        TimerOp::Stop => {
            if timer.state.get(&*lock) == TimerState::Deactive {
                return;
            }
            if timer.list_link.get(&*lock).is_some() {
                timer_list::<Traits>().remove(lock.borrow_mut(), timer);
            }
            timer.state.replace(&mut *lock, TimerState::Deactive);
        }
        TimerOp::Change => {
            if timer.state.get(&*lock) != TimerState::Deactive || cmd.first == 0 {
                return;
            }
            timer.init_count.replace(&mut *lock, cmd.first);
            timer.round_ticks.replace(&mut *lock, cmd.round);
        }
        TimerOp::ArgChange => {
            if timer.state.get(&*lock) != TimerState::Deactive {
                return;
            }
            timer.arg.replace(&mut *lock, cmd.arg);
        }
        TimerOp::Del => {
            if timer.state.get(&*lock) != TimerState::Deactive {
                return;
            }
            timer.kind.replace(&mut *lock, ObjKind::None);
            Traits::trace(trace::Event::TimerDel { timer });
        }
        #[cfg(feature = "dyn_alloc")]
        TimerOp::DynDel => {
            if timer.state.get(&*lock) != TimerState::Deactive {
                return;
            }
            timer.kind.replace(&mut *lock, ObjKind::None);
            Traits::trace(trace::Event::TimerDel { timer });
            pool_accessor(&Traits::state().timer_pool).push_back(lock.borrow_mut(), timer);
        }
        TimerOp::ArgChangeAuto => unreachable!(),
    }
}

/// Run every expired timer's callback, re-arming periodic timers.
fn timer_cb_proc<Traits: KernelTraits>() {
    loop {
        let fired = {
            let mut lock = klock::relock_cpu::<Traits>();
            let count = Traits::timer_globals().count.get(&*lock);
            let list = timer_list::<Traits>();

            let Some(front) = list.front(lock.borrow_mut()) else { break };
            let remaining = front.match_at.get(&*lock).wrapping_sub(count);
            if remaining != 0 && remaining < HALF_RANGE {
                break;
            }

            list.remove(lock.borrow_mut(), front);

            let round = front.round_ticks.get(&*lock);
            if round > 0 {
                front.remain.replace(&mut *lock, round);
                front
                    .match_at
                    .replace(&mut *lock, count.wrapping_add(round));
                timer_list_insert(lock.borrow_mut(), front);
            } else {
                front.state.replace(&mut *lock, TimerState::Deactive);
            }

            let callback = front.callback.get(&*lock);
            let arg = front.arg.get(&*lock);
            (front, callback, arg)
        };

        let (timer, callback, arg) = fired;
        Traits::trace(trace::Event::TimerFire { timer });

        // Callbacks run in the service task's context with the CPU Lock
        // released; a started callback always runs to completion
        if let Some(callback) = callback {
            callback(Timer(timer), arg.0);
        }
    }
}

/// The service task: a two-phase wait on the command queue, timed against
/// the nearest expiry.
fn timer_task_entry<Traits: KernelTraits>(_: usize) {
    let globals = Traits::timer_globals();
    let queue = Queue::from_cb(&globals.queue);

    loop {
        let msg = queue.recv(Timeout::Forever);
        refresh_count::<Traits>();

        match msg {
            Ok(msg) => cmd_proc::<Traits>(unsafe { &*(msg as *const TimerCb<Traits>) }),
            Err(_) => continue,
        }

        // Drive the timer list until it drains
        loop {
            let delta = {
                let mut lock = klock::relock_cpu::<Traits>();
                let count = globals.count.get(&*lock);
                match timer_list::<Traits>().front(lock.borrow_mut()) {
                    None => break,
                    Some(front) => {
                        let remaining = front.match_at.get(&*lock).wrapping_sub(count);
                        if remaining == 0 || remaining >= HALF_RANGE {
                            0
                        } else {
                            remaining
                        }
                    }
                }
            };

            if delta > 0 {
                match queue.recv(Timeout::Ticks(delta)) {
                    Ok(msg) => {
                        refresh_count::<Traits>();
                        cmd_proc::<Traits>(unsafe { &*(msg as *const TimerCb<Traits>) });
                    }
                    Err(crate::error::RecvQueueError::Timeout) => {
                        refresh_count::<Traits>();
                    }
                    Err(_) => break,
                }
            } else {
                refresh_count::<Traits>();
            }

            timer_cb_proc::<Traits>();
        }
    }
}

/// Refresh the service's snapshot of the tick counter.
fn refresh_count<Traits: KernelTraits>() {
    let now = System::<Traits>::tick_count();
    let mut lock = klock::relock_cpu::<Traits>();
    Traits::timer_globals().count.replace(&mut *lock, now);
}

/// Spawn the timer service. Called once during `PortToKernel::boot`.
pub(crate) fn timer_service_init<Traits: KernelTraits>() {
    let globals = Traits::timer_globals();

    crate::queue::create_queue(
        &globals.queue,
        "timer_queue",
        Traits::timer_queue_storage(),
        AllocKind::Static,
    );

    crate::task::Task::<Traits>::create_raw(
        &globals.task,
        "timer_task",
        timer_task_entry::<Traits>,
        0,
        Traits::TIMER_TASK_PRIORITY,
        0,
        Traits::timer_task_stack(),
        TaskOptions::AUTO_START,
        None,
    )
    .expect("timer task creation failed");
}
