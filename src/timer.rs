//! Wake-up timer services
//!
//! - [`TokioWakeupTimer`]: sleeps on the tokio runtime and delivers the
//!   wake-up's event into the dispatch queue
//! - [`SimulatedTimer`]: records arrangements and lets a driver pop due
//!   wake-ups against a manual clock

use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::calendar_type::CalendarType;
use crate::clock::Clock;
use crate::dispatcher::EventSender;
use crate::event::RawEvent;
use crate::scheduler::{ScheduledWakeup, WakeupKey, WakeupTimer};
use crate::AlarmId;

/// Timer backed by tokio sleeps.
///
/// Each arranged wake-up is one task; re-arranging a key aborts the task it
/// supersedes. Sleeps are computed from the wall clock at arrange time, so a
/// clock change needs the wake-ups arranged again (`TIME_SET` does that).
pub struct TokioWakeupTimer {
    handle: Handle,
    clock: Arc<dyn Clock>,
    events: EventSender,
    exact_allowed: AtomicBool,
    tasks: Mutex<HashMap<WakeupKey, JoinHandle<()>>>,
}

impl TokioWakeupTimer {
    pub fn new(handle: Handle, clock: Arc<dyn Clock>, events: EventSender) -> Self {
        Self {
            handle,
            clock,
            events,
            exact_allowed: AtomicBool::new(true),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Toggle the exact wake-up permission reported to the scheduler
    pub fn set_exact_allowed(&self, allowed: bool) {
        self.exact_allowed.store(allowed, Ordering::SeqCst);
    }

    /// Number of wake-up tasks still sleeping
    pub fn active_tasks(&self) -> usize {
        self.tasks()
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<WakeupKey, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WakeupTimer for TokioWakeupTimer {
    fn arrange(&self, wakeup: &ScheduledWakeup) {
        let delay = (wakeup.at - self.clock.now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let event = RawEvent::for_wakeup(wakeup);
        let events = self.events.clone();
        let key = wakeup.key();

        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::trace!(id = key.0, calendar_type = %key.1, "Wake-up due");
            if let Err(e) = events.send(event).await {
                tracing::warn!(id = key.0, "Dropping wake-up, event queue closed: {}", e);
            }
        });

        let mut tasks = self.tasks();
        tasks.retain(|_, task| !task.is_finished());
        if let Some(previous) = tasks.insert(key, task) {
            previous.abort();
        }
    }

    fn cancel(&self, id: AlarmId, calendar_type: CalendarType) {
        if let Some(task) = self.tasks().remove(&(id, calendar_type)) {
            task.abort();
        }
    }

    fn can_schedule_exact(&self) -> bool {
        self.exact_allowed.load(Ordering::SeqCst)
    }
}

impl Drop for TokioWakeupTimer {
    fn drop(&mut self) {
        for (_, task) in self.tasks().drain() {
            task.abort();
        }
    }
}

/// In-memory timer for simulation and tests
#[derive(Debug)]
pub struct SimulatedTimer {
    pending: Mutex<BTreeMap<WakeupKey, ScheduledWakeup>>,
    exact_allowed: AtomicBool,
    arranged: AtomicUsize,
}

impl Default for SimulatedTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTimer {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(BTreeMap::new()),
            exact_allowed: AtomicBool::new(true),
            arranged: AtomicUsize::new(0),
        }
    }

    pub fn set_exact_allowed(&self, allowed: bool) {
        self.exact_allowed.store(allowed, Ordering::SeqCst);
    }

    /// Registered wake-ups, ordered by key
    pub fn pending(&self) -> Vec<ScheduledWakeup> {
        self.registered().values().copied().collect()
    }

    /// Total `arrange` calls so far
    pub fn arrange_count(&self) -> usize {
        self.arranged.load(Ordering::SeqCst)
    }

    /// Forget every registration, like a reboot does
    pub fn clear(&self) {
        self.registered().clear();
    }

    /// Earliest registered wake-up
    pub fn next_due(&self) -> Option<ScheduledWakeup> {
        self.registered().values().min_by_key(|w| (w.at, w.key())).copied()
    }

    /// Remove and return every wake-up due at `now`, earliest first
    pub fn pop_due(&self, now: NaiveDateTime) -> Vec<ScheduledWakeup> {
        let mut pending = self.registered();
        let mut due: Vec<ScheduledWakeup> =
            pending.values().filter(|w| w.at <= now).copied().collect();
        due.sort_by_key(|w| (w.at, w.key()));
        for wakeup in &due {
            pending.remove(&wakeup.key());
        }
        due
    }

    fn registered(&self) -> MutexGuard<'_, BTreeMap<WakeupKey, ScheduledWakeup>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WakeupTimer for SimulatedTimer {
    fn arrange(&self, wakeup: &ScheduledWakeup) {
        self.arranged.fetch_add(1, Ordering::SeqCst);
        self.registered().insert(wakeup.key(), *wakeup);
    }

    fn cancel(&self, id: AlarmId, calendar_type: CalendarType) {
        self.registered().remove(&(id, calendar_type));
    }

    fn can_schedule_exact(&self) -> bool {
        self.exact_allowed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{AlarmConfig, AlarmState, DaysOfWeek, FireOutcome};
    use crate::alarms::Alarms;
    use crate::clock::ManualClock;
    use crate::config::SchedulingConfig;
    use crate::dispatcher::{Dispatched, Dispatcher, EventQueue};
    use crate::event::Event;
    use crate::scheduler::AlarmsScheduler;
    use crate::store::MemoryStore;
    use std::time::Duration;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn wakeup(id: AlarmId, calendar_type: CalendarType, at: NaiveDateTime) -> ScheduledWakeup {
        ScheduledWakeup {
            id,
            calendar_type,
            at,
            exact: true,
        }
    }

    #[test]
    fn test_simulated_pop_due_in_time_order() {
        let timer = SimulatedTimer::new();
        timer.arrange(&wakeup(2, CalendarType::Normal, at(7, 0)));
        timer.arrange(&wakeup(1, CalendarType::Normal, at(8, 0)));
        timer.arrange(&wakeup(1, CalendarType::Autosilence, at(6, 0)));

        assert_eq!(timer.next_due().map(|w| w.at), Some(at(6, 0)));

        let due = timer.pop_due(at(7, 30));
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].key(), (1, CalendarType::Autosilence));
        assert_eq!(due[1].key(), (2, CalendarType::Normal));
        assert_eq!(timer.pending().len(), 1);
        assert_eq!(timer.arrange_count(), 3);
    }

    #[test]
    fn test_simulated_cancel() {
        let timer = SimulatedTimer::new();
        timer.arrange(&wakeup(1, CalendarType::Normal, at(7, 0)));
        timer.cancel(1, CalendarType::Normal);
        timer.cancel(1, CalendarType::Inexact);
        assert!(timer.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_delivers_due_wakeup() {
        let clock = Arc::new(ManualClock::new(at(6, 59)));
        let (sender, mut receiver) = EventQueue::channel(8);
        let timer = TokioWakeupTimer::new(Handle::current(), clock, sender);

        timer.arrange(&wakeup(7, CalendarType::Normal, at(7, 0)));
        assert_eq!(timer.active_tasks(), 1);
        tokio::task::yield_now().await;

        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        let raw = receiver.recv().await.unwrap();
        assert_eq!(
            Event::decode(&raw),
            Ok(Some(Event::Fired {
                id: 7,
                calendar_type: CalendarType::Normal
            }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_rearrange_supersedes() {
        let clock = Arc::new(ManualClock::new(at(6, 0)));
        let (sender, mut receiver) = EventQueue::channel(8);
        let timer = TokioWakeupTimer::new(Handle::current(), clock, sender);

        timer.arrange(&wakeup(1, CalendarType::Normal, at(6, 1)));
        timer.arrange(&wakeup(1, CalendarType::Normal, at(6, 2)));
        timer.arrange(&wakeup(2, CalendarType::Normal, at(6, 1)));
        timer.cancel(2, CalendarType::Normal);
        tokio::task::yield_now().await;

        tokio::time::advance(std::time::Duration::from_secs(90)).await;
        assert!(receiver.try_recv().is_err());

        tokio::time::advance(std::time::Duration::from_secs(60)).await;
        let raw = receiver.recv().await.unwrap();
        assert_eq!(
            Event::decode(&raw),
            Ok(Some(Event::Fired {
                id: 1,
                calendar_type: CalendarType::Normal
            }))
        );
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snooze_survives_clock_set_back() {
        let clock = Arc::new(ManualClock::new(at(6, 0)));
        let (sender, mut receiver) = EventQueue::channel(8);
        let timer = Arc::new(TokioWakeupTimer::new(
            Handle::current(),
            clock.clone(),
            sender,
        ));
        let scheduler = Arc::new(AlarmsScheduler::new(timer, SchedulingConfig::default()));
        let alarms = Alarms::new(scheduler, clock.clone(), Arc::new(MemoryStore::new()));
        let dispatcher = Dispatcher::new(Arc::new(alarms));
        let alarm = dispatcher
            .alarms()
            .create_alarm(AlarmConfig::new(7, 0, DaysOfWeek::EVERY_DAY))
            .unwrap();
        tokio::task::yield_now().await;

        clock.set(at(7, 0));
        tokio::time::advance(Duration::from_secs(3600)).await;
        let raw = receiver.recv().await.unwrap();
        assert_eq!(
            dispatcher.on_receive(&raw).unwrap(),
            Dispatched::Fired(FireOutcome::Rang)
        );
        assert_eq!(alarm.snooze().unwrap(), at(7, 9));
        tokio::task::yield_now().await;

        // Clock set back an hour: the snooze still ends at 07:09 wall time
        clock.set(at(6, 0));
        assert_eq!(
            dispatcher.dispatch(Event::TimeSet).unwrap(),
            Dispatched::TimeAdjusted { alarms: 1 }
        );
        tokio::task::yield_now().await;

        clock.set(at(6, 9));
        tokio::time::advance(Duration::from_secs(9 * 60)).await;
        tokio::task::yield_now().await;
        assert!(receiver.try_recv().is_err());

        clock.set(at(7, 9));
        tokio::time::advance(Duration::from_secs(3600)).await;
        let raw = receiver.recv().await.unwrap();
        assert_eq!(
            dispatcher.on_receive(&raw).unwrap(),
            Dispatched::Fired(FireOutcome::Rang)
        );
        assert_eq!(alarm.state(), AlarmState::Fired);
    }
}
