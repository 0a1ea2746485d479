//! Deterministic harness: manual clock, simulated timer, in-memory store

#![allow(dead_code)]

use std::sync::Arc;

use alarmcore::config::SchedulingConfig;
use alarmcore::{
    AlarmCoreError, AlarmStore, Alarms, AlarmsScheduler, Dispatched, Dispatcher, ManualClock,
    MemoryStore, RawEvent, SimulatedTimer, WakeupTimer,
};
use chrono::{NaiveDate, NaiveDateTime};

/// 2024-03-04 is a Monday
pub fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, day)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub timer: Arc<SimulatedTimer>,
    pub store: Arc<dyn AlarmStore>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new(now: NaiveDateTime) -> Self {
        Self::with_store(now, Arc::new(MemoryStore::new()), SchedulingConfig::default())
    }

    pub fn with_store(
        now: NaiveDateTime,
        store: Arc<dyn AlarmStore>,
        config: SchedulingConfig,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(now));
        let timer = Arc::new(SimulatedTimer::new());
        let scheduler = Arc::new(AlarmsScheduler::new(timer.clone(), config));
        let alarms = Alarms::load(scheduler, clock.clone(), store.clone()).unwrap();
        Self {
            clock,
            timer,
            store,
            dispatcher: Dispatcher::new(Arc::new(alarms)),
        }
    }

    pub fn alarms(&self) -> &Alarms {
        self.dispatcher.alarms()
    }

    pub fn send(&self, raw: RawEvent) -> Result<Dispatched, AlarmCoreError> {
        self.dispatcher.on_receive(&raw)
    }

    /// Deliver every wake-up due up to `until` in time order, moving the clock
    /// to each one, then leave the clock at `until`.
    pub fn run_until(&self, until: NaiveDateTime) -> Vec<Dispatched> {
        let mut outcomes = Vec::new();
        while let Some(wakeup) = self.timer.next_due().filter(|w| w.at <= until) {
            self.timer.cancel(wakeup.id, wakeup.calendar_type);
            self.clock.set(wakeup.at);
            outcomes.push(self.send(RawEvent::for_wakeup(&wakeup)).unwrap());
        }
        self.clock.set(until);
        outcomes
    }
}
