//! Event dispatch
//!
//! The [`Dispatcher`] maps each decoded [`Event`] to exactly one call on the
//! registry or on a single alarm. [`EventQueue`] puts a bounded channel in
//! front of it so events are handled one at a time by a [`DispatchWorker`].

use chrono::NaiveDateTime;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::alarm::{Alarm, FireOutcome};
use crate::alarms::{Alarms, RefreshReport};
use crate::error::{AlarmCoreError, AlarmError, QueueError, Result};
use crate::event::{Event, RawEvent};
use crate::AlarmId;

/// What handling an event amounted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Fired(FireOutcome),
    Snoozed { until: NaiveDateTime },
    Dismissed,
    Skipped { occurrence: NaiveDateTime },
    /// Every alarm recomputed after a system change
    Refreshed { alarms: usize },
    /// Every alarm adjusted to a manual clock change
    TimeAdjusted { alarms: usize },
    /// The event named an alarm that does not exist; dropped
    UnknownAlarm(AlarmId),
    /// Action not handled by this core; dropped
    Unhandled,
}

pub struct Dispatcher {
    alarms: Arc<Alarms>,
}

impl Dispatcher {
    pub fn new(alarms: Arc<Alarms>) -> Self {
        Self { alarms }
    }

    pub fn alarms(&self) -> &Arc<Alarms> {
        &self.alarms
    }

    /// Decode and dispatch a boundary event
    pub fn on_receive(&self, raw: &RawEvent) -> Result<Dispatched> {
        match Event::decode(raw) {
            Ok(Some(event)) => self.dispatch(event),
            Ok(None) => {
                tracing::debug!(action = %raw.action, "Ignoring unhandled action");
                Ok(Dispatched::Unhandled)
            }
            Err(e) => {
                tracing::error!(action = %raw.action, "Failed to decode event: {}", e);
                Err(e.into())
            }
        }
    }

    pub fn dispatch(&self, event: Event) -> Result<Dispatched> {
        tracing::debug!(?event, "Dispatching event");

        match event {
            Event::Fired { id, calendar_type } => self.with_alarm(id, |alarm| {
                self.alarms
                    .on_alarm_fired(alarm, calendar_type)
                    .map(Dispatched::Fired)
            }),
            Event::InexactFired { id } => self.with_alarm(id, |alarm| {
                alarm.on_inexact_alarm_fired().map(Dispatched::Fired)
            }),
            Event::SystemChanged(change) => {
                tracing::info!(?change, "Refreshing alarms");
                let report = self.alarms.refresh();
                Self::complete(report, |alarms| Dispatched::Refreshed { alarms })
            }
            Event::TimeSet => {
                tracing::info!("Wall clock was set, adjusting alarms");
                let report = self.alarms.on_time_set();
                Self::complete(report, |alarms| Dispatched::TimeAdjusted { alarms })
            }
            Event::SnoozeRequested { id } => self.with_alarm(id, |alarm| {
                alarm.snooze().map(|until| Dispatched::Snoozed { until })
            }),
            Event::DismissRequested { id } => {
                self.with_alarm(id, |alarm| alarm.dismiss().map(|()| Dispatched::Dismissed))
            }
            Event::SkipRequested { id } => self.with_alarm(id, |alarm| {
                alarm
                    .request_skip()
                    .map(|occurrence| Dispatched::Skipped { occurrence })
            }),
        }
    }

    fn with_alarm(
        &self,
        id: AlarmId,
        op: impl FnOnce(&Alarm) -> std::result::Result<Dispatched, AlarmError>,
    ) -> Result<Dispatched> {
        match self.alarms.get_alarm(id) {
            Some(alarm) => Ok(op(&alarm)?),
            None => {
                tracing::debug!(id, "Dropping event for unknown alarm");
                Ok(Dispatched::UnknownAlarm(id))
            }
        }
    }

    fn complete(report: RefreshReport, done: impl FnOnce(usize) -> Dispatched) -> Result<Dispatched> {
        if report.is_complete() {
            return Ok(done(report.refreshed));
        }

        for (id, e) in &report.failed {
            tracing::warn!(id, "Alarm could not be refreshed: {}", e);
        }
        Err(AlarmCoreError::RefreshIncomplete {
            failed: report.failed_ids(),
        })
    }
}

/// Bounded queue in front of a [`Dispatcher`]
pub struct EventQueue;

impl EventQueue {
    /// Returns the sending half and the worker that drains it
    pub fn new(capacity: usize) -> (EventSender, DispatchWorker) {
        let (sender, receiver) = Self::channel(capacity);
        (sender, DispatchWorker { receiver })
    }

    pub(crate) fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<RawEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (EventSender { tx }, rx)
    }
}

/// Cloneable handle for submitting raw events
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<RawEvent>,
}

impl EventSender {
    /// Queue without waiting
    pub fn try_send(&self, event: RawEvent) -> std::result::Result<(), QueueError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Queue, waiting for room
    pub async fn send(&self, event: RawEvent) -> std::result::Result<(), QueueError> {
        self.tx.send(event).await.map_err(|_| QueueError::Closed)
    }
}

/// Single consumer of the event queue
pub struct DispatchWorker {
    receiver: mpsc::Receiver<RawEvent>,
}

impl DispatchWorker {
    /// Handle events one at a time until every sender is dropped.
    ///
    /// Returns the number of events handled.
    pub async fn run(mut self, dispatcher: Arc<Dispatcher>) -> usize {
        tracing::info!("Dispatch worker started");
        let mut handled = 0;

        while let Some(raw) = self.receiver.recv().await {
            handled += 1;
            match dispatcher.on_receive(&raw) {
                Ok(outcome) => tracing::debug!(action = %raw.action, ?outcome, "Event handled"),
                // Already reported by on_receive
                Err(AlarmCoreError::Decode(_)) => {}
                Err(e) => tracing::warn!(action = %raw.action, "Event failed: {}", e),
            }
        }

        tracing::info!(handled, "Dispatch worker stopped");
        handled
    }
}
