//! Alarm registry
//!
//! [`Alarms`] owns every [`Alarm`] and hands out shared handles. The registry
//! lock only guards the map; it is released before any alarm transition runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::alarm::{Alarm, AlarmConfig, AlarmContext, AlarmRecord, FireOutcome};
use crate::calendar_type::CalendarType;
use crate::clock::Clock;
use crate::error::{AlarmError, StoreError};
use crate::scheduler::AlarmsScheduler;
use crate::store::AlarmStore;
use crate::AlarmId;

/// Result of a registry-wide refresh
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Alarms that were brought up to date
    pub refreshed: usize,
    /// Alarms left as they were, with the reason
    pub failed: Vec<(AlarmId, AlarmError)>,
}

impl RefreshReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<AlarmId> {
        self.failed.iter().map(|(id, _)| *id).collect()
    }
}

pub struct Alarms {
    ctx: Arc<AlarmContext>,
    alarms: RwLock<BTreeMap<AlarmId, Arc<Alarm>>>,
    next_id: AtomicI32,
}

impl std::fmt::Debug for Alarms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Alarms")
            .field("alarms", &self.read().len())
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish()
    }
}

impl Alarms {
    /// Empty registry
    pub fn new(
        scheduler: Arc<AlarmsScheduler>,
        clock: Arc<dyn Clock>,
        store: Arc<dyn AlarmStore>,
    ) -> Self {
        Self::with_records(scheduler, clock, store, Vec::new())
    }

    /// Registry restored from `store`.
    ///
    /// Nothing is arranged until the first [`Alarms::refresh`], which is what
    /// a boot event triggers.
    pub fn load(
        scheduler: Arc<AlarmsScheduler>,
        clock: Arc<dyn Clock>,
        store: Arc<dyn AlarmStore>,
    ) -> Result<Self, StoreError> {
        let records = store.load_all()?;
        tracing::info!("Restoring {} alarms", records.len());
        Ok(Self::with_records(scheduler, clock, store, records))
    }

    fn with_records(
        scheduler: Arc<AlarmsScheduler>,
        clock: Arc<dyn Clock>,
        store: Arc<dyn AlarmStore>,
        records: Vec<AlarmRecord>,
    ) -> Self {
        let ctx = Arc::new(AlarmContext {
            scheduler,
            clock,
            store,
        });

        let next_id = records.iter().map(|r| r.id).max().map_or(1, |max| max + 1);
        let alarms = records
            .into_iter()
            .map(|record| (record.id, Arc::new(Alarm::new(record, ctx.clone()))))
            .collect();

        Self {
            ctx,
            alarms: RwLock::new(alarms),
            next_id: AtomicI32::new(next_id),
        }
    }

    pub fn scheduler(&self) -> &AlarmsScheduler {
        &self.ctx.scheduler
    }

    /// Look up an alarm; absence is a normal answer
    pub fn get_alarm(&self, id: AlarmId) -> Option<Arc<Alarm>> {
        self.read().get(&id).cloned()
    }

    /// Every alarm, ordered by id
    pub fn alarms(&self) -> Vec<Arc<Alarm>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Create an alarm with a fresh id and schedule it.
    ///
    /// A malformed rule is rejected; the id it would have had is not reused.
    pub fn create_alarm(&self, config: AlarmConfig) -> Result<Arc<Alarm>, AlarmError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let alarm = Arc::new(Alarm::new(
            AlarmRecord::new(id, config.clone()),
            self.ctx.clone(),
        ));
        alarm.edit(config)?;

        self.write().insert(id, alarm.clone());
        tracing::info!(id, state = %alarm.state(), "Alarm created");
        Ok(alarm)
    }

    /// Remove an alarm, cancelling its wake-ups. Returns whether it existed.
    pub fn delete_alarm(&self, id: AlarmId) -> bool {
        let Some(alarm) = self.write().remove(&id) else {
            return false;
        };

        alarm.cancel_all();
        if let Err(e) = self.ctx.store.delete(id) {
            tracing::warn!(id, "Failed to delete alarm from store: {}", e);
        }
        tracing::info!(id, "Alarm deleted");
        true
    }

    pub fn on_alarm_fired(
        &self,
        alarm: &Alarm,
        calendar_type: CalendarType,
    ) -> Result<FireOutcome, AlarmError> {
        alarm.on_alarm_fired(calendar_type)
    }

    /// Recompute and re-arrange every alarm.
    ///
    /// One alarm failing does not stop the others.
    pub fn refresh(&self) -> RefreshReport {
        self.for_each_alarm(|alarm| alarm.refresh())
    }

    /// Follow a manual wall-clock change
    pub fn on_time_set(&self) -> RefreshReport {
        self.for_each_alarm(|alarm| alarm.on_time_set())
    }

    fn for_each_alarm(&self, op: impl Fn(&Alarm) -> Result<(), AlarmError>) -> RefreshReport {
        let mut report = RefreshReport::default();
        for alarm in self.alarms() {
            match op(&alarm) {
                Ok(()) => report.refreshed += 1,
                Err(e) => report.failed.push((alarm.id(), e)),
            }
        }
        report
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<AlarmId, Arc<Alarm>>> {
        self.alarms.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<AlarmId, Arc<Alarm>>> {
        self.alarms.write().unwrap_or_else(PoisonError::into_inner)
    }
}
