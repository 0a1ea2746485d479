//! alarmcored - alarm scheduling daemon
//!
//! Reads newline-delimited JSON events from stdin, for example:
//!
//! ```text
//! {"action":"alarmcore.request.SNOOZE","extras":{"alarmcore.extra.ID":7}}
//! ```
//!
//! Wake-ups are delivered by tokio timers into the same queue.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;

use alarmcore::config::AppConfig;
use alarmcore::logging::init_logging;
use alarmcore::{
    Alarms, AlarmsScheduler, Clock, Dispatcher, Event, EventQueue, EventSender, JsonFileStore,
    RawEvent, Result, SystemChange, SystemClock, TokioWakeupTimer,
};

fn main() -> Result<()> {
    let config = AppConfig::load()?;
    let _log_buffer = init_logging(&config.logging);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))
}

async fn run(config: AppConfig) -> Result<()> {
    let store_path = config.storage.store_path();
    tracing::info!("Using alarm store {:?}", store_path);
    let store = Arc::new(JsonFileStore::open(store_path)?);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (events, worker) = EventQueue::new(config.scheduling.event_queue_capacity);
    let timer = Arc::new(TokioWakeupTimer::new(
        Handle::current(),
        clock.clone(),
        events.clone(),
    ));
    let scheduler = Arc::new(AlarmsScheduler::new(timer, config.scheduling.clone()));
    let alarms = Arc::new(Alarms::load(scheduler, clock, store)?);
    let dispatcher = Arc::new(Dispatcher::new(alarms));
    let worker = tokio::spawn(worker.run(dispatcher));

    // Restored alarms have nothing arranged until the first refresh.
    events
        .send(Event::SystemChanged(SystemChange::BootCompleted).to_raw())
        .await?;

    tokio::select! {
        result = read_input(&events) => {
            result?;
            tracing::info!("Input closed, serving wake-ups until interrupted");
            tokio::signal::ctrl_c().await?;
        }
        signal = tokio::signal::ctrl_c() => signal?,
    }

    tracing::info!("Shutting down");
    worker.abort();
    Ok(())
}

async fn read_input(events: &EventSender) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RawEvent>(line) {
            Ok(raw) => events.send(raw).await?,
            Err(e) => tracing::error!("Ignoring malformed input line: {}", e),
        }
    }

    Ok(())
}
