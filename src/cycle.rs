use crate::collectors::{CollectError, FleetSource};
use crate::metrics::Metrics;
use crate::state::{now_unix, CycleSummary, State};
use crate::store::{DeviceSession, DeviceStore, StoreError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("сбор данных не удался")]
    Collect(#[from] CollectError),
    #[error("обновление базы прервано, записано хостов: {written}")]
    Store {
        written: usize,
        #[source]
        source: StoreError,
    },
}

impl CycleError {
    pub fn stage(&self) -> &'static str {
        match self {
            CycleError::Collect(_) => "collect",
            CycleError::Store { .. } => "store",
        }
    }
}

/// Renders `err` and all of its sources as `outer: inner: root`.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

/// Collects once and writes every parsed host in label order. The first
/// failing update ends the cycle; earlier non-transactional updates stay.
pub async fn run_cycle<S, D>(
    source: &S,
    store: &D,
    transactional: bool,
    summary: &mut CycleSummary,
) -> Result<(), CycleError>
where
    S: FleetSource + ?Sized,
    D: DeviceStore,
{
    let report = source.retrieve_data().await?;
    summary.hosts_reported = report.reported;
    summary.hosts_parsed = report.records.len();
    summary.hosts_dropped = report.dropped;
    info!(
        reported = report.reported,
        parsed = report.records.len(),
        dropped = report.dropped,
        "данные получены"
    );

    let store_err = |written: usize, source: StoreError| CycleError::Store { written, source };
    let mut session = store
        .session(transactional)
        .await
        .map_err(|e| store_err(0, e))?;
    for (label, record) in &report.records {
        let rows = session
            .update_device(label, record)
            .await
            .map_err(|e| store_err(summary.hosts_written, e))?;
        if rows == 0 {
            debug!(label = %label, "устройство с такой меткой не найдено");
            summary.unknown_labels.push(label.clone());
        }
        summary.rows_updated += rows;
        summary.hosts_written += 1;
    }
    session
        .finish()
        .await
        .map_err(|e| store_err(summary.hosts_written, e))?;

    info!(rows = summary.rows_updated, "данные в базе обновлены");
    Ok(())
}

/// Runs cycles forever with a fixed pause between them, until `shutdown`
/// flips or its sender goes away.
pub struct Scheduler<S, D> {
    source: S,
    store: D,
    interval: Duration,
    transactional: bool,
    state: Arc<RwLock<State>>,
    metrics: Arc<Metrics>,
}

impl<S, D> Scheduler<S, D>
where
    S: FleetSource,
    D: DeviceStore,
{
    pub fn new(
        source: S,
        store: D,
        interval: Duration,
        transactional: bool,
        state: Arc<RwLock<State>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            store,
            interval,
            transactional,
            state,
            metrics,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.tick().await;

            info!(
                duration = %humantime::format_duration(self.interval),
                "ожидание следующего цикла"
            );
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("цикл сбора остановлен");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// One cycle. Never fails: errors end up in the log, the state and the
    /// metrics.
    pub async fn tick(&self) -> CycleSummary {
        let started = Instant::now();
        let mut summary = CycleSummary {
            started_at_unix: now_unix(),
            ..CycleSummary::default()
        };

        let result = run_cycle(&self.source, &self.store, self.transactional, &mut summary).await;
        summary.finished_at_unix = now_unix();
        summary.duration_ms = started.elapsed().as_millis() as u64;

        self.metrics.inc_cycle();
        if let Err(err) = result {
            let chain = error_chain(&err);
            error!(stage = err.stage(), error = %chain, "цикл завершился ошибкой");
            self.metrics.inc_cycle_failure(err.stage());
            summary.failed_stage = Some(err.stage().to_string());
            summary.error = Some(chain);
        }

        let snapshot = {
            let mut guard = self.state.write().await;
            guard.record_cycle(summary.clone());
            guard.clone()
        };
        self.metrics.update_from_state(&snapshot);
        summary
    }
}
