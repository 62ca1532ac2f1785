use crate::state::{now_unix, State};
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub fleetd_cycles_total: Counter,
    pub fleetd_cycle_failures_total: CounterVec,
    pub fleetd_hosts_reported: Gauge,
    pub fleetd_hosts_parsed: Gauge,
    pub fleetd_hosts_dropped: Gauge,
    pub fleetd_rows_updated: Gauge,
    pub fleetd_unknown_labels: Gauge,
    pub fleetd_last_cycle_duration_seconds: Gauge,
    pub fleetd_last_success_timestamp_seconds: Gauge,
    pub fleetd_uptime_seconds: Gauge,
    pub fleetd_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let fleetd_cycles_total = Counter::with_opts(opts!(
            "fleetd_cycles_total",
            "Collect-and-persist cycles run since start"
        ))?;
        let fleetd_cycle_failures_total = CounterVec::new(
            opts!(
                "fleetd_cycle_failures_total",
                "Failed cycles by the stage that failed"
            ),
            &["stage"],
        )?;
        let fleetd_hosts_reported = Gauge::with_opts(opts!(
            "fleetd_hosts_reported",
            "Hosts present in the last salt-api reply"
        ))?;
        let fleetd_hosts_parsed = Gauge::with_opts(opts!(
            "fleetd_hosts_parsed",
            "Hosts with a usable payload in the last cycle"
        ))?;
        let fleetd_hosts_dropped = Gauge::with_opts(opts!(
            "fleetd_hosts_dropped",
            "Hosts skipped in the last cycle because their payload was empty or invalid"
        ))?;
        let fleetd_rows_updated = Gauge::with_opts(opts!(
            "fleetd_rows_updated",
            "Device rows updated in the last cycle"
        ))?;
        let fleetd_unknown_labels = Gauge::with_opts(opts!(
            "fleetd_unknown_labels",
            "Parsed hosts without a matching device row in the last cycle"
        ))?;
        let fleetd_last_cycle_duration_seconds = Gauge::with_opts(opts!(
            "fleetd_last_cycle_duration_seconds",
            "Wall time of the last cycle"
        ))?;
        let fleetd_last_success_timestamp_seconds = Gauge::with_opts(opts!(
            "fleetd_last_success_timestamp_seconds",
            "Unix time the last successful cycle finished"
        ))?;
        let fleetd_uptime_seconds =
            Gauge::with_opts(opts!("fleetd_uptime_seconds", "Daemon uptime in seconds"))?;
        let fleetd_scrape_count_total = Counter::with_opts(opts!(
            "fleetd_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &fleetd_cycles_total)?;
        register(&registry, &fleetd_cycle_failures_total)?;
        register(&registry, &fleetd_hosts_reported)?;
        register(&registry, &fleetd_hosts_parsed)?;
        register(&registry, &fleetd_hosts_dropped)?;
        register(&registry, &fleetd_rows_updated)?;
        register(&registry, &fleetd_unknown_labels)?;
        register(&registry, &fleetd_last_cycle_duration_seconds)?;
        register(&registry, &fleetd_last_success_timestamp_seconds)?;
        register(&registry, &fleetd_uptime_seconds)?;
        register(&registry, &fleetd_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            fleetd_cycles_total,
            fleetd_cycle_failures_total,
            fleetd_hosts_reported,
            fleetd_hosts_parsed,
            fleetd_hosts_dropped,
            fleetd_rows_updated,
            fleetd_unknown_labels,
            fleetd_last_cycle_duration_seconds,
            fleetd_last_success_timestamp_seconds,
            fleetd_uptime_seconds,
            fleetd_scrape_count_total,
        }))
    }

    pub fn update_from_state(&self, state: &State) {
        if let Some(cycle) = &state.last_cycle {
            self.fleetd_hosts_reported.set(cycle.hosts_reported as f64);
            self.fleetd_hosts_parsed.set(cycle.hosts_parsed as f64);
            self.fleetd_hosts_dropped.set(cycle.hosts_dropped as f64);
            self.fleetd_rows_updated.set(cycle.rows_updated as f64);
            self.fleetd_unknown_labels
                .set(cycle.unknown_labels.len() as f64);
            self.fleetd_last_cycle_duration_seconds
                .set(cycle.duration_ms as f64 / 1000.0);
        }
        if let Some(ts) = state.last_success_unix {
            self.fleetd_last_success_timestamp_seconds.set(ts as f64);
        }
        let uptime = now_unix().saturating_sub(state.started_at_unix) as f64;
        self.fleetd_uptime_seconds.set(uptime);
    }

    pub fn inc_cycle(&self) {
        self.fleetd_cycles_total.inc();
    }

    pub fn inc_cycle_failure(&self, stage: &str) {
        self.fleetd_cycle_failures_total
            .with_label_values(&[stage])
            .inc();
    }

    pub fn inc_scrape_count(&self) {
        self.fleetd_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
