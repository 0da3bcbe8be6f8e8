//! Harvest Processor: the single-owner main loop tying the connector,
//! delivery, and harvest aggregation together (§4.1).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, RwLock};
use tracing::{info, instrument, warn};

use crate::collector::config::Config;
use crate::domain::agent_run::AgentRun;
use crate::domain::attributes::AttributeValue;
use crate::domain::transaction::EndedTransaction;
use crate::domain_types::{AttributeKey, DataChannelCapacity, Priority, RunId};
use crate::error::CollectorError;
use crate::harvest::harvest::Harvest;
use crate::time_provider::SharedTimeProvider;

use super::connector::Connector;
use super::delivery::{DeliveryOutcome, DeliveryTask};

const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// One unit of telemetry produced by a transaction, the runtime sampler, or
/// a delivery task's merge-back (§4.1 `dataIn`).
#[derive(Debug)]
pub enum Telemetry {
    EndedTransaction(Box<EndedTransaction>),
    ForcedMetric {
        name: String,
        value: f64,
    },
    CustomEvent {
        event_type: String,
        attributes: BTreeMap<AttributeKey, AttributeValue>,
        priority: Priority,
        when: SystemTime,
    },
    /// A whole harvest's worth of payload that a prior delivery attempt
    /// failed to deliver, re-queued for the processor to fold back in.
    MergeBack(Box<Harvest>),
}

/// A `dataIn` message: telemetry tagged with the run it was produced under.
/// Telemetry whose `run_id` no longer matches the live `AgentRun` is dropped —
/// it belongs to a previous connection (§4.1 step 3).
#[derive(Debug)]
pub struct DataMessage {
    pub run_id: RunId,
    pub telemetry: Telemetry,
}

/// A lightweight, cloneable handle producers use to enqueue telemetry.
#[derive(Debug, Clone)]
pub struct DataSender {
    run_id: RunId,
    tx: mpsc::Sender<DataMessage>,
}

impl DataSender {
    /// Enqueues telemetry tagged with the run this sender was created under.
    /// Blocks (applying backpressure) when `dataIn` is full, per §4.1's
    /// explicit preference for backpressure over silent drops.
    pub async fn send(&self, telemetry: Telemetry) {
        let _ = self
            .tx
            .send(DataMessage {
                run_id: self.run_id.clone(),
                telemetry,
            })
            .await;
    }
}

/// The harvest processor's main loop: exactly one task owns the current
/// `AgentRun` and `Harvest`, selecting across the tick timer, `dataIn`, and
/// the connector's single-shot `connected`/`connectError` channels.
pub struct HarvestProcessor {
    config: Config,
    time: SharedTimeProvider,
    pid: u32,
    data_in_capacity: DataChannelCapacity,
    current_run: Arc<RwLock<Option<AgentRun>>>,
    data_tx: Arc<RwLock<Option<mpsc::Sender<DataMessage>>>>,
}

impl HarvestProcessor {
    #[must_use]
    pub fn new(config: Config, time: SharedTimeProvider, pid: u32) -> Self {
        Self {
            config,
            time,
            pid,
            data_in_capacity: DataChannelCapacity::default(),
            current_run: Arc::new(RwLock::new(None)),
            data_tx: Arc::new(RwLock::new(None)),
        }
    }

    /// Read-only access to the currently live `AgentRun`, if connected.
    pub async fn current_run(&self) -> Option<AgentRun> {
        self.current_run.read().await.clone()
    }

    /// A handle host code can use to enqueue telemetry onto `dataIn`, if the
    /// processor is currently connected. Returns `None` before the first
    /// successful connect, or while reconnecting after a forced restart.
    pub async fn data_sender(&self) -> Option<DataSender> {
        let run_id = self.current_run.read().await.as_ref()?.run_id.clone();
        let tx = self.data_tx.read().await.clone()?;
        Some(DataSender { run_id, tx })
    }

    /// Runs the processor forever (or until the connector hits a terminal
    /// error). Intended to be driven inside `tokio::spawn`, typically via an
    /// `Arc<HarvestProcessor>` shared with the code that enqueues telemetry.
    #[instrument(skip(self), fields(app_name = %self.config.app_name))]
    pub async fn run(&self) {
        let (data_tx, mut data_rx) = mpsc::channel::<DataMessage>(self.data_in_capacity.as_usize());
        let (connected_tx, mut connected_rx) = mpsc::channel(1);
        let (connect_error_tx, mut connect_error_rx) = mpsc::channel(1);

        *self.data_tx.write().await = Some(data_tx.clone());
        self.spawn_connector(connected_tx.clone(), connect_error_tx.clone());

        let mut harvest: Option<Harvest> = None;

        loop {
            tokio::select! {
                () = self.time.sleep(TICK_INTERVAL) => {
                    self.on_tick(&mut harvest, data_tx.clone(), connect_error_tx.clone()).await;
                }
                Some(message) = data_rx.recv() => {
                    self.on_data(message, &mut harvest).await;
                }
                Some(run) = connected_rx.recv() => {
                    self.on_connected(run, &mut harvest).await;
                }
                Some(err) = connect_error_rx.recv() => {
                    if self.on_connect_error(err, &mut harvest, connected_tx.clone(), connect_error_tx.clone()).await {
                        return;
                    }
                }
                else => return,
            }
        }
    }

    fn spawn_connector(&self, connected_tx: mpsc::Sender<AgentRun>, connect_error_tx: mpsc::Sender<CollectorError>) {
        let connector = Connector::new(self.config.clone(), self.time.clone());
        let pid = self.pid;
        tokio::spawn(async move {
            connector.run(pid, connected_tx, connect_error_tx).await;
        });
    }

    async fn on_tick(
        &self,
        harvest: &mut Option<Harvest>,
        data_tx: mpsc::Sender<DataMessage>,
        connect_error_tx: mpsc::Sender<CollectorError>,
    ) {
        let run = self.current_run.read().await.clone();
        let Some(run) = run else {
            return;
        };
        let Some(current) = harvest.take() else {
            *harvest = Some(Harvest::new(&run, SystemTime::now()));
            return;
        };
        *harvest = Some(Harvest::new(&run, SystemTime::now()));
        if current.is_empty() {
            return;
        }

        let license_key = self.config.license_key.clone();
        tokio::spawn(async move {
            let delivery = DeliveryTask::new(license_key);
            match delivery.deliver(&run, current).await {
                DeliveryOutcome::Delivered => {}
                DeliveryOutcome::MergeBack(leftover) => {
                    let sender = DataSender {
                        run_id: run.run_id.clone(),
                        tx: data_tx,
                    };
                    sender.send(Telemetry::MergeBack(Box::new(leftover))).await;
                }
                DeliveryOutcome::Fatal(err) => {
                    warn!(%err, "delivery received a fatal response, routing through the connector's error channel");
                    let _ = connect_error_tx.send(err).await;
                }
            }
        });
    }

    async fn on_data(&self, message: DataMessage, harvest: &mut Option<Harvest>) {
        let run = self.current_run.read().await.clone();
        let Some(run) = run else {
            return;
        };
        if message.run_id != run.run_id {
            return;
        }
        let Some(harvest) = harvest.as_mut() else {
            return;
        };
        match message.telemetry {
            Telemetry::EndedTransaction(txn) => harvest.record_ended_transaction(&txn, &run),
            Telemetry::ForcedMetric { name, value } => harvest.record_forced_metric(&name, value),
            Telemetry::CustomEvent {
                event_type,
                attributes,
                priority,
                when,
            } => harvest.record_custom_event(event_type, attributes, priority, when),
            Telemetry::MergeBack(other) => {
                let apdex_based = Duration::from_secs_f64(run.apdex_threshold_seconds.into_inner() * 4.0);
                let threshold = run.tracer_threshold.max(apdex_based);
                harvest.merge_failed(*other, threshold);
            }
        }
    }

    async fn on_connected(&self, run: AgentRun, harvest: &mut Option<Harvest>) {
        info!(run_id = %run.run_id, "connected to collector");
        *harvest = Some(Harvest::new(&run, SystemTime::now()));
        *self.current_run.write().await = Some(run);
    }

    /// Returns `true` if the processor should stop entirely.
    async fn on_connect_error(
        &self,
        err: CollectorError,
        harvest: &mut Option<Harvest>,
        connected_tx: mpsc::Sender<AgentRun>,
        connect_error_tx: mpsc::Sender<CollectorError>,
    ) -> bool {
        *self.current_run.write().await = None;
        *harvest = None;
        match err {
            CollectorError::InvalidLicense => {
                warn!("license rejected by collector, staying disconnected");
                true
            }
            CollectorError::ForceDisconnect => {
                warn!("collector forced a permanent disconnect");
                true
            }
            CollectorError::ForceRestart => {
                warn!("collector requested a restart, reconnecting");
                self.spawn_connector(connected_tx, connect_error_tx);
                false
            }
            other => {
                warn!(%other, "unexpected terminal error from connector");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::test_time_provider;

    fn test_config() -> Config {
        crate::collector::config::ConfigBuilder::new()
            .license_key("abcd1234")
            .app_name("test-app")
            .host("127.0.0.1:1")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn new_processor_starts_with_no_live_run() {
        let processor = HarvestProcessor::new(test_config(), test_time_provider(), 1);
        assert!(processor.current_run().await.is_none());
    }

    #[tokio::test]
    async fn data_message_for_a_stale_run_id_is_a_no_op() {
        let processor = HarvestProcessor::new(test_config(), test_time_provider(), 1);
        let mut harvest = None;
        let stale = DataMessage {
            run_id: RunId::try_from("stale".to_string()).unwrap(),
            telemetry: Telemetry::ForcedMetric {
                name: "Instance/CPU".to_string(),
                value: 0.1,
            },
        };
        processor.on_data(stale, &mut harvest).await;
        assert!(harvest.is_none());
    }
}
