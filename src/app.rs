//! Application wiring.
//!
//! Owns the store, the knowledge base, the optional AI gateway and the scan
//! policy, and starts the three background tasks the shell runs against:
//! the connectivity monitor, the reconciliation worker and the scan scheduler.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::ai::{gateway_from_config, AiGateway, LocalKnowledgeBase};
use crate::assistant::{Assistant, AskOutcome};
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState, HttpProbe, ReachabilityProbe};
use crate::models::ScanLogEntry;
use crate::notifications::{CoreEvent, EventSink};
use crate::reconcile::ReconciliationWorker;
use crate::scanner::{ScanHandle, ScanPolicy, ScanScheduler};
use crate::shell::render::StatusView;
use crate::store::Store;

/// Main application struct.
pub struct App {
    config: Config,
    store: Arc<Store>,
    knowledge: Arc<LocalKnowledgeBase>,
    gateway: Option<Arc<dyn AiGateway>>,
    policy: Arc<dyn ScanPolicy>,
}

/// Handles to the running background tasks.
pub struct Services {
    pub events: mpsc::UnboundedReceiver<CoreEvent>,
    pub connectivity: watch::Receiver<ConnectivityState>,
    pub scans: ScanHandle,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Services {
    /// Signal every task and wait for them to finish. In-flight work that
    /// has not committed is dropped.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
    }
}

impl App {
    pub fn new(config: Config, policy: Arc<dyn ScanPolicy>) -> Result<Self> {
        let store = Store::open(&config.database_path).with_context(|| {
            format!("Failed to open database at {}", config.database_path.display())
        })?;
        let knowledge = LocalKnowledgeBase::load(&config.knowledge_base_path);
        let gateway = gateway_from_config(&config, &store);
        tracing::info!(
            db = %config.database_path.display(),
            provider = gateway.as_deref().map(|g| g.name()).unwrap_or("none"),
            policy = policy.name(),
            "application initialized"
        );

        Ok(Self {
            config,
            store: Arc::new(store),
            knowledge: Arc::new(knowledge),
            gateway,
            policy,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn probe(&self) -> Arc<dyn ReachabilityProbe> {
        Arc::new(HttpProbe::new(
            self.config.probe_urls.clone(),
            self.config.probe_timeout(),
        ))
    }

    pub fn assistant(&self, connectivity: watch::Receiver<ConnectivityState>) -> Assistant {
        Assistant::new(
            self.store.clone(),
            self.gateway.clone(),
            self.knowledge.clone(),
            connectivity,
            self.config.offline_first,
            self.config.ai_timeout(),
        )
    }

    fn scheduler(&self, events: EventSink) -> ScanScheduler {
        ScanScheduler::new(
            self.store.clone(),
            self.policy.clone(),
            events,
            self.config.scan_interval_secs,
            self.config.scan_cooldown(),
            Utc::now(),
        )
    }

    /// Spawn the monitor, the reconciler (when a provider exists) and the scheduler.
    pub fn start(&self) -> Services {
        let (events, events_rx) = EventSink::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        let monitor = ConnectivityMonitor::new(
            self.probe(),
            self.config.connectivity_poll_interval(),
            self.config.connectivity_debounce(),
            events.clone(),
            trigger_tx,
        );
        let connectivity = monitor.subscribe();
        tasks.push(tokio::spawn(monitor.run(shutdown_rx.clone())));

        match &self.gateway {
            Some(gateway) => {
                let worker = ReconciliationWorker::new(
                    self.store.clone(),
                    gateway.clone(),
                    events.clone(),
                    self.config.retry_ceiling,
                    self.config.ai_timeout(),
                )
                .with_knowledge(self.knowledge.clone());
                tasks.push(tokio::spawn(worker.run(trigger_rx, shutdown_rx.clone())));
            }
            None => {
                tracing::info!("no AI provider configured, queued questions stay pending");
                drop(trigger_rx);
            }
        }

        let scheduler = self.scheduler(events);
        let scans = scheduler.handle();
        tasks.push(tokio::spawn(scheduler.run(shutdown_rx)));

        Services {
            events: events_rx,
            connectivity,
            scans,
            shutdown: shutdown_tx,
            tasks,
        }
    }

    /// Ask one question outside the shell, using a single probe for connectivity.
    pub async fn ask_once(&self, text: &str) -> Result<AskOutcome> {
        let online = self.probe().is_reachable().await;
        let (_state_tx, state_rx) = watch::channel(ConnectivityState {
            is_online: online,
            last_checked: Utc::now(),
        });
        let assistant = self.assistant(state_rx);
        assistant
            .ask(text)
            .await
            .context("Failed to record the question")
    }

    /// Run one scan cycle outside the shell.
    pub async fn scan_once(&self) -> Result<Option<ScanLogEntry>> {
        let (events, mut events_rx) = EventSink::channel();
        let mut scheduler = self.scheduler(events);
        let entry = scheduler.trigger_manual(Utc::now()).await;
        if entry.is_none() {
            if let Ok(CoreEvent::StorageFault { operation, message }) = events_rx.try_recv() {
                anyhow::bail!("{} failed: {}", operation, message);
            }
        }
        Ok(entry)
    }

    pub fn status(&self, services: &Services) -> Result<StatusView> {
        let connectivity = *services.connectivity.borrow();
        Ok(StatusView {
            online: connectivity.is_online,
            last_checked: connectivity.last_checked,
            provider: self.gateway.as_deref().map(|g| g.name().to_string()),
            scheduler: services.scans.state().label(),
            pending: self.store.list_pending()?.len(),
            knowledge_pairs: self.knowledge.len(),
            db_path: self.store.path().display().to_string(),
            db_bytes: self.store.db_size_bytes(),
            tables: self.store.table_stats()?,
        })
    }
}
