//! Builder wiring a [`LabBroker`] from configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::config::BrokerConfig;
use crate::core::{
    AgentTransport, AverageSessionPolicy, BookingLedger, CompilationPipeline, EventBus,
    HardwareBridge, HardwareLogSink, InMemoryHardwareLog, LabBroker, LabError, LabLanes,
    LabRegistry, LabStore, QueueLimits, ReservationQueue, SessionManager, SessionPolicy,
    WaitPolicy,
};
use crate::infra::InMemoryLabStore;
use crate::util::{SharedClock, SystemClock};

/// Assembles broker components; everything but the transport has a default.
pub struct BrokerBuilder {
    config: BrokerConfig,
    transport: Option<Arc<dyn AgentTransport>>,
    store: Option<Arc<dyn LabStore>>,
    clock: Option<SharedClock>,
    hardware_log: Option<Box<dyn HardwareLogSink>>,
    wait_policy: Option<Arc<dyn WaitPolicy>>,
}

impl BrokerBuilder {
    /// Start from a configuration.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            transport: None,
            store: None,
            clock: None,
            hardware_log: None,
            wait_policy: None,
        }
    }

    /// Configuration the broker will be built from.
    #[must_use]
    pub const fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Message bus to the lab agents. Required.
    #[must_use]
    pub fn transport(mut self, transport: impl AgentTransport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Storage backend. Defaults to [`InMemoryLabStore`].
    #[must_use]
    pub fn store(mut self, store: Arc<dyn LabStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Clock source. Defaults to [`SystemClock`].
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Hardware audit sink. Defaults to a bounded [`InMemoryHardwareLog`].
    #[must_use]
    pub fn hardware_log(mut self, sink: impl HardwareLogSink + 'static) -> Self {
        self.hardware_log = Some(Box::new(sink));
        self
    }

    /// Wait estimate policy. Defaults to [`AverageSessionPolicy`] from config.
    #[must_use]
    pub fn wait_policy(mut self, policy: Arc<dyn WaitPolicy>) -> Self {
        self.wait_policy = Some(policy);
        self
    }

    /// Validate the configuration, open the store and register every lab.
    ///
    /// # Errors
    /// [`LabError::Config`] for invalid configuration or a missing
    /// transport, [`LabError::Storage`] if the store cannot be opened.
    pub fn build(self) -> Result<LabBroker, LabError> {
        let cfg = self.config;
        cfg.validate()
            .map_err(|e| LabError::Config(format!("config invalid: {e}")))?;
        let transport = self
            .transport
            .ok_or_else(|| LabError::Config("an agent transport is required".into()))?;

        let store: Arc<dyn LabStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryLabStore::new()),
        };
        store.open()?;
        let clock: SharedClock = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock::new()),
        };
        let hardware_log: Box<dyn HardwareLogSink> = match self.hardware_log {
            Some(sink) => sink,
            None => Box::new(InMemoryHardwareLog::new(cfg.hardware_log_capacity)),
        };
        let wait_policy: Arc<dyn WaitPolicy> = match self.wait_policy {
            Some(policy) => policy,
            None => Arc::new(AverageSessionPolicy {
                history_window: cfg.wait_estimate.history_window,
                fallback_session: Duration::from_secs(cfg.wait_estimate.fallback_session_secs),
            }),
        };

        let events = EventBus::new(cfg.event_capacity);
        let lanes = Arc::new(LabLanes::new());
        let registry = Arc::new(LabRegistry::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            events.clone(),
            cfg.heartbeat_offline(),
            cfg.offline_status_after_sweeps,
        ));
        let queue = Arc::new(ReservationQueue::new(
            QueueLimits {
                entry_ttl: cfg.queue_entry_ttl(),
                max_bid: cfg.max_bid,
                max_depth: cfg.max_queue_depth,
            },
            wait_policy,
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&clock),
            events.clone(),
        ));
        let bridge = Arc::new(HardwareBridge::new(
            transport,
            hardware_log,
            Arc::clone(&clock),
            events.clone(),
        ));
        let bookings = Arc::new(BookingLedger::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            cfg.booking_no_show_grace(),
        ));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&bridge),
            Arc::clone(&bookings),
            lanes,
            Arc::clone(&store),
            Arc::clone(&clock),
            events.clone(),
            SessionPolicy {
                warning_thresholds_secs: cfg.warning_thresholds_secs.clone(),
                confirm_grace: cfg.promotion_confirm_grace(),
                xp: cfg.xp.clone(),
            },
        ));
        let pipeline = Arc::new(CompilationPipeline::new(
            Arc::clone(&sessions),
            Arc::clone(&registry),
            Arc::clone(&bridge),
            Arc::clone(&store),
            Arc::clone(&clock),
            events.clone(),
            cfg.compilation_stall(),
        ));

        let broker = LabBroker {
            registry,
            queue,
            sessions,
            bridge,
            pipeline,
            bookings,
            store,
            clock,
            events,
        };

        let mut ids: Vec<_> = cfg.labs.keys().cloned().collect();
        ids.sort();
        for id in ids {
            if let Some(lab) = cfg.labs.get(&id) {
                broker.register_lab(lab.to_lab(&id))?;
            }
        }
        tracing::info!(labs = cfg.labs.len(), "lab broker built");
        Ok(broker)
    }
}
