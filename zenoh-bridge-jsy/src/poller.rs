//! Periodic polling of one JSY meter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use jsy_common::MeterLiveness;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::client::ModbusClient;
use crate::config::MeterConfig;
use crate::decoder::{Readings, decode};
use crate::error::{DecodeError, PollError};
use crate::health::{HealthState, Transition};
use crate::publisher::{NotificationSink, PublishOutcome, Publisher};
use crate::registers::{Channel, RegisterBlock, RegisterMap};

/// Lifecycle of a poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PollPhase {
    Idle = 0,
    Polling = 1,
    Succeeded = 2,
    Failed = 3,
}

impl PollPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PollPhase::Polling,
            2 => PollPhase::Succeeded,
            3 => PollPhase::Failed,
            _ => PollPhase::Idle,
        }
    }
}

/// Result of one scheduler tick.
#[derive(Debug)]
pub enum TickOutcome {
    /// Readings were decoded; `published` passed the change filter.
    Succeeded { published: usize },
    Failed(PollError),
    /// A poll of this meter was still outstanding.
    Dropped,
}

/// Returns the phase to idle however the tick ends.
struct PhaseGuard<'a>(&'a AtomicU8);

impl PhaseGuard<'_> {
    fn set(&self, phase: PollPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.set(PollPhase::Idle);
    }
}

struct MeterState<S> {
    health: HealthState,
    publisher: Publisher<S>,
}

/// Polls one meter, decodes its registers and feeds the publisher.
pub struct MeterPoller<T, S> {
    name: String,
    address: u8,
    interval: Duration,
    client: ModbusClient<T>,
    map: RegisterMap,
    blocks: Vec<RegisterBlock>,
    phase: AtomicU8,
    state: Mutex<MeterState<S>>,
}

impl<T, S> MeterPoller<T, S>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
    S: NotificationSink,
{
    pub fn new(config: &MeterConfig, client: ModbusClient<T>, sink: S) -> Self {
        let map = RegisterMap::jsy_mk333(client.function()).select(config.channel_set());
        let blocks = map.request_blocks();
        let publisher = Publisher::new(config.name.clone(), &config.channel_specs(), sink);

        Self {
            name: config.name.clone(),
            address: config.address,
            interval: Duration::from_secs(config.poll_interval_secs),
            client,
            map,
            blocks,
            phase: AtomicU8::new(PollPhase::Idle as u8),
            state: Mutex::new(MeterState {
                health: HealthState::new(config.failure_threshold),
                publisher,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> PollPhase {
        PollPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub async fn liveness(&self) -> MeterLiveness {
        self.state.lock().await.health.liveness(&self.name)
    }

    pub async fn current_value(&self, channel: Channel) -> Option<f64> {
        self.state.lock().await.publisher.current_value(channel)
    }

    /// Run one poll cycle unless one is already outstanding.
    pub async fn tick(&self) -> TickOutcome {
        if self
            .phase
            .compare_exchange(
                PollPhase::Idle as u8,
                PollPhase::Polling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(meter = %self.name, "Previous poll still outstanding, dropping tick");
            return TickOutcome::Dropped;
        }
        let phase = PhaseGuard(&self.phase);

        let result = self.poll_once().await;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        match result {
            Ok(readings) => {
                phase.set(PollPhase::Succeeded);

                if state.health.record_success() == Transition::BecameAvailable {
                    info!(meter = %self.name, "Meter available");
                    let liveness = state.health.liveness(&self.name);
                    state.publisher.set_available(true, liveness).await;
                }

                let timestamp = chrono::Utc::now().timestamp_millis();
                let mut published = 0;
                for (channel, value) in readings.iter() {
                    if state.publisher.publish(channel, value, timestamp).await
                        == PublishOutcome::Published
                    {
                        published += 1;
                    }
                }

                debug!(
                    meter = %self.name,
                    decoded = readings.len(),
                    published,
                    "Poll succeeded"
                );
                TickOutcome::Succeeded { published }
            }
            Err(e) => {
                phase.set(PollPhase::Failed);

                let transition = state.health.record_failure(e.to_string());
                warn!(
                    meter = %self.name,
                    kind = e.kind(),
                    error = %e,
                    consecutive_failures = state.health.consecutive_failures(),
                    "Poll failed"
                );

                if transition == Transition::BecameUnavailable {
                    error!(
                        meter = %self.name,
                        threshold = state.health.threshold(),
                        "Meter unavailable"
                    );
                    let liveness = state.health.liveness(&self.name);
                    state.publisher.set_available(false, liveness).await;
                }

                TickOutcome::Failed(e)
            }
        }
    }

    /// Read every request block into one register image and decode it.
    async fn poll_once(&self) -> Result<Readings, PollError> {
        let mut image = vec![0u8; self.map.span_bytes()];

        for block in &self.blocks {
            let data = self
                .client
                .read_registers(self.address, self.map.start + block.offset, block.count)
                .await?;

            let at = block.offset as usize * 2;
            let required = at + data.len();
            let actual = image.len();
            image
                .get_mut(at..required)
                .ok_or(DecodeError { required, actual })?
                .copy_from_slice(&data);
        }

        Ok(decode(&image, &self.map)?)
    }

    fn log_config(&self) {
        let channels = self
            .map
            .channels()
            .iter()
            .map(|c| c.path())
            .collect::<Vec<_>>()
            .join(", ");

        info!(
            meter = %self.name,
            bus = %self.client.bus().name(),
            address = %format_args!("0x{:02X}", self.address),
            function = self.client.function().as_str(),
            interval_secs = self.interval.as_secs(),
            timeout_ms = self.client.timeout().as_millis() as u64,
            requests = self.blocks.len(),
            channels = %channels,
            "Starting JSY poller"
        );
    }
}

impl<T, S> MeterPoller<T, S>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: NotificationSink + 'static,
{
    /// Tick at the configured interval forever. Late ticks are skipped, and
    /// a tick that finds a poll outstanding is dropped.
    pub async fn run(self: Arc<Self>) {
        self.log_config();

        {
            let state = self.state.lock().await;
            state.publisher.report(state.health.liveness(&self.name)).await;
        }

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let poller = Arc::clone(&self);
            tokio::spawn(async move {
                poller.tick().await;
            });
        }
    }
}
