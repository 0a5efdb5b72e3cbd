//! Change-filtered publication of meter readings.

use std::future::Future;

use jsy_common::{Format, KeyExprBuilder, MeterLiveness, MeterReading, encode};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zenoh::Session;

use crate::config::{ChannelSpec, SensorConfig};
use crate::registers::{CHANNEL_COUNT, Channel};

/// Something a meter reports to its subscribers.
#[derive(Debug, Clone)]
pub enum Notification {
    Reading(MeterReading),
    Availability(MeterLiveness),
}

/// Destination of notifications.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, notification: Notification) -> impl Future<Output = ()> + Send;
}

/// Forwards notifications into an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn unbounded() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    async fn deliver(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            debug!("Notification receiver dropped");
        }
    }
}

/// Publishes notifications on a Zenoh session.
#[derive(Clone)]
pub struct ZenohSink {
    session: Session,
    keys: KeyExprBuilder,
    format: Format,
}

impl ZenohSink {
    pub fn new(session: Session, keys: KeyExprBuilder, format: Format) -> Self {
        Self {
            session,
            keys,
            format,
        }
    }
}

impl NotificationSink for ZenohSink {
    async fn deliver(&self, notification: Notification) {
        let (key, payload) = match &notification {
            Notification::Reading(reading) => (
                self.keys.reading(&reading.meter, &reading.channel),
                encode(reading, self.format),
            ),
            Notification::Availability(liveness) => (
                self.keys.liveness(&liveness.meter),
                encode(liveness, self.format),
            ),
        };

        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode notification");
                return;
            }
        };

        if let Err(e) = self
            .session
            .put(&key, payload)
            .encoding(self.format.mime_type())
            .await
        {
            warn!(key = %key, error = %e, "Failed to publish notification");
        }
    }
}

/// What [`Publisher::publish`] did with a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// Change smaller than the channel's minimum delta.
    Suppressed,
    /// The meter is unavailable.
    Unavailable,
    /// The channel is not enabled in configuration.
    Disabled,
}

/// State of one channel of a meter.
#[derive(Debug, Clone)]
pub struct MeasurementChannel {
    pub spec: ChannelSpec,
    pub enabled: bool,
    pub current_value: Option<f64>,
    pub last_published_value: Option<f64>,
    pub last_publish_timestamp: Option<i64>,
    force_next: bool,
}

impl MeasurementChannel {
    fn new(spec: ChannelSpec, enabled: bool) -> Self {
        Self {
            spec,
            enabled,
            current_value: None,
            last_published_value: None,
            last_publish_timestamp: None,
            force_next: false,
        }
    }

    fn should_publish(&self, value: f64) -> bool {
        match self.last_published_value {
            _ if self.force_next => true,
            None => true,
            Some(last) => (value - last).abs() >= self.spec.min_delta,
        }
    }

    fn to_reading(&self, meter: &str, value: f64, timestamp: i64) -> MeterReading {
        let channel = self.spec.channel;
        let reading = MeterReading::new(meter, channel.path(), value, self.spec.unit.clone())
            .with_timestamp(timestamp)
            .with_label("device_class", channel.device_class().as_str())
            .with_label("state_class", channel.state_class().as_str())
            .with_label("accuracy_decimals", self.spec.accuracy_decimals.to_string());

        match &self.spec.name {
            Some(name) => reading.with_label("name", name.as_str()),
            None => reading,
        }
    }
}

/// Latest value per channel of one meter, notifying only on significant
/// change.
pub struct Publisher<S> {
    meter: String,
    sink: S,
    channels: Vec<MeasurementChannel>,
    available: bool,
}

impl<S: NotificationSink> Publisher<S> {
    /// Create a publisher for the full channel table. Channels without a
    /// spec are disabled.
    pub fn new(meter: impl Into<String>, specs: &[ChannelSpec], sink: S) -> Self {
        let defaults = SensorConfig::default();
        let channels = Channel::ALL
            .iter()
            .map(|&channel| match specs.iter().find(|s| s.channel == channel) {
                Some(spec) => MeasurementChannel::new(spec.clone(), true),
                None => MeasurementChannel::new(ChannelSpec::resolve(channel, &defaults), false),
            })
            .collect::<Vec<_>>();
        debug_assert_eq!(channels.len(), CHANNEL_COUNT);

        Self {
            meter: meter.into(),
            sink,
            channels,
            available: false,
        }
    }

    pub fn meter(&self) -> &str {
        &self.meter
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn channel(&self, channel: Channel) -> &MeasurementChannel {
        &self.channels[channel.index()]
    }

    /// Latest decoded value, published or not.
    pub fn current_value(&self, channel: Channel) -> Option<f64> {
        self.channel(channel).current_value
    }

    pub fn last_published(&self, channel: Channel) -> Option<f64> {
        self.channel(channel).last_published_value
    }

    pub async fn publish(&mut self, channel: Channel, value: f64, timestamp: i64) -> PublishOutcome {
        let available = self.available;
        let entry = &mut self.channels[channel.index()];

        if !entry.enabled {
            return PublishOutcome::Disabled;
        }
        entry.current_value = Some(value);

        if !available {
            return PublishOutcome::Unavailable;
        }
        if !entry.should_publish(value) {
            return PublishOutcome::Suppressed;
        }

        entry.last_published_value = Some(value);
        entry.last_publish_timestamp = Some(timestamp);
        entry.force_next = false;

        let reading = entry.to_reading(&self.meter, value, timestamp);
        self.sink.deliver(Notification::Reading(reading)).await;
        PublishOutcome::Published
    }

    /// Apply an availability change and notify about it. Returns false when
    /// the availability did not change.
    ///
    /// Restoring availability makes the next sample of every channel publish
    /// regardless of its delta.
    pub async fn set_available(&mut self, available: bool, liveness: MeterLiveness) -> bool {
        if self.available == available {
            return false;
        }

        self.available = available;
        if available {
            for entry in self.channels.iter_mut().filter(|c| c.enabled) {
                entry.force_next = true;
            }
        }

        self.report(liveness).await;
        true
    }

    /// Send a liveness record without changing state.
    pub async fn report(&self, liveness: MeterLiveness) {
        self.sink.deliver(Notification::Availability(liveness)).await;
    }
}
