//! Confirmed publishing.
//!
//! A confirmed publisher watches the get topic of its property after every
//! publish. If the device does not echo the expected value within the
//! confirmation period, the value is published again up to `retryLimit` times
//! and the device may be marked offline.
//!
//! ```text
//!            publish                     timeout (retries left)
//! Idle ─────────────────► Waiting ─────────────────────────┐
//!  ▲                        │  ▲                           │
//!  │   expected message     │  └───────── republish ◄──────┘
//!  └────────────────────────┘
//!                           │ timeout (no retries left)
//!                           ▼
//!                      Unresponsive
//! ```

use serde_json::Value;
use std::time::Duration;
use tokio_util::time::delay_queue::Key;
use tracing::{error, info, warn};

use crate::device::timers::{TimerKind, Timers};
use crate::mqtt::message_manager::{loosely_equal, stringify};
use crate::topic::TopicSpec;

pub type PublisherId = usize;

/// Publishing function handed out to callers
#[derive(Clone, Debug, PartialEq)]
pub enum Publisher {
    /// Publishes through the regular pipeline without confirmation
    Direct {
        set_topic: Option<TopicSpec>,
        property: String,
    },
    Confirmed(PublisherId),
}

/// What happened when a confirmation period elapsed
#[derive(Debug, PartialEq)]
pub struct TimeoutOutcome {
    /// The device has just been marked offline
    pub offline: bool,
    /// Value to publish again
    pub retry: Option<Value>,
}

pub struct ConfirmedPublisher {
    pub set_topic: Option<TopicSpec>,
    pub get_topic: TopicSpec,
    pub property: String,
    expected: Option<Value>,
    timer: Option<Key>,
    retries_remaining: u32,
    indicated_offline: bool,
    retry_limit: u32,
    period: Duration,
    indicate_offline: bool,
}

impl ConfirmedPublisher {
    pub fn new(
        set_topic: Option<TopicSpec>,
        get_topic: TopicSpec,
        property: impl Into<String>,
        retry_limit: u32,
        period: Duration,
        indicate_offline: bool,
    ) -> Self {
        Self {
            set_topic,
            get_topic,
            property: property.into(),
            expected: None,
            timer: None,
            retries_remaining: 0,
            indicated_offline: false,
            retry_limit,
            period,
            indicate_offline,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.timer.is_some()
    }

    pub fn expected(&self) -> Option<&Value> {
        self.expected.as_ref()
    }

    /// New value from the caller. Returns the value to publish.
    pub fn start(&mut self, id: PublisherId, value: Value, timers: &mut Timers) -> Value {
        timers.cancel(&mut self.timer);
        self.retries_remaining = self.retry_limit;
        self.arm(id, value, timers)
    }

    fn arm(&mut self, id: PublisherId, value: Value, timers: &mut Timers) -> Value {
        timers.arm(&mut self.timer, TimerKind::Confirmation(id), self.period);
        self.expected = Some(value.clone());
        value
    }

    /// Message on the get topic. Returns `Some(true)` when the device comes back online.
    pub fn on_message(&mut self, message: &Value, timers: &mut Timers) -> Option<bool> {
        let confirmed = self
            .expected
            .as_ref()
            .is_some_and(|expected| loosely_equal(message, expected));
        if confirmed && self.timer.is_some() {
            timers.cancel(&mut self.timer);
        }

        if self.indicated_offline && self.timer.is_none() {
            self.indicated_offline = false;
            info!("Setting accessory state to online");
            return Some(true);
        }
        None
    }

    /// The confirmation period elapsed without the expected message.
    pub fn on_timeout(&mut self, id: PublisherId, timers: &mut Timers) -> TimeoutOutcome {
        self.timer = None;

        let offline = self.indicate_offline && !self.indicated_offline;
        if offline {
            self.indicated_offline = true;
            warn!("Setting accessory state to offline");
        }

        let retry = match self.expected.clone() {
            Some(value) if self.retries_remaining > 0 => {
                self.retries_remaining -= 1;
                Some(self.arm(id, value, timers))
            }
            expected => {
                error!(
                    "Unresponsive - no confirmation message received on {}. Expecting [{}].",
                    self.get_topic,
                    expected.as_ref().map(stringify).unwrap_or_default()
                );
                None
            }
        };

        TimeoutOutcome { offline, retry }
    }
}
