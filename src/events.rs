//! Command traffic events.
//!
//! Every line an instrument receives and every response it sends is published
//! as a [`CommandEvent`] on an [`EventBus`]. Consumers (the interactive
//! monitor, tests) subscribe independently; publishing never blocks the
//! engine and a lagging subscriber only loses its own backlog.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Direction of a traced line relative to the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from a client.
    In,
    /// Sent back to a client.
    Out,
}

/// One traced command or response.
#[derive(Debug, Clone, Serialize)]
pub struct CommandEvent {
    /// When the line was received or sent.
    pub timestamp: DateTime<Utc>,
    /// Instrument id, the stable key used by the control surface.
    pub instrument: String,
    /// Display name as written in the command table.
    pub instrument_name: String,
    /// Whether the line was received or sent.
    pub direction: Direction,
    /// The command line or response, without its terminator.
    pub payload: String,
    /// Last SCPI error code raised by the command, for `Out` events.
    pub error_code: Option<i32>,
    /// Client address, or `shell` for commands sent from the console.
    pub source: String,
}

impl CommandEvent {
    /// Timestamped now. The display name defaults to the id until
    /// [`CommandEvent::with_instrument_name`] sets it.
    #[must_use]
    pub fn new(
        instrument: impl Into<String>,
        direction: Direction,
        payload: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let instrument = instrument.into();
        Self {
            timestamp: Utc::now(),
            instrument_name: instrument.clone(),
            instrument,
            direction,
            payload: payload.into(),
            error_code: None,
            source: source.into(),
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_instrument_name(mut self, name: impl Into<String>) -> Self {
        self.instrument_name = name.into();
        self
    }

    /// Attaches the SCPI error raised while producing a response.
    #[must_use]
    pub fn with_error_code(mut self, code: Option<i32>) -> Self {
        self.error_code = code;
        self
    }

    /// True when the command raised a SCPI error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }
}

impl fmt::Display for CommandEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.direction {
            Direction::In => "->",
            Direction::Out => "<-",
        };
        write!(
            f,
            "{} [{}] {} {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.instrument_name,
            arrow,
            self.payload
        )?;
        if let Some(code) = self.error_code {
            write!(f, " (error {code})")?;
        }
        Ok(())
    }
}

/// Broadcast fan-out of [`CommandEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CommandEvent>,
}

impl EventBus {
    /// A bus buffering `capacity` events per subscriber (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: CommandEvent) {
        let _ = self.sender.send(event);
    }

    /// Receives every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CommandEvent> {
        self.sender.subscribe()
    }

    /// Live receivers, including the command log.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(CommandEvent::new("psu", Direction::In, "VOLT?", "shell"));

        assert_eq!(a.recv().await.unwrap().payload, "VOLT?");
        assert_eq!(b.recv().await.unwrap().payload, "VOLT?");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(CommandEvent::new("psu", Direction::Out, "1", "shell"));
    }

    #[test]
    fn test_display() {
        let event = CommandEvent::new("psu", Direction::Out, "", "127.0.0.1:4000")
            .with_error_code(Some(-113));
        let text = event.to_string();
        assert!(text.contains("[psu] <-"));
        assert!(text.ends_with("(error -113)"));
        assert!(event.is_error());
    }

    #[test]
    fn test_display_uses_instrument_name() {
        let event = CommandEvent::new("test_psu", Direction::In, "VOLT?", "shell")
            .with_instrument_name("Test PSU");
        assert_eq!(event.instrument, "test_psu");
        assert!(event.to_string().contains("[Test PSU] -> VOLT?"));
    }
}
