//! The card-reader channel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{ChannelKind, ChannelSubscription, RepollSource};
use crate::types::RepollPolicy;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CardSwipe {
    pub card_number: String,
    /// Reader that saw the card, when the server reports it.
    pub device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceEvent {
    CardSwipe(CardSwipe),
    Error {
        #[serde(default)]
        error: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DevicePollArgs {
    pub language: String,
    pub country: String,
}

#[derive(Clone, Default)]
pub struct DeviceHandlers {
    card_swipe: Option<Arc<dyn Fn(CardSwipe) + Send + Sync>>,
    event_error: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

pub struct DeviceChannel;

impl ChannelKind for DeviceChannel {
    type Event = DeviceEvent;
    type PollArgs = DevicePollArgs;
    type Handlers = DeviceHandlers;

    const LABEL: &'static str = "device";
    const PAUSE_SUPPRESSES_DISPATCH: bool = false;

    /// The owning view decides when to poll again.
    fn dispatch(h: &DeviceHandlers, event: DeviceEvent, _repoll: &RepollSource) -> RepollPolicy {
        match event {
            DeviceEvent::CardSwipe(swipe) => {
                if let Some(handler) = &h.card_swipe {
                    handler(swipe);
                }
            }
            DeviceEvent::Error { error } => match &h.event_error {
                Some(handler) => handler(&error),
                None => tracing::warn!(channel = Self::LABEL, "Unhandled server error event: {error}"),
            },
            DeviceEvent::Unknown => {
                tracing::warn!(channel = Self::LABEL, "Unknown event kind ignored");
            }
        }
        RepollPolicy::Suppressed
    }
}

impl ChannelSubscription<DeviceChannel> {
    pub fn on_card_swipe(&self, handler: impl Fn(CardSwipe) + Send + Sync + 'static) {
        self.set_handler(|h| h.card_swipe = Some(Arc::new(handler)));
    }

    pub fn on_event_error(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.set_handler(|h| h.event_error = Some(Arc::new(handler)));
    }
}
