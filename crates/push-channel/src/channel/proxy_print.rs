//! The print-completion channel, polled while a proxy print is in flight.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{ChannelKind, ChannelSubscription, RepollSource};
use crate::types::RepollPolicy;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PrintCompleted {
    pub printer: String,
    pub pages: u32,
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyPrintEvent {
    Printed(PrintCompleted),
    Error {
        #[serde(default)]
        error: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProxyPrintPollArgs {
    pub user: String,
    pub printer: String,
    pub language: String,
    pub country: String,
}

#[derive(Clone, Default)]
pub struct ProxyPrintHandlers {
    printed: Option<Arc<dyn Fn(PrintCompleted) + Send + Sync>>,
    event_error: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

pub struct ProxyPrintChannel;

impl ChannelKind for ProxyPrintChannel {
    type Event = ProxyPrintEvent;
    type PollArgs = ProxyPrintPollArgs;
    type Handlers = ProxyPrintHandlers;

    const LABEL: &'static str = "proxy_print";
    const PAUSE_SUPPRESSES_DISPATCH: bool = false;
    const SHOWS_BUSY: bool = true;

    fn dispatch(
        h: &ProxyPrintHandlers,
        event: ProxyPrintEvent,
        _repoll: &RepollSource,
    ) -> RepollPolicy {
        match event {
            ProxyPrintEvent::Printed(done) => {
                if let Some(handler) = &h.printed {
                    handler(done);
                }
            }
            ProxyPrintEvent::Error { error } => match &h.event_error {
                Some(handler) => handler(&error),
                None => tracing::warn!(channel = Self::LABEL, "Unhandled server error event: {error}"),
            },
            ProxyPrintEvent::Unknown => {
                tracing::warn!(channel = Self::LABEL, "Unknown event kind ignored");
            }
        }
        RepollPolicy::Suppressed
    }
}

impl ChannelSubscription<ProxyPrintChannel> {
    pub fn on_printed(&self, handler: impl Fn(PrintCompleted) + Send + Sync + 'static) {
        self.set_handler(|h| h.printed = Some(Arc::new(handler)));
    }

    pub fn on_event_error(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.set_handler(|h| h.event_error = Some(Arc::new(handler)));
    }
}
