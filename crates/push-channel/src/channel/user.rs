//! The primary user-event channel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{ChannelKind, ChannelSubscription, DeferredRepoll, RepollSource};
use crate::types::RepollPolicy;

/// New print jobs arrived in the user's inbox.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PrintIn {
    pub data: serde_json::Value,
    /// Server time of the newest message, echoed back as `prevMsgTime`.
    pub msg_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserEvent {
    PrintIn(PrintIn),
    PrintInExpired {
        #[serde(default)]
        data: serde_json::Value,
    },
    PrintMsg {
        #[serde(default)]
        msg: String,
    },
    Account {
        #[serde(default)]
        data: serde_json::Value,
    },
    JobTicket {
        #[serde(default)]
        data: serde_json::Value,
    },
    /// The server's hold time elapsed with nothing to report.
    Null,
    Error {
        #[serde(default)]
        error: String,
    },
    ServerShutdown {
        #[serde(default)]
        msg: String,
    },
    #[serde(rename = "SYS_MAINTENANCE")]
    Maintenance {
        #[serde(default)]
        msg: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPollArgs {
    pub user: String,
    pub page_offset: u32,
    pub unique_url_value: String,
    pub prev_msg_time: i64,
    pub language: String,
    pub country: String,
    pub base64: bool,
}

type Notify<T> = Option<Arc<dyn Fn(T) + Send + Sync>>;

#[derive(Clone, Default)]
pub struct UserHandlers {
    print_in: Option<Arc<dyn Fn(PrintIn, DeferredRepoll) + Send + Sync>>,
    print_in_expired: Notify<serde_json::Value>,
    print_msg: Notify<String>,
    account: Notify<serde_json::Value>,
    job_ticket: Notify<serde_json::Value>,
    event_error: Option<Arc<dyn Fn(&str) -> RepollPolicy + Send + Sync>>,
    server_shutdown: Notify<String>,
    maintenance: Notify<String>,
    forced_logout: Option<Arc<dyn Fn() + Send + Sync>>,
}

fn notify<T>(handler: &Notify<T>, value: T) {
    if let Some(handler) = handler {
        handler(value);
    }
}

pub struct UserChannel;

impl ChannelKind for UserChannel {
    type Event = UserEvent;
    type PollArgs = UserPollArgs;
    type Handlers = UserHandlers;

    const LABEL: &'static str = "user";
    const PAUSE_SUPPRESSES_DISPATCH: bool = true;
    const SIGNALS_PAUSE: bool = true;

    /// A maintenance shutdown is a forced logout and must get through even
    /// while live updates are paused.
    fn is_forced(event: &UserEvent) -> bool {
        matches!(event, UserEvent::Maintenance { .. })
    }

    fn dispatch(h: &UserHandlers, event: UserEvent, repoll: &RepollSource) -> RepollPolicy {
        match event {
            UserEvent::PrintIn(print_in) => match &h.print_in {
                Some(handler) => {
                    handler(print_in, repoll.defer());
                    RepollPolicy::Deferred
                }
                None => RepollPolicy::Immediate,
            },
            UserEvent::PrintInExpired { data } => {
                notify(&h.print_in_expired, data);
                RepollPolicy::Immediate
            }
            UserEvent::PrintMsg { msg } => {
                notify(&h.print_msg, msg);
                RepollPolicy::Immediate
            }
            UserEvent::Account { data } => {
                notify(&h.account, data);
                RepollPolicy::Immediate
            }
            UserEvent::JobTicket { data } => {
                notify(&h.job_ticket, data);
                RepollPolicy::Immediate
            }
            UserEvent::Null => RepollPolicy::Immediate,
            UserEvent::Error { error } => match &h.event_error {
                Some(handler) => handler(&error),
                None => {
                    tracing::warn!(channel = Self::LABEL, "Unhandled server error event: {error}");
                    RepollPolicy::Suppressed
                }
            },
            UserEvent::ServerShutdown { msg } => {
                notify(&h.server_shutdown, msg);
                RepollPolicy::Suppressed
            }
            UserEvent::Maintenance { msg } => {
                notify(&h.maintenance, msg);
                if let Some(forced_logout) = &h.forced_logout {
                    forced_logout();
                }
                RepollPolicy::Suppressed
            }
            UserEvent::Unknown => {
                tracing::warn!(channel = Self::LABEL, "Unknown event kind, polling on");
                RepollPolicy::Immediate
            }
        }
    }
}

impl ChannelSubscription<UserChannel> {
    /// The handler owns the next poll: it must resolve the token once its
    /// follow-up work is done.
    pub fn on_print_in(&self, handler: impl Fn(PrintIn, DeferredRepoll) + Send + Sync + 'static) {
        self.set_handler(|h| h.print_in = Some(Arc::new(handler)));
    }

    pub fn on_print_in_expired(&self, handler: impl Fn(serde_json::Value) + Send + Sync + 'static) {
        self.set_handler(|h| h.print_in_expired = Some(Arc::new(handler)));
    }

    pub fn on_print_msg(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        self.set_handler(|h| h.print_msg = Some(Arc::new(handler)));
    }

    pub fn on_account(&self, handler: impl Fn(serde_json::Value) + Send + Sync + 'static) {
        self.set_handler(|h| h.account = Some(Arc::new(handler)));
    }

    pub fn on_job_ticket(&self, handler: impl Fn(serde_json::Value) + Send + Sync + 'static) {
        self.set_handler(|h| h.job_ticket = Some(Arc::new(handler)));
    }

    /// Server-reported error. The returned policy decides whether polling
    /// continues.
    pub fn on_event_error(
        &self,
        handler: impl Fn(&str) -> RepollPolicy + Send + Sync + 'static,
    ) {
        self.set_handler(|h| h.event_error = Some(Arc::new(handler)));
    }

    pub fn on_server_shutdown(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        self.set_handler(|h| h.server_shutdown = Some(Arc::new(handler)));
    }

    /// Fires even while paused.
    pub fn on_maintenance(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        self.set_handler(|h| h.maintenance = Some(Arc::new(handler)));
    }

    pub(crate) fn on_forced_logout(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.set_handler(|h| h.forced_logout = Some(Arc::new(hook)));
    }
}
