//! Terminal stand-ins for the session and UI collaborators.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::info;

pub struct ConsoleSession {
    token: String,
    logged_in: AtomicBool,
}

impl ConsoleSession {
    pub fn new(token: String) -> Self {
        Self {
            token,
            logged_in: AtomicBool::new(true),
        }
    }

    pub fn end(&self) {
        self.logged_in.store(false, Ordering::SeqCst);
    }
}

impl push_channel::Session for ConsoleSession {
    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    fn auth_token(&self) -> String {
        self.token.clone()
    }
}

/// Nobody is watching the terminal: wake-ups are acknowledged at once.
pub struct ConsoleUi;

#[async_trait]
impl push_channel::Ui for ConsoleUi {
    async fn acknowledge_wake_up(&self) -> bool {
        info!("runtime was suspended, resuming channels");
        true
    }

    fn show_busy(&self) {
        info!("print in progress");
    }

    fn hide_busy(&self) {
        info!("print request settled");
    }
}
