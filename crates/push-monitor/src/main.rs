mod console;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use clap::Parser;
use push_channel::{
    BayeuxTransport, CardSwipe, DevicePollArgs, RepollPolicy, SessionContext, UserPollArgs,
};
use tokio::sync::{Notify, mpsc};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::FormatTime;

use console::{ConsoleSession, ConsoleUi};

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

/// Log in to a print server and follow its push events.
#[derive(Parser)]
#[command(name = "push-monitor", version)]
struct Cli {
    /// Client config (YAML)
    #[arg(long)]
    config: PathBuf,
    /// Authentication token presented at handshake
    #[arg(long, env = "PUSH_MONITOR_TOKEN", hide_env_values = true)]
    token: String,
    /// User id sent with every user-channel poll
    #[arg(long)]
    user: String,
    /// Also follow the card-reader channel
    #[arg(long)]
    device: bool,
    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_max_level(level)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), push_channel::Error> {
    let config = push_channel::load(&cli.config).await?;
    info!(url = %config.server.url, user = %cli.user, "starting");

    let session = Arc::new(ConsoleSession::new(cli.token));
    let transport = Arc::new(BayeuxTransport::new(&config)?);
    let ctx = SessionContext::new(transport, session.clone(), Arc::new(ConsoleUi), &config)?;

    let closed = Arc::new(Notify::new());
    let (swipe_tx, mut swipe_rx) = mpsc::unbounded_channel::<CardSwipe>();
    wire_connection(&ctx, closed.clone(), cli.device);
    wire_user_channel(&ctx, cli.user);
    wire_device_channel(&ctx, swipe_tx);

    ctx.configure_watchdog()?;
    ctx.login();

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("received signal, logging out");
                break;
            }
            _ = closed.notified() => {
                info!("connection closed");
                break;
            }
            Some(swipe) = swipe_rx.recv() => {
                info!(card = %swipe.card_number, device = ?swipe.device, "card swiped");
                ctx.device().poll(DevicePollArgs::default());
            }
        }
    }

    session.end();
    ctx.logout();
    Ok(())
}

fn wire_connection(ctx: &SessionContext, closed: Arc<Notify>, follow_device: bool) {
    let connection = ctx.connection();
    connection.on_connecting(|| info!("connecting"));
    connection.on_handshake_failure(|error| warn!(error = ?error, "handshake failed"));
    connection.on_reconnect(|| info!("reconnected"));
    connection.on_connection_broken(|| warn!("connection broken, restoring"));
    connection.on_connection_closed(move || closed.notify_one());

    if follow_device {
        let device = ctx.device().clone();
        connection.on_handshake_success(move || device.add_listener());
    }
}

fn wire_user_channel(ctx: &SessionContext, user: String) {
    let channel = ctx.user();
    let last_msg_time = Arc::new(AtomicI64::new(0));

    let msg_time = last_msg_time.clone();
    channel.on_poll_invitation(move || UserPollArgs {
        user: user.clone(),
        prev_msg_time: msg_time.load(Ordering::SeqCst),
        ..Default::default()
    });

    let msg_time = last_msg_time;
    channel.on_print_in(move |event, repoll| {
        info!(data = %event.data, "print jobs arrived");
        if let Some(time) = event.msg_time {
            msg_time.store(time, Ordering::SeqCst);
        }
        repoll.repoll();
    });
    channel.on_print_in_expired(|data| info!(data = %data, "print jobs expired"));
    channel.on_print_msg(|msg| info!("server message: {msg}"));
    channel.on_account(|data| info!(data = %data, "account changed"));
    channel.on_job_ticket(|data| info!(data = %data, "job ticket changed"));
    channel.on_event_error(|error| {
        warn!("server reported an error, user channel stopped: {error}");
        RepollPolicy::Suppressed
    });
    channel.on_server_shutdown(|msg| warn!("server shutting down: {msg}"));
    channel.on_maintenance(|msg| warn!("server entering maintenance: {msg}"));
    channel.on_exception(|error| warn!(channel = "user", "{error}"));
}

fn wire_device_channel(ctx: &SessionContext, swipes: mpsc::UnboundedSender<CardSwipe>) {
    let channel = ctx.device();
    channel.on_card_swipe(move |swipe| {
        let _ = swipes.send(swipe);
    });
    channel.on_event_error(|error| warn!(channel = "device", "server error: {error}"));
    channel.on_exception(|error| warn!(channel = "device", "{error}"));
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();
    tokio::select! {
        _ = recv_signal(&mut sigterm) => {}
        _ = recv_signal(&mut sigint) => {}
    }
}

async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
