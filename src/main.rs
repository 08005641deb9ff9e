//! Flood Scout operator console

use std::sync::Arc;

use chrono::Utc;
use flood_scout::{
    auth::{self, Authenticator, RouteDecision},
    channel::{MemoryChannel, MqttChannelBuilder, RemoteChannel},
    config::{AppConfig, Backend},
    console::{self, ConsoleInput},
    dispatcher::CommandDispatcher,
    errors::FloodScoutError,
    history::HistoryView,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info};

type Channel = dyn RemoteChannel;

#[tokio::main]
async fn main() -> Result<(), FloodScoutError> {
    #[cfg(feature = "dotenvy")]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load configuration, preferring environment variables over config files
    let config = AppConfig::load()?;
    config.validate()?;

    let channel: Arc<Channel> = match config.channel.backend {
        Backend::Mqtt => Arc::new(MqttChannelBuilder::new(&config.mqtt)?.connect()),
        Backend::Memory => Arc::new(MemoryChannel::new()),
    };
    info!(channel = channel.name(), "Remote channel ready");

    let mut console = Console::new(channel, config);
    let result = run_console(&mut console).await;
    info!("Console closed: {:?}", result);

    // Power off and release subscriptions however the console ended
    console.shutdown().await;

    result
}

async fn run_console(console: &mut Console) -> Result<(), FloodScoutError> {
    println!("Flood Scout console, `help` lists commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal");
                return Ok(());
            }
        };
        let Some(line) = line else {
            return Ok(());
        };

        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<ConsoleInput>() {
            Ok(ConsoleInput::Quit) => return Ok(()),
            Ok(input) => console.handle(input).await,
            Err(e) => println!("{}", e),
        }
    }
}

struct Console {
    channel: Arc<Channel>,
    config: AppConfig,
    authenticator: Authenticator,
    dispatcher: Option<CommandDispatcher<Channel>>,
    history: HistoryView<Channel>,
}

impl Console {
    fn new(channel: Arc<Channel>, config: AppConfig) -> Self {
        Self {
            authenticator: Authenticator::new(&config.auth),
            history: HistoryView::new(Arc::clone(&channel), config.history.page_size),
            dispatcher: None,
            channel,
            config,
        }
    }

    async fn handle(&mut self, input: ConsoleInput) {
        match input {
            ConsoleInput::Login { username, password } => {
                self.login(&username, &password).await
            }
            ConsoleInput::Logout => match self.dispatcher.take() {
                Some(mut dispatcher) => {
                    dispatcher.logout().await;
                    println!("Logged out");
                }
                None => println!("Not logged in"),
            },
            ConsoleInput::History => {
                if !self.history.is_mounted() {
                    self.history.mount().await;
                }
                println!("{}", console::render_history(&self.history.snapshot()));
            }
            ConsoleInput::More => {
                self.history.on_scroll_bottom();
                println!("{}", console::render_history(&self.history.snapshot()));
            }
            ConsoleInput::Status { id, status } => {
                match self.history.set_status(id, status).await {
                    Ok(()) => println!("Mission {} is now {}", id, status),
                    Err(e) => println!("{}", e),
                }
            }
            ConsoleInput::Help => println!("{}", console::HELP),
            ConsoleInput::Quit => {}
            dashboard => self.handle_dashboard(dashboard).await,
        }
    }

    async fn login(&mut self, username: &str, password: &str) {
        if self.enter(auth::LOGIN_PATH).is_err() {
            println!("Already logged in");
            return;
        }
        match self.authenticator.login(username, password) {
            Ok(session) => {
                // An expired session may still have the boat powered
                if let Some(mut expired) = self.dispatcher.take() {
                    expired.logout().await;
                }
                println!("Set-Cookie: {}", session.cookie());
                self.dispatcher = Some(CommandDispatcher::new(
                    Arc::clone(&self.channel),
                    session,
                    self.config.control.clone(),
                ));
            }
            Err(e) => println!("{}", e),
        }
    }

    async fn handle_dashboard(&mut self, input: ConsoleInput) {
        if self.history.is_mounted() {
            self.history.unmount();
        }
        if self.enter(auth::DASHBOARD_PATH).is_err() {
            match self.dispatcher.take() {
                Some(mut expired) => {
                    expired.logout().await;
                    println!("Session expired, please log in again");
                }
                None => println!("Please log in first"),
            }
            return;
        }
        let Some(dispatcher) = self.dispatcher.as_mut() else {
            return;
        };

        match input {
            ConsoleInput::Command(command) => match dispatcher.dispatch(command).await {
                Ok(outcome) => println!("{}", console::render_outcome(command, &outcome)),
                Err(e) => println!("{}", e),
            },
            ConsoleInput::OpenMap => {
                if dispatcher.open_location_modal() {
                    println!("{}", console::render_state(&dispatcher.state()));
                } else {
                    println!("Boat is powered off");
                }
            }
            ConsoleInput::CloseMap => dispatcher.close_location_modal(),
            ConsoleInput::State => {
                dispatcher.refresh_connection();
                println!("{}", console::render_state(&dispatcher.state()));
                dispatcher.dismiss_notice();
            }
            ConsoleInput::Frame => match dispatcher.state().boat.video.stream {
                Some(frame) => match frame.decode() {
                    Ok(bytes) => println!(
                        "Frame: {} bytes ({})",
                        bytes.len(),
                        frame.media_type().unwrap_or("unknown type")
                    ),
                    Err(e) => error!("Failed to decode video frame: {}", e),
                },
                None => println!("No video frame"),
            },
            _ => {}
        }
    }

    /// Apply the route guard for `path`
    fn enter(&self, path: &str) -> Result<(), &'static str> {
        let session = self.dispatcher.as_ref().map(|d| d.session());
        match auth::guard(path, session, Utc::now()) {
            RouteDecision::Allow => Ok(()),
            RouteDecision::Redirect(target) => Err(target),
        }
    }

    async fn shutdown(&mut self) {
        self.history.unmount();
        if let Some(mut dispatcher) = self.dispatcher.take() {
            dispatcher.logout().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use flood_scout::{
        config::AuthConfig,
        dispatcher::{Command, Outcome},
        models::paths,
    };
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn login_after_expiry_powers_off_previous_session() {
        let memory = Arc::new(MemoryChannel::new());
        let channel: Arc<Channel> = memory.clone();
        let mut config = AppConfig::default();
        config.channel.backend = Backend::Memory;
        let mut console = Console::new(Arc::clone(&channel), config.clone());

        let short_lived = AuthConfig {
            session_max_age: Duration::from_millis(50),
            ..AuthConfig::default()
        };
        let session = Authenticator::new(&short_lived)
            .login("admin", "admin")
            .unwrap();
        let mut dispatcher = CommandDispatcher::new(channel, session, config.control.clone());
        let outcome = dispatcher.dispatch(Command::PowerToggle).await.unwrap();
        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(memory.listener_count(), 1);
        console.dispatcher = Some(dispatcher);

        tokio::time::sleep(Duration::from_millis(100)).await;
        console.login("admin", "admin").await;

        assert_eq!(memory.snapshot(paths::POWER), Some(json!(false)));
        assert_eq!(memory.listener_count(), 0);
        let fresh = console.dispatcher.as_ref().unwrap();
        assert!(!fresh.state().boat.power);
        assert!(fresh.session().is_active(Utc::now()));
    }

    #[tokio::test]
    async fn shutdown_powers_off_active_session() {
        let memory = Arc::new(MemoryChannel::new());
        let channel: Arc<Channel> = memory.clone();
        let mut config = AppConfig::default();
        config.channel.backend = Backend::Memory;
        let mut console = Console::new(channel, config);

        console.login("admin", "admin").await;
        console
            .handle(ConsoleInput::Command(Command::PowerToggle))
            .await;
        assert_eq!(memory.snapshot(paths::POWER), Some(json!(true)));

        console.shutdown().await;
        assert_eq!(memory.snapshot(paths::POWER), Some(json!(false)));
        assert_eq!(memory.listener_count(), 0);
        assert!(console.dispatcher.is_none());
    }
}
