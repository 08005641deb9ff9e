//! Command dispatcher
//!
//! Translates operator intents into writes on the remote channel. The local
//! mirror is updated before each write, so the operator sees the effect
//! without waiting for the echo. Channel failures are logged and swallowed.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::auth::Session;
use crate::channel::{ChannelUpdate, RemoteChannel};
use crate::config::{ControlConfig, VideoSource};
use crate::errors::FloodScoutError;
use crate::history::HistoryStore;
use crate::models::{paths, BoatState, HistoryRecord, Lateral, Longitudinal, Speed};
use crate::scheduler::ScheduledTask;
use crate::subscriptions::SubscriptionManager;
use crate::view::ViewState;

/// Discrete operator intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Forward,
    Backward,
    Left,
    Right,
    ChangeSpeed(i64),
    SaveLocation,
    GetLocation,
    PowerToggle,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Forward => "FORWARD_MOVEMENT",
            Command::Backward => "BACKWARD_MOVEMENT",
            Command::Left => "LEFT_MOVEMENT",
            Command::Right => "RIGHT_MOVEMENT",
            Command::ChangeSpeed(_) => "CHANGE_SPEED",
            Command::SaveLocation => "SAVE_LOCATION",
            Command::GetLocation => "GET_LOCATION",
            Command::PowerToggle => "POWER_TOGGLE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Unpowered,
    Disconnected,
    /// Speed changes need an active longitudinal intent
    NotMoving,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied,
    LocationSaved(HistoryRecord),
    Ignored(IgnoreReason),
}

pub struct CommandDispatcher<C: RemoteChannel + ?Sized> {
    channel: Arc<C>,
    history: HistoryStore<C>,
    view: Arc<watch::Sender<ViewState>>,
    session: Session,
    settings: ControlConfig,
    subscriptions: SubscriptionManager,
    video_poller: Option<ScheduledTask>,
    last_record_id: i64,
}

impl<C: RemoteChannel + ?Sized + 'static> CommandDispatcher<C> {
    /// Dispatcher for an authenticated operator. Starts powered off.
    pub fn new(channel: Arc<C>, session: Session, settings: ControlConfig) -> Self {
        let initial = ViewState {
            boat: BoatState::reset(settings.fallback_location()),
            connected: channel.is_connected(),
            ..ViewState::default()
        };
        let (view, _) = watch::channel(initial);

        Self {
            history: HistoryStore::new(Arc::clone(&channel)),
            channel,
            view: Arc::new(view),
            session,
            settings,
            subscriptions: SubscriptionManager::new(),
            video_poller: None,
            last_record_id: 0,
        }
    }

    pub fn watch(&self) -> watch::Receiver<ViewState> {
        self.view.subscribe()
    }

    pub fn state(&self) -> ViewState {
        self.view.borrow().clone()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Whether the boat state subscription is live
    pub fn is_subscribed(&self) -> bool {
        self.subscriptions.is_active(paths::BOAT_STATE)
    }

    pub fn is_polling(&self) -> bool {
        self.video_poller.as_ref().is_some_and(ScheduledTask::is_running)
    }

    /// Mirror channel connectivity into the view, returning it
    pub fn refresh_connection(&self) -> bool {
        let connected = self.channel.is_connected();
        self.view.send_if_modified(|view| {
            if view.connected == connected {
                return false;
            }
            view.connected = connected;
            true
        });
        connected
    }

    /// Show the live location. Refused while powered off.
    pub fn open_location_modal(&self) -> bool {
        self.view.send_if_modified(|view| {
            if !view.boat.power || view.location_modal_open {
                return false;
            }
            view.location_modal_open = true;
            true
        });
        self.view.borrow().location_modal_open
    }

    pub fn close_location_modal(&self) {
        self.view.send_if_modified(|view| {
            std::mem::replace(&mut view.location_modal_open, false)
        });
    }

    pub fn dismiss_notice(&self) {
        self.view.send_if_modified(|view| view.notice.take().is_some());
    }

    /// Power off if needed, then end the session
    pub async fn logout(&mut self) {
        let powered = self.view.borrow().boat.power;
        if powered {
            self.power_off().await;
        }
        self.session.logout();
    }

    /// Apply one operator command
    ///
    /// Fails only when the session is no longer active. Everything else
    /// either takes effect or is ignored with a reason.
    pub async fn dispatch(&mut self, command: Command) -> Result<Outcome, FloodScoutError> {
        self.session.ensure_active(Utc::now())?;

        if command != Command::PowerToggle {
            let powered = self.view.borrow().boat.power;
            if !powered {
                debug!(command = command.name(), "Ignoring command while powered off");
                return Ok(Outcome::Ignored(IgnoreReason::Unpowered));
            }
            if !self.refresh_connection() {
                warn!(command = command.name(), "Ignoring command while disconnected");
                return Ok(Outcome::Ignored(IgnoreReason::Disconnected));
            }
        }

        let outcome = match command {
            Command::Forward => self.drive(Longitudinal::Forward).await,
            Command::Backward => self.drive(Longitudinal::Backward).await,
            Command::Left => self.steer(Lateral::Left).await,
            Command::Right => self.steer(Lateral::Right).await,
            Command::ChangeSpeed(requested) => self.change_speed(requested).await,
            Command::SaveLocation => self.save_location().await,
            Command::GetLocation => self.refresh_location().await,
            Command::PowerToggle => self.toggle_power().await,
        };
        Ok(outcome)
    }

    async fn drive(&mut self, pressed: Longitudinal) -> Outcome {
        let default_speed = Speed::clamped(self.settings.default_speed.into());
        let mut next = (Longitudinal::Stop, Speed::ZERO);
        self.view.send_modify(|view| {
            let intent = view.boat.forward_backward.toggle(pressed);
            let speed = if intent.is_moving() {
                default_speed
            } else {
                Speed::ZERO
            };
            view.boat.forward_backward = intent;
            view.boat.speed = speed;
            next = (intent, speed);
        });

        let (intent, speed) = next;
        info!(?intent, speed = speed.value(), "Longitudinal intent changed");
        // The remote never holds a nonzero speed while stopped
        if intent.is_moving() {
            self.write(paths::FORWARD_BACKWARD, &intent).await;
            self.write(paths::SPEED, &speed).await;
        } else {
            self.write(paths::SPEED, &speed).await;
            self.write(paths::FORWARD_BACKWARD, &intent).await;
        }
        Outcome::Applied
    }

    async fn steer(&mut self, pressed: Lateral) -> Outcome {
        let mut intent = Lateral::Straight;
        self.view.send_modify(|view| {
            intent = view.boat.left_right_straight.toggle(pressed);
            view.boat.left_right_straight = intent;
        });

        info!(?intent, "Lateral intent changed");
        self.write(paths::LEFT_RIGHT_STRAIGHT, &intent).await;
        Outcome::Applied
    }

    async fn change_speed(&mut self, requested: i64) -> Outcome {
        let moving = self.view.borrow().boat.forward_backward.is_moving();
        if !moving {
            debug!(requested, "Ignoring speed change while stopped");
            return Outcome::Ignored(IgnoreReason::NotMoving);
        }

        let speed = Speed::clamped(requested);
        self.view.send_modify(|view| view.boat.speed = speed);
        self.write(paths::SPEED, &speed).await;
        Outcome::Applied
    }

    async fn save_location(&mut self) -> Outcome {
        let now = Utc::now();
        let id = now.timestamp_millis().max(self.last_record_id + 1);
        self.last_record_id = id;

        let (location, image) = {
            let view = self.view.borrow();
            (view.boat.location, view.boat.video.stream.clone())
        };
        let record = HistoryRecord::new(id, now, location, image);
        self.view
            .send_modify(|view| view.notice = Some("Location saved".to_string()));

        if let Err(e) = self.history.append(&record).await {
            error!(id, "Failed to save location: {}", e);
        }
        Outcome::LocationSaved(record)
    }

    async fn refresh_location(&mut self) -> Outcome {
        match self.channel.read_once(paths::LOCATION).await {
            Ok(Some(value)) => {
                self.view
                    .send_if_modified(|view| view.apply_update(paths::LOCATION, &value));
            }
            Ok(None) => debug!("No remote location, keeping cached"),
            Err(e) => error!("Failed to read location: {}", e),
        }
        Outcome::Applied
    }

    async fn toggle_power(&mut self) -> Outcome {
        let connected = self.refresh_connection();
        let powered = self.view.borrow().boat.power;
        if powered {
            self.power_off().await;
            Outcome::Applied
        } else if !connected {
            warn!("Refusing to power on while disconnected");
            Outcome::Ignored(IgnoreReason::Disconnected)
        } else {
            self.power_on().await
        }
    }

    /// Follow the boat state first, then announce power. If the boat state
    /// cannot be followed the local switch is rolled back and nothing is
    /// written.
    async fn power_on(&mut self) -> Outcome {
        let mut epoch = 0;
        self.view.send_modify(|view| {
            view.boat.power = true;
            view.epoch += 1;
            epoch = view.epoch;
        });
        info!(epoch, "Powering on");

        let view = Arc::clone(&self.view);
        let result = self
            .subscriptions
            .activate(
                self.channel.as_ref(),
                paths::BOAT_STATE,
                move |update: ChannelUpdate| {
                    apply_if_current(&view, epoch, &update.path, &update.value);
                },
            )
            .await;
        if let Err(e) = result {
            error!("Failed to follow boat state: {}", e);
            let connected = self.channel.is_connected();
            self.view.send_modify(|view| {
                view.boat.power = false;
                view.epoch += 1;
                view.connected = connected;
            });
            return Outcome::Ignored(IgnoreReason::Disconnected);
        }

        self.write(paths::POWER, &true).await;
        if self.settings.video_source == VideoSource::Poll {
            self.start_video_poll(epoch);
        }
        Outcome::Applied
    }

    fn start_video_poll(&mut self, epoch: u64) {
        let channel = Arc::clone(&self.channel);
        let view = Arc::clone(&self.view);
        let task = ScheduledTask::start(
            "video-poll",
            self.settings.video_poll_interval,
            move || {
                let channel = Arc::clone(&channel);
                let view = Arc::clone(&view);
                async move {
                    match channel.read_once(paths::VIDEO_STREAM).await {
                        Ok(Some(frame)) => {
                            apply_if_current(&view, epoch, paths::VIDEO_STREAM, &frame);
                        }
                        Ok(None) => {}
                        Err(e) => error!("Failed to poll video frame: {}", e),
                    }
                }
            },
        );
        self.video_poller = Some(task);
    }

    /// Release everything tied to the powered session, reset locally, then
    /// write the reset record in one piece.
    async fn power_off(&mut self) {
        self.subscriptions.deactivate_all();
        if let Some(poller) = self.video_poller.take() {
            poller.stop();
        }

        let reset = BoatState::reset(self.settings.fallback_location());
        self.view.send_modify(|view| {
            view.boat = reset.clone();
            view.location_modal_open = false;
            view.notice = None;
            view.epoch += 1;
        });
        info!("Powering off");
        self.write(paths::BOAT_STATE, &reset).await;
    }

    async fn write<T: Serialize + ?Sized>(&self, path: &str, value: &T) {
        if let Err(e) = self.try_write(path, value).await {
            error!(path, "Channel write failed: {}", e);
        }
    }

    async fn try_write<T: Serialize + ?Sized>(
        &self,
        path: &str,
        value: &T,
    ) -> Result<(), FloodScoutError> {
        let value = serde_json::to_value(value)?;
        self.channel.publish(path, value).await
    }
}

/// Apply a push unless it belongs to an earlier power cycle
fn apply_if_current(view: &watch::Sender<ViewState>, epoch: u64, path: &str, value: &Value) {
    view.send_if_modified(|state| {
        if state.epoch != epoch || !state.boat.power {
            debug!(path, "Dropping update from a previous power cycle");
            return false;
        }
        state.apply_update(path, value)
    });
}
