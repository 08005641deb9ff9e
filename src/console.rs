//! Operator console
//!
//! Line-oriented input for the `flood-scout` binary and plain-text rendering
//! of the view state.

use std::str::FromStr;

use crate::dispatcher::{Command, IgnoreReason, Outcome};
use crate::errors::FloodScoutError;
use crate::history::HistoryState;
use crate::models::MissionStatus;
use crate::view::{VideoPanel, ViewState};

pub const HELP: &str = "\
login <user> <pass>    start a session
logout                 power off and end the session
power                  toggle the master switch
forward | backward     toggle the longitudinal intent
left | right           toggle the lateral intent
speed <n>              set the throttle (0-100)
save                   save the current location as a mission
locate                 refresh the location from the boat
map | close            open or close the live location
history | more         show saved missions, one more page
status <id> <status>   set a mission to Pending, In Progress or Completed
state | frame          show the boat state or the current video frame
quit                   leave the console";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleInput {
    Login { username: String, password: String },
    Logout,
    Command(Command),
    OpenMap,
    CloseMap,
    History,
    More,
    Status { id: i64, status: MissionStatus },
    State,
    Frame,
    Help,
    Quit,
}

impl FromStr for ConsoleInput {
    type Err = FloodScoutError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let unknown = || FloodScoutError::UnknownCommand(line.trim().to_string());
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&verb, args)) = words.split_first() else {
            return Err(unknown());
        };

        let input = match (verb.to_ascii_lowercase().as_str(), args) {
            ("login", [username, password]) => ConsoleInput::Login {
                username: username.to_string(),
                password: password.to_string(),
            },
            ("logout", []) => ConsoleInput::Logout,
            ("power", []) => ConsoleInput::Command(Command::PowerToggle),
            ("forward", []) => ConsoleInput::Command(Command::Forward),
            ("backward", []) => ConsoleInput::Command(Command::Backward),
            ("left", []) => ConsoleInput::Command(Command::Left),
            ("right", []) => ConsoleInput::Command(Command::Right),
            ("speed", [value]) => {
                let value = value.parse::<i64>().map_err(|_| unknown())?;
                ConsoleInput::Command(Command::ChangeSpeed(value))
            }
            ("save", []) => ConsoleInput::Command(Command::SaveLocation),
            ("locate", []) => ConsoleInput::Command(Command::GetLocation),
            ("map", []) => ConsoleInput::OpenMap,
            ("close", []) => ConsoleInput::CloseMap,
            ("history", []) => ConsoleInput::History,
            ("more", []) => ConsoleInput::More,
            ("status", [id, status @ ..]) if !status.is_empty() => ConsoleInput::Status {
                id: id.parse().map_err(|_| unknown())?,
                status: status.join(" ").parse()?,
            },
            ("state", []) => ConsoleInput::State,
            ("frame", []) => ConsoleInput::Frame,
            ("help", []) => ConsoleInput::Help,
            ("quit" | "exit", []) => ConsoleInput::Quit,
            _ => return Err(unknown()),
        };
        Ok(input)
    }
}

pub fn render_outcome(command: Command, outcome: &Outcome) -> String {
    match outcome {
        Outcome::Applied => format!("{} applied", command.name()),
        Outcome::LocationSaved(record) => {
            format!("Location saved ({}) {}", record.id, record.maps_link())
        }
        Outcome::Ignored(IgnoreReason::Unpowered) => "Boat is powered off".to_string(),
        Outcome::Ignored(IgnoreReason::Disconnected) => "Boat is disconnected".to_string(),
        Outcome::Ignored(IgnoreReason::NotMoving) => {
            "Select forward or backward before changing speed".to_string()
        }
    }
}

pub fn render_state(view: &ViewState) -> String {
    let boat = &view.boat;
    let video = match view.video_panel() {
        VideoPanel::NoFeed => "no feed".to_string(),
        VideoPanel::Loading => "loading".to_string(),
        VideoPanel::Frame(frame) => format!("{} chars", frame.as_str().len()),
    };

    let mut lines = vec![
        format!(
            "{} | power {}",
            if view.connected { "connected" } else { "disconnected" },
            if boat.power { "on" } else { "off" }
        ),
        format!(
            "direction {:?} / {:?} | speed {}{}",
            boat.forward_backward,
            boat.left_right_straight,
            boat.speed.value(),
            if view.speed_enabled() { "" } else { " (locked)" }
        ),
        format!(
            "location {:.6}, {:.6} | video {}",
            boat.location.latitude, boat.location.longitude, video
        ),
    ];
    if view.location_modal_open {
        lines.push(format!("map {}", boat.location.embed_url()));
    }
    if let Some(notice) = &view.notice {
        lines.push(notice.clone());
    }
    lines.join("\n")
}

/// Visible missions, newest first
pub fn render_history(history: &HistoryState) -> String {
    if history.records.is_empty() {
        return "No missions saved".to_string();
    }

    let start = history.window.start();
    let mut lines: Vec<String> = history
        .visible()
        .iter()
        .enumerate()
        .map(|(offset, record)| {
            format!(
                "Mission #{} [{}] {} {} {}",
                history.mission_number(start + offset),
                record.id,
                record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                record.status,
                record.maps_link()
            )
        })
        .collect();
    if history.window.has_more() {
        lines.push(format!(
            "{} of {} shown, `more` for the next page",
            history.window.end(),
            history.records.len()
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HistoryRecord, Location};
    use chrono::{TimeZone, Utc};

    #[test]
    fn parse_commands() {
        let cases = [
            ("power", ConsoleInput::Command(Command::PowerToggle)),
            ("  Forward ", ConsoleInput::Command(Command::Forward)),
            ("speed -10", ConsoleInput::Command(Command::ChangeSpeed(-10))),
            ("save", ConsoleInput::Command(Command::SaveLocation)),
            ("locate", ConsoleInput::Command(Command::GetLocation)),
            ("map", ConsoleInput::OpenMap),
            ("exit", ConsoleInput::Quit),
            (
                "login admin secret",
                ConsoleInput::Login {
                    username: "admin".to_string(),
                    password: "secret".to_string(),
                },
            ),
            (
                "status 1705393800000 In Progress",
                ConsoleInput::Status {
                    id: 1705393800000,
                    status: MissionStatus::InProgress,
                },
            ),
        ];
        for (line, expected) in cases {
            assert_eq!(line.parse::<ConsoleInput>().unwrap(), expected, "{line}");
        }
    }

    #[test]
    fn reject_malformed_input() {
        for line in ["", "jump", "speed fast", "login admin", "status 12", "status x Pending"] {
            assert!(
                matches!(
                    line.parse::<ConsoleInput>(),
                    Err(FloodScoutError::UnknownCommand(_))
                ),
                "{line}"
            );
        }
    }

    #[test]
    fn render_powered_off_state() {
        let text = render_state(&ViewState::default());
        assert!(text.starts_with("disconnected | power off"));
        assert!(text.contains("speed 0 (locked)"));
        assert!(text.contains("video no feed"));
    }

    #[test]
    fn render_history_numbers_missions() {
        let mut history = HistoryState::new(2);
        let records = (1..=3)
            .map(|n| {
                let id = 1_705_000_000_000 + n;
                let timestamp = Utc.timestamp_millis_opt(id).unwrap();
                HistoryRecord::new(id, timestamp, Location::FALLBACK, None)
            })
            .collect();
        history.replace_all(records);

        let text = render_history(&history);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Mission #3 [1705000000003]"));
        assert!(lines[1].starts_with("Mission #2"));
        assert_eq!(lines[2], "2 of 3 shown, `more` for the next page");
    }
}
