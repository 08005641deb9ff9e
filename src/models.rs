//! Data models.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::FloodScoutError;

/// Logical channel paths, transport-agnostic
pub mod paths {
    pub const BOAT_STATE: &str = "boatState";
    pub const POWER: &str = "boatState/power";
    pub const SPEED: &str = "boatState/speed";
    pub const FORWARD_BACKWARD: &str = "boatState/forwardBackward";
    pub const LEFT_RIGHT_STRAIGHT: &str = "boatState/leftRightStraight";
    pub const LOCATION: &str = "boatState/location";
    pub const VIDEO: &str = "boatState/video";
    pub const VIDEO_STREAM: &str = "boatState/video/stream";
    pub const USER_LOCATIONS: &str = "history/userLocations";

    pub fn user_location(id: i64) -> String {
        format!("{USER_LOCATIONS}/{id}")
    }

    pub fn user_location_status(id: i64) -> String {
        format!("{USER_LOCATIONS}/{id}/status")
    }

    /// Strip `parent` from `path`, returning the remainder without a leading
    /// separator. `None` if `path` is not `parent` or beneath it.
    pub fn relative<'a>(parent: &str, path: &'a str) -> Option<&'a str> {
        let rest = path.strip_prefix(parent)?;
        if rest.is_empty() {
            Some(rest)
        } else {
            rest.strip_prefix('/')
        }
    }
}

/// Throttle percentage, always within `[0, 100]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Speed(u8);

impl Speed {
    pub const ZERO: Speed = Speed(0);
    pub const MAX: Speed = Speed(100);

    /// Clamp an arbitrary requested value into range
    pub fn clamped(value: i64) -> Self {
        Self(value.clamp(0, 100) as u8)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl<'de> Deserialize<'de> for Speed {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        Ok(Speed::clamped(value.round() as i64))
    }
}

/// Longitudinal intent. Exactly one holds at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Longitudinal {
    #[serde(alias = "FORWARD_MOVEMENT")]
    Forward,
    #[serde(alias = "BACKWARD_MOVEMENT")]
    Backward,
    #[default]
    Stop,
}

impl Longitudinal {
    /// Pressing the active intent again returns to `Stop`
    pub fn toggle(self, pressed: Longitudinal) -> Longitudinal {
        if self == pressed {
            Longitudinal::Stop
        } else {
            pressed
        }
    }

    pub fn is_moving(&self) -> bool {
        !matches!(self, Longitudinal::Stop)
    }
}

/// Lateral intent, independent of [`Longitudinal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Lateral {
    #[serde(alias = "LEFT_MOVEMENT")]
    Left,
    #[serde(alias = "RIGHT_MOVEMENT")]
    Right,
    #[default]
    Straight,
}

impl Lateral {
    pub fn toggle(self, pressed: Lateral) -> Lateral {
        if self == pressed {
            Lateral::Straight
        } else {
            pressed
        }
    }
}

/// WGS84 position in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    /// Position reported while the boat is powered off
    pub const FALLBACK: Location = Location {
        latitude: 23.811851,
        longitude: 90.3545386,
    };

    pub fn maps_link(&self) -> String {
        format!(
            "https://www.google.com/maps?q={},{}",
            self.latitude, self.longitude
        )
    }

    pub fn embed_url(&self) -> String {
        format!(
            "https://maps.google.com/maps?q={},{}&z=15&output=embed",
            self.latitude, self.longitude
        )
    }
}

impl Default for Location {
    fn default() -> Self {
        Self::FALLBACK
    }
}

/// Opaque base64 video frame, optionally prefixed as a data URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoFrame(String);

impl VideoFrame {
    pub fn new(payload: impl Into<String>) -> Self {
        Self(payload.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Media type from a `data:` prefix, if present
    pub fn media_type(&self) -> Option<&str> {
        let header = self.0.strip_prefix("data:")?.split_once(',')?.0;
        header.split(';').next().filter(|t| !t.is_empty())
    }

    /// Decode the frame into raw image bytes
    pub fn decode(&self) -> Result<Vec<u8>, FloodScoutError> {
        let payload = match self.0.strip_prefix("data:") {
            Some(rest) => rest.split_once(',').map(|(_, data)| data).unwrap_or(rest),
            None => &self.0,
        };
        Ok(STANDARD.decode(payload.trim())?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Video {
    pub stream: Option<VideoFrame>,
}

/// Mirror of the remote boat command state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoatState {
    pub power: bool,
    pub speed: Speed,
    pub forward_backward: Longitudinal,
    pub left_right_straight: Lateral,
    pub location: Location,
    pub video: Video,
}

impl BoatState {
    /// The record written in one piece when powering off
    pub fn reset(fallback: Location) -> Self {
        Self {
            power: false,
            speed: Speed::ZERO,
            forward_backward: Longitudinal::Stop,
            left_right_straight: Lateral::Straight,
            location: fallback,
            video: Video::default(),
        }
    }
}

/// Individually writable leaves of [`BoatState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoatField {
    Power,
    Speed,
    ForwardBackward,
    LeftRightStraight,
    Location,
    Video,
    VideoStream,
}

impl BoatField {
    pub const ALL: [BoatField; 6] = [
        BoatField::Power,
        BoatField::Speed,
        BoatField::ForwardBackward,
        BoatField::LeftRightStraight,
        BoatField::Location,
        BoatField::Video,
    ];

    /// Parse a path relative to `boatState`
    pub fn from_relative(path: &str) -> Option<Self> {
        let parts: Vec<&str> = path.split('/').collect();
        match parts.as_slice() {
            ["power"] => Some(BoatField::Power),
            ["speed"] => Some(BoatField::Speed),
            ["forwardBackward"] => Some(BoatField::ForwardBackward),
            ["leftRightStraight"] => Some(BoatField::LeftRightStraight),
            ["location"] => Some(BoatField::Location),
            ["video"] => Some(BoatField::Video),
            ["video", "stream"] => Some(BoatField::VideoStream),
            _ => None,
        }
    }

    /// Key of this field inside the `boatState` record
    pub fn key(&self) -> &'static str {
        match self {
            BoatField::Power => "power",
            BoatField::Speed => "speed",
            BoatField::ForwardBackward => "forwardBackward",
            BoatField::LeftRightStraight => "leftRightStraight",
            BoatField::Location => "location",
            BoatField::Video | BoatField::VideoStream => "video",
        }
    }
}

/// Rescue mission progress, edited by the operator only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MissionStatus {
    #[default]
    Pending,
    #[serde(rename = "In Progress", alias = "InProgress")]
    InProgress,
    Completed,
}

impl std::str::FromStr for MissionStatus {
    type Err = FloodScoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .to_ascii_lowercase()
            .replace(|c: char| matches!(c, '-' | '_' | ' '), "");
        match normalized.as_str() {
            "pending" => Ok(MissionStatus::Pending),
            "inprogress" => Ok(MissionStatus::InProgress),
            "completed" => Ok(MissionStatus::Completed),
            _ => Err(FloodScoutError::UnknownCommand(format!("status {s}"))),
        }
    }
}

impl std::fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MissionStatus::Pending => "Pending",
            MissionStatus::InProgress => "In Progress",
            MissionStatus::Completed => "Completed",
        };
        f.write_str(name)
    }
}

/// A saved rescue location
///
/// Keyed in the store by `id`, the creation time in milliseconds. Only
/// `status` changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(skip)]
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<VideoFrame>,
    #[serde(default)]
    pub status: MissionStatus,
}

impl HistoryRecord {
    pub fn new(
        id: i64,
        timestamp: DateTime<Utc>,
        location: Location,
        image: Option<VideoFrame>,
    ) -> Self {
        Self {
            id,
            timestamp,
            latitude: location.latitude,
            longitude: location.longitude,
            image,
            status: MissionStatus::Pending,
        }
    }

    pub fn location(&self) -> Location {
        Location {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }

    pub fn maps_link(&self) -> String {
        self.location().maps_link()
    }

    /// Parse one stored record under its key
    pub fn from_entry(key: &str, value: &serde_json::Value) -> Result<Self, FloodScoutError> {
        let id = key.parse::<i64>().map_err(|_| {
            FloodScoutError::InvalidPath(format!("{}/{key}", paths::USER_LOCATIONS))
        })?;
        let mut record: HistoryRecord = serde_json::from_value(value.clone())?;
        record.id = id;
        Ok(record)
    }
}
