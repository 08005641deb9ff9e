//! Local view state
//!
//! The client-side mirror of the boat state plus purely local UI state.
//! Published through a `tokio::sync::watch` channel so that any number of
//! consumers re-render on change.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{
    paths, BoatField, BoatState, Lateral, Location, Longitudinal, Speed, VideoFrame,
};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ViewState {
    pub boat: BoatState,
    /// Connection indicator
    pub connected: bool,
    pub location_modal_open: bool,
    /// Last acknowledgement shown to the operator
    pub notice: Option<String>,
    /// Bumped on every power transition. Callbacks registered under an older
    /// epoch must not touch the mirror.
    pub epoch: u64,
}

/// What the video panel should show
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoPanel {
    NoFeed,
    Loading,
    Frame(VideoFrame),
}

#[derive(Deserialize)]
struct PartialLocation {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl ViewState {
    pub fn video_panel(&self) -> VideoPanel {
        match (self.boat.power, &self.boat.video.stream) {
            (false, _) => VideoPanel::NoFeed,
            (true, None) => VideoPanel::Loading,
            (true, Some(frame)) => VideoPanel::Frame(frame.clone()),
        }
    }

    /// Whether the speed control is usable
    pub fn speed_enabled(&self) -> bool {
        self.boat.power && self.boat.forward_backward.is_moving()
    }

    /// Apply an authoritative value pushed by the channel
    ///
    /// Returns whether anything changed. Values that are missing or fail to
    /// parse leave the cached field untouched. `power` is the operator's
    /// switch and is never taken from a push.
    pub fn apply_update(&mut self, path: &str, value: &Value) -> bool {
        let Some(relative) = paths::relative(paths::BOAT_STATE, path) else {
            debug!(path, "Ignoring update outside boat state");
            return false;
        };

        if relative.is_empty() {
            let Some(record) = value.as_object() else {
                warn!(path, "Boat state payload is not an object");
                return false;
            };
            let mut changed = false;
            for field in BoatField::ALL {
                if let Some(value) = record.get(field.key()) {
                    changed |= self.apply_field(field, value);
                }
            }
            return changed;
        }

        match BoatField::from_relative(relative) {
            Some(field) => self.apply_field(field, value),
            None => {
                debug!(path, "Ignoring unknown boat state field");
                false
            }
        }
    }

    fn apply_field(&mut self, field: BoatField, value: &Value) -> bool {
        let boat = &mut self.boat;
        match field {
            BoatField::Power => {
                if value.as_bool().is_some_and(|power| power != boat.power) {
                    debug!(remote = %value, "Ignoring remote power state");
                }
                false
            }
            BoatField::Speed => match value.as_f64() {
                Some(speed) => replace(&mut boat.speed, Speed::clamped(speed.round() as i64)),
                None => malformed(field, value),
            },
            BoatField::ForwardBackward => match Longitudinal::deserialize(value) {
                Ok(intent) => replace(&mut boat.forward_backward, intent),
                Err(_) => malformed(field, value),
            },
            BoatField::LeftRightStraight => match Lateral::deserialize(value) {
                Ok(intent) => replace(&mut boat.left_right_straight, intent),
                Err(_) => malformed(field, value),
            },
            BoatField::Location => match PartialLocation::deserialize(value) {
                Ok(partial) => {
                    let location = Location {
                        latitude: partial.latitude.unwrap_or(boat.location.latitude),
                        longitude: partial.longitude.unwrap_or(boat.location.longitude),
                    };
                    replace(&mut boat.location, location)
                }
                Err(_) => malformed(field, value),
            },
            BoatField::Video => match value.get("stream") {
                Some(stream) => self.apply_field(BoatField::VideoStream, stream),
                None if value.is_null() => self.apply_field(BoatField::VideoStream, value),
                None => malformed(field, value),
            },
            BoatField::VideoStream => {
                if !boat.power && !value.is_null() {
                    debug!("Discarding video frame received while powered off");
                    return false;
                }
                match Option::<VideoFrame>::deserialize(value) {
                    Ok(frame) => replace(&mut boat.video.stream, frame),
                    Err(_) => malformed(field, value),
                }
            }
        }
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

fn malformed(field: BoatField, value: &Value) -> bool {
    if !value.is_null() {
        warn!(field = field.key(), %value, "Malformed boat state value, keeping cached");
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn powered() -> ViewState {
        let mut view = ViewState::default();
        view.boat.power = true;
        view
    }

    #[test]
    fn apply_leaf_updates() {
        let mut view = powered();

        assert!(view.apply_update("boatState/speed", &json!(45)));
        assert!(view.apply_update("boatState/forwardBackward", &json!("BACKWARD")));
        assert!(view.apply_update("boatState/leftRightStraight", &json!("RIGHT")));
        assert!(!view.apply_update("boatState/speed", &json!(45)));

        assert_eq!(view.boat.speed, Speed::clamped(45));
        assert_eq!(view.boat.forward_backward, Longitudinal::Backward);
        assert_eq!(view.boat.left_right_straight, Lateral::Right);
    }

    #[test]
    fn apply_whole_record_keeps_absent_fields() {
        let mut view = powered();
        view.boat.location = Location {
            latitude: 1.0,
            longitude: 2.0,
        };

        let changed = view.apply_update(
            "boatState",
            &json!({ "speed": 20, "forwardBackward": "FORWARD", "location": null }),
        );

        assert!(changed);
        assert!(view.boat.power);
        assert_eq!(view.boat.speed, Speed::clamped(20));
        assert_eq!(view.boat.location.latitude, 1.0);
    }

    #[test]
    fn malformed_values_keep_cached_field() {
        let mut view = powered();
        view.boat.speed = Speed::clamped(30);

        assert!(!view.apply_update("boatState/speed", &json!("fast")));
        assert!(!view.apply_update("boatState/forwardBackward", &json!("SIDEWAYS")));
        assert!(!view.apply_update("boatState/power", &json!(null)));
        assert!(!view.apply_update("boatState", &json!("garbage")));
        assert!(!view.apply_update("boatState/unknown", &json!(1)));
        assert!(!view.apply_update("history/userLocations/1", &json!({})));

        assert_eq!(view.boat.speed, Speed::clamped(30));
        assert!(view.boat.power);
    }

    #[test]
    fn partial_location_merges() {
        let mut view = powered();
        assert!(view.apply_update("boatState/location", &json!({ "latitude": 24.5 })));
        assert_eq!(
            view.boat.location,
            Location {
                latitude: 24.5,
                longitude: Location::FALLBACK.longitude,
            }
        );
    }

    #[test]
    fn frames_are_discarded_while_powered_off() {
        let mut view = ViewState::default();
        assert!(!view.apply_update("boatState/video/stream", &json!("AAEC")));
        assert_eq!(view.boat.video.stream, None);
        assert_eq!(view.video_panel(), VideoPanel::NoFeed);

        view.boat.power = true;
        assert_eq!(view.video_panel(), VideoPanel::Loading);
        assert!(view.apply_update("boatState/video", &json!({ "stream": "AAEC" })));
        assert_eq!(
            view.video_panel(),
            VideoPanel::Frame(VideoFrame::new("AAEC"))
        );

        assert!(view.apply_update("boatState/video/stream", &json!(null)));
        assert_eq!(view.boat.video.stream, None);
    }

    #[test]
    fn remote_power_does_not_flip_local_switch() {
        let mut view = powered();
        assert!(!view.apply_update("boatState/power", &json!(false)));
        view.apply_update(
            "boatState",
            &json!({ "power": false, "video": { "stream": "AAEC" } }),
        );
        assert!(view.boat.power);
        assert_eq!(view.boat.video.stream, Some(VideoFrame::new("AAEC")));

        let mut view = ViewState::default();
        view.apply_update(
            "boatState",
            &json!({ "power": true, "video": { "stream": "AAEC" } }),
        );
        assert!(!view.boat.power);
        assert_eq!(view.boat.video.stream, None);
    }

    #[test]
    fn speed_control_requires_motion() {
        let mut view = powered();
        assert!(!view.speed_enabled());
        view.boat.forward_backward = Longitudinal::Forward;
        assert!(view.speed_enabled());
        view.boat.power = false;
        assert!(!view.speed_enabled());
    }
}
