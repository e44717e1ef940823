//! The fixed set of telemetry channels.
//!
//! Every channel maps to exactly one bus topic, one store table family and
//! (for the live ones) one fan-out registry. The mapping is closed: adding a
//! channel means adding a variant here, and every `match` below must follow.

use std::fmt;
use std::str::FromStr;

/// One telemetry category published by the boat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Battery,
    Mission,
    Mode,
    Obstacle,
    Position,
    ThrustersInput,
    Acceleration,
}

impl Channel {
    /// All channels, in table-creation order.
    pub const ALL: [Channel; 7] = [
        Channel::Battery,
        Channel::Mission,
        Channel::Mode,
        Channel::Obstacle,
        Channel::Position,
        Channel::ThrustersInput,
        Channel::Acceleration,
    ];

    /// Channel name used in URLs and as the table prefix.
    pub fn name(self) -> &'static str {
        match self {
            Channel::Battery => "battery",
            Channel::Mission => "mission",
            Channel::Mode => "mode",
            Channel::Obstacle => "obstacle",
            Channel::Position => "position",
            Channel::ThrustersInput => "thrusters_input",
            Channel::Acceleration => "acceleration",
        }
    }

    /// Bus topic this channel is published on.
    pub fn topic(self) -> &'static str {
        match self {
            Channel::Battery => "/boat/battery",
            Channel::Mission => "/boat/mission",
            Channel::Mode => "/boat/mode",
            Channel::Obstacle => "/boat/obstacle",
            Channel::Position => "/boat/position",
            Channel::ThrustersInput => "/boat/thrusters_input",
            Channel::Acceleration => "/boat/acceleration",
        }
    }

    /// Whether dashboards can subscribe to this channel over a socket.
    pub fn has_live_feed(self) -> bool {
        matches!(
            self,
            Channel::Battery
                | Channel::Mission
                | Channel::Mode
                | Channel::Obstacle
                | Channel::Position
        )
    }

    /// Resolve an allow-listed channel name. Anything else is `None`.
    pub fn from_name(name: &str) -> Option<Channel> {
        Channel::ALL.into_iter().find(|c| c.name() == name)
    }

    /// Exact-match topic lookup.
    pub fn from_topic(topic: &str) -> Option<Channel> {
        Channel::ALL.into_iter().find(|c| c.topic() == topic)
    }

    /// Dense index into per-channel arrays.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error for a channel name outside the allow-list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid channel name: {0}")]
pub struct UnknownChannel(pub String);

impl FromStr for Channel {
    type Err = UnknownChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::from_name(s).ok_or_else(|| UnknownChannel(s.to_string()))
    }
}
