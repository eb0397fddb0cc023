use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of player colors the capture client can report.
pub const COLOR_COUNT: i32 = 18;
/// Color carried by players that are not bound to an in-game slot.
pub const UNLINKED_COLOR: i32 = -1;

const COLOR_NAMES: [&str; COLOR_COUNT as usize] = [
    "red", "blue", "green", "pink", "orange", "yellow", "black", "white", "purple", "brown",
    "cyan", "lime", "maroon", "rose", "banana", "gray", "tan", "coral",
];

/// Whether `color` is a slot the active ruleset knows about.
pub fn is_valid_color(color: i32) -> bool {
    (0..COLOR_COUNT).contains(&color)
}

/// Human name of a color slot, if it exists.
pub fn color_name(color: i32) -> Option<&'static str> {
    usize::try_from(color)
        .ok()
        .and_then(|index| COLOR_NAMES.get(index).copied())
}

/// Parse a color given either by name ("Red", " ro se ") or by its numeric slot.
pub fn color_from_text(text: &str) -> Option<i32> {
    let normalized = normalize_name(text);
    if let Ok(value) = normalized.parse::<i32>() {
        return is_valid_color(value).then_some(value);
    }
    COLOR_NAMES
        .iter()
        .position(|name| *name == normalized)
        .and_then(|index| i32::try_from(index).ok())
}

/// Lowercase and strip whitespace so names compare the way players type them.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Whether two names refer to the same player once normalized.
pub fn names_match(left: &str, right: &str) -> bool {
    normalize_name(left) == normalize_name(right)
}

/// Cached view of a single in-game player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    /// Color slot (`0..COLOR_COUNT`), or [`UNLINKED_COLOR`].
    pub color: i32,
    /// In-game name with its original casing.
    pub name: String,
    /// Whether the player is currently alive.
    pub is_alive: bool,
}

impl PlayerState {
    /// Sentinel returned by lookups that found nothing.
    pub fn unlinked() -> Self {
        Self {
            color: UNLINKED_COLOR,
            name: String::new(),
            is_alive: false,
        }
    }

    /// True for the sentinel produced by [`PlayerState::unlinked`].
    pub fn is_unlinked(&self) -> bool {
        self.color == UNLINKED_COLOR && self.name.is_empty()
    }
}

/// Reason reported by the capture client alongside a player update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum PlayerAction {
    Joined,
    Left,
    Died,
    ChangedColor,
    ForceUpdated,
    Disconnected,
    Exiled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown player action `{0}`")]
pub struct UnknownPlayerAction(pub i32);

impl TryFrom<i32> for PlayerAction {
    type Error = UnknownPlayerAction;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        let action = match value {
            0 => Self::Joined,
            1 => Self::Left,
            2 => Self::Died,
            3 => Self::ChangedColor,
            4 => Self::ForceUpdated,
            5 => Self::Disconnected,
            6 => Self::Exiled,
            other => return Err(UnknownPlayerAction(other)),
        };
        Ok(action)
    }
}

impl From<PlayerAction> for i32 {
    fn from(value: PlayerAction) -> Self {
        match value {
            PlayerAction::Joined => 0,
            PlayerAction::Left => 1,
            PlayerAction::Died => 2,
            PlayerAction::ChangedColor => 3,
            PlayerAction::ForceUpdated => 4,
            PlayerAction::Disconnected => 5,
            PlayerAction::Exiled => 6,
        }
    }
}

impl fmt::Display for PlayerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Joined => "joined",
            Self::Left => "left",
            Self::Died => "died",
            Self::ChangedColor => "changed_color",
            Self::ForceUpdated => "force_updated",
            Self::Disconnected => "disconnected",
            Self::Exiled => "exiled",
        };
        f.write_str(label)
    }
}

/// Player update as reported by the capture client, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    pub action: PlayerAction,
    pub name: String,
    pub color: i32,
    #[serde(default)]
    pub is_dead: bool,
    #[serde(default)]
    pub disconnected: bool,
}
