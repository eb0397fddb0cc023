use std::{fmt, str::FromStr};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::player::{
    PlayerAction, PlayerState, PlayerUpdate, color_from_text, names_match,
};

/// Game phase as reported by the capture client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Phase {
    Lobby,
    Tasks,
    Discuss,
    Menu,
    GameOver,
    Uninitialized,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown phase `{0}`")]
pub struct UnknownPhase(pub String);

impl Phase {
    /// Every phase, in wire order.
    pub const ALL: [Phase; 6] = [
        Phase::Lobby,
        Phase::Tasks,
        Phase::Discuss,
        Phase::Menu,
        Phase::GameOver,
        Phase::Uninitialized,
    ];

    /// Position of the phase inside [`Phase::ALL`].
    pub fn index(self) -> usize {
        match self {
            Phase::Lobby => 0,
            Phase::Tasks => 1,
            Phase::Discuss => 2,
            Phase::Menu => 3,
            Phase::GameOver => 4,
            Phase::Uninitialized => 5,
        }
    }

    /// Upper-case label used in configuration files and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Lobby => "LOBBY",
            Phase::Tasks => "TASKS",
            Phase::Discuss => "DISCUSS",
            Phase::Menu => "MENU",
            Phase::GameOver => "GAMEOVER",
            Phase::Uninitialized => "UNINITIALIZED",
        }
    }

    /// Parse a label produced by [`Phase::as_str`], case-insensitively.
    pub fn from_label(label: &str) -> Option<Phase> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str().eq_ignore_ascii_case(label.trim()))
    }
}

impl TryFrom<i32> for Phase {
    type Error = UnknownPhase;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(|index| Phase::ALL.get(index).copied())
            .ok_or_else(|| UnknownPhase(value.to_string()))
    }
}

impl From<Phase> for i32 {
    fn from(value: Phase) -> Self {
        value.index() as i32
    }
}

/// Parses the stringified integer carried by `STATE` jobs.
impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .trim()
            .parse::<i32>()
            .map_err(|_| UnknownPhase(s.to_string()))?;
        Phase::try_from(value)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map being played, `Empty` when no lobby is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMap {
    Skeld,
    Mira,
    Polus,
    Dleks,
    Airship,
    Fungle,
    #[default]
    Empty,
}

impl GameMap {
    /// Decode the capture client's map integer; unknown values become `Empty`.
    pub fn from_wire(value: i32) -> Self {
        match value {
            0 => GameMap::Skeld,
            1 => GameMap::Mira,
            2 => GameMap::Polus,
            3 => GameMap::Dleks,
            4 => GameMap::Airship,
            5 => GameMap::Fungle,
            _ => GameMap::Empty,
        }
    }
}

/// Human label for the capture client's region integer.
pub fn region_name(value: i32) -> &'static str {
    match value {
        0 => "North America",
        1 => "Asia",
        2 => "Europe",
        _ => "Unknown",
    }
}

/// Result of folding a [`PlayerUpdate`] into the cached roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerChange {
    /// The cached state was replaced or inserted.
    pub changed: bool,
    /// The alive flag of an already known player flipped.
    pub alive_changed: bool,
    /// State stored after the update.
    pub state: PlayerState,
}

/// Live game view mirrored from the capture client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGameData {
    pub phase: Phase,
    pub room: String,
    pub region: String,
    pub map: GameMap,
    /// Players keyed by their in-game name, original casing preserved.
    pub players: IndexMap<String, PlayerState>,
}

impl Default for SessionGameData {
    fn default() -> Self {
        Self {
            phase: Phase::Uninitialized,
            room: String::new(),
            region: String::new(),
            map: GameMap::Empty,
            players: IndexMap::new(),
        }
    }
}

impl SessionGameData {
    /// Move to `next`, applying the transition side effects once, and return the previous phase.
    ///
    /// Self-transitions are no-ops.
    pub fn update_phase(&mut self, next: Phase) -> Phase {
        let previous = self.phase;
        if previous == next {
            return previous;
        }

        match (previous, next) {
            (_, Phase::Lobby) | (Phase::Lobby, Phase::Tasks) => self.revive_all(),
            (_, Phase::Menu) => self.clear_lobby(),
            _ => {}
        }

        self.phase = next;
        previous
    }

    /// Record the lobby the capture client joined.
    pub fn set_lobby(&mut self, room: impl Into<String>, region: impl Into<String>, map: GameMap) {
        self.room = room.into();
        self.region = region.into();
        self.map = map;
    }

    /// Fold a player update into the roster.
    ///
    /// Nobody can be dead in the lobby, and an exile always kills.
    pub fn update_player(&mut self, update: &PlayerUpdate) -> PlayerChange {
        let mut is_dead = update.is_dead;
        if self.phase == Phase::Lobby {
            is_dead = false;
        }
        if update.action == PlayerAction::Exiled {
            is_dead = true;
        }

        let incoming = PlayerState {
            color: update.color,
            name: update.name.clone(),
            is_alive: !is_dead,
        };

        let Some(index) = self.position_of(&update.name) else {
            self.players.insert(incoming.name.clone(), incoming.clone());
            return PlayerChange {
                changed: true,
                alive_changed: false,
                state: incoming,
            };
        };

        let cached = &self.players[index];
        if *cached == incoming {
            return PlayerChange {
                changed: false,
                alive_changed: false,
                state: incoming,
            };
        }

        let alive_changed = cached.is_alive != incoming.is_alive;
        let same_key = self
            .players
            .get_index(index)
            .is_some_and(|(key, _)| *key == incoming.name);
        if same_key {
            self.players.insert(incoming.name.clone(), incoming.clone());
        } else {
            self.players.shift_remove_index(index);
            self.players
                .shift_insert(index, incoming.name.clone(), incoming.clone());
        }

        PlayerChange {
            changed: true,
            alive_changed,
            state: incoming,
        }
    }

    /// Drop a player from the roster.
    pub fn remove_player(&mut self, name: &str) -> Option<PlayerState> {
        let index = self.position_of(name)?;
        self.players
            .shift_remove_index(index)
            .map(|(_, player)| player)
    }

    /// Look up a player by color name or slot number.
    pub fn get_by_color(&self, text: &str) -> (PlayerState, bool) {
        let Some(color) = color_from_text(text) else {
            return (PlayerState::unlinked(), false);
        };
        match self.players.values().find(|player| player.color == color) {
            Some(player) => (player.clone(), true),
            None => (PlayerState::unlinked(), false),
        }
    }

    /// Look up a player by in-game name, ignoring case and whitespace.
    pub fn get_by_name(&self, text: &str) -> (PlayerState, bool) {
        match self.find_by_name(text) {
            Some(player) => (player.clone(), true),
            None => (PlayerState::unlinked(), false),
        }
    }

    /// Borrowing variant of [`SessionGameData::get_by_name`].
    pub fn find_by_name(&self, text: &str) -> Option<&PlayerState> {
        self.position_of(text)
            .and_then(|index| self.players.get_index(index))
            .map(|(_, player)| player)
    }

    fn position_of(&self, name: &str) -> Option<usize> {
        self.players.keys().position(|key| names_match(key, name))
    }

    fn revive_all(&mut self) {
        for player in self.players.values_mut() {
            player.is_alive = true;
        }
    }

    fn clear_lobby(&mut self) {
        self.room.clear();
        self.region.clear();
        self.map = GameMap::Empty;
    }
}
