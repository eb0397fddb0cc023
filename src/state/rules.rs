//! Guild-configurable voice rules and phase settle delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::state::game::Phase;

const PHASE_COUNT: usize = Phase::ALL.len();

/// Desired voice state for a single member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VoiceRule {
    pub mute: bool,
    pub deaf: bool,
}

impl VoiceRule {
    /// Neither muted nor deafened.
    pub const OPEN: VoiceRule = VoiceRule {
        mute: false,
        deaf: false,
    };
    /// Muted but still able to hear.
    pub const MUTED: VoiceRule = VoiceRule {
        mute: true,
        deaf: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct PhaseRules {
    alive: VoiceRule,
    dead: VoiceRule,
}

/// Phase × alive/dead lookup table deciding who gets muted or deafened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceRuleTable {
    phases: [PhaseRules; PHASE_COUNT],
}

impl Default for VoiceRuleTable {
    fn default() -> Self {
        let mut table = Self {
            phases: [PhaseRules::default(); PHASE_COUNT],
        };
        table.set(Phase::Tasks, true, VoiceRule::MUTED);
        table.set(Phase::Discuss, false, VoiceRule::MUTED);
        table
    }
}

impl VoiceRuleTable {
    /// Evaluate the desired state of a member; untracked members are never touched.
    pub fn evaluate(&self, is_alive: bool, is_tracked: bool, phase: Phase) -> VoiceRule {
        if !is_tracked {
            return VoiceRule::OPEN;
        }
        self.get(phase, is_alive)
    }

    /// Current rule for `(phase, alive)`.
    pub fn get(&self, phase: Phase, is_alive: bool) -> VoiceRule {
        let rules = &self.phases[phase.index()];
        if is_alive { rules.alive } else { rules.dead }
    }

    /// Replace the rule for `(phase, alive)`.
    pub fn set(&mut self, phase: Phase, is_alive: bool, rule: VoiceRule) {
        let rules = &mut self.phases[phase.index()];
        if is_alive {
            rules.alive = rule;
        } else {
            rules.dead = rule;
        }
    }
}

/// Origin × destination settle delays applied before a mute batch is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseDelayTable {
    seconds: [[u64; PHASE_COUNT]; PHASE_COUNT],
}

impl Default for PhaseDelayTable {
    fn default() -> Self {
        let mut table = Self {
            seconds: [[0; PHASE_COUNT]; PHASE_COUNT],
        };
        table.set(Phase::Lobby, Phase::Tasks, 7);
        table.set(Phase::Tasks, Phase::Lobby, 1);
        table.set(Phase::Discuss, Phase::Lobby, 6);
        table.set(Phase::Discuss, Phase::Tasks, 7);
        table
    }
}

impl PhaseDelayTable {
    /// Delay in seconds for the transition `origin -> dest`.
    pub fn delay(&self, origin: Phase, dest: Phase) -> u64 {
        self.seconds[origin.index()][dest.index()]
    }

    /// [`PhaseDelayTable::delay`] as a [`Duration`].
    pub fn duration(&self, origin: Phase, dest: Phase) -> Duration {
        Duration::from_secs(self.delay(origin, dest))
    }

    /// Override the delay for `origin -> dest`.
    pub fn set(&mut self, origin: Phase, dest: Phase, seconds: u64) {
        self.seconds[origin.index()][dest.index()] = seconds;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untracked_members_are_never_touched() {
        let mut table = VoiceRuleTable::default();
        table.set(
            Phase::Lobby,
            true,
            VoiceRule {
                mute: true,
                deaf: true,
            },
        );
        for phase in Phase::ALL {
            for alive in [true, false] {
                assert_eq!(table.evaluate(alive, false, phase), VoiceRule::OPEN);
            }
        }
    }

    #[test]
    fn default_rules_follow_the_seed() {
        let table = VoiceRuleTable::default();
        assert_eq!(table.evaluate(true, true, Phase::Lobby), VoiceRule::OPEN);
        assert_eq!(table.evaluate(false, true, Phase::Lobby), VoiceRule::OPEN);
        assert_eq!(table.evaluate(true, true, Phase::Tasks), VoiceRule::MUTED);
        assert_eq!(table.evaluate(false, true, Phase::Tasks), VoiceRule::OPEN);
        assert_eq!(table.evaluate(true, true, Phase::Discuss), VoiceRule::OPEN);
        assert_eq!(table.evaluate(false, true, Phase::Discuss), VoiceRule::MUTED);
    }

    #[test]
    fn rules_can_be_changed_at_runtime() {
        let mut table = VoiceRuleTable::default();
        let deafened = VoiceRule {
            mute: true,
            deaf: true,
        };
        table.set(Phase::Tasks, true, deafened);
        assert_eq!(table.evaluate(true, true, Phase::Tasks), deafened);
        assert_eq!(table.get(Phase::Tasks, false), VoiceRule::OPEN);
    }

    #[test]
    fn default_delays_follow_the_seed() {
        let table = PhaseDelayTable::default();
        assert_eq!(table.delay(Phase::Lobby, Phase::Tasks), 7);
        assert_eq!(table.delay(Phase::Tasks, Phase::Lobby), 1);
        assert_eq!(table.delay(Phase::Discuss, Phase::Lobby), 6);
        assert_eq!(table.delay(Phase::Discuss, Phase::Tasks), 7);
        assert_eq!(table.delay(Phase::Lobby, Phase::Discuss), 0);
        for phase in Phase::ALL {
            assert_eq!(table.delay(phase, phase), 0);
        }
        assert_eq!(
            table.duration(Phase::Lobby, Phase::Tasks),
            Duration::from_secs(7)
        );
    }
}
