//! Best-effort binding of in-game players to platform users.
//!
//! Both strategies are first-match-wins and never move a user that is already
//! linked to another player.

use crate::{
    services::collaborators::VoiceMember,
    state::{player::names_match, session::SessionRecord},
};

fn is_free_for(record: &SessionRecord, user_id: &str, player_name: &str) -> bool {
    record
        .linkage
        .get(user_id)
        .is_none_or(|link| names_match(&link.ingame_name, player_name))
}

/// Link `player_name` to the first voice member whose nickname or username matches it.
///
/// Returns the newly linked user, or `None` when the player already had a link
/// or nobody matched.
pub fn pair_by_matching_names(
    record: &mut SessionRecord,
    player_name: &str,
    members: &[VoiceMember],
) -> Option<String> {
    if record.user_for_player(player_name).is_some() {
        return None;
    }
    let user_id = members
        .iter()
        .filter(|member| is_free_for(record, &member.user_id, player_name))
        .find(|member| {
            member
                .display_names()
                .any(|name| names_match(name, player_name))
        })
        .map(|member| member.user_id.clone())?;
    record.link(user_id.clone(), player_name);
    Some(user_id)
}

/// Link `player_name` to the first cached candidate not bound to another player.
pub fn pair_by_user_ids(
    record: &mut SessionRecord,
    player_name: &str,
    candidates: &[String],
) -> Option<String> {
    if record.user_for_player(player_name).is_some() {
        return None;
    }
    let user_id = candidates
        .iter()
        .find(|candidate| is_free_for(record, candidate, player_name))?
        .clone();
    record.link(user_id.clone(), player_name);
    Some(user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(user_id: &str, username: &str, nick: Option<&str>) -> VoiceMember {
        VoiceMember {
            user_id: user_id.into(),
            username: username.into(),
            nick: nick.map(str::to_string),
            channel_id: "voice".into(),
            mute: false,
            deaf: false,
        }
    }

    #[test]
    fn matches_nicknames_ignoring_case_and_spaces() {
        let mut record = SessionRecord::new("g", "CODE", "t", "v");
        let members = [
            member("u1", "someone", None),
            member("u2", "other", Some("Sus Boi")),
        ];
        assert_eq!(
            pair_by_matching_names(&mut record, "susboi", &members),
            Some("u2".into())
        );
        assert_eq!(record.user_for_player("SUSBOI"), Some("u2"));
        assert_eq!(pair_by_matching_names(&mut record, "susboi", &members), None);
    }

    #[test]
    fn never_steals_a_user_linked_to_another_player() {
        let mut record = SessionRecord::new("g", "CODE", "t", "v");
        record.link("u1", "Blue");
        let members = [member("u1", "red", None)];
        assert_eq!(pair_by_matching_names(&mut record, "Red", &members), None);
        assert_eq!(record.user_for_player("blue"), Some("u1"));
    }

    #[test]
    fn user_id_candidates_skip_taken_users() {
        let mut record = SessionRecord::new("g", "CODE", "t", "v");
        record.link("u1", "Blue");
        let candidates = vec!["u1".to_string(), "u2".to_string(), "u3".to_string()];
        assert_eq!(
            pair_by_user_ids(&mut record, "Red", &candidates),
            Some("u2".into())
        );
        assert_eq!(pair_by_user_ids(&mut record, "Green", &[]), None);
    }
}
