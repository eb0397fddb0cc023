//! Key layout inside the shared store.
//!
//! Every process derives names from these helpers so sessions stay reachable
//! from any worker.

pub fn session(session_id: &str) -> String {
    format!("session:{session_id}")
}

pub fn session_lock(session_id: &str) -> String {
    format!("lock:session:{session_id}")
}

pub fn voice_lock(session_id: &str) -> String {
    format!("lock:voice:{session_id}")
}

pub fn code_pointer(connect_code: &str) -> String {
    format!("pointer:code:{connect_code}")
}

pub fn voice_pointer(channel_id: &str) -> String {
    format!("pointer:voice:{channel_id}")
}

pub fn text_pointer(channel_id: &str) -> String {
    format!("pointer:text:{channel_id}")
}

pub fn queue(connect_code: &str) -> String {
    format!("queue:{connect_code}")
}

pub fn queue_notify(connect_code: &str) -> String {
    format!("queue:{connect_code}:notify")
}

pub fn queue_ack(connect_code: &str) -> String {
    format!("queue:{connect_code}:ack")
}

pub fn kill(session_id: &str) -> String {
    format!("kill:{session_id}")
}

pub fn tasks(connect_code: &str) -> String {
    format!("tasks:{connect_code}")
}

pub fn task_ack(connect_code: &str, task_id: &str) -> String {
    format!("tasks:{connect_code}:ack:{task_id}")
}

/// Rate counter of one identity (or capture code) inside one guild.
pub fn rate(guild_id: &str, identity_id: &str) -> String {
    format!("rate:{guild_id}:{identity_id}")
}

/// Users previously linked to a normalized in-game name.
pub fn names(guild_id: &str, normalized_name: &str) -> String {
    format!("names:{guild_id}:{normalized_name}")
}
