pub mod capture;
pub mod health;
pub mod job;
pub mod session;
pub mod sse;
pub mod voice;
