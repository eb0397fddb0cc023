/// Key and channel names shared by every store backend.
pub mod keys;
/// Shared state store contract and its backends.
pub mod shared_store;
/// Storage error types.
pub mod storage;
