mod expiry;
mod key;
mod persistence;

pub use expiry::init_expiry_worker;
pub use key::IdempotencyKey;
pub use persistence::body_fingerprint;
pub use persistence::save_response;
pub use persistence::try_begin;
pub use persistence::NextAction;
pub use persistence::StoredResponse;
