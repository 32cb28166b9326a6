pub mod conversation;
pub mod cookies;
pub mod events;
pub mod random;
pub mod session;
pub mod wire;
