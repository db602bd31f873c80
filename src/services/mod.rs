pub mod auth;
pub mod history;
pub mod persistence;
pub mod presence;
pub mod relay;
pub mod room;
