pub mod auth;
pub mod directory;
pub mod error;
pub mod mail;
pub mod registry;
pub mod repos;
pub mod server;
pub mod tasks;
pub mod workflow;
