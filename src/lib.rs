pub mod ballots;
pub mod bot;
pub mod clock;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod gate;
pub mod logging;
pub mod registry;
pub mod retry;
pub mod store;
pub mod tally;
pub mod telegram;
pub mod window;
