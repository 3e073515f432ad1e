pub mod config;
pub mod geo;
pub mod location;
pub mod movement;
pub mod report;
pub mod session;
pub mod util;
pub mod web;
