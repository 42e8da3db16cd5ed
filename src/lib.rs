pub mod alerts;
pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod history;
pub mod power;
pub mod registry;
pub mod scheduler;
pub mod synth;
