pub mod analyzer;
pub mod applier;
pub mod capture;
pub mod config;
pub mod control;
pub mod live;
pub mod net;
pub mod presets;
pub mod report;
pub mod schedule;
pub mod state;
pub mod stats_server;
pub mod sweep;
pub mod traits;
