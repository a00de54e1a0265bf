pub mod auth;
pub mod collaborators;
pub mod compactor;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod journal;
pub mod limits;
pub mod model;
pub mod observability;
pub mod schedule;
pub mod settings;
pub mod sql;
pub mod timezone;
pub mod tls;
pub mod wal;
pub mod wire;
