//! Facility reservation server for organizations, spoken to over the
//! PostgreSQL wire protocol. Each database name is one organization with its
//! own users, facilities, reservations and write-ahead log.

pub mod calendar;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
