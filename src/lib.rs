//! Real-time notification core: transactional outbox, optimistic file state
//! transitions, node-local sessions, cross-node routing and push dispatch.

pub mod config;
pub mod db;
pub mod delivery;
pub mod events;
pub mod files;
pub mod gateway;
pub mod health;
pub mod messaging;
pub mod metrics;
pub mod notifications;
pub mod relay;
pub mod router;
pub mod utils;
