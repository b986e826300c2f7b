pub mod agent_connections;
pub mod api_keys;
pub mod channels;
pub mod dead_letters;
pub mod deliveries;
pub mod jobs;
pub mod signals;
pub mod subscribers;
pub mod subscriptions;
pub mod webhooks;
