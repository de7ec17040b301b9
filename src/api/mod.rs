// =============================================================================
// Operator API — REST endpoints, bearer auth and the health-event feed
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;

pub use rest::router;
