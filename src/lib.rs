pub mod circuit_breaker;
pub mod compliance;
pub mod configuration;
pub mod degradation;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod event_ingress;
pub mod idempotency;
pub mod outbox;
pub mod providers;
pub mod rate_limit;
pub mod repository;
pub mod retry;
pub mod routes;
pub mod selector;
pub mod startup;
pub mod telemetry;
pub mod webhook_retry;
