//! Convenient re-exports for crate consumers and for `src/bin/main.rs`.
pub use crate::{
    arbiter::{ArbiterError, RateArbiter},
    backoff::Backoff,
    clock::{Clock, MonotonicClock},
    config::{Config, ConfigError},
    error::{ApiError, AppError, ResilienceError, TransportError},
    jitter::Jitter,
    model::{Account, AccountEntity, Entity, EntityKind, FailedItem, HandleHistory, Link, List, ListEntity},
    orchestrator::Orchestrator,
    retry::{BuildError, RetryPolicy, RetryPolicyBuilder},
    session::Session,
    sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper},
};
