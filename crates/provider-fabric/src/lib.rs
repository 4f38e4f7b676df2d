//! Resilient gRPC transport to out-of-process provider/generator plugins
//! (spec.md §1, §4.A–§4.D): connection pooling, retry-with-backoff, a
//! per-store circuit breaker, and the synthetic adapter that serves v1
//! in-tree plugins behind the same v2 wire contract.

pub mod pb {
    tonic::include_proto!("externalsecrets.v2");
}

pub mod circuit_breaker;
pub mod client_manager;
pub mod errors;
pub mod pool;
pub mod resilient_client;
pub mod retry;
pub mod synthetic;
pub mod tls;
pub mod v1_contract;
