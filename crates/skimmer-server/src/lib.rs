//! REST API server: job routes, progress streams, rate limiting,
//! authentication, DTOs, and OpenAPI documentation.

pub mod auth;
pub mod dto;
pub mod error;
pub mod openapi;
pub mod ratelimit;
pub mod routes;
pub mod sse;
pub mod state;
