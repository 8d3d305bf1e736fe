//! Application layer of the relay.
//!
//! # Sub-modules
//!
//! - **`service`** – the lifecycle contract every input source implements,
//!   and the context handed to it at initialization.
//! - **`service_manager`** – owns the services and the shared event queue,
//!   assigns ids and drives the tiered poll.
//! - **`services`** – the built-in service classes.
//! - **`relay`** – one main-loop tick: poll services, service the network,
//!   drain the queue and fan the events out.

pub mod relay;
pub mod service;
pub mod service_manager;
pub mod services;
