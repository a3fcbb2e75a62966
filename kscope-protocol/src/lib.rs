//! kscope wire protocol
//!
//! Generated programs communicate with the user-space runtime through a
//! perf-style ring buffer. Every record starts with a 64-bit action
//! discriminator; this crate owns the discriminator space, the fixed record
//! layouts, and a byte-level decoder for the runtime's event loop.

mod async_event;

pub use async_event::{
    AsyncAction, AsyncEvent, DecodeError, ACTION_BASE_CAT, ACTION_BASE_PRINTF,
    ACTION_BASE_SYSTEM, FORMAT_ID_RANGE,
};
