//! A user-space TCP engine on top of a pooled, reference-counted segment buffer.
//!
//! ## Table of contents
//!
//! 1. [The segment pool](buf/index.html)
//! 2. [The wire module](wire/index.html)
//! 3. [Timers and deferred events](event/index.html)
//! 4. [The layers](layer/index.html)
//!    1. [The IP layer contract](layer/ip/index.html)
//!    1. [The TCP engine](layer/tcp/index.html)
//!
//! ## Design
//!
//! Everything runs on one logical thread. The host delivers one event at a time, an arriving
//! datagram, an expired timer, a client request or a completion of the IP layer, and the engine
//! processes it to the end before returning. Operations that cannot finish right away return
//! `Poll::Pending` and are answered later through a completion queue. There are no locks: packet
//! buffers are reference counted and copied before a write whenever they are shared.
//!
//! All packet memory comes from a [`Pool`] that is sized once, up front. Running out of it is
//! handled by asking registered layers to free memory in a fixed priority order, and is fatal
//! when they cannot.
//!
//! [`Pool`]: buf/struct.Pool.html

// tests should be able to use `std`
#![cfg_attr(all(
    not(feature = "std"),
    not(test)),
no_std)]

extern crate alloc;

#[macro_use] mod macros;
pub mod buf;
pub mod event;
pub mod layer;
pub mod time;
pub mod wire;
