//! Userspace dual-stack packet switch for the wirecage sandbox.
//!
//! The crate is sans-io: [`NetStack`] consumes raw IP frames and flow
//! operations, and returns [`Action`]s describing the frames to write and the
//! flow events to surface. Two instances are used per run, one terminating
//! flows that arrive on the sandbox TUN (promiscuous + spoofing) and one
//! originating the mirror flows on the WireGuard link, glued together at L4
//! by the proxy mux in the client binary.

pub mod packet;
mod stack;

pub use stack::{
    Action, DialError, FlowError, FlowId, Millis, NetStack, Proto, StackConfig,
};
