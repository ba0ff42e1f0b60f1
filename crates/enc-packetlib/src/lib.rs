#![forbid(unsafe_code)]

//! Wire codecs for the enc-mqtt network stack.
//!
//! Every type in [`packet`] is either an immutable *view* over a received buffer (`parse` +
//! accessor methods, no mutation) or a *builder* that writes a header in front of a payload that
//! is already in place in the same output buffer. Multi-byte fields are converted between network
//! and host order only inside the accessors/builders; frames never hold host-order values.

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod packet;
