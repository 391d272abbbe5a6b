//! Exchange-specific quota interpretation
//!
//! Each exchange module knows its provider's rate-limit telemetry: which
//! response headers carry quota state, how endpoint weights differ, and which
//! endpoints warrant tighter local ceilings.

pub mod mexc;
