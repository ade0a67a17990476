//! End-to-end harness: real agents on ephemeral ports or behind a polling
//! queue, plus interceptors that inject transport faults.

pub mod harness;
