//! pipegrid-autoscale — backlog-driven executor pool scaling.
//!
//! Reads the number of queued and running block runs from the state store
//! and resizes the executor pool through a callback.
//!
//! # Scaling rule
//!
//! ```text
//! floor = max(min_capacity, ceil(running / blocks_per_unit))
//!
//! within cooldown of the last action:
//!     NoChange
//!
//! if backlog > high_water:
//!     step = max(1, ceil(capacity * (backlog - high_water) / high_water))
//!     ScaleTo(min(capacity + step, max_capacity))
//!
//! if backlog <= low_water for scale_down_after and capacity > floor:
//!     ScaleTo(floor + (capacity - floor) / 2)
//! ```

pub mod scaler;

pub use scaler::{Autoscaler, CapacitySample, ScaleCallback, ScaleDecision, ScaleFuture};
