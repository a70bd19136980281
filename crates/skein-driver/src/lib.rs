//! Driver-side machinery for the skein shared-memory log transport.
//!
//! The publication side of the transport splits in two: the lock-free
//! append engine lives in `skein-log` and runs on publisher threads; the
//! state that shepherds a publication through its life runs here, on the
//! driver's conductor thread. This crate owns:
//!
//! - [`IpcPublication`]: the per-publication resource that maps the raw
//!   log, feeds the publication-limit counter from subscriber positions,
//!   cleans retired terms, unblocks stalled publishers, and walks the
//!   Active / Draining / Linger / Done lifecycle
//! - [`RetransmitHandler`]: the bounded, coalescing NAK-to-resend state
//!   machine driven from the receiver path
//! - [`FlowControl`]: retransmission-length capping strategies
//! - [`DriverContext`] and [`SystemCounters`]: driver-wide tunables and
//!   the counters the core increments
//!
//! Everything is tick-driven: the conductor calls
//! [`IpcPublication::on_time_event`] and
//! [`RetransmitHandler::process_timeouts`] from its duty cycle; nothing
//! here spins or blocks.

#[macro_use]
mod macros;

pub mod context;
pub mod flow_control;
pub mod publication;
pub mod retransmit;
pub mod tether;

pub use context::{DriverContext, SystemCounters};
pub use flow_control::{
    calculate_retransmission_length, receiver_window_length, FlowControl,
    RetransmitWindowFlowControl, MAX_RETRANSMIT_RECEIVER_WINDOW_MULTIPLE,
    RETRANSMIT_RECEIVER_WINDOW_MULTIPLE,
};
pub use publication::{CreateError, DriverHooks, IpcPublication, PublicationState};
pub use retransmit::{RetransmitHandler, RETRANSMIT_MAX_RESEND};
pub use tether::{TetherState, TetherablePosition};
