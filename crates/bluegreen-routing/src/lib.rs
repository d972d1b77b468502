//! bluegreen-routing — the routing switch.
//!
//! The single mutable pointer that decides which target group receives an
//! environment's live traffic.
//!
//! # Components
//!
//! - **`switch`**: the `RoutingSwitch` contract and `ListenerSwitch`, which
//!   addresses one listener on a load balancer
//! - **`load_balancer`**: in-process load balancer with listeners,
//!   registered target groups, per-group request counters, and fault
//!   injection for exercising retry paths

pub mod load_balancer;
pub mod switch;

pub use load_balancer::{ListenerInfo, LoadBalancer};
pub use switch::{ListenerSwitch, RoutingError, RoutingSwitch};
