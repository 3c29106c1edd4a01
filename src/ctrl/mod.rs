//! The interface to the control plane: the instructions the data plane executes, and the reports
//!  it sends back.

pub mod controllers;
pub mod messages;
