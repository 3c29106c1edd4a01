pub mod destination;
pub mod faulter;
pub mod forwarder;
pub mod scanner;
pub mod state;
