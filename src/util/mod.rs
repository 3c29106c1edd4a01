pub mod buf;
pub mod clock;
pub mod close_notify;
pub mod unblocking_queue;
