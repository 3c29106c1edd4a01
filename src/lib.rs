//! The data plane of an overlay router: local circuit endpoints with reliable, windowed delivery,
//!  and a forwarder moving their traffic over links to other routers.

pub mod config;
pub mod ctrl;
pub mod forwarder;
pub mod inspect;
pub mod link;
pub mod metrics;
pub mod router;
pub mod util;
pub mod xgress;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
