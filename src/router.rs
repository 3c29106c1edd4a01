use std::sync::Arc;

use prometheus_client::registry::Registry;
use tracing::{debug, info};

use crate::config::RouterConfig;
use crate::ctrl::controllers::NetworkControllers;
use crate::ctrl::messages::{Route, Unroute};
use crate::forwarder::destination::LinkDestination;
use crate::forwarder::faulter::Faulter;
use crate::forwarder::forwarder::Forwarder;
use crate::forwarder::scanner::Scanner;
use crate::forwarder::state::ForwarderState;
use crate::link::channel_link::{run_link_receiver, ChannelLink, LinkEnd};
use crate::metrics::DataPlaneMetrics;
use crate::util::clock::MonotonicClock;
use crate::util::close_notify::Closer;
use crate::xgress::acker::Acker;
use crate::xgress::data_plane::DataPlane;
use crate::xgress::message::{Address, Originator};
use crate::xgress::payload_ingester::PayloadIngester;
use crate::xgress::retransmitter::Retransmitter;
use crate::xgress::xgress::{Connection, Xgress, XgressEnv};

/// Wires the data plane of one router together: forwarder, fault reporting, idle scanning and
///  the shared endpoint pipelines. Everything it spawns stops on [Router::shutdown].
pub struct Router {
    router_id: String,
    config: RouterConfig,
    closer: Closer,
    metrics: Arc<DataPlaneMetrics>,
    controllers: Arc<NetworkControllers>,
    forwarder: Arc<Forwarder>,
    xgress_env: Arc<XgressEnv>,
}

impl Router {
    /// Must be called from within a tokio runtime
    pub fn new(router_id: &str, config: RouterConfig, registry: &mut Registry) -> anyhow::Result<Router> {
        config.validate()?;

        let closer = Closer::new();
        let clock = MonotonicClock::new();
        let metrics = Arc::new(DataPlaneMetrics::init(registry));
        let controllers = Arc::new(NetworkControllers::new());
        let state = Arc::new(ForwarderState::new(clock));

        let faulter = Arc::new(Faulter::new(controllers.clone(), config.forwarder.fault_tx_interval));
        faulter.spawn(closer.notify());
        let scanner = Arc::new(Scanner::new(
            controllers.clone(),
            state.clone(),
            config.forwarder.idle_scan_interval,
            config.forwarder.idle_circuit_timeout,
        ));
        scanner.spawn(closer.notify());

        let forwarder = Arc::new(Forwarder::new(state, faulter, config.forwarder.clone(), router_id, closer.notify()));
        let data_plane: Arc<dyn DataPlane> = forwarder.clone();

        let xgress_env = Arc::new(XgressEnv {
            router_id: router_id.to_string(),
            options: config.xgress.clone(),
            data_plane: data_plane.clone(),
            acker: Arc::new(Acker::new(data_plane.clone(), metrics.clone(), config.xgress.ack_queue_size, closer.notify())),
            retransmitter: Arc::new(Retransmitter::new(data_plane, metrics.clone(), clock, config.xgress.retransmit_queue_size, closer.notify())),
            payload_ingester: Arc::new(PayloadIngester::new(config.xgress.ingest_queue_size, closer.notify())),
            metrics: metrics.clone(),
            clock,
            inspect_timeout: config.forwarder.inspect_timeout,
            shutdown: closer.notify(),
        });

        info!(router_id, "router data plane started");
        Ok(Router {
            router_id: router_id.to_string(),
            config,
            closer,
            metrics,
            controllers,
            forwarder,
            xgress_env,
        })
    }

    pub fn router_id(&self) -> &str {
        &self.router_id
    }

    pub fn controllers(&self) -> &Arc<NetworkControllers> {
        &self.controllers
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    pub fn xgress_env(&self) -> &Arc<XgressEnv> {
        &self.xgress_env
    }

    /// Registers the link with the forwarder and starts passing whatever arrives on it to the data
    ///  plane. The link is unregistered when the other side closes it.
    pub fn connect_link(&self, end: LinkEnd) -> Arc<ChannelLink> {
        let link = Arc::new(ChannelLink::new(&end.id, end.outbound, self.metrics.clone()));
        let destination: Arc<dyn LinkDestination> = link.clone();
        self.forwarder.register_link(destination.clone());

        let forwarder = self.forwarder.clone();
        let data_plane: Arc<dyn DataPlane> = forwarder.clone();
        let timeout = self.config.forwarder.payload_forward_timeout;
        let close_notify = self.closer.notify();
        tokio::spawn(async move {
            run_link_receiver(Address::new(destination.id()), end.inbound, data_plane, timeout, close_notify).await;
            debug!(link_id = destination.id(), "unregistering link");
            forwarder.unregister_link(&destination);
        });
        link
    }

    /// Creates a local endpoint and registers it with the forwarder. The caller starts it once the
    ///  circuit is routed.
    pub fn create_xgress(
        &self,
        circuit_id: &str,
        ctrl_id: &str,
        address: Address,
        originator: Originator,
        peer: Arc<dyn Connection>,
    ) -> Arc<Xgress> {
        let xgress = Xgress::new(circuit_id, ctrl_id, address.clone(), originator, peer, self.xgress_env.clone());
        self.forwarder.register_destination(circuit_id, address, xgress.clone());
        xgress
    }

    pub async fn handle_route(&self, ctrl_id: &str, route: &Route) -> anyhow::Result<()> {
        self.forwarder.route(ctrl_id, route).await
    }

    pub fn handle_unroute(&self, unroute: &Unroute) {
        self.forwarder.unroute(&unroute.circuit_id, unroute.now);
    }

    pub fn shutdown(&self) {
        info!(router_id = %self.router_id, "shutting down router data plane");
        self.closer.close();
    }
}
