use anyhow::Result;
use futures::future;
use iroh::discovery::mdns::MdnsDiscovery;
use iroh::protocol::Router;
use iroh::{Endpoint, NodeAddr, RelayMode, Watcher};
use tokio::time::{self, Duration};

use kad_dht::{
    derive_node_id, endpoint_addr_string, DhtConfig, DhtNode, DhtProtocolHandler, IrohNetwork,
    PeerInfo,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = DhtConfig::default();

    let endpoint = Endpoint::builder()
        // Any peer selecting the DHT ALPN is routed to `DhtProtocolHandler`
        // below.
        .alpns(vec![config.protocol_id.as_bytes().to_vec()])
        .relay_mode(RelayMode::Default)
        .bind()
        .await?;

    if let Err(err) = enable_local_mdns(&endpoint) {
        eprintln!("Failed to initialize mDNS discovery ({err:?}); continuing with relay-only mode");
    } else {
        println!("mDNS discovery enabled; will fall back to relay if unavailable");
    }

    let node_id = derive_node_id(endpoint.node_id().as_bytes());
    let mut node_addr_watcher = endpoint.node_addr();
    let endpoint_addr: NodeAddr = node_addr_watcher.initialized().await;
    let addr_json = endpoint_addr_string(&endpoint_addr)?;
    let self_info = PeerInfo::new(node_id, vec![addr_json.clone()]);

    println!("DHT node started");
    println!("  NodeId (hex): {}", hex::encode(node_id));
    println!("  Endpoint addr JSON: {addr_json}");

    let network = IrohNetwork::new(endpoint.clone(), self_info, &config.protocol_id);
    let node = DhtNode::new(network, config.clone());
    node.start().await?;

    let _router = Router::builder(endpoint.clone())
        .accept(
            config.protocol_id.as_bytes(),
            DhtProtocolHandler::new(node.clone()),
        )
        .spawn();

    let status_node = node.clone();
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            println!("Routing table: {} peers known", status_node.known_peers().await);
        }
    });

    // Park the main task; a real application would expose an API that calls
    // node.put_value() / node.get_value() / node.provide().
    future::pending::<()>().await;
    Ok(())
}

fn enable_local_mdns(endpoint: &Endpoint) -> Result<()> {
    let mdns = MdnsDiscovery::builder()
        .service_name("kad-dht")
        .build(endpoint.node_id())
        .map_err(|err| anyhow::anyhow!("mDNS discovery initialization failed: {err}"))?;
    endpoint.discovery().add(mdns);
    Ok(())
}
