use std::path::PathBuf;

use clap::Parser;
use hrt::{Agent, Broker, BrokerConfig, RouteTable};
use n0_error::{Result, StdResultExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "hrt", about = "HTTP reverse tunnel", version)]
enum Cli {
    /// Start a broker.
    Serve {
        /// Address agents connect to.
        #[arg(short, long, default_value = "0.0.0.0:9090")]
        listen: String,
        /// Address serving HTTP clients.
        #[arg(long, default_value = "0.0.0.0:8080")]
        http: String,
        /// Path to the JSON route file.
        #[arg(long)]
        route: PathBuf,
        /// Shared secret agents must present.
        #[arg(long, default_value = "")]
        token: String,
    },
    /// Connect an agent to a broker.
    Connect {
        /// Broker control address, e.g. `broker.example.com:9090`.
        broker: String,
        /// Agent id the route records refer to.
        #[arg(long)]
        id: String,
        /// Shared secret.
        #[arg(long, default_value = "")]
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    match Cli::parse() {
        Cli::Serve {
            listen,
            http,
            route,
            token,
        } => serve(listen, http, route, token).await,
        Cli::Connect { broker, id, token } => connect(broker, id, token).await,
    }
}

async fn serve(listen: String, http: String, route: PathBuf, token: String) -> Result<()> {
    let routes = RouteTable::load(&route)?;
    info!("loaded {} routes from {}", routes.len(), route.display());
    for (host, record) in routes.iter() {
        debug!("route: {host} => {record}");
    }
    let control = TcpListener::bind(&listen)
        .await
        .std_context(format!("bind control listener on {listen}"))?;
    let http = TcpListener::bind(&http)
        .await
        .std_context(format!("bind http listener on {http}"))?;

    let broker = Broker::new(BrokerConfig { token, routes });
    tokio::select! {
        res = broker.serve(control, http) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}

async fn connect(broker: String, id: String, token: String) -> Result<()> {
    let agent = Agent::new(id, token);
    tokio::select! {
        res = agent.connect(&broker) => res.anyerr(),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
