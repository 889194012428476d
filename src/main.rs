use canopy::config::Config;
use canopy::server::CanopyServer;
use kube::Client;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().compact().init();

    let config = Config::load().expect("invalid configuration");
    let client = Client::try_default()
        .await
        .expect("failed to create super-cluster client");

    let server = CanopyServer::new_with_client("0.0.0.0:8080", client, config)
        .await
        .expect("couldn't bind to 8080");

    tokio::select! {
        result = server.serve() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "server exited");
            }
        }
        _ = shutdown_signal() => {}
    }
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}
