//! Directory commands.

use parley_core::PeerId;
use parley_node::{DirectoryClient, DirectoryServer, SignalHandler};
use tracing::info;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Runs the development directory server until SIGINT/SIGTERM.
pub async fn serve(
    config: &ClientConfig,
    port: Option<u16>,
    credential: Option<String>,
) -> ClientResult<()> {
    let port = port.unwrap_or(config.directory.port);
    let credential = credential.unwrap_or_else(|| config.directory.credential.clone());
    if credential.is_empty() || credential.contains('_') {
        return Err(ClientError::Config(
            "credential must be non-empty and must not contain '_'".to_string(),
        ));
    }

    let signal_handler = SignalHandler::new();
    signal_handler.spawn_listener()?;

    let server = DirectoryServer::bind(("0.0.0.0", port), &credential).await?;
    println!("directory listening on {}", server.local_addr()?);
    server
        .run_until_shutdown(signal_handler.shutdown_handle())
        .await;
    info!("Directory server stopped");
    Ok(())
}

/// Asks the configured directory where `id` listens.
pub async fn query(config: &ClientConfig, id: &str) -> ClientResult<()> {
    let id: PeerId = id
        .parse()
        .map_err(|e| ClientError::Input(format!("invalid peer id: {}", e)))?;
    let address = config.directory.address();
    let mut client = DirectoryClient::connect(&address).await?;
    match client.query(id).await? {
        Some(found) => println!("{} {}", id, found),
        None => println!("{} not found", id),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_node::ShutdownHandle;

    #[tokio::test]
    async fn query_reaches_the_configured_directory() {
        let server = DirectoryServer::bind("127.0.0.1:0", "net2019").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let stop = ShutdownHandle::new();
        tokio::spawn(server.run_until_shutdown(stop.clone()));

        let mut config = ClientConfig::default();
        config.directory.port = port;
        query(&config, "1111111111").await.unwrap();
        assert!(matches!(
            query(&config, "abc").await,
            Err(ClientError::Input(_))
        ));
        stop.trigger();
    }

    #[tokio::test]
    async fn serve_rejects_bad_credentials() {
        let config = ClientConfig::default();
        let result = serve(&config, Some(0), Some("a_b".into())).await;
        assert!(matches!(result, Err(ClientError::Config(_))));
    }
}
