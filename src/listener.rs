//! Accept loop
//!
//! Binds the configured address, starts the ChatServer actor and spawns a
//! session handler for every accepted connection.

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::handler::{handle_connection, Session};
use crate::server::{ChatServer, ServerCommand};
use crate::types::ClientId;

/// Bind `config.address` and serve forever
pub async fn run(config: ServerConfig) -> Result<(), AppError> {
    let listener = TcpListener::bind(&config.address).await?;
    info!("Chat server listening on {}", listener.local_addr()?);
    serve(listener, config).await
}

/// Serve connections from an already bound listener
///
/// Returns only when accepting fails; the error is fatal to the process.
pub async fn serve(listener: TcpListener, config: ServerConfig) -> Result<(), AppError> {
    // Create ChatServer actor channel and start
    let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer);
    tokio::spawn(
        ChatServer::new(cmd_rx)
            .with_max_frame_length(config.max_frame_length)
            .run(),
    );

    info!("ChatServer actor started");

    // Connection accept loop
    loop {
        let (stream, addr) = listener.accept().await.map_err(|e| {
            error!("Failed to accept connection: {}", e);
            AppError::Io(e)
        })?;

        let client_id = ClientId::new();
        info!("New connection {} from {}", client_id, addr);

        let session = Session::new(client_id, cmd_tx.clone(), &config);
        cmd_tx
            .send(ServerCommand::Connect {
                client_id,
                sender: session.outbound(),
            })
            .await
            .map_err(|_| AppError::ChannelSend)?;

        // Spawn handler task for each connection
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, session).await {
                warn!("Connection {} ended with error: {}", client_id, e);
            }
        });
    }
}
