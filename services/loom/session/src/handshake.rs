//! Session establishment.
//!
//! Opens a physical connection and writes the hello that binds it to a
//! role, name, room and token.

use loom_wire::{write_hello, Hello, Role};
use tracing::{debug, info};

use crate::options::ClientOptions;
use crate::transport::{Connection, ConnectionState, Transport};
use crate::SessionError;

/// Hello frame for `role` carrying the identity in `options`
pub fn hello_for(options: &ClientOptions, role: Role) -> Hello {
    Hello {
        role,
        name: options.name.clone(),
        room: options.room.clone(),
        token: options.token.clone(),
    }
}

/// Open a connection through `transport` and complete the handshake.
///
/// Consumers wait for the transport to accept the stream before returning.
/// A connection that fails part way is closed before the error is returned.
pub async fn establish(
    transport: &dyn Transport,
    options: &ClientOptions,
    role: Role,
) -> Result<Connection, SessionError> {
    let mut connection = transport.open(options).await?;
    match handshake(&mut connection, options, role).await {
        Ok(()) => {
            info!(
                "Session established to {} as {:?} {:?} in room {:?}",
                options.addr, role, options.name, options.room
            );
            Ok(connection)
        }
        Err(e) => {
            debug!("Handshake with {} failed: {}", options.addr, e);
            let _ = connection.close().await;
            Err(e)
        }
    }
}

async fn handshake(
    connection: &mut Connection,
    options: &ClientOptions,
    role: Role,
) -> Result<(), SessionError> {
    write_hello(connection.writer_mut(), &hello_for(options, role)).await?;
    if role == Role::Consumer {
        connection.accept().await?;
    }
    connection.set_state(ConnectionState::Connected);
    Ok(())
}
