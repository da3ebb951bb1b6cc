//! russh client handler used for every remote connection.
//!
//! `DeviceHandler` accepts all server host keys, the equivalent of
//! `StrictHostKeyChecking=no`.

use russh::{client, keys};
use tracing::debug;

pub struct DeviceHandler;

impl client::Handler for DeviceHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!("Accepting host key {:?}", server_public_key.algorithm());
        Ok(true)
    }
}
