//! Floating IP to instance name resolution.

use std::sync::Arc;

use log::debug;

use crate::cloud::{ComputeInventory, Server};
use crate::error::CloudError;

/// Finds the instance currently holding a floating IP by scanning the live
/// compute inventory.  Nothing is cached; every call lists all servers.
#[derive(Clone)]
pub struct InstanceResolver {
    inventory: Arc<dyn ComputeInventory>,
}

impl InstanceResolver {
    pub fn new(inventory: Arc<dyn ComputeInventory>) -> Self {
        Self { inventory }
    }

    /// Returns the name of the instance holding `floating_ip`, or `None`
    /// when no listed instance reports it.
    pub async fn resolve(&self, floating_ip: &str) -> Result<Option<String>, CloudError> {
        let servers = self.inventory.list_servers().await?;
        debug!(
            "Scanning {} servers for floating IP {}",
            servers.len(),
            floating_ip
        );
        Ok(find_owner(&servers, floating_ip).map(|s| {
            debug!("Floating IP {} is held by {} ({})", floating_ip, s.name, s.id);
            s.name.clone()
        }))
    }
}

/// First server in listing order that holds `floating_ip`.
///
/// Two servers reporting the same floating address is not expected from
/// Nova, but can show up while an address is being moved.  The first one
/// listed wins and no conflict is reported.
pub fn find_owner<'a>(servers: &'a [Server], floating_ip: &str) -> Option<&'a Server> {
    servers.iter().find(|s| s.holds_floating_ip(floating_ip))
}
