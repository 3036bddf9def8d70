//! Thin wrapper around `rtnetlink` for the bridge/TAP/address operations
//! the fabric manager needs.

use std::net::Ipv4Addr;

use rtnetlink::Handle;

use crate::error::ComposeError;

pub struct NetlinkHandle {
    handle: Handle,
}

fn netlink_err(e: impl std::fmt::Display) -> ComposeError {
    ComposeError::Netlink {
        message: e.to_string(),
    }
}

impl NetlinkHandle {
    pub async fn new() -> Result<Self, ComposeError> {
        let (connection, handle, _) = rtnetlink::new_connection().map_err(netlink_err)?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Look up a link's index by name, if it exists.
    pub async fn link_index(&self, name: &str) -> Result<Option<u32>, ComposeError> {
        use futures_util::TryStreamExt;
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(Some(msg.header.index)),
            Ok(None) => Ok(None),
            Err(rtnetlink::Error::NetlinkError(e)) if e.code.map(|c| c.get()) == Some(-19) => {
                Ok(None)
            }
            Err(e) => Err(netlink_err(e)),
        }
    }

    /// Create a bridge interface, idempotent if it already exists. Returns
    /// its index.
    pub async fn ensure_bridge(&self, name: &str) -> Result<u32, ComposeError> {
        if let Some(idx) = self.link_index(name).await? {
            return Ok(idx);
        }
        self.handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await
            .map_err(netlink_err)?;
        self.link_index(name)
            .await?
            .ok_or_else(|| ComposeError::Netlink {
                message: format!("bridge '{name}' missing immediately after creation"),
            })
    }

    pub async fn set_link_up(&self, index: u32) -> Result<(), ComposeError> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(netlink_err)
    }

    /// Put `tap_index` under `bridge_index`'s bridge master.
    pub async fn set_master(&self, link_index: u32, bridge_index: u32) -> Result<(), ComposeError> {
        self.handle
            .link()
            .set(link_index)
            .controller(bridge_index)
            .execute()
            .await
            .map_err(netlink_err)
    }

    /// Assign an address, tolerating "address already exists".
    pub async fn add_address_v4(
        &self,
        index: u32,
        addr: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), ComposeError> {
        match self
            .handle
            .address()
            .add(index, addr.into(), prefix_len)
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(rtnetlink::Error::NetlinkError(e)) if e.code.map(|c| c.get()) == Some(-17) => {
                Ok(())
            }
            Err(e) => Err(netlink_err(e)),
        }
    }

    /// Delete a link by name, tolerating "no such device".
    pub async fn delete_link(&self, name: &str) -> Result<(), ComposeError> {
        let Some(index) = self.link_index(name).await? else {
            return Ok(());
        };
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(netlink_err)
    }
}
