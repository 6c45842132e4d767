//! Network adapter configuration.
//!
//! Containers share the guest's network namespace, so adapters are
//! configured here between runtime create and start. Interface setup goes
//! through rtnetlink; name resolution is written as a plain `resolv.conf`
//! into the base files layer.

use std::net::Ipv4Addr;

use cocoon_shared::protocol::NetworkAdapter;
use cocoon_shared::{CocoonError, CocoonResult};
use futures::stream::TryStreamExt;
use tracing::{debug, info};

/// Render the `resolv.conf` contents for an adapter.
pub fn resolv_conf(dns_servers: &[String], dns_suffix: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(suffix) = dns_suffix {
        if !suffix.is_empty() {
            out.push_str("search ");
            out.push_str(suffix);
            out.push('\n');
        }
    }
    for server in dns_servers {
        out.push_str("nameserver ");
        out.push_str(server);
        out.push('\n');
    }
    out
}

/// Bring up an adapter's interface and install its address and route.
///
/// Address and gateway are each optional; an adapter with neither only has
/// its link brought up. "File exists" answers from the kernel are treated
/// as success so reconfiguration stays idempotent.
pub async fn configure_interface(adapter: &NetworkAdapter) -> CocoonResult<()> {
    let (connection, handle, _) = rtnetlink::new_connection()
        .map_err(|e| CocoonError::os("netlink connection", e))?;
    tokio::spawn(connection);

    info!(interface = %adapter.id, "configuring network adapter");

    // Loopback first; containers expect it regardless of adapters.
    let mut links = handle.link().get().match_name("lo".to_string()).execute();
    if let Some(link) = links
        .try_next()
        .await
        .map_err(|e| CocoonError::os("get lo", e))?
    {
        handle
            .link()
            .set(link.header.index)
            .up()
            .execute()
            .await
            .map_err(|e| CocoonError::os("bring up lo", e))?;
    }

    let mut links = handle
        .link()
        .get()
        .match_name(adapter.id.clone())
        .execute();
    let link = links
        .try_next()
        .await
        .map_err(|e| CocoonError::os(format!("get {}", adapter.id), e))?
        .ok_or_else(|| {
            CocoonError::os(
                format!("get {}", adapter.id),
                "interface not found",
            )
        })?;
    let index = link.header.index;

    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(|e| CocoonError::os(format!("bring up {}", adapter.id), e))?;

    if let Some(ip) = adapter.ip_address.as_deref() {
        let (addr, prefix) = parse_ip_prefix(ip)?;
        debug!(interface = %adapter.id, %addr, prefix, "assigning address");
        handle
            .address()
            .add(index, addr.into(), prefix)
            .execute()
            .await
            .or_else(ignore_exists)
            .map_err(|e| CocoonError::os(format!("assign address on {}", adapter.id), e))?;
    }

    if let Some(gw) = adapter.gateway.as_deref() {
        let gw_addr: Ipv4Addr = gw
            .parse()
            .map_err(|e| CocoonError::InvalidArguments(format!("invalid gateway '{gw}': {e}")))?;
        debug!(interface = %adapter.id, gateway = %gw_addr, "installing default route");
        handle
            .route()
            .add()
            .v4()
            .gateway(gw_addr)
            .execute()
            .await
            .or_else(ignore_exists)
            .map_err(|e| CocoonError::os("install default route", e))?;
    }

    info!(interface = %adapter.id, "network adapter configured");
    Ok(())
}

fn ignore_exists(err: rtnetlink::Error) -> Result<(), rtnetlink::Error> {
    if err.to_string().contains("File exists") {
        Ok(())
    } else {
        Err(err)
    }
}

/// Parse "a.b.c.d/len", defaulting to /24 when the prefix is omitted.
fn parse_ip_prefix(ip: &str) -> CocoonResult<(Ipv4Addr, u8)> {
    let (addr_part, prefix) = match ip.split_once('/') {
        Some((addr, prefix)) => {
            let prefix = prefix.parse::<u8>().map_err(|e| {
                CocoonError::InvalidArguments(format!("invalid prefix in '{ip}': {e}"))
            })?;
            (addr, prefix)
        }
        None => (ip, 24),
    };
    let addr: Ipv4Addr = addr_part
        .parse()
        .map_err(|e| CocoonError::InvalidArguments(format!("invalid address '{ip}': {e}")))?;
    Ok((addr, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolv_conf_layout() {
        let servers = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        let conf = resolv_conf(&servers, Some("corp.example"));
        assert_eq!(
            conf,
            "search corp.example\nnameserver 10.0.0.1\nnameserver 10.0.0.2\n"
        );
        assert_eq!(resolv_conf(&[], None), "");
    }

    #[test]
    fn ip_prefix_parsing() {
        assert_eq!(
            parse_ip_prefix("10.0.0.5/16").unwrap(),
            ("10.0.0.5".parse().unwrap(), 16)
        );
        assert_eq!(
            parse_ip_prefix("10.0.0.5").unwrap(),
            ("10.0.0.5".parse().unwrap(), 24)
        );
        assert!(parse_ip_prefix("not-an-ip").is_err());
        assert!(parse_ip_prefix("10.0.0.5/xx").is_err());
    }
}
