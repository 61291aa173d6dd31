//! Routing table shim
//!
//! The client swaps the OS default route for the tunnel gateway while it is
//! connected and pins a host route to the server's real address so the
//! encrypted datagrams keep leaving through the physical interface. When the
//! server pushes a DNS server the client also rewrites the resolver
//! configuration for the life of the tunnel. The server only needs kernel
//! IPv4 forwarding.

use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";
const RESOLV_CONF: &str = "/etc/resolv.conf";

/// OS routing operations used by the engines
#[async_trait]
pub trait Router: Send + Sync {
    /// Current IPv4 default gateway
    async fn default_gateway(&self) -> Result<Ipv4Addr>;

    /// Install a default route via `gateway`
    async fn set_default_gateway(&self, gateway: Ipv4Addr) -> Result<()>;

    /// Remove the current default route
    async fn clear_default_route(&self) -> Result<()>;

    /// Route `host` through `gateway` regardless of the default route
    async fn pin_host_route(&self, gateway: Ipv4Addr, host: Ipv4Addr) -> Result<()>;

    /// Remove a route added by [`Router::pin_host_route`]
    async fn unpin_host_route(&self, host: Ipv4Addr) -> Result<()>;

    async fn enable_ipv4_forwarding(&self) -> Result<()>;

    /// Point the system resolver at `dns`, returning the configuration it
    /// replaced
    async fn set_dns(&self, dns: Ipv4Addr) -> Result<String>;

    /// Put back a configuration returned by [`Router::set_dns`]
    async fn restore_dns(&self, previous: String) -> Result<()>;
}

/// The gateway of a tunnel /24: host octet `.1`
pub fn tunnel_gateway(address: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = address.octets();
    Ipv4Addr::new(a, b, c, 1)
}

/// Parse the output of `ip -4 route show default`
///
/// Expects lines like `default via 192.168.1.1 dev eth0 proto dhcp`.
pub fn parse_default_gateway(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.first() != Some(&"default") {
            return None;
        }
        words
            .windows(2)
            .find(|pair| pair[0] == "via")
            .and_then(|pair| pair[1].parse().ok())
    })
}

/// [`Router`] backed by the `ip` command, procfs and `/etc/resolv.conf`
#[derive(Debug, Clone)]
pub struct SystemRouter {
    resolv_conf: PathBuf,
}

impl SystemRouter {
    pub fn new() -> Self {
        Self { resolv_conf: PathBuf::from(RESOLV_CONF) }
    }

    /// Use a different resolver configuration file
    pub fn with_resolv_conf(path: impl Into<PathBuf>) -> Self {
        Self { resolv_conf: path.into() }
    }
}

impl Default for SystemRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Router for SystemRouter {
    async fn default_gateway(&self) -> Result<Ipv4Addr> {
        let stdout = ip_output(&["-4", "route", "show", "default"]).await?;
        parse_default_gateway(&stdout)
            .ok_or_else(|| Error::Route("no IPv4 default gateway found".into()))
    }

    async fn set_default_gateway(&self, gateway: Ipv4Addr) -> Result<()> {
        ip_route(&["add", "default", "via", &gateway.to_string()]).await?;
        info!("Default route set via {}", gateway);
        Ok(())
    }

    async fn clear_default_route(&self) -> Result<()> {
        ip_route(&["del", "default"]).await?;
        debug!("Default route removed");
        Ok(())
    }

    async fn pin_host_route(&self, gateway: Ipv4Addr, host: Ipv4Addr) -> Result<()> {
        ip_route(&["add", &format!("{}/32", host), "via", &gateway.to_string()]).await?;
        debug!("Pinned {} via {}", host, gateway);
        Ok(())
    }

    async fn unpin_host_route(&self, host: Ipv4Addr) -> Result<()> {
        ip_route(&["del", &format!("{}/32", host)]).await?;
        debug!("Unpinned {}", host);
        Ok(())
    }

    async fn enable_ipv4_forwarding(&self) -> Result<()> {
        tokio::fs::write(IP_FORWARD, "1")
            .await
            .map_err(|e| Error::Route(format!("failed to write {}: {}", IP_FORWARD, e)))?;
        info!("Enabled IPv4 forwarding");
        Ok(())
    }

    async fn set_dns(&self, dns: Ipv4Addr) -> Result<String> {
        let previous = match tokio::fs::read_to_string(&self.resolv_conf).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(self.resolver_error("read", e)),
        };
        tokio::fs::write(&self.resolv_conf, format!("nameserver {}\n", dns))
            .await
            .map_err(|e| self.resolver_error("write", e))?;
        info!("Resolver set to {}", dns);
        Ok(previous)
    }

    async fn restore_dns(&self, previous: String) -> Result<()> {
        tokio::fs::write(&self.resolv_conf, previous)
            .await
            .map_err(|e| self.resolver_error("restore", e))?;
        debug!("Resolver configuration restored");
        Ok(())
    }
}

impl SystemRouter {
    fn resolver_error(&self, action: &str, e: std::io::Error) -> Error {
        Error::Route(format!("failed to {} {}: {}", action, self.resolv_conf.display(), e))
    }
}

async fn ip_route(args: &[&str]) -> Result<()> {
    let mut full = vec!["route"];
    full.extend_from_slice(args);
    ip_output(&full).await.map(|_| ())
}

async fn ip_output(args: &[&str]) -> Result<String> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Route(format!("failed to run `ip`: {}", e)))?;
    if !output.status.success() {
        return Err(Error::Route(format!(
            "`ip {}` failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// A routing call seen by [`RecordingRouter`]
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum RouteCall {
        SetDefault(Ipv4Addr),
        ClearDefault,
        Pin { gateway: Ipv4Addr, host: Ipv4Addr },
        Unpin(Ipv4Addr),
        EnableForwarding,
        SetDns(Ipv4Addr),
        RestoreDns(String),
    }

    /// Resolver configuration [`RecordingRouter`] reports as replaced
    pub(crate) const PREVIOUS_RESOLVER: &str = "nameserver 192.168.1.1\n";

    /// In-memory router that records every mutation
    pub(crate) struct RecordingRouter {
        gateway: Option<Ipv4Addr>,
        fail_set_default: bool,
        pub calls: Mutex<Vec<RouteCall>>,
    }

    impl RecordingRouter {
        pub fn new(gateway: Ipv4Addr) -> Self {
            Self { gateway: Some(gateway), fail_set_default: false, calls: Mutex::new(Vec::new()) }
        }

        /// A router with no default gateway to save
        pub fn without_gateway() -> Self {
            Self { gateway: None, fail_set_default: false, calls: Mutex::new(Vec::new()) }
        }

        /// A router that refuses to install a new default route
        pub fn failing_set_default(gateway: Ipv4Addr) -> Self {
            Self { fail_set_default: true, ..Self::new(gateway) }
        }

        pub fn calls(&self) -> Vec<RouteCall> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: RouteCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl Router for RecordingRouter {
        async fn default_gateway(&self) -> Result<Ipv4Addr> {
            self.gateway.ok_or_else(|| Error::Route("no default gateway".into()))
        }

        async fn set_default_gateway(&self, gateway: Ipv4Addr) -> Result<()> {
            if self.fail_set_default {
                return Err(Error::Route("set default refused".into()));
            }
            self.record(RouteCall::SetDefault(gateway));
            Ok(())
        }

        async fn clear_default_route(&self) -> Result<()> {
            self.record(RouteCall::ClearDefault);
            Ok(())
        }

        async fn pin_host_route(&self, gateway: Ipv4Addr, host: Ipv4Addr) -> Result<()> {
            self.record(RouteCall::Pin { gateway, host });
            Ok(())
        }

        async fn unpin_host_route(&self, host: Ipv4Addr) -> Result<()> {
            self.record(RouteCall::Unpin(host));
            Ok(())
        }

        async fn enable_ipv4_forwarding(&self) -> Result<()> {
            self.record(RouteCall::EnableForwarding);
            Ok(())
        }

        async fn set_dns(&self, dns: Ipv4Addr) -> Result<String> {
            self.record(RouteCall::SetDns(dns));
            Ok(PREVIOUS_RESOLVER.to_string())
        }

        async fn restore_dns(&self, previous: String) -> Result<()> {
            self.record(RouteCall::RestoreDns(previous));
            Ok(())
        }
    }

    #[test]
    fn test_tunnel_gateway() {
        assert_eq!(tunnel_gateway(Ipv4Addr::new(10, 8, 3, 17)), Ipv4Addr::new(10, 8, 3, 1));
        assert_eq!(tunnel_gateway(Ipv4Addr::new(192, 168, 88, 1)), Ipv4Addr::new(192, 168, 88, 1));
    }

    #[test]
    fn test_parse_default_gateway() {
        let output = "default via 192.168.1.254 dev wlan0 proto dhcp metric 600\n";
        assert_eq!(parse_default_gateway(output), Some(Ipv4Addr::new(192, 168, 1, 254)));

        let multi = "default dev wolftun0 scope link\ndefault via 10.0.2.2 dev eth0 metric 100\n";
        assert_eq!(parse_default_gateway(multi), Some(Ipv4Addr::new(10, 0, 2, 2)));
    }

    #[test]
    fn test_parse_default_gateway_missing() {
        assert_eq!(parse_default_gateway(""), None);
        assert_eq!(parse_default_gateway("10.0.0.0/24 via 10.0.0.1 dev eth0\n"), None);
        assert_eq!(parse_default_gateway("default via not-an-ip dev eth0\n"), None);
    }

    #[tokio::test]
    async fn test_recording_router() {
        let router = RecordingRouter::new(Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(router.default_gateway().await.unwrap(), Ipv4Addr::new(192, 168, 1, 1));
        router.clear_default_route().await.unwrap();
        assert_eq!(router.calls(), vec![RouteCall::ClearDefault]);

        assert!(RecordingRouter::without_gateway().default_gateway().await.is_err());
    }

    #[tokio::test]
    async fn test_resolver_swap_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        let original = "# managed by dhcp\nnameserver 192.168.1.1\nsearch lan\n";
        std::fs::write(&path, original).unwrap();

        let router = SystemRouter::with_resolv_conf(&path);
        let previous = router.set_dns(Ipv4Addr::new(10, 8, 0, 53)).await.unwrap();
        assert_eq!(previous, original);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "nameserver 10.8.0.53\n");

        router.restore_dns(previous).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
    }

    #[tokio::test]
    async fn test_resolver_without_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let router = SystemRouter::with_resolv_conf(dir.path().join("resolv.conf"));
        assert_eq!(router.set_dns(Ipv4Addr::new(1, 1, 1, 1)).await.unwrap(), "");

        let missing = SystemRouter::with_resolv_conf(dir.path().join("no/such/dir/resolv.conf"));
        assert!(matches!(missing.set_dns(Ipv4Addr::new(1, 1, 1, 1)).await, Err(Error::Route(_))));
    }
}
