//! What a tunnel forwards to, and how its process is recognised

use std::path::PathBuf;

use kg_core::process::ProcessEntry;
use kg_core::Invocation;

/// Service a tunnel forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub namespace: String,
    pub service: String,
    /// Port on the service side
    pub target_port: u16,
    /// Local address kubectl binds to
    pub address: String,
    /// kubeconfig context; the current context when unset
    pub context: Option<String>,
    /// Directory holding the per-port log files
    pub log_dir: PathBuf,
}

impl Default for TunnelTarget {
    fn default() -> Self {
        Self {
            namespace: "gateway-system".to_string(),
            service: "gateway".to_string(),
            target_port: 80,
            address: "127.0.0.1".to_string(),
            context: None,
            log_dir: std::env::temp_dir(),
        }
    }
}

impl TunnelTarget {
    /// `svc/<service>`, the token identifying this target's tunnels
    pub fn service_ref(&self) -> String {
        format!("svc/{}", self.service)
    }

    /// The detached `kubectl port-forward` command for `port`
    pub fn forward_invocation(&self, port: u16) -> Invocation {
        let mut args = Vec::new();
        if let Some(context) = &self.context {
            args.extend(["--context".to_string(), context.clone()]);
        }
        args.extend([
            "port-forward".to_string(),
            "-n".to_string(),
            self.namespace.clone(),
            self.service_ref(),
            format!("{}:{}", port, self.target_port),
            "--address".to_string(),
            self.address.clone(),
        ]);
        Invocation::new("kubectl", args)
    }

    pub fn log_path(&self, port: u16) -> PathBuf {
        self.log_dir.join(format!("kg-tunnel-{}.log", port))
    }

    pub fn url(&self, port: u16) -> String {
        format!("http://localhost:{}", port)
    }

    /// Whether `entry` is a port-forward to this target's service
    pub fn matches(&self, entry: &ProcessEntry) -> bool {
        let service_ref = self.service_ref();
        entry.args.iter().any(|a| a == "port-forward") && entry.args.iter().any(|a| *a == service_ref)
    }
}

/// Local port from the `<local>:<remote>` argument of a port-forward argv
pub fn infer_port(args: &[String]) -> Option<u16> {
    args.iter().find_map(|arg| {
        let (local, remote) = arg.split_once(':')?;
        let is_port = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if is_port(local) && is_port(remote) {
            local.parse().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_invocation() {
        let target = TunnelTarget {
            context: Some("kind-dev".to_string()),
            ..TunnelTarget::default()
        };
        assert_eq!(
            target.forward_invocation(8080).to_string(),
            "kubectl --context kind-dev port-forward -n gateway-system svc/gateway 8080:80 --address 127.0.0.1"
        );
        assert_eq!(target.url(8080), "http://localhost:8080");
    }

    #[test]
    fn test_log_path_is_per_port() {
        let target = TunnelTarget {
            log_dir: PathBuf::from("/var/tmp"),
            ..TunnelTarget::default()
        };
        assert_eq!(target.log_path(9090), PathBuf::from("/var/tmp/kg-tunnel-9090.log"));
    }

    #[test]
    fn test_matches_requires_both_tokens() {
        let target = TunnelTarget::default();
        let ours = ProcessEntry::new(
            41,
            ["kubectl", "port-forward", "-n", "gateway-system", "svc/gateway", "8080:80"],
        );
        let other_service = ProcessEntry::new(42, ["kubectl", "port-forward", "svc/gateway-admin", "9000:80"]);
        let not_forward = ProcessEntry::new(43, ["kubectl", "logs", "svc/gateway"]);

        assert!(target.matches(&ours));
        assert!(!target.matches(&other_service));
        assert!(!target.matches(&not_forward));
    }

    #[test]
    fn test_infer_port() {
        let args: Vec<String> = ["kubectl", "port-forward", "--address", "127.0.0.1", "svc/gateway", "8443:443"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(infer_port(&args), Some(8443));

        let no_port: Vec<String> = vec!["kubectl".to_string(), "port-forward".to_string(), ":80".to_string()];
        assert_eq!(infer_port(&no_port), None);
    }
}
