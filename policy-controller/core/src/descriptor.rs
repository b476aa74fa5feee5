use intent_policy_controller_k8s_api::Labels;
use std::fmt;

/// What the controller knows about a pod's network surface.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkDescriptor {
    pub name: String,
    pub namespace: String,
    pub labels: Labels,
    pub ports: Vec<u16>,
    pub protocols: Vec<String>,
    pub service_name: Option<String>,
    pub related_peers: Vec<Peer>,
}

/// A `host:port` peer found in a container's environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub name: String,
    pub port: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

pub const DEFAULT_PROTOCOL: &str = "TCP";

// === impl NetworkDescriptor ===

impl NetworkDescriptor {
    /// Renders `<ports>/<protocols>`, each list joined with `, `.
    pub fn traffic(&self) -> String {
        let ports = self
            .ports
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}/{}", ports, self.protocols.join(", "))
    }

    /// The label used to identify the pod in prompts: `app` when present,
    /// otherwise the first stable label.
    pub fn identifying_label(&self) -> Option<(&str, &str)> {
        self.labels
            .get("app")
            .map(|v| ("app", v))
            .or_else(|| self.labels.first())
    }

    /// Whether any peer in this pod's environment names `host`.
    pub fn references(&self, host: &str) -> bool {
        self.related_peers.iter().any(|p| p.name == host)
    }
}

// === impl Peer ===

impl Peer {
    /// Parses a `host:port` value. Values without a numeric port are not
    /// peers.
    pub fn parse(value: &str) -> Option<Self> {
        let (name, port) = value.trim().split_once(':')?;
        if name.is_empty() || port.parse::<u16>().is_err() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            port: port.to_string(),
        })
    }
}

// === impl Direction ===

impl Direction {
    pub fn from_text(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().as_str() {
            "ingress" | "income" | "incoming" | "inbound" => Self::Ingress,
            _ => Self::Egress,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingress => "ingress",
            Self::Egress => "egress",
        }
    }

    /// The preposition used when naming the peer of a flow.
    pub fn preposition(&self) -> &'static str {
        match self {
            Self::Ingress => "from",
            Self::Egress => "to",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traffic_rendering() {
        let desc = NetworkDescriptor {
            ports: vec![80, 443],
            protocols: vec!["TCP".to_string()],
            ..Default::default()
        };
        assert_eq!(desc.traffic(), "80, 443/TCP");
    }

    #[test]
    fn identifying_label_prefers_app() {
        let desc = NetworkDescriptor {
            labels: Labels::from_iter(vec![("app", "web"), ("a-tier", "front")]),
            ..Default::default()
        };
        assert_eq!(desc.identifying_label(), Some(("app", "web")));

        let desc = NetworkDescriptor {
            labels: Labels::from_iter(vec![("tier", "front")]),
            ..Default::default()
        };
        assert_eq!(desc.identifying_label(), Some(("tier", "front")));
    }

    #[test]
    fn peer_parsing() {
        assert_eq!(
            Peer::parse("db-svc:5432"),
            Some(Peer {
                name: "db-svc".to_string(),
                port: "5432".to_string()
            })
        );
        assert_eq!(Peer::parse("plain"), None);
        assert_eq!(Peer::parse("http://x"), None);
    }

    #[test]
    fn direction_words() {
        for word in ["ingress", "Inbound", "incoming", "income"] {
            assert_eq!(Direction::from_text(word), Direction::Ingress, "{word}");
        }
        assert_eq!(Direction::from_text("outgoing"), Direction::Egress);
    }
}
