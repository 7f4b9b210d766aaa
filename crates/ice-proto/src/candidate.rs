//! Parsing of SDP `a=candidate:` lines.
//!
//! The relay never runs full ICE candidate pairing against clients; it only
//! needs to read the host candidates a media server advertises and to emit
//! its own. The accepted shape is
//!
//! ```text
//! a=candidate:<foundation> <component> <transport> <priority> <addr> <port> typ <type> [tcptype passive|active]
//! ```

use std::fmt;

use crate::error::{Error, Result};

/// Candidate type from the `typ` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "host" => Some(CandidateKind::Host),
            "srflx" => Some(CandidateKind::ServerReflexive),
            "prflx" => Some(CandidateKind::PeerReflexive),
            "relay" => Some(CandidateKind::Relay),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::Relay => "relay",
        }
    }
}

/// TCP candidate sub-type from the `tcptype` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpType {
    Passive,
    Active,
    SimultaneousOpen,
}

impl TcpType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "passive" => Some(TcpType::Passive),
            "active" => Some(TcpType::Active),
            "so" => Some(TcpType::SimultaneousOpen),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            TcpType::Passive => "passive",
            TcpType::Active => "active",
            TcpType::SimultaneousOpen => "so",
        }
    }
}

/// One parsed candidate line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub component: u32,
    /// `udp` or `tcp`, lowercased.
    pub transport: String,
    pub priority: u32,
    /// Host field as written: an IP literal or a hostname.
    pub host: String,
    pub port: u16,
    pub kind: CandidateKind,
    pub tcp_type: Option<TcpType>,
}

impl Candidate {
    /// Parse an `a=candidate:` line (leading `a=` optional).
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let body = line
            .strip_prefix("a=candidate:")
            .or_else(|| line.strip_prefix("candidate:"))
            .ok_or_else(|| Error::BadCandidate(line.to_string()))?;

        let fields: Vec<&str> = body.split_whitespace().collect();
        if fields.len() < 8 || fields[6] != "typ" {
            return Err(Error::BadCandidate(line.to_string()));
        }

        let kind = CandidateKind::parse(fields[7])
            .ok_or_else(|| Error::BadCandidate(line.to_string()))?;

        let mut tcp_type = None;
        let mut rest = fields[8..].iter();
        while let Some(key) = rest.next() {
            if *key == "tcptype" {
                tcp_type = rest.next().and_then(|v| TcpType::parse(v));
            }
        }

        Ok(Candidate {
            foundation: fields[0].to_string(),
            component: fields[1]
                .parse()
                .map_err(|_| Error::BadCandidate(line.to_string()))?,
            transport: fields[2].to_ascii_lowercase(),
            priority: fields[3]
                .parse()
                .map_err(|_| Error::BadCandidate(line.to_string()))?,
            host: fields[4].to_string(),
            port: fields[5]
                .parse()
                .map_err(|_| Error::BadCandidate(line.to_string()))?,
            kind,
            tcp_type,
        })
    }

    /// Parse every candidate line in `lines`, skipping anything that is not
    /// a candidate.
    pub fn parse_all<'a, I: IntoIterator<Item = &'a str>>(lines: I) -> Vec<Candidate> {
        lines
            .into_iter()
            .filter_map(|line| Candidate::parse(line).ok())
            .collect()
    }

    pub fn is_host(&self) -> bool {
        self.kind == CandidateKind::Host
    }

    pub fn is_tcp(&self) -> bool {
        self.transport == "tcp"
    }

    /// `host:port` for dialing.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "a=candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.host,
            self.port,
            self.kind.as_str(),
        )?;
        if let Some(tcp_type) = self.tcp_type {
            write!(f, " tcptype {}", tcp_type.as_str())?;
        }
        Ok(())
    }
}
