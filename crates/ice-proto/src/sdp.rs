//! SDP micro-parser.
//!
//! Only what signaling needs survives here: the media sections of an offer
//! or answer, their ICE short-term credentials and candidate lines, and a
//! rewrite operation that swaps the candidate set of every media section.
//! Everything else in the SDP is carried through untouched or ignored.

use std::fmt;

use crate::error::{Error, Result};

/// Media section kind, from the `m=` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Application,
}

impl MediaKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            "application" => Some(MediaKind::Application),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
            MediaKind::Application => write!(f, "application"),
        }
    }
}

/// ICE credentials and candidates of one media section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaSection {
    pub kind: Option<MediaKind>,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub ice_options: Option<String>,
    pub candidates: Vec<String>,
}

/// The parts of an SDP document the relay reads.
#[derive(Debug, Clone, Default)]
pub struct SessionDescription {
    audio: Vec<MediaSection>,
    video: Vec<MediaSection>,
    application: Vec<MediaSection>,
}

impl SessionDescription {
    /// Parse an SDP document. CRLF and bare LF line endings both work.
    /// Lines outside any `m=` section and attributes the relay does not use
    /// are skipped.
    pub fn parse(data: &str) -> Result<Self> {
        let mut sdp = SessionDescription::default();
        let mut current: Option<MediaSection> = None;

        for raw in data.lines() {
            let line = raw.trim_end_matches('\r').trim();
            if line.len() <= 2 || line.as_bytes().get(1) != Some(&b'=') {
                continue;
            }

            match &line[..2] {
                "m=" => {
                    sdp.push_section(current.take());
                    let kind = line[2..].split_whitespace().next().and_then(MediaKind::parse);
                    current = Some(MediaSection {
                        kind,
                        ..MediaSection::default()
                    });
                }
                "a=" => {
                    let Some(section) = current.as_mut() else {
                        continue;
                    };
                    let (key, value) = match line[2..].split_once(':') {
                        Some((key, value)) => (key, value),
                        None => (&line[2..], ""),
                    };
                    match key {
                        "ice-ufrag" => section.ice_ufrag = value.trim().to_string(),
                        "ice-pwd" => section.ice_pwd = value.trim().to_string(),
                        "ice-options" => section.ice_options = Some(value.trim().to_string()),
                        "candidate" => section.candidates.push(line.to_string()),
                        _ => {}
                    }
                }
                _ => {}
            }
        }
        sdp.push_section(current);

        if sdp.audio.is_empty() && sdp.video.is_empty() && sdp.application.is_empty() {
            return Err(Error::BadSdp("no media section"));
        }
        Ok(sdp)
    }

    fn push_section(&mut self, section: Option<MediaSection>) {
        let Some(section) = section else { return };
        match section.kind {
            Some(MediaKind::Audio) => self.audio.push(section),
            Some(MediaKind::Video) => self.video.push(section),
            Some(MediaKind::Application) => self.application.push(section),
            None => {}
        }
    }

    /// The section credentials come from: audio wins over video over
    /// application.
    fn primary(&self) -> Option<&MediaSection> {
        self.audio
            .first()
            .or_else(|| self.video.first())
            .or_else(|| self.application.first())
    }

    pub fn ice_ufrag(&self) -> Option<&str> {
        self.primary()
            .map(|s| s.ice_ufrag.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn ice_pwd(&self) -> Option<&str> {
        self.primary()
            .map(|s| s.ice_pwd.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn ice_options(&self) -> Option<&str> {
        self.primary().and_then(|s| s.ice_options.as_deref())
    }

    /// Candidate lines of the primary media section.
    pub fn candidates(&self) -> &[String] {
        self.primary().map(|s| s.candidates.as_slice()).unwrap_or(&[])
    }
}

/// Replace every `a=candidate:` line in each media section of `sdp` with
/// `candidates`, appending `a=end-of-candidates` to sections that did not
/// already carry one. The original line separator (CRLF or LF) and all other
/// lines are preserved.
pub fn update_candidates(sdp: &str, candidates: &[String]) -> String {
    if candidates.is_empty() {
        return sdp.to_string();
    }

    let sep = if sdp.contains("\r\n") { "\r\n" } else { "\n" };

    let mut out: Vec<String> = Vec::new();
    let mut in_media = false;
    let mut had_marker = false;

    let flush = |out: &mut Vec<String>, in_media: bool, had_marker: bool| {
        if in_media && !had_marker {
            out.extend(candidates.iter().cloned());
            out.push("a=end-of-candidates".to_string());
        }
    };

    for raw in sdp.lines() {
        let line = raw.trim_end_matches('\r').trim();
        if line.starts_with("m=") {
            flush(&mut out, in_media, had_marker);
            in_media = true;
            had_marker = false;
            out.push(line.to_string());
        } else if line.starts_with("a=candidate:") {
            // dropped; the replacement set goes in at the marker or section end
        } else if line.starts_with("a=end-of-candidates") {
            had_marker = true;
            out.extend(candidates.iter().cloned());
            out.push(line.to_string());
        } else if !line.is_empty() {
            out.push(line.to_string());
        }
    }
    flush(&mut out, in_media, had_marker);

    out.join(sep)
}

/// Collect every `a=candidate:` line of an SDP document.
pub fn extract_candidates(sdp: &str) -> Vec<String> {
    sdp.lines()
        .map(|l| l.trim_end_matches('\r').trim())
        .filter(|l| l.starts_with("a=candidate:"))
        .map(|l| l.to_string())
        .collect()
}

/// Synthesize the minimal remote SDP the upstream agent negotiates against:
/// one `m=application` section carrying the media server's credentials and
/// candidates.
pub fn agent_remote_sdp(ufrag: &str, pwd: &str, candidates: &[String]) -> String {
    let mut lines = vec![
        "m=application".to_string(),
        "c=IN IP4 0.0.0.0".to_string(),
        format!("a=ice-ufrag:{ufrag}"),
        format!("a=ice-pwd:{pwd}"),
    ];
    lines.extend(candidates.iter().cloned());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=ice-ufrag:c1\r\n\
        a=ice-pwd:opwd0000000000000000000\r\n\
        a=ice-options:trickle\r\n\
        a=candidate:1 1 udp 2113937151 203.0.113.10 5000 typ host\r\n\
        a=candidate:2 1 tcp 1518280447 203.0.113.10 443 typ host tcptype passive\r\n\
        a=mid:0\r\n";

    #[test]
    fn extracts_credentials_and_candidates() {
        let sdp = SessionDescription::parse(OFFER).unwrap();
        assert_eq!(sdp.ice_ufrag(), Some("c1"));
        assert_eq!(sdp.ice_pwd(), Some("opwd0000000000000000000"));
        assert_eq!(sdp.ice_options(), Some("trickle"));
        assert_eq!(sdp.candidates().len(), 2);
        assert!(sdp.candidates()[0].starts_with("a=candidate:1"));
    }

    #[test]
    fn lf_only_sdp_parses_too() {
        let sdp = SessionDescription::parse(&OFFER.replace("\r\n", "\n")).unwrap();
        assert_eq!(sdp.ice_ufrag(), Some("c1"));
    }

    #[test]
    fn audio_wins_over_application() {
        let sdp = SessionDescription::parse(
            "m=application 9 UDP/DTLS/SCTP webrtc-datachannel\n\
             a=ice-ufrag:app\n\
             a=ice-pwd:apppwd\n\
             m=audio 9 UDP/TLS/RTP/SAVPF 111\n\
             a=ice-ufrag:aud\n\
             a=ice-pwd:audpwd\n",
        )
        .unwrap();
        assert_eq!(sdp.ice_ufrag(), Some("aud"));
    }

    #[test]
    fn no_media_section_is_an_error() {
        assert!(SessionDescription::parse("v=0\no=- 1 2 IN IP4 0.0.0.0\n").is_err());
    }

    #[test]
    fn update_replaces_candidates_per_section() {
        let new = vec!["a=candidate:9 1 udp 2113937151 198.51.100.7 9001 typ host".to_string()];
        let rewritten = update_candidates(OFFER, &new);

        let count = rewritten
            .lines()
            .filter(|l| l.starts_with("a=candidate:"))
            .count();
        assert_eq!(count, 1);
        assert!(rewritten.contains("a=candidate:9 1 udp"));
        assert!(rewritten.contains("a=end-of-candidates"));
        // Untouched lines survive.
        assert!(rewritten.contains("a=ice-ufrag:c1"));
        assert!(rewritten.contains("a=mid:0"));
        assert!(rewritten.contains("\r\n"));
    }

    #[test]
    fn update_keeps_existing_marker_position() {
        let sdp = "m=audio 9 RTP/AVP 0\n\
            a=candidate:1 1 udp 1 10.0.0.1 1000 typ host\n\
            a=end-of-candidates\n\
            a=mid:0";
        let new = vec!["a=candidate:7 1 udp 1 10.0.0.9 9000 typ host".to_string()];
        let rewritten = update_candidates(sdp, &new);
        let lines: Vec<&str> = rewritten.lines().collect();
        assert_eq!(
            lines,
            [
                "m=audio 9 RTP/AVP 0",
                "a=candidate:7 1 udp 1 10.0.0.9 9000 typ host",
                "a=end-of-candidates",
                "a=mid:0",
            ]
        );
    }

    #[test]
    fn update_with_empty_set_is_identity() {
        assert_eq!(update_candidates(OFFER, &[]), OFFER);
    }

    #[test]
    fn agent_remote_sdp_round_trips_through_parser() {
        let cands = vec!["a=candidate:1 1 udp 2113937151 10.0.0.2 7000 typ host".to_string()];
        let sdp_text = agent_remote_sdp("s1", "apwd", &cands);
        let sdp = SessionDescription::parse(&sdp_text).unwrap();
        assert_eq!(sdp.ice_ufrag(), Some("s1"));
        assert_eq!(sdp.ice_pwd(), Some("apwd"));
        assert_eq!(sdp.candidates(), cands.as_slice());
    }
}
