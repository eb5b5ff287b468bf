//! Published session description for RTP outputs.
//!
//! The encoder writes its own SDP once it has seen input. That file is
//! rewritten before anyone can fetch it:
//!
//! ```text
//! v=0                                   ← kept
//! o=- 0 0 IN IP4 127.0.0.1              ← kept
//! s=<mosaic title>                      ← replaced
//! c=IN IP4 239.0.0.1                    ← kept
//! t=0 0                                 ← kept
//! a=tool:mosaic-rs                      ← replaces the encoder's tool line
//! m=video 5004 RTP/AVP 96               ← media section kept verbatim
//! a=rtpmap:96 H264/90000
//! a=fmtp:96 packetization-mode=1; ...
//! ```
//!
//! Lines end in CRLF as RFC 8866 requires, whatever the encoder used.

pub const TOOL: &str = "mosaic-rs";

/// Whether the encoder's SDP is complete enough to publish.
pub fn is_complete(raw: &str) -> bool {
    raw.starts_with("v=0") && raw.lines().any(|l| l.starts_with("m="))
}

/// Rewrite an encoder SDP for publication under `session_name`.
pub fn publish_sdp(raw: &str, session_name: &str) -> String {
    let mut sdp: Vec<String> = Vec::new();
    let mut in_media = false;
    let mut tool_written = false;

    for line in raw.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
        if line.starts_with("m=") {
            if !tool_written {
                sdp.push(format!("a=tool:{TOOL}"));
                tool_written = true;
            }
            in_media = true;
        }
        if !in_media {
            if line.starts_with("s=") {
                sdp.push(format!("s={session_name}"));
                continue;
            }
            if line.starts_with("a=tool:") {
                if !tool_written {
                    sdp.push(format!("a=tool:{TOOL}"));
                    tool_written = true;
                }
                continue;
            }
        }
        sdp.push(line.to_string());
    }
    if !tool_written {
        sdp.push(format!("a=tool:{TOOL}"));
    }

    tracing::debug!("SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FFMPEG_SDP: &str = "v=0\n\
o=- 0 0 IN IP4 127.0.0.1\n\
s=No Name\n\
c=IN IP4 239.0.0.1/127\n\
t=0 0\n\
a=tool:libavformat 60.16.100\n\
m=video 5004 RTP/AVP 96\n\
a=rtpmap:96 H264/90000\n\
a=fmtp:96 packetization-mode=1\n";

    #[test]
    fn rewrites_session_name_and_tool() {
        let sdp = publish_sdp(FFMPEG_SDP, "Mosaic CAM1 CAM2");
        assert!(sdp.contains("s=Mosaic CAM1 CAM2\r\n"));
        assert!(sdp.contains("a=tool:mosaic-rs\r\n"));
        assert!(!sdp.contains("libavformat"));
        assert!(sdp.contains("c=IN IP4 239.0.0.1/127\r\n"));
        assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));

        // Session-level attrs must come before the media section.
        let tool_idx = sdp.find("a=tool").unwrap();
        let m_idx = sdp.find("m=video").unwrap();
        assert!(tool_idx < m_idx);
        assert!(sdp.ends_with("\r\n"), "SDP must end with CRLF");
        assert!(!sdp.replace("\r\n", "").contains('\n'));
    }

    #[test]
    fn adds_tool_when_encoder_omits_it() {
        let raw = "v=0\ns=x\nt=0 0\nm=video 5004 RTP/AVP 96\n";
        let sdp = publish_sdp(raw, "Mosaic");
        assert!(sdp.find("a=tool").unwrap() < sdp.find("m=video").unwrap());
    }

    #[test]
    fn partial_sdp_is_not_complete() {
        assert!(!is_complete(""));
        assert!(!is_complete("v=0\no=- 0 0 IN IP4 127.0.0.1\n"));
        assert!(is_complete(FFMPEG_SDP));
    }
}
