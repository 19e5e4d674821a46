//! Text transforms applied to SDP before it is committed.

/// Bandwidth lines that cap the negotiated bitrate.
const BANDWIDTH_PREFIXES: [&str; 2] = ["b=AS:", "b=TIAS:"];

/// Strips every `b=AS:` and `b=TIAS:` line from `sdp`.
///
/// All other lines, including their line terminators, are kept byte for byte.
pub fn remove_bandwidth_restriction(sdp: &str) -> String {
    sdp.split_inclusive('\n')
        .filter(|line| !BANDWIDTH_PREFIXES.iter().any(|p| line.starts_with(p)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANSWER: &str = "v=0\r\n\
        o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        c=IN IP4 0.0.0.0\r\n\
        b=AS:30\r\n\
        a=mid:0\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        c=IN IP4 0.0.0.0\r\n\
        b=AS:500\r\n\
        b=TIAS:500000\r\n\
        a=mid:1\r\n";

    #[test]
    fn strips_every_bandwidth_line() {
        let filtered = remove_bandwidth_restriction(ANSWER);
        assert!(!filtered.contains("b=AS:"));
        assert!(!filtered.contains("b=TIAS:"));
    }

    #[test]
    fn keeps_other_lines_byte_identical() {
        let filtered = remove_bandwidth_restriction(ANSWER);
        let expected: String = ANSWER
            .split_inclusive("\r\n")
            .filter(|l| !l.starts_with("b="))
            .collect();
        assert_eq!(filtered, expected);
    }

    #[test]
    fn untouched_without_bandwidth_lines() {
        let sdp = "v=0\r\ns=-\r\na=group:BUNDLE 0 1\r\n";
        assert_eq!(remove_bandwidth_restriction(sdp), sdp);
    }

    #[test]
    fn handles_bare_newlines_and_missing_final_terminator() {
        let sdp = "v=0\nb=AS:64\ns=-\nb=CT:100";
        assert_eq!(remove_bandwidth_restriction(sdp), "v=0\ns=-\nb=CT:100");
    }

    #[test]
    fn idempotent() {
        let once = remove_bandwidth_restriction(ANSWER);
        assert_eq!(remove_bandwidth_restriction(&once), once);
    }
}
