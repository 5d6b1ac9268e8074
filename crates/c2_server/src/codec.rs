//! The tagged-string convention used to carry command semantics through a
//! single byte payload on the wire.
//!
//! This encoding is an accident of history: the bidirectional channel
//! reuses `CommandResponse` to carry both real responses and
//! forward-to-agent directives. Kept byte-for-byte compatible with the
//! tag set agents already expect on the wire.

/// Re-serialises a command's type and payload into the tagged ASCII form
/// the agent expects inside a `CommandResponse.result`.
pub fn encode(command_type: &str, payload: &[u8]) -> Vec<u8> {
    match command_type {
        "shell" => tagged("shell", payload),
        "upload" => tagged("upload", payload),
        "download" => tagged("download", payload),
        "screenshot" => b"screenshot:".to_vec(),
        "system" => b"system:".to_vec(),
        "process" => b"process:".to_vec(),
        "interactive" => tagged("interactive", payload),
        "input" => tagged("input", payload),
        "output" => b"output:".to_vec(),
        _ => payload.to_vec(),
    }
}

fn tagged(tag: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tag.len() + 1 + payload.len());
    out.extend_from_slice(tag.as_bytes());
    out.push(b':');
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_types_round_trip() {
        for (cmd_type, expected_tag) in [
            ("shell", "shell"),
            ("upload", "upload"),
            ("download", "download"),
            ("interactive", "interactive"),
            ("input", "input"),
        ] {
            let payload = b"echo hi".to_vec();
            let got = encode(cmd_type, &payload);
            let expected = [expected_tag.as_bytes(), b":", payload.as_slice()].concat();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn bare_tags_carry_no_payload() {
        assert_eq!(encode("screenshot", b"ignored"), b"screenshot:");
        assert_eq!(encode("system", b""), b"system:");
        assert_eq!(encode("process", b""), b"process:");
        assert_eq!(encode("output", b"ignored"), b"output:");
    }

    #[test]
    fn unknown_type_passes_through() {
        assert_eq!(encode("register", b"agent-1"), b"agent-1");
        assert_eq!(encode("response", b"done"), b"done");
    }
}
