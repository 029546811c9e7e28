use crate::channel::TelemetryChannel;
use crate::domain::Envelope;
use chrono::Utc;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ROLE_INSTANCE_TAG: &str = "ai.cloud.roleInstance";

/// Defaults stamped on every forwarded envelope that lacks them.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeDefaults {
    pub instrumentation_key: Option<String>,
    pub role_instance: Option<String>,
}

impl EnvelopeDefaults {
    pub fn detect(instrumentation_key: Option<String>) -> Self {
        let role_instance = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok());
        Self {
            instrumentation_key,
            role_instance,
        }
    }

    fn apply(&self, mut envelope: Envelope) -> Envelope {
        if envelope.instrumentation_key.is_none() {
            envelope.instrumentation_key = self.instrumentation_key.clone();
        }
        if let Some(role_instance) = &self.role_instance {
            envelope
                .tags
                .entry(ROLE_INSTANCE_TAG.to_string())
                .or_insert_with(|| role_instance.clone());
        }
        envelope
    }
}

/// Turns one input line into an envelope.
///
/// A JSON object with `name` and `data` is taken as an envelope (a missing
/// `time` means now); anything else becomes a trace carrying the line.
pub fn parse_line(line: &str, defaults: &EnvelopeDefaults) -> Option<Envelope> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let envelope = match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(mut object)) if object.contains_key("name") && object.contains_key("data") => {
            object
                .entry("time")
                .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
            match serde_json::from_value::<Envelope>(Value::Object(object)) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!("Line is not a valid envelope ({e}), forwarding as trace");
                    Envelope::trace(line)
                }
            }
        }
        _ => Envelope::trace(line),
    };

    Some(defaults.apply(envelope))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub lines: u64,
    pub forwarded: u64,
}

/// Feeds every line of `input` into the channel until end of input or
/// cancellation.
pub async fn forward_lines<R>(
    input: R,
    channel: &TelemetryChannel,
    defaults: &EnvelopeDefaults,
    cancel: &CancellationToken,
) -> std::io::Result<ForwardStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut stats = ForwardStats::default();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Stopping input forwarding");
                break;
            }
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                stats.lines += 1;
                if let Some(envelope) = parse_line(&line, defaults) {
                    channel.send(envelope);
                    stats.forwarded += 1;
                }
            }
            Ok(None) => {
                info!("End of input after {} lines", stats.lines);
                break;
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                warn!("Skipping input line that is not valid UTF-8");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> EnvelopeDefaults {
        EnvelopeDefaults {
            instrumentation_key: Some("ikey-1".to_string()),
            role_instance: Some("host-a".to_string()),
        }
    }

    #[test]
    fn test_plain_text_becomes_trace() {
        let envelope = parse_line("disk almost full", &defaults()).unwrap();

        assert_eq!(envelope.data.base_type, "MessageData");
        assert_eq!(envelope.data.base_data["message"], "disk almost full");
        assert_eq!(envelope.instrumentation_key.as_deref(), Some("ikey-1"));
        assert_eq!(envelope.tags.get(ROLE_INSTANCE_TAG).map(String::as_str), Some("host-a"));
    }

    #[test]
    fn test_json_envelope_keeps_its_own_fields() {
        let line = r#"{"name":"Event","iKey":"own-key","tags":{"ai.cloud.roleInstance":"web-1"},
            "data":{"baseType":"EventData","baseData":{"ver":2,"name":"checkout"}}}"#
            .replace('\n', "");

        let envelope = parse_line(&line, &defaults()).unwrap();

        assert_eq!(envelope.name, "Event");
        assert_eq!(envelope.instrumentation_key.as_deref(), Some("own-key"));
        assert_eq!(envelope.tags.get(ROLE_INSTANCE_TAG).map(String::as_str), Some("web-1"));
        assert_eq!(envelope.data.base_data["name"], "checkout");
    }

    #[test]
    fn test_blank_lines_are_ignored() {
        assert!(parse_line("   ", &defaults()).is_none());
    }

    #[test]
    fn test_json_without_envelope_shape_is_a_trace() {
        let envelope = parse_line(r#"{"level":"info","msg":"hi"}"#, &defaults()).unwrap();

        assert_eq!(envelope.data.base_type, "MessageData");
    }
}
