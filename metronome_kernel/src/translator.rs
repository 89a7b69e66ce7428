//! Translators convert between published values and endpoint messages.

use metronome_core::SmallBuffer;

use crate::message::EndpointMessage;

pub type ToMessageFn = Box<dyn FnMut(&[u8]) -> SmallBuffer + Send>;
pub type ToValueFn = Box<dyn FnMut(&EndpointMessage) -> SmallBuffer + Send>;

/// The conversion capability of one translator.
///
/// Invoked by the owning core when a value lands on the translator's value
/// side or a message lands on its message side.
pub enum TranslatorOperator {
    /// Value bytes are interpreted as UTF-8/JSON text and wrapped into a
    /// JSON message body; message bodies convert back as JSON text.
    Json,
    /// Bytes pass through unchanged in both directions.
    Binary,
    /// User-provided conversion pair.
    Custom { to_message: ToMessageFn, to_value: ToValueFn },
}

impl std::fmt::Debug for TranslatorOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslatorOperator::Json => f.write_str("TranslatorOperator::Json"),
            TranslatorOperator::Binary => f.write_str("TranslatorOperator::Binary"),
            TranslatorOperator::Custom { .. } => f.write_str("TranslatorOperator::Custom"),
        }
    }
}

impl TranslatorOperator {
    /// Convert a value payload into a message payload.
    pub fn value_to_message(&mut self, value: &[u8]) -> SmallBuffer {
        match self {
            TranslatorOperator::Json => {
                let text = String::from_utf8_lossy(value);
                let body = serde_json::json!({ "value": text });
                body.to_string().into()
            }
            TranslatorOperator::Binary => SmallBuffer::from(value),
            TranslatorOperator::Custom { to_message, .. } => to_message(value),
        }
    }

    /// Convert a message into a value payload.
    pub fn message_to_value(&mut self, msg: &EndpointMessage) -> SmallBuffer {
        match self {
            TranslatorOperator::Json => {
                match serde_json::from_slice::<serde_json::Value>(msg.payload.as_bytes()) {
                    Ok(body) => body
                        .get("value")
                        .and_then(|v| v.as_str())
                        .map(SmallBuffer::from)
                        .unwrap_or_else(|| SmallBuffer::from(body.to_string())),
                    Err(_) => SmallBuffer::from(msg.payload.as_bytes()),
                }
            }
            TranslatorOperator::Binary => msg.payload.clone(),
            TranslatorOperator::Custom { to_value, .. } => to_value(msg),
        }
    }

    /// Timing knobs from the original operator surface. Accepted and
    /// ignored; the upstream behavior for these keys is unspecified.
    pub fn set_property(&mut self, key: &str, _value: f64) {
        match key {
            "delay" | "inputdelay" | "outputdelay" => {
                tracing::debug!(key, "translator timing property accepted but not used");
            }
            _ => {
                tracing::warn!(key, "unknown translator property");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metronome_core::Time;

    #[test]
    fn json_round_trip() {
        let mut op = TranslatorOperator::Json;
        let body = op.value_to_message(b"12.5");
        let msg = EndpointMessage::new("t.msg", "dest", Time::ZERO, body);
        let value = op.message_to_value(&msg);
        assert_eq!(value.as_bytes(), b"12.5");
    }

    #[test]
    fn binary_passthrough() {
        let mut op = TranslatorOperator::Binary;
        let bytes = [0u8, 1, 2, 255];
        assert_eq!(op.value_to_message(&bytes).as_bytes(), &bytes);
        let msg = EndpointMessage::new("t.msg", "dest", Time::ZERO, &bytes[..]);
        assert_eq!(op.message_to_value(&msg).as_bytes(), &bytes);
    }

    #[test]
    fn custom_functions_are_invoked() {
        let mut op = TranslatorOperator::Custom {
            to_message: Box::new(|v| {
                let mut out = v.to_vec();
                out.reverse();
                out.into()
            }),
            to_value: Box::new(|m| m.payload.clone()),
        };
        assert_eq!(op.value_to_message(b"abc").as_bytes(), b"cba");
    }
}
