use crate::{
    config::Config,
    error::{MuxError, Result},
    message::WireMessage,
};
use tokio_tungstenite::tungstenite::Message;

/// Converts wire messages to and from transport messages.
///
/// The transport already delimits messages, so a frame is exactly one JSON
/// document carried in one text message. Binary transport messages holding
/// the same JSON are accepted on input.
#[derive(Debug, Clone)]
pub struct Codec {
    max_frame_size: usize,
}

impl Codec {
    pub fn new(config: &Config) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
        }
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_frame_size {
            return Err(MuxError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    pub fn encode(&self, message: &WireMessage) -> Result<Message> {
        message.validate()?;

        let text = serde_json::to_string(message)?;
        self.check_size(text.len())?;

        Ok(Message::text(text))
    }

    /// Decodes one transport message.
    ///
    /// Returns `Ok(None)` for transport-level control messages (ping, pong,
    /// close, raw frames), which carry nothing for the multiplexer.
    pub fn decode(&self, message: Message) -> Result<Option<WireMessage>> {
        let decoded: WireMessage = match message {
            Message::Text(text) => {
                self.check_size(text.len())?;
                serde_json::from_str(text.as_str())?
            }
            Message::Binary(data) => {
                self.check_size(data.len())?;
                serde_json::from_slice(&data)?
            }
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => {
                return Ok(None);
            }
        };

        decoded.validate()?;
        Ok(Some(decoded))
    }
}
