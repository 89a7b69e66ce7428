//! Framed [`ActionMessage`] codec for stream transports.

use bytes::{BufMut, BytesMut};
use metronome_core::{command::CommandError, ActionMessage};
use tokio_util::codec::{Decoder, Encoder};

/// Encodes and decodes the length-prefixed ActionMessage frame. The encoder
/// emits either the binary or the JSON body form; the decoder accepts both
/// (the frame tags its own format).
#[derive(Debug, Default, Clone, Copy)]
pub struct ActionCodec {
    json: bool,
}

impl ActionCodec {
    pub fn new() -> Self {
        ActionCodec { json: false }
    }

    pub fn json() -> Self {
        ActionCodec { json: true }
    }
}

impl Decoder for ActionCodec {
    type Item = ActionMessage;
    type Error = CommandError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match ActionMessage::depacketize(buf)? {
            Some((msg, consumed)) => {
                let _ = buf.split_to(consumed);
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<ActionMessage> for ActionCodec {
    type Error = CommandError;

    fn encode(&mut self, item: ActionMessage, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = if self.json { item.packetize_json() } else { item.packetize() };
        buf.reserve(frame.len());
        buf.put(frame.as_slice());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use metronome_core::command::Action;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::Framed;

    #[tokio::test]
    async fn echo_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, ActionCodec::new());
            while let Some(Ok(msg)) = framed.next().await {
                framed.send(msg).await.unwrap();
            }
        });

        let socket = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(socket, ActionCodec::new());

        let mut cmd = ActionMessage::new(Action::Publish);
        cmd.payload = metronome_core::SmallBuffer::from("payload bytes");
        framed.send(cmd.clone()).await.unwrap();
        let echoed = framed.next().await.unwrap().unwrap();
        assert_eq!(echoed, cmd);

        // JSON frames decode on the same connection
        let mut json_framed = Framed::new(framed.into_inner(), ActionCodec::json());
        json_framed.send(cmd.clone()).await.unwrap();
        let echoed = json_framed.next().await.unwrap().unwrap();
        assert_eq!(echoed, cmd);
    }
}
