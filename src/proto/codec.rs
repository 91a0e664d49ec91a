use bytes::BytesMut;
use chrono::Utc;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use super::{decode, encode, DecodeError};
use crate::measurement::Reading;
use crate::rawframe::FRAME_LEN;

/// Splits a byte stream of back to back measurement frames,
/// e.g. a capture of notifications written to a file.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    // A malformed frame is handed out as item instead of an error, because
    // the following frames are still aligned and decodable. Failing here
    // would terminate the whole stream.
    type Item = std::result::Result<Reading, DecodeError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_LEN {
            return Ok(None);
        }
        let frame = src.split_to(FRAME_LEN);
        Ok(Some(decode(&frame, Utc::now())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None if src.is_empty() => Ok(None),
            None => {
                let rest = src.split();
                Ok(Some(Err(DecodeError::InvalidLength(rest.len()))))
            }
        }
    }
}

impl Encoder<Reading> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Reading, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&encode(&item));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Function;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    const VALID: [u8; 6] = [0x23, 0x00, 0x00, 0x00, 0x0a, 0x00];
    const BAD_FUNCTION: [u8; 6] = [0xc0, 0x03, 0x00, 0x00, 0x0a, 0x00];

    #[test]
    fn waits_for_full_frame() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&VALID[..4]);
        assert!(codec.decode(&mut buf).expect("io").is_none());
        buf.extend_from_slice(&VALID[4..]);
        let item = codec.decode(&mut buf).expect("io").expect("frame");
        assert_eq!(item.expect("reading").raw_value(), 10);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn malformed_frame_does_not_end_stream() {
        let capture: Vec<u8> = VALID
            .iter()
            .chain(BAD_FUNCTION.iter())
            .chain(VALID.iter())
            .chain(VALID[..2].iter())
            .copied()
            .collect();

        let items: Vec<_> = FramedRead::new(capture.as_slice(), FrameCodec)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|item| item.expect("io"))
            .collect();

        assert_eq!(items.len(), 4);
        assert!(items[0].is_ok());
        assert_eq!(items[1], Err(DecodeError::UnknownFunction(15)));
        assert!(items[2].is_ok());
        assert_eq!(items[3], Err(DecodeError::InvalidLength(2)));
    }

    #[tokio::test]
    async fn write_capture() {
        let reading = decode(&VALID, Utc::now()).expect("reading");
        let mut out = FramedWrite::new(Vec::new(), FrameCodec);
        out.send(reading.clone()).await.expect("write");
        out.send(reading).await.expect("write");
        let bytes = out.into_inner();
        assert_eq!(bytes.len(), 2 * FRAME_LEN);

        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(bytes.as_slice());
        while let Some(item) = codec.decode(&mut buf).expect("io") {
            assert_eq!(item.expect("reading").function(), Function::VoltageDc);
        }
    }
}
