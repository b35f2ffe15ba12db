// Copyright 2024 TideKV Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use prost::Message;
use tidekv_common::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are rejected as corruption rather than buffered.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Reads one length-prefixed message. Returns `Ok(None)` on a clean EOF at a
/// frame boundary; EOF inside a frame is an error.
pub async fn read_message<M, S>(stream: &mut S) -> Result<Option<M>>
where
    M: Message + Default,
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Corruption(format!("frame of {len} bytes exceeds cap")));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    let message = M::decode(payload.as_slice())
        .map_err(|e| Error::Corruption(format!("malformed frame: {e}")))?;
    Ok(Some(message))
}

/// Writes one length-prefixed message and flushes it.
pub async fn write_message<M, S>(stream: &mut S, message: &M) -> Result<()>
where
    M: Message,
    S: AsyncWrite + Unpin,
{
    let len = message.encoded_len();
    let mut buf = Vec::with_capacity(4 + len);
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    message
        .encode(&mut buf)
        .map_err(|e| Error::Corruption(format!("encode failed: {e}")))?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{cmd_request, CmdRequest, GetRequest};

    fn get_request() -> CmdRequest {
        CmdRequest {
            cmd: Some(cmd_request::Cmd::Get(GetRequest {
                table_name: "t".to_string(),
                key: b"k".to_vec(),
            })),
        }
    }

    #[tokio::test]
    async fn test_read_write_roundtrip() {
        let request = get_request();
        let mut cursor = std::io::Cursor::new(Vec::new());
        write_message(&mut cursor, &request).await.unwrap();
        write_message(&mut cursor, &request).await.unwrap();
        let buf = cursor.into_inner();

        let mut reader = buf.as_slice();
        for _ in 0..2 {
            let decoded: CmdRequest = read_message(&mut reader).await.unwrap().unwrap();
            assert_eq!(decoded, request);
        }
        assert!(read_message::<CmdRequest, _>(&mut reader)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_frame() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        write_message(&mut cursor, &get_request()).await.unwrap();
        let mut buf = cursor.into_inner();
        buf.truncate(buf.len() - 1);

        let mut reader = buf.as_slice();
        assert!(read_message::<CmdRequest, _>(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut reader = buf.as_slice();
        let err = read_message::<CmdRequest, _>(&mut reader)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }
}
