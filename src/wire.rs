//! Wire codec
//!
//! All control traffic is newline-free, colon-delimited text with `key=value`
//! fields after a type tag. The two chunk-bearing shapes append raw binary:
//! the inline result puts a sentinel between the text header and the payload
//! inside one datagram, the streamed result uses fixed binary framing over a
//! dedicated TCP connection.
//!
//! Decoding is strict: a missing, duplicate, or unparsable field fails the
//! whole message with `MalformedMessage` instead of producing a half-read
//! value.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{NodeError, Result};
use crate::types::FileRecord;

/// Separator between the inline result's text header and the raw chunk bytes
pub const SENTINEL: [u8; 3] = [0x00, 0x1f, 0x00];

/// Chunks at or below this size travel inline in a single datagram;
/// larger chunks use the streamed path.
pub const INLINE_LIMIT: usize = 8 * 1024;

/// Receive buffer size for the UDP listeners
pub const MAX_DATAGRAM: usize = 16 * 1024;

/// Leading tag of a streamed chunk result
pub const STREAM_TAG: [u8; 4] = *b"SHCK";

/// Upper bound on a streamed payload; anything larger is a protocol
/// violation, not a real chunk.
const MAX_STREAM_PAYLOAD: u64 = 4 * 1024 * 1024;

/// Upper bound on a hex digest field read from a stream
const MAX_DIGEST_LEN: usize = 128;

/// File lifecycle event carried by a FILE_NOTIFICATION
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    Created,
    Deleted,
}

impl FileEvent {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Deleted => "deleted",
        }
    }
}

/// A decoded control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Broadcast announcement of a newly connected peer
    Bootstrap { addr: SocketAddr },

    /// Pairwise link acknowledgment; adds the sender to the peer set
    Friend { addr: SocketAddr },

    /// Ask a peer to replay its catalog as FILE_NOTIFICATIONs
    FileInfoRequest { addr: SocketAddr },

    /// A file appeared or disappeared somewhere in the overlay
    FileNotification { event: FileEvent, record: FileRecord },

    /// TTL-bounded flood query for a chunk owner
    ChunkRequest {
        hash: String,
        index: u32,
        requester: SocketAddr,
        ttl: u8,
        visited: Vec<SocketAddr>,
    },
}

/// Header of an inline chunk result datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResultHeader {
    pub file_hash: String,
    pub index: u32,
    pub chunk_hash: String,
    pub chunk_size: u32,
    pub sender: SocketAddr,
}

/// A chunk result read off a stream connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedChunk {
    pub file_hash: String,
    pub index: u32,
    pub chunk_hash: String,
    pub data: Vec<u8>,
}

impl Message {
    /// Encode the message to its wire text
    pub fn encode(&self) -> String {
        match self {
            Self::Bootstrap { addr } => {
                format!("BOOTSTRAP:ip={}:port={}", addr.ip(), addr.port())
            }

            Self::Friend { addr } => {
                format!("FRIEND:ip={}:port={}", addr.ip(), addr.port())
            }

            Self::FileInfoRequest { addr } => {
                format!("FILE_INFO_REQUEST:ip={}:port={}", addr.ip(), addr.port())
            }

            Self::FileNotification { event, record } => format!(
                "FILE_NOTIFICATION:event={}:filename={}:filetype={}:filesize={}:chunkcount={}:hash={}:ip={}:port={}",
                event.as_str(),
                record.name,
                record.extension,
                record.size,
                record.chunk_count,
                record.hash,
                record.owner.ip(),
                record.owner.port(),
            ),

            Self::ChunkRequest {
                hash,
                index,
                requester,
                ttl,
                visited,
            } => {
                let visited: Vec<String> = visited
                    .iter()
                    .map(|a| format!("{};{}", a.ip(), a.port()))
                    .collect();
                format!(
                    "CHUNK_REQUEST:hash={}:index={}:ip={}:port={}:ttl={}:visited={}",
                    hash,
                    index,
                    requester.ip(),
                    requester.port(),
                    ttl,
                    visited.join(","),
                )
            }
        }
    }

    /// Decode a control message from datagram text
    pub fn decode(text: &str) -> Result<Self> {
        let text = text.trim_end_matches(char::from(0)).trim();
        let (tag, rest) = match text.split_once(':') {
            Some((tag, rest)) => (tag, rest),
            None => (text, ""),
        };

        let mut fields = Fields::parse(rest)?;

        let msg = match tag {
            "BOOTSTRAP" => Self::Bootstrap {
                addr: fields.take_addr("ip", "port")?,
            },
            "FRIEND" => Self::Friend {
                addr: fields.take_addr("ip", "port")?,
            },
            "FILE_INFO_REQUEST" => Self::FileInfoRequest {
                addr: fields.take_addr("ip", "port")?,
            },
            "FILE_NOTIFICATION" => {
                let event = match fields.take("event")? {
                    "created" => FileEvent::Created,
                    "deleted" => FileEvent::Deleted,
                    other => {
                        return Err(NodeError::malformed(format!(
                            "unknown notification event '{}'",
                            other
                        )))
                    }
                };
                let name = fields.take("filename")?.to_string();
                let extension = fields.take("filetype")?.to_string();
                let size = fields.take_u64("filesize")?;
                let chunk_count = fields.take_u32("chunkcount")?;
                let hash = fields.take("hash")?.to_string();
                let owner = fields.take_addr("ip", "port")?;
                Self::FileNotification {
                    event,
                    record: FileRecord {
                        name,
                        extension,
                        size,
                        chunk_count,
                        hash,
                        owner,
                        local_path: None,
                    },
                }
            }
            "CHUNK_REQUEST" => {
                let hash = fields.take("hash")?.to_string();
                let index = fields.take_u32("index")?;
                let requester = fields.take_addr("ip", "port")?;
                let ttl = fields.take_u32("ttl")?;
                if ttl == 0 || ttl > u8::MAX as u32 {
                    return Err(NodeError::malformed(format!("ttl {} out of range", ttl)));
                }
                let visited = parse_visited(fields.take("visited")?)?;
                Self::ChunkRequest {
                    hash,
                    index,
                    requester,
                    ttl: ttl as u8,
                    visited,
                }
            }
            other => {
                return Err(NodeError::malformed(format!(
                    "unknown message tag '{}'",
                    other
                )))
            }
        };

        fields.finish()?;
        Ok(msg)
    }
}

/// Encode an inline chunk result: text header, sentinel, raw bytes.
pub fn encode_chunk_result(header: &ChunkResultHeader, bytes: &[u8]) -> Vec<u8> {
    debug_assert_eq!(header.chunk_size as usize, bytes.len());

    let text = format!(
        "CHUNK_RESULT:hash={}:index={}:chunkhash={}:chunksize={}:ip={}:port={}",
        header.file_hash,
        header.index,
        header.chunk_hash,
        header.chunk_size,
        header.sender.ip(),
        header.sender.port(),
    );

    let mut out = Vec::with_capacity(text.len() + SENTINEL.len() + bytes.len());
    out.extend_from_slice(text.as_bytes());
    out.extend_from_slice(&SENTINEL);
    out.extend_from_slice(bytes);
    out
}

/// Decode an inline chunk result datagram.
///
/// Copies exactly `chunksize` bytes from after the sentinel. A declared
/// length that would overrun the datagram fails the whole message.
pub fn decode_chunk_result(datagram: &[u8]) -> Result<(ChunkResultHeader, Vec<u8>)> {
    let sentinel_at = datagram
        .windows(SENTINEL.len())
        .position(|w| w == SENTINEL)
        .ok_or_else(|| NodeError::malformed("chunk result has no sentinel"))?;

    let text = std::str::from_utf8(&datagram[..sentinel_at])
        .map_err(|_| NodeError::malformed("chunk result header is not UTF-8"))?;

    let rest = text
        .strip_prefix("CHUNK_RESULT:")
        .ok_or_else(|| NodeError::malformed("not a CHUNK_RESULT datagram"))?;

    let mut fields = Fields::parse(rest)?;
    let header = ChunkResultHeader {
        file_hash: fields.take("hash")?.to_string(),
        index: fields.take_u32("index")?,
        chunk_hash: fields.take("chunkhash")?.to_string(),
        chunk_size: fields.take_u32("chunksize")?,
        sender: fields.take_addr("ip", "port")?,
    };
    fields.finish()?;

    let payload = &datagram[sentinel_at + SENTINEL.len()..];
    let declared = header.chunk_size as usize;
    if declared > payload.len() {
        return Err(NodeError::malformed(format!(
            "declared chunk size {} overruns datagram ({} bytes after sentinel)",
            declared,
            payload.len()
        )));
    }

    Ok((header, payload[..declared].to_vec()))
}

/// Check whether a datagram looks like an inline chunk result.
///
/// Cheap prefix test so the listener can route binary-bearing datagrams
/// before attempting UTF-8 decoding of the whole buffer.
pub fn is_chunk_result(datagram: &[u8]) -> bool {
    datagram.starts_with(b"CHUNK_RESULT:")
}

/// Write a streamed chunk result: tag, file hash, index, chunk hash,
/// byte length, raw bytes. Field order is fixed; the writer closes the
/// connection after the payload.
pub async fn write_streamed_chunk<W>(writer: &mut W, chunk: &StreamedChunk) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&STREAM_TAG).await?;
    write_field(writer, chunk.file_hash.as_bytes()).await?;
    writer.write_all(&chunk.index.to_be_bytes()).await?;
    write_field(writer, chunk.chunk_hash.as_bytes()).await?;
    writer
        .write_all(&(chunk.data.len() as u64).to_be_bytes())
        .await?;
    writer.write_all(&chunk.data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a streamed chunk result in the same fixed order the writer uses.
pub async fn read_streamed_chunk<R>(reader: &mut R) -> Result<StreamedChunk>
where
    R: AsyncRead + Unpin,
{
    let mut tag = [0u8; 4];
    reader.read_exact(&mut tag).await?;
    if tag != STREAM_TAG {
        return Err(NodeError::malformed("bad stream tag"));
    }

    let file_hash = read_digest_field(reader).await?;
    let mut index_buf = [0u8; 4];
    reader.read_exact(&mut index_buf).await?;
    let index = u32::from_be_bytes(index_buf);
    let chunk_hash = read_digest_field(reader).await?;

    let mut len_buf = [0u8; 8];
    reader.read_exact(&mut len_buf).await?;
    let len = u64::from_be_bytes(len_buf);
    if len > MAX_STREAM_PAYLOAD {
        return Err(NodeError::malformed(format!(
            "streamed payload of {} bytes exceeds limit",
            len
        )));
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;

    Ok(StreamedChunk {
        file_hash,
        index,
        chunk_hash,
        data,
    })
}

async fn write_field<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

async fn read_digest_field<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_DIGEST_LEN {
        return Err(NodeError::malformed(format!(
            "digest field of {} bytes exceeds limit",
            len
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| NodeError::malformed("digest field is not UTF-8"))
}

/// Key=value field set with consume-and-verify semantics: every key must be
/// taken exactly once, and `finish` rejects leftovers.
struct Fields<'a> {
    map: HashMap<&'a str, &'a str>,
}

impl<'a> Fields<'a> {
    fn parse(text: &'a str) -> Result<Self> {
        let mut map = HashMap::new();
        if text.is_empty() {
            return Ok(Self { map });
        }
        for part in text.split(':') {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| NodeError::malformed(format!("field '{}' has no '='", part)))?;
            if map.insert(key, value).is_some() {
                return Err(NodeError::malformed(format!("duplicate field '{}'", key)));
            }
        }
        Ok(Self { map })
    }

    fn take(&mut self, key: &str) -> Result<&'a str> {
        self.map
            .remove(key)
            .ok_or_else(|| NodeError::malformed(format!("missing field '{}'", key)))
    }

    fn take_u32(&mut self, key: &str) -> Result<u32> {
        let value = self.take(key)?;
        value
            .parse()
            .map_err(|_| NodeError::malformed(format!("field '{}' is not a u32: '{}'", key, value)))
    }

    fn take_u64(&mut self, key: &str) -> Result<u64> {
        let value = self.take(key)?;
        value
            .parse()
            .map_err(|_| NodeError::malformed(format!("field '{}' is not a u64: '{}'", key, value)))
    }

    fn take_addr(&mut self, ip_key: &str, port_key: &str) -> Result<SocketAddr> {
        let ip = self.take(ip_key)?;
        let port = self.take(port_key)?;
        parse_addr(ip, port)
    }

    fn finish(self) -> Result<()> {
        if let Some(key) = self.map.keys().next() {
            return Err(NodeError::malformed(format!("unexpected field '{}'", key)));
        }
        Ok(())
    }
}

// The transport is IPv4-only, and an IPv6 address would smuggle extra
// colons into the key=value text anyway.
fn parse_addr(ip: &str, port: &str) -> Result<SocketAddr> {
    let ip: Ipv4Addr = ip
        .parse()
        .map_err(|_| NodeError::malformed(format!("bad ipv4 address '{}'", ip)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| NodeError::malformed(format!("bad port '{}'", port)))?;
    Ok(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Visited-set entries use `ip;port` so the pair survives colon splitting.
fn parse_visited(text: &str) -> Result<Vec<SocketAddr>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(',')
        .map(|entry| {
            let (ip, port) = entry
                .split_once(';')
                .ok_or_else(|| NodeError::malformed(format!("bad visited entry '{}'", entry)))?;
            parse_addr(ip, port)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_bootstrap_round_trip() {
        let msg = Message::Bootstrap {
            addr: addr("192.168.1.7:5001"),
        };
        let text = msg.encode();
        assert_eq!(text, "BOOTSTRAP:ip=192.168.1.7:port=5001");
        assert_eq!(Message::decode(&text).unwrap(), msg);
    }

    #[test]
    fn test_friend_and_file_info_round_trip() {
        for msg in [
            Message::Friend {
                addr: addr("10.0.0.2:6000"),
            },
            Message::FileInfoRequest {
                addr: addr("10.0.0.2:6000"),
            },
        ] {
            assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn test_notification_round_trip() {
        let msg = Message::FileNotification {
            event: FileEvent::Created,
            record: FileRecord {
                name: "report.pdf".into(),
                extension: "pdf".into(),
                size: 614_400,
                chunk_count: 3,
                hash: "ab".repeat(32),
                owner: addr("192.168.1.7:5001"),
                local_path: None,
            },
        };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_chunk_request_round_trip() {
        let msg = Message::ChunkRequest {
            hash: "cd".repeat(32),
            index: 2,
            requester: addr("192.168.1.7:5001"),
            ttl: 3,
            visited: vec![addr("192.168.1.7:5001"), addr("192.168.1.9:5002")],
        };
        let text = msg.encode();
        assert!(text.contains("visited=192.168.1.7;5001,192.168.1.9;5002"));
        assert_eq!(Message::decode(&text).unwrap(), msg);
    }

    #[test]
    fn test_chunk_request_empty_visited() {
        let msg = Message::ChunkRequest {
            hash: "cd".repeat(32),
            index: 0,
            requester: addr("127.0.0.1:5001"),
            ttl: 1,
            visited: Vec::new(),
        };
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        // unknown tag
        assert!(Message::decode("HELLO:ip=1.2.3.4:port=1").is_err());
        // missing field
        assert!(Message::decode("BOOTSTRAP:ip=1.2.3.4").is_err());
        // duplicate field
        assert!(Message::decode("BOOTSTRAP:ip=1.2.3.4:ip=1.2.3.4:port=1").is_err());
        // extra field
        assert!(Message::decode("FRIEND:ip=1.2.3.4:port=1:bogus=x").is_err());
        // unparsable port
        assert!(Message::decode("BOOTSTRAP:ip=1.2.3.4:port=banana").is_err());
        // zero TTL
        assert!(Message::decode(
            "CHUNK_REQUEST:hash=ab:index=0:ip=1.2.3.4:port=1:ttl=0:visited="
        )
        .is_err());
        // empty input
        assert!(Message::decode("").is_err());
    }

    #[test]
    fn test_decode_rejects_ipv6_addresses() {
        assert!(Message::decode("BOOTSTRAP:ip=::1:port=1").is_err());
        assert!(Message::decode(
            "CHUNK_REQUEST:hash=ab:index=0:ip=1.2.3.4:port=1:ttl=3:visited=::1;80"
        )
        .is_err());
    }

    #[test]
    fn test_inline_result_round_trip() {
        let bytes = vec![7u8; 512];
        let header = ChunkResultHeader {
            file_hash: "ab".repeat(32),
            index: 2,
            chunk_hash: "cd".repeat(32),
            chunk_size: 512,
            sender: addr("192.168.1.7:5001"),
        };
        let datagram = encode_chunk_result(&header, &bytes);
        assert!(is_chunk_result(&datagram));

        let (decoded, payload) = decode_chunk_result(&datagram).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, bytes);
    }

    #[test]
    fn test_inline_result_overrun_rejected() {
        let header = ChunkResultHeader {
            file_hash: "ab".repeat(32),
            index: 0,
            chunk_hash: "cd".repeat(32),
            chunk_size: 100,
            sender: addr("127.0.0.1:5001"),
        };
        let mut datagram = encode_chunk_result(&header, &vec![1u8; 100]);
        // Truncate the payload so the declared size overruns
        datagram.truncate(datagram.len() - 60);
        assert!(decode_chunk_result(&datagram).is_err());
    }

    #[test]
    fn test_inline_result_no_sentinel_rejected() {
        assert!(decode_chunk_result(b"CHUNK_RESULT:hash=ab:index=0").is_err());
    }

    #[tokio::test]
    async fn test_streamed_round_trip() {
        let chunk = StreamedChunk {
            file_hash: "ab".repeat(32),
            index: 5,
            chunk_hash: "cd".repeat(32),
            data: (0..100_000).map(|i| (i % 251) as u8).collect(),
        };

        let (mut client, mut server) = tokio::io::duplex(256 * 1024);
        write_streamed_chunk(&mut client, &chunk).await.unwrap();
        drop(client);

        let read = read_streamed_chunk(&mut server).await.unwrap();
        assert_eq!(read, chunk);
    }

    #[tokio::test]
    async fn test_streamed_bad_tag_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"NOPE").await.unwrap();
        drop(client);
        assert!(read_streamed_chunk(&mut server).await.is_err());
    }
}
