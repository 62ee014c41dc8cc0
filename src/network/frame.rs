/// 流式传输的定长前缀分帧
///
/// 线上格式：1 / 2 / 4 字节的长度前缀（字节序可配）+ 载荷。
/// 解码采用增量缓冲：不足一帧时返回 `None` 等待更多数据，
/// 凑齐后直接从缓冲区切出载荷，不做多余拷贝。
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::NetError;

/// 长度前缀宽度的封闭集合
///
/// 序列化形式是字节数 1 / 2 / 4，其它取值在解析配置时即被拒绝。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PrefixWidth {
    U8,
    U16,
    U32,
}

impl PrefixWidth {
    pub fn bytes(self) -> usize {
        match self {
            PrefixWidth::U8 => 1,
            PrefixWidth::U16 => 2,
            PrefixWidth::U32 => 4,
        }
    }

    /// 该前缀宽度能表示的最大载荷长度
    pub fn max_payload(self) -> u32 {
        match self {
            PrefixWidth::U8 => u8::MAX as u32,
            PrefixWidth::U16 => u16::MAX as u32,
            PrefixWidth::U32 => u32::MAX,
        }
    }
}

impl Default for PrefixWidth {
    fn default() -> Self {
        PrefixWidth::U16
    }
}

impl TryFrom<u8> for PrefixWidth {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PrefixWidth::U8),
            2 => Ok(PrefixWidth::U16),
            4 => Ok(PrefixWidth::U32),
            n => Err(format!("invalid length prefix width: {}", n)),
        }
    }
}

impl From<PrefixWidth> for u8 {
    fn from(width: PrefixWidth) -> Self {
        width.bytes() as u8
    }
}

/// 分帧编解码器
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    len_msg_len: PrefixWidth,
    little_endian: bool,
    max_msg_len: u32,
}

impl FrameCodec {
    /// 创建编解码器，`max_msg_len` 超出前缀可表示范围时会被收紧
    pub fn new(len_msg_len: PrefixWidth, little_endian: bool, max_msg_len: u32) -> Self {
        let mut max_msg_len = max_msg_len;
        let cap = len_msg_len.max_payload();
        if max_msg_len > cap {
            tracing::warn!("invalid max_msg_len, reset to {}", cap);
            max_msg_len = cap;
        }
        FrameCodec {
            len_msg_len,
            little_endian,
            max_msg_len,
        }
    }

    pub fn max_msg_len(&self) -> u32 {
        self.max_msg_len
    }

    /// 尝试从读缓冲中解出一个完整帧
    ///
    /// - `Ok(Some(frame))` 解出一帧（缓冲区已前移）
    /// - `Ok(None)` 数据还不够一帧
    /// - `Err(_)` 协议违例（空帧或超长帧）
    pub fn try_decode(&self, buf: &mut BytesMut) -> Result<Option<Bytes>, NetError> {
        let width = self.len_msg_len.bytes();
        if buf.len() < width {
            return Ok(None);
        }

        let len = match self.len_msg_len {
            PrefixWidth::U8 => buf[0] as u32,
            PrefixWidth::U16 => {
                let b = [buf[0], buf[1]];
                if self.little_endian {
                    u16::from_le_bytes(b) as u32
                } else {
                    u16::from_be_bytes(b) as u32
                }
            }
            PrefixWidth::U32 => {
                let b = [buf[0], buf[1], buf[2], buf[3]];
                if self.little_endian {
                    u32::from_le_bytes(b)
                } else {
                    u32::from_be_bytes(b)
                }
            }
        };

        if len < 1 {
            return Err(NetError::MsgTooShort);
        }
        if len > self.max_msg_len {
            return Err(NetError::MsgTooLong {
                len,
                max: self.max_msg_len,
            });
        }

        let total = width + len as usize;
        if buf.len() < total {
            return Ok(None);
        }

        buf.advance(width);
        Ok(Some(buf.split_to(len as usize).freeze()))
    }

    /// 编码一帧：长度前缀 + 载荷
    pub fn encode(&self, payload: &[u8]) -> Result<BytesMut, NetError> {
        let len = payload.len() as u32;
        if len > self.max_msg_len {
            return Err(NetError::MsgTooLong {
                len,
                max: self.max_msg_len,
            });
        }
        if len < 1 {
            return Err(NetError::MsgTooShort);
        }

        let width = self.len_msg_len.bytes();
        let mut msg = BytesMut::with_capacity(width + payload.len());
        match self.len_msg_len {
            PrefixWidth::U8 => msg.extend_from_slice(&[len as u8]),
            PrefixWidth::U16 => {
                let b = if self.little_endian {
                    (len as u16).to_le_bytes()
                } else {
                    (len as u16).to_be_bytes()
                };
                msg.extend_from_slice(&b);
            }
            PrefixWidth::U32 => {
                let b = if self.little_endian {
                    len.to_le_bytes()
                } else {
                    len.to_be_bytes()
                };
                msg.extend_from_slice(&b);
            }
        }
        msg.extend_from_slice(payload);
        Ok(msg)
    }
}
