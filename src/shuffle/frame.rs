//! shuffle 传输线格式
//!
//! client -> server：begin 请求，固定 8 字节 = shuffle_id(i32 BE) + reduce_id(i32 BE)
//!
//! server -> client：帧序列，每帧 = length(i32 BE) + length 字节（一条编码后的 (K, V)）
//! - length == -1：批次停止标记，只表示“本批到此为止”，解码器停止扫描当前缓冲区，不是流结束
//! - length == -2：流结束，一次 begin 的响应到此完整结束

use std::io::{self, Write};

use crate::error::{EngineError, Result};

pub const BEGIN_REQUEST_LEN: usize = 8;
pub const FRAME_HEADER_LEN: usize = 4;
pub const BATCH_STOP: i32 = -1;
pub const END_OF_STREAM: i32 = -2;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct BeginRequest {
    pub shuffle_id: u32,
    pub reduce_id: u32,
}

impl BeginRequest {
    pub fn new(shuffle_id: u32, reduce_id: u32) -> Self {
        Self {
            shuffle_id,
            reduce_id,
        }
    }

    pub fn encode(&self) -> [u8; BEGIN_REQUEST_LEN] {
        let mut out = [0u8; BEGIN_REQUEST_LEN];
        out[0..4].copy_from_slice(&(self.shuffle_id as i32).to_be_bytes());
        out[4..8].copy_from_slice(&(self.reduce_id as i32).to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8; BEGIN_REQUEST_LEN]) -> Result<Self> {
        let shuffle_id = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let reduce_id = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if shuffle_id < 0 || reduce_id < 0 {
            return Err(EngineError::Decode(format!(
                "negative begin request ({shuffle_id}, {reduce_id})"
            )));
        }
        Ok(Self::new(shuffle_id as u32, reduce_id as u32))
    }
}

/// 写一条数据帧（length 前缀 + payload）
pub fn write_frame<W: Write>(out: &mut W, payload: &[u8]) -> io::Result<()> {
    let len: i32 = payload.len().try_into().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "frame larger than i32::MAX")
    })?;
    out.write_all(&len.to_be_bytes())?;
    out.write_all(payload)
}

pub fn write_marker<W: Write>(out: &mut W, marker: i32) -> io::Result<()> {
    out.write_all(&marker.to_be_bytes())
}

/// 解析一段已落盘的帧文件（只包含数据帧）
pub fn split_frames(bytes: &[u8]) -> Result<Vec<&[u8]>> {
    let mut out = Vec::new();
    let mut off = 0usize;
    while off < bytes.len() {
        let hdr = bytes
            .get(off..off + FRAME_HEADER_LEN)
            .ok_or_else(|| EngineError::Decode("truncated frame header".to_string()))?;
        let len = i32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        if len < 0 {
            return Err(EngineError::Decode(format!(
                "unexpected marker {len} in stored shuffle data"
            )));
        }
        off += FRAME_HEADER_LEN;
        let payload = bytes
            .get(off..off + len as usize)
            .ok_or_else(|| EngineError::Decode("truncated frame payload".to_string()))?;
        out.push(payload);
        off += len as usize;
    }
    Ok(out)
}

/// 一次解码扫描的结果
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DecodeOutcome {
    pub frames: Vec<Vec<u8>>,
    /// 在本次扫描中遇到了 -1 批次停止标记
    pub batch_stopped: bool,
    pub end_of_stream: bool,
}

/// 增量帧解码器：网络读到的字节不断 extend 进来，按帧切出
///
/// 不完整的帧留在缓冲区里等待后续数据，批次边界不会丢数据。
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// 从缓冲区切出完整帧，直到：数据不足 / 遇到 -1 / 遇到流结束
    pub fn decode(&mut self) -> Result<DecodeOutcome> {
        let mut outcome = DecodeOutcome::default();
        let mut off = 0usize;
        loop {
            let Some(hdr) = self.buf.get(off..off + FRAME_HEADER_LEN) else {
                break;
            };
            let len = i32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
            match len {
                BATCH_STOP => {
                    off += FRAME_HEADER_LEN;
                    outcome.batch_stopped = true;
                    break;
                }
                END_OF_STREAM => {
                    off += FRAME_HEADER_LEN;
                    outcome.end_of_stream = true;
                    break;
                }
                n if n < 0 => {
                    return Err(EngineError::Decode(format!("invalid frame length {n}")));
                }
                n => {
                    let start = off + FRAME_HEADER_LEN;
                    let end = start + n as usize;
                    if end > self.buf.len() {
                        break;
                    }
                    outcome.frames.push(self.buf[start..end].to_vec());
                    off = end;
                }
            }
        }
        self.buf.drain(..off);
        Ok(outcome)
    }
}
