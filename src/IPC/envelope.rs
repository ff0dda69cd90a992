// Message envelope carried inside user buffers.
//
//   type:u8  reserved:u8 x3  payload
//
// Audio:   stream_id:u8 num_channels:u8 num_frames:u8 word_size:u8 data:i32[channels*frames]
// Routing: stream_id:u8 dest_core:u8 enable:u8 reserved:u8
// Cycles:  core:u8 reserved:u8 x3 cycles:u32
//
// All multi-byte fields little-endian.

use crate::error::{IpcError, Result};

pub const ENVELOPE_HEADER: usize = 4;
const AUDIO_HEADER: usize = 4;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Audio = 1,
    Routing = 2,
    Cycles = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlock {
    pub stream_id: u8,
    pub num_channels: u8,
    pub num_frames: u8,
    pub word_size: u8,
    /// Interleaved samples, `num_channels * num_frames` of them.
    pub data: Vec<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Routing {
    pub stream_id: u8,
    pub dest_core: u8,
    pub enable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cycles {
    pub core: u8,
    pub cycles: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Audio(AudioBlock),
    Routing(Routing),
    Cycles(Cycles),
}

fn malformed(what: impl Into<String>) -> IpcError {
    IpcError::Error(format!("malformed envelope: {}", what.into()))
}

impl Envelope {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Envelope::Audio(_) => MsgType::Audio,
            Envelope::Routing(_) => MsgType::Routing,
            Envelope::Cycles(_) => MsgType::Cycles,
        }
    }

    /// Bytes `encode_into` will write.
    pub fn encoded_len(&self) -> usize {
        ENVELOPE_HEADER
            + match self {
                Envelope::Audio(a) => AUDIO_HEADER + 4 * a.data.len(),
                Envelope::Routing(_) => 4,
                Envelope::Cycles(_) => 8,
            }
    }

    /// Write the envelope at the start of `out`, typically a buffer payload.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<usize> {
        let len = self.encoded_len();
        if out.len() < len {
            return Err(IpcError::Error(format!(
                "envelope needs {} bytes, buffer has {}",
                len,
                out.len()
            )));
        }

        out[0] = self.msg_type() as u8;
        out[1..ENVELOPE_HEADER].fill(0);
        let body = &mut out[ENVELOPE_HEADER..len];
        match self {
            Envelope::Audio(a) => {
                if a.data.len() != a.num_channels as usize * a.num_frames as usize {
                    return Err(malformed(format!(
                        "{} samples for {} channels x {} frames",
                        a.data.len(),
                        a.num_channels,
                        a.num_frames
                    )));
                }
                body[0] = a.stream_id;
                body[1] = a.num_channels;
                body[2] = a.num_frames;
                body[3] = a.word_size;
                for (chunk, sample) in body[AUDIO_HEADER..].chunks_exact_mut(4).zip(&a.data) {
                    chunk.copy_from_slice(&sample.to_le_bytes());
                }
            }
            Envelope::Routing(r) => {
                body.copy_from_slice(&[r.stream_id, r.dest_core, r.enable as u8, 0]);
            }
            Envelope::Cycles(c) => {
                body[0] = c.core;
                body[1..4].fill(0);
                body[4..8].copy_from_slice(&c.cycles.to_le_bytes());
            }
        }
        Ok(len)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.encoded_len()];
        self.encode_into(&mut out)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENVELOPE_HEADER {
            return Err(malformed("shorter than the envelope header"));
        }
        let body = &bytes[ENVELOPE_HEADER..];
        match bytes[0] {
            t if t == MsgType::Audio as u8 => {
                if body.len() < AUDIO_HEADER {
                    return Err(malformed("audio header truncated"));
                }
                let (num_channels, num_frames) = (body[1], body[2]);
                let samples = num_channels as usize * num_frames as usize;
                let data = &body[AUDIO_HEADER..];
                if data.len() < samples * 4 {
                    return Err(malformed(format!(
                        "{} channels x {} frames but only {} data bytes",
                        num_channels,
                        num_frames,
                        data.len()
                    )));
                }
                let data = data[..samples * 4]
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                Ok(Envelope::Audio(AudioBlock {
                    stream_id: body[0],
                    num_channels,
                    num_frames,
                    word_size: body[3],
                    data,
                }))
            }
            t if t == MsgType::Routing as u8 => {
                if body.len() < 4 {
                    return Err(malformed("routing payload truncated"));
                }
                Ok(Envelope::Routing(Routing {
                    stream_id: body[0],
                    dest_core: body[1],
                    enable: body[2] != 0,
                }))
            }
            t if t == MsgType::Cycles as u8 => {
                if body.len() < 8 {
                    return Err(malformed("cycles payload truncated"));
                }
                Ok(Envelope::Cycles(Cycles {
                    core: body[0],
                    cycles: u32::from_le_bytes([body[4], body[5], body[6], body[7]]),
                }))
            }
            other => Err(malformed(format!("unknown type {}", other))),
        }
    }
}
