use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic word opening every frame.
pub const WIRE_MAGIC: u32 = 0x8374_0267;

/// Protocol version; peers with a different value are refused.
pub const PRO_VERSION: u32 = 6;

/// Reserved block id flagging resync-initiated data: the peer must ack it
/// but never install it into its transfer log.
pub const ID_SYNCER: u64 = u64::MAX;

/// PeerParams `state` bit: node is Primary.
pub const STATE_PRIMARY: u32 = 1 << 0;
/// PeerParams `state` bit: node's backing data is consistent.
pub const STATE_CONSISTENT: u32 = 1 << 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u16)]
pub enum Command {
    Data = 0,
    DataRequest = 1,
    DataReply = 2,
    RecvAck = 3,
    WriteAck = 4,
    NegAck = 5,
    Barrier = 6,
    BarrierAck = 7,
    ReportParams = 8,
    CStateChanged = 9,
    Ping = 10,
    PingAck = 11,
    OutOfSync = 12,
}

impl Command {
    pub fn from_wire(raw: u16) -> Option<Command> {
        Some(match raw {
            0 => Command::Data,
            1 => Command::DataRequest,
            2 => Command::DataReply,
            3 => Command::RecvAck,
            4 => Command::WriteAck,
            5 => Command::NegAck,
            6 => Command::Barrier,
            7 => Command::BarrierAck,
            8 => Command::ReportParams,
            9 => Command::CStateChanged,
            10 => Command::Ping,
            11 => Command::PingAck,
            12 => Command::OutOfSync,
            _ => return None,
        })
    }

    /// Size of the command-typed header following the frame prefix. The
    /// frame's `length` field covers only the data payload after it.
    pub fn header_len(self) -> usize {
        match self {
            Command::Data | Command::DataReply => 16,
            Command::DataRequest => 20,
            Command::RecvAck | Command::WriteAck | Command::NegAck => 16,
            Command::Barrier => 4,
            Command::BarrierAck => 8,
            Command::ReportParams => 44,
            Command::CStateChanged => 4,
            Command::Ping | Command::PingAck => 0,
            Command::OutOfSync => 12,
        }
    }
}

/// Handshake parameter block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PeerParams {
    pub size: u64,
    pub blksize: u32,
    pub state: u32,
    pub protocol: u32,
    pub version: u32,
    pub gen_cnt: [u32; 5],
}

impl PeerParams {
    pub fn is_primary(&self) -> bool {
        self.state & STATE_PRIMARY != 0
    }

    pub fn is_consistent(&self) -> bool {
        self.state & STATE_CONSISTENT != 0
    }
}

/// One decoded frame. `block_nr` fields are expressed in 512-byte sectors.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Packet {
    Data {
        block_nr: u64,
        block_id: u64,
        data: Bytes,
    },
    DataRequest {
        block_nr: u64,
        block_id: u64,
        size: u32,
    },
    DataReply {
        block_nr: u64,
        block_id: u64,
        data: Bytes,
    },
    RecvAck {
        block_nr: u64,
        block_id: u64,
    },
    WriteAck {
        block_nr: u64,
        block_id: u64,
    },
    NegAck {
        block_nr: u64,
        block_id: u64,
    },
    Barrier {
        barrier_nr: u32,
    },
    BarrierAck {
        barrier_nr: u32,
        set_size: u32,
    },
    ReportParams(PeerParams),
    CStateChanged {
        cstate: u32,
    },
    Ping,
    PingAck,
    OutOfSync {
        block_nr: u64,
        size: u32,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("bad frame magic {0:#010x}")]
    BadMagic(u32),
    #[error("unknown command {0}")]
    UnknownCommand(u16),
    #[error("frame body truncated: need {need}, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("payload of {0} bytes exceeds the frame length field")]
    Oversized(usize),
}

impl Packet {
    pub fn command(&self) -> Command {
        match self {
            Packet::Data { .. } => Command::Data,
            Packet::DataRequest { .. } => Command::DataRequest,
            Packet::DataReply { .. } => Command::DataReply,
            Packet::RecvAck { .. } => Command::RecvAck,
            Packet::WriteAck { .. } => Command::WriteAck,
            Packet::NegAck { .. } => Command::NegAck,
            Packet::Barrier { .. } => Command::Barrier,
            Packet::BarrierAck { .. } => Command::BarrierAck,
            Packet::ReportParams(_) => Command::ReportParams,
            Packet::CStateChanged { .. } => Command::CStateChanged,
            Packet::Ping => Command::Ping,
            Packet::PingAck => Command::PingAck,
            Packet::OutOfSync { .. } => Command::OutOfSync,
        }
    }

    fn payload(&self) -> Option<&Bytes> {
        match self {
            Packet::Data { data, .. } | Packet::DataReply { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Encode the whole frame, network byte order throughout.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let payload_len = self.payload().map_or(0, |d| d.len());
        if payload_len > u16::MAX as usize {
            return Err(WireError::Oversized(payload_len));
        }
        let cmd = self.command();
        let mut buf = BytesMut::with_capacity(8 + cmd.header_len() + payload_len);
        buf.put_u32(WIRE_MAGIC);
        buf.put_u16(cmd as u16);
        buf.put_u16(payload_len as u16);

        match self {
            Packet::Data { block_nr, block_id, data }
            | Packet::DataReply { block_nr, block_id, data } => {
                buf.put_u64(*block_nr);
                buf.put_u64(*block_id);
                buf.put_slice(data);
            }
            Packet::DataRequest { block_nr, block_id, size } => {
                buf.put_u64(*block_nr);
                buf.put_u64(*block_id);
                buf.put_u32(*size);
            }
            Packet::RecvAck { block_nr, block_id }
            | Packet::WriteAck { block_nr, block_id }
            | Packet::NegAck { block_nr, block_id } => {
                buf.put_u64(*block_nr);
                buf.put_u64(*block_id);
            }
            Packet::Barrier { barrier_nr } => buf.put_u32(*barrier_nr),
            Packet::BarrierAck { barrier_nr, set_size } => {
                buf.put_u32(*barrier_nr);
                buf.put_u32(*set_size);
            }
            Packet::ReportParams(p) => {
                buf.put_u64(p.size);
                buf.put_u32(p.blksize);
                buf.put_u32(p.state);
                buf.put_u32(p.protocol);
                buf.put_u32(p.version);
                for word in p.gen_cnt {
                    buf.put_u32(word);
                }
            }
            Packet::CStateChanged { cstate } => buf.put_u32(*cstate),
            Packet::Ping | Packet::PingAck => {}
            Packet::OutOfSync { block_nr, size } => {
                buf.put_u64(*block_nr);
                buf.put_u32(*size);
            }
        }

        Ok(buf.freeze())
    }

    /// Decode a frame body (everything after the 8-byte prefix) for `cmd`.
    pub fn decode(cmd: Command, mut body: Bytes) -> Result<Packet, WireError> {
        let need = cmd.header_len();
        if body.len() < need {
            return Err(WireError::Truncated { need, have: body.len() });
        }

        Ok(match cmd {
            Command::Data => {
                let block_nr = body.get_u64();
                let block_id = body.get_u64();
                Packet::Data { block_nr, block_id, data: body }
            }
            Command::DataReply => {
                let block_nr = body.get_u64();
                let block_id = body.get_u64();
                Packet::DataReply { block_nr, block_id, data: body }
            }
            Command::DataRequest => Packet::DataRequest {
                block_nr: body.get_u64(),
                block_id: body.get_u64(),
                size: body.get_u32(),
            },
            Command::RecvAck => Packet::RecvAck {
                block_nr: body.get_u64(),
                block_id: body.get_u64(),
            },
            Command::WriteAck => Packet::WriteAck {
                block_nr: body.get_u64(),
                block_id: body.get_u64(),
            },
            Command::NegAck => Packet::NegAck {
                block_nr: body.get_u64(),
                block_id: body.get_u64(),
            },
            Command::Barrier => Packet::Barrier {
                barrier_nr: body.get_u32(),
            },
            Command::BarrierAck => Packet::BarrierAck {
                barrier_nr: body.get_u32(),
                set_size: body.get_u32(),
            },
            Command::ReportParams => {
                let size = body.get_u64();
                let blksize = body.get_u32();
                let state = body.get_u32();
                let protocol = body.get_u32();
                let version = body.get_u32();
                let mut gen_cnt = [0u32; 5];
                for word in gen_cnt.iter_mut() {
                    *word = body.get_u32();
                }
                Packet::ReportParams(PeerParams {
                    size,
                    blksize,
                    state,
                    protocol,
                    version,
                    gen_cnt,
                })
            }
            Command::CStateChanged => Packet::CStateChanged {
                cstate: body.get_u32(),
            },
            Command::Ping => Packet::Ping,
            Command::PingAck => Packet::PingAck,
            Command::OutOfSync => Packet::OutOfSync {
                block_nr: body.get_u64(),
                size: body.get_u32(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(pkt: Packet) {
        let frame = pkt.encode().unwrap();
        assert_eq!((&frame[..4]).get_u32(), WIRE_MAGIC);
        let cmd = Command::from_wire((&frame[4..6]).get_u16()).unwrap();
        let len = (&frame[6..8]).get_u16() as usize;
        assert_eq!(frame.len(), 8 + cmd.header_len() + len);
        let decoded = Packet::decode(cmd, frame.slice(8..)).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn header_fields_survive_the_wire() {
        roundtrip(Packet::Data {
            block_nr: 0,
            block_id: 0x1000,
            data: Bytes::from(vec![0xAB; 4096]),
        });
        roundtrip(Packet::DataRequest {
            block_nr: 8,
            block_id: 17,
            size: 4096,
        });
        roundtrip(Packet::DataReply {
            block_nr: 8,
            block_id: 17,
            data: Bytes::from_static(b"pay"),
        });
        roundtrip(Packet::WriteAck {
            block_nr: 0,
            block_id: ID_SYNCER,
        });
        roundtrip(Packet::RecvAck { block_nr: 1, block_id: 2 });
        roundtrip(Packet::NegAck { block_nr: 3, block_id: 4 });
        roundtrip(Packet::Barrier { barrier_nr: 1 });
        roundtrip(Packet::BarrierAck {
            barrier_nr: 1,
            set_size: 1,
        });
        roundtrip(Packet::ReportParams(PeerParams {
            size: 1 << 30,
            blksize: 4096,
            state: STATE_PRIMARY | STATE_CONSISTENT,
            protocol: 3,
            version: PRO_VERSION,
            gen_cnt: [3, 1, 2, 1, 1],
        }));
        roundtrip(Packet::CStateChanged { cstate: 4 });
        roundtrip(Packet::Ping);
        roundtrip(Packet::PingAck);
        roundtrip(Packet::OutOfSync {
            block_nr: 64,
            size: 4096,
        });
    }

    #[test]
    fn truncated_body_is_an_error() {
        let err = Packet::decode(Command::BarrierAck, Bytes::from_static(&[0, 0, 0, 1])).unwrap_err();
        assert!(matches!(err, WireError::Truncated { need: 8, have: 4 }));
    }

    #[test]
    fn oversized_payload_is_refused() {
        let err = Packet::Data {
            block_nr: 0,
            block_id: 0,
            data: Bytes::from(vec![0; 70_000]),
        }
        .encode()
        .unwrap_err();
        assert!(matches!(err, WireError::Oversized(70_000)));
    }
}
