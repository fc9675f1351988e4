//! Wire format for the agent/controller protocol (spec §3.1, §6.2).
//!
//! Every variant is encoded at fixed byte offsets by hand with
//! `to_ne_bytes`/`from_ne_bytes` rather than through a generic
//! serialization crate, so the layout is guaranteed bit-identical to a
//! naively packed, naturally-aligned C struct of the same shape.

use crate::error::ProtocolError;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ARGS: usize = 32;
pub const MAX_ARG_LEN: usize = 256;
pub const MAX_ERROR_LEN: usize = 512;
pub const MAX_PROCESS_LIST_ENTRIES: usize = 64;

pub const HEADER_LEN: usize = 8;

const PROCESS_ENTRY_LEN: usize = 4 + 4 + MAX_NAME_LEN; // host_pid, container_pid, name
const START_PROCESS_LEN: usize = MAX_NAME_LEN + MAX_ARGS * MAX_ARG_LEN + 4;
const PROCESS_STARTED_LEN: usize = 4 + 4;
const PROCESS_ERROR_LEN: usize = MAX_ERROR_LEN;
const ACK_LEN: usize = 4;
const PROCESS_LIST_LEN: usize = 4 + MAX_PROCESS_LIST_ENTRIES * PROCESS_ENTRY_LEN;
const STOP_PROCESS_LEN: usize = 4;
const PROCESS_STOPPED_LEN: usize = 4;
// pid_t(i32) followed by two u64s: natural alignment inserts 4 bytes of
// padding after `pid` so `memory_limit` lands on an 8-byte boundary, the
// same as a C compiler would lay out `struct { int32_t pid; uint64_t
// memory_limit; uint64_t cpu_limit; }`.
const APPLY_CONSTRAINTS_PAD: usize = 4;
const APPLY_CONSTRAINTS_LEN: usize = 4 + APPLY_CONSTRAINTS_PAD + 8 + 8;
const CONSTRAINTS_APPLIED_LEN: usize = 4;

/// Largest payload across all variants (`ProcessList`); used as the
/// envelope bound the codec validates `header.length` against (§4.1).
pub const MAX_PAYLOAD_LEN: u32 = PROCESS_LIST_LEN as u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessListEntry {
    pub host_pid: i32,
    pub container_pid: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    StartProcess {
        name: String,
        args: Vec<String>,
    },
    ProcessStarted {
        host_pid: i32,
        container_pid: i32,
    },
    ProcessError {
        message: String,
    },
    Ack {
        request_id: u32,
    },
    ListProcesses,
    ProcessList {
        entries: Vec<ProcessListEntry>,
    },
    StopProcess {
        pid: i32,
    },
    ProcessStopped {
        pid: i32,
    },
    ApplyConstraints {
        pid: i32,
        memory_limit: u64,
        cpu_limit: u64,
    },
    ConstraintsApplied {
        pid: i32,
    },
    Ping,
    Pong,
}

impl Message {
    pub fn type_code(&self) -> u32 {
        match self {
            Message::StartProcess { .. } => 1,
            Message::ProcessStarted { .. } => 2,
            Message::ProcessError { .. } => 3,
            Message::Ack { .. } => 4,
            Message::ListProcesses => 5,
            Message::ProcessList { .. } => 6,
            Message::StopProcess { .. } => 7,
            Message::ProcessStopped { .. } => 8,
            Message::ApplyConstraints { .. } => 9,
            Message::ConstraintsApplied { .. } => 10,
            Message::Ping => 11,
            Message::Pong => 12,
        }
    }

    /// Serialize the payload (header is written separately by the codec).
    pub fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::new();
        match self {
            Message::StartProcess { name, args } => {
                buf.reserve(START_PROCESS_LEN);
                write_fixed_str(&mut buf, name, MAX_NAME_LEN, "name")?;
                if args.len() > MAX_ARGS {
                    return Err(ProtocolError::FieldTooLong("args"));
                }
                for i in 0..MAX_ARGS {
                    match args.get(i) {
                        Some(a) => write_fixed_str(&mut buf, a, MAX_ARG_LEN, "args[i]")?,
                        None => buf.extend(std::iter::repeat(0u8).take(MAX_ARG_LEN)),
                    }
                }
                buf.extend_from_slice(&(args.len() as i32).to_ne_bytes());
            }
            Message::ProcessStarted {
                host_pid,
                container_pid,
            } => {
                buf.extend_from_slice(&host_pid.to_ne_bytes());
                buf.extend_from_slice(&container_pid.to_ne_bytes());
            }
            Message::ProcessError { message } => {
                write_fixed_str(&mut buf, message, MAX_ERROR_LEN, "error")?;
            }
            Message::Ack { request_id } => {
                buf.extend_from_slice(&request_id.to_ne_bytes());
            }
            Message::ListProcesses => {}
            Message::ProcessList { entries } => {
                if entries.len() > MAX_PROCESS_LIST_ENTRIES {
                    return Err(ProtocolError::FieldTooLong("entries"));
                }
                buf.extend_from_slice(&(entries.len() as i32).to_ne_bytes());
                for i in 0..MAX_PROCESS_LIST_ENTRIES {
                    match entries.get(i) {
                        Some(e) => {
                            buf.extend_from_slice(&e.host_pid.to_ne_bytes());
                            buf.extend_from_slice(&e.container_pid.to_ne_bytes());
                            write_fixed_str(&mut buf, &e.name, MAX_NAME_LEN, "entries[i].name")?;
                        }
                        None => buf.extend(std::iter::repeat(0u8).take(PROCESS_ENTRY_LEN)),
                    }
                }
            }
            Message::StopProcess { pid } => buf.extend_from_slice(&pid.to_ne_bytes()),
            Message::ProcessStopped { pid } => buf.extend_from_slice(&pid.to_ne_bytes()),
            Message::ApplyConstraints {
                pid,
                memory_limit,
                cpu_limit,
            } => {
                buf.extend_from_slice(&pid.to_ne_bytes());
                buf.extend(std::iter::repeat(0u8).take(APPLY_CONSTRAINTS_PAD));
                buf.extend_from_slice(&memory_limit.to_ne_bytes());
                buf.extend_from_slice(&cpu_limit.to_ne_bytes());
            }
            Message::ConstraintsApplied { pid } => buf.extend_from_slice(&pid.to_ne_bytes()),
            Message::Ping => {}
            Message::Pong => {}
        }
        Ok(buf)
    }

    /// Deserialize a payload given the header's `type` code.
    pub fn decode(type_code: u32, payload: &[u8]) -> Result<Message, ProtocolError> {
        match type_code {
            1 => {
                expect_len(payload, START_PROCESS_LEN)?;
                let name = read_fixed_str(&payload[0..MAX_NAME_LEN]);
                let mut args = Vec::new();
                let args_start = MAX_NAME_LEN;
                let arg_count = read_i32(&payload[args_start + MAX_ARGS * MAX_ARG_LEN..])
                    .clamp(0, MAX_ARGS as i32) as usize;
                for i in 0..arg_count {
                    let off = args_start + i * MAX_ARG_LEN;
                    args.push(read_fixed_str(&payload[off..off + MAX_ARG_LEN]));
                }
                Ok(Message::StartProcess { name, args })
            }
            2 => {
                expect_len(payload, PROCESS_STARTED_LEN)?;
                Ok(Message::ProcessStarted {
                    host_pid: read_i32(&payload[0..4]),
                    container_pid: read_i32(&payload[4..8]),
                })
            }
            3 => {
                expect_len(payload, PROCESS_ERROR_LEN)?;
                Ok(Message::ProcessError {
                    message: read_fixed_str(payload),
                })
            }
            4 => {
                expect_len(payload, ACK_LEN)?;
                Ok(Message::Ack {
                    request_id: read_u32(&payload[0..4]),
                })
            }
            5 => Ok(Message::ListProcesses),
            6 => {
                expect_len(payload, PROCESS_LIST_LEN)?;
                let count = read_i32(&payload[0..4]).clamp(0, MAX_PROCESS_LIST_ENTRIES as i32) as usize;
                let mut entries = Vec::with_capacity(count);
                for i in 0..count {
                    let off = 4 + i * PROCESS_ENTRY_LEN;
                    let host_pid = read_i32(&payload[off..off + 4]);
                    let container_pid = read_i32(&payload[off + 4..off + 8]);
                    let name = read_fixed_str(&payload[off + 8..off + PROCESS_ENTRY_LEN]);
                    entries.push(ProcessListEntry {
                        host_pid,
                        container_pid,
                        name,
                    });
                }
                Ok(Message::ProcessList { entries })
            }
            7 => {
                expect_len(payload, STOP_PROCESS_LEN)?;
                Ok(Message::StopProcess {
                    pid: read_i32(&payload[0..4]),
                })
            }
            8 => {
                expect_len(payload, PROCESS_STOPPED_LEN)?;
                Ok(Message::ProcessStopped {
                    pid: read_i32(&payload[0..4]),
                })
            }
            9 => {
                expect_len(payload, APPLY_CONSTRAINTS_LEN)?;
                let pid = read_i32(&payload[0..4]);
                let mem_off = 4 + APPLY_CONSTRAINTS_PAD;
                Ok(Message::ApplyConstraints {
                    pid,
                    memory_limit: read_u64(&payload[mem_off..mem_off + 8]),
                    cpu_limit: read_u64(&payload[mem_off + 8..mem_off + 16]),
                })
            }
            10 => {
                expect_len(payload, CONSTRAINTS_APPLIED_LEN)?;
                Ok(Message::ConstraintsApplied {
                    pid: read_i32(&payload[0..4]),
                })
            }
            11 => Ok(Message::Ping),
            12 => Ok(Message::Pong),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

fn expect_len(payload: &[u8], want: usize) -> Result<(), ProtocolError> {
    if payload.len() != want {
        // A short/long payload for a known type is as much a protocol
        // violation as an unknown type code.
        return Err(ProtocolError::FrameTooLarge(payload.len() as u32));
    }
    Ok(())
}

fn read_i32(b: &[u8]) -> i32 {
    i32::from_ne_bytes(b.try_into().unwrap())
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_ne_bytes(b.try_into().unwrap())
}

fn read_u64(b: &[u8]) -> u64 {
    u64::from_ne_bytes(b.try_into().unwrap())
}

fn write_fixed_str(
    buf: &mut Vec<u8>,
    s: &str,
    width: usize,
    field: &'static str,
) -> Result<(), ProtocolError> {
    let bytes = s.as_bytes();
    // reserve room for the NUL terminator the field is documented to carry
    if bytes.len() >= width {
        return Err(ProtocolError::FieldTooLong(field));
    }
    buf.extend_from_slice(bytes);
    buf.extend(std::iter::repeat(0u8).take(width - bytes.len()));
    Ok(())
}

fn read_fixed_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let payload = msg.encode_payload().unwrap();
        let decoded = Message::decode(msg.type_code(), &payload).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn roundtrip_ping_pong() {
        roundtrip(Message::Ping);
        roundtrip(Message::Pong);
        roundtrip(Message::ListProcesses);
    }

    #[test]
    fn roundtrip_start_process() {
        roundtrip(Message::StartProcess {
            name: "/bin/sleep".to_string(),
            args: vec!["2".to_string()],
        });
        roundtrip(Message::StartProcess {
            name: "/bin/true".to_string(),
            args: vec![],
        });
    }

    #[test]
    fn roundtrip_process_started_and_error() {
        roundtrip(Message::ProcessStarted {
            host_pid: 1234,
            container_pid: 1,
        });
        roundtrip(Message::ProcessError {
            message: "fork failed: Resource temporarily unavailable".to_string(),
        });
    }

    #[test]
    fn roundtrip_process_list() {
        roundtrip(Message::ProcessList {
            entries: vec![
                ProcessListEntry {
                    host_pid: 10,
                    container_pid: 10,
                    name: "/bin/sleep".to_string(),
                },
                ProcessListEntry {
                    host_pid: 11,
                    container_pid: 1,
                    name: "/bin/cat".to_string(),
                },
            ],
        });
        roundtrip(Message::ProcessList { entries: vec![] });
    }

    #[test]
    fn roundtrip_stop_and_constraints() {
        roundtrip(Message::StopProcess { pid: 42 });
        roundtrip(Message::ProcessStopped { pid: 42 });
        roundtrip(Message::ApplyConstraints {
            pid: 42,
            memory_limit: 64 * 1024 * 1024,
            cpu_limit: 50,
        });
        roundtrip(Message::ConstraintsApplied { pid: 42 });
        roundtrip(Message::Ack { request_id: 7 });
    }

    #[test]
    fn name_too_long_is_rejected() {
        let long_name = "x".repeat(MAX_NAME_LEN);
        let msg = Message::StartProcess {
            name: long_name,
            args: vec![],
        };
        assert!(matches!(
            msg.encode_payload(),
            Err(ProtocolError::FieldTooLong("name"))
        ));
    }

    #[test]
    fn too_many_args_is_rejected() {
        let msg = Message::StartProcess {
            name: "/bin/true".to_string(),
            args: (0..MAX_ARGS + 1).map(|i| i.to_string()).collect(),
        };
        assert!(matches!(
            msg.encode_payload(),
            Err(ProtocolError::FieldTooLong("args"))
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(matches!(
            Message::decode(99, &[]),
            Err(ProtocolError::UnknownType(99))
        ));
    }

    #[test]
    fn apply_constraints_layout_matches_padded_c_struct() {
        let payload = Message::ApplyConstraints {
            pid: 7,
            memory_limit: 0x1122334455667788,
            cpu_limit: 50,
        }
        .encode_payload()
        .unwrap();
        assert_eq!(payload.len(), APPLY_CONSTRAINTS_LEN);
        // bytes [4..8) are alignment padding, not part of any field
        assert_eq!(&payload[4..8], &[0, 0, 0, 0]);
        assert_eq!(&payload[8..16], &0x1122334455667788u64.to_ne_bytes());
    }
}
