//! Parses a `.zplc` program package: header validation, CRC check, segment
//! table walk, and extraction of the task table and I/O map into runtime
//! structures the scheduler and memory map consume.

use crc::{Crc, CRC_32_ISO_HDLC};
use thiserror::Error;
use tracing::{debug, info};

const MAGIC: u32 = 0x434C_505A; // "ZPLC"
const HEADER_LEN: usize = 32;
const SEGMENT_ENTRY_LEN: usize = 8;
const TASK_ENTRY_LEN: usize = 16;
const IOMAP_ENTRY_LEN: usize = 8;

const RUNTIME_VERSION_MAJOR: u16 = 1;

/// `CRC_32_ISO_HDLC` is the standard IEEE 802.3 polynomial 0xEDB88320 with
/// init 0xFFFFFFFF and final XOR 0xFFFFFFFF, exactly as required here.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum LoadError {
    #[error("bad magic number")]
    BadMagic,
    #[error("unsupported version")]
    BadVersion,
    #[error("CRC32 mismatch")]
    BadCrc,
    #[error("file truncated")]
    Truncated,
    #[error("malformed segment table")]
    BadSegment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SegmentType {
    Code = 0x01,
    Data = 0x02,
    Bss = 0x03,
    Retain = 0x04,
    IoMap = 0x05,
    Symtab = 0x10,
    Debug = 0x11,
    Task = 0x20,
}

impl SegmentType {
    fn from_u16(v: u16) -> Result<Self, LoadError> {
        Ok(match v {
            0x01 => SegmentType::Code,
            0x02 => SegmentType::Data,
            0x03 => SegmentType::Bss,
            0x04 => SegmentType::Retain,
            0x05 => SegmentType::IoMap,
            0x10 => SegmentType::Symtab,
            0x11 => SegmentType::Debug,
            0x20 => SegmentType::Task,
            _ => return Err(LoadError::BadSegment),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Cyclic,
    Event,
    Init,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub id: u16,
    pub kind: TaskKind,
    pub priority: u8,
    pub interval_us: u32,
    pub entry_pc: u16,
    pub stack_depth: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoMapEntry {
    pub var_addr: u16,
    pub type_id: u8,
    pub direction: IoDirection,
    pub channel: u16,
    pub flags: u16,
}

/// Parsed program, ready for the scheduler and memory map to consume.
#[derive(Debug, PartialEq)]
pub struct Program {
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub retain: Option<Vec<u8>>,
    pub io_map: Vec<IoMapEntry>,
    pub tasks: Vec<TaskDescriptor>,
    pub entry_point: u16,
    pub raw: Vec<u8>,
}

pub const DEFAULT_CYCLIC_INTERVAL_US: u32 = 10_000;

/// Validates and parses a `.zplc` byte stream. Rejection is atomic: on any
/// `Err`, nothing about the caller's current program is touched.
pub fn parse(bytes: &[u8]) -> Result<Program, LoadError> {
    if bytes.len() < HEADER_LEN {
        return Err(LoadError::Truncated);
    }
    let magic = read_u32(bytes, 0);
    if magic != MAGIC {
        return Err(LoadError::BadMagic);
    }
    let version_major = read_u16(bytes, 4);
    if version_major != RUNTIME_VERSION_MAJOR {
        return Err(LoadError::BadVersion);
    }
    let stored_crc = read_u32(bytes, 8);
    let code_size = read_u32(bytes, 12) as usize;
    let data_size = read_u32(bytes, 16) as usize;
    let entry_point = read_u16(bytes, 20);
    let segment_count = read_u16(bytes, 22);

    let mut zeroed = bytes.to_vec();
    zeroed[8..12].copy_from_slice(&0u32.to_le_bytes());
    let computed_crc = CRC32.checksum(&zeroed);
    if computed_crc != stored_crc {
        return Err(LoadError::BadCrc);
    }

    let mut offset = HEADER_LEN;
    let mut segments = Vec::with_capacity(segment_count as usize);
    for _ in 0..segment_count {
        if offset + SEGMENT_ENTRY_LEN > bytes.len() {
            return Err(LoadError::Truncated);
        }
        let seg_type = SegmentType::from_u16(read_u16(bytes, offset))?;
        let _flags = read_u16(bytes, offset + 2);
        let size = read_u32(bytes, offset + 4) as usize;
        segments.push((seg_type, size));
        offset += SEGMENT_ENTRY_LEN;
    }

    let mut code = Vec::new();
    let mut data = Vec::new();
    let mut retain = None;
    let mut io_map = Vec::new();
    let mut tasks = Vec::new();

    for (seg_type, size) in segments {
        let payload = bytes.get(offset..offset + size).ok_or(LoadError::Truncated)?;
        match seg_type {
            SegmentType::Code => code = payload.to_vec(),
            SegmentType::Data => data = payload.to_vec(),
            SegmentType::Bss => {}
            SegmentType::Retain => retain = Some(payload.to_vec()),
            SegmentType::IoMap => io_map = parse_io_map(payload)?,
            SegmentType::Symtab | SegmentType::Debug => {
                debug!(?seg_type, size, "recognised opaque segment, not interpreted");
            }
            SegmentType::Task => tasks = parse_tasks(payload)?,
        }
        offset += size;
    }

    if code.len() != code_size {
        return Err(LoadError::BadSegment);
    }
    if data.len() != data_size {
        return Err(LoadError::BadSegment);
    }

    if tasks.is_empty() {
        tasks.push(TaskDescriptor {
            id: 0,
            kind: TaskKind::Cyclic,
            priority: 0,
            interval_us: DEFAULT_CYCLIC_INTERVAL_US,
            entry_pc: entry_point,
            stack_depth: 0,
        });
    }

    info!(code_size, data_size, tasks = tasks.len(), "program parsed");
    Ok(Program { code, data, retain, io_map, tasks, entry_point, raw: bytes.to_vec() })
}

fn parse_tasks(payload: &[u8]) -> Result<Vec<TaskDescriptor>, LoadError> {
    if payload.len() % TASK_ENTRY_LEN != 0 {
        return Err(LoadError::BadSegment);
    }
    payload
        .chunks_exact(TASK_ENTRY_LEN)
        .map(|chunk| {
            let kind = match chunk[2] {
                0 => TaskKind::Cyclic,
                1 => TaskKind::Event,
                2 => TaskKind::Init,
                _ => return Err(LoadError::BadSegment),
            };
            Ok(TaskDescriptor {
                id: u16::from_le_bytes([chunk[0], chunk[1]]),
                kind,
                priority: chunk[3],
                interval_us: u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
                entry_pc: u16::from_le_bytes([chunk[8], chunk[9]]),
                stack_depth: u16::from_le_bytes([chunk[10], chunk[11]]),
            })
        })
        .collect()
}

fn parse_io_map(payload: &[u8]) -> Result<Vec<IoMapEntry>, LoadError> {
    if payload.len() % IOMAP_ENTRY_LEN != 0 {
        return Err(LoadError::BadSegment);
    }
    payload
        .chunks_exact(IOMAP_ENTRY_LEN)
        .map(|chunk| {
            let direction = match chunk[3] {
                0 => IoDirection::In,
                1 => IoDirection::Out,
                _ => return Err(LoadError::BadSegment),
            };
            Ok(IoMapEntry {
                var_addr: u16::from_le_bytes([chunk[0], chunk[1]]),
                type_id: chunk[2],
                direction,
                channel: u16::from_le_bytes([chunk[4], chunk[5]]),
                flags: u16::from_le_bytes([chunk[6], chunk[7]]),
            })
        })
        .collect()
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_minimal(code: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&RUNTIME_VERSION_MAJOR.to_le_bytes());
        out[6..8].copy_from_slice(&0u16.to_le_bytes()); // version_minor
        out[12..16].copy_from_slice(&(code.len() as u32).to_le_bytes());
        out[16..20].copy_from_slice(&0u32.to_le_bytes()); // data_size
        out[20..22].copy_from_slice(&0u16.to_le_bytes()); // entry_point
        out[22..24].copy_from_slice(&1u16.to_le_bytes()); // segment_count

        // one CODE segment entry
        out.extend_from_slice(&(SegmentType::Code as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // flags
        out.extend_from_slice(&(code.len() as u32).to_le_bytes());
        out.extend_from_slice(code);

        let crc = CRC32.checksum(&out);
        out[8..12].copy_from_slice(&crc.to_le_bytes());
        out
    }

    #[test]
    fn accepts_well_formed_package() {
        let bytes = build_minimal(&[0x00, 0x01]);
        let program = parse(&bytes).unwrap();
        assert_eq!(program.code, vec![0x00, 0x01]);
        assert_eq!(program.tasks.len(), 1);
        assert_eq!(program.tasks[0].kind, TaskKind::Cyclic);
        assert_eq!(program.tasks[0].interval_us, DEFAULT_CYCLIC_INTERVAL_US);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = build_minimal(&[0x00]);
        bytes[0] = 0;
        assert_eq!(parse(&bytes), Err(LoadError::BadMagic));
    }

    #[test]
    fn rejects_flipped_byte_via_crc() {
        let mut bytes = build_minimal(&[0x00, 0x01, 0x02]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert_eq!(parse(&bytes), Err(LoadError::BadCrc));
    }

    #[test]
    fn rejects_truncated_file() {
        let bytes = build_minimal(&[0x00]);
        assert_eq!(parse(&bytes[..HEADER_LEN - 1]), Err(LoadError::Truncated));
    }

    #[test]
    fn unknown_segment_type_is_rejected() {
        let mut bytes = build_minimal(&[]);
        // corrupt the single segment's type field to an unassigned value.
        let seg_type_offset = HEADER_LEN;
        bytes[seg_type_offset] = 0xEE;
        bytes[seg_type_offset + 1] = 0xEE;
        let crc_zeroed = {
            let mut z = bytes.clone();
            z[8..12].fill(0);
            CRC32.checksum(&z)
        };
        bytes[8..12].copy_from_slice(&crc_zeroed.to_le_bytes());
        assert_eq!(parse(&bytes), Err(LoadError::BadSegment));
    }
}
