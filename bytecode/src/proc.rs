use crate::decoder::DecodeError;
use crate::instruction::LexicalTarget;

/// Size in bytes of an encoded [`ProcHeader`].
pub const PROC_HEADER_SIZE: usize = 10;
/// Size in bytes of an encoded [`ProcLexical`].
pub const PROC_LEXICAL_SIZE: usize = 9;

/// Fixed header in front of every proc body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcHeader {
    /// Length of the body following the lexical table.
    pub body_size: u32,
    pub num_arguments: u16,
    pub num_locals: u16,
    pub num_lexicals: u16,
}

/// A slot captured from an ancestor activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcLexical {
    /// Call descriptor address of the activation the slot lives in.
    pub activation_call: u32,
    pub target_offset: u32,
    pub target: LexicalTarget,
}

/// A parsed proc: header, lexical table and body bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInfo {
    pub offset: usize,
    pub header: ProcHeader,
    pub lexicals: Vec<ProcLexical>,
    pub body_start: usize,
    pub body_end: usize,
}

impl ProcHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.body_size.to_le_bytes());
        out.extend_from_slice(&self.num_arguments.to_le_bytes());
        out.extend_from_slice(&self.num_locals.to_le_bytes());
        out.extend_from_slice(&self.num_lexicals.to_le_bytes());
    }
}

impl ProcLexical {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.activation_call.to_le_bytes());
        out.extend_from_slice(&self.target_offset.to_le_bytes());
        out.push(self.target as u8);
    }
}

/// Parse the proc that starts at `offset`.
pub fn parse_proc(bytes: &[u8], offset: usize) -> Result<ProcInfo, DecodeError> {
    let invalid = DecodeError::InvalidProc { offset };
    let header_bytes = bytes
        .get(offset..offset + PROC_HEADER_SIZE)
        .ok_or(invalid)?;
    let u16_at = |i: usize| u16::from_le_bytes([header_bytes[i], header_bytes[i + 1]]);
    let header = ProcHeader {
        body_size: u32::from_le_bytes([
            header_bytes[0],
            header_bytes[1],
            header_bytes[2],
            header_bytes[3],
        ]),
        num_arguments: u16_at(4),
        num_locals: u16_at(6),
        num_lexicals: u16_at(8),
    };

    let mut pos = offset + PROC_HEADER_SIZE;
    let mut lexicals = Vec::with_capacity(header.num_lexicals as usize);
    for _ in 0..header.num_lexicals {
        let entry = bytes.get(pos..pos + PROC_LEXICAL_SIZE).ok_or(invalid)?;
        let target = LexicalTarget::try_from(entry[8]).map_err(|_| invalid)?;
        lexicals.push(ProcLexical {
            activation_call: u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]),
            target_offset: u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]),
            target,
        });
        pos += PROC_LEXICAL_SIZE;
    }

    let body_end = pos + header.body_size as usize;
    if body_end > bytes.len() {
        return Err(invalid);
    }
    Ok(ProcInfo { offset, header, lexicals, body_start: pos, body_end })
}
