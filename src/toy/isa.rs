//! The toy decoder/encoder.

use crate::{
    arch::{AppPc, ControlKind, DecodedInstr, FaultKind, InstrDecoder, InstrEncoder, Reg},
    Error, Result,
};

// Application opcodes.
pub(crate) const OP_MOV_IMM: u8 = 0x01;
pub(crate) const OP_MOV_REG: u8 = 0x02;
pub(crate) const OP_ADD: u8 = 0x03;
pub(crate) const OP_ADD_IMM: u8 = 0x04;
pub(crate) const OP_LOAD: u8 = 0x05;
pub(crate) const OP_STORE: u8 = 0x06;
pub(crate) const OP_PUSH: u8 = 0x07;
pub(crate) const OP_POP: u8 = 0x08;
pub(crate) const OP_RD_SP: u8 = 0x09;
pub(crate) const OP_WR_SP: u8 = 0x0a;
pub(crate) const OP_SUB_IMM: u8 = 0x0b;
pub(crate) const OP_JMP: u8 = 0x10;
pub(crate) const OP_JNZ: u8 = 0x11;
pub(crate) const OP_CALL: u8 = 0x12;
pub(crate) const OP_JMP_IND: u8 = 0x13;
pub(crate) const OP_CALL_IND: u8 = 0x14;
pub(crate) const OP_RET: u8 = 0x15;
pub(crate) const OP_SYSCALL: u8 = 0x16;
pub(crate) const OP_INT: u8 = 0x17;

// Mangling opcodes: cache-only, never valid application code.
pub(crate) const OP_EXIT: u8 = 0xe0;
pub(crate) const OP_COND_EXIT: u8 = 0xe1;
pub(crate) const OP_PUSH_RET: u8 = 0xe2;
pub(crate) const OP_POP_RET: u8 = 0xe3;
pub(crate) const OP_IBL_PROBE: u8 = 0xe4;
pub(crate) const OP_SYSCALL_EXIT: u8 = 0xe5;
pub(crate) const OP_FAULT: u8 = 0xe6;
pub(crate) const OP_COND_EXIT_INV: u8 = 0xe7;

/// The toy machine-code backend.
#[derive(Clone, Copy, Debug, Default)]
pub struct ToyIsa;

impl ToyIsa {
    fn instr_len(op: u8) -> Option<usize> {
        Some(match op {
            OP_RET | OP_SYSCALL => 1,
            OP_PUSH | OP_POP | OP_RD_SP | OP_WR_SP | OP_JMP_IND | OP_CALL_IND | OP_INT => 2,
            OP_MOV_REG | OP_ADD => 3,
            OP_MOV_IMM | OP_ADD_IMM | OP_SUB_IMM => 6,
            OP_JMP | OP_CALL => 9,
            OP_JNZ | OP_LOAD | OP_STORE => 10,
            _ => return None,
        })
    }
}

impl InstrDecoder for ToyIsa {
    fn decode(&self, bytes: &[u8], pc: AppPc) -> Result<DecodedInstr> {
        let op = *bytes.first().ok_or(Error::AppDecodeFault(pc))?;
        let len = ToyIsa::instr_len(op).ok_or(Error::AppDecodeFault(pc))?;
        if bytes.len() < len {
            return Err(Error::AppDecodeFault(pc));
        }
        let bytes = bytes[..len].to_vec();

        let flow = match op {
            OP_JMP => ControlKind::DirectJump {
                target: AppPc(u64_at(&bytes, 1)),
            },
            OP_JNZ => ControlKind::CondJump {
                taken: AppPc(u64_at(&bytes, 2)),
                fall: pc.advance(len as u64),
            },
            OP_CALL => ControlKind::DirectCall {
                target: AppPc(u64_at(&bytes, 1)),
                ret: pc.advance(len as u64),
            },
            OP_JMP_IND => ControlKind::IndirectJump { reg: Reg(bytes[1]) },
            OP_CALL_IND => ControlKind::IndirectCall {
                reg: Reg(bytes[1]),
                ret: pc.advance(len as u64),
            },
            OP_RET => ControlKind::Return,
            OP_SYSCALL => ControlKind::Syscall,
            OP_INT => ControlKind::Interrupt { vector: bytes[1] },
            _ => ControlKind::None,
        };

        Ok(DecodedInstr {
            bytes,
            pc,
            flow,
            // All toy addressing is absolute.
            pc_relative: false,
        })
    }

    fn max_instr_len(&self) -> usize {
        10
    }
}

impl InstrEncoder for ToyIsa {
    fn encode_app_instr(&self, instr: &DecodedInstr, out: &mut Vec<u8>) -> Result<()> {
        // Nothing is PC-relative, so the copy is the re-encoding.
        out.extend_from_slice(&instr.bytes);
        Ok(())
    }

    fn encode_exit(&self, slot: u32, out: &mut Vec<u8>) {
        out.push(OP_EXIT);
        out.extend_from_slice(&slot.to_le_bytes());
    }

    fn encode_cond_exit(&self, instr: &DecodedInstr, slot: u32, out: &mut Vec<u8>) -> Result<()> {
        if instr.bytes.first() != Some(&OP_JNZ) {
            return Err(corrupt_error!(
                "conditional exit requested for non-branch at {}",
                instr.pc
            ));
        }
        out.push(OP_COND_EXIT);
        out.push(instr.bytes[1]);
        out.extend_from_slice(&slot.to_le_bytes());
        Ok(())
    }

    fn encode_cond_exit_inverted(
        &self,
        instr: &DecodedInstr,
        slot: u32,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        if instr.bytes.first() != Some(&OP_JNZ) {
            return Err(corrupt_error!(
                "inverted conditional exit requested for non-branch at {}",
                instr.pc
            ));
        }
        out.push(OP_COND_EXIT_INV);
        out.push(instr.bytes[1]);
        out.extend_from_slice(&slot.to_le_bytes());
        Ok(())
    }

    fn encode_push_retaddr(&self, ret: AppPc, out: &mut Vec<u8>) {
        out.push(OP_PUSH_RET);
        out.extend_from_slice(&ret.0.to_le_bytes());
    }

    fn encode_pop_retaddr(&self, reg: Reg, out: &mut Vec<u8>) {
        out.push(OP_POP_RET);
        out.push(reg.0);
    }

    fn encode_ibl_probe(&self, reg: Reg, out: &mut Vec<u8>) {
        out.push(OP_IBL_PROBE);
        out.push(reg.0);
    }

    fn encode_syscall_exit(&self, slot: u32, out: &mut Vec<u8>) {
        out.push(OP_SYSCALL_EXIT);
        out.extend_from_slice(&slot.to_le_bytes());
    }

    fn encode_fault(&self, fault: FaultKind, pc: AppPc, out: &mut Vec<u8>) {
        out.push(OP_FAULT);
        let (kind, addr) = match fault {
            FaultKind::InvalidOpcode => (0u8, 0u64),
            FaultKind::ReadFault(a) => (1, a),
            FaultKind::WriteFault(a) => (2, a),
            FaultKind::ExecFault(a) => (3, a),
        };
        out.push(kind);
        out.extend_from_slice(&pc.0.to_le_bytes());
        out.extend_from_slice(&addr.to_le_bytes());
    }
}

pub(crate) fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

pub(crate) fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_straight_line() {
        let isa = ToyIsa;
        let mut bytes = vec![OP_MOV_IMM, 3];
        bytes.extend_from_slice(&42u32.to_le_bytes());
        let instr = isa.decode(&bytes, AppPc(0x100)).unwrap();
        assert_eq!(instr.len(), 6);
        assert_eq!(instr.flow, ControlKind::None);
        assert_eq!(instr.next_pc(), AppPc(0x106));
    }

    #[test]
    fn test_decode_control_transfers() {
        let isa = ToyIsa;

        let mut call = vec![OP_CALL];
        call.extend_from_slice(&0x2000u64.to_le_bytes());
        let instr = isa.decode(&call, AppPc(0x100)).unwrap();
        assert_eq!(
            instr.flow,
            ControlKind::DirectCall {
                target: AppPc(0x2000),
                ret: AppPc(0x109),
            }
        );

        let ret = isa.decode(&[OP_RET], AppPc(0x200)).unwrap();
        assert_eq!(ret.flow, ControlKind::Return);
    }

    #[test]
    fn test_bad_opcode_is_decode_fault() {
        let isa = ToyIsa;
        assert!(matches!(
            isa.decode(&[0xff], AppPc(0x100)),
            Err(Error::AppDecodeFault(AppPc(0x100)))
        ));
        // Mangling opcodes are not application code.
        assert!(isa.decode(&[OP_EXIT, 0, 0, 0, 0], AppPc(0x100)).is_err());
    }

    #[test]
    fn test_truncated_operand_is_decode_fault() {
        let isa = ToyIsa;
        let mut jmp = vec![OP_JMP];
        jmp.extend_from_slice(&[1, 2, 3]);
        assert!(isa.decode(&jmp, AppPc(0x100)).is_err());
    }
}
