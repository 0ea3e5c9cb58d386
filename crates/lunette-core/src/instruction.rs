//! Instruction word codec.
//!
//! A 32-bit instruction is partitioned as:
//!
//! ```text
//!  31       23       14      6     0
//!   +--------+--------+-------+-----+
//!   | B:9    | C:9    | A:8   | op:6|
//!   +--------+--------+-------+-----+
//!   |     Bx:18       | A:8   | op:6|
//!   +--------+--------+-------+-----+
//!   |     sBx = Bx - 131071         |
//!   +--------+--------+-------+-----+
//!   |     Ax:26               | op:6|
//!   +--------+--------+-------+-----+
//! ```
//!
//! An RK operand addresses register `m` when `m < 256` and constant
//! `m & 0xFF` otherwise.

use std::fmt;

pub const MAXARG_BX: u32 = (1 << 18) - 1; // 262143
pub const MAXARG_SBX: i32 = (MAXARG_BX >> 1) as i32; // 131071
pub const MAXARG_A: u32 = (1 << 8) - 1;
pub const MAXARG_B: u32 = (1 << 9) - 1;
pub const MAXARG_C: u32 = (1 << 9) - 1;

/// Bit that marks an RK operand as a constant reference.
pub const RK_CONST: u32 = 1 << 8;

/// Number of list items moved per SETLIST block.
pub const FIELDS_PER_FLUSH: i64 = 50;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    #[inline]
    pub fn opcode(self) -> OpCode {
        OpCode::from_u8((self.0 & 0x3F) as u8).expect("invalid opcode")
    }

    #[inline]
    pub fn abc(self) -> (u32, u32, u32) {
        let a = (self.0 >> 6) & 0xFF;
        let c = (self.0 >> 14) & 0x1FF;
        let b = (self.0 >> 23) & 0x1FF;
        (a, b, c)
    }

    #[inline]
    pub fn a(self) -> u32 {
        (self.0 >> 6) & 0xFF
    }

    #[inline]
    pub fn abx(self) -> (u32, u32) {
        ((self.0 >> 6) & 0xFF, self.0 >> 14)
    }

    #[inline]
    pub fn asbx(self) -> (u32, i32) {
        let (a, bx) = self.abx();
        (a, bx as i32 - MAXARG_SBX)
    }

    #[inline]
    pub fn ax(self) -> u32 {
        self.0 >> 6
    }

    // ---- Encoders (used by tests and by external code generators) ----

    pub fn iabc(op: OpCode, a: u32, b: u32, c: u32) -> Instruction {
        debug_assert!(a <= MAXARG_A && b <= MAXARG_B && c <= MAXARG_C);
        Instruction((b << 23) | (c << 14) | (a << 6) | op as u32)
    }

    pub fn iabx(op: OpCode, a: u32, bx: u32) -> Instruction {
        debug_assert!(a <= MAXARG_A && bx <= MAXARG_BX);
        Instruction((bx << 14) | (a << 6) | op as u32)
    }

    pub fn iasbx(op: OpCode, a: u32, sbx: i32) -> Instruction {
        debug_assert!((-MAXARG_SBX..=MAXARG_SBX).contains(&sbx));
        Self::iabx(op, a, (sbx + MAXARG_SBX) as u32)
    }

    pub fn iax(op: OpCode, ax: u32) -> Instruction {
        Instruction((ax << 6) | op as u32)
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = self.opcode().desc();
        match desc.mode {
            OpMode::IABC => {
                let (a, b, c) = self.abc();
                write!(f, "{} {a} {b} {c}", desc.name)
            }
            OpMode::IABx => {
                let (a, bx) = self.abx();
                write!(f, "{} {a} {bx}", desc.name)
            }
            OpMode::IAsBx => {
                let (a, sbx) = self.asbx();
                write!(f, "{} {a} {sbx}", desc.name)
            }
            OpMode::IAx => write!(f, "{} {}", desc.name, self.ax()),
        }
    }
}

/// The full opcode set, in encoding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,
    LoadK,
    LoadKx,
    LoadBool,
    LoadNil,
    GetUpval,
    GetTabUp,
    GetTable,
    SetTabUp,
    SetUpval,
    SetTable,
    NewTable,
    Self_,
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
    Not,
    Len,
    Concat,
    Jmp,
    Eq,
    Lt,
    Le,
    Test,
    TestSet,
    Call,
    TailCall,
    Return,
    ForLoop,
    ForPrep,
    TForCall,
    TForLoop,
    SetList,
    Closure,
    Vararg,
    ExtraArg,
}

impl OpCode {
    pub const COUNT: usize = 47;

    pub fn from_u8(v: u8) -> Option<OpCode> {
        if (v as usize) < Self::COUNT {
            // Safety: repr(u8), contiguous discriminants, range checked.
            Some(unsafe { std::mem::transmute::<u8, OpCode>(v) })
        } else {
            None
        }
    }

    pub fn desc(self) -> &'static OpDesc {
        &OPCODES[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.desc().name
    }
}

/// Operand addressing mode for the B and C fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpArg {
    /// Not used.
    N,
    /// Used as-is (an immediate count or flag).
    U,
    /// A register.
    R,
    /// A register or constant (RK).
    K,
}

/// Instruction word packing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpMode {
    IABC,
    IABx,
    IAsBx,
    IAx,
}

/// Static description of one opcode.
pub struct OpDesc {
    /// Comparison/test: the following instruction must be a jump.
    pub test: bool,
    /// Instruction writes register A.
    pub set_a: bool,
    pub b_mode: OpArg,
    pub c_mode: OpArg,
    pub mode: OpMode,
    pub name: &'static str,
}

const fn desc(
    test: bool,
    set_a: bool,
    b_mode: OpArg,
    c_mode: OpArg,
    mode: OpMode,
    name: &'static str,
) -> OpDesc {
    OpDesc {
        test,
        set_a,
        b_mode,
        c_mode,
        mode,
        name,
    }
}

use OpArg::{K, N, R, U};
use OpMode::{IABC, IABx, IAsBx, IAx};

/// One entry per opcode, in encoding order.
pub static OPCODES: [OpDesc; OpCode::COUNT] = [
    desc(false, true, R, N, IABC, "MOVE"),
    desc(false, true, K, N, IABx, "LOADK"),
    desc(false, true, N, N, IABx, "LOADKX"),
    desc(false, true, U, U, IABC, "LOADBOOL"),
    desc(false, true, U, N, IABC, "LOADNIL"),
    desc(false, true, U, N, IABC, "GETUPVAL"),
    desc(false, true, U, K, IABC, "GETTABUP"),
    desc(false, true, R, K, IABC, "GETTABLE"),
    desc(false, false, K, K, IABC, "SETTABUP"),
    desc(false, false, U, N, IABC, "SETUPVAL"),
    desc(false, false, K, K, IABC, "SETTABLE"),
    desc(false, true, U, U, IABC, "NEWTABLE"),
    desc(false, true, R, K, IABC, "SELF"),
    desc(false, true, K, K, IABC, "ADD"),
    desc(false, true, K, K, IABC, "SUB"),
    desc(false, true, K, K, IABC, "MUL"),
    desc(false, true, K, K, IABC, "MOD"),
    desc(false, true, K, K, IABC, "POW"),
    desc(false, true, K, K, IABC, "DIV"),
    desc(false, true, K, K, IABC, "IDIV"),
    desc(false, true, K, K, IABC, "BAND"),
    desc(false, true, K, K, IABC, "BOR"),
    desc(false, true, K, K, IABC, "BXOR"),
    desc(false, true, K, K, IABC, "SHL"),
    desc(false, true, K, K, IABC, "SHR"),
    desc(false, true, R, N, IABC, "UNM"),
    desc(false, true, R, N, IABC, "BNOT"),
    desc(false, true, R, N, IABC, "NOT"),
    desc(false, true, R, N, IABC, "LEN"),
    desc(false, true, R, R, IABC, "CONCAT"),
    desc(false, false, R, N, IAsBx, "JMP"),
    desc(true, false, K, K, IABC, "EQ"),
    desc(true, false, K, K, IABC, "LT"),
    desc(true, false, K, K, IABC, "LE"),
    desc(true, false, N, U, IABC, "TEST"),
    desc(true, true, R, U, IABC, "TESTSET"),
    desc(false, true, U, U, IABC, "CALL"),
    desc(false, true, U, U, IABC, "TAILCALL"),
    desc(false, false, U, N, IABC, "RETURN"),
    desc(false, true, R, N, IAsBx, "FORLOOP"),
    desc(false, true, R, N, IAsBx, "FORPREP"),
    desc(false, false, N, U, IABC, "TFORCALL"),
    desc(false, true, R, N, IAsBx, "TFORLOOP"),
    desc(false, false, U, U, IABC, "SETLIST"),
    desc(false, true, U, N, IABx, "CLOSURE"),
    desc(false, true, U, N, IABC, "VARARG"),
    desc(false, false, U, U, IAx, "EXTRAARG"),
];

/// Decode a "floating byte" size hint (3-bit mantissa, 5-bit exponent), as
/// used by NEWTABLE's B and C operands.
pub fn fb2int(x: u32) -> usize {
    if x < 8 {
        x as usize
    } else {
        (((x & 7) + 8) as usize) << ((x >> 3) - 1)
    }
}
