// =============================================================================
// OPCODES - register-oriented instruction set
// =============================================================================
//
// Layout on the wire: `[EXT?][opcode][operands...]`. Register operands are one
// byte, or 16-bit big-endian when the instruction carries the `EXT` prefix.
// Every other operand has a fixed width.

/// Prefix byte that widens every register operand of the next instruction.
pub const EXT: u8 = 0xFF;

/// Operand shapes, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Register ID, 1 or 2 bytes.
    Reg,
    /// Constant-pool index, u16.
    Const,
    /// Function-table index, u16.
    Func,
    /// Signed 32-bit immediate.
    Imm32,
    /// 64-bit immediate (i64 or f64 bits).
    Imm64,
    /// Forward jump offset, u16, relative to the end of the instruction.
    Jump,
    /// Backward jump offset, u16, relative to the end of the instruction.
    Loop,
    Byte,
    /// u8 count followed by that many registers.
    Args,
    /// u8 count followed by `(is_local: u8, index: reg)` pairs.
    Captures,
}

macro_rules! opcodes {
    ($($name:ident = $byte:literal, $mnemonic:literal => [$($operand:ident),*];)*) => {
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum OpCode {
            $($name = $byte,)*
        }

        impl OpCode {
            pub fn from_byte(byte: u8) -> Option<OpCode> {
                match byte {
                    $($byte => Some(OpCode::$name),)*
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(OpCode::$name => $mnemonic,)*
                }
            }

            pub fn operands(self) -> &'static [Operand] {
                match self {
                    $(OpCode::$name => &[$(Operand::$operand),*],)*
                }
            }
        }
    };
}

opcodes! {
    // control
    Halt = 0x00, "HALT" => [];

    // loads and moves
    LoadConst = 0x01, "LOAD_CONST" => [Reg, Const];
    LoadNil = 0x02, "LOAD_NIL" => [Reg];
    LoadTrue = 0x03, "LOAD_TRUE" => [Reg];
    LoadFalse = 0x04, "LOAD_FALSE" => [Reg];
    LoadI32 = 0x05, "LOAD_I32" => [Reg, Imm32];
    LoadI64 = 0x06, "LOAD_I64" => [Reg, Imm64];
    LoadF64 = 0x07, "LOAD_F64" => [Reg, Imm64];
    Move = 0x08, "MOVE" => [Reg, Reg];

    // generic (boxed) arithmetic and logic
    Add = 0x10, "ADD" => [Reg, Reg, Reg];
    Sub = 0x11, "SUB" => [Reg, Reg, Reg];
    Mul = 0x12, "MUL" => [Reg, Reg, Reg];
    Div = 0x13, "DIV" => [Reg, Reg, Reg];
    Mod = 0x14, "MOD" => [Reg, Reg, Reg];
    Neg = 0x15, "NEG" => [Reg, Reg];
    Not = 0x16, "NOT" => [Reg, Reg];
    Eq = 0x18, "EQ" => [Reg, Reg, Reg];
    Ne = 0x19, "NE" => [Reg, Reg, Reg];
    Lt = 0x1A, "LT" => [Reg, Reg, Reg];
    Le = 0x1B, "LE" => [Reg, Reg, Reg];
    Gt = 0x1C, "GT" => [Reg, Reg, Reg];
    Ge = 0x1D, "GE" => [Reg, Reg, Reg];

    // typed arithmetic
    AddI32 = 0x20, "ADD_I32_TYPED" => [Reg, Reg, Reg];
    SubI32 = 0x21, "SUB_I32_TYPED" => [Reg, Reg, Reg];
    MulI32 = 0x22, "MUL_I32_TYPED" => [Reg, Reg, Reg];
    DivI32 = 0x23, "DIV_I32_TYPED" => [Reg, Reg, Reg];
    ModI32 = 0x24, "MOD_I32_TYPED" => [Reg, Reg, Reg];
    AddI64 = 0x28, "ADD_I64_TYPED" => [Reg, Reg, Reg];
    SubI64 = 0x29, "SUB_I64_TYPED" => [Reg, Reg, Reg];
    MulI64 = 0x2A, "MUL_I64_TYPED" => [Reg, Reg, Reg];
    DivI64 = 0x2B, "DIV_I64_TYPED" => [Reg, Reg, Reg];
    ModI64 = 0x2C, "MOD_I64_TYPED" => [Reg, Reg, Reg];
    AddU32 = 0x30, "ADD_U32_TYPED" => [Reg, Reg, Reg];
    SubU32 = 0x31, "SUB_U32_TYPED" => [Reg, Reg, Reg];
    MulU32 = 0x32, "MUL_U32_TYPED" => [Reg, Reg, Reg];
    DivU32 = 0x33, "DIV_U32_TYPED" => [Reg, Reg, Reg];
    ModU32 = 0x34, "MOD_U32_TYPED" => [Reg, Reg, Reg];
    AddU64 = 0x38, "ADD_U64_TYPED" => [Reg, Reg, Reg];
    SubU64 = 0x39, "SUB_U64_TYPED" => [Reg, Reg, Reg];
    MulU64 = 0x3A, "MUL_U64_TYPED" => [Reg, Reg, Reg];
    DivU64 = 0x3B, "DIV_U64_TYPED" => [Reg, Reg, Reg];
    ModU64 = 0x3C, "MOD_U64_TYPED" => [Reg, Reg, Reg];
    AddF64 = 0x40, "ADD_F64_TYPED" => [Reg, Reg, Reg];
    SubF64 = 0x41, "SUB_F64_TYPED" => [Reg, Reg, Reg];
    MulF64 = 0x42, "MUL_F64_TYPED" => [Reg, Reg, Reg];
    DivF64 = 0x43, "DIV_F64_TYPED" => [Reg, Reg, Reg];
    ModF64 = 0x44, "MOD_F64_TYPED" => [Reg, Reg, Reg];

    // typed comparisons
    LtI32 = 0x48, "LT_I32_TYPED" => [Reg, Reg, Reg];
    LeI32 = 0x49, "LE_I32_TYPED" => [Reg, Reg, Reg];
    GtI32 = 0x4A, "GT_I32_TYPED" => [Reg, Reg, Reg];
    GeI32 = 0x4B, "GE_I32_TYPED" => [Reg, Reg, Reg];
    LtI64 = 0x4C, "LT_I64_TYPED" => [Reg, Reg, Reg];
    LeI64 = 0x4D, "LE_I64_TYPED" => [Reg, Reg, Reg];
    GtI64 = 0x4E, "GT_I64_TYPED" => [Reg, Reg, Reg];
    GeI64 = 0x4F, "GE_I64_TYPED" => [Reg, Reg, Reg];
    LtF64 = 0x50, "LT_F64_TYPED" => [Reg, Reg, Reg];
    LeF64 = 0x51, "LE_F64_TYPED" => [Reg, Reg, Reg];
    GtF64 = 0x52, "GT_F64_TYPED" => [Reg, Reg, Reg];
    GeF64 = 0x53, "GE_F64_TYPED" => [Reg, Reg, Reg];
    IncI32 = 0x54, "INC_I32_TYPED" => [Reg];

    // jumps
    Jump = 0x60, "JUMP" => [Jump];
    JumpIfNot = 0x61, "JUMP_IF_NOT" => [Reg, Jump];
    Loop = 0x62, "LOOP" => [Loop];

    // calls
    Call = 0x68, "CALL" => [Reg, Reg, Args];
    Return = 0x69, "RETURN" => [Reg];
    ReturnVoid = 0x6A, "RETURN_VOID" => [];

    // closures
    Closure = 0x70, "CLOSURE" => [Reg, Func, Captures];
    GetUpvalue = 0x71, "GET_UPVALUE" => [Reg, Byte];
    SetUpvalue = 0x72, "SET_UPVALUE" => [Byte, Reg];
    CloseUpvalue = 0x73, "CLOSE_UPVALUE" => [Reg];

    // exceptions
    TryBegin = 0x78, "TRY_BEGIN" => [Reg, Jump];
    TryEnd = 0x79, "TRY_END" => [];
    Throw = 0x7A, "THROW" => [Reg];

    // runtime services
    Print = 0x80, "PRINT" => [Reg];
    GcPause = 0x81, "GC_PAUSE" => [];
    GcResume = 0x82, "GC_RESUME" => [];
    SwitchModule = 0x83, "SWITCH_MODULE" => [Byte];
}

impl OpCode {
    pub fn is_jump(self) -> bool {
        self.operands()
            .iter()
            .any(|o| matches!(o, Operand::Jump | Operand::Loop))
    }
}
