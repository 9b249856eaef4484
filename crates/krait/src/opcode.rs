//! CPython 2.7 opcode set.
//!
//! Numbering matches the `opcode` module of CPython 2.7 exactly, since
//! the instruction stream comes straight out of `.pyc` images. Opcodes
//! numbered 90 and above carry a 2-byte little-endian operand. The enum
//! is public so tracers can observe dispatch; decoding stays internal.

use num_enum::TryFromPrimitive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    StopCode = 0,
    PopTop = 1,
    RotTwo = 2,
    RotThree = 3,
    DupTop = 4,
    RotFour = 5,
    Nop = 9,

    UnaryPositive = 10,
    UnaryNegative = 11,
    UnaryNot = 12,
    UnaryConvert = 13,
    UnaryInvert = 15,

    BinaryPower = 19,
    BinaryMultiply = 20,
    BinaryDivide = 21,
    BinaryModulo = 22,
    BinaryAdd = 23,
    BinarySubtract = 24,
    BinarySubscr = 25,
    BinaryFloorDivide = 26,
    BinaryTrueDivide = 27,
    InplaceFloorDivide = 28,
    InplaceTrueDivide = 29,

    SliceNone = 30,
    SliceLeft = 31,
    SliceRight = 32,
    SliceBoth = 33,
    StoreSliceNone = 40,
    StoreSliceLeft = 41,
    StoreSliceRight = 42,
    StoreSliceBoth = 43,
    DeleteSliceNone = 50,
    DeleteSliceLeft = 51,
    DeleteSliceRight = 52,
    DeleteSliceBoth = 53,

    StoreMap = 54,
    InplaceAdd = 55,
    InplaceSubtract = 56,
    InplaceMultiply = 57,
    InplaceDivide = 58,
    InplaceModulo = 59,
    StoreSubscr = 60,
    DeleteSubscr = 61,
    BinaryLshift = 62,
    BinaryRshift = 63,
    BinaryAnd = 64,
    BinaryXor = 65,
    BinaryOr = 66,
    InplacePower = 67,
    GetIter = 68,

    PrintExpr = 70,
    PrintItem = 71,
    PrintNewline = 72,
    PrintItemTo = 73,
    PrintNewlineTo = 74,
    InplaceLshift = 75,
    InplaceRshift = 76,
    InplaceAnd = 77,
    InplaceXor = 78,
    InplaceOr = 79,

    BreakLoop = 80,
    WithCleanup = 81,
    LoadLocals = 82,
    ReturnValue = 83,
    ImportStar = 84,
    ExecStmt = 85,
    YieldValue = 86,
    PopBlock = 87,
    EndFinally = 88,
    BuildClass = 89,

    StoreName = 90,
    DeleteName = 91,
    UnpackSequence = 92,
    ForIter = 93,
    ListAppend = 94,
    StoreAttr = 95,
    DeleteAttr = 96,
    StoreGlobal = 97,
    DeleteGlobal = 98,
    DupTopx = 99,
    LoadConst = 100,
    LoadName = 101,
    BuildTuple = 102,
    BuildList = 103,
    BuildSet = 104,
    BuildMap = 105,
    LoadAttr = 106,
    CompareOp = 107,
    ImportName = 108,
    ImportFrom = 109,
    JumpForward = 110,
    JumpIfFalseOrPop = 111,
    JumpIfTrueOrPop = 112,
    JumpAbsolute = 113,
    PopJumpIfFalse = 114,
    PopJumpIfTrue = 115,
    LoadGlobal = 116,
    ContinueLoop = 119,
    SetupLoop = 120,
    SetupExcept = 121,
    SetupFinally = 122,
    LoadFast = 124,
    StoreFast = 125,
    DeleteFast = 126,
    RaiseVarargs = 130,
    CallFunction = 131,
    MakeFunction = 132,
    BuildSlice = 133,
    MakeClosure = 134,
    LoadClosure = 135,
    LoadDeref = 136,
    StoreDeref = 137,
    CallFunctionVar = 140,
    CallFunctionKw = 141,
    CallFunctionVarKw = 142,
    SetupWith = 143,
    ExtendedArg = 145,
    SetAdd = 146,
    MapAdd = 147,
}

/// First opcode that carries an operand.
pub(crate) const HAVE_ARGUMENT: u8 = 90;

impl Opcode {
    #[inline]
    pub fn has_arg(self) -> bool {
        self as u8 >= HAVE_ARGUMENT
    }
}

/// Comparison kinds, the operand of `COMPARE_OP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum CompareKind {
    Lt = 0,
    Le = 1,
    Eq = 2,
    Ne = 3,
    Gt = 4,
    Ge = 5,
    In = 6,
    NotIn = 7,
    Is = 8,
    IsNot = 9,
    ExcMatch = 10,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbering_matches_cpython() {
        assert_eq!(Opcode::try_from(23u8).unwrap(), Opcode::BinaryAdd);
        assert_eq!(Opcode::try_from(83u8).unwrap(), Opcode::ReturnValue);
        assert_eq!(Opcode::try_from(100u8).unwrap(), Opcode::LoadConst);
        assert_eq!(Opcode::try_from(124u8).unwrap(), Opcode::LoadFast);
        assert_eq!(Opcode::try_from(131u8).unwrap(), Opcode::CallFunction);
        assert!(Opcode::try_from(255u8).is_err());
    }

    #[test]
    fn operand_threshold() {
        assert!(!Opcode::ReturnValue.has_arg());
        assert!(Opcode::StoreName.has_arg());
        assert!(Opcode::LoadConst.has_arg());
    }
}
