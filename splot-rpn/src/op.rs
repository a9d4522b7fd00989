use arcstr::ArcStr;
use splot_value::Value;

/// A node in the compiled operation tree.
#[derive(Debug, Clone)]
pub(crate) enum Op {
    Push(Value),
    Load(ArcStr),
    Prim(Prim),
    If { then: Vec<Op>, otherwise: Vec<Op> },
    Case { arms: Vec<(Vec<Op>, Vec<Op>)>, default: Vec<Op> },
    Do { body: Vec<Op> },
}

/// The flat built-in operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Prim {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Log,
    Neg,
    Abs,
    Min,
    Max,
    Round,
    Floor,
    Ceil,
    Sin,
    Cos,
    Asin,
    Acos,
    Range,
    Clamp,
    Poly2,
    Poly3,
    Rnd,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Identical,
    And,
    Or,
    Xor,
    Not,
    Dup,
    Swap,
    Drop,
    Over,
    Rot,
    NewMap,
    MapGet,
    MapPut,
    NewArray,
    Pack(u8),
    ArrayPop,
    ArrayPush,
    Pi,
    Tau,
    E,
    True,
    False,
    Nop,
    Stop,
    Null,
}

impl Prim {
    /// The operator table. Tokens not listed here fall through to
    /// literal and variable classification.
    pub(crate) fn from_token(tok: &str) -> Option<Prim> {
        let p = match tok {
            "+" => Prim::Add,
            "-" => Prim::Sub,
            "*" => Prim::Mul,
            "/" => Prim::Div,
            "%" => Prim::Mod,
            "^" => Prim::Pow,
            "LOG" => Prim::Log,
            "NEG" => Prim::Neg,
            "ABS" => Prim::Abs,
            "MIN" => Prim::Min,
            "MAX" => Prim::Max,
            "ROUND" => Prim::Round,
            "FLOOR" => Prim::Floor,
            "CEIL" => Prim::Ceil,
            "SIN" => Prim::Sin,
            "COS" => Prim::Cos,
            "ASIN" => Prim::Asin,
            "ACOS" => Prim::Acos,
            "RANGE" => Prim::Range,
            "CLAMP" => Prim::Clamp,
            "POLY2" => Prim::Poly2,
            "POLY3" => Prim::Poly3,
            "RND" => Prim::Rnd,
            "==" => Prim::Eq,
            "!=" => Prim::Ne,
            "<" => Prim::Lt,
            "<=" => Prim::Le,
            ">" => Prim::Gt,
            ">=" => Prim::Ge,
            "===" => Prim::Identical,
            "&&" => Prim::And,
            "||" => Prim::Or,
            "XOR" => Prim::Xor,
            "!" => Prim::Not,
            "DUP" => Prim::Dup,
            "SWAP" => Prim::Swap,
            "DROP" => Prim::Drop,
            "OVER" => Prim::Over,
            "ROT" => Prim::Rot,
            "{}" => Prim::NewMap,
            "GET" => Prim::MapGet,
            "PUT" => Prim::MapPut,
            "[]" => Prim::NewArray,
            "[1]" => Prim::Pack(1),
            "[2]" => Prim::Pack(2),
            "[3]" => Prim::Pack(3),
            "[4]" => Prim::Pack(4),
            "POP" => Prim::ArrayPop,
            "PUSH" => Prim::ArrayPush,
            "PI" => Prim::Pi,
            "TAU" => Prim::Tau,
            "E" => Prim::E,
            "TRUE" => Prim::True,
            "FALSE" => Prim::False,
            "NOP" => Prim::Nop,
            "STOP" => Prim::Stop,
            "NULL" => Prim::Null,
            _ => return None,
        };
        Some(p)
    }
}
