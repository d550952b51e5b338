// operation.rs — The closed set of non-attribute operations on a value.
//
// Every operator, protocol hook and rendering hook a guarded handle can
// intercept is one `Operation`. Each has exactly one canonical name, which is
// the key a checker looks up. Comparisons, hashing and truthiness are exempt:
// guarded handles delegate them without consulting the checker.

use std::fmt;

/// Binary arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 11] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Rem,
        BinaryOp::Pow,
        BinaryOp::BitAnd,
        BinaryOp::BitOr,
        BinaryOp::BitXor,
        BinaryOp::Shl,
        BinaryOp::Shr,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        BINARY_NAMES[self.index()]
    }
}

const BINARY_NAMES: [&str; 11] = [
    "add", "sub", "mul", "div", "rem", "pow", "bitand", "bitor", "bitxor", "shl", "shr",
];

const REFLECTED_NAMES: [&str; 11] = [
    "rev_add",
    "rev_sub",
    "rev_mul",
    "rev_div",
    "rev_rem",
    "rev_pow",
    "rev_bitand",
    "rev_bitor",
    "rev_bitxor",
    "rev_shl",
    "rev_shr",
];

const IN_PLACE_NAMES: [&str; 11] = [
    "add_assign",
    "sub_assign",
    "mul_assign",
    "div_assign",
    "rem_assign",
    "pow_assign",
    "bitand_assign",
    "bitor_assign",
    "bitxor_assign",
    "shl_assign",
    "shr_assign",
];

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Pos,
    Abs,
    /// Logical not for booleans, bitwise complement for integers.
    Not,
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 4] = [UnaryOp::Neg, UnaryOp::Pos, UnaryOp::Abs, UnaryOp::Not];

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Pos => "pos",
            UnaryOp::Abs => "abs",
            UnaryOp::Not => "not",
        }
    }
}

/// Equality and ordering comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub const ALL: [CompareOp; 6] = [
        CompareOp::Eq,
        CompareOp::Ne,
        CompareOp::Lt,
        CompareOp::Le,
        CompareOp::Gt,
        CompareOp::Ge,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Lt => "lt",
            CompareOp::Le => "le",
            CompareOp::Gt => "gt",
            CompareOp::Ge => "ge",
        }
    }

    /// Evaluate this comparison against an ordering result.
    pub fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Eq => ordering == Equal,
            CompareOp::Ne => ordering != Equal,
            CompareOp::Lt => ordering == Less,
            CompareOp::Le => ordering != Greater,
            CompareOp::Gt => ordering == Greater,
            CompareOp::Ge => ordering != Less,
        }
    }
}

/// A non-attribute operation on a value.
///
/// Argument conventions for [`Guarded::intercept`](crate::Guarded::intercept)
/// and [`Value::apply`](crate::Value::apply):
///
/// | operation | args | result |
/// |---|---|---|
/// | `Call` | call arguments | return value |
/// | `GetItem` / `DelItem` | `[key]` | item / `None` |
/// | `SetItem` | `[key, value]` | `None` |
/// | `Iter` | `[]` | `List` snapshot of the items |
/// | `Next` | `[]` | next item, `None` when exhausted |
/// | `Len` | `[]` | `Int` |
/// | `Contains` | `[item]` | `Bool` |
/// | `Binary(op)` / `InPlace(op)` | `[rhs]` | result |
/// | `Reflected(op)` | `[lhs]` | `lhs op self` |
/// | `Unary(op)` | `[]` | result |
/// | `Compare(op)` | `[rhs]` | `Bool` |
/// | `Hash` | `[]` | `Int` |
/// | `Truthy` | `[]` | `Bool` |
/// | `Display` / `Debug` | `[]` | `Text` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Call,
    GetItem,
    SetItem,
    DelItem,
    Iter,
    Next,
    Len,
    Contains,
    Binary(BinaryOp),
    /// The value is the right-hand operand of `op`.
    Reflected(BinaryOp),
    InPlace(BinaryOp),
    Unary(UnaryOp),
    Compare(CompareOp),
    Hash,
    Truthy,
    Display,
    Debug,
}

impl Operation {
    /// The canonical name a checker looks up for this operation.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Call => "call",
            Operation::GetItem => "get_item",
            Operation::SetItem => "set_item",
            Operation::DelItem => "del_item",
            Operation::Iter => "iter",
            Operation::Next => "next",
            Operation::Len => "len",
            Operation::Contains => "contains",
            Operation::Binary(op) => op.name(),
            Operation::Reflected(op) => REFLECTED_NAMES[op.index()],
            Operation::InPlace(op) => IN_PLACE_NAMES[op.index()],
            Operation::Unary(op) => op.name(),
            Operation::Compare(op) => op.name(),
            Operation::Hash => "hash",
            Operation::Truthy => "truthy",
            Operation::Display => "display",
            Operation::Debug => "debug",
        }
    }

    /// Operations a guarded handle delegates without asking its checker.
    ///
    /// These must stay cheap and side-effect free so guarded values work as
    /// map keys and in control flow.
    pub fn is_exempt(&self) -> bool {
        matches!(
            self,
            Operation::Compare(_) | Operation::Hash | Operation::Truthy
        )
    }

    /// Every operation, in a stable order.
    pub fn all() -> Vec<Operation> {
        let mut ops = vec![
            Operation::Call,
            Operation::GetItem,
            Operation::SetItem,
            Operation::DelItem,
            Operation::Iter,
            Operation::Next,
            Operation::Len,
            Operation::Contains,
        ];
        ops.extend(BinaryOp::ALL.iter().map(|op| Operation::Binary(*op)));
        ops.extend(BinaryOp::ALL.iter().map(|op| Operation::Reflected(*op)));
        ops.extend(BinaryOp::ALL.iter().map(|op| Operation::InPlace(*op)));
        ops.extend(UnaryOp::ALL.iter().map(|op| Operation::Unary(*op)));
        ops.extend(CompareOp::ALL.iter().map(|op| Operation::Compare(*op)));
        ops.extend([
            Operation::Hash,
            Operation::Truthy,
            Operation::Display,
            Operation::Debug,
        ]);
        ops
    }

    /// Look up an operation by its canonical name.
    pub fn from_name(name: &str) -> Option<Operation> {
        Operation::all().into_iter().find(|op| op.name() == name)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn canonical_names_are_unique() {
        let all = Operation::all();
        let names: HashSet<&str> = all.iter().map(|op| op.name()).collect();
        assert_eq!(names.len(), all.len());
    }

    #[test]
    fn only_comparisons_hash_and_truthy_are_exempt() {
        let exempt: Vec<&str> = Operation::all()
            .iter()
            .filter(|op| op.is_exempt())
            .map(|op| op.name())
            .collect();
        assert_eq!(
            exempt,
            vec!["eq", "ne", "lt", "le", "gt", "ge", "hash", "truthy"]
        );
    }

    #[test]
    fn names_round_trip_through_lookup() {
        for op in Operation::all() {
            assert_eq!(Operation::from_name(op.name()), Some(op));
        }
        assert_eq!(
            Operation::from_name("add_assign"),
            Some(Operation::InPlace(BinaryOp::Add))
        );
        assert_eq!(Operation::from_name("__add__"), None);
    }

    #[test]
    fn compare_holds_matches_ordering() {
        use std::cmp::Ordering;
        assert!(CompareOp::Le.holds(Ordering::Equal));
        assert!(CompareOp::Le.holds(Ordering::Less));
        assert!(!CompareOp::Lt.holds(Ordering::Equal));
        assert!(CompareOp::Ne.holds(Ordering::Greater));
    }
}
