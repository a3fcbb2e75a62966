//! Typed AST handed to the code generator
//!
//! The semantic analyzer has already run: every node carries a `SizedType`,
//! map accesses know their value type, and aggregation calls point at their
//! target map. The generator trusts these invariants and treats violations
//! as analyzer bugs.

use crate::metadata::UsdtInfo;
use crate::types::SizedType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Band,
    Bor,
    Bxor,
    Land,
    Lor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    LogicalNot,
    BitwiseNot,
    Neg,
    Increment,
    Decrement,
    Deref,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionalKind {
    /// `$n`
    Positional(usize),
    /// `$#`
    Count,
}

/// Record-field vs. tuple-index selection.
#[derive(Debug, Clone, PartialEq)]
pub enum Accessor {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegerLit {
    pub value: i64,
    pub ty: SizedType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringLit {
    pub value: String,
    pub ty: SizedType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionalParameter {
    pub kind: PositionalKind,
    /// Whether the parameter appears in string position (affects the
    /// fallback for out-of-range parameters).
    pub is_in_str: bool,
    pub ty: SizedType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Identifier {
    pub name: String,
    pub ty: SizedType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Builtin {
    pub ident: String,
    pub ty: SizedType,
    /// For kfunc probes the analyzer resolves the argument slot index.
    pub kfarg_index: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub func: String,
    /// Target map for aggregation calls (`@x = count()` points here).
    pub map: Option<MapAccess>,
    pub args: Vec<Expression>,
    pub ty: SizedType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapAccess {
    pub ident: String,
    pub keys: Vec<Expression>,
    /// Value type of the map.
    pub ty: SizedType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub ident: String,
    pub ty: SizedType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binop {
    pub op: BinaryOp,
    pub left: Box<Expression>,
    pub right: Box<Expression>,
    pub ty: SizedType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unop {
    pub op: UnaryOp,
    pub expr: Box<Expression>,
    pub is_post_op: bool,
    pub ty: SizedType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ternary {
    pub cond: Box<Expression>,
    pub left: Box<Expression>,
    pub right: Box<Expression>,
    pub ty: SizedType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldAccess {
    pub expr: Box<Expression>,
    pub accessor: Accessor,
    pub ty: SizedType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayAccess {
    pub expr: Box<Expression>,
    pub index: Box<Expression>,
    pub ty: SizedType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cast {
    pub expr: Box<Expression>,
    pub ty: SizedType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TupleExpr {
    pub elems: Vec<Expression>,
    pub ty: SizedType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Integer(IntegerLit),
    String(StringLit),
    PositionalParameter(PositionalParameter),
    Identifier(Identifier),
    Builtin(Builtin),
    Call(Call),
    Map(MapAccess),
    Variable(Variable),
    Binop(Binop),
    Unop(Unop),
    Ternary(Ternary),
    FieldAccess(FieldAccess),
    ArrayAccess(ArrayAccess),
    Cast(Cast),
    Tuple(TupleExpr),
}

impl Expression {
    pub fn ty(&self) -> &SizedType {
        match self {
            Expression::Integer(n) => &n.ty,
            Expression::String(n) => &n.ty,
            Expression::PositionalParameter(n) => &n.ty,
            Expression::Identifier(n) => &n.ty,
            Expression::Builtin(n) => &n.ty,
            Expression::Call(n) => &n.ty,
            Expression::Map(n) => &n.ty,
            Expression::Variable(n) => &n.ty,
            Expression::Binop(n) => &n.ty,
            Expression::Unop(n) => &n.ty,
            Expression::Ternary(n) => &n.ty,
            Expression::FieldAccess(n) => &n.ty,
            Expression::ArrayAccess(n) => &n.ty,
            Expression::Cast(n) => &n.ty,
            Expression::Tuple(n) => &n.ty,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Expression::Integer(_) | Expression::String(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Expression::Map(_))
    }

    pub fn is_variable(&self) -> bool {
        matches!(self, Expression::Variable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    Return,
    Break,
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Expr(Expression),
    AssignVar {
        var: Variable,
        expr: Expression,
    },
    AssignMap {
        map: MapAccess,
        expr: Expression,
    },
    If {
        cond: Expression,
        stmts: Vec<Statement>,
        else_stmts: Option<Vec<Statement>>,
    },
    While {
        cond: Expression,
        stmts: Vec<Statement>,
    },
    Unroll {
        count: i64,
        stmts: Vec<Statement>,
    },
    Jump(JumpKind),
}

/// Probe providers the generator knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeType {
    Begin,
    End,
    Kprobe,
    Kretprobe,
    Uprobe,
    Uretprobe,
    Usdt,
    Tracepoint,
    Kfunc,
    Invalid,
}

impl ProbeType {
    pub fn from_provider(provider: &str) -> ProbeType {
        match provider {
            "BEGIN" => ProbeType::Begin,
            "END" => ProbeType::End,
            "kprobe" => ProbeType::Kprobe,
            "kretprobe" => ProbeType::Kretprobe,
            "uprobe" => ProbeType::Uprobe,
            "uretprobe" => ProbeType::Uretprobe,
            "usdt" => ProbeType::Usdt,
            "tracepoint" => ProbeType::Tracepoint,
            "kfunc" | "kretfunc" => ProbeType::Kfunc,
            _ => ProbeType::Invalid,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttachPoint {
    pub provider: String,
    pub target: String,
    pub ns: String,
    pub func: String,
    /// Filled in by the probe driver once the USDT resolver has run.
    pub usdt: Option<UsdtInfo>,
}

impl AttachPoint {
    pub fn new(provider: impl Into<String>) -> Self {
        AttachPoint {
            provider: provider.into(),
            target: String::new(),
            ns: String::new(),
            func: String::new(),
            usdt: None,
        }
    }

    pub fn probe_type(&self) -> ProbeType {
        ProbeType::from_provider(&self.provider)
    }

    /// Canonical name: provider plus the non-empty location parts joined
    /// with `:`.
    pub fn name(&self) -> String {
        self.name_with_func(&self.func)
    }

    pub fn name_with_func(&self, func: &str) -> String {
        let mut parts = vec![self.provider.clone()];
        if !self.target.is_empty() {
            parts.push(self.target.clone());
        }
        if !self.ns.is_empty() {
            parts.push(self.ns.clone());
        }
        if !func.is_empty() {
            parts.push(func.to_string());
        }
        parts.join(":")
    }

    pub fn name_with_target_func(&self, target: &str, func: &str) -> String {
        let mut parts = vec![self.provider.clone()];
        if !target.is_empty() {
            parts.push(target.to_string());
        }
        if !self.ns.is_empty() {
            parts.push(self.ns.clone());
        }
        if !func.is_empty() {
            parts.push(func.to_string());
        }
        parts.join(":")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Probe {
    pub pred: Option<Expression>,
    pub stmts: Vec<Statement>,
    pub attach_points: Vec<AttachPoint>,
    pub need_expansion: bool,
}

impl Probe {
    /// Canonical probe name, joining all attach points.
    pub fn name(&self) -> String {
        self.attach_points
            .iter()
            .map(AttachPoint::name)
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub probes: Vec<Probe>,
}

/// Split `prefix:rest` at the first colon, returning the prefix and
/// shrinking the input to the rest.
pub(crate) fn erase_prefix(s: &mut String) -> String {
    match s.find(':') {
        Some(idx) => {
            let prefix = s[..idx].to_string();
            *s = s[idx + 1..].to_string();
            prefix
        }
        None => std::mem::take(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_point_name_skips_empty_parts() {
        let mut ap = AttachPoint::new("kprobe");
        ap.func = "do_nanosleep".to_string();
        assert_eq!(ap.name(), "kprobe:do_nanosleep");

        let mut ap = AttachPoint::new("uprobe");
        ap.target = "/bin/sh".to_string();
        ap.func = "readline".to_string();
        assert_eq!(ap.name(), "uprobe:/bin/sh:readline");
    }

    #[test]
    fn test_probe_name_joins_attach_points() {
        let mut a = AttachPoint::new("kprobe");
        a.func = "f".to_string();
        let mut b = AttachPoint::new("kprobe");
        b.func = "g".to_string();
        let probe = Probe {
            pred: None,
            stmts: vec![],
            attach_points: vec![a, b],
            need_expansion: false,
        };
        assert_eq!(probe.name(), "kprobe:f,kprobe:g");
    }

    #[test]
    fn test_erase_prefix() {
        let mut s = "libfoo:ns:probe1".to_string();
        assert_eq!(erase_prefix(&mut s), "libfoo");
        assert_eq!(erase_prefix(&mut s), "ns");
        assert_eq!(s, "probe1");
    }
}
