//! Sized types attached to AST nodes by the semantic analyzer
//!
//! Every expression the code generator sees carries one of these. The kind
//! decides the IR shape (register integer vs. stack buffer), the address
//! space decides which probe-read helper foreign loads go through, and the
//! flags carry provenance the lowerers dispatch on (context struct,
//! tracepoint args, already-in-BPF-memory, kfunc args).

/// Address space of the memory a value points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddrSpace {
    #[default]
    None,
    Kernel,
    User,
}

/// Stack collection mode, part of the stack map identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackMode {
    Raw,
    Perf,
}

/// Identity of a stack-id map: programs recording stacks with the same
/// limit and mode share a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackType {
    pub limit: u64,
    pub mode: StackMode,
}

impl Default for StackType {
    fn default() -> Self {
        StackType {
            limit: 127,
            mode: StackMode::Raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    None,
    Integer { signed: bool, bits: u32 },
    Pointer { pointee: Box<SizedType> },
    String,
    Buffer,
    Record { name: String },
    Tuple { elems: Vec<SizedType> },
    Array { elem: Box<SizedType>, count: u64 },
    UserSym,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SizedType {
    pub kind: TypeKind,
    /// Size in bytes.
    pub size: u64,
    pub addr_space: AddrSpace,
    pub is_ctx: bool,
    pub is_tparg: bool,
    pub is_internal: bool,
    pub is_kfarg: bool,
    pub stack_type: Option<StackType>,
}

impl SizedType {
    fn new(kind: TypeKind, size: u64) -> Self {
        SizedType {
            kind,
            size,
            addr_space: AddrSpace::None,
            is_ctx: false,
            is_tparg: false,
            is_internal: false,
            is_kfarg: false,
            stack_type: None,
        }
    }

    pub fn none() -> Self {
        Self::new(TypeKind::None, 0)
    }

    pub fn integer(signed: bool, bits: u32) -> Self {
        Self::new(TypeKind::Integer { signed, bits }, u64::from(bits) / 8)
    }

    pub fn uint64() -> Self {
        Self::integer(false, 64)
    }

    pub fn int64() -> Self {
        Self::integer(true, 64)
    }

    pub fn uint32() -> Self {
        Self::integer(false, 32)
    }

    pub fn pointer(pointee: SizedType) -> Self {
        Self::new(
            TypeKind::Pointer {
                pointee: Box::new(pointee),
            },
            8,
        )
    }

    /// String of a fixed buffer length, NUL-terminated within it.
    pub fn string(len: u64) -> Self {
        Self::new(TypeKind::String, len)
    }

    pub fn buffer(len: u64) -> Self {
        Self::new(TypeKind::Buffer, len)
    }

    pub fn record(name: impl Into<String>, size: u64) -> Self {
        Self::new(TypeKind::Record { name: name.into() }, size)
    }

    pub fn tuple(elems: Vec<SizedType>) -> Self {
        let size = elems.iter().map(|e| e.size).sum();
        Self::new(TypeKind::Tuple { elems }, size)
    }

    pub fn array(elem: SizedType, count: u64) -> Self {
        let size = elem.size * count;
        Self::new(
            TypeKind::Array {
                elem: Box::new(elem),
                count,
            },
            size,
        )
    }

    /// Packed user-space symbol: `{addr: u64, pid: u64}`.
    pub fn usym() -> Self {
        Self::new(TypeKind::UserSym, 16)
    }

    pub fn stack(user: bool, stack_type: StackType) -> Self {
        let mut ty = Self::uint64();
        ty.stack_type = Some(stack_type);
        ty.addr_space = if user { AddrSpace::User } else { AddrSpace::Kernel };
        ty
    }

    pub fn with_addr_space(mut self, addr_space: AddrSpace) -> Self {
        self.addr_space = addr_space;
        self
    }

    pub fn ctx(mut self) -> Self {
        self.is_ctx = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.is_internal = true;
        self
    }

    pub fn is_none(&self) -> bool {
        matches!(self.kind, TypeKind::None)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self.kind, TypeKind::Integer { .. })
    }

    pub fn is_signed(&self) -> bool {
        matches!(self.kind, TypeKind::Integer { signed: true, .. })
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.kind, TypeKind::Pointer { .. })
    }

    pub fn is_string(&self) -> bool {
        matches!(self.kind, TypeKind::String)
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self.kind, TypeKind::Buffer)
    }

    pub fn is_record(&self) -> bool {
        matches!(self.kind, TypeKind::Record { .. })
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self.kind, TypeKind::Tuple { .. })
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, TypeKind::Array { .. })
    }

    pub fn is_usym(&self) -> bool {
        matches!(self.kind, TypeKind::UserSym)
    }

    pub fn pointee(&self) -> Option<&SizedType> {
        match &self.kind {
            TypeKind::Pointer { pointee } => Some(pointee),
            _ => None,
        }
    }

    pub fn element(&self) -> Option<&SizedType> {
        match &self.kind {
            TypeKind::Array { elem, .. } => Some(elem),
            _ => None,
        }
    }

    pub fn tuple_elems(&self) -> Option<&[SizedType]> {
        match &self.kind {
            TypeKind::Tuple { elems } => Some(elems),
            _ => None,
        }
    }

    pub fn record_name(&self) -> Option<&str> {
        match &self.kind {
            TypeKind::Record { name } => Some(name),
            _ => None,
        }
    }

    /// Values of these kinds live in stack buffers, never in a register.
    pub fn should_be_on_stack(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::String
                | TypeKind::Buffer
                | TypeKind::Record { .. }
                | TypeKind::Tuple { .. }
                | TypeKind::Array { .. }
                | TypeKind::UserSym
        )
    }

    /// Assigning a value of this type moves bytes, not a register.
    pub fn needs_memcpy(&self) -> bool {
        self.should_be_on_stack()
    }
}

/// A bitfield within a record field: read `read_bytes`, shift right by
/// `access_rshift`, mask with `mask`.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitfield {
    pub read_bytes: u64,
    pub access_rshift: u64,
    pub mask: u64,
}

/// One field of a resolved record definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: SizedType,
    pub offset: u64,
    pub bitfield: Option<Bitfield>,
}

/// A record definition resolved by the analyzer from kernel headers or
/// tracepoint format files.
#[derive(Debug, Clone, Default)]
pub struct StructDef {
    pub fields: std::collections::HashMap<String, Field>,
    pub size: u64,
}

impl StructDef {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_sizes() {
        assert_eq!(SizedType::uint64().size, 8);
        assert_eq!(SizedType::uint32().size, 4);
        assert!(SizedType::int64().is_signed());
        assert!(!SizedType::uint64().is_signed());
    }

    #[test]
    fn test_stack_residency() {
        assert!(SizedType::string(64).should_be_on_stack());
        assert!(SizedType::buffer(16).should_be_on_stack());
        assert!(SizedType::record("task_struct", 128).should_be_on_stack());
        assert!(SizedType::tuple(vec![SizedType::uint64()]).should_be_on_stack());
        assert!(!SizedType::uint64().should_be_on_stack());
        assert!(!SizedType::pointer(SizedType::uint64()).should_be_on_stack());
    }

    #[test]
    fn test_tuple_size_sums_elements() {
        let ty = SizedType::tuple(vec![SizedType::uint64(), SizedType::string(16)]);
        assert_eq!(ty.size, 24);
    }

    #[test]
    fn test_usym_is_packed_pair() {
        assert_eq!(SizedType::usym().size, 16);
    }
}
