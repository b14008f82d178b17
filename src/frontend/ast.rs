//! Declaration tree for the UDO source subset

pub use super::token::SourceLoc;

/// A possibly qualified name (`a::b::C` is `["a", "b", "C"]`)
pub type QualName = Vec<String>;

/// Join a qualified name for diagnostics
pub fn qual_name_to_string(name: &[String]) -> String {
    name.join("::")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    Protected,
    Private,
}

/// One parsed compilation unit (runtime header plus user source)
#[derive(Debug)]
pub struct TranslationUnit {
    pub decls: Vec<Decl>,
}

#[derive(Debug)]
pub enum Decl {
    Namespace(NamespaceDecl),
    Record(RecordDecl),
    Function(FunctionDecl),
    Global(GlobalDecl),
}

#[derive(Debug)]
pub struct NamespaceDecl {
    pub name: String,
    pub decls: Vec<Decl>,
    pub loc: SourceLoc,
}

#[derive(Debug)]
pub struct RecordDecl {
    pub name: String,
    pub is_class: bool,
    pub bases: Vec<BaseSpecifier>,
    pub members: Vec<Member>,
    pub loc: SourceLoc,
}

#[derive(Debug)]
pub struct BaseSpecifier {
    pub access: Access,
    pub is_virtual: bool,
    pub name: QualName,
    pub loc: SourceLoc,
}

#[derive(Debug)]
pub enum Member {
    Field(FieldDecl),
    Method(MethodDecl),
    Constructor(CtorDecl),
    Destructor(DtorDecl),
    Record(RecordDecl),
}

#[derive(Debug)]
pub struct FieldDecl {
    pub name: String,
    pub ty: TypeRef,
    pub init: Option<Expr>,
    pub is_static: bool,
    pub access: Access,
    pub loc: SourceLoc,
}

#[derive(Debug)]
pub struct MethodDecl {
    pub name: String,
    pub ret: TypeRef,
    pub params: Vec<Param>,
    pub body: Option<Block>,
    pub is_static: bool,
    pub is_const: bool,
    pub is_virtual: bool,
    /// `template <typename T>` methods carry the type parameter name
    pub template_param: Option<String>,
    pub access: Access,
    pub loc: SourceLoc,
}

#[derive(Debug)]
pub struct Param {
    pub name: Option<String>,
    pub ty: TypeRef,
    pub loc: SourceLoc,
}

#[derive(Debug)]
pub struct CtorDecl {
    pub params: Vec<Param>,
    pub inits: Vec<MemberInit>,
    pub body: Option<Block>,
    pub is_defaulted: bool,
    pub is_deleted: bool,
    pub access: Access,
    pub loc: SourceLoc,
}

#[derive(Debug)]
pub struct MemberInit {
    pub member: String,
    pub args: Vec<Expr>,
    pub loc: SourceLoc,
}

#[derive(Debug)]
pub struct DtorDecl {
    pub body: Option<Block>,
    pub is_virtual: bool,
    pub is_defaulted: bool,
    pub access: Access,
    pub loc: SourceLoc,
}

/// A free function (the runtime header declares `printDebug`/`getRandom`
/// this way; user source may define helper functions too)
#[derive(Debug)]
pub struct FunctionDecl {
    pub name: String,
    pub ret: TypeRef,
    pub params: Vec<Param>,
    pub body: Option<Block>,
    pub is_static: bool,
    pub loc: SourceLoc,
}

/// A namespace-scope variable
#[derive(Debug)]
pub struct GlobalDecl {
    pub name: String,
    pub ty: TypeRef,
    pub init: Option<Expr>,
    pub is_static: bool,
    pub is_const: bool,
    pub loc: SourceLoc,
}

/// A type as written in the source
#[derive(Debug, Clone, PartialEq)]
pub enum TypeRef {
    Prim(PrimType),
    Named(QualName),
    /// `typename T::Member` inside a template declaration
    Dependent { param: String, member: String },
    Const(Box<TypeRef>),
    Ptr(Box<TypeRef>),
    Ref(Box<TypeRef>),
    RvalueRef(Box<TypeRef>),
}

impl TypeRef {
    /// Strip const qualifiers off the outermost level
    pub fn without_const(&self) -> &TypeRef {
        match self {
            TypeRef::Const(inner) => inner.without_const(),
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimType {
    Void,
    Bool,
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    LongDouble,
}

#[derive(Debug)]
pub struct Block {
    pub stmts: Vec<Stmt>,
}

#[derive(Debug)]
pub enum Stmt {
    Compound(Block),
    Local {
        name: String,
        ty: TypeRef,
        init: Option<Expr>,
        loc: SourceLoc,
    },
    Expr(Expr),
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
    },
    Return {
        value: Option<Expr>,
        loc: SourceLoc,
    },
    Break(SourceLoc),
    Continue(SourceLoc),
}

#[derive(Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub loc: SourceLoc,
}

#[derive(Debug)]
pub enum ExprKind {
    IntLit(u64),
    FloatLit { value: f64, is_f32: bool },
    BoolLit(bool),
    StrLit(String),
    CharLit(u8),
    Nullptr,
    Name(QualName),
    This,
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    PostIncDec {
        increment: bool,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `lhs = rhs` or a compound assignment when `op` is set
    Assign {
        op: Option<BinaryOp>,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Member {
        base: Box<Expr>,
        member: String,
        arrow: bool,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    /// `emit<Demo>(state, tuple)`
    TemplateCall {
        name: QualName,
        type_arg: TypeRef,
        args: Vec<Expr>,
    },
    /// `OutputTuple{a, b}`
    AggregateInit {
        ty: TypeRef,
        args: Vec<Expr>,
    },
    /// `double(x)` and the other scalar functional casts
    Cast {
        ty: TypeRef,
        arg: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
    Deref,
    AddrOf,
    PreInc,
    PreDec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    LogAnd,
    LogOr,
}
