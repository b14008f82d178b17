//! Mid-level IR for compiled UDOs
//!
//! The analyzer lowers user code into this module form; the preprocessor
//! rewrites it (callback trampolines, the libc bootstrap, re-initialization
//! of globals) and the code generator translates it to Cranelift IR.
//!
//! Globals and functions reference each other cyclically (a functor slot is
//! referenced by its trampoline which is referenced by the export table), so
//! all cross-references are stable indices into the module's arenas instead
//! of owned graph nodes. Function bodies are basic blocks over virtual
//! registers; registers may be redefined, the backend maps them onto SSA
//! variables.

use smallvec::SmallVec;

/// A function in the module's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub u32);

/// A global variable in the module's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalId(pub u32);

/// Virtual register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u32);

/// Basic block label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// Stack slot within a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackSlotId(pub u32);

/// Scalar type of a register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Pointer-sized integer, kept distinct for readability
    Ptr,
}

impl ValType {
    pub fn is_float(self) -> bool {
        matches!(self, ValType::F32 | ValType::F64)
    }

    pub fn bytes(self) -> u32 {
        match self {
            ValType::I8 => 1,
            ValType::I16 => 2,
            ValType::I32 => 4,
            ValType::I64 | ValType::Ptr | ValType::F64 => 8,
            ValType::F32 => 4,
        }
    }
}

/// Linkage of a module entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// Defined here and visible to the linker by name
    Export,
    /// Defined here, module-private
    Local,
    /// Declared only; the in-process linker must resolve it
    Import,
}

/// Initializer of a global
#[derive(Debug, Clone)]
pub enum GlobalInit {
    /// Zero-initialized storage of the given size
    Zero(u64),
    /// Explicit initializer bytes
    Bytes(Vec<u8>),
    /// No storage in this module (declaration)
    Import,
}

#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
    pub align: u64,
    pub init: GlobalInit,
    pub is_constant: bool,
    pub linkage: Linkage,
}

impl Global {
    pub fn size(&self) -> u64 {
        match &self.init {
            GlobalInit::Zero(size) => *size,
            GlobalInit::Bytes(bytes) => bytes.len() as u64,
            GlobalInit::Import => 0,
        }
    }
}

/// Function signature, scalars only; aggregates are passed by pointer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    pub params: SmallVec<[ValType; 8]>,
    pub ret: Option<ValType>,
}

impl Signature {
    pub fn new(params: impl IntoIterator<Item = ValType>, ret: Option<ValType>) -> Self {
        Signature {
            params: params.into_iter().collect(),
            ret,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub linkage: Linkage,
    pub sig: Signature,
    pub body: Option<FuncBody>,
    /// Keep the function out of inlining/duplication so its name survives
    pub no_inline: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StackSlot {
    pub size: u32,
    pub align: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FuncBody {
    pub blocks: Vec<Block>,
    pub stack_slots: Vec<StackSlot>,
    /// Type of every virtual register, indexed by `Reg`
    pub reg_types: Vec<ValType>,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub label: Label,
    pub instrs: Vec<Instr>,
    pub terminator: Terminator,
}

/// A reference to something with an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolRef {
    Func(FuncId),
    Global(GlobalId),
    /// A symbol the in-process linker resolves (libc entry points etc.)
    External(String),
}

/// Callee of a direct call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    Func(FuncId),
    External { name: String, sig: Signature },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div { signed: bool },
    Rem { signed: bool },
    And,
    Or,
    Xor,
    Shl,
    Shr { signed: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpCode {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
pub enum Instr {
    Iconst {
        dst: Reg,
        ty: ValType,
        value: i64,
    },
    Fconst {
        dst: Reg,
        ty: ValType,
        value: f64,
    },
    SymbolAddr {
        dst: Reg,
        symbol: SymbolRef,
    },
    StackAddr {
        dst: Reg,
        slot: StackSlotId,
    },
    Load {
        dst: Reg,
        ty: ValType,
        addr: Reg,
        offset: i32,
    },
    Store {
        ty: ValType,
        addr: Reg,
        offset: i32,
        value: Reg,
    },
    Binary {
        dst: Reg,
        op: BinOp,
        ty: ValType,
        lhs: Reg,
        rhs: Reg,
    },
    IntCmp {
        dst: Reg,
        cc: CmpCode,
        signed: bool,
        ty: ValType,
        lhs: Reg,
        rhs: Reg,
    },
    FloatCmp {
        dst: Reg,
        cc: CmpCode,
        ty: ValType,
        lhs: Reg,
        rhs: Reg,
    },
    /// Widening integer conversion
    Extend {
        dst: Reg,
        to: ValType,
        from: ValType,
        src: Reg,
        signed: bool,
    },
    /// Narrowing integer conversion
    Truncate {
        dst: Reg,
        to: ValType,
        src: Reg,
    },
    FloatToInt {
        dst: Reg,
        to: ValType,
        src: Reg,
        signed: bool,
    },
    IntToFloat {
        dst: Reg,
        to: ValType,
        from: ValType,
        src: Reg,
        signed: bool,
    },
    /// f32 <-> f64
    FloatConvert {
        dst: Reg,
        to: ValType,
        src: Reg,
    },
    Call {
        dst: Option<Reg>,
        callee: Callee,
        args: SmallVec<[Reg; 8]>,
    },
    CallIndirect {
        dst: Option<Reg>,
        sig: Signature,
        callee: Reg,
        args: SmallVec<[Reg; 8]>,
    },
}

#[derive(Debug, Clone)]
pub enum Terminator {
    Jump(Label),
    Branch {
        cond: Reg,
        then_label: Label,
        else_label: Label,
    },
    Return(Option<Reg>),
}

/// A static initializer or finalizer together with its priority
#[derive(Debug, Clone, Copy)]
pub struct Structor {
    pub priority: u16,
    pub func: FuncId,
}

/// The metadata record the preprocessor writes into the module so the
/// execution layer can recover the expected external symbols from the
/// object bytes alone.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    /// Well-known export names present in this module
    pub well_known: Vec<String>,
}

/// One compiled UDO module
#[derive(Debug, Default)]
pub struct Module {
    pub globals: Vec<Global>,
    pub funcs: Vec<Function>,
    /// Static initializers, run by the generated global constructor
    pub structors: Vec<Structor>,
    /// Static finalizers, run in reverse by the generated global destructor
    pub destructors: Vec<Structor>,
    pub metadata: Metadata,
}

impl Module {
    pub fn new() -> Self {
        Module::default()
    }

    pub fn add_func(&mut self, func: Function) -> FuncId {
        let id = FuncId(self.funcs.len() as u32);
        self.funcs.push(func);
        id
    }

    pub fn add_global(&mut self, global: Global) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(global);
        id
    }

    pub fn func(&self, id: FuncId) -> &Function {
        &self.funcs[id.0 as usize]
    }

    pub fn func_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.funcs[id.0 as usize]
    }

    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.0 as usize]
    }

    pub fn global_mut(&mut self, id: GlobalId) -> &mut Global {
        &mut self.globals[id.0 as usize]
    }

    pub fn find_func(&self, name: &str) -> Option<FuncId> {
        self.funcs
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }
}

/// Builder for a function body: block bookkeeping plus register allocation
pub struct BodyBuilder {
    body: FuncBody,
    current: usize,
    terminated: Vec<bool>,
}

impl BodyBuilder {
    /// Start a body with its entry block
    pub fn new() -> Self {
        let entry = Block {
            label: Label(0),
            instrs: Vec::new(),
            terminator: Terminator::Return(None),
        };
        BodyBuilder {
            body: FuncBody {
                blocks: vec![entry],
                stack_slots: Vec::new(),
                reg_types: Vec::new(),
            },
            current: 0,
            terminated: vec![false],
        }
    }

    pub fn new_reg(&mut self, ty: ValType) -> Reg {
        let reg = Reg(self.body.reg_types.len() as u32);
        self.body.reg_types.push(ty);
        reg
    }

    pub fn new_block(&mut self) -> Label {
        let label = Label(self.body.blocks.len() as u32);
        self.body.blocks.push(Block {
            label,
            instrs: Vec::new(),
            terminator: Terminator::Return(None),
        });
        self.terminated.push(false);
        label
    }

    pub fn new_stack_slot(&mut self, size: u32, align: u32) -> StackSlotId {
        let id = StackSlotId(self.body.stack_slots.len() as u32);
        self.body.stack_slots.push(StackSlot { size, align });
        id
    }

    pub fn current_label(&self) -> Label {
        self.body.blocks[self.current].label
    }

    pub fn switch_to(&mut self, label: Label) {
        self.current = label.0 as usize;
    }

    pub fn push(&mut self, instr: Instr) {
        self.body.blocks[self.current].instrs.push(instr);
    }

    pub fn terminate(&mut self, terminator: Terminator) {
        if !self.terminated[self.current] {
            self.body.blocks[self.current].terminator = terminator;
            self.terminated[self.current] = true;
        }
    }

    /// Whether the current block already ends in an explicit terminator.
    /// Lowering uses this to avoid emitting fallthrough jumps after `return`.
    pub fn is_terminated(&self) -> bool {
        self.terminated[self.current]
    }

    pub fn reg_type(&self, reg: Reg) -> ValType {
        self.body.reg_types[reg.0 as usize]
    }

    pub fn finish(self) -> FuncBody {
        self.body
    }
}

impl Default for BodyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
