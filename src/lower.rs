//! Lowering of analyzed declarations into the mid-level IR
//!
//! Every named variable lives in a stack slot; scalar parameters are spilled
//! into their slot on entry so assignment works uniformly. Execution-state
//! parameters are the exception: they are two pointer-sized registers that
//! flow through unchanged, and `getLocalState`/`getThreadId` are lowered
//! inline on them.

use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};

use crate::analyzer::types::{prim_to_sem, RecordId, SemType, TypeTable};
use crate::error::{UdoError, UdoResult};
use crate::frontend::ast::*;
use crate::ir::{
    self, BinOp, BodyBuilder, Callee, CmpCode, GlobalInit, Instr, Reg, SymbolRef, Terminator,
    ValType,
};

/// A parameter in semantic terms
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParamSem {
    Value(SemType),
    Ref(SemType),
    ExecState,
}

/// A declared function with its semantic signature
#[derive(Debug, Clone)]
pub(crate) struct FnInfo {
    pub id: ir::FuncId,
    pub params: Vec<ParamSem>,
    pub ret: SemType,
    pub is_method: bool,
}

/// Lowers one analyzed compilation unit into an `ir::Module`
pub(crate) struct ModuleLowerer<'a> {
    types: &'a TypeTable,
    records: &'a FxHashMap<String, RecordId>,
    nested: &'a FxHashMap<String, RecordId>,
    exec_state: RecordId,
    operator: RecordId,
    operator_fields: &'a [crate::analyzer::types::FieldInfo],
    operator_name: &'a str,

    module: ir::Module,
    globals: FxHashMap<String, (ir::GlobalId, SemType)>,
    functions: FxHashMap<String, FnInfo>,
    emit_func: Option<ir::FuncId>,
    string_literal_count: u32,
}

impl<'a> ModuleLowerer<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        types: &'a TypeTable,
        records: &'a FxHashMap<String, RecordId>,
        nested: &'a FxHashMap<String, RecordId>,
        exec_state: RecordId,
        operator: RecordId,
        operator_fields: &'a [crate::analyzer::types::FieldInfo],
        operator_name: &'a str,
    ) -> Self {
        ModuleLowerer {
            types,
            records,
            nested,
            exec_state,
            operator,
            operator_fields,
            operator_name,
            module: ir::Module::new(),
            globals: FxHashMap::default(),
            functions: FxHashMap::default(),
            emit_func: None,
            string_literal_count: 0,
        }
    }

    pub fn finish(self) -> ir::Module {
        self.module
    }

    // === Declarations ===

    pub fn declare_emit(&mut self) -> ir::FuncId {
        let id = self.module.add_func(ir::Function {
            name: "udo.emit".into(),
            linkage: ir::Linkage::Local,
            sig: ir::Signature::new([ValType::Ptr, ValType::Ptr, ValType::Ptr], None),
            body: None,
            no_inline: true,
        });
        self.emit_func = Some(id);
        id
    }

    pub fn declare_print_debug(&mut self) -> ir::FuncId {
        let id = self.module.add_func(ir::Function {
            name: "udo.printDebug".into(),
            linkage: ir::Linkage::Local,
            sig: ir::Signature::new([ValType::Ptr, ValType::I64], None),
            body: None,
            no_inline: true,
        });
        let info = FnInfo {
            id,
            params: vec![
                ParamSem::Value(SemType::Ptr(Box::new(SemType::Char))),
                ParamSem::Value(SemType::Int {
                    bits: 64,
                    signed: false,
                }),
            ],
            ret: SemType::Void,
            is_method: false,
        };
        self.functions.insert("printDebug".into(), info.clone());
        self.functions.insert("udo::printDebug".into(), info);
        id
    }

    pub fn declare_get_random(&mut self) -> ir::FuncId {
        let id = self.module.add_func(ir::Function {
            name: "udo.getRandom".into(),
            linkage: ir::Linkage::Local,
            sig: ir::Signature::new([], Some(ValType::I64)),
            body: None,
            no_inline: true,
        });
        let info = FnInfo {
            id,
            params: Vec::new(),
            ret: SemType::Int {
                bits: 64,
                signed: false,
            },
            is_method: false,
        };
        self.functions.insert("getRandom".into(), info.clone());
        self.functions.insert("udo::getRandom".into(), info);
        id
    }

    pub fn declare_free_function(
        &mut self,
        func: &FunctionDecl,
        params: Vec<ParamSem>,
        ret: SemType,
    ) -> UdoResult<ir::FuncId> {
        let sig = self.abi_sig(false, &params, &ret)?;
        let id = self.module.add_func(ir::Function {
            name: func.name.clone(),
            linkage: ir::Linkage::Local,
            sig,
            body: None,
            no_inline: false,
        });
        self.functions.insert(
            func.name.clone(),
            FnInfo {
                id,
                params,
                ret,
                is_method: false,
            },
        );
        Ok(id)
    }

    pub fn declare_method(
        &mut self,
        method: &MethodDecl,
        params: Vec<ParamSem>,
        ret: SemType,
    ) -> ir::FuncId {
        let sig = self
            .abi_sig(!method.is_static, &params, &ret)
            .expect("method signatures are validated before declaration");
        let id = self.module.add_func(ir::Function {
            name: format!("{}::{}", self.operator_name, method.name),
            linkage: ir::Linkage::Local,
            sig,
            body: None,
            no_inline: false,
        });
        self.functions.insert(
            method.name.clone(),
            FnInfo {
                id,
                params,
                ret,
                is_method: !method.is_static,
            },
        );
        id
    }

    pub fn declare_constructor(&mut self, class: &str, params: Vec<ParamSem>) -> ir::FuncId {
        let sig = self
            .abi_sig(true, &params, &SemType::Void)
            .expect("constructor parameters are validated before declaration");
        self.module.add_func(ir::Function {
            name: format!("{}::{}", class, class),
            linkage: ir::Linkage::Local,
            sig,
            body: None,
            no_inline: false,
        })
    }

    pub fn declare_destructor(&mut self, class: &str) -> ir::FuncId {
        self.module.add_func(ir::Function {
            name: format!("{}::~{}", class, class),
            linkage: ir::Linkage::Local,
            sig: ir::Signature::new([ValType::Ptr], None),
            body: None,
            no_inline: false,
        })
    }

    fn abi_sig(
        &self,
        has_this: bool,
        params: &[ParamSem],
        ret: &SemType,
    ) -> UdoResult<ir::Signature> {
        let mut abi: SmallVec<[ValType; 8]> = SmallVec::new();
        if has_this {
            abi.push(ValType::Ptr);
        }
        for param in params {
            match param {
                ParamSem::ExecState => {
                    abi.push(ValType::Ptr);
                    abi.push(ValType::Ptr);
                }
                ParamSem::Ref(_) => abi.push(ValType::Ptr),
                ParamSem::Value(sem) => match sem {
                    SemType::Record(_) => abi.push(ValType::Ptr),
                    other => abi.push(val_type(other)?),
                },
            }
        }
        let ret = match ret {
            SemType::Void => None,
            SemType::Record(_) => {
                return Err(UdoError::invalid_user_code(
                    "returning records by value is not supported",
                ))
            }
            other => Some(val_type(other)?),
        };
        Ok(ir::Signature { params: abi, ret })
    }

    // === Globals ===

    pub fn lower_global(&mut self, global: &GlobalDecl) -> UdoResult<()> {
        let sem = self.resolve_type(&global.ty)?;
        let (size, align) = self.types.size_align(&sem);

        let (init, needs_dynamic_init) = match &global.init {
            None => (GlobalInit::Zero(size), false),
            Some(expr) => match const_eval(expr) {
                Some(value) => (GlobalInit::Bytes(const_bytes(&sem, value, size)?), false),
                None => (GlobalInit::Zero(size), true),
            },
        };

        let id = self.module.add_global(ir::Global {
            name: global.name.clone(),
            align,
            init,
            is_constant: global.is_const && !needs_dynamic_init,
            linkage: ir::Linkage::Local,
        });
        self.globals.insert(global.name.clone(), (id, sem.clone()));

        if needs_dynamic_init {
            let init_expr = global.init.as_ref().expect("dynamic init has an expression");
            let func = self.lower_global_init(&global.name, id, &sem, init_expr)?;
            self.module.structors.push(ir::Structor {
                priority: 65535,
                func,
            });
        }
        Ok(())
    }

    pub fn lower_static_field(&mut self, class: &str, field: &FieldDecl) -> UdoResult<()> {
        let sem = self.resolve_type(&field.ty)?;
        let (size, align) = self.types.size_align(&sem);
        let init = match &field.init {
            None => GlobalInit::Zero(size),
            Some(expr) => match const_eval(expr) {
                Some(value) => GlobalInit::Bytes(const_bytes(&sem, value, size)?),
                None => {
                    return Err(UdoError::invalid_user_code(
                        "static data members must have constant initializers",
                    ))
                }
            },
        };
        let name = format!("{}::{}", class, field.name);
        let id = self.module.add_global(ir::Global {
            name,
            align,
            init,
            is_constant: false,
            linkage: ir::Linkage::Local,
        });
        self.globals.insert(field.name.clone(), (id, sem));
        Ok(())
    }

    fn lower_global_init(
        &mut self,
        name: &str,
        global: ir::GlobalId,
        sem: &SemType,
        expr: &Expr,
    ) -> UdoResult<ir::FuncId> {
        let id = self.module.add_func(ir::Function {
            name: format!("global.init.{}", name),
            linkage: ir::Linkage::Local,
            sig: ir::Signature::new([], None),
            body: None,
            no_inline: false,
        });

        let mut ctx = FnCtx::new(self, ir::Signature::new([], None), SemType::Void);
        let value = ctx.lower_expr(expr)?;
        let value = ctx.coerce(value, sem, expr.loc)?;
        let addr = ctx.builder.new_reg(ValType::Ptr);
        ctx.builder.push(Instr::SymbolAddr {
            dst: addr,
            symbol: SymbolRef::Global(global),
        });
        ctx.store_rvalue(value, addr, 0, sem)?;
        ctx.builder.terminate(Terminator::Return(None));
        let body = ctx.builder.finish();
        self.module.func_mut(id).body = Some(body);
        Ok(id)
    }

    // === Function bodies ===

    pub fn lower_free_function(&mut self, func: &FunctionDecl) -> UdoResult<()> {
        let Some(body) = &func.body else { return Ok(()) };
        let info = self.functions[&func.name].clone();

        let sig = self.module.func(info.id).sig.clone();
        let mut ctx = FnCtx::new(self, sig, info.ret.clone());
        ctx.bind_params(false, &info.params, &func.params)?;
        ctx.lower_block(body)?;
        ctx.finish_body(info.id);
        Ok(())
    }

    pub fn lower_method(&mut self, method: &MethodDecl, id: ir::FuncId) -> UdoResult<()> {
        let Some(body) = &method.body else { return Ok(()) };
        let info = self.functions[&method.name].clone();

        let sig = self.module.func(id).sig.clone();
        let mut ctx = FnCtx::new(self, sig, info.ret.clone());
        ctx.bind_params(!method.is_static, &info.params, &method.params)?;
        ctx.lower_block(body)?;
        ctx.finish_body(id);
        Ok(())
    }

    /// Lower the selected constructor, or synthesize the implicit default
    /// constructor when `ctor` is `None`.
    pub fn lower_constructor(
        &mut self,
        record: &RecordDecl,
        ctor: Option<&CtorDecl>,
        id: ir::FuncId,
    ) -> UdoResult<()> {
        let sig = self.module.func(id).sig.clone();
        let params: Vec<ParamSem> = match ctor {
            Some(ctor) => ctor
                .params
                .iter()
                .map(|p| {
                    self.resolve_type(p.ty.without_const())
                        .map(ParamSem::Value)
                })
                .collect::<UdoResult<_>>()?,
            None => Vec::new(),
        };
        let ast_params: &[Param] = ctor.map(|c| c.params.as_slice()).unwrap_or(&[]);

        let mut ctx = FnCtx::new(self, sig, SemType::Void);
        ctx.bind_params(true, &params, ast_params)?;

        // Member initializers from the init list take precedence over the
        // fields' default initializers
        let explicitly_initialized: Vec<&str> = ctor
            .map(|c| c.inits.iter().map(|i| i.member.as_str()).collect())
            .unwrap_or_default();

        for member in &record.members {
            let Member::Field(field) = member else { continue };
            if field.is_static || explicitly_initialized.contains(&field.name.as_str()) {
                continue;
            }
            if let Some(init) = &field.init {
                ctx.store_into_field(&field.name, init)?;
            }
        }

        if let Some(ctor) = ctor {
            for init in &ctor.inits {
                match init.args.len() {
                    0 => ctx.zero_field(&init.member, init.loc)?,
                    1 => ctx.store_into_field(&init.member, &init.args[0])?,
                    _ => {
                        return Err(UdoError::invalid_user_code(
                            "member initializers take at most one argument",
                        ))
                    }
                }
            }
            if let Some(body) = &ctor.body {
                ctx.lower_block(body)?;
            }
        }

        ctx.finish_body(id);
        Ok(())
    }

    pub fn lower_destructor(&mut self, dtor: &DtorDecl, id: ir::FuncId) -> UdoResult<()> {
        let Some(body) = &dtor.body else { return Ok(()) };
        let sig = self.module.func(id).sig.clone();
        let mut ctx = FnCtx::new(self, sig, SemType::Void);
        ctx.bind_params(true, &[], &[])?;
        ctx.lower_block(body)?;
        ctx.finish_body(id);
        Ok(())
    }

    // === Helpers shared with FnCtx ===

    fn resolve_type(&self, ty: &TypeRef) -> UdoResult<SemType> {
        match ty {
            TypeRef::Prim(prim) => Ok(prim_to_sem(*prim)),
            TypeRef::Const(inner) => self.resolve_type(inner),
            TypeRef::Ptr(inner) => Ok(SemType::Ptr(Box::new(self.resolve_type(inner)?))),
            TypeRef::Ref(_) | TypeRef::RvalueRef(_) => Err(UdoError::invalid_user_code(
                "reference types are only valid as parameters",
            )),
            TypeRef::Dependent { .. } => Err(UdoError::invalid_user_code(
                "dependent types are only valid in the runtime header",
            )),
            TypeRef::Named(name) => {
                if name.len() == 1 {
                    if let Some(&id) = self.nested.get(&name[0]) {
                        return Ok(SemType::Record(id));
                    }
                }
                if let Some(&id) = self.records.get(&name.join("::")) {
                    return Ok(SemType::Record(id));
                }
                Err(UdoError::invalid_user_code(format!(
                    "unknown type {}",
                    qual_name_to_string(name)
                )))
            }
        }
    }

    fn intern_string_literal(&mut self, value: &str) -> ir::GlobalId {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        let name = format!("str.{}", self.string_literal_count);
        self.string_literal_count += 1;
        self.module.add_global(ir::Global {
            name,
            align: 1,
            init: GlobalInit::Bytes(bytes),
            is_constant: true,
            linkage: ir::Linkage::Local,
        })
    }
}

/// A variable binding in scope
#[derive(Debug, Clone)]
enum Binding {
    /// A stack slot holding the variable
    Slot { slot: ir::StackSlotId, ty: SemType },
    /// A reference parameter: the register holds the address
    RefParam { reg: Reg, ty: SemType },
    /// An execution-state parameter (two registers)
    ExecState { regs: (Reg, Reg) },
}

/// An evaluated expression
#[derive(Debug, Clone)]
enum RValue {
    Scalar { reg: Reg, ty: SemType },
    ExecState { regs: (Reg, Reg) },
    Aggregate { addr: Reg, ty: SemType },
}

impl RValue {
    fn sem_type(&self, exec_state: RecordId) -> SemType {
        match self {
            RValue::Scalar { ty, .. } => ty.clone(),
            RValue::ExecState { .. } => SemType::Record(exec_state),
            RValue::Aggregate { ty, .. } => ty.clone(),
        }
    }
}

/// A memory location
struct LValue {
    addr: Reg,
    offset: i32,
    ty: SemType,
}

/// Per-function lowering state
struct FnCtx<'m, 'a> {
    ml: &'m mut ModuleLowerer<'a>,
    builder: BodyBuilder,
    scopes: Vec<FxHashMap<String, Binding>>,
    this_reg: Option<Reg>,
    ret: SemType,
    /// (continue target, break target)
    loop_stack: Vec<(ir::Label, ir::Label)>,
}

impl<'m, 'a> FnCtx<'m, 'a> {
    fn new(ml: &'m mut ModuleLowerer<'a>, sig: ir::Signature, ret: SemType) -> Self {
        let mut builder = BodyBuilder::new();
        // The first registers are the incoming parameters, in ABI order
        for &ty in &sig.params {
            builder.new_reg(ty);
        }
        FnCtx {
            ml,
            builder,
            scopes: vec![FxHashMap::default()],
            this_reg: None,
            ret,
            loop_stack: Vec::new(),
        }
    }

    /// Bind the ABI parameter registers to source-level names
    fn bind_params(
        &mut self,
        has_this: bool,
        params: &[ParamSem],
        ast_params: &[Param],
    ) -> UdoResult<()> {
        let mut reg_index = 0u32;
        if has_this {
            self.this_reg = Some(Reg(0));
            reg_index = 1;
        }

        for (index, param) in params.iter().enumerate() {
            let name = ast_params.get(index).and_then(|p| p.name.clone());
            match param {
                ParamSem::ExecState => {
                    let regs = (Reg(reg_index), Reg(reg_index + 1));
                    reg_index += 2;
                    if let Some(name) = name {
                        self.bind(name, Binding::ExecState { regs });
                    }
                }
                ParamSem::Ref(sem) => {
                    let reg = Reg(reg_index);
                    reg_index += 1;
                    if let Some(name) = name {
                        self.bind(name, Binding::RefParam { reg, ty: sem.clone() });
                    }
                }
                ParamSem::Value(sem) => match sem {
                    SemType::Record(_) => {
                        let reg = Reg(reg_index);
                        reg_index += 1;
                        if let Some(name) = name {
                            self.bind(name, Binding::RefParam { reg, ty: sem.clone() });
                        }
                    }
                    other => {
                        let reg = Reg(reg_index);
                        reg_index += 1;
                        // Spill into a slot so the parameter is assignable
                        let (size, align) = self.ml.types.size_align(other);
                        let slot = self.builder.new_stack_slot(size as u32, align as u32);
                        let addr = self.builder.new_reg(ValType::Ptr);
                        self.builder.push(Instr::StackAddr { dst: addr, slot });
                        self.builder.push(Instr::Store {
                            ty: val_type(other)?,
                            addr,
                            offset: 0,
                            value: reg,
                        });
                        if let Some(name) = name {
                            self.bind(name, Binding::Slot { slot, ty: other.clone() });
                        }
                    }
                },
            }
        }
        Ok(())
    }

    fn bind(&mut self, name: String, binding: Binding) {
        self.scopes
            .last_mut()
            .expect("at least one scope")
            .insert(name, binding);
    }

    fn lookup(&self, name: &str) -> Option<&Binding> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn finish_body(mut self, id: ir::FuncId) {
        if !self.builder.is_terminated() {
            // C++ leaves falling off a non-void function undefined; return a
            // zero value so the generated code stays well-formed.
            let terminator = match self.ret {
                SemType::Void => Terminator::Return(None),
                ref other => {
                    let ty = val_type(other).unwrap_or(ValType::I64);
                    let reg = self.builder.new_reg(ty);
                    if ty.is_float() {
                        self.builder.push(Instr::Fconst {
                            dst: reg,
                            ty,
                            value: 0.0,
                        });
                    } else {
                        self.builder.push(Instr::Iconst {
                            dst: reg,
                            ty,
                            value: 0,
                        });
                    }
                    Terminator::Return(Some(reg))
                }
            };
            self.builder.terminate(terminator);
        }
        let body = self.builder.finish();
        self.ml.module.func_mut(id).body = Some(body);
    }

    // === Statements ===

    fn lower_block(&mut self, block: &Block) -> UdoResult<()> {
        self.scopes.push(FxHashMap::default());
        for stmt in &block.stmts {
            self.lower_stmt(stmt)?;
            if self.builder.is_terminated() {
                break;
            }
        }
        self.scopes.pop();
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> UdoResult<()> {
        match stmt {
            Stmt::Compound(block) => self.lower_block(block),
            Stmt::Local { name, ty, init, loc } => {
                let sem = self.ml.resolve_type(ty)?;
                let (size, align) = self.ml.types.size_align(&sem);
                if size == 0 {
                    return Err(UdoError::invalid_user_code(format!(
                        "cannot declare a variable of type void at {}",
                        loc
                    )));
                }
                let slot = self.builder.new_stack_slot(size as u32, align as u32);
                if let Some(init) = init {
                    let value = self.lower_expr(init)?;
                    let value = self.coerce(value, &sem, *loc)?;
                    let addr = self.builder.new_reg(ValType::Ptr);
                    self.builder.push(Instr::StackAddr { dst: addr, slot });
                    self.store_rvalue(value, addr, 0, &sem)?;
                }
                self.bind(name.clone(), Binding::Slot { slot, ty: sem });
                Ok(())
            }
            Stmt::Expr(expr) => {
                self.lower_expr(expr)?;
                Ok(())
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond_reg = self.lower_condition(cond)?;
                let then_label = self.builder.new_block();
                let merge_label = self.builder.new_block();
                let else_label = if else_branch.is_some() {
                    self.builder.new_block()
                } else {
                    merge_label
                };
                self.builder.terminate(Terminator::Branch {
                    cond: cond_reg,
                    then_label,
                    else_label,
                });

                self.builder.switch_to(then_label);
                self.lower_stmt(then_branch)?;
                let then_falls_through = !self.builder.is_terminated();
                self.builder.terminate(Terminator::Jump(merge_label));

                let mut else_falls_through = else_branch.is_none();
                if let Some(else_branch) = else_branch {
                    self.builder.switch_to(else_label);
                    self.lower_stmt(else_branch)?;
                    else_falls_through = !self.builder.is_terminated();
                    self.builder.terminate(Terminator::Jump(merge_label));
                }

                self.builder.switch_to(merge_label);
                if !then_falls_through && !else_falls_through {
                    // Both branches returned; anything after the if is
                    // unreachable and must not be lowered
                    self.builder.terminate(Terminator::Return(None));
                }
                Ok(())
            }
            Stmt::While { cond, body } => {
                let header = self.builder.new_block();
                let body_label = self.builder.new_block();
                let exit = self.builder.new_block();

                self.builder.terminate(Terminator::Jump(header));
                self.builder.switch_to(header);
                let cond_reg = self.lower_condition(cond)?;
                self.builder.terminate(Terminator::Branch {
                    cond: cond_reg,
                    then_label: body_label,
                    else_label: exit,
                });

                self.builder.switch_to(body_label);
                self.loop_stack.push((header, exit));
                self.lower_stmt(body)?;
                self.loop_stack.pop();
                self.builder.terminate(Terminator::Jump(header));

                self.builder.switch_to(exit);
                Ok(())
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                self.scopes.push(FxHashMap::default());
                if let Some(init) = init {
                    self.lower_stmt(init)?;
                }
                let header = self.builder.new_block();
                let body_label = self.builder.new_block();
                let step_label = self.builder.new_block();
                let exit = self.builder.new_block();

                self.builder.terminate(Terminator::Jump(header));
                self.builder.switch_to(header);
                match cond {
                    Some(cond) => {
                        let cond_reg = self.lower_condition(cond)?;
                        self.builder.terminate(Terminator::Branch {
                            cond: cond_reg,
                            then_label: body_label,
                            else_label: exit,
                        });
                    }
                    None => self.builder.terminate(Terminator::Jump(body_label)),
                }

                self.builder.switch_to(body_label);
                self.loop_stack.push((step_label, exit));
                self.lower_stmt(body)?;
                self.loop_stack.pop();
                self.builder.terminate(Terminator::Jump(step_label));

                self.builder.switch_to(step_label);
                if let Some(step) = step {
                    self.lower_expr(step)?;
                }
                self.builder.terminate(Terminator::Jump(header));

                self.builder.switch_to(exit);
                self.scopes.pop();
                Ok(())
            }
            Stmt::Return { value, loc } => {
                match (value, &self.ret) {
                    (None, SemType::Void) => self.builder.terminate(Terminator::Return(None)),
                    (Some(_), SemType::Void) => {
                        return Err(UdoError::invalid_user_code(format!(
                            "returning a value from a void function at {}",
                            loc
                        )))
                    }
                    (None, _) => {
                        return Err(UdoError::invalid_user_code(format!(
                            "missing return value at {}",
                            loc
                        )))
                    }
                    (Some(expr), _) => {
                        let ret = self.ret.clone();
                        let value = self.lower_expr(expr)?;
                        let value = self.coerce(value, &ret, *loc)?;
                        let RValue::Scalar { reg, .. } = value else {
                            return Err(UdoError::invalid_user_code(
                                "returning records by value is not supported",
                            ));
                        };
                        self.builder.terminate(Terminator::Return(Some(reg)));
                    }
                }
                Ok(())
            }
            Stmt::Break(loc) => {
                let Some(&(_, break_label)) = self.loop_stack.last() else {
                    return Err(UdoError::invalid_user_code(format!(
                        "break outside of a loop at {}",
                        loc
                    )));
                };
                self.builder.terminate(Terminator::Jump(break_label));
                Ok(())
            }
            Stmt::Continue(loc) => {
                let Some(&(continue_label, _)) = self.loop_stack.last() else {
                    return Err(UdoError::invalid_user_code(format!(
                        "continue outside of a loop at {}",
                        loc
                    )));
                };
                self.builder.terminate(Terminator::Jump(continue_label));
                Ok(())
            }
        }
    }

    /// Lower an expression used as a branch condition into an i8 0/1 value
    fn lower_condition(&mut self, expr: &Expr) -> UdoResult<Reg> {
        let value = self.lower_expr(expr)?;
        let value = self.coerce(value, &SemType::Bool, expr.loc)?;
        match value {
            RValue::Scalar { reg, .. } => Ok(reg),
            _ => Err(UdoError::invalid_user_code(format!(
                "condition is not a scalar at {}",
                expr.loc
            ))),
        }
    }

    // === Expressions ===

    fn lower_expr(&mut self, expr: &Expr) -> UdoResult<RValue> {
        match &expr.kind {
            ExprKind::IntLit(value) => {
                let ty = if *value > i32::MAX as u64 {
                    SemType::Int {
                        bits: 64,
                        signed: true,
                    }
                } else {
                    SemType::Int {
                        bits: 32,
                        signed: true,
                    }
                };
                let vt = val_type(&ty)?;
                let reg = self.builder.new_reg(vt);
                self.builder.push(Instr::Iconst {
                    dst: reg,
                    ty: vt,
                    value: *value as i64,
                });
                Ok(RValue::Scalar { reg, ty })
            }
            ExprKind::FloatLit { value, is_f32 } => {
                let ty = SemType::Float {
                    bits: if *is_f32 { 32 } else { 64 },
                };
                let vt = val_type(&ty)?;
                let reg = self.builder.new_reg(vt);
                self.builder.push(Instr::Fconst {
                    dst: reg,
                    ty: vt,
                    value: *value,
                });
                Ok(RValue::Scalar { reg, ty })
            }
            ExprKind::BoolLit(value) => {
                let reg = self.builder.new_reg(ValType::I8);
                self.builder.push(Instr::Iconst {
                    dst: reg,
                    ty: ValType::I8,
                    value: i64::from(*value),
                });
                Ok(RValue::Scalar {
                    reg,
                    ty: SemType::Bool,
                })
            }
            ExprKind::CharLit(value) => {
                let reg = self.builder.new_reg(ValType::I8);
                self.builder.push(Instr::Iconst {
                    dst: reg,
                    ty: ValType::I8,
                    value: i64::from(*value),
                });
                Ok(RValue::Scalar {
                    reg,
                    ty: SemType::Char,
                })
            }
            ExprKind::StrLit(value) => {
                let global = self.ml.intern_string_literal(value);
                let reg = self.builder.new_reg(ValType::Ptr);
                self.builder.push(Instr::SymbolAddr {
                    dst: reg,
                    symbol: SymbolRef::Global(global),
                });
                Ok(RValue::Scalar {
                    reg,
                    ty: SemType::Ptr(Box::new(SemType::Char)),
                })
            }
            ExprKind::Nullptr => {
                let reg = self.builder.new_reg(ValType::Ptr);
                self.builder.push(Instr::Iconst {
                    dst: reg,
                    ty: ValType::Ptr,
                    value: 0,
                });
                Ok(RValue::Scalar {
                    reg,
                    ty: SemType::Ptr(Box::new(SemType::Void)),
                })
            }
            ExprKind::This => {
                let Some(this) = self.this_reg else {
                    return Err(UdoError::invalid_user_code(format!(
                        "this used outside of a member function at {}",
                        expr.loc
                    )));
                };
                Ok(RValue::Scalar {
                    reg: this,
                    ty: SemType::Ptr(Box::new(SemType::Record(self.ml.operator))),
                })
            }
            ExprKind::Name(name) => {
                if name.len() == 1 {
                    if let Some(binding) = self.lookup(&name[0]).cloned() {
                        return self.load_binding(&binding);
                    }
                }
                if let Some(lvalue) = self.try_field_lvalue(name, expr.loc)? {
                    return self.load_lvalue(lvalue);
                }
                if let Some((global, sem)) = self.lookup_global(name) {
                    let addr = self.builder.new_reg(ValType::Ptr);
                    self.builder.push(Instr::SymbolAddr {
                        dst: addr,
                        symbol: SymbolRef::Global(global),
                    });
                    return self.load_lvalue(LValue {
                        addr,
                        offset: 0,
                        ty: sem,
                    });
                }
                Err(UdoError::invalid_user_code(format!(
                    "unknown identifier {} at {}",
                    qual_name_to_string(name),
                    expr.loc
                )))
            }
            ExprKind::Unary { op, operand } => self.lower_unary(*op, operand, expr.loc),
            ExprKind::PostIncDec { increment, operand } => {
                let lvalue = self.lower_lvalue(operand)?;
                let ty = lvalue.ty.clone();
                let old = self.load_lvalue(LValue {
                    addr: lvalue.addr,
                    offset: lvalue.offset,
                    ty: ty.clone(),
                })?;
                let RValue::Scalar { reg: old_reg, .. } = old else {
                    return Err(UdoError::invalid_user_code(format!(
                        "cannot increment a record at {}",
                        expr.loc
                    )));
                };
                let new_reg = self.step_scalar(old_reg, &ty, *increment, expr.loc)?;
                self.builder.push(Instr::Store {
                    ty: val_type(&ty)?,
                    addr: lvalue.addr,
                    offset: lvalue.offset,
                    value: new_reg,
                });
                Ok(RValue::Scalar { reg: old_reg, ty })
            }
            ExprKind::Binary { op, lhs, rhs } => self.lower_binary(*op, lhs, rhs, expr.loc),
            ExprKind::Assign { op, lhs, rhs } => {
                let lvalue = self.lower_lvalue(lhs)?;
                let ty = lvalue.ty.clone();

                let value = match op {
                    None => {
                        let value = self.lower_expr(rhs)?;
                        self.coerce(value, &ty, expr.loc)?
                    }
                    Some(op) => {
                        let current = self.load_lvalue(LValue {
                            addr: lvalue.addr,
                            offset: lvalue.offset,
                            ty: ty.clone(),
                        })?;
                        let rhs_value = self.lower_expr(rhs)?;
                        let combined =
                            self.apply_binary(*op, current, rhs_value, expr.loc)?;
                        self.coerce(combined, &ty, expr.loc)?
                    }
                };
                self.store_rvalue(value.clone(), lvalue.addr, lvalue.offset, &ty)?;
                Ok(value)
            }
            ExprKind::Member { .. } | ExprKind::Index { .. } => {
                let lvalue = self.lower_lvalue(expr)?;
                self.load_lvalue(lvalue)
            }
            ExprKind::Call { callee, args } => self.lower_call(callee, args, expr.loc),
            ExprKind::TemplateCall {
                name,
                type_arg,
                args,
            } => self.lower_emit_call(name, type_arg, args, expr.loc),
            ExprKind::AggregateInit { ty, args } => {
                let sem = self.ml.resolve_type(ty)?;
                let SemType::Record(record_id) = sem else {
                    return Err(UdoError::invalid_user_code(format!(
                        "aggregate initialization requires a record type at {}",
                        expr.loc
                    )));
                };
                let record = self.ml.types.record(record_id).clone();
                if args.len() > record.fields.len() {
                    return Err(UdoError::invalid_user_code(format!(
                        "too many initializers for {} at {}",
                        record.name, expr.loc
                    )));
                }

                let slot = self
                    .builder
                    .new_stack_slot(record.size as u32, record.align as u32);
                let addr = self.builder.new_reg(ValType::Ptr);
                self.builder.push(Instr::StackAddr { dst: addr, slot });

                // Zero the whole aggregate first; trailing fields without an
                // initializer are value-initialized.
                self.emit_memset_zero(addr, record.size)?;

                for (arg, field) in args.iter().zip(&record.fields) {
                    let value = self.lower_expr(arg)?;
                    let value = self.coerce(value, &field.ty, arg.loc)?;
                    self.store_rvalue(value, addr, field.offset as i32, &field.ty)?;
                }
                Ok(RValue::Aggregate {
                    addr,
                    ty: SemType::Record(record_id),
                })
            }
            ExprKind::Cast { ty, arg } => {
                let target = self.ml.resolve_type(ty)?;
                let value = self.lower_expr(arg)?;
                self.coerce(value, &target, expr.loc)
            }
        }
    }

    fn lower_unary(&mut self, op: UnaryOp, operand: &Expr, loc: SourceLoc) -> UdoResult<RValue> {
        match op {
            UnaryOp::AddrOf => {
                let lvalue = self.lower_lvalue(operand)?;
                let addr = self.addr_with_offset(lvalue.addr, lvalue.offset);
                Ok(RValue::Scalar {
                    reg: addr,
                    ty: SemType::Ptr(Box::new(lvalue.ty)),
                })
            }
            UnaryOp::Deref => {
                let lvalue = self.lower_lvalue_deref(operand, loc)?;
                self.load_lvalue(lvalue)
            }
            UnaryOp::PreInc | UnaryOp::PreDec => {
                let lvalue = self.lower_lvalue(operand)?;
                let ty = lvalue.ty.clone();
                let old = self.load_lvalue(LValue {
                    addr: lvalue.addr,
                    offset: lvalue.offset,
                    ty: ty.clone(),
                })?;
                let RValue::Scalar { reg: old_reg, .. } = old else {
                    return Err(UdoError::invalid_user_code(format!(
                        "cannot increment a record at {}",
                        loc
                    )));
                };
                let new_reg =
                    self.step_scalar(old_reg, &ty, op == UnaryOp::PreInc, loc)?;
                self.builder.push(Instr::Store {
                    ty: val_type(&ty)?,
                    addr: lvalue.addr,
                    offset: lvalue.offset,
                    value: new_reg,
                });
                Ok(RValue::Scalar { reg: new_reg, ty })
            }
            UnaryOp::Neg => {
                let value = self.lower_expr(operand)?;
                let RValue::Scalar { reg, ty } = value else {
                    return Err(UdoError::invalid_user_code(format!(
                        "cannot negate a record at {}",
                        loc
                    )));
                };
                let vt = val_type(&ty)?;
                let zero = self.builder.new_reg(vt);
                let dst = self.builder.new_reg(vt);
                if vt.is_float() {
                    self.builder.push(Instr::Fconst {
                        dst: zero,
                        ty: vt,
                        value: 0.0,
                    });
                } else {
                    self.builder.push(Instr::Iconst {
                        dst: zero,
                        ty: vt,
                        value: 0,
                    });
                }
                self.builder.push(Instr::Binary {
                    dst,
                    op: BinOp::Sub,
                    ty: vt,
                    lhs: zero,
                    rhs: reg,
                });
                Ok(RValue::Scalar { reg: dst, ty })
            }
            UnaryOp::Not => {
                let value = self.lower_expr(operand)?;
                let value = self.coerce(value, &SemType::Bool, loc)?;
                let RValue::Scalar { reg, .. } = value else {
                    unreachable!("bool coercion yields a scalar");
                };
                let zero = self.builder.new_reg(ValType::I8);
                self.builder.push(Instr::Iconst {
                    dst: zero,
                    ty: ValType::I8,
                    value: 0,
                });
                let dst = self.builder.new_reg(ValType::I8);
                self.builder.push(Instr::IntCmp {
                    dst,
                    cc: CmpCode::Eq,
                    signed: false,
                    ty: ValType::I8,
                    lhs: reg,
                    rhs: zero,
                });
                Ok(RValue::Scalar {
                    reg: dst,
                    ty: SemType::Bool,
                })
            }
            UnaryOp::BitNot => {
                let value = self.lower_expr(operand)?;
                let RValue::Scalar { reg, ty } = value else {
                    return Err(UdoError::invalid_user_code(format!(
                        "cannot complement a record at {}",
                        loc
                    )));
                };
                if !ty.is_integer() {
                    return Err(UdoError::invalid_user_code(format!(
                        "operator ~ requires an integer at {}",
                        loc
                    )));
                }
                let vt = val_type(&ty)?;
                let ones = self.builder.new_reg(vt);
                self.builder.push(Instr::Iconst {
                    dst: ones,
                    ty: vt,
                    value: -1,
                });
                let dst = self.builder.new_reg(vt);
                self.builder.push(Instr::Binary {
                    dst,
                    op: BinOp::Xor,
                    ty: vt,
                    lhs: reg,
                    rhs: ones,
                });
                Ok(RValue::Scalar { reg: dst, ty })
            }
        }
    }

    /// `++x` / `--x` / `x++` / `x--` on integers and pointers
    fn step_scalar(
        &mut self,
        reg: Reg,
        ty: &SemType,
        increment: bool,
        loc: SourceLoc,
    ) -> UdoResult<Reg> {
        let step: i64 = match ty {
            SemType::Ptr(pointee) => {
                let (size, _) = self.ml.types.size_align(pointee);
                size.max(1) as i64
            }
            ty if ty.is_integer() => 1,
            _ => {
                return Err(UdoError::invalid_user_code(format!(
                    "cannot increment this type at {}",
                    loc
                )))
            }
        };
        let vt = val_type(ty)?;
        let step_reg = self.builder.new_reg(vt);
        self.builder.push(Instr::Iconst {
            dst: step_reg,
            ty: vt,
            value: step,
        });
        let dst = self.builder.new_reg(vt);
        self.builder.push(Instr::Binary {
            dst,
            op: if increment { BinOp::Add } else { BinOp::Sub },
            ty: vt,
            lhs: reg,
            rhs: step_reg,
        });
        Ok(dst)
    }

    fn lower_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        loc: SourceLoc,
    ) -> UdoResult<RValue> {
        // Short-circuit forms get their own control flow
        if matches!(op, BinaryOp::LogAnd | BinaryOp::LogOr) {
            return self.lower_logical(op, lhs, rhs, loc);
        }
        let lhs_value = self.lower_expr(lhs)?;
        let rhs_value = self.lower_expr(rhs)?;
        self.apply_binary(op, lhs_value, rhs_value, loc)
    }

    fn lower_logical(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        _loc: SourceLoc,
    ) -> UdoResult<RValue> {
        // Evaluate into a slot so both paths store the result
        let slot = self.builder.new_stack_slot(1, 1);
        let addr = self.builder.new_reg(ValType::Ptr);
        self.builder.push(Instr::StackAddr { dst: addr, slot });

        let lhs_reg = self.lower_condition(lhs)?;
        self.builder.push(Instr::Store {
            ty: ValType::I8,
            addr,
            offset: 0,
            value: lhs_reg,
        });

        let rhs_label = self.builder.new_block();
        let merge_label = self.builder.new_block();
        match op {
            BinaryOp::LogAnd => self.builder.terminate(Terminator::Branch {
                cond: lhs_reg,
                then_label: rhs_label,
                else_label: merge_label,
            }),
            BinaryOp::LogOr => self.builder.terminate(Terminator::Branch {
                cond: lhs_reg,
                then_label: merge_label,
                else_label: rhs_label,
            }),
            _ => unreachable!("logical lowering only handles && and ||"),
        }

        self.builder.switch_to(rhs_label);
        let rhs_reg = self.lower_condition(rhs)?;
        self.builder.push(Instr::Store {
            ty: ValType::I8,
            addr,
            offset: 0,
            value: rhs_reg,
        });
        self.builder.terminate(Terminator::Jump(merge_label));

        self.builder.switch_to(merge_label);
        let result = self.builder.new_reg(ValType::I8);
        self.builder.push(Instr::Load {
            dst: result,
            ty: ValType::I8,
            addr,
            offset: 0,
        });
        Ok(RValue::Scalar {
            reg: result,
            ty: SemType::Bool,
        })
    }

    fn apply_binary(
        &mut self,
        op: BinaryOp,
        lhs: RValue,
        rhs: RValue,
        loc: SourceLoc,
    ) -> UdoResult<RValue> {
        let (RValue::Scalar { ty: lhs_ty, .. }, RValue::Scalar { ty: rhs_ty, .. }) = (&lhs, &rhs)
        else {
            return Err(UdoError::invalid_user_code(format!(
                "operator requires scalar operands at {}",
                loc
            )));
        };

        // Pointer arithmetic: ptr +/- int
        if let SemType::Ptr(pointee) = lhs_ty {
            if matches!(op, BinaryOp::Add | BinaryOp::Sub) && rhs_ty.is_integer() {
                let (elem_size, _) = self.ml.types.size_align(pointee);
                let ptr_ty = lhs_ty.clone();
                let rhs = self.coerce(
                    rhs,
                    &SemType::Int {
                        bits: 64,
                        signed: true,
                    },
                    loc,
                )?;
                let (RValue::Scalar { reg: ptr_reg, .. }, RValue::Scalar { reg: idx_reg, .. }) =
                    (&lhs, &rhs)
                else {
                    unreachable!("checked scalars above");
                };
                let size_reg = self.builder.new_reg(ValType::I64);
                self.builder.push(Instr::Iconst {
                    dst: size_reg,
                    ty: ValType::I64,
                    value: elem_size.max(1) as i64,
                });
                let scaled = self.builder.new_reg(ValType::I64);
                self.builder.push(Instr::Binary {
                    dst: scaled,
                    op: BinOp::Mul,
                    ty: ValType::I64,
                    lhs: *idx_reg,
                    rhs: size_reg,
                });
                let dst = self.builder.new_reg(ValType::Ptr);
                self.builder.push(Instr::Binary {
                    dst,
                    op: if op == BinaryOp::Add {
                        BinOp::Add
                    } else {
                        BinOp::Sub
                    },
                    ty: ValType::Ptr,
                    lhs: *ptr_reg,
                    rhs: scaled,
                });
                return Ok(RValue::Scalar {
                    reg: dst,
                    ty: ptr_ty,
                });
            }
        }

        let common = usual_arithmetic(lhs_ty, rhs_ty).ok_or_else(|| {
            UdoError::invalid_user_code(format!("incompatible operand types at {}", loc))
        })?;
        let lhs = self.coerce(lhs, &common, loc)?;
        let rhs = self.coerce(rhs, &common, loc)?;
        let (RValue::Scalar { reg: lhs_reg, .. }, RValue::Scalar { reg: rhs_reg, .. }) =
            (&lhs, &rhs)
        else {
            unreachable!("coercion to a scalar type yields scalars");
        };
        let (lhs_reg, rhs_reg) = (*lhs_reg, *rhs_reg);

        let vt = val_type(&common)?;
        let signed = matches!(common, SemType::Int { signed: true, .. })
            || matches!(common, SemType::Char);

        let comparison = |cc| Some(cc);
        let cmp = match op {
            BinaryOp::Eq => comparison(CmpCode::Eq),
            BinaryOp::Ne => comparison(CmpCode::Ne),
            BinaryOp::Lt => comparison(CmpCode::Lt),
            BinaryOp::Le => comparison(CmpCode::Le),
            BinaryOp::Gt => comparison(CmpCode::Gt),
            BinaryOp::Ge => comparison(CmpCode::Ge),
            _ => None,
        };
        if let Some(cc) = cmp {
            let dst = self.builder.new_reg(ValType::I8);
            if vt.is_float() {
                self.builder.push(Instr::FloatCmp {
                    dst,
                    cc,
                    ty: vt,
                    lhs: lhs_reg,
                    rhs: rhs_reg,
                });
            } else {
                self.builder.push(Instr::IntCmp {
                    dst,
                    cc,
                    signed,
                    ty: vt,
                    lhs: lhs_reg,
                    rhs: rhs_reg,
                });
            }
            return Ok(RValue::Scalar {
                reg: dst,
                ty: SemType::Bool,
            });
        }

        let bin_op = match op {
            BinaryOp::Add => BinOp::Add,
            BinaryOp::Sub => BinOp::Sub,
            BinaryOp::Mul => BinOp::Mul,
            BinaryOp::Div => BinOp::Div { signed },
            BinaryOp::Rem => {
                if vt.is_float() {
                    return Err(UdoError::invalid_user_code(format!(
                        "operator % requires integers at {}",
                        loc
                    )));
                }
                BinOp::Rem { signed }
            }
            BinaryOp::BitAnd => BinOp::And,
            BinaryOp::BitOr => BinOp::Or,
            BinaryOp::BitXor => BinOp::Xor,
            BinaryOp::Shl => BinOp::Shl,
            BinaryOp::Shr => BinOp::Shr { signed },
            _ => unreachable!("comparisons handled above"),
        };
        if !vt.is_float() && !common.is_integer() {
            return Err(UdoError::invalid_user_code(format!(
                "invalid operand types at {}",
                loc
            )));
        }
        let dst = self.builder.new_reg(vt);
        self.builder.push(Instr::Binary {
            dst,
            op: bin_op,
            ty: vt,
            lhs: lhs_reg,
            rhs: rhs_reg,
        });
        Ok(RValue::Scalar {
            reg: dst,
            ty: common,
        })
    }

    // === Calls ===

    fn lower_call(&mut self, callee: &Expr, args: &[Expr], loc: SourceLoc) -> UdoResult<RValue> {
        match &callee.kind {
            ExprKind::Name(name) => {
                let key = if name.len() == 1 {
                    name[0].clone()
                } else {
                    name.join("::")
                };
                let Some(info) = self.ml.functions.get(&key).cloned() else {
                    return Err(UdoError::invalid_user_code(format!(
                        "unknown function {} at {}",
                        qual_name_to_string(name),
                        loc
                    )));
                };
                let this = if info.is_method {
                    let Some(this) = self.this_reg else {
                        return Err(UdoError::invalid_user_code(format!(
                            "member function called without an object at {}",
                            loc
                        )));
                    };
                    Some(this)
                } else {
                    None
                };
                self.emit_call(&info, this, args, loc)
            }
            ExprKind::Member {
                base,
                member,
                arrow,
            } => {
                // Execution-state intrinsics
                let base_value = match (&base.kind, arrow) {
                    (ExprKind::This, _) => None,
                    _ => Some(self.lower_expr(base)?),
                };

                if let Some(RValue::ExecState { regs }) = &base_value {
                    return self.lower_exec_state_intrinsic(member, *regs, args, loc);
                }

                match base_value {
                    None | Some(RValue::Scalar { .. }) => {
                        // this->method(...) or operator-object method calls
                        let Some(info) = self.ml.functions.get(member).cloned() else {
                            return Err(UdoError::invalid_user_code(format!(
                                "unknown member function {} at {}",
                                member, loc
                            )));
                        };
                        if !info.is_method {
                            return Err(UdoError::invalid_user_code(format!(
                                "{} is not a member function at {}",
                                member, loc
                            )));
                        }
                        let this = match base_value {
                            None => self.this_reg.ok_or_else(|| {
                                UdoError::invalid_user_code(format!(
                                    "member function called without an object at {}",
                                    loc
                                ))
                            })?,
                            Some(RValue::Scalar { reg, ty }) => {
                                let SemType::Ptr(pointee) = &ty else {
                                    return Err(UdoError::invalid_user_code(format!(
                                        "member call on a non-object at {}",
                                        loc
                                    )));
                                };
                                if **pointee != SemType::Record(self.ml.operator) {
                                    return Err(UdoError::invalid_user_code(format!(
                                        "member calls are only supported on the UDO class at {}",
                                        loc
                                    )));
                                }
                                reg
                            }
                            _ => unreachable!("aggregate handled below"),
                        };
                        self.emit_call(&info, Some(this), args, loc)
                    }
                    Some(RValue::Aggregate { .. }) => Err(UdoError::invalid_user_code(format!(
                        "member calls are only supported on the UDO class at {}",
                        loc
                    ))),
                    Some(RValue::ExecState { .. }) => unreachable!("handled above"),
                }
            }
            _ => Err(UdoError::invalid_user_code(format!(
                "called expression is not a function at {}",
                loc
            ))),
        }
    }

    fn lower_exec_state_intrinsic(
        &mut self,
        member: &str,
        regs: (Reg, Reg),
        args: &[Expr],
        loc: SourceLoc,
    ) -> UdoResult<RValue> {
        if !args.is_empty() {
            return Err(UdoError::invalid_user_code(format!(
                "{} takes no arguments at {}",
                member, loc
            )));
        }
        match member {
            // The local-state pointer is the first leaf of the state record
            "getLocalState" => Ok(RValue::Scalar {
                reg: regs.0,
                ty: SemType::Ptr(Box::new(SemType::Void)),
            }),
            // The thread id is carried in the second leaf
            "getThreadId" => {
                let dst = self.builder.new_reg(ValType::I32);
                self.builder.push(Instr::Truncate {
                    dst,
                    to: ValType::I32,
                    src: regs.1,
                });
                Ok(RValue::Scalar {
                    reg: dst,
                    ty: SemType::Int {
                        bits: 32,
                        signed: false,
                    },
                })
            }
            _ => Err(UdoError::invalid_user_code(format!(
                "unknown ExecutionState member {} at {}",
                member, loc
            ))),
        }
    }

    fn emit_call(
        &mut self,
        info: &FnInfo,
        this: Option<Reg>,
        args: &[Expr],
        loc: SourceLoc,
    ) -> UdoResult<RValue> {
        if args.len() != info.params.len() {
            return Err(UdoError::invalid_user_code(format!(
                "wrong number of arguments at {}",
                loc
            )));
        }

        let mut abi_args: SmallVec<[Reg; 8]> = SmallVec::new();
        if let Some(this) = this {
            abi_args.push(this);
        }
        for (arg, param) in args.iter().zip(&info.params) {
            let value = self.lower_expr(arg)?;
            match param {
                ParamSem::ExecState => match value {
                    RValue::ExecState { regs } => {
                        abi_args.push(regs.0);
                        abi_args.push(regs.1);
                    }
                    _ => {
                        return Err(UdoError::invalid_user_code(format!(
                            "expected an ExecutionState argument at {}",
                            arg.loc
                        )))
                    }
                },
                ParamSem::Ref(sem) => {
                    let addr = self.rvalue_address(value, sem, arg.loc)?;
                    abi_args.push(addr);
                }
                ParamSem::Value(sem) => match sem {
                    SemType::Record(_) => {
                        let addr = self.rvalue_address(value, sem, arg.loc)?;
                        abi_args.push(addr);
                    }
                    other => {
                        let value = self.coerce(value, other, arg.loc)?;
                        let RValue::Scalar { reg, .. } = value else {
                            unreachable!("scalar coercion yields a scalar");
                        };
                        abi_args.push(reg);
                    }
                },
            }
        }

        let dst = match &info.ret {
            SemType::Void => None,
            other => Some(self.builder.new_reg(val_type(other)?)),
        };
        self.builder.push(Instr::Call {
            dst,
            callee: Callee::Func(info.id),
            args: abi_args,
        });
        match dst {
            None => Ok(self.unit_value()),
            Some(reg) => Ok(RValue::Scalar {
                reg,
                ty: info.ret.clone(),
            }),
        }
    }

    /// `emit<Class>(state, tuple)`
    fn lower_emit_call(
        &mut self,
        name: &[String],
        type_arg: &TypeRef,
        args: &[Expr],
        loc: SourceLoc,
    ) -> UdoResult<RValue> {
        if name.last().map(String::as_str) != Some("emit") {
            return Err(UdoError::invalid_user_code(format!(
                "unknown function template {} at {}",
                qual_name_to_string(name),
                loc
            )));
        }
        let arg_is_class = matches!(
            type_arg.without_const(),
            TypeRef::Named(n) if n.last().map(String::as_str) == Some(self.ml.operator_name)
        );
        if !arg_is_class {
            return Err(UdoError::invalid_user_code(
                "UDO does not call emit() or does not use its class type as template argument",
            ));
        }
        if args.len() != 2 {
            return Err(UdoError::invalid_user_code(format!(
                "emit() takes an execution state and an output tuple at {}",
                loc
            )));
        }

        let state = self.lower_expr(&args[0])?;
        let RValue::ExecState { regs } = state else {
            return Err(UdoError::invalid_user_code(format!(
                "the first argument of emit() must be the execution state at {}",
                args[0].loc
            )));
        };

        let output_tuple = self.ml.nested["OutputTuple"];
        let tuple = self.lower_expr(&args[1])?;
        let tuple_addr =
            self.rvalue_address(tuple, &SemType::Record(output_tuple), args[1].loc)?;

        let emit = self.ml.emit_func.expect("emit is declared before lowering");
        self.builder.push(Instr::Call {
            dst: None,
            callee: Callee::Func(emit),
            args: smallvec![regs.0, regs.1, tuple_addr],
        });
        Ok(self.unit_value())
    }

    // === Lvalues and memory ===

    fn lower_lvalue(&mut self, expr: &Expr) -> UdoResult<LValue> {
        match &expr.kind {
            ExprKind::Name(name) => {
                if name.len() == 1 {
                    if let Some(binding) = self.lookup(&name[0]).cloned() {
                        return self.binding_lvalue(&binding, expr.loc);
                    }
                }
                if let Some(lvalue) = self.try_field_lvalue(name, expr.loc)? {
                    return Ok(lvalue);
                }
                if let Some((global, sem)) = self.lookup_global(name) {
                    let addr = self.builder.new_reg(ValType::Ptr);
                    self.builder.push(Instr::SymbolAddr {
                        dst: addr,
                        symbol: SymbolRef::Global(global),
                    });
                    return Ok(LValue {
                        addr,
                        offset: 0,
                        ty: sem,
                    });
                }
                Err(UdoError::invalid_user_code(format!(
                    "unknown identifier {} at {}",
                    qual_name_to_string(name),
                    expr.loc
                )))
            }
            ExprKind::Member {
                base,
                member,
                arrow,
            } => {
                let (base_addr, base_offset, record_id) = self.member_base(base, *arrow, expr.loc)?;
                let record = self.ml.types.record(record_id);
                let Some(field) = record.fields.iter().find(|f| f.name == *member) else {
                    return Err(UdoError::invalid_user_code(format!(
                        "no field {} in {} at {}",
                        member, record.name, expr.loc
                    )));
                };
                Ok(LValue {
                    addr: base_addr,
                    offset: base_offset + field.offset as i32,
                    ty: field.ty.clone(),
                })
            }
            ExprKind::Index { base, index } => {
                let base_value = self.lower_expr(base)?;
                let RValue::Scalar { reg: base_reg, ty } = base_value else {
                    return Err(UdoError::invalid_user_code(format!(
                        "subscript requires a pointer at {}",
                        expr.loc
                    )));
                };
                let SemType::Ptr(pointee) = ty else {
                    return Err(UdoError::invalid_user_code(format!(
                        "subscript requires a pointer at {}",
                        expr.loc
                    )));
                };
                let (elem_size, _) = self.ml.types.size_align(&pointee);
                let index_value = self.lower_expr(index)?;
                let index_value = self.coerce(
                    index_value,
                    &SemType::Int {
                        bits: 64,
                        signed: true,
                    },
                    expr.loc,
                )?;
                let RValue::Scalar { reg: idx_reg, .. } = index_value else {
                    unreachable!("int coercion yields a scalar");
                };
                let size_reg = self.builder.new_reg(ValType::I64);
                self.builder.push(Instr::Iconst {
                    dst: size_reg,
                    ty: ValType::I64,
                    value: elem_size.max(1) as i64,
                });
                let scaled = self.builder.new_reg(ValType::I64);
                self.builder.push(Instr::Binary {
                    dst: scaled,
                    op: BinOp::Mul,
                    ty: ValType::I64,
                    lhs: idx_reg,
                    rhs: size_reg,
                });
                let addr = self.builder.new_reg(ValType::Ptr);
                self.builder.push(Instr::Binary {
                    dst: addr,
                    op: BinOp::Add,
                    ty: ValType::Ptr,
                    lhs: base_reg,
                    rhs: scaled,
                });
                Ok(LValue {
                    addr,
                    offset: 0,
                    ty: (*pointee).clone(),
                })
            }
            ExprKind::Unary {
                op: UnaryOp::Deref,
                operand,
            } => self.lower_lvalue_deref(operand, expr.loc),
            _ => Err(UdoError::invalid_user_code(format!(
                "expression is not assignable at {}",
                expr.loc
            ))),
        }
    }

    fn lower_lvalue_deref(&mut self, operand: &Expr, loc: SourceLoc) -> UdoResult<LValue> {
        let value = self.lower_expr(operand)?;
        let RValue::Scalar { reg, ty } = value else {
            return Err(UdoError::invalid_user_code(format!(
                "cannot dereference this expression at {}",
                loc
            )));
        };
        let SemType::Ptr(pointee) = ty else {
            return Err(UdoError::invalid_user_code(format!(
                "cannot dereference a non-pointer at {}",
                loc
            )));
        };
        Ok(LValue {
            addr: reg,
            offset: 0,
            ty: *pointee,
        })
    }

    /// Resolve the base of a member access to (address, offset, record)
    fn member_base(
        &mut self,
        base: &Expr,
        arrow: bool,
        loc: SourceLoc,
    ) -> UdoResult<(Reg, i32, RecordId)> {
        if matches!(base.kind, ExprKind::This) {
            let Some(this) = self.this_reg else {
                return Err(UdoError::invalid_user_code(format!(
                    "this used outside of a member function at {}",
                    loc
                )));
            };
            return Ok((this, 0, self.ml.operator));
        }

        if arrow {
            let value = self.lower_expr(base)?;
            let RValue::Scalar { reg, ty } = value else {
                return Err(UdoError::invalid_user_code(format!(
                    "-> requires a pointer at {}",
                    loc
                )));
            };
            let SemType::Ptr(pointee) = ty else {
                return Err(UdoError::invalid_user_code(format!(
                    "-> requires a pointer at {}",
                    loc
                )));
            };
            let SemType::Record(record) = *pointee else {
                return Err(UdoError::invalid_user_code(format!(
                    "-> requires a pointer to a record at {}",
                    loc
                )));
            };
            return Ok((reg, 0, record));
        }

        // Dot access: the base must be addressable or an aggregate value
        match &base.kind {
            ExprKind::AggregateInit { .. } | ExprKind::Call { .. } => {
                let value = self.lower_expr(base)?;
                match value {
                    RValue::Aggregate { addr, ty } => {
                        let SemType::Record(record) = ty else {
                            unreachable!("aggregates are records");
                        };
                        Ok((addr, 0, record))
                    }
                    _ => Err(UdoError::invalid_user_code(format!(
                        "member access requires a record at {}",
                        loc
                    ))),
                }
            }
            _ => {
                let lvalue = self.lower_lvalue(base)?;
                let SemType::Record(record) = lvalue.ty else {
                    return Err(UdoError::invalid_user_code(format!(
                        "member access requires a record at {}",
                        loc
                    )));
                };
                Ok((lvalue.addr, lvalue.offset, record))
            }
        }
    }

    /// Implicit `this->field` access for unqualified names
    fn try_field_lvalue(&mut self, name: &[String], _loc: SourceLoc) -> UdoResult<Option<LValue>> {
        if name.len() != 1 {
            return Ok(None);
        }
        let Some(this) = self.this_reg else {
            return Ok(None);
        };
        let Some(field) = self
            .ml
            .operator_fields
            .iter()
            .find(|f| f.name == name[0])
        else {
            return Ok(None);
        };
        Ok(Some(LValue {
            addr: this,
            offset: field.offset as i32,
            ty: field.ty.clone(),
        }))
    }

    fn lookup_global(&self, name: &[String]) -> Option<(ir::GlobalId, SemType)> {
        let key = if name.len() == 1 {
            name[0].clone()
        } else {
            name.join("::")
        };
        self.ml.globals.get(&key).cloned()
    }

    fn binding_lvalue(&mut self, binding: &Binding, loc: SourceLoc) -> UdoResult<LValue> {
        match binding {
            Binding::Slot { slot, ty } => {
                let addr = self.builder.new_reg(ValType::Ptr);
                self.builder.push(Instr::StackAddr { dst: addr, slot: *slot });
                Ok(LValue {
                    addr,
                    offset: 0,
                    ty: ty.clone(),
                })
            }
            Binding::RefParam { reg, ty } => Ok(LValue {
                addr: *reg,
                offset: 0,
                ty: ty.clone(),
            }),
            Binding::ExecState { .. } => Err(UdoError::invalid_user_code(format!(
                "the execution state is not assignable at {}",
                loc
            ))),
        }
    }

    fn load_binding(&mut self, binding: &Binding) -> UdoResult<RValue> {
        match binding {
            Binding::ExecState { regs } => Ok(RValue::ExecState { regs: *regs }),
            Binding::Slot { .. } | Binding::RefParam { .. } => {
                let lvalue = self.binding_lvalue(binding, SourceLoc::default())?;
                self.load_lvalue(lvalue)
            }
        }
    }

    fn load_lvalue(&mut self, lvalue: LValue) -> UdoResult<RValue> {
        match &lvalue.ty {
            SemType::Record(id) if Some(*id) == Some(self.ml.exec_state) => {
                // An execution state stored in memory: reload its two leaves
                let a = self.builder.new_reg(ValType::Ptr);
                let b = self.builder.new_reg(ValType::Ptr);
                self.builder.push(Instr::Load {
                    dst: a,
                    ty: ValType::Ptr,
                    addr: lvalue.addr,
                    offset: lvalue.offset,
                });
                self.builder.push(Instr::Load {
                    dst: b,
                    ty: ValType::Ptr,
                    addr: lvalue.addr,
                    offset: lvalue.offset + 8,
                });
                Ok(RValue::ExecState { regs: (a, b) })
            }
            SemType::Record(_) => {
                let addr = self.addr_with_offset(lvalue.addr, lvalue.offset);
                Ok(RValue::Aggregate {
                    addr,
                    ty: lvalue.ty,
                })
            }
            other => {
                let vt = val_type(other)?;
                let dst = self.builder.new_reg(vt);
                self.builder.push(Instr::Load {
                    dst,
                    ty: vt,
                    addr: lvalue.addr,
                    offset: lvalue.offset,
                });
                Ok(RValue::Scalar {
                    reg: dst,
                    ty: lvalue.ty,
                })
            }
        }
    }

    fn addr_with_offset(&mut self, addr: Reg, offset: i32) -> Reg {
        if offset == 0 {
            return addr;
        }
        let off = self.builder.new_reg(ValType::I64);
        self.builder.push(Instr::Iconst {
            dst: off,
            ty: ValType::I64,
            value: i64::from(offset),
        });
        let dst = self.builder.new_reg(ValType::Ptr);
        self.builder.push(Instr::Binary {
            dst,
            op: BinOp::Add,
            ty: ValType::Ptr,
            lhs: addr,
            rhs: off,
        });
        dst
    }

    /// The address of an rvalue of record type, materializing temporaries
    fn rvalue_address(&mut self, value: RValue, expected: &SemType, loc: SourceLoc) -> UdoResult<Reg> {
        match value {
            RValue::Aggregate { addr, ty } => {
                if ty != *expected {
                    return Err(UdoError::invalid_user_code(format!(
                        "mismatched record type at {}",
                        loc
                    )));
                }
                Ok(addr)
            }
            RValue::Scalar { reg, ty } => {
                // A scalar where a const reference is expected: spill
                if ty != *expected {
                    let coerced = self.coerce(RValue::Scalar { reg, ty }, expected, loc)?;
                    let RValue::Scalar { reg, .. } = coerced else {
                        return Err(UdoError::invalid_user_code(format!(
                            "expected a record argument at {}",
                            loc
                        )));
                    };
                    return self.spill_scalar(reg, expected);
                }
                self.spill_scalar(reg, &ty)
            }
            RValue::ExecState { .. } => Err(UdoError::invalid_user_code(format!(
                "expected a record argument at {}",
                loc
            ))),
        }
    }

    fn spill_scalar(&mut self, reg: Reg, ty: &SemType) -> UdoResult<Reg> {
        let (size, align) = self.ml.types.size_align(ty);
        let slot = self.builder.new_stack_slot(size as u32, align as u32);
        let addr = self.builder.new_reg(ValType::Ptr);
        self.builder.push(Instr::StackAddr { dst: addr, slot });
        self.builder.push(Instr::Store {
            ty: val_type(ty)?,
            addr,
            offset: 0,
            value: reg,
        });
        Ok(addr)
    }

    fn store_rvalue(
        &mut self,
        value: RValue,
        addr: Reg,
        offset: i32,
        ty: &SemType,
    ) -> UdoResult<()> {
        match value {
            RValue::Scalar { reg, .. } => {
                self.builder.push(Instr::Store {
                    ty: val_type(ty)?,
                    addr,
                    offset,
                    value: reg,
                });
                Ok(())
            }
            RValue::Aggregate { addr: src, ty: src_ty } => {
                let (size, _) = self.ml.types.size_align(&src_ty);
                let dst = self.addr_with_offset(addr, offset);
                self.emit_memcpy(dst, src, size)
            }
            RValue::ExecState { regs } => {
                self.builder.push(Instr::Store {
                    ty: ValType::Ptr,
                    addr,
                    offset,
                    value: regs.0,
                });
                self.builder.push(Instr::Store {
                    ty: ValType::Ptr,
                    addr,
                    offset: offset + 8,
                    value: regs.1,
                });
                Ok(())
            }
        }
    }

    fn store_into_field(&mut self, field_name: &str, init: &Expr) -> UdoResult<()> {
        let Some(lvalue) = self.try_field_lvalue(&[field_name.to_string()], init.loc)? else {
            return Err(UdoError::invalid_user_code(format!(
                "unknown field {} in member initializer at {}",
                field_name, init.loc
            )));
        };
        let ty = lvalue.ty.clone();
        let value = self.lower_expr(init)?;
        let value = self.coerce(value, &ty, init.loc)?;
        self.store_rvalue(value, lvalue.addr, lvalue.offset, &ty)
    }

    fn zero_field(&mut self, field_name: &str, loc: SourceLoc) -> UdoResult<()> {
        let Some(lvalue) = self.try_field_lvalue(&[field_name.to_string()], loc)? else {
            return Err(UdoError::invalid_user_code(format!(
                "unknown field {} in member initializer at {}",
                field_name, loc
            )));
        };
        let (size, _) = self.ml.types.size_align(&lvalue.ty);
        let addr = self.addr_with_offset(lvalue.addr, lvalue.offset);
        self.emit_memset_zero(addr, size)
    }

    fn emit_memcpy(&mut self, dst: Reg, src: Reg, size: u64) -> UdoResult<()> {
        let size_reg = self.builder.new_reg(ValType::I64);
        self.builder.push(Instr::Iconst {
            dst: size_reg,
            ty: ValType::I64,
            value: size as i64,
        });
        self.builder.push(Instr::Call {
            dst: None,
            callee: Callee::External {
                name: "memcpy".into(),
                sig: ir::Signature::new([ValType::Ptr, ValType::Ptr, ValType::I64], None),
            },
            args: smallvec![dst, src, size_reg],
        });
        Ok(())
    }

    fn emit_memset_zero(&mut self, dst: Reg, size: u64) -> UdoResult<()> {
        let zero = self.builder.new_reg(ValType::I32);
        self.builder.push(Instr::Iconst {
            dst: zero,
            ty: ValType::I32,
            value: 0,
        });
        let size_reg = self.builder.new_reg(ValType::I64);
        self.builder.push(Instr::Iconst {
            dst: size_reg,
            ty: ValType::I64,
            value: size as i64,
        });
        self.builder.push(Instr::Call {
            dst: None,
            callee: Callee::External {
                name: "memset".into(),
                sig: ir::Signature::new([ValType::Ptr, ValType::I32, ValType::I64], None),
            },
            args: smallvec![dst, zero, size_reg],
        });
        Ok(())
    }

    fn unit_value(&mut self) -> RValue {
        let reg = self.builder.new_reg(ValType::I8);
        self.builder.push(Instr::Iconst {
            dst: reg,
            ty: ValType::I8,
            value: 0,
        });
        RValue::Scalar {
            reg,
            ty: SemType::Void,
        }
    }

    // === Conversions ===

    fn coerce(&mut self, value: RValue, target: &SemType, loc: SourceLoc) -> UdoResult<RValue> {
        let source = value.sem_type(self.ml.exec_state);
        if source == *target {
            return Ok(value);
        }

        let RValue::Scalar { reg, ty } = value else {
            return Err(UdoError::invalid_user_code(format!(
                "cannot convert this value at {}",
                loc
            )));
        };

        // Pointers convert freely among themselves (void* interop)
        if matches!(ty, SemType::Ptr(_)) && matches!(target, SemType::Ptr(_)) {
            return Ok(RValue::Scalar {
                reg,
                ty: target.clone(),
            });
        }

        let from_vt = val_type(&ty)?;
        let to_vt = val_type(target)?;

        // Anything to bool: compare against zero
        if *target == SemType::Bool {
            let dst = self.builder.new_reg(ValType::I8);
            if from_vt.is_float() {
                let zero = self.builder.new_reg(from_vt);
                self.builder.push(Instr::Fconst {
                    dst: zero,
                    ty: from_vt,
                    value: 0.0,
                });
                self.builder.push(Instr::FloatCmp {
                    dst,
                    cc: CmpCode::Ne,
                    ty: from_vt,
                    lhs: reg,
                    rhs: zero,
                });
            } else {
                let zero = self.builder.new_reg(from_vt);
                self.builder.push(Instr::Iconst {
                    dst: zero,
                    ty: from_vt,
                    value: 0,
                });
                self.builder.push(Instr::IntCmp {
                    dst,
                    cc: CmpCode::Ne,
                    signed: false,
                    ty: from_vt,
                    lhs: reg,
                    rhs: zero,
                });
            }
            return Ok(RValue::Scalar {
                reg: dst,
                ty: SemType::Bool,
            });
        }

        let src_signed = matches!(ty, SemType::Int { signed: true, .. } | SemType::Char);
        let dst = self.builder.new_reg(to_vt);

        match (from_vt.is_float(), to_vt.is_float()) {
            (false, false) => {
                if to_vt.bytes() > from_vt.bytes() {
                    self.builder.push(Instr::Extend {
                        dst,
                        to: to_vt,
                        from: from_vt,
                        src: reg,
                        signed: src_signed,
                    });
                } else if to_vt.bytes() < from_vt.bytes() {
                    self.builder.push(Instr::Truncate {
                        dst,
                        to: to_vt,
                        src: reg,
                    });
                } else {
                    // Same width, only the semantic type changes
                    return Ok(RValue::Scalar {
                        reg,
                        ty: target.clone(),
                    });
                }
            }
            (false, true) => {
                self.builder.push(Instr::IntToFloat {
                    dst,
                    to: to_vt,
                    from: from_vt,
                    src: reg,
                    signed: src_signed,
                });
            }
            (true, false) => {
                let target_signed = matches!(target, SemType::Int { signed: true, .. });
                self.builder.push(Instr::FloatToInt {
                    dst,
                    to: to_vt,
                    src: reg,
                    signed: target_signed,
                });
            }
            (true, true) => {
                self.builder.push(Instr::FloatConvert {
                    dst,
                    to: to_vt,
                    src: reg,
                });
            }
        }
        Ok(RValue::Scalar {
            reg: dst,
            ty: target.clone(),
        })
    }
}

// === Free helpers ===

/// Register type of a scalar semantic type
fn val_type(sem: &SemType) -> UdoResult<ValType> {
    match sem {
        SemType::Bool | SemType::Char => Ok(ValType::I8),
        SemType::Int { bits: 8, .. } => Ok(ValType::I8),
        SemType::Int { bits: 16, .. } => Ok(ValType::I16),
        SemType::Int { bits: 32, .. } => Ok(ValType::I32),
        SemType::Int { bits: 64, .. } => Ok(ValType::I64),
        SemType::Float { bits: 32 } => Ok(ValType::F32),
        SemType::Float { bits: 64 } => Ok(ValType::F64),
        SemType::Ptr(_) => Ok(ValType::Ptr),
        SemType::LongDouble => Err(UdoError::invalid_user_code(
            "long double is not supported in UDO code",
        )),
        SemType::Void | SemType::Record(_) | SemType::Int { .. } | SemType::Float { .. } => Err(
            UdoError::invalid_user_code("expected a scalar value in this context"),
        ),
    }
}

/// The usual arithmetic conversions, reduced to the subset's types
fn usual_arithmetic(lhs: &SemType, rhs: &SemType) -> Option<SemType> {
    // Pointer comparisons
    if matches!(lhs, SemType::Ptr(_)) && matches!(rhs, SemType::Ptr(_)) {
        return Some(lhs.clone());
    }
    if !(lhs.is_integer() || lhs.is_float()) || !(rhs.is_integer() || rhs.is_float()) {
        return None;
    }

    if let (SemType::Float { bits: a }, SemType::Float { bits: b }) = (lhs, rhs) {
        return Some(SemType::Float { bits: *a.max(b) });
    }
    if let SemType::Float { .. } = lhs {
        return Some(lhs.clone());
    }
    if let SemType::Float { .. } = rhs {
        return Some(rhs.clone());
    }

    let widen = |ty: &SemType| -> (u8, bool) {
        match ty {
            SemType::Bool => (32, true),
            SemType::Char => (32, true),
            SemType::Int { bits, signed } => ((*bits).max(32), *signed || *bits < 32),
            _ => (32, true),
        }
    };
    let (lhs_bits, lhs_signed) = widen(lhs);
    let (rhs_bits, rhs_signed) = widen(rhs);
    let bits = lhs_bits.max(rhs_bits);
    // If either side is unsigned at the common width, the result is unsigned
    let signed = if lhs_bits == rhs_bits {
        lhs_signed && rhs_signed
    } else if lhs_bits > rhs_bits {
        lhs_signed
    } else {
        rhs_signed
    };
    Some(SemType::Int { bits, signed })
}

/// Constant value of a global initializer
#[derive(Debug, Clone, Copy)]
pub(crate) enum ConstVal {
    Int(i64),
    Float(f64),
}

/// Evaluate a constant expression, or `None` when it needs runtime code
pub(crate) fn const_eval(expr: &Expr) -> Option<ConstVal> {
    match &expr.kind {
        ExprKind::IntLit(value) => Some(ConstVal::Int(*value as i64)),
        ExprKind::FloatLit { value, .. } => Some(ConstVal::Float(*value)),
        ExprKind::BoolLit(value) => Some(ConstVal::Int(i64::from(*value))),
        ExprKind::CharLit(value) => Some(ConstVal::Int(i64::from(*value))),
        ExprKind::Nullptr => Some(ConstVal::Int(0)),
        ExprKind::Unary {
            op: UnaryOp::Neg,
            operand,
        } => match const_eval(operand)? {
            ConstVal::Int(v) => Some(ConstVal::Int(v.wrapping_neg())),
            ConstVal::Float(v) => Some(ConstVal::Float(-v)),
        },
        ExprKind::Binary { op, lhs, rhs } => {
            let lhs = const_eval(lhs)?;
            let rhs = const_eval(rhs)?;
            match (lhs, rhs) {
                (ConstVal::Int(a), ConstVal::Int(b)) => {
                    let v = match op {
                        BinaryOp::Add => a.wrapping_add(b),
                        BinaryOp::Sub => a.wrapping_sub(b),
                        BinaryOp::Mul => a.wrapping_mul(b),
                        BinaryOp::Div if b != 0 => a.wrapping_div(b),
                        BinaryOp::Rem if b != 0 => a.wrapping_rem(b),
                        BinaryOp::BitAnd => a & b,
                        BinaryOp::BitOr => a | b,
                        BinaryOp::BitXor => a ^ b,
                        BinaryOp::Shl => a.wrapping_shl(b as u32),
                        BinaryOp::Shr => a.wrapping_shr(b as u32),
                        _ => return None,
                    };
                    Some(ConstVal::Int(v))
                }
                _ => None,
            }
        }
        ExprKind::Cast { arg, .. } => const_eval(arg),
        _ => None,
    }
}

/// Encode a constant as initializer bytes of the given size
pub(crate) fn const_bytes(sem: &SemType, value: ConstVal, size: u64) -> UdoResult<Vec<u8>> {
    let mut bytes = vec![0u8; size as usize];
    match (sem, value) {
        (SemType::Float { bits: 32 }, ConstVal::Float(v)) => {
            bytes.copy_from_slice(&(v as f32).to_le_bytes())
        }
        (SemType::Float { bits: 64 }, ConstVal::Float(v)) => {
            bytes.copy_from_slice(&v.to_le_bytes())
        }
        (SemType::Float { bits: 32 }, ConstVal::Int(v)) => {
            bytes.copy_from_slice(&(v as f32).to_le_bytes())
        }
        (SemType::Float { bits: 64 }, ConstVal::Int(v)) => {
            bytes.copy_from_slice(&(v as f64).to_le_bytes())
        }
        (_, ConstVal::Int(v)) => {
            let le = v.to_le_bytes();
            let len = bytes.len().min(8);
            bytes[..len].copy_from_slice(&le[..len]);
        }
        (_, ConstVal::Float(_)) => {
            return Err(UdoError::invalid_user_code(
                "cannot initialize an integer with a floating-point constant",
            ))
        }
    }
    Ok(bytes)
}
