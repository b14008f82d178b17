//! Semantic analysis of UDO source
//!
//! Drives the frontend over the runtime header plus the user source and
//! collects the complete analysis: the operator class and its layout, the
//! tuple types and output schema, the lifecycle member functions with their
//! signature contracts enforced, the constructor/destructor, and the lowered
//! IR module for everything with a body.
//!
//! The declaration walk is a match on the declaration variant per kind
//! (namespace, record, function, global) instead of a visitor object.

pub mod types;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::{UdoError, UdoResult};
use crate::frontend;
use crate::frontend::ast::*;
use crate::ir;
use crate::lower::{self, ParamSem};
use crate::runtime_header::RUNTIME_HEADER;

use types::{prim_to_sem, FieldInfo, RecordId, SemType, TypeTable};

/// An output attribute of the UDO
#[derive(Debug, Clone)]
pub struct OutputAttr {
    pub name: String,
    pub ty: SemType,
}

/// The result of analyzing a UDO
pub struct UdoAnalysis {
    /// The record arena
    pub types: TypeTable,
    /// The distinguished string record of the runtime header
    pub string_record: Option<RecordId>,
    /// The execution-state record
    pub execution_state: RecordId,
    /// The user operator class
    pub operator_record: RecordId,
    /// The nested tuple records
    pub input_tuple: RecordId,
    pub output_tuple: RecordId,
    /// The output schema in declaration order
    pub output: SmallVec<[OutputAttr; 8]>,
    /// Fields of the input tuple (empty when the UDO consumes no tuples)
    pub input: SmallVec<[OutputAttr; 8]>,
    /// The unqualified name of the operator class
    pub name: String,
    /// Object size and alignment of the operator class
    pub size: u64,
    pub alignment: u64,
    /// Scalar constructor arguments in declaration order
    pub constructor_args: Vec<SemType>,

    /// The lowered module
    pub module: ir::Module,
    /// Function references; `None` when the member is absent
    pub constructor: Option<ir::FuncId>,
    pub destructor: Option<ir::FuncId>,
    pub accept: Option<ir::FuncId>,
    pub extra_work: Option<ir::FuncId>,
    pub process: Option<ir::FuncId>,
    /// The emit entry; its trampoline body is supplied by the preprocessor
    pub emit: ir::FuncId,
    /// The runtime callback entries
    pub print_debug: ir::FuncId,
    pub get_random: ir::FuncId,

    /// Is emit reachable from accept / from process?
    pub emit_in_accept: bool,
    pub emit_in_process: bool,

    /// Buffered analysis warnings
    pub warnings: Vec<String>,
}

/// The analyzer for UDO source
pub struct UdoAnalyzer {
    source: String,
    class_name: String,
}

impl UdoAnalyzer {
    pub fn new(source: impl Into<String>, class_name: impl Into<String>) -> Self {
        UdoAnalyzer {
            source: source.into(),
            class_name: class_name.into(),
        }
    }

    /// Run the analysis
    pub fn analyze(&self) -> UdoResult<UdoAnalysis> {
        let prelude = frontend::parse(RUNTIME_HEADER)
            .map_err(|e| UdoError::compile(format!("runtime header failed to parse: {}", e)))?;
        let user = frontend::parse(&self.source)?;

        let mut sema = Sema::new(&self.class_name);
        sema.collect_prelude(&prelude)?;
        sema.collect_user(&user)?;
        sema.finish()
    }
}

/// A user-provided member function together with its resolved signature
struct FoundMethod<'a> {
    decl: &'a MethodDecl,
    params: Vec<ParamSem>,
    ret: SemType,
}

struct Sema<'a> {
    /// The qualified name components of the class to look for
    class_path: Vec<String>,

    types: TypeTable,
    /// Joined qualified name -> record
    records: FxHashMap<String, RecordId>,

    // Entities from the runtime header
    string_record: Option<RecordId>,
    execution_state: Option<RecordId>,
    udoperator: Option<RecordId>,
    has_emit_template: bool,
    has_print_debug: bool,
    has_get_random: bool,

    // The located user class
    operator_decl: Option<&'a RecordDecl>,
    operator_record: Option<RecordId>,
    /// Class-scope record names (nested records)
    nested: FxHashMap<String, RecordId>,
    operator_fields: Vec<FieldInfo>,

    // User declarations to lower
    user_globals: Vec<&'a GlobalDecl>,
    user_functions: Vec<&'a FunctionDecl>,

    warnings: Vec<String>,
}

impl<'a> Sema<'a> {
    fn new(class_name: &str) -> Self {
        Sema {
            class_path: class_name.split("::").map(str::to_string).collect(),
            types: TypeTable::new(),
            records: FxHashMap::default(),
            string_record: None,
            execution_state: None,
            udoperator: None,
            has_emit_template: false,
            has_print_debug: false,
            has_get_random: false,
            operator_decl: None,
            operator_record: None,
            nested: FxHashMap::default(),
            operator_fields: Vec::new(),
            user_globals: Vec::new(),
            user_functions: Vec::new(),
            warnings: Vec::new(),
        }
    }

    // === Runtime header ===

    fn collect_prelude(&mut self, unit: &TranslationUnit) -> UdoResult<()> {
        for decl in &unit.decls {
            let Decl::Namespace(ns) = decl else { continue };
            if ns.name != "udo" {
                continue;
            }
            for decl in &ns.decls {
                match decl {
                    Decl::Record(record) => self.collect_prelude_record(record)?,
                    Decl::Function(func) => match func.name.as_str() {
                        "printDebug" => {
                            if self.has_print_debug {
                                return Err(UdoError::invalid_user_code(
                                    "unexpected declaration of printDebug",
                                ));
                            }
                            self.has_print_debug = true;
                        }
                        "getRandom" => {
                            if self.has_get_random {
                                return Err(UdoError::invalid_user_code(
                                    "unexpected declaration of getRandom",
                                ));
                            }
                            self.has_get_random = true;
                        }
                        _ => {}
                    },
                    _ => {}
                }
            }
        }

        debug_assert!(self.execution_state.is_some(), "runtime header incomplete");
        Ok(())
    }

    fn collect_prelude_record(&mut self, record: &RecordDecl) -> UdoResult<()> {
        let qualified = format!("udo::{}", record.name);
        match record.name.as_str() {
            "String" | "ExecutionState" => {
                let mut fields = Vec::new();
                for member in &record.members {
                    if let Member::Field(field) = member {
                        let ty = self.resolve_type_in(&field.ty, None)?;
                        fields.push((field.name.clone(), ty));
                    }
                }
                let info = self.types.layout(&record.name, fields);
                let id = self.types.add(info);
                self.records.insert(qualified, id);
                if record.name == "String" {
                    self.string_record = Some(id);
                } else {
                    self.execution_state = Some(id);
                }
            }
            "UDOperator" => {
                let info = self.types.layout("UDOperator", Vec::new());
                let id = self.types.add(info);
                self.records.insert(qualified, id);
                self.udoperator = Some(id);
                self.has_emit_template = record.members.iter().any(|m| {
                    matches!(m, Member::Method(method)
                        if method.name == "emit" && method.template_param.is_some())
                });
            }
            _ => {}
        }
        Ok(())
    }

    // === User source ===

    fn collect_user(&mut self, unit: &'a TranslationUnit) -> UdoResult<()> {
        self.walk_decls(&unit.decls, &mut Vec::new())?;
        Ok(())
    }

    fn walk_decls(&mut self, decls: &'a [Decl], path: &mut Vec<String>) -> UdoResult<()> {
        for decl in decls {
            match decl {
                Decl::Namespace(ns) => {
                    if ns.name == "udo" {
                        // Re-declaring the runtime namespace is not allowed
                        return Err(UdoError::invalid_user_code(
                            "the udo namespace is reserved for the runtime header",
                        ));
                    }
                    path.push(ns.name.clone());
                    self.walk_decls(&ns.decls, path)?;
                    path.pop();
                }
                Decl::Record(record) => self.handle_record(record, path)?,
                Decl::Function(func) => self.user_functions.push(func),
                Decl::Global(global) => self.user_globals.push(global),
            }
        }
        Ok(())
    }

    fn handle_record(&mut self, record: &'a RecordDecl, path: &[String]) -> UdoResult<()> {
        let matches_class = path.len() + 1 == self.class_path.len()
            && self
                .class_path
                .iter()
                .zip(path.iter().chain(std::iter::once(&record.name)))
                .all(|(a, b)| a == b);

        if matches_class && self.operator_decl.is_none() {
            return self.handle_operator_class(record, path);
        }

        // A plain record usable as a field type
        let mut fields = Vec::new();
        for member in &record.members {
            if let Member::Field(field) = member {
                if field.is_static {
                    continue;
                }
                let ty = self.resolve_type_in(&field.ty, None)?;
                fields.push((field.name.clone(), ty));
            }
        }
        let info = self.types.layout(&record.name, fields);
        let id = self.types.add(info);
        self.records.insert(joined(path, &record.name), id);
        Ok(())
    }

    fn handle_operator_class(&mut self, record: &'a RecordDecl, path: &[String]) -> UdoResult<()> {
        // Polymorphic classes have no stable layout the host could own
        let is_polymorphic = record.members.iter().any(|m| match m {
            Member::Method(method) => method.is_virtual,
            Member::Destructor(dtor) => dtor.is_virtual,
            _ => false,
        });
        if is_polymorphic {
            return Err(UdoError::invalid_user_code("UDO class must not be polymorphic"));
        }

        // UDOperator must appear exactly once as a public non-virtual base
        let base_err =
            || UdoError::invalid_user_code("UDOperator must be a public, unambiguous, non-virtual base");
        if record.bases.len() != 1 {
            return Err(base_err());
        }
        let base = &record.bases[0];
        if base.is_virtual || base.access != Access::Public {
            return Err(base_err());
        }
        let base_id = self.lookup_record(&base.name, path);
        if base_id != self.udoperator {
            return Err(base_err());
        }

        self.operator_decl = Some(record);

        // Nested records first: tuple types and any helper records
        for member in &record.members {
            if let Member::Record(nested) = member {
                let mut fields = Vec::new();
                for nested_member in &nested.members {
                    if let Member::Field(field) = nested_member {
                        let ty = self.resolve_type_in(&field.ty, Some(record))?;
                        fields.push((field.name.clone(), ty));
                    }
                }
                let info = self.types.layout(&nested.name, fields);
                let id = self.types.add(info);
                self.nested.insert(nested.name.clone(), id);
            }
        }

        if !self.nested.contains_key("InputTuple") {
            return Err(UdoError::invalid_user_code(
                "invalid or missing member type \"InputTuple\" in UDO class",
            ));
        }
        if !self.nested.contains_key("OutputTuple") {
            return Err(UdoError::invalid_user_code(
                "invalid or missing member type \"OutputTuple\" in UDO class",
            ));
        }

        // Now the class's own layout (the empty base contributes nothing)
        let mut fields = Vec::new();
        for member in &record.members {
            if let Member::Field(field) = member {
                if field.is_static {
                    continue;
                }
                let ty = self.resolve_type_in(&field.ty, Some(record))?;
                fields.push((field.name.clone(), ty));
            }
        }
        let info = self.types.layout(&record.name, fields);
        self.operator_fields = info.fields.clone();
        let id = self.types.add(info);
        self.operator_record = Some(id);
        self.records.insert(joined(path, &record.name), id);

        if record
            .members
            .iter()
            .any(|m| matches!(m, Member::Method(method) if method.name == "emit"))
        {
            self.warnings
                .push("UDO class declares a member named emit which shadows the runtime emit".into());
        }

        Ok(())
    }

    // === Type resolution ===

    fn lookup_record(&self, name: &[String], path: &[String]) -> Option<RecordId> {
        // Absolute name first, then relative to the enclosing namespaces
        let absolute = name.join("::");
        if let Some(&id) = self.records.get(&absolute) {
            return Some(id);
        }
        for depth in (1..=path.len()).rev() {
            let mut candidate = path[..depth].join("::");
            candidate.push_str("::");
            candidate.push_str(&absolute);
            if let Some(&id) = self.records.get(&candidate) {
                return Some(id);
            }
        }
        None
    }

    /// Resolve a written type. `class_scope` adds the nested records of the
    /// operator class to the lookup.
    fn resolve_type_in(
        &self,
        ty: &TypeRef,
        class_scope: Option<&RecordDecl>,
    ) -> UdoResult<SemType> {
        match ty {
            TypeRef::Prim(prim) => Ok(prim_to_sem(*prim)),
            TypeRef::Const(inner) => self.resolve_type_in(inner, class_scope),
            TypeRef::Ptr(inner) => Ok(SemType::Ptr(Box::new(
                self.resolve_type_in(inner, class_scope)?,
            ))),
            TypeRef::Ref(_) | TypeRef::RvalueRef(_) => Err(UdoError::invalid_user_code(
                "reference types are only valid as parameters",
            )),
            TypeRef::Dependent { .. } => Err(UdoError::invalid_user_code(
                "dependent types are only valid in the runtime header",
            )),
            TypeRef::Named(name) => {
                // Nested records of the operator class win for unqualified
                // names; they are laid out before the fields that use them.
                if name.len() == 1 {
                    if let Some(&id) = self.nested.get(&name[0]) {
                        return Ok(SemType::Record(id));
                    }
                }
                match self.lookup_record(name, &[]) {
                    Some(id) => Ok(SemType::Record(id)),
                    None => Err(UdoError::invalid_user_code(format!(
                        "unknown type {}",
                        qual_name_to_string(name)
                    ))),
                }
            }
        }
    }

    /// Resolve a parameter type, allowing references
    fn resolve_param(&self, ty: &TypeRef) -> UdoResult<ParamSem> {
        match ty.without_const() {
            TypeRef::Ref(inner) => {
                let sem = self.resolve_type_in(inner.without_const(), None)?;
                Ok(ParamSem::Ref(sem))
            }
            TypeRef::RvalueRef(_) => Err(UdoError::invalid_user_code(
                "rvalue reference parameters are not supported",
            )),
            other => {
                let sem = self.resolve_type_in(other, None)?;
                if Some(&sem) == self.execution_state.map(SemType::Record).as_ref() {
                    Ok(ParamSem::ExecState)
                } else {
                    Ok(ParamSem::Value(sem))
                }
            }
        }
    }

    // === Contracts ===

    fn check_accept(&self, method: &MethodDecl, params: &[ParamSem], ret: &SemType) -> bool {
        let input = self.nested.get("InputTuple").copied();
        !method.is_static
            && *ret == SemType::Void
            && params.len() == 2
            && matches!(params[0], ParamSem::ExecState)
            && matches!(&params[1], ParamSem::Ref(SemType::Record(id)) if Some(*id) == input)
    }

    fn check_extra_work(&self, method: &MethodDecl, params: &[ParamSem], ret: &SemType) -> bool {
        let u32_ty = SemType::Int {
            bits: 32,
            signed: false,
        };
        !method.is_static
            && *ret == u32_ty
            && params.len() == 2
            && matches!(params[0], ParamSem::ExecState)
            && matches!(&params[1], ParamSem::Value(ty) if *ty == u32_ty)
    }

    fn check_process(&self, method: &MethodDecl, params: &[ParamSem], ret: &SemType) -> bool {
        !method.is_static
            && *ret == SemType::Bool
            && params.len() == 1
            && matches!(params[0], ParamSem::ExecState)
    }

    // === Final assembly ===

    fn finish(mut self) -> UdoResult<UdoAnalysis> {
        let record = self.operator_decl.ok_or_else(|| {
            UdoError::invalid_user_code(format!(
                "UDO class {} not found",
                self.class_path.join("::")
            ))
        })?;
        let operator_record = self.operator_record.expect("operator record laid out");
        let execution_state = self.execution_state.expect("runtime header incomplete");

        if !self.has_emit_template {
            return Err(UdoError::compile("runtime header lacks the emit template"));
        }

        // The emit specialization must exist: some body must call
        // emit<Operator>(...). Scan all bodies before lowering.
        let mut uses_emit = false;
        for member in &record.members {
            let body = match member {
                Member::Method(method) => method.body.as_ref(),
                Member::Constructor(ctor) => ctor.body.as_ref(),
                Member::Destructor(dtor) => dtor.body.as_ref(),
                _ => None,
            };
            if let Some(body) = body {
                if block_calls_emit(body, &record.name) {
                    uses_emit = true;
                    break;
                }
            }
        }
        if !uses_emit {
            for func in &self.user_functions {
                if let Some(body) = &func.body {
                    if block_calls_emit(body, &record.name) {
                        uses_emit = true;
                        break;
                    }
                }
            }
        }
        if !uses_emit {
            return Err(UdoError::invalid_user_code(
                "UDO does not call emit() or does not use its class type as template argument",
            ));
        }

        // Lifecycle methods with contract enforcement
        let mut accept_method: Option<FoundMethod> = None;
        let mut extra_work_method: Option<FoundMethod> = None;
        let mut process_method: Option<FoundMethod> = None;
        let mut helper_methods: Vec<FoundMethod> = Vec::new();

        for member in &record.members {
            let Member::Method(method) = member else { continue };
            let mut params = Vec::with_capacity(method.params.len());
            let mut param_error = None;
            for param in &method.params {
                match self.resolve_param(&param.ty) {
                    Ok(sem) => params.push(sem),
                    Err(err) => {
                        param_error = Some(err);
                        break;
                    }
                }
            }
            let ret = match &mut param_error {
                Some(_) => SemType::Void,
                None => self.resolve_return(&method.ret)?,
            };

            let found = FoundMethod {
                decl: method,
                params,
                ret,
            };

            match method.name.as_str() {
                "accept" => {
                    if param_error.is_some() || !self.check_accept(method, &found.params, &found.ret)
                    {
                        return Err(UdoError::invalid_user_code(
                            "invalid signature of accept function, expected signature: \
                             void accept(udo::ExecutionState, const InputTuple&)",
                        ));
                    }
                    accept_method = Some(found);
                }
                "extraWork" => {
                    if param_error.is_some()
                        || !self.check_extra_work(method, &found.params, &found.ret)
                    {
                        return Err(UdoError::invalid_user_code(
                            "invalid signature of extraWork function, expected signature: \
                             uint32_t extraWork(udo::ExecutionState, uint32_t)",
                        ));
                    }
                    extra_work_method = Some(found);
                }
                "process" => {
                    if param_error.is_some()
                        || !self.check_process(method, &found.params, &found.ret)
                    {
                        return Err(UdoError::invalid_user_code(
                            "invalid signature of process function, expected signature: \
                             bool process(udo::ExecutionState)",
                        ));
                    }
                    process_method = Some(found);
                }
                _ => {
                    if let Some(err) = param_error {
                        return Err(err);
                    }
                    if method.body.is_some() {
                        helper_methods.push(found);
                    }
                }
            }
        }

        // Constructor selection: a single non-copy, non-move constructor
        let mut user_ctor: Option<&CtorDecl> = None;
        for member in &record.members {
            let Member::Constructor(ctor) = member else { continue };
            if self.is_copy_or_move_ctor(ctor, record) {
                continue;
            }
            if ctor.is_deleted {
                return Err(UdoError::invalid_user_code(
                    "the UDO constructor must not be deleted",
                ));
            }
            if user_ctor.is_some() {
                return Err(UdoError::invalid_user_code(
                    "Multiple constructors in C++-UDO not implemented yet",
                ));
            }
            user_ctor = Some(ctor);
        }

        let has_field_inits = record.members.iter().any(
            |m| matches!(m, Member::Field(field) if !field.is_static && field.init.is_some()),
        );
        // A defaulted or absent constructor is only materialized when the
        // implicit default constructor is nontrivial
        let needs_implicit_ctor = user_ctor.map_or(has_field_inits, |c| {
            c.is_defaulted && has_field_inits
        });
        let ctor_to_lower =
            user_ctor.filter(|c| !c.is_defaulted && (c.body.is_some() || !c.inits.is_empty()));

        let mut constructor_args = Vec::new();
        if let Some(ctor) = user_ctor {
            for param in &ctor.params {
                match self.resolve_param(&param.ty)? {
                    ParamSem::Value(sem) if sem.is_scalar() || matches!(sem, SemType::Record(_)) => {
                        constructor_args.push(sem)
                    }
                    _ => {
                        return Err(UdoError::invalid_user_code(
                            "UDO constructor parameters must be scalar values",
                        ))
                    }
                }
            }
        }

        // Destructor: only a nontrivial one is materialized
        let user_dtor = record.members.iter().find_map(|m| match m {
            Member::Destructor(dtor) if dtor.body.is_some() => Some(dtor),
            _ => None,
        });

        // === Lowering ===

        let operator_info = self.types.record(operator_record).clone();
        let mut lowerer = lower::ModuleLowerer::new(
            &self.types,
            &self.records,
            &self.nested,
            execution_state,
            operator_record,
            &self.operator_fields,
            &record.name,
        );

        // Globals first so bodies can reference them
        for global in &self.user_globals {
            lowerer.lower_global(global)?;
        }
        // Static data members become module globals
        for member in &record.members {
            if let Member::Field(field) = member {
                if field.is_static {
                    lowerer.lower_static_field(&record.name, field)?;
                }
            }
        }

        // Declare every function before lowering any body
        let emit = lowerer.declare_emit();
        let print_debug = lowerer.declare_print_debug();
        let get_random = lowerer.declare_get_random();

        for func in &self.user_functions {
            let mut params = Vec::new();
            for param in &func.params {
                params.push(self.resolve_param(&param.ty)?);
            }
            let ret = self.resolve_return(&func.ret)?;
            lowerer.declare_free_function(func, params, ret)?;
        }

        let declare_method = |lowerer: &mut lower::ModuleLowerer, m: &FoundMethod<'a>| {
            lowerer.declare_method(m.decl, m.params.clone(), m.ret.clone())
        };
        let accept_id = accept_method
            .as_ref()
            .map(|m| declare_method(&mut lowerer, m));
        let extra_work_id = extra_work_method
            .as_ref()
            .map(|m| declare_method(&mut lowerer, m));
        let process_id = process_method
            .as_ref()
            .map(|m| declare_method(&mut lowerer, m));
        let helper_ids: Vec<ir::FuncId> = helper_methods
            .iter()
            .map(|m| declare_method(&mut lowerer, m))
            .collect();

        let ctor_id = if ctor_to_lower.is_some() || needs_implicit_ctor {
            let params = constructor_args
                .iter()
                .cloned()
                .map(ParamSem::Value)
                .collect();
            Some(lowerer.declare_constructor(&record.name, params))
        } else {
            None
        };
        let dtor_id = user_dtor.map(|_| lowerer.declare_destructor(&record.name));

        // Bodies
        for func in &self.user_functions {
            lowerer.lower_free_function(func)?;
        }
        if let (Some(found), Some(id)) = (&accept_method, accept_id) {
            lowerer.lower_method(found.decl, id)?;
        }
        if let (Some(found), Some(id)) = (&extra_work_method, extra_work_id) {
            lowerer.lower_method(found.decl, id)?;
        }
        if let (Some(found), Some(id)) = (&process_method, process_id) {
            lowerer.lower_method(found.decl, id)?;
        }
        for (found, id) in helper_methods.iter().zip(&helper_ids) {
            lowerer.lower_method(found.decl, *id)?;
        }
        if let Some(id) = ctor_id {
            lowerer.lower_constructor(record, ctor_to_lower, id)?;
        }
        if let (Some(dtor), Some(id)) = (user_dtor, dtor_id) {
            lowerer.lower_destructor(dtor, id)?;
        }

        let module = lowerer.finish();

        // emit reachability from the lifecycle entries
        let emit_in_accept = accept_id.is_some_and(|id| reaches(&module, id, emit));
        let emit_in_process = process_id.is_some_and(|id| reaches(&module, id, emit));

        let output = self
            .types
            .record(self.nested["OutputTuple"])
            .fields
            .iter()
            .map(|f| OutputAttr {
                name: f.name.clone(),
                ty: f.ty.clone(),
            })
            .collect();
        let input = self
            .types
            .record(self.nested["InputTuple"])
            .fields
            .iter()
            .map(|f| OutputAttr {
                name: f.name.clone(),
                ty: f.ty.clone(),
            })
            .collect();

        Ok(UdoAnalysis {
            string_record: self.string_record,
            execution_state,
            operator_record,
            input_tuple: self.nested["InputTuple"],
            output_tuple: self.nested["OutputTuple"],
            output,
            input,
            name: record.name.clone(),
            size: operator_info.size,
            alignment: operator_info.align,
            constructor_args,
            module,
            constructor: ctor_id,
            destructor: dtor_id,
            accept: accept_id,
            extra_work: extra_work_id,
            process: process_id,
            emit,
            print_debug,
            get_random,
            emit_in_accept,
            emit_in_process,
            warnings: self.warnings,
            types: self.types,
        })
    }

    fn resolve_return(&self, ty: &TypeRef) -> UdoResult<SemType> {
        match ty.without_const() {
            TypeRef::Ref(_) | TypeRef::RvalueRef(_) => Err(UdoError::invalid_user_code(
                "reference return types are not supported",
            )),
            other => self.resolve_type_in(other, None),
        }
    }

    fn is_copy_or_move_ctor(&self, ctor: &CtorDecl, record: &RecordDecl) -> bool {
        if ctor.params.len() != 1 {
            return false;
        }
        match ctor.params[0].ty.without_const() {
            TypeRef::Ref(inner) | TypeRef::RvalueRef(inner) => match inner.without_const() {
                TypeRef::Named(name) => name.last().map(String::as_str) == Some(&record.name),
                _ => false,
            },
            _ => false,
        }
    }
}

fn joined(path: &[String], name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}::{}", path.join("::"), name)
    }
}

/// Does any expression in the block instantiate `emit<Class>`?
fn block_calls_emit(block: &Block, class_name: &str) -> bool {
    block.stmts.iter().any(|stmt| stmt_calls_emit(stmt, class_name))
}

fn stmt_calls_emit(stmt: &Stmt, class_name: &str) -> bool {
    match stmt {
        Stmt::Compound(block) => block_calls_emit(block, class_name),
        Stmt::Local { init, .. } => init
            .as_ref()
            .is_some_and(|e| expr_calls_emit(e, class_name)),
        Stmt::Expr(expr) => expr_calls_emit(expr, class_name),
        Stmt::If {
            cond,
            then_branch,
            else_branch,
        } => {
            expr_calls_emit(cond, class_name)
                || stmt_calls_emit(then_branch, class_name)
                || else_branch
                    .as_ref()
                    .is_some_and(|s| stmt_calls_emit(s, class_name))
        }
        Stmt::While { cond, body } => {
            expr_calls_emit(cond, class_name) || stmt_calls_emit(body, class_name)
        }
        Stmt::For {
            init,
            cond,
            step,
            body,
        } => {
            init.as_ref().is_some_and(|s| stmt_calls_emit(s, class_name))
                || cond.as_ref().is_some_and(|e| expr_calls_emit(e, class_name))
                || step.as_ref().is_some_and(|e| expr_calls_emit(e, class_name))
                || stmt_calls_emit(body, class_name)
        }
        Stmt::Return { value, .. } => value
            .as_ref()
            .is_some_and(|e| expr_calls_emit(e, class_name)),
        Stmt::Break(_) | Stmt::Continue(_) => false,
    }
}

fn expr_calls_emit(expr: &Expr, class_name: &str) -> bool {
    match &expr.kind {
        ExprKind::TemplateCall {
            name,
            type_arg,
            args,
        } => {
            let is_emit = name.last().map(String::as_str) == Some("emit");
            let arg_is_class = matches!(
                type_arg.without_const(),
                TypeRef::Named(n) if n.last().map(String::as_str) == Some(class_name)
            );
            (is_emit && arg_is_class) || args.iter().any(|a| expr_calls_emit(a, class_name))
        }
        ExprKind::Unary { operand, .. } => expr_calls_emit(operand, class_name),
        ExprKind::PostIncDec { operand, .. } => expr_calls_emit(operand, class_name),
        ExprKind::Binary { lhs, rhs, .. } | ExprKind::Assign { lhs, rhs, .. } => {
            expr_calls_emit(lhs, class_name) || expr_calls_emit(rhs, class_name)
        }
        ExprKind::Member { base, .. } => expr_calls_emit(base, class_name),
        ExprKind::Index { base, index } => {
            expr_calls_emit(base, class_name) || expr_calls_emit(index, class_name)
        }
        ExprKind::Call { callee, args } => {
            expr_calls_emit(callee, class_name)
                || args.iter().any(|a| expr_calls_emit(a, class_name))
        }
        ExprKind::AggregateInit { args, .. } => {
            args.iter().any(|a| expr_calls_emit(a, class_name))
        }
        ExprKind::Cast { arg, .. } => expr_calls_emit(arg, class_name),
        _ => false,
    }
}

/// Is `target` reachable from `from` over direct calls?
fn reaches(module: &ir::Module, from: ir::FuncId, target: ir::FuncId) -> bool {
    let mut visited = vec![false; module.funcs.len()];
    let mut work = vec![from];
    while let Some(id) = work.pop() {
        if id == target {
            return true;
        }
        if std::mem::replace(&mut visited[id.0 as usize], true) {
            continue;
        }
        let Some(body) = &module.func(id).body else { continue };
        for block in &body.blocks {
            for instr in &block.instrs {
                if let ir::Instr::Call {
                    callee: ir::Callee::Func(callee),
                    ..
                } = instr
                {
                    work.push(*callee);
                }
            }
        }
    }
    false
}

// Re-export for the crate API
pub use types::{DbAttribute, DbType};
