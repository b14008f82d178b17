//! IR preprocessing for compiled UDOs
//!
//! Makes the analyzed module self-sufficient: callback trampolines that
//! indirect through host-bound functor slots, a global constructor that
//! re-initializes mutable globals and bootstraps the private libc, a
//! per-thread initializer, and stable external names for everything the
//! linker and the execution handle need to find again.

use smallvec::smallvec;

use crate::analyzer::UdoAnalysis;
use crate::error::UdoResult;
use crate::ir::{
    self, BodyBuilder, Callee, GlobalInit, Instr, Linkage, Reg, Signature, SymbolRef, Terminator,
    ValType,
};

// Well-known module symbol names. The linker and the execution handle bind
// them; they must survive optimization unchanged.
pub const GLOBAL_CONSTRUCTOR_NAME: &str = "udo.CxxUDO.GlobalConstructor";
pub const GLOBAL_DESTRUCTOR_NAME: &str = "udo.CxxUDO.GlobalDestructor";
pub const THREAD_INIT_NAME: &str = "udo.CxxUDO.ThreadInit";
pub const CONSTRUCTOR_NAME: &str = "udo.CxxUDO.Constructor";
pub const DESTRUCTOR_NAME: &str = "udo.CxxUDO.Destructor";
pub const EMIT_NAME: &str = "udo.CxxUDO.emit";
pub const ACCEPT_NAME: &str = "udo.CxxUDO.accept";
pub const EXTRA_WORK_NAME: &str = "udo.CxxUDO.extraWork";
pub const PROCESS_NAME: &str = "udo.CxxUDO.process";
pub const EMIT_FUNCTOR_NAME: &str = "udo.CxxUDO.emitCallback";
pub const PRINT_DEBUG_FUNCTOR_NAME: &str = "udo.CxxUDO.printDebug";
pub const GET_RANDOM_FUNCTOR_NAME: &str = "udo.CxxUDO.getRandom";

/// The module entities with well-known names after preprocessing
#[derive(Debug, Clone)]
pub struct PreprocessedFunctions {
    pub global_constructor: ir::FuncId,
    pub global_destructor: ir::FuncId,
    pub thread_init: ir::FuncId,
    pub emit: ir::FuncId,
    pub emit_functor: ir::GlobalId,
    pub print_debug_functor: ir::GlobalId,
    pub get_random_functor: ir::GlobalId,
    pub constructor: Option<ir::FuncId>,
    pub destructor: Option<ir::FuncId>,
    pub accept: Option<ir::FuncId>,
    pub extra_work: Option<ir::FuncId>,
    pub process: Option<ir::FuncId>,
}

/// Rewrite the analyzed module into its executable form
pub fn preprocess_module(analysis: &mut UdoAnalysis) -> UdoResult<PreprocessedFunctions> {
    let module = &mut analysis.module;

    // Give the lifecycle functions their stable external names
    let rename = |module: &mut ir::Module, id: Option<ir::FuncId>, name: &str| {
        if let Some(id) = id {
            let func = module.func_mut(id);
            func.name = name.to_string();
            func.linkage = Linkage::Export;
        }
    };
    rename(module, analysis.constructor, CONSTRUCTOR_NAME);
    rename(module, analysis.destructor, DESTRUCTOR_NAME);
    rename(module, analysis.accept, ACCEPT_NAME);
    rename(module, analysis.extra_work, EXTRA_WORK_NAME);
    rename(module, analysis.process, PROCESS_NAME);

    // The functor slots are bound by the linker to storage inside the
    // execution handle, so they are imports here
    let functor_global = |module: &mut ir::Module, name: &str| {
        module.add_global(ir::Global {
            name: name.to_string(),
            align: 8,
            init: GlobalInit::Import,
            is_constant: false,
            linkage: Linkage::Import,
        })
    };
    let emit_functor = functor_global(module, EMIT_FUNCTOR_NAME);
    let print_debug_functor = functor_global(module, PRINT_DEBUG_FUNCTOR_NAME);
    let get_random_functor = functor_global(module, GET_RANDOM_FUNCTOR_NAME);

    // Trampoline bodies: load {function, state} from the slot, then call
    // func(state, ...original arguments)
    build_trampoline(
        module,
        analysis.emit,
        Some(EMIT_NAME),
        emit_functor,
        &[ValType::Ptr, ValType::Ptr, ValType::Ptr],
        None,
    );
    // The runtime entries are only called from within the module, so they
    // keep their internal names and linkage; only their slots are imported.
    build_trampoline(
        module,
        analysis.print_debug,
        None,
        print_debug_functor,
        &[ValType::Ptr, ValType::I64],
        None,
    );
    build_trampoline(
        module,
        analysis.get_random,
        None,
        get_random_functor,
        &[],
        Some(ValType::I64),
    );

    let global_constructor = build_global_constructor(module);
    let global_destructor = build_global_destructor(module);
    let thread_init = build_thread_init(module);

    // Record the expected external symbols in the module metadata so the
    // later stages can work from the object bytes alone
    module.metadata.well_known = vec![
        GLOBAL_CONSTRUCTOR_NAME.to_string(),
        GLOBAL_DESTRUCTOR_NAME.to_string(),
        THREAD_INIT_NAME.to_string(),
        EMIT_NAME.to_string(),
        EMIT_FUNCTOR_NAME.to_string(),
        PRINT_DEBUG_FUNCTOR_NAME.to_string(),
        GET_RANDOM_FUNCTOR_NAME.to_string(),
    ];
    for (id, name) in [
        (analysis.constructor, CONSTRUCTOR_NAME),
        (analysis.destructor, DESTRUCTOR_NAME),
        (analysis.accept, ACCEPT_NAME),
        (analysis.extra_work, EXTRA_WORK_NAME),
        (analysis.process, PROCESS_NAME),
    ] {
        if id.is_some() {
            module.metadata.well_known.push(name.to_string());
        }
    }

    Ok(PreprocessedFunctions {
        global_constructor,
        global_destructor,
        thread_init,
        emit: analysis.emit,
        emit_functor,
        print_debug_functor,
        get_random_functor,
        constructor: analysis.constructor,
        destructor: analysis.destructor,
        accept: analysis.accept,
        extra_work: analysis.extra_work,
        process: analysis.process,
    })
}

/// Replace `func`'s body with an indirect call through the functor slot
fn build_trampoline(
    module: &mut ir::Module,
    func: ir::FuncId,
    export_name: Option<&str>,
    slot: ir::GlobalId,
    arg_types: &[ValType],
    ret: Option<ValType>,
) {
    {
        let f = module.func_mut(func);
        if let Some(name) = export_name {
            f.name = name.to_string();
            f.linkage = Linkage::Export;
        }
        f.no_inline = true;
        debug_assert_eq!(f.sig.params.as_slice(), arg_types);
        debug_assert_eq!(f.sig.ret, ret);
    }

    let mut builder = BodyBuilder::new();
    let params: Vec<Reg> = arg_types.iter().map(|&ty| builder.new_reg(ty)).collect();

    let slot_addr = builder.new_reg(ValType::Ptr);
    builder.push(Instr::SymbolAddr {
        dst: slot_addr,
        symbol: SymbolRef::Global(slot),
    });
    let callback = builder.new_reg(ValType::Ptr);
    builder.push(Instr::Load {
        dst: callback,
        ty: ValType::Ptr,
        addr: slot_addr,
        offset: 0,
    });
    let state = builder.new_reg(ValType::Ptr);
    builder.push(Instr::Load {
        dst: state,
        ty: ValType::Ptr,
        addr: slot_addr,
        offset: 8,
    });

    let mut callback_params = vec![ValType::Ptr];
    callback_params.extend_from_slice(arg_types);
    let mut args = smallvec![state];
    args.extend(params.iter().copied());

    let dst = ret.map(|ty| builder.new_reg(ty));
    builder.push(Instr::CallIndirect {
        dst,
        sig: Signature::new(callback_params, ret),
        callee: callback,
        args,
    });
    builder.terminate(Terminator::Return(dst));

    module.func_mut(func).body = Some(builder.finish());
}

/// The generated global constructor: re-store every mutable global's
/// initializer, run the libc bootstrap, then the module's static
/// initializers in priority order.
fn build_global_constructor(module: &mut ir::Module) -> ir::FuncId {
    // Shadow copies of the mutable globals' initializers, created up front
    // so the loop below does not mutate the arena while iterating
    let mut reinit: Vec<(ir::GlobalId, ir::GlobalId, u64)> = Vec::new();
    let mut zeroed: Vec<(ir::GlobalId, u64)> = Vec::new();
    for index in 0..module.globals.len() {
        let id = ir::GlobalId(index as u32);
        let global = module.global(id);
        if global.is_constant || global.linkage == Linkage::Import {
            continue;
        }
        match &global.init {
            GlobalInit::Bytes(bytes) => {
                let bytes = bytes.clone();
                let size = bytes.len() as u64;
                let align = global.align;
                let shadow_name = format!("{}.init", global.name);
                let shadow = module.add_global(ir::Global {
                    name: shadow_name,
                    align,
                    init: GlobalInit::Bytes(bytes),
                    is_constant: true,
                    linkage: Linkage::Local,
                });
                reinit.push((id, shadow, size));
            }
            GlobalInit::Zero(size) => zeroed.push((id, *size)),
            GlobalInit::Import => {}
        }
    }

    let func = module.add_func(ir::Function {
        name: GLOBAL_CONSTRUCTOR_NAME.to_string(),
        linkage: Linkage::Export,
        sig: Signature::new([ValType::Ptr], None),
        body: None,
        no_inline: true,
    });

    let mut builder = BodyBuilder::new();
    let arg = builder.new_reg(ValType::Ptr);

    for (global, shadow, size) in reinit {
        let dst = builder.new_reg(ValType::Ptr);
        builder.push(Instr::SymbolAddr {
            dst,
            symbol: SymbolRef::Global(global),
        });
        let src = builder.new_reg(ValType::Ptr);
        builder.push(Instr::SymbolAddr {
            dst: src,
            symbol: SymbolRef::Global(shadow),
        });
        let size_reg = builder.new_reg(ValType::I64);
        builder.push(Instr::Iconst {
            dst: size_reg,
            ty: ValType::I64,
            value: size as i64,
        });
        builder.push(Instr::Call {
            dst: None,
            callee: Callee::External {
                name: "memcpy".into(),
                sig: Signature::new([ValType::Ptr, ValType::Ptr, ValType::I64], None),
            },
            args: smallvec![dst, src, size_reg],
        });
    }
    for (global, size) in zeroed {
        if size == 0 {
            continue;
        }
        let dst = builder.new_reg(ValType::Ptr);
        builder.push(Instr::SymbolAddr {
            dst,
            symbol: SymbolRef::Global(global),
        });
        let zero = builder.new_reg(ValType::I32);
        builder.push(Instr::Iconst {
            dst: zero,
            ty: ValType::I32,
            value: 0,
        });
        let size_reg = builder.new_reg(ValType::I64);
        builder.push(Instr::Iconst {
            dst: size_reg,
            ty: ValType::I64,
            value: size as i64,
        });
        builder.push(Instr::Call {
            dst: None,
            callee: Callee::External {
                name: "memset".into(),
                sig: Signature::new([ValType::Ptr, ValType::I32, ValType::I64], None),
            },
            args: smallvec![dst, zero, size_reg],
        });
    }

    // __libc_start_main(nullptr, argc, argv, nullptr, nullptr, nullptr,
    // nullptr) with the hosted main patched out of the private libc. This
    // runs the ifunc resolvers and makes malloc usable.
    let null = builder.new_reg(ValType::Ptr);
    builder.push(Instr::Iconst {
        dst: null,
        ty: ValType::Ptr,
        value: 0,
    });
    let argc = builder.new_reg(ValType::I32);
    builder.push(Instr::Load {
        dst: argc,
        ty: ValType::I32,
        addr: arg,
        offset: 0,
    });
    let argv = builder.new_reg(ValType::Ptr);
    builder.push(Instr::Load {
        dst: argv,
        ty: ValType::Ptr,
        addr: arg,
        offset: 8,
    });
    let start_ret = builder.new_reg(ValType::I32);
    builder.push(Instr::Call {
        dst: Some(start_ret),
        callee: Callee::External {
            name: "__libc_start_main".into(),
            sig: Signature::new(
                [
                    ValType::Ptr,
                    ValType::I32,
                    ValType::Ptr,
                    ValType::Ptr,
                    ValType::Ptr,
                    ValType::Ptr,
                    ValType::Ptr,
                ],
                Some(ValType::I32),
            ),
        },
        args: smallvec![null, argc, argv, null, null, null, null],
    });

    // Static initializers in priority order (stable for equal priorities)
    let mut structors = module.structors.clone();
    structors.sort_by_key(|s| s.priority);
    for structor in structors {
        builder.push(Instr::Call {
            dst: None,
            callee: Callee::Func(structor.func),
            args: smallvec![],
        });
    }

    builder.terminate(Terminator::Return(None));
    module.func_mut(func).body = Some(builder.finish());
    func
}

/// The generated global destructor: static finalizers in reverse order,
/// then the C++ finalize hook against the module-private dso handle.
fn build_global_destructor(module: &mut ir::Module) -> ir::FuncId {
    let has_static_init = !module.structors.is_empty() || !module.destructors.is_empty();

    let dso_handle = has_static_init.then(|| {
        module.add_global(ir::Global {
            name: "__dso_handle".to_string(),
            align: 1,
            init: GlobalInit::Bytes(vec![0]),
            is_constant: true,
            linkage: Linkage::Local,
        })
    });

    let func = module.add_func(ir::Function {
        name: GLOBAL_DESTRUCTOR_NAME.to_string(),
        linkage: Linkage::Export,
        sig: Signature::new([], None),
        body: None,
        no_inline: true,
    });

    let mut builder = BodyBuilder::new();

    let mut destructors = module.destructors.clone();
    destructors.sort_by_key(|s| s.priority);
    for structor in destructors.into_iter().rev() {
        builder.push(Instr::Call {
            dst: None,
            callee: Callee::Func(structor.func),
            args: smallvec![],
        });
    }

    // Anything user code registered through __cxa_atexit runs here
    if let Some(dso_handle) = dso_handle {
        let handle = builder.new_reg(ValType::Ptr);
        builder.push(Instr::SymbolAddr {
            dst: handle,
            symbol: SymbolRef::Global(dso_handle),
        });
        builder.push(Instr::Call {
            dst: None,
            callee: Callee::External {
                name: "__cxa_finalize".into(),
                sig: Signature::new([ValType::Ptr], None),
            },
            args: smallvec![handle],
        });
    }

    builder.terminate(Terminator::Return(None));
    module.func_mut(func).body = Some(builder.finish());
    func
}

/// The per-thread initializer: the libc needs its character tables set up
/// on every thread that runs UDO code.
fn build_thread_init(module: &mut ir::Module) -> ir::FuncId {
    let func = module.add_func(ir::Function {
        name: THREAD_INIT_NAME.to_string(),
        linkage: Linkage::Export,
        sig: Signature::new([], None),
        body: None,
        no_inline: true,
    });

    let mut builder = BodyBuilder::new();
    builder.push(Instr::Call {
        dst: None,
        callee: Callee::External {
            name: "__ctype_init".into(),
            sig: Signature::new([], None),
        },
        args: smallvec![],
    });
    builder.terminate(Terminator::Return(None));
    module.func_mut(func).body = Some(builder.finish());
    func
}
