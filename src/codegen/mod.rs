//! Object code emission
//!
//! Translates the preprocessed IR module to Cranelift IR and emits a
//! relocatable ELF object for the host target. The relocation model is PIC
//! so the whole image stays within the 2 GiB region the memory manager
//! reserves; targets other than x86-64 are rejected because the TLS
//! allocator reads the thread pointer through the fs segment.

mod translate;

use cranelift_codegen::ir::{types, AbiParam, Signature as ClifSignature};
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_module::{default_libcall_names, DataDescription, DataId, FuncId, Linkage, Module};
use cranelift_object::{ObjectBuilder, ObjectModule};
use rustc_hash::FxHashMap;
use target_lexicon::Architecture;

use crate::error::{UdoError, UdoResult};
use crate::ir;
use crate::settings::Setting;

#[cfg(debug_assertions)]
const DEFAULT_OPT_LEVEL: u32 = 0;
#[cfg(not(debug_assertions))]
const DEFAULT_OPT_LEVEL: u32 = 3;

static CXX_UDO_OPT_LEVEL: Setting<u32> = Setting::new(
    "cxxUDOOptLevel",
    "The optimization level used for C++ UDOs",
    DEFAULT_OPT_LEVEL,
);

static DUMP_CXX_UDO_OBJECT: Setting<bool> = Setting::new(
    "dumpCxxUDOObject",
    "Dump the object file of the compiled C++ UDO",
    false,
);

/// The optimization level used for UDO compilation
pub fn opt_level() -> u32 {
    CXX_UDO_OPT_LEVEL.get()
}

/// Compile a preprocessed IR module to relocatable object bytes
pub fn compile(ir_module: &ir::Module) -> UdoResult<Vec<u8>> {
    if DUMP_CXX_UDO_OBJECT.get_bool() {
        if let Err(err) = std::fs::write("cxxudo-dump.ir", format!("{:#?}\n", ir_module)) {
            eprintln!("failed to dump UDO module: {}", err);
        }
    }

    let mut flag_builder = settings::builder();
    flag_builder
        .set("is_pic", "true")
        .map_err(|e| UdoError::compile(e.to_string()))?;
    flag_builder
        .set("use_colocated_libcalls", "false")
        .map_err(|e| UdoError::compile(e.to_string()))?;
    let opt = if opt_level() == 0 { "none" } else { "speed" };
    flag_builder
        .set("opt_level", opt)
        .map_err(|e| UdoError::compile(e.to_string()))?;

    let isa_builder = cranelift_native::builder().map_err(|e| UdoError::compile(e.to_string()))?;
    let isa = isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(|e| UdoError::compile(e.to_string()))?;

    if isa.triple().architecture != Architecture::X86_64 {
        return Err(UdoError::compile("C++ UDOs are only supported for x86_64"));
    }

    let builder = ObjectBuilder::new(isa, "cxxudo", default_libcall_names())
        .map_err(|e| UdoError::compile(e.to_string()))?;
    let mut module = ObjectModule::new(builder);

    // Globals
    let mut data_ids: FxHashMap<ir::GlobalId, DataId> = FxHashMap::default();
    for (index, global) in ir_module.globals.iter().enumerate() {
        let id = ir::GlobalId(index as u32);
        let linkage = lower_linkage(global.linkage);
        let writable = !global.is_constant;
        let data_id = module
            .declare_data(&global.name, linkage, writable, false)
            .map_err(|e| UdoError::compile(e.to_string()))?;
        data_ids.insert(id, data_id);

        match &global.init {
            ir::GlobalInit::Import => {}
            ir::GlobalInit::Bytes(bytes) => {
                let mut desc = DataDescription::new();
                desc.define(bytes.clone().into_boxed_slice());
                desc.set_align(global.align);
                module
                    .define_data(data_id, &desc)
                    .map_err(|e| UdoError::compile(e.to_string()))?;
            }
            ir::GlobalInit::Zero(size) => {
                let mut desc = DataDescription::new();
                desc.define_zeroinit(*size as usize);
                desc.set_align(global.align);
                module
                    .define_data(data_id, &desc)
                    .map_err(|e| UdoError::compile(e.to_string()))?;
            }
        }
    }

    // Function declarations, module functions first
    let pointer_type = module.target_config().pointer_type();
    let call_conv = module.target_config().default_call_conv;

    let mut func_ids: FxHashMap<ir::FuncId, FuncId> = FxHashMap::default();
    for (index, func) in ir_module.funcs.iter().enumerate() {
        let id = ir::FuncId(index as u32);
        let sig = lower_signature(&func.sig, pointer_type, call_conv);
        let linkage = if func.body.is_some() {
            lower_linkage(func.linkage)
        } else {
            Linkage::Import
        };
        let func_id = module
            .declare_function(&func.name, linkage, &sig)
            .map_err(|e| UdoError::compile(e.to_string()))?;
        func_ids.insert(id, func_id);
    }

    // External functions referenced by direct calls (libc entry points)
    let mut external_ids: FxHashMap<String, FuncId> = FxHashMap::default();
    for func in &ir_module.funcs {
        let Some(body) = &func.body else { continue };
        for block in &body.blocks {
            for instr in &block.instrs {
                if let ir::Instr::Call {
                    callee: ir::Callee::External { name, sig },
                    ..
                } = instr
                {
                    if external_ids.contains_key(name) {
                        continue;
                    }
                    let clif_sig = lower_signature(sig, pointer_type, call_conv);
                    let func_id = module
                        .declare_function(name, Linkage::Import, &clif_sig)
                        .map_err(|e| UdoError::compile(e.to_string()))?;
                    external_ids.insert(name.clone(), func_id);
                }
            }
        }
    }

    // Bodies
    for (index, func) in ir_module.funcs.iter().enumerate() {
        let id = ir::FuncId(index as u32);
        if func.body.is_none() {
            continue;
        }
        translate::define_function(
            &mut module,
            func,
            func_ids[&id],
            &func_ids,
            &data_ids,
            &external_ids,
        )?;
    }

    let product = module.finish();
    let bytes = product
        .emit()
        .map_err(|e| UdoError::compile(e.to_string()))?;

    if DUMP_CXX_UDO_OBJECT.get_bool() {
        if let Err(err) = std::fs::write("cxxudo-dump.o", &bytes) {
            eprintln!("failed to dump UDO object: {}", err);
        }
    }

    Ok(bytes)
}

fn lower_linkage(linkage: ir::Linkage) -> Linkage {
    match linkage {
        ir::Linkage::Export => Linkage::Export,
        ir::Linkage::Local => Linkage::Local,
        ir::Linkage::Import => Linkage::Import,
    }
}

pub(crate) fn lower_val_type(
    ty: ir::ValType,
    pointer_type: cranelift_codegen::ir::Type,
) -> cranelift_codegen::ir::Type {
    match ty {
        ir::ValType::I8 => types::I8,
        ir::ValType::I16 => types::I16,
        ir::ValType::I32 => types::I32,
        ir::ValType::I64 => types::I64,
        ir::ValType::F32 => types::F32,
        ir::ValType::F64 => types::F64,
        ir::ValType::Ptr => pointer_type,
    }
}

pub(crate) fn lower_signature(
    sig: &ir::Signature,
    pointer_type: cranelift_codegen::ir::Type,
    call_conv: cranelift_codegen::isa::CallConv,
) -> ClifSignature {
    let mut clif = ClifSignature::new(call_conv);
    for &param in &sig.params {
        clif.params
            .push(AbiParam::new(lower_val_type(param, pointer_type)));
    }
    if let Some(ret) = sig.ret {
        clif.returns
            .push(AbiParam::new(lower_val_type(ret, pointer_type)));
    }
    clif
}
